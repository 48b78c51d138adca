//! Rule → group → proxy flow graphs rebuilt from `(rule, chain)` traffic rows
//!
//! Ranged facts written by older collectors only kept the exit hop of a chain
//! (`"DIRECT"` instead of `"GroupA > GroupB > DIRECT"`). Those rows are mapped
//! back onto the full chains recorded in the cumulative `rule_chain_traffic`
//! baseline before the graph is built. When several full chains share the same
//! exit hop the split is proportional to their all-time traffic, which is an
//! approximation: only the per-rule totals are guaranteed to be preserved.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::Serialize;
use tracing::warn;
use unicode_normalization::UnicodeNormalization;

use crate::model::RuleChainRow;

/// Fold a display label for fuzzy comparison: NFKC, drop any decorative
/// prefix (emoji, flags, punctuation), collapse whitespace, lowercase.
pub fn normalize_label(label: &str) -> String {
    let folded: String = label.nfkc().collect();
    let stripped = folded.trim_start_matches(|c: char| !c.is_alphanumeric());
    stripped
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Hops of a stored chain, in stored (exit-first) order.
pub fn split_chain(chain: &str) -> Vec<&str> {
    chain
        .split('>')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect()
}

fn first_hop(chain: &str) -> &str {
    chain.split('>').next().map(str::trim).unwrap_or("")
}

/// Position of `rule` among `parts`: exact match first, then normalized.
pub fn find_rule_index_in_chain(parts: &[&str], rule: &str) -> Option<usize> {
    if let Some(idx) = parts.iter().position(|part| *part == rule) {
        return Some(idx);
    }
    let wanted = normalize_label(rule);
    if wanted.is_empty() {
        return None;
    }
    parts.iter().position(|part| normalize_label(part) == wanted)
}

/// Path from the rule to the exit proxy for one stored chain.
pub fn build_flow_path(rule: &str, chain: &str) -> Vec<String> {
    let parts = split_chain(chain);
    if let Some(idx) = find_rule_index_in_chain(&parts, rule) {
        return parts[..=idx].iter().rev().map(|p| p.to_string()).collect();
    }

    let reversed: Vec<String> = parts.iter().rev().map(|p| p.to_string()).collect();
    match reversed.first() {
        Some(head) if normalize_label(head) == normalize_label(rule) => reversed,
        _ => std::iter::once(rule.to_string()).chain(reversed).collect(),
    }
}

/// Largest-remainder apportionment of `total` over `weights`.
///
/// Non-positive weights count as zero. When no weight is positive the total
/// is spread evenly, remainder to the first entries. Integer arithmetic only,
/// so the result always sums to `total`.
pub fn allocate_by_weights(total: u64, weights: &[i64]) -> Vec<u64> {
    let n = weights.len();
    if n == 0 {
        return Vec::new();
    }

    let clamped: Vec<u128> = weights.iter().map(|w| (*w).max(0) as u128).collect();
    let sum: u128 = clamped.iter().sum();
    if sum == 0 {
        let base = total / n as u64;
        let extra = (total % n as u64) as usize;
        return (0..n).map(|i| base + u64::from(i < extra)).collect();
    }

    let mut shares = Vec::with_capacity(n);
    let mut remainders = Vec::with_capacity(n);
    for (idx, weight) in clamped.iter().enumerate() {
        let scaled = u128::from(total) * weight;
        shares.push((scaled / sum) as u64);
        remainders.push((scaled % sum, idx));
    }

    let assigned: u64 = shares.iter().sum();
    let leftover = (total - assigned) as usize;
    // Largest remainder first; ties go to the earlier entry
    remainders.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    for (_, idx) in remainders.into_iter().take(leftover) {
        shares[idx] += 1;
    }
    shares
}

/// Map ranged rows that only recorded an exit hop onto the full chains of
/// the cumulative baseline, then merge rows per `(rule, chain)`.
pub fn remap_range_rows_to_full_chains(range_rows: &[RuleChainRow], baseline: &[RuleChainRow]) -> Vec<RuleChainRow> {
    let mut candidates: HashMap<(&str, &str), Vec<&RuleChainRow>> = HashMap::new();
    for row in baseline {
        let parts = split_chain(&row.chain);
        if find_rule_index_in_chain(&parts, &row.rule).is_none() {
            continue;
        }
        let entry = candidates.entry((row.rule.as_str(), first_hop(&row.chain))).or_default();
        if !entry.iter().any(|c| c.chain == row.chain) {
            entry.push(row);
        }
    }

    let mut merged: BTreeMap<(String, String), RuleChainRow> = BTreeMap::new();
    let mut add = |row: RuleChainRow| {
        let entry = merged
            .entry((row.rule.clone(), row.chain.clone()))
            .or_insert_with(|| RuleChainRow::new(&row.rule, &row.chain, 0, 0, 0));
        entry.upload += row.upload;
        entry.download += row.download;
        entry.connections += row.connections;
    };

    for row in range_rows {
        let parts = split_chain(&row.chain);
        if find_rule_index_in_chain(&parts, &row.rule).is_some() {
            add(row.clone());
            continue;
        }

        match candidates.get(&(row.rule.as_str(), first_hop(&row.chain))).map(Vec::as_slice) {
            None | Some([]) => add(row.clone()),
            Some([only]) => add(RuleChainRow {
                chain: only.chain.clone(),
                ..row.clone()
            }),
            Some(many) => {
                let weights: Vec<i64> = many
                    .iter()
                    .map(|c| {
                        let weight = if c.traffic() > 0 { c.traffic() } else { c.connections.max(1) };
                        i64::try_from(weight).unwrap_or(i64::MAX)
                    })
                    .collect();
                let uploads = allocate_by_weights(row.upload, &weights);
                let downloads = allocate_by_weights(row.download, &weights);
                let connections = allocate_by_weights(row.connections, &weights);
                for (idx, candidate) in many.iter().enumerate() {
                    add(RuleChainRow::new(
                        &row.rule,
                        &candidate.chain,
                        uploads[idx],
                        downloads[idx],
                        connections[idx],
                    ));
                }
            }
        }
    }

    merged.into_values().collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Rule,
    Group,
    Proxy,
}

impl NodeType {
    fn rank(self) -> u8 {
        match self {
            NodeType::Rule => 0,
            NodeType::Group => 1,
            NodeType::Proxy => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowNode {
    pub name: String,
    pub layer: usize,
    pub node_type: NodeType,
    pub total_upload: u64,
    pub total_download: u64,
    pub total_connections: u64,
    pub rules: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowLink {
    pub source: usize,
    pub target: usize,
    pub rules: BTreeSet<String>,
}

/// Indices of the nodes and links one rule's traffic flows through.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RulePath {
    pub node_indices: Vec<usize>,
    pub link_indices: Vec<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainFlowGraph {
    pub nodes: Vec<FlowNode>,
    pub links: Vec<FlowLink>,
    pub rule_paths: BTreeMap<String, RulePath>,
    pub max_layer: usize,
}

/// Arena used while the graph is assembled; nodes are addressed by index.
#[derive(Default)]
struct GraphBuilder {
    nodes: Vec<FlowNode>,
    by_name: HashMap<String, usize>,
    links: Vec<FlowLink>,
    by_edge: HashMap<(usize, usize), usize>,
    outgoing: Vec<Vec<usize>>,
    paths: BTreeMap<String, (BTreeSet<usize>, BTreeSet<usize>)>,
}

impl GraphBuilder {
    fn node(&mut self, name: &str) -> usize {
        if let Some(idx) = self.by_name.get(name) {
            return *idx;
        }
        let idx = self.nodes.len();
        self.nodes.push(FlowNode {
            name: name.to_string(),
            layer: 0,
            node_type: NodeType::Group,
            total_upload: 0,
            total_download: 0,
            total_connections: 0,
            rules: BTreeSet::new(),
        });
        self.outgoing.push(Vec::new());
        self.by_name.insert(name.to_string(), idx);
        idx
    }

    fn reaches(&self, from: usize, to: usize) -> bool {
        let mut stack = vec![from];
        let mut seen = vec![false; self.nodes.len()];
        while let Some(idx) = stack.pop() {
            if idx == to {
                return true;
            }
            if std::mem::replace(&mut seen[idx], true) {
                continue;
            }
            stack.extend(self.outgoing[idx].iter().copied());
        }
        false
    }

    fn add_row(&mut self, row: &RuleChainRow) {
        let path = build_flow_path(&row.rule, &row.chain);
        let sequence: Vec<usize> = path.iter().map(|name| self.node(name)).collect();
        let mut visited: Vec<usize> = Vec::with_capacity(path.len());
        for (layer, &idx) in sequence.iter().enumerate() {
            if visited.contains(&idx) {
                continue;
            }
            visited.push(idx);
            let node = &mut self.nodes[idx];
            node.layer = node.layer.max(layer);
            node.total_upload += row.upload;
            node.total_download += row.download;
            node.total_connections += row.connections;
            node.rules.insert(row.rule.clone());
        }

        let mut link_indices = BTreeSet::new();
        // Edges follow the hops as stored; repeats only stop double counting
        for pair in sequence.windows(2) {
            let (source, target) = (pair[0], pair[1]);
            if source == target {
                continue;
            }
            let existing = self.by_edge.get(&(source, target)).copied();
            let link = match existing {
                Some(link) => link,
                None if self.reaches(target, source) => {
                    warn!(
                        rule = %row.rule,
                        source = %self.nodes[source].name,
                        target = %self.nodes[target].name,
                        "Dropping chain edge that would close a cycle"
                    );
                    continue;
                }
                None => {
                    let link = self.links.len();
                    self.links.push(FlowLink {
                        source,
                        target,
                        rules: BTreeSet::new(),
                    });
                    self.by_edge.insert((source, target), link);
                    self.outgoing[source].push(target);
                    link
                }
            };
            self.links[link].rules.insert(row.rule.clone());
            link_indices.insert(link);
        }

        let entry = self.paths.entry(row.rule.clone()).or_default();
        entry.0.extend(visited);
        entry.1.extend(link_indices);
    }

    fn finish(mut self) -> ChainFlowGraph {
        let mut in_degree = vec![0usize; self.nodes.len()];
        for link in &self.links {
            in_degree[link.target] += 1;
        }
        let max_layer = self.nodes.iter().map(|n| n.layer).max().unwrap_or(0);
        for (idx, node) in self.nodes.iter_mut().enumerate() {
            if in_degree[idx] == 0 {
                node.node_type = NodeType::Rule;
                node.layer = 0;
            } else if self.outgoing[idx].is_empty() {
                node.node_type = NodeType::Proxy;
                node.layer = max_layer;
            } else {
                node.node_type = NodeType::Group;
            }
        }

        let mut order: Vec<usize> = (0..self.nodes.len()).collect();
        order.sort_by(|a, b| {
            let (a, b) = (&self.nodes[*a], &self.nodes[*b]);
            (a.layer, a.node_type.rank(), &a.name).cmp(&(b.layer, b.node_type.rank(), &b.name))
        });
        let mut node_map = vec![0usize; self.nodes.len()];
        for (new, old) in order.iter().enumerate() {
            node_map[*old] = new;
        }

        let mut link_order: Vec<usize> = (0..self.links.len()).collect();
        link_order.sort_by_key(|idx| {
            let link = &self.links[*idx];
            (node_map[link.source], node_map[link.target])
        });
        let mut link_map = vec![0usize; self.links.len()];
        for (new, old) in link_order.iter().enumerate() {
            link_map[*old] = new;
        }

        let mut old_nodes: Vec<Option<FlowNode>> = self.nodes.into_iter().map(Some).collect();
        let nodes = order.iter().filter_map(|old| old_nodes[*old].take()).collect();

        let mut old_links: Vec<Option<FlowLink>> = self.links.into_iter().map(Some).collect();
        let links = link_order
            .iter()
            .filter_map(|old| old_links[*old].take())
            .map(|link| FlowLink {
                source: node_map[link.source],
                target: node_map[link.target],
                rules: link.rules,
            })
            .collect();

        let rule_paths = self
            .paths
            .into_iter()
            .map(|(rule, (node_set, link_set))| {
                let mut node_indices: Vec<usize> = node_set.into_iter().map(|i| node_map[i]).collect();
                node_indices.sort_unstable();
                let mut link_indices: Vec<usize> = link_set.into_iter().map(|i| link_map[i]).collect();
                link_indices.sort_unstable();
                (
                    rule,
                    RulePath {
                        node_indices,
                        link_indices,
                    },
                )
            })
            .collect();

        ChainFlowGraph {
            nodes,
            links,
            rule_paths,
            max_layer,
        }
    }
}

impl ChainFlowGraph {
    /// Build the merged DAG. Rows are processed in `(rule, chain)` order so the
    /// output does not depend on the order they were read in.
    pub fn build(rows: &[RuleChainRow]) -> Self {
        let mut sorted: Vec<&RuleChainRow> = rows.iter().filter(|r| !r.rule.is_empty()).collect();
        sorted.sort_by(|a, b| (&a.rule, &a.chain).cmp(&(&b.rule, &b.chain)));

        let mut builder = GraphBuilder::default();
        for row in sorted {
            builder.add_row(row);
        }
        builder.finish()
    }
}

/// Rows a flow graph is built from: the baseline alone, or ranged rows
/// remapped onto it.
pub fn flow_rows(range_rows: Option<&[RuleChainRow]>, baseline: &[RuleChainRow]) -> Vec<RuleChainRow> {
    match range_rows {
        Some(rows) => remap_range_rows_to_full_chains(rows, baseline),
        None => baseline.to_vec(),
    }
}
