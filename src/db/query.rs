//! Range resolution and the query objects shared by cumulative and ranged reads
//!
//! Each logical read is one [`DimensionQuery`] whose [`QuerySource`] decides
//! whether it scans a cumulative table or a bucket table. Both variants
//! project the same columns (`k, upload, download, connections, last_seen,
//! set_a, set_b, extra`) so the row mapping is shared.

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite};

use crate::aggregate::{format_hour, format_minute, truncate_to_hour};

/// Ranges wider than this read the hourly rollup.
pub const HOURLY_THRESHOLD: Duration = Duration::hours(6);

pub const DEFAULT_LIMIT: u32 = 50;
pub const MAX_LIMIT: u32 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    pub fn width(&self) -> Duration {
        self.end - self.start
    }

    /// Inclusive bucket bounds in the table's own bucket format.
    pub fn bucket_bounds(&self, table: FactTable) -> (String, String) {
        match table {
            FactTable::Minute => (format_minute(&self.start), format_minute(&self.end)),
            FactTable::Hourly => (
                format_hour(&truncate_to_hour(&self.start)),
                format_hour(&truncate_to_hour(&self.end)),
            ),
        }
    }
}

/// Parse `start`/`end` into a range. Anything missing, unparsable or
/// inverted yields `None` and the caller reads cumulative tables instead.
pub fn resolve_range(start: Option<&str>, end: Option<&str>) -> Option<TimeRange> {
    let start = parse_instant(start?)?;
    let end = parse_instant(end?)?;
    TimeRange::new(start, end)
}

fn parse_instant(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    raw.parse::<i64>()
        .ok()
        .and_then(DateTime::from_timestamp_millis)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FactTable {
    Minute,
    Hourly,
}

impl FactTable {
    pub fn dim_table(self) -> &'static str {
        match self {
            FactTable::Minute => "minute_dim_stats",
            FactTable::Hourly => "hourly_dim_stats",
        }
    }

    pub fn overall_table(self) -> &'static str {
        match self {
            FactTable::Minute => "minute_stats",
            FactTable::Hourly => "hourly_stats",
        }
    }

    pub fn country_table(self) -> &'static str {
        match self {
            FactTable::Minute => "minute_country_stats",
            FactTable::Hourly => "hourly_country_stats",
        }
    }
}

pub fn resolve_fact_table(range: &TimeRange) -> FactTable {
    if range.width() > HOURLY_THRESHOLD {
        FactTable::Hourly
    } else {
        FactTable::Minute
    }
}

/// Where a read gets its rows from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuerySource {
    Cumulative,
    /// Bucket facts; `range: None` scans every retained bucket.
    Ranged {
        table: FactTable,
        range: Option<TimeRange>,
    },
}

impl QuerySource {
    pub fn for_range(range: Option<TimeRange>) -> Self {
        match range {
            Some(range) => QuerySource::Ranged {
                table: resolve_fact_table(&range),
                range: Some(range),
            },
            None => QuerySource::Cumulative,
        }
    }

    pub fn all_time_facts() -> Self {
        QuerySource::Ranged {
            table: FactTable::Minute,
            range: None,
        }
    }
}

/// Drill-down filters for ranged reads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RangeFilter {
    #[serde(rename = "sourceIP")]
    pub source_ip: Option<String>,
    /// Proxy node: matches the chain itself and every chain it heads
    pub chain: Option<String>,
}

impl RangeFilter {
    pub fn is_empty(&self) -> bool {
        self.source_ip().is_none() && self.chain().is_none()
    }

    pub fn source_ip(&self) -> Option<&str> {
        self.source_ip.as_deref().filter(|s| !s.is_empty())
    }

    pub fn chain(&self) -> Option<&str> {
        self.chain.as_deref().filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ListOptions {
    pub offset: u32,
    pub limit: Option<u32>,
    pub search: Option<String>,
    pub sort_by: Option<String>,
    /// Ascending order when set; traffic-descending otherwise
    pub ascending: bool,
}

impl ListOptions {
    pub fn with_limit(limit: u32) -> Self {
        Self {
            limit: Some(limit),
            ..Default::default()
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }

    pub(crate) fn search(&self) -> Option<&str> {
        self.search.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }

    /// Whitelisted sort expression over the projected aliases.
    pub(crate) fn order_by(&self) -> String {
        let column = match self.sort_by.as_deref() {
            Some("totalUpload") => "upload",
            Some("totalDownload") => "download",
            Some("totalConnections") => "connections",
            Some("lastSeen") => "last_seen",
            Some("key") => "k",
            _ => "(upload + download)",
        };
        let direction = if self.ascending { "ASC" } else { "DESC" };
        format!(" ORDER BY {column} {direction}, k ASC")
    }
}

/// The row dimension a list read groups by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Dimension {
    Domain,
    Ip,
    Proxy,
    Rule,
    Device,
}

impl Dimension {
    pub(crate) fn fact_column(self) -> &'static str {
        match self {
            Dimension::Domain => "domain",
            Dimension::Ip => "ip",
            Dimension::Proxy => "chain",
            Dimension::Rule => "rule",
            Dimension::Device => "source_ip",
        }
    }

    /// Ranged projection of the two set columns and the extra label. Labels
    /// are escaped the same way `StringSet::encode` escapes them.
    fn fact_extras(self) -> [&'static str; 3] {
        match self {
            Dimension::Domain => [
                r"GROUP_CONCAT(DISTINCT REPLACE(REPLACE(ip, '\', '\\'), ',', '\,'))",
                r"GROUP_CONCAT(DISTINCT REPLACE(REPLACE(rule, '\', '\\'), ',', '\,'))",
                r"GROUP_CONCAT(DISTINCT REPLACE(REPLACE(chain, '\', '\\'), ',', '\,'))",
            ],
            Dimension::Ip => [
                r"GROUP_CONCAT(DISTINCT REPLACE(REPLACE(domain, '\', '\\'), ',', '\,'))",
                r"GROUP_CONCAT(DISTINCT REPLACE(REPLACE(chain, '\', '\\'), ',', '\,'))",
                "''",
            ],
            Dimension::Rule => ["''", "''", FIRST_HOP_MAX],
            Dimension::Proxy | Dimension::Device => ["''", "''", "''"],
        }
    }
}

/// Exit hop of a stored chain (`A > B > R` → `A`).
const FIRST_HOP_MAX: &str =
    "MAX(CASE WHEN instr(chain, ' > ') > 0 THEN substr(chain, 1, instr(chain, ' > ') - 1) ELSE chain END)";

/// Drill-down scope: the "X" of "domains for X".
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Scope {
    All,
    Rule(String),
    Proxy(String),
    Device(String),
}

/// Cumulative table answering a `(dimension, scope)` pair.
struct CumulativeTable {
    table: &'static str,
    key: &'static str,
    /// `set_a`, `set_b`, `extra` projections
    extras: [&'static str; 3],
    scope_column: Option<&'static str>,
    scope_is_chain: bool,
}

fn cumulative_table(dimension: Dimension, scope: &Scope) -> Option<CumulativeTable> {
    let plain = |table, key| CumulativeTable {
        table,
        key,
        extras: ["''", "''", "''"],
        scope_column: None,
        scope_is_chain: false,
    };
    let scoped = |table, key, column, is_chain| CumulativeTable {
        table,
        key,
        extras: ["''", "''", "''"],
        scope_column: Some(column),
        scope_is_chain: is_chain,
    };
    Some(match (dimension, scope) {
        (Dimension::Domain, Scope::All) => CumulativeTable {
            extras: ["MAX(ips)", "MAX(rules)", "MAX(chains)"],
            ..plain("domain_stats", "domain")
        },
        (Dimension::Ip, Scope::All) => CumulativeTable {
            extras: ["MAX(domains)", "MAX(chains)", "''"],
            ..plain("ip_stats", "ip")
        },
        (Dimension::Proxy, Scope::All) => plain("proxy_stats", "chain"),
        (Dimension::Rule, Scope::All) => CumulativeTable {
            extras: ["''", "''", "MAX(final_proxy)"],
            ..plain("rule_stats", "rule")
        },
        (Dimension::Device, Scope::All) => plain("device_stats", "source_ip"),
        (Dimension::Domain, Scope::Rule(_)) => scoped("rule_domain_traffic", "domain", "rule", false),
        (Dimension::Ip, Scope::Rule(_)) => scoped("rule_ip_traffic", "ip", "rule", false),
        (Dimension::Proxy, Scope::Rule(_)) => scoped("rule_chain_traffic", "chain", "rule", false),
        (Dimension::Domain, Scope::Proxy(_)) => scoped("domain_proxy_stats", "domain", "chain", true),
        (Dimension::Ip, Scope::Proxy(_)) => CumulativeTable {
            extras: ["MAX(domains)", "''", "''"],
            ..scoped("ip_proxy_stats", "ip", "chain", true)
        },
        (Dimension::Domain, Scope::Device(_)) => {
            scoped("device_domain_stats", "domain", "source_ip", false)
        }
        (Dimension::Ip, Scope::Device(_)) => scoped("device_ip_stats", "ip", "source_ip", false),
        _ => return None,
    })
}

/// One logical list read, renderable against either source.
#[derive(Debug, Clone)]
pub struct DimensionQuery {
    pub dimension: Dimension,
    pub scope: Scope,
    pub source: QuerySource,
    pub filter: RangeFilter,
}

impl DimensionQuery {
    /// Route a request to a concrete source. A cumulative read with filters
    /// is answered by the matching cross-reference table when one exists;
    /// otherwise it falls back to the all-time minute facts.
    pub fn plan(dimension: Dimension, scope: Scope, range: Option<TimeRange>, filter: &RangeFilter) -> Self {
        let source = QuerySource::for_range(range);
        if source != QuerySource::Cumulative || filter.is_empty() {
            return Self {
                dimension,
                scope,
                source,
                filter: filter.clone(),
            };
        }

        let folded = match (&scope, filter.source_ip(), filter.chain()) {
            (Scope::All, Some(device), None) => Some(Scope::Device(device.to_string())),
            (Scope::All, None, Some(chain)) => Some(Scope::Proxy(chain.to_string())),
            _ => None,
        };
        match folded {
            Some(scope) if cumulative_table(dimension, &scope).is_some() => Self {
                dimension,
                scope,
                source,
                filter: RangeFilter::default(),
            },
            _ => Self {
                dimension,
                scope,
                source: QuerySource::all_time_facts(),
                filter: filter.clone(),
            },
        }
    }

    /// Cumulative reads with no backing table are served from facts.
    fn effective_source(&self) -> QuerySource {
        match self.source {
            QuerySource::Cumulative if cumulative_table(self.dimension, &self.scope).is_none() => {
                QuerySource::all_time_facts()
            }
            other => other,
        }
    }

    /// Shared `FROM … WHERE … GROUP BY` body, without projection.
    fn push_body(&self, qb: &mut QueryBuilder<'static, Sqlite>, backend_id: i64, search: Option<&str>) {
        match self.effective_source() {
            QuerySource::Cumulative => {
                // effective_source guarantees a table
                let Some(table) = cumulative_table(self.dimension, &self.scope) else {
                    return;
                };
                qb.push(format!(" FROM {} WHERE backend_id = ", table.table));
                qb.push_bind(backend_id);
                if let (Some(column), Some(value)) = (table.scope_column, scope_value(&self.scope)) {
                    if table.scope_is_chain {
                        push_chain_prefix(qb, column, value);
                    } else {
                        qb.push(format!(" AND {column} = "));
                        qb.push_bind(value.to_string());
                    }
                }
                if let Some(search) = search {
                    push_search(qb, table.key, search);
                }
                qb.push(format!(" GROUP BY {}", table.key));
            }
            QuerySource::Ranged { table, range } => {
                let key = self.dimension.fact_column();
                qb.push(format!(" FROM {} WHERE backend_id = ", table.dim_table()));
                qb.push_bind(backend_id);
                push_bucket_range(qb, table, range.as_ref());
                qb.push(format!(" AND {key} != ''"));
                match &self.scope {
                    Scope::All => {}
                    Scope::Rule(rule) => {
                        qb.push(" AND rule = ");
                        qb.push_bind(rule.clone());
                    }
                    Scope::Proxy(chain) => push_chain_prefix(qb, "chain", chain),
                    Scope::Device(device) => {
                        qb.push(" AND source_ip = ");
                        qb.push_bind(device.clone());
                    }
                }
                push_filter(qb, &self.filter);
                if let Some(search) = search {
                    push_search(qb, key, search);
                }
                qb.push(format!(" GROUP BY {key}"));
            }
        }
    }

    pub fn list_query(&self, backend_id: i64, options: &ListOptions) -> QueryBuilder<'static, Sqlite> {
        let mut qb = QueryBuilder::new("SELECT ");
        match self.effective_source() {
            QuerySource::Cumulative => {
                let extras = cumulative_table(self.dimension, &self.scope)
                    .map(|t| (t.key, t.extras))
                    .unwrap_or(("''", ["''", "''", "''"]));
                qb.push(format!(
                    "{} AS k, SUM(total_upload) AS upload, SUM(total_download) AS download, \
                     SUM(total_connections) AS connections, MAX(last_seen) AS last_seen, \
                     COALESCE({}, '') AS set_a, COALESCE({}, '') AS set_b, COALESCE({}, '') AS extra",
                    extras.0, extras.1[0], extras.1[1], extras.1[2]
                ));
            }
            QuerySource::Ranged { .. } => {
                let extras = self.dimension.fact_extras();
                qb.push(format!(
                    "{} AS k, SUM(upload) AS upload, SUM(download) AS download, \
                     SUM(connections) AS connections, {LAST_SEEN_FROM_BUCKET} AS last_seen, \
                     COALESCE({}, '') AS set_a, COALESCE({}, '') AS set_b, COALESCE({}, '') AS extra",
                    self.dimension.fact_column(),
                    extras[0],
                    extras[1],
                    extras[2]
                ));
            }
        }
        self.push_body(&mut qb, backend_id, options.search());
        qb.push(options.order_by());
        qb.push(" LIMIT ");
        qb.push_bind(i64::from(options.limit()));
        qb.push(" OFFSET ");
        qb.push_bind(i64::from(options.offset));
        qb
    }

    pub fn count_query(&self, backend_id: i64, options: &ListOptions) -> QueryBuilder<'static, Sqlite> {
        let key = match self.effective_source() {
            QuerySource::Cumulative => cumulative_table(self.dimension, &self.scope)
                .map(|t| t.key)
                .unwrap_or("''"),
            QuerySource::Ranged { .. } => self.dimension.fact_column(),
        };
        let mut qb = QueryBuilder::new(format!("SELECT COUNT(*) FROM (SELECT {key}"));
        self.push_body(&mut qb, backend_id, options.search());
        qb.push(")");
        qb
    }
}

/// Bucket text → epoch milliseconds, so ranged and cumulative rows share a type.
pub(crate) const LAST_SEEN_FROM_BUCKET: &str = "CAST(strftime('%s', MAX(bucket)) AS INTEGER) * 1000";

fn scope_value(scope: &Scope) -> Option<&str> {
    match scope {
        Scope::All => None,
        Scope::Rule(v) | Scope::Proxy(v) | Scope::Device(v) => Some(v.as_str()),
    }
}

pub(crate) fn push_bucket_range(qb: &mut QueryBuilder<'static, Sqlite>, table: FactTable, range: Option<&TimeRange>) {
    if let Some(range) = range {
        let (start, end) = range.bucket_bounds(table);
        qb.push(" AND bucket >= ");
        qb.push_bind(start);
        qb.push(" AND bucket <= ");
        qb.push_bind(end);
    }
}

/// `chain = X OR chain LIKE 'X > %'`, with LIKE metacharacters escaped.
pub(crate) fn push_chain_prefix(qb: &mut QueryBuilder<'static, Sqlite>, column: &str, chain: &str) {
    qb.push(format!(" AND ({column} = "));
    qb.push_bind(chain.to_string());
    qb.push(format!(" OR {column} LIKE "));
    qb.push_bind(format!("{} > %", escape_like(chain)));
    qb.push(" ESCAPE '\\')");
}

pub(crate) fn push_filter(qb: &mut QueryBuilder<'static, Sqlite>, filter: &RangeFilter) {
    if let Some(source_ip) = filter.source_ip() {
        qb.push(" AND source_ip = ");
        qb.push_bind(source_ip.to_string());
    }
    if let Some(chain) = filter.chain() {
        push_chain_prefix(qb, "chain", chain);
    }
}

pub(crate) fn push_search(qb: &mut QueryBuilder<'static, Sqlite>, column: &str, search: &str) {
    qb.push(format!(" AND instr(lower({column}), "));
    qb.push_bind(search.to_lowercase());
    qb.push(") > 0");
}

fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_resolve_range_rejects_missing_and_inverted() {
        assert!(resolve_range(None, Some("2024-01-01T00:00:00Z")).is_none());
        assert!(resolve_range(Some("yesterday"), Some("2024-01-01T00:00:00Z")).is_none());
        assert!(resolve_range(Some("2024-01-02T00:00:00Z"), Some("2024-01-01T00:00:00Z")).is_none());

        let range = resolve_range(Some("2024-01-01T00:00:00Z"), Some("2024-01-01T06:00")).unwrap();
        assert_eq!(range.width(), Duration::hours(6));
        assert!(resolve_range(Some("1704067200000"), Some("1704067260000")).is_some());
    }

    #[test]
    fn test_fact_table_switches_after_six_hours() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let six = TimeRange::new(start, start + Duration::hours(6)).unwrap();
        let wider = TimeRange::new(start, start + Duration::hours(6) + Duration::minutes(1)).unwrap();
        assert_eq!(resolve_fact_table(&six), FactTable::Minute);
        assert_eq!(resolve_fact_table(&wider), FactTable::Hourly);
    }

    #[test]
    fn test_hourly_bounds_truncate_to_hour() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 3, 45, 10).unwrap();
        let range = TimeRange::new(start, start + Duration::hours(10)).unwrap();
        assert_eq!(
            range.bucket_bounds(FactTable::Hourly),
            ("2024-01-01T03:00:00".to_string(), "2024-01-01T13:00:00".to_string())
        );
        assert_eq!(range.bucket_bounds(FactTable::Minute).0, "2024-01-01T03:45:00");
    }

    #[test]
    fn test_limit_is_capped_and_sort_whitelisted() {
        let mut options = ListOptions::with_limit(5000);
        assert_eq!(options.limit(), MAX_LIMIT);
        options.sort_by = Some("total_upload; DROP TABLE x".into());
        assert_eq!(options.order_by(), " ORDER BY (upload + download) DESC, k ASC");
        options.sort_by = Some("lastSeen".into());
        options.ascending = true;
        assert_eq!(options.order_by(), " ORDER BY last_seen ASC, k ASC");
    }

    #[test]
    fn test_plan_folds_single_filter_into_cross_reference() {
        let filter = RangeFilter {
            source_ip: Some("10.0.0.2".into()),
            chain: None,
        };
        let plan = DimensionQuery::plan(Dimension::Domain, Scope::All, None, &filter);
        assert_eq!(plan.scope, Scope::Device("10.0.0.2".into()));
        assert_eq!(plan.source, QuerySource::Cumulative);

        let both = RangeFilter {
            source_ip: Some("10.0.0.2".into()),
            chain: Some("ProxyA".into()),
        };
        let plan = DimensionQuery::plan(Dimension::Domain, Scope::All, None, &both);
        assert_eq!(plan.source, QuerySource::all_time_facts());
    }

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("50%_off\\"), "50\\%\\_off\\\\");
    }
}
