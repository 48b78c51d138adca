//! In-memory pre-aggregation of traffic deltas
//!
//! A flush collapses N updates into at most N distinct keys per table before
//! anything touches SQLite. Every merge here is commutative: applying the same
//! deltas in any order yields the same totals and the same `last_seen`.

use std::collections::HashMap;

use chrono::{DateTime, Timelike, Utc};

use crate::model::{CountryUpdate, TrafficUpdate};

/// Maximum encoded length of a stored string-set column.
///
/// Bounded-capacity policy: once a value no longer fits, it is dropped
/// instead of appended, so a hot domain cannot grow its row without limit.
pub const STRING_SET_CAP: usize = 4000;

pub const SET_DELIMITER: char = ',';
/// Precedes a literal delimiter or escape inside an encoded set value.
pub const SET_ESCAPE: char = '\\';

fn escaped_len(value: &str) -> usize {
    value.len() + value.matches([SET_DELIMITER, SET_ESCAPE]).count()
}

fn push_escaped(out: &mut String, value: &str) {
    for c in value.chars() {
        if c == SET_DELIMITER || c == SET_ESCAPE {
            out.push(SET_ESCAPE);
        }
        out.push(c);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counter {
    pub upload: u64,
    pub download: u64,
    pub connections: u64,
    pub last_seen_ms: i64,
}

impl Counter {
    pub fn observe(&mut self, upload: u64, download: u64, timestamp_ms: i64) {
        self.upload = self.upload.saturating_add(upload);
        self.download = self.download.saturating_add(download);
        self.connections = self.connections.saturating_add(1);
        self.last_seen_ms = self.last_seen_ms.max(timestamp_ms);
    }

    pub fn merge(&mut self, other: &Counter) {
        self.upload = self.upload.saturating_add(other.upload);
        self.download = self.download.saturating_add(other.download);
        self.connections = self.connections.saturating_add(other.connections);
        self.last_seen_ms = self.last_seen_ms.max(other.last_seen_ms);
    }
}

/// Deduplicated, insertion-ordered, length-capped set of labels.
///
/// Encoded as a `,`-delimited string in dimension rows; `,` and `\` inside a
/// value are escaped with `\`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StringSet {
    values: Vec<String>,
    encoded_len: usize,
}

impl StringSet {
    pub fn parse(encoded: &str) -> Self {
        let mut set = Self::default();
        for value in split_set(encoded) {
            set.insert(&value);
        }
        set
    }

    /// Returns false when the value was empty, already present, or over the cap.
    pub fn insert(&mut self, value: &str) -> bool {
        if value.is_empty() || self.contains(value) {
            return false;
        }
        let added = if self.values.is_empty() {
            escaped_len(value)
        } else {
            escaped_len(value) + 1
        };
        if self.encoded_len + added > STRING_SET_CAP {
            return false;
        }
        self.encoded_len += added;
        self.values.push(value.to_string());
        true
    }

    pub fn union(&mut self, other: &StringSet) {
        for value in &other.values {
            self.insert(value);
        }
    }

    pub fn contains(&self, value: &str) -> bool {
        self.values.iter().any(|v| v == value)
    }

    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(self.encoded_len);
        for (idx, value) in self.values.iter().enumerate() {
            if idx > 0 {
                out.push(SET_DELIMITER);
            }
            push_escaped(&mut out, value);
        }
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.values.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn into_vec(self) -> Vec<String> {
        self.values
    }
}

/// Split a stored set column into its unescaped labels, skipping blanks.
pub fn split_set(encoded: &str) -> Vec<String> {
    let mut values = Vec::new();
    let mut current = String::new();
    let mut chars = encoded.chars();
    while let Some(c) = chars.next() {
        match c {
            SET_ESCAPE => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            SET_DELIMITER => {
                if !current.is_empty() {
                    values.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        values.push(current);
    }
    values
}

/// Counters plus the string-sets a dimension row carries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DimensionRow {
    pub counter: Counter,
    pub ips: StringSet,
    pub domains: StringSet,
    pub rules: StringSet,
    pub chains: StringSet,
}

impl DimensionRow {
    /// Pure upsert: what a stored row becomes after absorbing `delta`.
    pub fn apply(existing: Option<&DimensionRow>, delta: &DimensionRow) -> DimensionRow {
        let mut row = existing.cloned().unwrap_or_default();
        row.counter.merge(&delta.counter);
        row.ips.union(&delta.ips);
        row.domains.union(&delta.domains);
        row.rules.union(&delta.rules);
        row.chains.union(&delta.chains);
        row
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleRow {
    pub counter: Counter,
    pub final_proxy: String,
    final_proxy_ts: i64,
}

impl RuleRow {
    fn observe(&mut self, final_proxy: &str, upload: u64, download: u64, timestamp_ms: i64) {
        self.counter.observe(upload, download, timestamp_ms);
        if self.final_proxy.is_empty() || timestamp_ms >= self.final_proxy_ts {
            self.final_proxy = final_proxy.to_string();
            self.final_proxy_ts = timestamp_ms;
        }
    }
}

/// Key of a dimensional fact row within one bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FactKey {
    pub bucket: String,
    pub domain: String,
    pub ip: String,
    pub source_ip: String,
    pub chain: String,
    pub rule: String,
}

pub type PairKey = (String, String);

/// Every per-table group of one flush.
#[derive(Debug, Default)]
pub struct BatchAggregate {
    pub domains: HashMap<String, DimensionRow>,
    pub ips: HashMap<String, DimensionRow>,
    pub proxies: HashMap<String, Counter>,
    pub rules: HashMap<String, RuleRow>,
    pub rule_proxies: HashMap<PairKey, Counter>,
    pub rule_chains: HashMap<PairKey, Counter>,
    pub rule_domains: HashMap<PairKey, Counter>,
    pub rule_ips: HashMap<PairKey, Counter>,
    pub domain_proxies: HashMap<PairKey, Counter>,
    pub ip_proxies: HashMap<PairKey, DimensionRow>,
    pub minutes: HashMap<String, Counter>,
    pub hours: HashMap<String, Counter>,
    pub minute_facts: HashMap<FactKey, Counter>,
    pub hour_facts: HashMap<FactKey, Counter>,
    pub devices: HashMap<String, Counter>,
    pub device_domains: HashMap<PairKey, Counter>,
    pub device_ips: HashMap<PairKey, Counter>,
    pub accepted: usize,
    pub dropped: usize,
}

impl BatchAggregate {
    pub fn from_updates<'a, I>(updates: I, now_ms: i64) -> Self
    where
        I: IntoIterator<Item = &'a TrafficUpdate>,
    {
        let mut agg = Self::default();
        for update in updates {
            agg.add(update, now_ms);
        }
        agg
    }

    pub fn add(&mut self, update: &TrafficUpdate, now_ms: i64) {
        if update.is_empty() {
            self.dropped += 1;
            return;
        }
        self.accepted += 1;

        let ts = update.timestamp_or(now_ms);
        let (up, down) = (update.upload, update.download);
        let rule = update.rule_name();
        let proxy = update.final_proxy();
        let chain = update.full_chain();
        let domain = update.domain.as_str();
        let ip = update.ip.as_str();
        let source_ip = update.source_ip();
        let minute = minute_bucket(ts);
        let hour = hour_bucket(ts);

        if !domain.is_empty() {
            let row = self.domains.entry(domain.to_string()).or_default();
            row.counter.observe(up, down, ts);
            row.ips.insert(ip);
            row.rules.insert(&rule);
            row.chains.insert(&chain);

            observe(&mut self.rule_domains, (rule.clone(), domain.to_string()), up, down, ts);
            observe(&mut self.domain_proxies, (domain.to_string(), chain.clone()), up, down, ts);
        }

        if !ip.is_empty() {
            let row = self.ips.entry(ip.to_string()).or_default();
            row.counter.observe(up, down, ts);
            row.domains.insert(domain);
            row.chains.insert(&chain);

            observe(&mut self.rule_ips, (rule.clone(), ip.to_string()), up, down, ts);

            let row = self
                .ip_proxies
                .entry((ip.to_string(), chain.clone()))
                .or_default();
            row.counter.observe(up, down, ts);
            row.domains.insert(domain);
        }

        self.proxies
            .entry(chain.clone())
            .or_default()
            .observe(up, down, ts);
        self.rules
            .entry(rule.clone())
            .or_default()
            .observe(&proxy, up, down, ts);
        observe(&mut self.rule_proxies, (rule.clone(), proxy), up, down, ts);
        observe(&mut self.rule_chains, (rule.clone(), chain.clone()), up, down, ts);

        self.minutes
            .entry(minute.clone())
            .or_default()
            .observe(up, down, ts);
        self.hours
            .entry(hour.clone())
            .or_default()
            .observe(up, down, ts);

        let fact = FactKey {
            bucket: minute,
            domain: domain.to_string(),
            ip: ip.to_string(),
            source_ip: source_ip.to_string(),
            chain,
            rule,
        };
        let hour_fact = FactKey {
            bucket: hour,
            ..fact.clone()
        };
        self.minute_facts
            .entry(fact)
            .or_default()
            .observe(up, down, ts);
        self.hour_facts
            .entry(hour_fact)
            .or_default()
            .observe(up, down, ts);

        if !source_ip.is_empty() {
            self.devices
                .entry(source_ip.to_string())
                .or_default()
                .observe(up, down, ts);
            if !domain.is_empty() {
                observe(
                    &mut self.device_domains,
                    (source_ip.to_string(), domain.to_string()),
                    up,
                    down,
                    ts,
                );
            }
            if !ip.is_empty() {
                observe(
                    &mut self.device_ips,
                    (source_ip.to_string(), ip.to_string()),
                    up,
                    down,
                    ts,
                );
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.accepted == 0
    }
}

fn observe(map: &mut HashMap<PairKey, Counter>, key: PairKey, up: u64, down: u64, ts: i64) {
    map.entry(key).or_default().observe(up, down, ts);
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CountryRow {
    pub country_name: String,
    pub continent: String,
    pub counter: Counter,
}

/// Country deltas grouped per country and per `(bucket, country)`.
#[derive(Debug, Default)]
pub struct CountryAggregate {
    pub countries: HashMap<String, CountryRow>,
    pub minutes: HashMap<PairKey, CountryRow>,
    pub hours: HashMap<PairKey, CountryRow>,
}

impl CountryAggregate {
    pub fn from_updates(updates: &[CountryUpdate], now_ms: i64) -> Self {
        let mut agg = Self::default();
        for update in updates {
            if update.country.is_empty() || (update.upload == 0 && update.download == 0) {
                continue;
            }
            let ts = update.timestamp_ms.unwrap_or(now_ms);
            let country = update.country.clone();
            for (map, key) in [
                (&mut agg.minutes, (minute_bucket(ts), country.clone())),
                (&mut agg.hours, (hour_bucket(ts), country.clone())),
            ] {
                observe_country(map.entry(key).or_default(), update, ts);
            }
            observe_country(agg.countries.entry(country).or_default(), update, ts);
        }
        agg
    }

    pub fn is_empty(&self) -> bool {
        self.countries.is_empty()
    }
}

fn observe_country(row: &mut CountryRow, update: &CountryUpdate, ts: i64) {
    row.counter.observe(update.upload, update.download, ts);
    if !update.country_name.is_empty() {
        row.country_name = update.country_name.clone();
    }
    if !update.continent.is_empty() {
        row.continent = update.continent.clone();
    }
}

fn datetime_from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// `YYYY-MM-DDTHH:MM:00` in UTC.
pub fn minute_bucket(ms: i64) -> String {
    format_minute(&datetime_from_ms(ms))
}

/// `YYYY-MM-DDTHH:00:00` in UTC.
pub fn hour_bucket(ms: i64) -> String {
    format_hour(&datetime_from_ms(ms))
}

pub fn format_minute(dt: &DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:00").to_string()
}

pub fn format_hour(dt: &DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:00:00").to_string()
}

/// Hour bucket containing `dt`, ignoring seconds and minutes.
pub fn truncate_to_hour(dt: &DateTime<Utc>) -> DateTime<Utc> {
    dt.with_minute(0)
        .and_then(|d| d.with_second(0))
        .and_then(|d| d.with_nanosecond(0))
        .unwrap_or(*dt)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario() -> Vec<TrafficUpdate> {
        vec![
            TrafficUpdate::new("a.com", "1.1.1.1", &["ProxyA", "GroupB", "RuleX"])
                .with_traffic(100, 200)
                .with_timestamp(1_700_000_000_000),
            TrafficUpdate::new("a.com", "1.1.1.1", &["ProxyA", "GroupB", "RuleX"])
                .with_traffic(50, 10)
                .with_timestamp(1_700_000_030_000),
            TrafficUpdate::new("b.com", "2.2.2.2", &["DIRECT"])
                .with_rule("Match", "")
                .with_traffic(7, 9)
                .with_source_ip("10.0.0.5")
                .with_timestamp(1_700_000_090_000),
        ]
    }

    #[test]
    fn test_batch_groups_by_domain() {
        let agg = BatchAggregate::from_updates(&scenario(), 0);
        let row = &agg.domains["a.com"];
        assert_eq!(row.counter.upload, 150);
        assert_eq!(row.counter.download, 210);
        assert_eq!(row.counter.connections, 2);
        assert_eq!(row.counter.last_seen_ms, 1_700_000_030_000);
        assert_eq!(row.chains.encode(), "ProxyA > GroupB > RuleX");
        assert_eq!(agg.rules["RuleX"].final_proxy, "ProxyA");
        assert_eq!(agg.devices["10.0.0.5"].connections, 1);
        assert!(!agg.devices.contains_key(""));
    }

    #[test]
    fn test_zero_traffic_is_dropped() {
        let updates = vec![TrafficUpdate::new("a.com", "1.1.1.1", &["P"])];
        let agg = BatchAggregate::from_updates(&updates, 0);
        assert!(agg.is_empty());
        assert_eq!(agg.dropped, 1);
        assert!(agg.domains.is_empty());
    }

    #[test]
    fn test_minute_and_overall_totals_agree() {
        let agg = BatchAggregate::from_updates(&scenario(), 0);
        let facts: u64 = agg.minute_facts.values().map(|c| c.upload).sum();
        let overall: u64 = agg.minutes.values().map(|c| c.upload).sum();
        assert_eq!(facts, overall);
        assert_eq!(overall, 157);
    }

    #[test]
    fn test_apply_commutes_over_permutations() {
        let deltas: Vec<DimensionRow> = scenario()
            .iter()
            .map(|u| {
                let mut row = DimensionRow::default();
                row.counter.observe(u.upload, u.download, u.timestamp_or(0));
                row.ips.insert(&u.ip);
                row
            })
            .collect();

        let orders = [[0, 1, 2], [2, 1, 0], [1, 2, 0], [1, 0, 2]];
        let folded: Vec<Counter> = orders
            .iter()
            .map(|order| {
                let mut row: Option<DimensionRow> = None;
                for idx in order {
                    row = Some(DimensionRow::apply(row.as_ref(), &deltas[*idx]));
                }
                row.map(|r| r.counter).unwrap_or_default()
            })
            .collect();

        assert!(folded.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(folded[0].upload, 157);
        assert_eq!(folded[0].last_seen_ms, 1_700_000_090_000);
    }

    #[test]
    fn test_string_set_dedupes_and_caps() {
        let mut set = StringSet::parse("a,b");
        assert!(!set.insert("a"));
        assert!(set.insert("c"));
        assert_eq!(set.encode(), "a,b,c");

        let long = "x".repeat(STRING_SET_CAP - set.encode().len());
        assert!(!set.insert(&long));
        let fits = "y".repeat(STRING_SET_CAP - set.encode().len() - 1);
        assert!(set.insert(&fits));
        assert_eq!(set.encode().len(), STRING_SET_CAP);
        assert!(!set.insert("z"));
    }

    #[test]
    fn test_string_set_escapes_delimiter() {
        let mut set = StringSet::default();
        assert!(set.insert("IP-CIDR(10.0.0.0/8,no-resolve)"));
        assert!(set.insert(r"C:\path"));
        let encoded = set.encode();
        assert_eq!(encoded, r"IP-CIDR(10.0.0.0/8\,no-resolve),C:\\path");

        let mut reparsed = StringSet::parse(&encoded);
        assert_eq!(reparsed, set);
        assert!(!reparsed.insert("IP-CIDR(10.0.0.0/8,no-resolve)"));
        assert_eq!(split_set(&encoded), vec!["IP-CIDR(10.0.0.0/8,no-resolve)", r"C:\path"]);
    }

    #[test]
    fn test_buckets_truncate() {
        // 2023-11-14T22:13:20Z
        assert_eq!(minute_bucket(1_700_000_000_000), "2023-11-14T22:13:00");
        assert_eq!(hour_bucket(1_700_000_000_000), "2023-11-14T22:00:00");
    }

    #[test]
    fn test_country_aggregate_skips_blank_country() {
        let updates = vec![
            CountryUpdate {
                country: "JP".into(),
                country_name: "Japan".into(),
                continent: "AS".into(),
                upload: 10,
                download: 20,
                timestamp_ms: Some(1_700_000_000_000),
            },
            CountryUpdate {
                upload: 5,
                ..Default::default()
            },
        ];
        let agg = CountryAggregate::from_updates(&updates, 0);
        assert_eq!(agg.countries.len(), 1);
        assert_eq!(agg.countries["JP"].counter.download, 20);
        assert_eq!(agg.minutes.len(), 1);
    }
}
