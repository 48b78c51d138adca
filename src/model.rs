//! Ingestion units and the plain records returned by read operations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Label used when a connection carries no proxy chain.
pub const DIRECT: &str = "DIRECT";

/// Separator between hops in a stored chain label.
pub const CHAIN_SEPARATOR: &str = " > ";

/// Per-connection traffic delta emitted by the gateway.
///
/// `chains[0]` is the exit hop, the last element is the rule/entry label.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TrafficUpdate {
    pub domain: String,
    pub ip: String,
    pub chain: String,
    pub chains: Vec<String>,
    pub rule: String,
    pub rule_payload: String,
    pub upload: u64,
    pub download: u64,
    #[serde(rename = "sourceIP")]
    pub source_ip: Option<String>,
    pub timestamp_ms: Option<i64>,
}

impl TrafficUpdate {
    pub fn new(domain: impl Into<String>, ip: impl Into<String>, chains: &[&str]) -> Self {
        Self {
            domain: domain.into(),
            ip: ip.into(),
            chains: chains.iter().map(|c| c.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn with_traffic(mut self, upload: u64, download: u64) -> Self {
        self.upload = upload;
        self.download = download;
        self
    }

    pub fn with_rule(mut self, rule: impl Into<String>, payload: impl Into<String>) -> Self {
        self.rule = rule.into();
        self.rule_payload = payload.into();
        self
    }

    pub fn with_source_ip(mut self, source_ip: impl Into<String>) -> Self {
        self.source_ip = Some(source_ip.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp_ms: i64) -> Self {
        self.timestamp_ms = Some(timestamp_ms);
        self
    }

    /// Zero-byte deltas carry no information and are never stored.
    pub fn is_empty(&self) -> bool {
        self.upload == 0 && self.download == 0
    }

    pub fn rule_name(&self) -> String {
        if self.chains.len() > 1 {
            if let Some(last) = self.chains.last() {
                return last.clone();
            }
        }
        if self.rule_payload.is_empty() {
            self.rule.clone()
        } else {
            format!("{}({})", self.rule, self.rule_payload)
        }
    }

    pub fn final_proxy(&self) -> String {
        self.chains
            .first()
            .cloned()
            .unwrap_or_else(|| DIRECT.to_string())
    }

    pub fn full_chain(&self) -> String {
        if !self.chains.is_empty() {
            self.chains.join(CHAIN_SEPARATOR)
        } else if !self.chain.is_empty() {
            self.chain.clone()
        } else {
            DIRECT.to_string()
        }
    }

    pub fn source_ip(&self) -> &str {
        self.source_ip.as_deref().unwrap_or("")
    }

    pub fn timestamp_or(&self, now_ms: i64) -> i64 {
        self.timestamp_ms.unwrap_or(now_ms)
    }
}

/// Country-level delta produced after GeoIP resolution of a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CountryUpdate {
    pub country: String,
    pub country_name: String,
    pub continent: String,
    pub upload: u64,
    pub download: u64,
    pub timestamp_ms: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficTotals {
    pub total_upload: u64,
    pub total_download: u64,
    pub total_connections: u64,
}

impl TrafficTotals {
    pub fn traffic(&self) -> u64 {
        self.total_upload.saturating_add(self.total_download)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    #[serde(flatten)]
    pub totals: TrafficTotals,
    pub unique_domains: u64,
    pub unique_ips: u64,
    pub unique_proxies: u64,
    pub unique_rules: u64,
    pub unique_devices: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainStats {
    pub domain: String,
    #[serde(flatten)]
    pub totals: TrafficTotals,
    pub last_seen: Option<DateTime<Utc>>,
    pub ips: Vec<String>,
    pub rules: Vec<String>,
    pub chains: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpStats {
    pub ip: String,
    #[serde(flatten)]
    pub totals: TrafficTotals,
    pub last_seen: Option<DateTime<Utc>>,
    pub domains: Vec<String>,
    pub chains: Vec<String>,
    pub asn: Option<String>,
    pub geo: Option<IpGeolocation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyStats {
    pub chain: String,
    #[serde(flatten)]
    pub totals: TrafficTotals,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleStats {
    pub rule: String,
    pub final_proxy: String,
    #[serde(flatten)]
    pub totals: TrafficTotals,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStats {
    #[serde(rename = "sourceIP")]
    pub source_ip: String,
    #[serde(flatten)]
    pub totals: TrafficTotals,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountryStats {
    pub country: String,
    pub country_name: String,
    pub continent: String,
    #[serde(flatten)]
    pub totals: TrafficTotals,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleProxyLink {
    pub rule: String,
    pub proxy: String,
    #[serde(flatten)]
    pub totals: TrafficTotals,
}

/// One `(rule, chain)` traffic row, cumulative or summed over a range.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleChainRow {
    pub rule: String,
    pub chain: String,
    pub upload: u64,
    pub download: u64,
    pub connections: u64,
}

impl RuleChainRow {
    pub fn new(rule: &str, chain: &str, upload: u64, download: u64, connections: u64) -> Self {
        Self {
            rule: rule.to_string(),
            chain: chain.to_string(),
            upload,
            download,
            connections,
        }
    }

    pub fn traffic(&self) -> u64 {
        self.upload.saturating_add(self.download)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendPoint {
    pub time: DateTime<Utc>,
    pub upload: u64,
    pub download: u64,
    pub connections: u64,
}

/// GeoIP/ASN lookup result cached per IP.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpGeolocation {
    pub country: String,
    pub country_name: String,
    pub city: String,
    pub asn: String,
    pub as_name: String,
    pub continent: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub total: u64,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self {
            data: Vec::new(),
            total: 0,
        }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            data: self.data.into_iter().map(f).collect(),
            total: self.total,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupResult {
    pub dimension_rows: u64,
    pub fact_rows: u64,
}

impl CleanupResult {
    pub fn total(&self) -> u64 {
        self.dimension_rows + self.fact_rows
    }
}

pub(crate) fn millis_to_datetime(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.filter(|ms| *ms > 0)
        .and_then(DateTime::from_timestamp_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_name_prefers_chain_tail() {
        let update = TrafficUpdate::new("a.com", "1.1.1.1", &["ProxyA", "GroupB", "RuleX"])
            .with_rule("Match", "");
        assert_eq!(update.rule_name(), "RuleX");
        assert_eq!(update.final_proxy(), "ProxyA");
        assert_eq!(update.full_chain(), "ProxyA > GroupB > RuleX");
    }

    #[test]
    fn test_rule_name_falls_back_to_rule_and_payload() {
        let update =
            TrafficUpdate::new("a.com", "1.1.1.1", &["DIRECT"]).with_rule("DomainSuffix", "a.com");
        assert_eq!(update.rule_name(), "DomainSuffix(a.com)");

        let bare = TrafficUpdate::new("a.com", "1.1.1.1", &[]).with_rule("Match", "");
        assert_eq!(bare.rule_name(), "Match");
        assert_eq!(bare.final_proxy(), DIRECT);
        assert_eq!(bare.full_chain(), DIRECT);
    }

    #[test]
    fn test_full_chain_uses_legacy_chain() {
        let mut update = TrafficUpdate::new("a.com", "1.1.1.1", &[]);
        update.chain = "ProxyZ".to_string();
        assert_eq!(update.full_chain(), "ProxyZ");
    }

    #[test]
    fn test_deserialize_gateway_payload() {
        let json = r#"{"domain":"a.com","ip":"1.1.1.1","chains":["P","R"],"upload":5,"download":7,"sourceIP":"10.0.0.2","timestampMs":1700000000000}"#;
        let update: TrafficUpdate = serde_json::from_str(json).unwrap();
        assert_eq!(update.source_ip(), "10.0.0.2");
        assert_eq!(update.timestamp_ms, Some(1_700_000_000_000));
        assert!(!update.is_empty());
        assert!(TrafficUpdate::default().is_empty());
    }
}
