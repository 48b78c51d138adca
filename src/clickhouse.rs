//! ClickHouse parity reads
//!
//! Answers the same ranged reads as the local fact tables from a columnar
//! mirror populated outside this process:
//! - `{db}.traffic_detail`: `minute_dim_stats` with `bucket DateTime`
//! - `{db}.country_detail`: `minute_country_stats` with `bucket DateTime`
//!
//! Queries go over the HTTP interface with `{name:Type}` placeholders bound
//! through `param_*` URL arguments, and rows come back as `JSONEachRow` in
//! the shape the local reads project.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use crate::config::ClickHouseConfig;
use crate::db::{Dimension, DimensionRecord, FactTable, ListOptions, RangeFilter, Scope, TimeRange};
use crate::error::{Result, StoreError};
use crate::model::{CountryStats, Page, RuleChainRow, Summary, TrafficTotals};

/// SQL text plus its bound parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClickHouseQuery {
    sql: String,
    params: Vec<(String, String)>,
}

impl ClickHouseQuery {
    fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    fn push(&mut self, sql: &str) -> &mut Self {
        self.sql.push_str(sql);
        self
    }

    /// Append a typed placeholder and remember its value.
    fn push_param(&mut self, ty: &str, value: impl ToString) -> &mut Self {
        let name = format!("p{}", self.params.len());
        self.sql.push_str(&format!("{{{name}:{ty}}}"));
        self.params.push((format!("param_{name}"), value.to_string()));
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }
}

/// ClickHouse `DateTime` text for the minute buckets a range covers.
fn bucket_params(range: &TimeRange) -> (String, String) {
    let (start, end) = range.bucket_bounds(FactTable::Minute);
    (start.replacen('T', " ", 1), end.replacen('T', " ", 1))
}

fn push_scope(q: &mut ClickHouseQuery, backend_id: i64, range: &TimeRange) {
    let (start, end) = bucket_params(range);
    q.push(" WHERE backend_id = ").push_param("Int64", backend_id);
    q.push(" AND bucket >= ").push_param("DateTime", start);
    q.push(" AND bucket <= ").push_param("DateTime", end);
}

fn push_chain_prefix(q: &mut ClickHouseQuery, chain: &str) {
    q.push(" AND (chain = ").push_param("String", chain);
    q.push(" OR startsWith(chain, ").push_param("String", format!("{chain} > "));
    q.push("))");
}

fn push_filter(q: &mut ClickHouseQuery, filter: &RangeFilter) {
    if let Some(source_ip) = filter.source_ip() {
        q.push(" AND source_ip = ").push_param("String", source_ip);
    }
    if let Some(chain) = filter.chain() {
        push_chain_prefix(q, chain);
    }
}

fn push_search(q: &mut ClickHouseQuery, column: &str, search: &str) {
    q.push(&format!(" AND positionCaseInsensitiveUTF8({column}, ")).push_param("String", search);
    q.push(") > 0");
}

fn push_page(q: &mut ClickHouseQuery, options: &ListOptions) {
    q.push(&options.order_by());
    q.push(" LIMIT ").push_param("UInt32", options.limit());
    q.push(" OFFSET ").push_param("UInt32", options.offset);
}

/// `set_a`, `set_b`, `extra` for a dimension, matching the local projection.
fn dimension_extras(dimension: Dimension) -> [&'static str; 3] {
    match dimension {
        Dimension::Domain => [
            r"arrayStringConcat(arrayMap(x -> replaceAll(replaceAll(x, '\\', '\\\\'), ',', '\\,'), groupUniqArray(ip)), ',')",
            r"arrayStringConcat(arrayMap(x -> replaceAll(replaceAll(x, '\\', '\\\\'), ',', '\\,'), groupUniqArray(rule)), ',')",
            r"arrayStringConcat(arrayMap(x -> replaceAll(replaceAll(x, '\\', '\\\\'), ',', '\\,'), groupUniqArray(chain)), ',')",
        ],
        Dimension::Ip => [
            r"arrayStringConcat(arrayMap(x -> replaceAll(replaceAll(x, '\\', '\\\\'), ',', '\\,'), groupUniqArray(domain)), ',')",
            r"arrayStringConcat(arrayMap(x -> replaceAll(replaceAll(x, '\\', '\\\\'), ',', '\\,'), groupUniqArray(chain)), ',')",
            "''",
        ],
        Dimension::Rule => ["''", "''", "max(splitByString(' > ', chain)[1])"],
        Dimension::Proxy | Dimension::Device => ["''", "''", "''"],
    }
}

const LAST_SEEN_MS: &str = "toInt64(toUnixTimestamp(max(bucket))) * 1000";

#[derive(Debug, Deserialize)]
struct CountRow {
    total: u64,
}

#[derive(Debug, Deserialize)]
struct SummaryRow {
    upload: u64,
    download: u64,
    connections: u64,
    domains: u64,
    ips: u64,
    proxies: u64,
    rules: u64,
    devices: u64,
}

#[derive(Debug, Deserialize)]
struct RuleChainRecord {
    rule: String,
    chain: String,
    upload: u64,
    download: u64,
    connections: u64,
}

/// Read-only client for the ClickHouse mirror.
#[derive(Clone)]
pub struct ClickHouseReader {
    client: reqwest::Client,
    url: String,
    database: String,
    user: Option<String>,
    password: Option<String>,
}

impl ClickHouseReader {
    pub fn new(config: &ClickHouseConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            database: config.database.clone(),
            user: config.user.clone(),
            password: config.password.clone(),
        })
    }

    fn table(&self, name: &str) -> String {
        format!("{}.{}", self.database, name)
    }

    async fn fetch<T: DeserializeOwned>(&self, query: &ClickHouseQuery) -> Result<Vec<T>> {
        let sql = format!("{} FORMAT JSONEachRow", query.sql);
        debug!(sql = %sql, "ClickHouse query");

        let mut request = self
            .client
            .post(&self.url)
            .query(&[("output_format_json_quote_64bit_integers", "0")])
            .query(&query.params)
            .body(sql);
        if let Some(user) = &self.user {
            request = request.basic_auth(user, self.password.as_deref());
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(StoreError::ClickHouse(format!("{}: {}", status, body.trim())));
        }

        body.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(StoreError::from))
            .collect()
    }

    pub fn summary_query(&self, backend_id: i64, range: &TimeRange, filter: &RangeFilter) -> ClickHouseQuery {
        let mut q = ClickHouseQuery::new(
            "SELECT sum(upload) AS upload, sum(download) AS download, sum(connections) AS connections, \
             uniqExactIf(domain, domain != '') AS domains, uniqExactIf(ip, ip != '') AS ips, \
             uniqExactIf(chain, chain != '') AS proxies, uniqExactIf(rule, rule != '') AS rules, \
             uniqExactIf(source_ip, source_ip != '') AS devices FROM ",
        );
        q.push(&self.table("traffic_detail"));
        push_scope(&mut q, backend_id, range);
        push_filter(&mut q, filter);
        q
    }

    pub async fn summary(&self, backend_id: i64, range: &TimeRange, filter: &RangeFilter) -> Result<Summary> {
        let rows: Vec<SummaryRow> = self.fetch(&self.summary_query(backend_id, range, filter)).await?;
        Ok(rows
            .into_iter()
            .next()
            .map(|row| Summary {
                totals: TrafficTotals {
                    total_upload: row.upload,
                    total_download: row.download,
                    total_connections: row.connections,
                },
                unique_domains: row.domains,
                unique_ips: row.ips,
                unique_proxies: row.proxies,
                unique_rules: row.rules,
                unique_devices: row.devices,
            })
            .unwrap_or_default())
    }

    #[allow(clippy::too_many_arguments)]
    fn push_dimension_body(
        &self,
        q: &mut ClickHouseQuery,
        backend_id: i64,
        dimension: Dimension,
        scope: &Scope,
        range: &TimeRange,
        filter: &RangeFilter,
        search: Option<&str>,
    ) {
        let key = dimension.fact_column();
        q.push(" FROM ").push(&self.table("traffic_detail"));
        push_scope(q, backend_id, range);
        q.push(&format!(" AND {key} != ''"));
        match scope {
            Scope::All => {}
            Scope::Rule(rule) => {
                q.push(" AND rule = ").push_param("String", rule);
            }
            Scope::Proxy(chain) => push_chain_prefix(q, chain),
            Scope::Device(device) => {
                q.push(" AND source_ip = ").push_param("String", device);
            }
        }
        push_filter(q, filter);
        if let Some(search) = search {
            push_search(q, key, search);
        }
    }

    /// List and count queries for one dimension read.
    pub fn dimension_queries(
        &self,
        backend_id: i64,
        dimension: Dimension,
        scope: &Scope,
        range: &TimeRange,
        filter: &RangeFilter,
        options: &ListOptions,
    ) -> (ClickHouseQuery, ClickHouseQuery) {
        let key = dimension.fact_column();
        let [set_a, set_b, extra] = dimension_extras(dimension);
        let search = options.search();

        let mut list = ClickHouseQuery::new(format!(
            "SELECT {key} AS k, toInt64(sum(upload)) AS upload, toInt64(sum(download)) AS download, \
             toInt64(sum(connections)) AS connections, {LAST_SEEN_MS} AS last_seen, \
             {set_a} AS set_a, {set_b} AS set_b, {extra} AS extra"
        ));
        self.push_dimension_body(&mut list, backend_id, dimension, scope, range, filter, search);
        list.push(&format!(" GROUP BY {key}"));
        push_page(&mut list, options);

        let mut count = ClickHouseQuery::new(format!("SELECT uniqExact({key}) AS total"));
        self.push_dimension_body(&mut count, backend_id, dimension, scope, range, filter, search);
        (list, count)
    }

    pub async fn dimension_page(
        &self,
        backend_id: i64,
        dimension: Dimension,
        scope: &Scope,
        range: &TimeRange,
        filter: &RangeFilter,
        options: &ListOptions,
    ) -> Result<Page<DimensionRecord>> {
        let (list, count) = self.dimension_queries(backend_id, dimension, scope, range, filter, options);
        let (data, counts) = futures::try_join!(
            self.fetch::<DimensionRecord>(&list),
            self.fetch::<CountRow>(&count)
        )?;
        Ok(Page {
            data,
            total: counts.first().map(|c| c.total).unwrap_or(0),
        })
    }

    pub async fn countries(&self, backend_id: i64, range: &TimeRange, options: &ListOptions) -> Result<Page<CountryStats>> {
        let table = self.table("country_detail");
        let mut list = ClickHouseQuery::new(format!(
            "SELECT country AS k, toInt64(sum(upload)) AS upload, toInt64(sum(download)) AS download, \
             toInt64(sum(connections)) AS connections, {LAST_SEEN_MS} AS last_seen, \
             max(country_name) AS set_a, max(continent) AS set_b, '' AS extra FROM {table}"
        ));
        let mut count = ClickHouseQuery::new(format!("SELECT uniqExact(country) AS total FROM {table}"));
        for q in [&mut list, &mut count] {
            push_scope(q, backend_id, range);
            if let Some(search) = options.search() {
                push_search(q, "country", search);
            }
        }
        list.push(" GROUP BY country");
        push_page(&mut list, options);

        let (data, counts) = futures::try_join!(
            self.fetch::<DimensionRecord>(&list),
            self.fetch::<CountRow>(&count)
        )?;
        Ok(Page {
            data: data.into_iter().map(DimensionRecord::into_country).collect(),
            total: counts.first().map(|c| c.total).unwrap_or(0),
        })
    }

    pub async fn rule_chain_rows(&self, backend_id: i64, range: &TimeRange) -> Result<Vec<RuleChainRow>> {
        let mut q = ClickHouseQuery::new(
            "SELECT rule, chain, sum(upload) AS upload, sum(download) AS download, sum(connections) AS connections FROM ",
        );
        q.push(&self.table("traffic_detail"));
        push_scope(&mut q, backend_id, range);
        q.push(" GROUP BY rule, chain ORDER BY rule ASC, chain ASC");

        let rows: Vec<RuleChainRecord> = self.fetch(&q).await?;
        Ok(rows
            .into_iter()
            .map(|r| RuleChainRow::new(&r.rule, &r.chain, r.upload, r.download, r.connections))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn reader(url: &str) -> ClickHouseReader {
        ClickHouseReader::new(&ClickHouseConfig {
            enabled: true,
            url: url.to_string(),
            timeout_ms: 500,
            ..Default::default()
        })
        .unwrap()
    }

    fn range() -> TimeRange {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 30).unwrap();
        TimeRange::new(start, start + chrono::Duration::days(2)).unwrap()
    }

    #[test]
    fn test_values_are_bound_not_inlined() {
        let filter = RangeFilter {
            source_ip: Some("10.0.0.2".into()),
            chain: Some("ProxyA' OR 1=1".into()),
        };
        let options = ListOptions {
            search: Some("Example".into()),
            ..ListOptions::with_limit(10)
        };
        let (list, count) = reader("http://localhost:8123/").dimension_queries(
            7,
            Dimension::Domain,
            &Scope::Rule("RuleX".into()),
            &range(),
            &filter,
            &options,
        );

        assert!(list.sql().starts_with("SELECT domain AS k"));
        assert!(list.sql().contains("FROM flowstats.traffic_detail"));
        assert!(!list.sql().contains("1=1"));
        assert!(list.sql().contains("{p0:Int64}"));
        assert!(list.sql().ends_with("LIMIT {p8:UInt32} OFFSET {p9:UInt32}"));

        let params = list.params();
        assert_eq!(params[0], ("param_p0".to_string(), "7".to_string()));
        assert_eq!(params[1].1, "2024-01-01 00:00:00");
        assert_eq!(params[2].1, "2024-01-03 00:00:00");
        assert_eq!(params[3].1, "RuleX");
        assert_eq!(params[6].1, "ProxyA' OR 1=1 > ");
        assert_eq!(params[7].1, "Example");
        assert_eq!(params[8].1, "10");

        assert!(count.sql().starts_with("SELECT uniqExact(domain) AS total"));
        assert_eq!(count.params().len(), 8);
    }

    #[test]
    fn test_rule_projection_carries_exit_hop() {
        let (list, _) = reader("http://localhost:8123").dimension_queries(
            1,
            Dimension::Rule,
            &Scope::All,
            &range(),
            &RangeFilter::default(),
            &ListOptions::default(),
        );
        assert!(list.sql().contains("max(splitByString(' > ', chain)[1]) AS extra"));
        assert!(list.sql().contains(" GROUP BY rule ORDER BY (upload + download) DESC, k ASC"));
    }

    #[test]
    fn test_projection_rows_decode() {
        let line = r#"{"k":"a.com","upload":10,"download":20,"connections":2,"last_seen":1704067200000,"set_a":"1.1.1.1,2.2.2.2","set_b":"RuleX","extra":"ProxyA"}"#;
        let record: DimensionRecord = serde_json::from_str(line).unwrap();
        let domain = record.into_domain();
        assert_eq!(domain.domain, "a.com");
        assert_eq!(domain.ips, vec!["1.1.1.1", "2.2.2.2"]);
        assert_eq!(domain.totals.traffic(), 30);
    }

    #[tokio::test]
    async fn test_unreachable_server_is_an_error() {
        let result = reader("http://127.0.0.1:1")
            .summary(1, &range(), &RangeFilter::default())
            .await;
        assert!(matches!(result, Err(StoreError::Http(_))));
    }
}
