//! Dimension and time-bucket reads
//!
//! Every list read goes through a [`DimensionQuery`]; the cumulative and the
//! ranged path produce the same [`DimensionRecord`] rows, which are then
//! shaped into the public records.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use sqlx::{QueryBuilder, Sqlite};

use super::query::{
    push_bucket_range, push_filter, push_search, DimensionQuery, LAST_SEEN_FROM_BUCKET,
};
use super::{Database, FactTable, IpDecoration, ListOptions, QuerySource, RangeFilter, TimeRange};
use crate::aggregate::StringSet;
use crate::error::Result;
use crate::model::{
    millis_to_datetime, CountryStats, DeviceStats, DomainStats, IpStats, Page, ProxyStats, RuleChainRow,
    RuleProxyLink, RuleStats, Summary, TrafficTotals, TrendPoint,
};

/// Unified projection row shared by cumulative, ranged and ClickHouse reads.
#[derive(Debug, Clone, Default, PartialEq, Eq, sqlx::FromRow, Deserialize)]
pub struct DimensionRecord {
    pub k: String,
    pub upload: i64,
    pub download: i64,
    pub connections: i64,
    #[serde(default)]
    pub last_seen: Option<i64>,
    #[serde(default)]
    pub set_a: String,
    #[serde(default)]
    pub set_b: String,
    #[serde(default)]
    pub extra: String,
}

pub(crate) fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

/// Decode a stored set column, re-applying the length cap to ranged unions.
fn set_values(encoded: &str) -> Vec<String> {
    StringSet::parse(encoded).into_vec()
}

impl DimensionRecord {
    pub fn totals(&self) -> TrafficTotals {
        TrafficTotals {
            total_upload: to_u64(self.upload),
            total_download: to_u64(self.download),
            total_connections: to_u64(self.connections),
        }
    }

    fn last_seen_at(&self) -> Option<DateTime<Utc>> {
        millis_to_datetime(self.last_seen)
    }

    pub fn into_domain(self) -> DomainStats {
        DomainStats {
            totals: self.totals(),
            last_seen: self.last_seen_at(),
            ips: set_values(&self.set_a),
            rules: set_values(&self.set_b),
            chains: set_values(&self.extra),
            domain: self.k,
        }
    }

    pub fn into_ip(self, decoration: IpDecoration) -> IpStats {
        IpStats {
            totals: self.totals(),
            last_seen: self.last_seen_at(),
            domains: set_values(&self.set_a),
            chains: set_values(&self.set_b),
            asn: decoration.asn,
            geo: decoration.geo,
            ip: self.k,
        }
    }

    pub fn into_proxy(self) -> ProxyStats {
        ProxyStats {
            totals: self.totals(),
            last_seen: self.last_seen_at(),
            chain: self.k,
        }
    }

    pub fn into_rule(self) -> RuleStats {
        RuleStats {
            totals: self.totals(),
            last_seen: self.last_seen_at(),
            final_proxy: self.extra,
            rule: self.k,
        }
    }

    pub fn into_device(self) -> DeviceStats {
        DeviceStats {
            totals: self.totals(),
            last_seen: self.last_seen_at(),
            source_ip: self.k,
        }
    }

    pub fn into_country(self) -> CountryStats {
        CountryStats {
            totals: self.totals(),
            last_seen: self.last_seen_at(),
            country_name: self.set_a,
            continent: self.set_b,
            country: self.k,
        }
    }
}

type SummaryRow = (i64, i64, i64, i64, i64, i64, i64, i64);

fn summary_from(row: SummaryRow) -> Summary {
    let (upload, download, connections, domains, ips, proxies, rules, devices) = row;
    Summary {
        totals: TrafficTotals {
            total_upload: to_u64(upload),
            total_download: to_u64(download),
            total_connections: to_u64(connections),
        },
        unique_domains: to_u64(domains),
        unique_ips: to_u64(ips),
        unique_proxies: to_u64(proxies),
        unique_rules: to_u64(rules),
        unique_devices: to_u64(devices),
    }
}

/// Parse a stored `YYYY-MM-DDTHH:MM:SS` bucket.
pub(crate) fn parse_bucket(bucket: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(bucket, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

impl Database {
    /// Run one planned list read and its total count.
    pub async fn dimension_page(
        &self,
        backend_id: i64,
        query: &DimensionQuery,
        options: &ListOptions,
    ) -> Result<Page<DimensionRecord>> {
        let mut list = query.list_query(backend_id, options);
        let mut count = query.count_query(backend_id, options);
        let (data, (total,)) = futures::try_join!(
            list.build_query_as::<DimensionRecord>().fetch_all(&self.pool),
            count.build_query_as::<(i64,)>().fetch_one(&self.pool)
        )?;
        Ok(Page {
            data,
            total: to_u64(total),
        })
    }

    /// Attach ASN/GeoIP details to a page of IP records.
    pub async fn decorate_ip_page(&self, backend_id: i64, page: Page<DimensionRecord>) -> Result<Page<IpStats>> {
        let ips: Vec<String> = page.data.iter().map(|r| r.k.clone()).collect();
        let mut decorations: HashMap<String, IpDecoration> = self.decorate_ips(backend_id, &ips).await?;
        Ok(page.map(|record| {
            let decoration = decorations.remove(&record.k).unwrap_or_default();
            record.into_ip(decoration)
        }))
    }

    pub async fn get_summary(&self, backend_id: i64, range: Option<TimeRange>, filter: &RangeFilter) -> Result<Summary> {
        match (QuerySource::for_range(range), filter.is_empty()) {
            (QuerySource::Cumulative, true) => self.cumulative_summary(backend_id).await,
            (QuerySource::Ranged { table, range }, true) => {
                let (totals, mut summary) = futures::try_join!(
                    self.overall_totals(backend_id, table, range.as_ref()),
                    self.fact_summary(backend_id, table, range.as_ref(), filter)
                )?;
                summary.totals = totals;
                Ok(summary)
            }
            (QuerySource::Ranged { table, range }, false) => {
                self.fact_summary(backend_id, table, range.as_ref(), filter).await
            }
            (QuerySource::Cumulative, false) => self.fact_summary(backend_id, FactTable::Minute, None, filter).await,
        }
    }

    async fn cumulative_summary(&self, backend_id: i64) -> Result<Summary> {
        let (upload, download, connections): (i64, i64, i64) = sqlx::query_as(
            "SELECT COALESCE(SUM(total_upload), 0), COALESCE(SUM(total_download), 0), COALESCE(SUM(total_connections), 0) \
             FROM proxy_stats WHERE backend_id = ?",
        )
        .bind(backend_id)
        .fetch_one(&self.pool)
        .await?;

        let (domains, ips, proxies, rules, devices): (i64, i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                (SELECT COUNT(*) FROM domain_stats WHERE backend_id = ?),
                (SELECT COUNT(*) FROM ip_stats WHERE backend_id = ?),
                (SELECT COUNT(*) FROM proxy_stats WHERE backend_id = ?),
                (SELECT COUNT(*) FROM rule_stats WHERE backend_id = ?),
                (SELECT COUNT(*) FROM device_stats WHERE backend_id = ?)
            "#,
        )
        .bind(backend_id)
        .bind(backend_id)
        .bind(backend_id)
        .bind(backend_id)
        .bind(backend_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(summary_from((upload, download, connections, domains, ips, proxies, rules, devices)))
    }

    async fn fact_summary(
        &self,
        backend_id: i64,
        table: FactTable,
        range: Option<&TimeRange>,
        filter: &RangeFilter,
    ) -> Result<Summary> {
        let mut qb: QueryBuilder<'static, Sqlite> = QueryBuilder::new(
            "SELECT COALESCE(SUM(upload), 0), COALESCE(SUM(download), 0), COALESCE(SUM(connections), 0), \
             COUNT(DISTINCT NULLIF(domain, '')), COUNT(DISTINCT NULLIF(ip, '')), COUNT(DISTINCT NULLIF(chain, '')), \
             COUNT(DISTINCT NULLIF(rule, '')), COUNT(DISTINCT NULLIF(source_ip, '')) FROM ",
        );
        qb.push(table.dim_table());
        qb.push(" WHERE backend_id = ");
        qb.push_bind(backend_id);
        push_bucket_range(&mut qb, table, range);
        push_filter(&mut qb, filter);
        let row: SummaryRow = qb.build_query_as().fetch_one(&self.pool).await?;
        Ok(summary_from(row))
    }

    async fn overall_totals(&self, backend_id: i64, table: FactTable, range: Option<&TimeRange>) -> Result<TrafficTotals> {
        let mut qb: QueryBuilder<'static, Sqlite> = QueryBuilder::new(
            "SELECT COALESCE(SUM(upload), 0), COALESCE(SUM(download), 0), COALESCE(SUM(connections), 0) FROM ",
        );
        qb.push(table.overall_table());
        qb.push(" WHERE backend_id = ");
        qb.push_bind(backend_id);
        push_bucket_range(&mut qb, table, range);
        let (upload, download, connections): (i64, i64, i64) = qb.build_query_as().fetch_one(&self.pool).await?;
        Ok(TrafficTotals {
            total_upload: to_u64(upload),
            total_download: to_u64(download),
            total_connections: to_u64(connections),
        })
    }

    /// Overall totals for a range, read from the cheap per-bucket table.
    pub async fn get_traffic_in_range(&self, backend_id: i64, range: &TimeRange) -> Result<TrafficTotals> {
        self.overall_totals(backend_id, super::resolve_fact_table(range), Some(range))
            .await
    }

    /// Overall traffic grouped into windows of `bucket_minutes`. Hourly
    /// ranges never resolve finer than one hour.
    pub async fn get_traffic_trend(&self, backend_id: i64, range: &TimeRange, bucket_minutes: u32) -> Result<Vec<TrendPoint>> {
        let table = super::resolve_fact_table(range);
        let floor_minutes = match table {
            FactTable::Minute => 1,
            FactTable::Hourly => 60,
        };
        let window_secs = i64::from(bucket_minutes.max(floor_minutes)) * 60;

        let mut qb: QueryBuilder<'static, Sqlite> = QueryBuilder::new("SELECT bucket, upload, download, connections FROM ");
        qb.push(table.overall_table());
        qb.push(" WHERE backend_id = ");
        qb.push_bind(backend_id);
        push_bucket_range(&mut qb, table, Some(range));
        let rows: Vec<(String, i64, i64, i64)> = qb.build_query_as().fetch_all(&self.pool).await?;

        let mut windows: BTreeMap<i64, (u64, u64, u64)> = BTreeMap::new();
        for (bucket, upload, download, connections) in rows {
            let Some(at) = parse_bucket(&bucket) else {
                continue;
            };
            let secs = at.timestamp();
            let window = secs - secs.rem_euclid(window_secs);
            let entry = windows.entry(window).or_default();
            entry.0 += to_u64(upload);
            entry.1 += to_u64(download);
            entry.2 += to_u64(connections);
        }

        Ok(windows
            .into_iter()
            .filter_map(|(secs, (upload, download, connections))| {
                Some(TrendPoint {
                    time: DateTime::from_timestamp(secs, 0)?,
                    upload,
                    download,
                    connections,
                })
            })
            .collect())
    }

    pub async fn get_country_stats(
        &self,
        backend_id: i64,
        range: Option<TimeRange>,
        options: &ListOptions,
    ) -> Result<Page<CountryStats>> {
        let mut list: QueryBuilder<'static, Sqlite> = QueryBuilder::new("SELECT ");
        let mut count: QueryBuilder<'static, Sqlite> = QueryBuilder::new("SELECT ");
        match QuerySource::for_range(range) {
            QuerySource::Ranged { table, range } => {
                list.push(format!(
                    "country AS k, SUM(upload) AS upload, SUM(download) AS download, SUM(connections) AS connections, \
                     {LAST_SEEN_FROM_BUCKET} AS last_seen, MAX(country_name) AS set_a, MAX(continent) AS set_b, '' AS extra"
                ));
                count.push("COUNT(DISTINCT country)");
                for qb in [&mut list, &mut count] {
                    qb.push(format!(" FROM {} WHERE backend_id = ", table.country_table()));
                    qb.push_bind(backend_id);
                    push_bucket_range(qb, table, range.as_ref());
                    if let Some(search) = options.search() {
                        push_search(qb, "country", search);
                    }
                }
                list.push(" GROUP BY country");
            }
            QuerySource::Cumulative => {
                list.push(
                    "country AS k, total_upload AS upload, total_download AS download, total_connections AS connections, \
                     last_seen, country_name AS set_a, continent AS set_b, '' AS extra",
                );
                count.push("COUNT(*)");
                for qb in [&mut list, &mut count] {
                    qb.push(" FROM country_stats WHERE backend_id = ");
                    qb.push_bind(backend_id);
                    if let Some(search) = options.search() {
                        push_search(qb, "country", search);
                    }
                }
            }
        }
        list.push(options.order_by());
        list.push(" LIMIT ");
        list.push_bind(i64::from(options.limit()));
        list.push(" OFFSET ");
        list.push_bind(i64::from(options.offset));

        let (data, (total,)) = futures::try_join!(
            list.build_query_as::<DimensionRecord>().fetch_all(&self.pool),
            count.build_query_as::<(i64,)>().fetch_one(&self.pool)
        )?;
        Ok(Page {
            data: data.into_iter().map(DimensionRecord::into_country).collect(),
            total: to_u64(total),
        })
    }

    /// Cumulative rule → exit-proxy links, heaviest first within each rule.
    pub async fn get_rule_proxy_map(&self, backend_id: i64) -> Result<Vec<RuleProxyLink>> {
        let rows: Vec<(String, String, i64, i64, i64)> = sqlx::query_as(
            "SELECT rule, proxy, total_upload, total_download, total_connections FROM rule_proxy_map \
             WHERE backend_id = ? ORDER BY rule ASC, (total_upload + total_download) DESC, proxy ASC",
        )
        .bind(backend_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(rule, proxy, upload, download, connections)| RuleProxyLink {
                rule,
                proxy,
                totals: TrafficTotals {
                    total_upload: to_u64(upload),
                    total_download: to_u64(download),
                    total_connections: to_u64(connections),
                },
            })
            .collect())
    }

    /// `(rule, chain)` rows: the cumulative baseline without a range, bucket
    /// sums with one.
    pub async fn get_rule_chain_rows(&self, backend_id: i64, range: Option<TimeRange>) -> Result<Vec<RuleChainRow>> {
        let mut qb: QueryBuilder<'static, Sqlite> = QueryBuilder::new("SELECT rule, chain, ");
        match QuerySource::for_range(range) {
            QuerySource::Ranged { table, range } => {
                qb.push("SUM(upload), SUM(download), SUM(connections) FROM ");
                qb.push(table.dim_table());
                qb.push(" WHERE backend_id = ");
                qb.push_bind(backend_id);
                push_bucket_range(&mut qb, table, range.as_ref());
                qb.push(" GROUP BY rule, chain");
            }
            QuerySource::Cumulative => {
                qb.push("total_upload, total_download, total_connections FROM rule_chain_traffic WHERE backend_id = ");
                qb.push_bind(backend_id);
            }
        }
        qb.push(" ORDER BY rule ASC, chain ASC");

        let rows: Vec<(String, String, i64, i64, i64)> = qb.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|(rule, chain, upload, download, connections)| {
                RuleChainRow::new(&rule, &chain, to_u64(upload), to_u64(download), to_u64(connections))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::resolve_range;
    use crate::config::Config;
    use crate::db::tests::test_db;
    use crate::model::{CountryUpdate, TrafficUpdate};
    use crate::stats::StatsService;
    use std::sync::Arc;

    // 2023-11-14T22:13:20Z
    const T0: i64 = 1_700_000_000_000;

    fn updates() -> Vec<TrafficUpdate> {
        vec![
            TrafficUpdate::new("a.com", "1.1.1.1", &["ProxyA", "GroupB", "RuleX"])
                .with_traffic(100, 200)
                .with_source_ip("10.0.0.2")
                .with_timestamp(T0),
            TrafficUpdate::new("a.com", "1.1.1.1", &["ProxyA", "GroupB", "RuleX"])
                .with_traffic(50, 10)
                .with_source_ip("10.0.0.2")
                .with_timestamp(T0 + 30_000),
            TrafficUpdate::new("b.com", "2.2.2.2", &["ProxyC", "RuleY"])
                .with_traffic(5, 5)
                .with_source_ip("10.0.0.3")
                .with_timestamp(T0 + 60_000),
            // three hours later, outside the short range
            TrafficUpdate::new("c.com", "3.3.3.3", &["DIRECT"])
                .with_rule("Match", "")
                .with_traffic(1, 1)
                .with_timestamp(T0 + 3 * 3_600_000),
        ]
    }

    async fn seeded() -> (tempfile::TempDir, Arc<Database>, i64) {
        let (dir, db) = test_db().await;
        let backend = db.create_backend("home", "").await.unwrap();
        db.write_batch(backend, &updates()).await.unwrap();
        (dir, Arc::new(db), backend)
    }

    /// List reads over the seeded store, with caching off.
    fn lists(db: &Arc<Database>) -> StatsService {
        let mut config = Config::default();
        config.cache.enabled = false;
        StatsService::new(db.clone(), &config).unwrap()
    }

    fn short_range() -> Option<TimeRange> {
        resolve_range(Some("2023-11-14T22:00:00Z"), Some("2023-11-14T22:30:00Z"))
    }

    #[tokio::test]
    async fn test_cumulative_and_ranged_domains_share_shape() {
        let (_dir, db, backend) = seeded().await;
        let options = ListOptions::default();

        let all = lists(&db)
            .get_domain_stats(backend, None, &RangeFilter::default(), &options)
            .await
            .unwrap();
        assert_eq!(all.total, 3);
        assert_eq!(all.data[0].domain, "a.com");
        assert_eq!(all.data[0].totals.total_upload, 150);
        assert_eq!(all.data[0].ips, vec!["1.1.1.1"]);
        assert_eq!(all.data[0].chains, vec!["ProxyA > GroupB > RuleX"]);

        let ranged = lists(&db)
            .get_domain_stats(backend, short_range(), &RangeFilter::default(), &options)
            .await
            .unwrap();
        assert_eq!(ranged.total, 2);
        assert_eq!(ranged.data[0], DomainStats {
            last_seen: ranged.data[0].last_seen,
            ..all.data[0].clone()
        });
        assert_eq!(
            ranged.data[0].last_seen.map(|t| t.to_rfc3339()),
            Some("2023-11-14T22:13:00+00:00".to_string())
        );
    }

    #[tokio::test]
    async fn test_summary_paths_agree_on_totals() {
        let (_dir, db, backend) = seeded().await;
        let cumulative = db.get_summary(backend, None, &RangeFilter::default()).await.unwrap();
        assert_eq!(cumulative.totals.total_upload, 156);
        assert_eq!(cumulative.unique_domains, 3);
        assert_eq!(cumulative.unique_devices, 2);

        let wide = resolve_range(Some("2023-11-14T00:00:00Z"), Some("2023-11-15T06:00:00Z"));
        let ranged = db.get_summary(backend, wide, &RangeFilter::default()).await.unwrap();
        assert_eq!(ranged, cumulative);

        let device = RangeFilter {
            source_ip: Some("10.0.0.2".into()),
            chain: None,
        };
        let filtered = db.get_summary(backend, None, &device).await.unwrap();
        assert_eq!(filtered.totals.total_upload, 150);
        assert_eq!(filtered.unique_domains, 1);
    }

    #[tokio::test]
    async fn test_rule_rows_carry_final_proxy_in_both_paths() {
        let (_dir, db, backend) = seeded().await;
        for range in [None, short_range()] {
            let rules = lists(&db)
                .get_rule_stats(backend, range, &RangeFilter::default(), &ListOptions::default())
                .await
                .unwrap();
            let rule_x = rules.data.iter().find(|r| r.rule == "RuleX").unwrap();
            assert_eq!(rule_x.final_proxy, "ProxyA");
            assert_eq!(rule_x.totals.total_download, 210);
        }
    }

    #[tokio::test]
    async fn test_proxy_filter_matches_chain_prefix() {
        let (_dir, db, backend) = seeded().await;
        for (chain, expected) in [
            ("ProxyA", vec!["a.com"]),
            ("ProxyA > GroupB", vec!["a.com"]),
            ("ProxyC > RuleY", vec!["b.com"]),
            ("Proxy", vec![]),
        ] {
            let filter = RangeFilter {
                source_ip: None,
                chain: Some(chain.into()),
            };
            for range in [None, short_range()] {
                let domains = lists(&db)
                    .get_domain_stats(backend, range, &filter, &ListOptions::default())
                    .await
                    .unwrap();
                let names: Vec<&str> = domains.data.iter().map(|d| d.domain.as_str()).collect();
                assert_eq!(names, expected, "{chain}");
            }
        }
    }

    #[tokio::test]
    async fn test_drill_downs() {
        let (_dir, db, backend) = seeded().await;
        let options = ListOptions::default();
        for range in [None, short_range()] {
            let domains = lists(&db).get_domains_for_rule(backend, "RuleX", range, &options).await.unwrap();
            assert_eq!(domains.data.len(), 1);
            assert_eq!(domains.data[0].totals.total_upload, 150);

            let ips = lists(&db).get_ips_for_device(backend, "10.0.0.3", range, &options).await.unwrap();
            assert_eq!(ips.data[0].ip, "2.2.2.2");

            let proxies = lists(&db).get_proxies_for_rule(backend, "RuleY", range, &options).await.unwrap();
            assert_eq!(proxies.data[0].chain, "ProxyC > RuleY");

            let ips = lists(&db).get_ips_for_proxy(backend, "ProxyC > RuleY", range, &options).await.unwrap();
            assert_eq!(ips.total, 1);
        }
        let unknown = lists(&db).get_domains_for_rule(backend, "Nope", None, &options).await.unwrap();
        assert_eq!(unknown, Page::empty());
    }

    #[tokio::test]
    async fn test_pagination_search_and_sort() {
        let (_dir, db, backend) = seeded().await;
        let filter = RangeFilter::default();
        let options = ListOptions {
            limit: Some(1),
            offset: 1,
            ..Default::default()
        };
        let page = lists(&db).get_domain_stats(backend, None, &filter, &options).await.unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.data.len(), 1);
        assert_eq!(page.data[0].domain, "b.com");

        let options = ListOptions {
            search: Some("C.CO".into()),
            ..Default::default()
        };
        let page = lists(&db).get_domain_stats(backend, None, &filter, &options).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.data[0].domain, "c.com");

        let options = ListOptions {
            sort_by: Some("key".into()),
            ascending: true,
            ..Default::default()
        };
        let page = lists(&db).get_devices(backend, None, &options).await.unwrap();
        let devices: Vec<_> = page.data.iter().map(|d| d.source_ip.as_str()).collect();
        assert_eq!(devices, vec!["10.0.0.2", "10.0.0.3"]);
    }

    #[tokio::test]
    async fn test_traffic_in_range_and_trend() {
        let (_dir, db, backend) = seeded().await;
        let range = short_range().unwrap();
        let totals = db.get_traffic_in_range(backend, &range).await.unwrap();
        assert_eq!(totals.total_upload, 155);

        let trend = db.get_traffic_trend(backend, &range, 5).await.unwrap();
        assert_eq!(trend.len(), 1);
        assert_eq!(trend[0].time.to_rfc3339(), "2023-11-14T22:10:00+00:00");
        assert_eq!(trend[0].connections, 3);
    }

    #[tokio::test]
    async fn test_country_stats_paths() {
        let (_dir, db, backend) = seeded().await;
        let updates = vec![
            CountryUpdate {
                country: "JP".into(),
                country_name: "Japan".into(),
                continent: "AS".into(),
                upload: 10,
                download: 20,
                timestamp_ms: Some(T0),
            },
            CountryUpdate {
                country: "US".into(),
                country_name: "United States".into(),
                continent: "NA".into(),
                upload: 1,
                download: 1,
                timestamp_ms: Some(T0 + 3 * 3_600_000),
            },
        ];
        db.write_country_batch(backend, &updates).await.unwrap();

        let all = db.get_country_stats(backend, None, &ListOptions::default()).await.unwrap();
        assert_eq!(all.total, 2);
        assert_eq!(all.data[0].country_name, "Japan");

        let ranged = db
            .get_country_stats(backend, short_range(), &ListOptions::default())
            .await
            .unwrap();
        assert_eq!(ranged.total, 1);
        assert_eq!(ranged.data[0].continent, "AS");
    }

    #[tokio::test]
    async fn test_rule_chain_rows_and_proxy_map() {
        let (_dir, db, backend) = seeded().await;
        let rows = db.get_rule_chain_rows(backend, None).await.unwrap();
        assert!(rows.contains(&RuleChainRow::new("RuleX", "ProxyA > GroupB > RuleX", 150, 210, 2)));
        let ranged = db.get_rule_chain_rows(backend, short_range()).await.unwrap();
        assert_eq!(ranged.len(), 2);

        let links = db.get_rule_proxy_map(backend).await.unwrap();
        let link = links.iter().find(|l| l.rule == "RuleX").unwrap();
        assert_eq!(link.proxy, "ProxyA");
        assert_eq!(link.totals.total_connections, 2);
    }
}
