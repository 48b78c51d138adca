//! Read service: cache, ClickHouse routing and local fallback
//!
//! Every read the store offers goes through [`StatsService`]. Ranged reads
//! are memoized in the [`RangeQueryCache`]; wide ranges can be answered by
//! the ClickHouse mirror when it is configured, with SQLite as the fallback.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::cache::RangeQueryCache;
use crate::chain_flow::{flow_rows, ChainFlowGraph};
use crate::clickhouse::ClickHouseReader;
use crate::config::{ClickHouseConfig, Config, RetentionConfig, StatsSource};
use crate::db::retention::start_retention_task;
use crate::db::{Database, Dimension, DimensionQuery, DimensionRecord, ListOptions, RangeFilter, Scope, TimeRange};
use crate::error::Result;
use crate::model::{
    CleanupResult, CountryStats, DeviceStats, DomainStats, IpStats, Page, ProxyStats, RuleChainRow, RuleProxyLink,
    RuleStats, Summary, TrafficTotals, TrendPoint,
};

#[derive(Serialize)]
struct ListArgs<'a> {
    dimension: Dimension,
    scope: &'a Scope,
    filter: &'a RangeFilter,
    options: &'a ListOptions,
    remote: bool,
}

pub struct StatsService {
    db: Arc<Database>,
    cache: Arc<RangeQueryCache>,
    clickhouse: Option<ClickHouseReader>,
    routing: ClickHouseConfig,
}

impl StatsService {
    pub fn new(db: Arc<Database>, config: &Config) -> Result<Self> {
        let clickhouse = if config.clickhouse_enabled() {
            Some(ClickHouseReader::new(&config.clickhouse)?)
        } else {
            None
        };
        Ok(Self {
            db,
            cache: Arc::new(RangeQueryCache::new(&config.cache)),
            clickhouse,
            routing: config.clickhouse.clone(),
        })
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn cache(&self) -> &Arc<RangeQueryCache> {
        &self.cache
    }

    /// The ClickHouse reader a ranged read should try first, if any.
    pub(crate) fn remote_for(&self, range: Option<&TimeRange>) -> Option<&ClickHouseReader> {
        let reader = self.clickhouse.as_ref()?;
        let range = range?;
        match self.routing.source {
            StatsSource::Local => None,
            StatsSource::Clickhouse => Some(reader),
            StatsSource::Auto => (range.width() >= chrono::Duration::hours(self.routing.min_range_hours)).then_some(reader),
        }
    }

    /// Await `remote` when present; on failure log and run `local` instead,
    /// unless strict routing is on.
    async fn with_fallback<T, R, L>(&self, operation: &'static str, remote: Option<R>, local: L) -> Result<T>
    where
        R: Future<Output = Result<T>>,
        L: Future<Output = Result<T>>,
    {
        if let Some(remote) = remote {
            match remote.await {
                Ok(value) => return Ok(value),
                Err(e) if self.routing.strict => return Err(e),
                Err(e) => warn!(operation, "ClickHouse read failed, falling back to SQLite: {}", e),
            }
        }
        local.await
    }

    #[allow(clippy::too_many_arguments)]
    async fn list(
        &self,
        operation: &'static str,
        backend_id: i64,
        dimension: Dimension,
        scope: Scope,
        range: Option<TimeRange>,
        filter: &RangeFilter,
        options: &ListOptions,
    ) -> Result<Page<DimensionRecord>> {
        let remote = self.remote_for(range.as_ref());
        let args = ListArgs {
            dimension,
            scope: &scope,
            filter,
            options,
            remote: remote.is_some(),
        };
        let scope = &scope;
        self.cache
            .get_or_load(operation, backend_id, &args, range.as_ref(), move || async move {
                let remote = match (remote, range.as_ref()) {
                    (Some(reader), Some(r)) => Some(reader.dimension_page(backend_id, dimension, scope, r, filter, options)),
                    _ => None,
                };
                let query = DimensionQuery::plan(dimension, scope.clone(), range, filter);
                let local = self.db.dimension_page(backend_id, &query, options);
                self.with_fallback(operation, remote, local).await
            })
            .await
    }

    pub async fn get_summary(&self, backend_id: i64, range: Option<TimeRange>, filter: &RangeFilter) -> Result<Summary> {
        let remote = self.remote_for(range.as_ref());
        let args = (filter, remote.is_some());
        self.cache
            .get_or_load("summary", backend_id, &args, range.as_ref(), move || async move {
                let remote = match (remote, range.as_ref()) {
                    (Some(reader), Some(r)) => Some(reader.summary(backend_id, r, filter)),
                    _ => None,
                };
                self.with_fallback("summary", remote, self.db.get_summary(backend_id, range, filter))
                    .await
            })
            .await
    }

    pub async fn get_domain_stats(
        &self,
        backend_id: i64,
        range: Option<TimeRange>,
        filter: &RangeFilter,
        options: &ListOptions,
    ) -> Result<Page<DomainStats>> {
        let page = self
            .list("domains", backend_id, Dimension::Domain, Scope::All, range, filter, options)
            .await?;
        Ok(page.map(DimensionRecord::into_domain))
    }

    /// IP rows are decorated after the cache so ASN updates show up at once.
    pub async fn get_ip_stats(
        &self,
        backend_id: i64,
        range: Option<TimeRange>,
        filter: &RangeFilter,
        options: &ListOptions,
    ) -> Result<Page<IpStats>> {
        let page = self
            .list("ips", backend_id, Dimension::Ip, Scope::All, range, filter, options)
            .await?;
        self.db.decorate_ip_page(backend_id, page).await
    }

    pub async fn get_proxy_stats(
        &self,
        backend_id: i64,
        range: Option<TimeRange>,
        filter: &RangeFilter,
        options: &ListOptions,
    ) -> Result<Page<ProxyStats>> {
        let page = self
            .list("proxies", backend_id, Dimension::Proxy, Scope::All, range, filter, options)
            .await?;
        Ok(page.map(DimensionRecord::into_proxy))
    }

    pub async fn get_rule_stats(
        &self,
        backend_id: i64,
        range: Option<TimeRange>,
        filter: &RangeFilter,
        options: &ListOptions,
    ) -> Result<Page<RuleStats>> {
        let page = self
            .list("rules", backend_id, Dimension::Rule, Scope::All, range, filter, options)
            .await?;
        Ok(page.map(DimensionRecord::into_rule))
    }

    pub async fn get_devices(&self, backend_id: i64, range: Option<TimeRange>, options: &ListOptions) -> Result<Page<DeviceStats>> {
        let page = self
            .list("devices", backend_id, Dimension::Device, Scope::All, range, &RangeFilter::default(), options)
            .await?;
        Ok(page.map(DimensionRecord::into_device))
    }

    async fn drill_down(
        &self,
        operation: &'static str,
        backend_id: i64,
        dimension: Dimension,
        scope: Scope,
        range: Option<TimeRange>,
        options: &ListOptions,
    ) -> Result<Page<DimensionRecord>> {
        self.list(operation, backend_id, dimension, scope, range, &RangeFilter::default(), options)
            .await
    }

    pub async fn get_domains_for_rule(
        &self,
        backend_id: i64,
        rule: &str,
        range: Option<TimeRange>,
        options: &ListOptions,
    ) -> Result<Page<DomainStats>> {
        let page = self
            .drill_down("rule_domains", backend_id, Dimension::Domain, Scope::Rule(rule.to_string()), range, options)
            .await?;
        Ok(page.map(DimensionRecord::into_domain))
    }

    pub async fn get_ips_for_rule(
        &self,
        backend_id: i64,
        rule: &str,
        range: Option<TimeRange>,
        options: &ListOptions,
    ) -> Result<Page<IpStats>> {
        let page = self
            .drill_down("rule_ips", backend_id, Dimension::Ip, Scope::Rule(rule.to_string()), range, options)
            .await?;
        self.db.decorate_ip_page(backend_id, page).await
    }

    pub async fn get_proxies_for_rule(
        &self,
        backend_id: i64,
        rule: &str,
        range: Option<TimeRange>,
        options: &ListOptions,
    ) -> Result<Page<ProxyStats>> {
        let page = self
            .drill_down("rule_proxies", backend_id, Dimension::Proxy, Scope::Rule(rule.to_string()), range, options)
            .await?;
        Ok(page.map(DimensionRecord::into_proxy))
    }

    pub async fn get_domains_for_proxy(
        &self,
        backend_id: i64,
        chain: &str,
        range: Option<TimeRange>,
        options: &ListOptions,
    ) -> Result<Page<DomainStats>> {
        let page = self
            .drill_down("proxy_domains", backend_id, Dimension::Domain, Scope::Proxy(chain.to_string()), range, options)
            .await?;
        Ok(page.map(DimensionRecord::into_domain))
    }

    pub async fn get_ips_for_proxy(
        &self,
        backend_id: i64,
        chain: &str,
        range: Option<TimeRange>,
        options: &ListOptions,
    ) -> Result<Page<IpStats>> {
        let page = self
            .drill_down("proxy_ips", backend_id, Dimension::Ip, Scope::Proxy(chain.to_string()), range, options)
            .await?;
        self.db.decorate_ip_page(backend_id, page).await
    }

    pub async fn get_domains_for_device(
        &self,
        backend_id: i64,
        source_ip: &str,
        range: Option<TimeRange>,
        options: &ListOptions,
    ) -> Result<Page<DomainStats>> {
        let page = self
            .drill_down("device_domains", backend_id, Dimension::Domain, Scope::Device(source_ip.to_string()), range, options)
            .await?;
        Ok(page.map(DimensionRecord::into_domain))
    }

    pub async fn get_ips_for_device(
        &self,
        backend_id: i64,
        source_ip: &str,
        range: Option<TimeRange>,
        options: &ListOptions,
    ) -> Result<Page<IpStats>> {
        let page = self
            .drill_down("device_ips", backend_id, Dimension::Ip, Scope::Device(source_ip.to_string()), range, options)
            .await?;
        self.db.decorate_ip_page(backend_id, page).await
    }

    pub async fn get_country_stats(
        &self,
        backend_id: i64,
        range: Option<TimeRange>,
        options: &ListOptions,
    ) -> Result<Page<CountryStats>> {
        let remote = self.remote_for(range.as_ref());
        let args = (options, remote.is_some());
        self.cache
            .get_or_load("countries", backend_id, &args, range.as_ref(), move || async move {
                let remote = match (remote, range.as_ref()) {
                    (Some(reader), Some(r)) => Some(reader.countries(backend_id, r, options)),
                    _ => None,
                };
                self.with_fallback("countries", remote, self.db.get_country_stats(backend_id, range, options))
                    .await
            })
            .await
    }

    pub async fn get_traffic_in_range(&self, backend_id: i64, range: &TimeRange) -> Result<TrafficTotals> {
        self.cache
            .get_or_load("traffic_in_range", backend_id, &(), Some(range), move || {
                self.db.get_traffic_in_range(backend_id, range)
            })
            .await
    }

    pub async fn get_traffic_trend(&self, backend_id: i64, range: &TimeRange, bucket_minutes: u32) -> Result<Vec<TrendPoint>> {
        self.cache
            .get_or_load("traffic_trend", backend_id, &bucket_minutes, Some(range), move || {
                self.db.get_traffic_trend(backend_id, range, bucket_minutes)
            })
            .await
    }

    pub async fn get_rule_proxy_map(&self, backend_id: i64) -> Result<Vec<RuleProxyLink>> {
        self.db.get_rule_proxy_map(backend_id).await
    }

    async fn rule_chain_rows(&self, backend_id: i64, range: Option<TimeRange>) -> Result<Vec<RuleChainRow>> {
        let remote = match (self.remote_for(range.as_ref()), range.as_ref()) {
            (Some(reader), Some(r)) => Some(reader.rule_chain_rows(backend_id, r)),
            _ => None,
        };
        self.with_fallback("rule_chain_rows", remote, self.db.get_rule_chain_rows(backend_id, range))
            .await
    }

    async fn flow_graph(&self, backend_id: i64, rule: Option<&str>, range: Option<TimeRange>) -> Result<ChainFlowGraph> {
        let remote = self.remote_for(range.as_ref()).is_some();
        self.cache
            .get_or_load("chain_flow", backend_id, &(rule, remote), range.as_ref(), move || async move {
                let baseline = self.db.get_rule_chain_rows(backend_id, None).await?;
                let ranged = match range {
                    Some(range) => Some(self.rule_chain_rows(backend_id, Some(range)).await?),
                    None => None,
                };
                let mut rows = flow_rows(ranged.as_deref(), &baseline);
                if let Some(rule) = rule {
                    rows.retain(|row| row.rule == rule);
                }
                Ok(ChainFlowGraph::build(&rows))
            })
            .await
    }

    pub async fn get_all_rule_chain_flows(&self, backend_id: i64, range: Option<TimeRange>) -> Result<ChainFlowGraph> {
        self.flow_graph(backend_id, None, range).await
    }

    pub async fn get_rule_chain_flow(&self, backend_id: i64, rule: &str, range: Option<TimeRange>) -> Result<ChainFlowGraph> {
        self.flow_graph(backend_id, Some(rule), range).await
    }

    /// Delete traffic data and drop every cached read it could affect.
    pub async fn cleanup(&self, backend_id: Option<i64>, days: u32) -> Result<CleanupResult> {
        let result = self.db.cleanup(backend_id, days).await?;
        match backend_id {
            Some(id) => self.cache.invalidate_backend(id).await,
            None => self.invalidate_all().await?,
        }
        Ok(result)
    }

    pub async fn delete_backend(&self, backend_id: i64) -> Result<bool> {
        let deleted = self.db.delete_backend(backend_id).await?;
        self.cache.invalidate_backend(backend_id).await;
        Ok(deleted)
    }

    async fn invalidate_all(&self) -> Result<()> {
        for id in self.db.list_backend_ids().await? {
            self.cache.invalidate_backend(id).await;
        }
        self.cache.clear().await;
        Ok(())
    }

    /// Spawn the periodic retention pass; the cache is cleared after any
    /// pass that deleted rows.
    pub fn start_retention(&self, defaults: RetentionConfig) -> JoinHandle<()> {
        let cache = self.cache.clone();
        start_retention_task(self.db.clone(), defaults, move |_| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.clear().await });
        })
    }
}
