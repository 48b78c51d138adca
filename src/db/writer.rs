//! Batched upserts of pre-aggregated traffic
//!
//! A flush is one [`BatchAggregate`] written under the database write gate.
//! Counters accumulate in SQL (`ON CONFLICT DO UPDATE`); string-set columns
//! are read, merged in memory and written back inside the same transaction.
//! Each phase (core counters, detail and bucket tables, device tables) commits
//! on its own, and long phases are split further into sub-transactions of at
//! most `max_rows_per_transaction` upserts so readers are never starved. A
//! failing phase rolls back alone; phases already committed stay.

use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use sqlx::sqlite::SqliteArguments;
use sqlx::{Pool, Row, Sqlite, SqliteConnection, Transaction};
use tracing::debug;

use super::Database;
use crate::aggregate::{BatchAggregate, CountryAggregate, CountryRow, Counter, DimensionRow, StringSet};
use crate::error::Result;
use crate::model::{CountryUpdate, TrafficUpdate};

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// Outcome of one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushStats {
    /// Updates that carried traffic
    pub events: usize,
    /// Zero-byte updates discarded before aggregation
    pub dropped: usize,
    pub rows: usize,
    pub transactions: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SetColumn {
    Ips,
    Domains,
    Rules,
    Chains,
}

impl SetColumn {
    fn column(self) -> &'static str {
        match self {
            SetColumn::Ips => "ips",
            SetColumn::Domains => "domains",
            SetColumn::Rules => "rules",
            SetColumn::Chains => "chains",
        }
    }

    fn of(self, row: &DimensionRow) -> &StringSet {
        match self {
            SetColumn::Ips => &row.ips,
            SetColumn::Domains => &row.domains,
            SetColumn::Rules => &row.rules,
            SetColumn::Chains => &row.chains,
        }
    }

    fn of_mut(self, row: &mut DimensionRow) -> &mut StringSet {
        match self {
            SetColumn::Ips => &mut row.ips,
            SetColumn::Domains => &mut row.domains,
            SetColumn::Rules => &mut row.rules,
            SetColumn::Chains => &mut row.chains,
        }
    }
}

/// Upsert into a cumulative table, with the read used to merge its sets.
pub(crate) struct Upsert {
    sql: String,
    select_sets: Option<String>,
    sets: &'static [SetColumn],
}

impl Upsert {
    fn cumulative(table: &str, keys: &[&str], sets: &'static [SetColumn]) -> Self {
        let mut columns = vec!["backend_id"];
        columns.extend_from_slice(keys);
        columns.extend_from_slice(&["total_upload", "total_download", "total_connections", "last_seen"]);
        columns.extend(sets.iter().map(|s| s.column()));

        let conflict = std::iter::once("backend_id")
            .chain(keys.iter().copied())
            .collect::<Vec<_>>()
            .join(", ");

        let mut assignments = vec![
            "total_upload = total_upload + excluded.total_upload".to_string(),
            "total_download = total_download + excluded.total_download".to_string(),
            "total_connections = total_connections + excluded.total_connections".to_string(),
            "last_seen = MAX(last_seen, excluded.last_seen)".to_string(),
        ];
        assignments.extend(sets.iter().map(|s| format!("{0} = excluded.{0}", s.column())));

        let sql = format!(
            "INSERT INTO {table} ({}) VALUES ({}) ON CONFLICT({conflict}) DO UPDATE SET {}",
            columns.join(", "),
            vec!["?"; columns.len()].join(", "),
            assignments.join(", ")
        );

        let select_sets = (!sets.is_empty()).then(|| {
            let projection = sets.iter().map(|s| s.column()).collect::<Vec<_>>().join(", ");
            let filter: String = keys.iter().map(|k| format!(" AND {k} = ?")).collect();
            format!("SELECT {projection} FROM {table} WHERE backend_id = ?{filter}")
        });

        Self {
            sql,
            select_sets,
            sets,
        }
    }
}

fn fact_upsert(table: &str, labels: &[&str]) -> String {
    let mut columns = vec!["backend_id", "bucket"];
    columns.extend_from_slice(labels);
    let conflict = columns.join(", ");
    columns.extend_from_slice(&["upload", "download", "connections"]);
    format!(
        "INSERT INTO {table} ({}) VALUES ({}) ON CONFLICT({conflict}) DO UPDATE SET \
         upload = upload + excluded.upload, download = download + excluded.download, \
         connections = connections + excluded.connections",
        columns.join(", "),
        vec!["?"; columns.len()].join(", ")
    )
}

fn country_fact_upsert(table: &str) -> String {
    format!(
        "INSERT INTO {table} (backend_id, bucket, country, country_name, continent, upload, download, connections) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) ON CONFLICT(backend_id, bucket, country) DO UPDATE SET \
         country_name = CASE WHEN excluded.country_name != '' THEN excluded.country_name ELSE {table}.country_name END, \
         continent = CASE WHEN excluded.continent != '' THEN excluded.continent ELSE {table}.continent END, \
         upload = upload + excluded.upload, download = download + excluded.download, \
         connections = connections + excluded.connections"
    )
}

const RULE_UPSERT: &str = r#"
INSERT INTO rule_stats (backend_id, rule, total_upload, total_download, total_connections, last_seen, final_proxy)
VALUES (?, ?, ?, ?, ?, ?, ?)
ON CONFLICT(backend_id, rule) DO UPDATE SET
    final_proxy = CASE WHEN excluded.last_seen >= rule_stats.last_seen THEN excluded.final_proxy ELSE rule_stats.final_proxy END,
    total_upload = total_upload + excluded.total_upload,
    total_download = total_download + excluded.total_download,
    total_connections = total_connections + excluded.total_connections,
    last_seen = MAX(last_seen, excluded.last_seen)
"#;

const COUNTRY_UPSERT: &str = r#"
INSERT INTO country_stats (backend_id, country, total_upload, total_download, total_connections, last_seen, country_name, continent)
VALUES (?, ?, ?, ?, ?, ?, ?, ?)
ON CONFLICT(backend_id, country) DO UPDATE SET
    country_name = CASE WHEN excluded.country_name != '' THEN excluded.country_name ELSE country_stats.country_name END,
    continent = CASE WHEN excluded.continent != '' THEN excluded.continent ELSE country_stats.continent END,
    total_upload = total_upload + excluded.total_upload,
    total_download = total_download + excluded.total_download,
    total_connections = total_connections + excluded.total_connections,
    last_seen = MAX(last_seen, excluded.last_seen)
"#;

const FACT_LABELS: &[&str] = &["domain", "ip", "source_ip", "chain", "rule"];

/// SQL for every table the writer touches, built once per database handle.
pub(crate) struct Statements {
    domain: Upsert,
    ip: Upsert,
    proxy: Upsert,
    device: Upsert,
    rule_proxy: Upsert,
    rule_chain: Upsert,
    rule_domain: Upsert,
    rule_ip: Upsert,
    domain_proxy: Upsert,
    ip_proxy: Upsert,
    device_domain: Upsert,
    device_ip: Upsert,
    minute: String,
    hour: String,
    minute_fact: String,
    hour_fact: String,
    minute_country: String,
    hour_country: String,
}

impl Statements {
    pub(crate) fn compile() -> Self {
        Self {
            domain: Upsert::cumulative(
                "domain_stats",
                &["domain"],
                &[SetColumn::Ips, SetColumn::Rules, SetColumn::Chains],
            ),
            ip: Upsert::cumulative("ip_stats", &["ip"], &[SetColumn::Domains, SetColumn::Chains]),
            proxy: Upsert::cumulative("proxy_stats", &["chain"], &[]),
            device: Upsert::cumulative("device_stats", &["source_ip"], &[]),
            rule_proxy: Upsert::cumulative("rule_proxy_map", &["rule", "proxy"], &[]),
            rule_chain: Upsert::cumulative("rule_chain_traffic", &["rule", "chain"], &[]),
            rule_domain: Upsert::cumulative("rule_domain_traffic", &["rule", "domain"], &[]),
            rule_ip: Upsert::cumulative("rule_ip_traffic", &["rule", "ip"], &[]),
            domain_proxy: Upsert::cumulative("domain_proxy_stats", &["domain", "chain"], &[]),
            ip_proxy: Upsert::cumulative("ip_proxy_stats", &["ip", "chain"], &[SetColumn::Domains]),
            device_domain: Upsert::cumulative("device_domain_stats", &["source_ip", "domain"], &[]),
            device_ip: Upsert::cumulative("device_ip_stats", &["source_ip", "ip"], &[]),
            minute: fact_upsert("minute_stats", &[]),
            hour: fact_upsert("hourly_stats", &[]),
            minute_fact: fact_upsert("minute_dim_stats", FACT_LABELS),
            hour_fact: fact_upsert("hourly_dim_stats", FACT_LABELS),
            minute_country: country_fact_upsert("minute_country_stats"),
            hour_country: country_fact_upsert("hourly_country_stats"),
        }
    }
}

/// Saturating conversion for SQLite's signed INTEGER columns.
fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn bind_counter<'q>(query: SqliteQuery<'q>, counter: &Counter) -> SqliteQuery<'q> {
    query
        .bind(to_i64(counter.upload))
        .bind(to_i64(counter.download))
        .bind(to_i64(counter.connections))
}

/// Transaction that commits and reopens every `limit` upserts.
struct ChunkedTx<'a> {
    pool: &'a Pool<Sqlite>,
    tx: Option<Transaction<'static, Sqlite>>,
    limit: usize,
    pending: usize,
    rows: usize,
    transactions: usize,
}

impl<'a> ChunkedTx<'a> {
    fn new(pool: &'a Pool<Sqlite>, limit: usize) -> Self {
        Self {
            pool,
            tx: None,
            limit: limit.max(1),
            pending: 0,
            rows: 0,
            transactions: 0,
        }
    }

    async fn conn(&mut self) -> Result<&mut SqliteConnection> {
        let tx = match self.tx.take() {
            Some(tx) => tx,
            None => {
                self.transactions += 1;
                self.pool.begin().await?
            }
        };
        Ok(&mut **self.tx.insert(tx))
    }

    async fn row_written(&mut self) -> Result<()> {
        self.pending += 1;
        self.rows += 1;
        if self.pending >= self.limit {
            if let Some(tx) = self.tx.take() {
                tx.commit().await?;
            }
            self.pending = 0;
        }
        Ok(())
    }

    /// Close the current phase; the next upsert opens a new sub-transaction.
    async fn commit_phase(&mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.commit().await?;
        }
        self.pending = 0;
        Ok(())
    }

    /// Commit the open sub-transaction; returns `(rows, transactions)`.
    async fn finish(mut self) -> Result<(usize, usize)> {
        if let Some(tx) = self.tx.take() {
            tx.commit().await?;
        }
        Ok((self.rows, self.transactions))
    }

    async fn upsert(&mut self, upsert: &Upsert, backend_id: i64, keys: &[&str], row: &DimensionRow) -> Result<()> {
        let conn = self.conn().await?;

        let mut merged = DimensionRow::default();
        if let Some(select) = &upsert.select_sets {
            let mut query = sqlx::query(select).bind(backend_id);
            for key in keys {
                query = query.bind(*key);
            }
            if let Some(existing) = query.fetch_optional(&mut *conn).await? {
                for (idx, set) in upsert.sets.iter().enumerate() {
                    let encoded: String = existing.try_get(idx)?;
                    *set.of_mut(&mut merged) = StringSet::parse(&encoded);
                }
            }
            merged = DimensionRow::apply(Some(&merged), row);
        }

        let mut query = sqlx::query(&upsert.sql).bind(backend_id);
        for key in keys {
            query = query.bind(*key);
        }
        query = bind_counter(query, &row.counter).bind(row.counter.last_seen_ms);
        for set in upsert.sets {
            query = query.bind(set.of(&merged).encode());
        }
        query.execute(&mut *conn).await?;
        self.row_written().await
    }

    async fn upsert_counter(&mut self, upsert: &Upsert, backend_id: i64, keys: &[&str], counter: &Counter) -> Result<()> {
        let row = DimensionRow {
            counter: *counter,
            ..Default::default()
        };
        self.upsert(upsert, backend_id, keys, &row).await
    }

    async fn upsert_fact(&mut self, sql: &str, backend_id: i64, bucket: &str, labels: &[&str], counter: &Counter) -> Result<()> {
        let conn = self.conn().await?;
        let mut query = sqlx::query(sql).bind(backend_id).bind(bucket);
        for label in labels {
            query = query.bind(*label);
        }
        bind_counter(query, counter).execute(&mut *conn).await?;
        self.row_written().await
    }

    async fn execute(&mut self, query: SqliteQuery<'_>) -> Result<()> {
        let conn = self.conn().await?;
        query.execute(&mut *conn).await?;
        self.row_written().await
    }
}

impl Database {
    /// Record a single traffic delta.
    pub async fn write(&self, backend_id: i64, update: &TrafficUpdate) -> Result<FlushStats> {
        self.write_batch(backend_id, std::slice::from_ref(update)).await
    }

    /// Pre-aggregate `updates` and apply them to every dimension, cross-reference
    /// and fact table of `backend_id`.
    pub async fn write_batch(&self, backend_id: i64, updates: &[TrafficUpdate]) -> Result<FlushStats> {
        let agg = BatchAggregate::from_updates(updates, Utc::now().timestamp_millis());
        if agg.is_empty() {
            return Ok(FlushStats {
                dropped: agg.dropped,
                ..Default::default()
            });
        }

        let started = Instant::now();
        let _guard = self.write_gate.lock().await;
        let mut chunk = ChunkedTx::new(&self.pool, self.max_rows_per_transaction);
        self.write_core(&mut chunk, backend_id, &agg).await?;
        chunk.commit_phase().await?;
        self.write_details(&mut chunk, backend_id, &agg).await?;
        chunk.commit_phase().await?;
        self.write_devices(&mut chunk, backend_id, &agg).await?;
        let (rows, transactions) = chunk.finish().await?;

        let stats = FlushStats {
            events: agg.accepted,
            dropped: agg.dropped,
            rows,
            transactions,
        };
        debug!(
            backend_id,
            events = stats.events,
            rows,
            transactions,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Flushed traffic batch"
        );
        Ok(stats)
    }

    /// Dimension rows, rule ownership and the overall buckets.
    async fn write_core(&self, chunk: &mut ChunkedTx<'_>, backend_id: i64, agg: &BatchAggregate) -> Result<()> {
        let s = &*self.statements;
        for (domain, row) in &agg.domains {
            chunk.upsert(&s.domain, backend_id, &[domain.as_str()], row).await?;
        }
        for (ip, row) in &agg.ips {
            chunk.upsert(&s.ip, backend_id, &[ip.as_str()], row).await?;
        }
        for (chain, counter) in &agg.proxies {
            chunk.upsert_counter(&s.proxy, backend_id, &[chain.as_str()], counter).await?;
        }
        for (rule, row) in &agg.rules {
            let query = bind_counter(sqlx::query(RULE_UPSERT).bind(backend_id).bind(rule.as_str()), &row.counter)
                .bind(row.counter.last_seen_ms)
                .bind(row.final_proxy.as_str());
            chunk.execute(query).await?;
        }
        for ((rule, proxy), counter) in &agg.rule_proxies {
            chunk.upsert_counter(&s.rule_proxy, backend_id, &[rule.as_str(), proxy.as_str()], counter).await?;
        }
        for (bucket, counter) in &agg.minutes {
            chunk.upsert_fact(&s.minute, backend_id, bucket, &[], counter).await?;
        }
        for (bucket, counter) in &agg.hours {
            chunk.upsert_fact(&s.hour, backend_id, bucket, &[], counter).await?;
        }
        Ok(())
    }

    /// Cross-reference tables and dimensional facts.
    async fn write_details(&self, chunk: &mut ChunkedTx<'_>, backend_id: i64, agg: &BatchAggregate) -> Result<()> {
        let s = &*self.statements;
        for (table, rows) in [
            (&s.rule_chain, &agg.rule_chains),
            (&s.rule_domain, &agg.rule_domains),
            (&s.rule_ip, &agg.rule_ips),
            (&s.domain_proxy, &agg.domain_proxies),
        ] {
            for ((a, b), counter) in rows {
                chunk.upsert_counter(table, backend_id, &[a.as_str(), b.as_str()], counter).await?;
            }
        }
        for ((ip, chain), row) in &agg.ip_proxies {
            chunk.upsert(&s.ip_proxy, backend_id, &[ip.as_str(), chain.as_str()], row).await?;
        }
        for (sql, facts) in [(&s.minute_fact, &agg.minute_facts), (&s.hour_fact, &agg.hour_facts)] {
            for (key, counter) in facts {
                let labels = [
                    key.domain.as_str(),
                    key.ip.as_str(),
                    key.source_ip.as_str(),
                    key.chain.as_str(),
                    key.rule.as_str(),
                ];
                chunk.upsert_fact(sql, backend_id, &key.bucket, &labels, counter).await?;
            }
        }
        Ok(())
    }

    async fn write_devices(&self, chunk: &mut ChunkedTx<'_>, backend_id: i64, agg: &BatchAggregate) -> Result<()> {
        let s = &*self.statements;
        for (source_ip, counter) in &agg.devices {
            chunk.upsert_counter(&s.device, backend_id, &[source_ip.as_str()], counter).await?;
        }
        for (table, rows) in [(&s.device_domain, &agg.device_domains), (&s.device_ip, &agg.device_ips)] {
            for ((source_ip, key), counter) in rows {
                chunk.upsert_counter(table, backend_id, &[source_ip.as_str(), key.as_str()], counter).await?;
            }
        }
        Ok(())
    }

    /// Apply country deltas to `country_stats` and the country buckets.
    pub async fn write_country_batch(&self, backend_id: i64, updates: &[CountryUpdate]) -> Result<FlushStats> {
        let agg = CountryAggregate::from_updates(updates, Utc::now().timestamp_millis());
        if agg.is_empty() {
            return Ok(FlushStats {
                dropped: updates.len(),
                ..Default::default()
            });
        }

        let _guard = self.write_gate.lock().await;
        let s = &*self.statements;
        let mut chunk = ChunkedTx::new(&self.pool, self.max_rows_per_transaction);
        for (country, row) in &agg.countries {
            let query = bind_counter(sqlx::query(COUNTRY_UPSERT).bind(backend_id).bind(country.as_str()), &row.counter)
                .bind(row.counter.last_seen_ms)
                .bind(row.country_name.as_str())
                .bind(row.continent.as_str());
            chunk.execute(query).await?;
        }
        for (sql, rows) in [(&s.minute_country, &agg.minutes), (&s.hour_country, &agg.hours)] {
            for ((bucket, country), row) in rows {
                chunk.execute(country_fact(sql, backend_id, bucket, country, row)).await?;
            }
        }
        let (rows, transactions) = chunk.finish().await?;

        let events: usize = agg.countries.values().map(|r| r.counter.connections as usize).sum();
        Ok(FlushStats {
            events,
            dropped: updates.len().saturating_sub(events),
            rows,
            transactions,
        })
    }
}

fn country_fact<'q>(sql: &'q str, backend_id: i64, bucket: &'q str, country: &'q str, row: &'q CountryRow) -> SqliteQuery<'q> {
    let query = sqlx::query(sql)
        .bind(backend_id)
        .bind(bucket)
        .bind(country)
        .bind(row.country_name.as_str())
        .bind(row.continent.as_str());
    bind_counter(query, &row.counter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::split_set;
    use crate::config::{DatabaseConfig, WriterConfig};
    use crate::db::tests::{count, test_db};
    use crate::db::{resolve_range, Dimension, DimensionQuery, ListOptions, RangeFilter, Scope};
    use tempfile::TempDir;

    fn scenario() -> Vec<TrafficUpdate> {
        vec![
            TrafficUpdate::new("a.com", "1.1.1.1", &["ProxyA", "GroupB", "RuleX"])
                .with_traffic(100, 200)
                .with_source_ip("10.0.0.2")
                .with_timestamp(1_700_000_000_000),
            TrafficUpdate::new("a.com", "1.1.1.1", &["ProxyA", "GroupB", "RuleX"])
                .with_traffic(50, 10)
                .with_source_ip("10.0.0.2")
                .with_timestamp(1_700_000_030_000),
            TrafficUpdate::new("b.com", "2.2.2.2", &["ProxyC", "RuleX"])
                .with_traffic(7, 9)
                .with_timestamp(1_700_000_090_000),
            TrafficUpdate::new("", "3.3.3.3", &["DIRECT"])
                .with_rule("Match", "")
                .with_traffic(1, 1)
                .with_timestamp(1_700_003_700_000),
        ]
    }

    async fn domain_row(db: &Database, backend_id: i64, domain: &str) -> (i64, i64, i64, i64, String) {
        sqlx::query_as(
            "SELECT total_upload, total_download, total_connections, last_seen, ips FROM domain_stats WHERE backend_id = ? AND domain = ?",
        )
        .bind(backend_id)
        .bind(domain)
        .fetch_one(db.pool())
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_write_accumulates_domain_and_rule() {
        let (_dir, db) = test_db().await;
        let backend = db.create_backend("home", "").await.unwrap();

        let stats = db.write_batch(backend, &scenario()[..2]).await.unwrap();
        assert_eq!(stats.events, 2);
        assert!(stats.transactions >= 1);

        let (up, down, conns, last_seen, ips) = domain_row(&db, backend, "a.com").await;
        assert_eq!((up, down, conns), (150, 210, 2));
        assert_eq!(last_seen, 1_700_000_030_000);
        assert_eq!(ips, "1.1.1.1");

        let (final_proxy, total): (String, i64) =
            sqlx::query_as("SELECT final_proxy, total_upload FROM rule_stats WHERE backend_id = ? AND rule = 'RuleX'")
                .bind(backend)
                .fetch_one(db.pool())
                .await
                .unwrap();
        assert_eq!(final_proxy, "ProxyA");
        assert_eq!(total, 150);

        let (chain_total,): (i64,) = sqlx::query_as(
            "SELECT total_download FROM rule_chain_traffic WHERE backend_id = ? AND rule = 'RuleX' AND chain = 'ProxyA > GroupB > RuleX'",
        )
        .bind(backend)
        .fetch_one(db.pool())
        .await
        .unwrap();
        assert_eq!(chain_total, 210);
        assert_eq!(count(&db, "device_stats", backend).await, 1);
    }

    #[tokio::test]
    async fn test_rule_final_proxy_follows_latest_write() {
        let (_dir, db) = test_db().await;
        let backend = db.create_backend("home", "").await.unwrap();
        let updates = scenario();
        db.write_batch(backend, &updates[..2]).await.unwrap();
        db.write(backend, &updates[2]).await.unwrap();

        let (final_proxy,): (String,) =
            sqlx::query_as("SELECT final_proxy FROM rule_stats WHERE backend_id = ? AND rule = 'RuleX'")
                .bind(backend)
                .fetch_one(db.pool())
                .await
                .unwrap();
        assert_eq!(final_proxy, "ProxyC");
    }

    #[tokio::test]
    async fn test_zero_traffic_batch_writes_nothing() {
        let (_dir, db) = test_db().await;
        let backend = db.create_backend("home", "").await.unwrap();
        let stats = db
            .write(backend, &TrafficUpdate::new("a.com", "1.1.1.1", &["P"]))
            .await
            .unwrap();
        assert_eq!(stats.events, 0);
        assert_eq!(stats.dropped, 1);
        assert_eq!(count(&db, "domain_stats", backend).await, 0);
        assert_eq!(count(&db, "minute_stats", backend).await, 0);
    }

    #[tokio::test]
    async fn test_order_of_batches_does_not_matter() {
        let (_dir, db) = test_db().await;
        let first = db.create_backend("first", "").await.unwrap();
        let second = db.create_backend("second", "").await.unwrap();
        let updates = scenario();

        db.write_batch(first, &updates).await.unwrap();
        for update in updates.iter().rev() {
            db.write(second, update).await.unwrap();
        }

        for domain in ["a.com", "b.com"] {
            let (u1, d1, c1, l1, _) = domain_row(&db, first, domain).await;
            let (u2, d2, c2, l2, _) = domain_row(&db, second, domain).await;
            assert_eq!((u1, d1, c1, l1), (u2, d2, c2, l2), "{domain}");
        }
        for table in ["rule_chain_traffic", "minute_dim_stats", "hourly_dim_stats", "ip_proxy_stats"] {
            assert_eq!(count(&db, table, first).await, count(&db, table, second).await, "{table}");
        }
    }

    #[tokio::test]
    async fn test_fact_totals_match_overall_buckets() {
        let (_dir, db) = test_db().await;
        let backend = db.create_backend("home", "").await.unwrap();
        db.write_batch(backend, &scenario()).await.unwrap();

        for (overall, facts) in [("minute_stats", "minute_dim_stats"), ("hourly_stats", "hourly_dim_stats")] {
            let (a,): (i64,) = sqlx::query_as(&format!(
                "SELECT SUM(upload + download) FROM {overall} WHERE backend_id = ?"
            ))
            .bind(backend)
            .fetch_one(db.pool())
            .await
            .unwrap();
            let (b,): (i64,) = sqlx::query_as(&format!(
                "SELECT SUM(upload + download) FROM {facts} WHERE backend_id = ?"
            ))
            .bind(backend)
            .fetch_one(db.pool())
            .await
            .unwrap();
            assert_eq!(a, b);
            assert_eq!(a, 150 + 210 + 16 + 2);
        }
        assert_eq!(count(&db, "hourly_stats", backend).await, 2);
    }

    #[tokio::test]
    async fn test_sets_merge_across_flushes() {
        let (_dir, db) = test_db().await;
        let backend = db.create_backend("home", "").await.unwrap();
        db.write(backend, &TrafficUpdate::new("a.com", "1.1.1.1", &["P"]).with_traffic(1, 1))
            .await
            .unwrap();
        db.write(backend, &TrafficUpdate::new("a.com", "9.9.9.9", &["P"]).with_traffic(1, 1))
            .await
            .unwrap();
        db.write(backend, &TrafficUpdate::new("a.com", "1.1.1.1", &["Q"]).with_traffic(1, 1))
            .await
            .unwrap();

        let (ips, chains): (String, String) =
            sqlx::query_as("SELECT ips, chains FROM domain_stats WHERE backend_id = ? AND domain = 'a.com'")
                .bind(backend)
                .fetch_one(db.pool())
                .await
                .unwrap();
        assert_eq!(split_set(&ips), vec!["1.1.1.1", "9.9.9.9"]);
        assert_eq!(split_set(&chains), vec!["P", "Q"]);
    }

    #[tokio::test]
    async fn test_small_transaction_limit_splits_flush() {
        let dir = TempDir::new().unwrap();
        let config = DatabaseConfig {
            url: dir.path().join("chunked.db").display().to_string(),
            ..Default::default()
        };
        let writer = WriterConfig {
            max_rows_per_transaction: 3,
            ..Default::default()
        };
        let db = Database::new(&config, &writer).await.unwrap();
        db.run_migrations().await.unwrap();
        let backend = db.create_backend("home", "").await.unwrap();

        let stats = db.write_batch(backend, &scenario()).await.unwrap();
        // Row chunks never span a phase boundary
        assert!(stats.transactions >= stats.rows.div_ceil(3));
        assert!(stats.transactions <= stats.rows.div_ceil(3) + 2);
        let (up,): (i64,) = sqlx::query_as("SELECT SUM(total_upload) FROM proxy_stats WHERE backend_id = ?")
            .bind(backend)
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(up, 158);
    }

    #[tokio::test]
    async fn test_flush_commits_each_phase() {
        let (_dir, db) = test_db().await;
        let backend = db.create_backend("home", "").await.unwrap();

        let stats = db.write_batch(backend, &scenario()[..2]).await.unwrap();
        assert_eq!(stats.transactions, 3);
    }

    #[tokio::test]
    async fn test_failed_device_phase_keeps_earlier_phases() {
        let (_dir, db) = test_db().await;
        let backend = db.create_backend("home", "").await.unwrap();
        sqlx::query("DROP TABLE device_ip_stats").execute(db.pool()).await.unwrap();

        assert!(db.write_batch(backend, &scenario()[..2]).await.is_err());

        let (up, _, conns, _, _) = domain_row(&db, backend, "a.com").await;
        assert_eq!((up, conns), (150, 2));
        assert_eq!(count(&db, "rule_chain_traffic", backend).await, 1);
        assert_eq!(count(&db, "minute_dim_stats", backend).await, 1);
        // The device phase rolled back as a whole
        assert_eq!(count(&db, "device_stats", backend).await, 0);
        assert_eq!(count(&db, "device_domain_stats", backend).await, 0);
    }

    #[tokio::test]
    async fn test_comma_labels_stay_single_across_flushes() {
        let (_dir, db) = test_db().await;
        let backend = db.create_backend("home", "").await.unwrap();
        let update = TrafficUpdate::new("a.com", "1.1.1.1", &["Proxy,X"])
            .with_rule("IP-CIDR", "10.0.0.0/8,no-resolve")
            .with_traffic(1, 1)
            .with_timestamp(1_700_000_000_000);
        for _ in 0..3 {
            db.write(backend, &update).await.unwrap();
        }

        let (rules, chains): (String, String) =
            sqlx::query_as("SELECT rules, chains FROM domain_stats WHERE backend_id = ? AND domain = 'a.com'")
                .bind(backend)
                .fetch_one(db.pool())
                .await
                .unwrap();
        assert_eq!(split_set(&rules), vec!["IP-CIDR(10.0.0.0/8,no-resolve)"]);
        assert_eq!(split_set(&chains), vec!["Proxy,X"]);
        assert_eq!(rules, r"IP-CIDR(10.0.0.0/8\,no-resolve)");

        // Ranged unions escape the same way
        let range = resolve_range(Some("2023-11-14T22:00:00Z"), Some("2023-11-14T22:30:00Z"));
        let query = DimensionQuery::plan(Dimension::Domain, Scope::All, range, &RangeFilter::default());
        let page = db.dimension_page(backend, &query, &ListOptions::default()).await.unwrap();
        let domain = page.data[0].clone().into_domain();
        assert_eq!(domain.rules, vec!["IP-CIDR(10.0.0.0/8,no-resolve)"]);
        assert_eq!(domain.chains, vec!["Proxy,X"]);
    }

    #[tokio::test]
    async fn test_country_batch_keeps_known_names() {
        let (_dir, db) = test_db().await;
        let backend = db.create_backend("home", "").await.unwrap();
        let jp = CountryUpdate {
            country: "JP".into(),
            country_name: "Japan".into(),
            continent: "AS".into(),
            upload: 10,
            download: 20,
            timestamp_ms: Some(1_700_000_000_000),
        };
        let unnamed = CountryUpdate {
            country_name: String::new(),
            continent: String::new(),
            upload: 1,
            ..jp.clone()
        };
        db.write_country_batch(backend, &[jp]).await.unwrap();
        db.write_country_batch(backend, &[unnamed]).await.unwrap();

        let (name, up, conns): (String, i64, i64) = sqlx::query_as(
            "SELECT country_name, total_upload, total_connections FROM country_stats WHERE backend_id = ? AND country = 'JP'",
        )
        .bind(backend)
        .fetch_one(db.pool())
        .await
        .unwrap();
        assert_eq!((name.as_str(), up, conns), ("Japan", 11, 2));
        assert_eq!(count(&db, "minute_country_stats", backend).await, 1);
        assert_eq!(count(&db, "hourly_country_stats", backend).await, 1);
    }
}
