//! Database module

mod schema;
pub mod query;
pub mod reads;
pub mod retention;
mod write_buffer;
pub mod writer;

pub use query::{
    resolve_fact_table, resolve_range, Dimension, DimensionQuery, FactTable, ListOptions, QuerySource, RangeFilter,
    Scope, TimeRange,
};
pub use write_buffer::{start_write_buffer, FlushSummary, WriteOp, WriteSender};
pub use reads::DimensionRecord;
pub use writer::FlushStats;

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, QueryBuilder, Sqlite, SqliteConnection};
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::config::{DatabaseConfig, WriterConfig};
use crate::error::{Result, StoreError};
use crate::model::IpGeolocation;
use writer::Statements;

/// Ordered schema migrations, tracked through `PRAGMA user_version`.
const MIGRATIONS: &[(i64, &str)] = &[
    (1, "create_tables"),
    (2, "upgrade_legacy_layout"),
    (3, "create_indexes"),
    (4, "backfill_hourly_rollups"),
];

/// Embedded traffic store: one SQLite file holding every backend's rows.
///
/// Readers share the pool; every mutation goes through `write_gate`, so there
/// is exactly one logical writer per process.
#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
    write_gate: Arc<Mutex<()>>,
    statements: Arc<Statements>,
    max_rows_per_transaction: usize,
}

impl Database {
    pub async fn new(config: &DatabaseConfig, writer: &WriterConfig) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(&config.url).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(sqlx::Error::Io)?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", config.url))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            // Fail fast instead of hanging when the writer holds the lock
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms))
            .pragma("cache_size", format!("-{}", config.cache_size_mb * 1024));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        Ok(Self {
            pool,
            write_gate: Arc::new(Mutex::new(())),
            statements: Arc::new(Statements::compile()),
            max_rows_per_transaction: writer.max_rows_per_transaction.max(1),
        })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<()> {
        let _guard = self.write_gate.lock().await;
        let (current,): (i64,) = sqlx::query_as("PRAGMA user_version")
            .fetch_one(&self.pool)
            .await?;

        for &(version, name) in MIGRATIONS {
            if version <= current {
                continue;
            }
            let started = Instant::now();
            let mut tx = self.pool.begin().await?;
            let outcome = match version {
                1 => create_tables(&mut tx).await,
                2 => upgrade_legacy_layout(&mut tx).await,
                3 => create_indexes(&mut tx).await,
                _ => backfill_hourly_rollups(&mut tx).await,
            };
            let outcome = match outcome {
                Ok(()) => sqlx::query(&format!("PRAGMA user_version = {version}"))
                    .execute(&mut *tx)
                    .await
                    .map(|_| ()),
                Err(e) => Err(e),
            };

            if let Err(source) = outcome {
                if let Err(e) = tx.rollback().await {
                    error!("Rollback of migration {} failed: {}", version, e);
                }
                error!(version, name, "Migration failed: {}", source);
                return Err(StoreError::Migration {
                    version,
                    name,
                    source,
                });
            }
            tx.commit().await?;
            info!(
                version,
                name,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Applied migration"
            );
        }
        Ok(())
    }

    /// Register a gateway backend; traffic rows are scoped by the returned id.
    pub async fn create_backend(&self, name: &str, url: &str) -> Result<i64> {
        let _guard = self.write_gate.lock().await;
        let result = sqlx::query(
            "INSERT INTO backend_configs (name, url, created_at) VALUES (?, ?, ?)",
        )
        .bind(name)
        .bind(url)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Register `backend_id` under a placeholder name unless it already exists.
    pub async fn ensure_backend(&self, backend_id: i64) -> Result<()> {
        let _guard = self.write_gate.lock().await;
        sqlx::query("INSERT OR IGNORE INTO backend_configs (id, name, created_at) VALUES (?, ?, ?)")
            .bind(backend_id)
            .bind(format!("backend-{backend_id}"))
            .bind(Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_backend_ids(&self) -> Result<Vec<i64>> {
        let rows: Vec<(i64,)> = sqlx::query_as("SELECT id FROM backend_configs ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Delete a backend and, through the foreign keys, every row it owns.
    pub async fn delete_backend(&self, backend_id: i64) -> Result<bool> {
        let _guard = self.write_gate.lock().await;
        let result = sqlx::query("DELETE FROM backend_configs WHERE id = ?")
            .bind(backend_id)
            .execute(&self.pool)
            .await?;
        let deleted = result.rows_affected() > 0;
        if deleted {
            info!(backend_id, "Deleted backend and its traffic rows");
        }
        Ok(deleted)
    }
}

async fn create_tables(conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
    for ddl in schema::CREATE_TABLES {
        sqlx::query(ddl).execute(&mut *conn).await?;
    }
    Ok(())
}

async fn has_column(conn: &mut SqliteConnection, table: &str, column: &str) -> Result<bool, sqlx::Error> {
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM pragma_table_info(?) WHERE name = ?")
            .bind(table)
            .bind(column)
            .fetch_one(&mut *conn)
            .await?;
    Ok(count > 0)
}

async fn upgrade_legacy_layout(conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
    if !has_column(conn, "minute_dim_stats", "source_ip").await? {
        info!("Rebuilding legacy minute_dim_stats layout");
        for statement in schema::REBUILD_MINUTE_DIM_STATS {
            sqlx::query(statement).execute(&mut *conn).await?;
        }
    }
    if !has_column(conn, "ip_stats", "asn").await? {
        sqlx::query(schema::ADD_IP_STATS_ASN)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

async fn create_indexes(conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
    for ddl in schema::CREATE_INDEXES {
        sqlx::query(ddl).execute(&mut *conn).await?;
    }
    Ok(())
}

/// Build the hourly rollups once from whatever minute facts exist; the writer
/// keeps them in sync from then on.
async fn backfill_hourly_rollups(conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
    for (hourly, backfill) in [
        ("hourly_stats", schema::BACKFILL_HOURLY_STATS),
        ("hourly_dim_stats", schema::BACKFILL_HOURLY_DIM_STATS),
        ("hourly_country_stats", schema::BACKFILL_HOURLY_COUNTRY_STATS),
    ] {
        let (existing,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {hourly}"))
            .fetch_one(&mut *conn)
            .await?;
        if existing == 0 {
            let result = sqlx::query(backfill).execute(&mut *conn).await?;
            if result.rows_affected() > 0 {
                info!(table = hourly, rows = result.rows_affected(), "Backfilled hourly rollup");
            }
        }
    }
    Ok(())
}

/// ASN and GeoIP details attached to an IP row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpDecoration {
    pub asn: Option<String>,
    pub geo: Option<IpGeolocation>,
}

impl Database {
    /// GeoIP/ASN lookup cache. Rows are owned by the resolver, not by a backend.
    pub async fn get_ip_geolocation(&self, ip: &str) -> Result<Option<IpGeolocation>> {
        let row: Option<(String, String, String, String, String, String)> = sqlx::query_as(
            "SELECT country, country_name, city, asn, as_name, continent FROM geoip_cache WHERE ip = ?",
        )
        .bind(ip)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(country, country_name, city, asn, as_name, continent)| IpGeolocation {
            country,
            country_name,
            city,
            asn,
            as_name,
            continent,
        }))
    }

    pub async fn save_ip_geolocation(&self, ip: &str, geo: &IpGeolocation) -> Result<()> {
        let _guard = self.write_gate.lock().await;
        sqlx::query(
            r#"
            INSERT INTO geoip_cache (ip, country, country_name, city, asn, as_name, continent, queried_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(ip) DO UPDATE SET
                country = excluded.country,
                country_name = excluded.country_name,
                city = excluded.city,
                asn = excluded.asn,
                as_name = excluded.as_name,
                continent = excluded.continent,
                queried_at = excluded.queried_at
            "#,
        )
        .bind(ip)
        .bind(&geo.country)
        .bind(&geo.country_name)
        .bind(&geo.city)
        .bind(&geo.asn)
        .bind(&geo.as_name)
        .bind(&geo.continent)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record ASN details for an IP, both in the shared cache and on every
    /// backend's `ip_stats` row for that IP.
    pub async fn update_asn_info(&self, ip: &str, asn: &str, org: &str) -> Result<()> {
        let _guard = self.write_gate.lock().await;
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO asn_cache (ip, asn, org, queried_at) VALUES (?, ?, ?, ?)
            ON CONFLICT(ip) DO UPDATE SET asn = excluded.asn, org = excluded.org, queried_at = excluded.queried_at
            "#,
        )
        .bind(ip)
        .bind(asn)
        .bind(org)
        .bind(Utc::now().timestamp_millis())
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE ip_stats SET asn = ? WHERE ip = ?")
            .bind(asn)
            .bind(ip)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Decorations for a page of IPs. A non-null local `ip_stats.asn` wins
    /// over the ASN cache, which wins over the GeoIP cache's ASN.
    pub async fn decorate_ips(&self, backend_id: i64, ips: &[String]) -> Result<HashMap<String, IpDecoration>> {
        let mut out: HashMap<String, IpDecoration> = HashMap::new();
        if ips.is_empty() {
            return Ok(out);
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT ip, country, country_name, city, asn, as_name, continent FROM geoip_cache WHERE ip IN (",
        );
        push_ip_list(&mut qb, ips);
        let geo_rows: Vec<(String, String, String, String, String, String, String)> =
            qb.build_query_as().fetch_all(&self.pool).await?;
        for (ip, country, country_name, city, asn, as_name, continent) in geo_rows {
            let entry = out.entry(ip).or_default();
            if !asn.is_empty() {
                entry.asn = Some(asn.clone());
            }
            entry.geo = Some(IpGeolocation {
                country,
                country_name,
                city,
                asn,
                as_name,
                continent,
            });
        }

        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT ip, asn FROM asn_cache WHERE asn != '' AND ip IN (");
        push_ip_list(&mut qb, ips);
        let asn_rows: Vec<(String, String)> = qb.build_query_as().fetch_all(&self.pool).await?;
        for (ip, asn) in asn_rows {
            out.entry(ip).or_default().asn = Some(asn);
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT ip, asn FROM ip_stats WHERE asn IS NOT NULL AND asn != '' AND backend_id = ",
        );
        qb.push_bind(backend_id);
        qb.push(" AND ip IN (");
        push_ip_list(&mut qb, ips);
        let local_rows: Vec<(String, String)> = qb.build_query_as().fetch_all(&self.pool).await?;
        for (ip, asn) in local_rows {
            out.entry(ip).or_default().asn = Some(asn);
        }

        Ok(out)
    }
}

fn push_ip_list(qb: &mut QueryBuilder<'_, Sqlite>, ips: &[String]) {
    let mut separated = qb.separated(", ");
    for ip in ips {
        separated.push_bind(ip.clone());
    }
    separated.push_unseparated(")");
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Fresh migrated database in a temporary directory.
    pub(crate) async fn test_db() -> (TempDir, Database) {
        let dir = TempDir::new().expect("tempdir");
        let config = DatabaseConfig {
            url: dir.path().join("test.db").display().to_string(),
            ..Default::default()
        };
        let db = Database::new(&config, &WriterConfig::default())
            .await
            .expect("open database");
        db.run_migrations().await.expect("migrations");
        (dir, db)
    }

    pub(crate) async fn count(db: &Database, table: &str, backend_id: i64) -> i64 {
        let (n,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table} WHERE backend_id = ?"))
            .bind(backend_id)
            .fetch_one(db.pool())
            .await
            .expect("count");
        n
    }

    #[tokio::test]
    async fn test_migrations_create_schema_and_are_idempotent() {
        let (_dir, db) = test_db().await;
        db.run_migrations().await.unwrap();

        let (version,): (i64,) = sqlx::query_as("PRAGMA user_version")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(version, MIGRATIONS.len() as i64);

        for table in schema::DIMENSION_TABLES
            .iter()
            .chain(schema::MINUTE_FACT_TABLES)
            .chain(schema::HOURLY_FACT_TABLES)
        {
            let (n,): (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
            )
            .bind(table)
            .fetch_one(db.pool())
            .await
            .unwrap();
            assert_eq!(n, 1, "missing table {table}");
        }
    }

    #[tokio::test]
    async fn test_legacy_fact_layout_is_rebuilt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("legacy.db");
        let config = DatabaseConfig {
            url: path.display().to_string(),
            ..Default::default()
        };
        let db = Database::new(&config, &WriterConfig::default()).await.unwrap();
        sqlx::query(schema::CREATE_BACKEND_CONFIGS).execute(db.pool()).await.unwrap();
        sqlx::query("INSERT INTO backend_configs (id, name, created_at) VALUES (1, 'legacy', 0)")
            .execute(db.pool())
            .await
            .unwrap();
        sqlx::query(
            r#"CREATE TABLE minute_dim_stats (
                backend_id INTEGER NOT NULL, bucket TEXT NOT NULL, domain TEXT NOT NULL DEFAULT '',
                ip TEXT NOT NULL DEFAULT '', chain TEXT NOT NULL DEFAULT '', rule TEXT NOT NULL DEFAULT '',
                upload INTEGER NOT NULL DEFAULT 0, download INTEGER NOT NULL DEFAULT 0,
                connections INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (backend_id, bucket, domain, ip, chain, rule))"#,
        )
        .execute(db.pool())
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO minute_dim_stats VALUES (1, '2024-01-01T10:05:00', 'a.com', '1.1.1.1', 'DIRECT', 'RuleX', 10, 20, 1)",
        )
        .execute(db.pool())
        .await
        .unwrap();

        db.run_migrations().await.unwrap();

        let (source_ip, upload): (String, i64) =
            sqlx::query_as("SELECT source_ip, upload FROM minute_dim_stats WHERE backend_id = 1")
                .fetch_one(db.pool())
                .await
                .unwrap();
        assert_eq!(source_ip, "");
        assert_eq!(upload, 10);

        let (hourly,): (i64,) =
            sqlx::query_as("SELECT upload FROM hourly_dim_stats WHERE bucket = '2024-01-01T10:00:00'")
                .fetch_one(db.pool())
                .await
                .unwrap();
        assert_eq!(hourly, 10);
    }

    #[tokio::test]
    async fn test_decorate_prefers_local_asn() {
        let (_dir, db) = test_db().await;
        let backend = db.create_backend("home", "").await.unwrap();
        assert!(db.decorate_ips(backend, &[]).await.unwrap().is_empty());

        let geo = IpGeolocation {
            country: "US".into(),
            country_name: "United States".into(),
            asn: "AS13335".into(),
            ..Default::default()
        };
        db.save_ip_geolocation("1.1.1.1", &geo).await.unwrap();
        assert_eq!(db.get_ip_geolocation("1.1.1.1").await.unwrap(), Some(geo));

        let ips = vec!["1.1.1.1".to_string()];
        let decorated = db.decorate_ips(backend, &ips).await.unwrap();
        assert_eq!(decorated["1.1.1.1"].asn.as_deref(), Some("AS13335"));

        sqlx::query("INSERT INTO ip_stats (backend_id, ip, asn) VALUES (?, '1.1.1.1', 'AS1')")
            .bind(backend)
            .execute(db.pool())
            .await
            .unwrap();
        let decorated = db.decorate_ips(backend, &ips).await.unwrap();
        assert_eq!(decorated["1.1.1.1"].asn.as_deref(), Some("AS1"));
        assert_eq!(
            decorated["1.1.1.1"].geo.as_ref().map(|g| g.country.as_str()),
            Some("US")
        );
    }
}
