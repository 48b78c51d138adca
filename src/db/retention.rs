//! Retention: age-based pruning of bucket facts and full wipes

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::schema::{DIMENSION_TABLES, HOURLY_FACT_TABLES, MINUTE_FACT_TABLES};
use super::{Database, FactTable, TimeRange};
use crate::config::RetentionConfig;
use crate::error::Result;
use crate::model::CleanupResult;

const RETENTION_CONFIG_KEY: &str = "retention";

/// Delete every row of `table`, optionally only one backend's.
async fn delete_all(conn: &mut SqliteConnection, table: &str, backend_id: Option<i64>) -> Result<u64, sqlx::Error> {
    let result = match backend_id {
        Some(id) => {
            sqlx::query(&format!("DELETE FROM {table} WHERE backend_id = ?"))
                .bind(id)
                .execute(&mut *conn)
                .await?
        }
        None => sqlx::query(&format!("DELETE FROM {table}")).execute(&mut *conn).await?,
    };
    Ok(result.rows_affected())
}

/// Delete rows of `table` whose bucket sorts before `cutoff`.
async fn delete_before(
    conn: &mut SqliteConnection,
    table: &str,
    cutoff: &str,
    backend_id: Option<i64>,
) -> Result<u64, sqlx::Error> {
    let result = match backend_id {
        Some(id) => {
            sqlx::query(&format!("DELETE FROM {table} WHERE backend_id = ? AND bucket < ?"))
                .bind(id)
                .bind(cutoff)
                .execute(&mut *conn)
                .await?
        }
        None => {
            sqlx::query(&format!("DELETE FROM {table} WHERE bucket < ?"))
                .bind(cutoff)
                .execute(&mut *conn)
                .await?
        }
    };
    Ok(result.rows_affected())
}

/// First bucket of `table` that survives a cutoff at `instant`.
fn cutoff_bucket(table: FactTable, instant: DateTime<Utc>) -> String {
    let (first, _) = TimeRange { start: instant, end: instant }.bucket_bounds(table);
    first
}

impl Database {
    /// Remove traffic data.
    ///
    /// `days == 0` wipes every dimension, cross-reference and fact row (of one
    /// backend, or of all) and compacts the file. Otherwise only fact rows in
    /// buckets older than `days` are deleted; all-time totals are kept.
    pub async fn cleanup(&self, backend_id: Option<i64>, days: u32) -> Result<CleanupResult> {
        let _guard = self.write_gate.lock().await;
        let mut result = CleanupResult::default();
        let mut tx = self.pool.begin().await?;

        if days == 0 {
            for table in DIMENSION_TABLES {
                result.dimension_rows += delete_all(&mut tx, table, backend_id).await?;
            }
            for table in MINUTE_FACT_TABLES.iter().chain(HOURLY_FACT_TABLES) {
                result.fact_rows += delete_all(&mut tx, table, backend_id).await?;
            }
        } else {
            let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
            result.fact_rows += self.prune_facts(&mut tx, cutoff, cutoff, backend_id).await?;
        }
        tx.commit().await?;

        if days == 0 {
            self.compact().await;
        }
        info!(
            backend_id,
            days,
            dimension_rows = result.dimension_rows,
            fact_rows = result.fact_rows,
            "Cleanup finished"
        );
        Ok(result)
    }

    async fn prune_facts(
        &self,
        conn: &mut SqliteConnection,
        minute_cutoff: DateTime<Utc>,
        hourly_cutoff: DateTime<Utc>,
        backend_id: Option<i64>,
    ) -> Result<u64> {
        let mut deleted = 0;
        let minute = cutoff_bucket(FactTable::Minute, minute_cutoff);
        for table in MINUTE_FACT_TABLES {
            deleted += delete_before(conn, table, &minute, backend_id).await?;
        }
        let hourly = cutoff_bucket(FactTable::Hourly, hourly_cutoff);
        for table in HOURLY_FACT_TABLES {
            deleted += delete_before(conn, table, &hourly, backend_id).await?;
        }
        Ok(deleted)
    }

    /// Give freed pages back to the filesystem. Failure only costs disk space.
    async fn compact(&self) {
        if let Err(e) = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await
        {
            error!("WAL checkpoint failed: {}", e);
        }
        if let Err(e) = sqlx::query("VACUUM").execute(&self.pool).await {
            error!("VACUUM failed: {}", e);
        }
    }

    /// Stored retention settings, or `fallback` when none were saved.
    pub async fn get_retention_config(&self, fallback: &RetentionConfig) -> Result<RetentionConfig> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM app_config WHERE key = ?")
            .bind(RETENTION_CONFIG_KEY)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some((value,)) => Ok(serde_json::from_str(&value)?),
            None => Ok(fallback.clone()),
        }
    }

    pub async fn update_retention_config(&self, config: &RetentionConfig) -> Result<()> {
        let value = serde_json::to_string(config)?;
        let _guard = self.write_gate.lock().await;
        sqlx::query(
            "INSERT INTO app_config (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(RETENTION_CONFIG_KEY)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Prune minute and hourly facts past their configured ages, for every backend.
    pub async fn run_retention(&self, config: &RetentionConfig) -> Result<CleanupResult> {
        let now = Utc::now();
        let minute_cutoff = now - chrono::Duration::days(i64::from(config.minute_stats_days));
        let hourly_cutoff = now - chrono::Duration::days(i64::from(config.hourly_stats_days));

        let _guard = self.write_gate.lock().await;
        let mut tx = self.pool.begin().await?;
        let fact_rows = self.prune_facts(&mut tx, minute_cutoff, hourly_cutoff, None).await?;
        tx.commit().await?;

        if fact_rows > 0 {
            info!(fact_rows, "Retention pruned expired buckets");
        }
        Ok(CleanupResult {
            dimension_rows: 0,
            fact_rows,
        })
    }
}

/// Periodically apply the stored retention settings. `on_pruned` runs after
/// every pass that deleted rows.
pub fn start_retention_task<F>(db: Arc<Database>, defaults: RetentionConfig, on_pruned: F) -> JoinHandle<()>
where
    F: Fn(CleanupResult) + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(defaults.interval_secs.max(1)));
        loop {
            interval.tick().await;

            let config = match db.get_retention_config(&defaults).await {
                Ok(config) => config,
                Err(e) => {
                    error!("Failed to read retention config: {}", e);
                    continue;
                }
            };
            if !config.auto_cleanup {
                debug!("Automatic cleanup disabled, skipping retention pass");
                continue;
            }
            match db.run_retention(&config).await {
                Ok(result) if result.total() > 0 => on_pruned(result),
                Ok(_) => {}
                Err(e) => error!("Retention pass failed: {}", e),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::{count, test_db};
    use crate::model::{CountryUpdate, TrafficUpdate};

    const DAY_MS: i64 = 24 * 60 * 60 * 1000;

    async fn seed(db: &Database, backend: i64) {
        let now = Utc::now().timestamp_millis();
        let updates = vec![
            TrafficUpdate::new("old.com", "1.1.1.1", &["P", "RuleX"])
                .with_traffic(10, 10)
                .with_source_ip("192.168.1.2")
                .with_timestamp(now - 40 * DAY_MS),
            TrafficUpdate::new("new.com", "2.2.2.2", &["P", "RuleX"])
                .with_traffic(5, 5)
                .with_source_ip("192.168.1.2")
                .with_timestamp(now),
        ];
        db.write_batch(backend, &updates).await.unwrap();
        let country = CountryUpdate {
            country: "US".into(),
            country_name: "United States".into(),
            upload: 1,
            download: 1,
            timestamp_ms: Some(now),
            ..Default::default()
        };
        db.write_country_batch(backend, &[country]).await.unwrap();
    }

    async fn scoped_rows(db: &Database, backend: i64) -> i64 {
        let mut total = 0;
        for table in DIMENSION_TABLES
            .iter()
            .chain(MINUTE_FACT_TABLES)
            .chain(HOURLY_FACT_TABLES)
        {
            total += count(db, table, backend).await;
        }
        total
    }

    #[tokio::test]
    async fn test_wipe_empties_only_target_backend() {
        let (_dir, db) = test_db().await;
        let home = db.create_backend("home", "").await.unwrap();
        let office = db.create_backend("office", "").await.unwrap();
        seed(&db, home).await;
        seed(&db, office).await;
        let office_before = scoped_rows(&db, office).await;

        let result = db.cleanup(Some(home), 0).await.unwrap();
        assert!(result.dimension_rows > 0);
        assert!(result.fact_rows > 0);
        assert_eq!(scoped_rows(&db, home).await, 0);
        assert_eq!(scoped_rows(&db, office).await, office_before);

        db.cleanup(None, 0).await.unwrap();
        assert_eq!(scoped_rows(&db, office).await, 0);
    }

    #[tokio::test]
    async fn test_age_cleanup_keeps_totals() {
        let (_dir, db) = test_db().await;
        let backend = db.create_backend("home", "").await.unwrap();
        seed(&db, backend).await;

        let result = db.cleanup(Some(backend), 30).await.unwrap();
        assert_eq!(result.dimension_rows, 0);
        assert!(result.fact_rows > 0);

        let (old_facts,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM minute_dim_stats WHERE domain = 'old.com'")
                .fetch_one(db.pool())
                .await
                .unwrap();
        assert_eq!(old_facts, 0);
        assert_eq!(count(&db, "minute_dim_stats", backend).await, 1);
        assert_eq!(count(&db, "minute_country_stats", backend).await, 1);
        assert_eq!(count(&db, "domain_stats", backend).await, 2);
    }

    #[tokio::test]
    async fn test_retention_config_round_trips_through_store() {
        let (_dir, db) = test_db().await;
        let defaults = RetentionConfig::default();
        assert_eq!(db.get_retention_config(&defaults).await.unwrap(), defaults);

        let updated = RetentionConfig {
            minute_stats_days: 1,
            auto_cleanup: false,
            ..defaults.clone()
        };
        db.update_retention_config(&updated).await.unwrap();
        assert_eq!(db.get_retention_config(&defaults).await.unwrap(), updated);
    }

    #[tokio::test]
    async fn test_run_retention_uses_per_table_ages() {
        let (_dir, db) = test_db().await;
        let backend = db.create_backend("home", "").await.unwrap();
        seed(&db, backend).await;

        let config = RetentionConfig {
            minute_stats_days: 7,
            hourly_stats_days: 60,
            ..Default::default()
        };
        db.run_retention(&config).await.unwrap();
        assert_eq!(count(&db, "minute_dim_stats", backend).await, 1);
        // The 40-day-old hour is still inside the hourly window
        assert_eq!(count(&db, "hourly_dim_stats", backend).await, 2);
    }
}
