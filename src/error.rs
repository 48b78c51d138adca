//! Error types for the traffic store

use thiserror::Error;

/// Errors surfaced by the store, the writer and the columnar adapter.
///
/// Malformed ranges are not errors: they degrade to cumulative reads.
/// Unknown keys are not errors either: they yield empty results.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite I/O failure, lock timeout or constraint violation
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A schema migration or backfill failed and was rolled back
    #[error("migration {version} ({name}) failed: {source}")]
    Migration {
        version: i64,
        name: &'static str,
        #[source]
        source: sqlx::Error,
    },

    /// ClickHouse answered with a non-success status
    #[error("clickhouse error: {0}")]
    ClickHouse(String),

    /// ClickHouse could not be reached
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;
