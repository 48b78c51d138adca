//! Configuration management

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub writer: WriterConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub clickhouse: ClickHouseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path of the SQLite file (created if missing)
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// How long a writer waits on a locked database before failing
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// SQLite page cache size in MB per connection
    #[serde(default = "default_cache_size_mb")]
    pub cache_size_mb: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            busy_timeout_ms: default_busy_timeout_ms(),
            cache_size_mb: default_cache_size_mb(),
        }
    }
}

fn default_database_url() -> String {
    "data/flowstats.db".to_string()
}

fn default_max_connections() -> u32 {
    4
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_cache_size_mb() -> u32 {
    16
}

#[derive(Debug, Clone, Deserialize)]
pub struct WriterConfig {
    /// Events buffered before a flush is forced
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Upserts per sub-transaction before it is committed and a new one begun
    #[serde(default = "default_max_rows_per_transaction")]
    pub max_rows_per_transaction: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            max_rows_per_transaction: default_max_rows_per_transaction(),
        }
    }
}

fn default_batch_size() -> usize {
    500
}

fn default_flush_interval_ms() -> u64 {
    1000
}

fn default_max_rows_per_transaction() -> usize {
    2000
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_live_ttl_secs")]
    pub live_ttl_secs: u64,
    #[serde(default = "default_historical_ttl_secs")]
    pub historical_ttl_secs: u64,
    /// A range ending this close to now is still receiving data
    #[serde(default = "default_live_tolerance_secs")]
    pub live_tolerance_secs: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            live_ttl_secs: default_live_ttl_secs(),
            historical_ttl_secs: default_historical_ttl_secs(),
            live_tolerance_secs: default_live_tolerance_secs(),
            max_entries: default_max_entries(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl CacheConfig {
    pub fn live_ttl(&self) -> Duration {
        Duration::from_secs(self.live_ttl_secs)
    }

    pub fn historical_ttl(&self) -> Duration {
        Duration::from_secs(self.historical_ttl_secs)
    }
}

fn default_true() -> bool {
    true
}

fn default_live_ttl_secs() -> u64 {
    8
}

fn default_historical_ttl_secs() -> u64 {
    300
}

fn default_live_tolerance_secs() -> u64 {
    120
}

fn default_max_entries() -> usize {
    1024
}

fn default_sweep_interval_secs() -> u64 {
    30
}

/// Fact-table retention. Persisted in `app_config` once updated at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionConfig {
    #[serde(default = "default_minute_stats_days", alias = "minute_stats_days")]
    pub minute_stats_days: u32,
    #[serde(default = "default_hourly_stats_days", alias = "hourly_stats_days")]
    pub hourly_stats_days: u32,
    #[serde(default = "default_true", alias = "auto_cleanup")]
    pub auto_cleanup: bool,
    #[serde(default = "default_retention_interval_secs", alias = "interval_secs")]
    pub interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            minute_stats_days: default_minute_stats_days(),
            hourly_stats_days: default_hourly_stats_days(),
            auto_cleanup: true,
            interval_secs: default_retention_interval_secs(),
        }
    }
}

fn default_minute_stats_days() -> u32 {
    7
}

fn default_hourly_stats_days() -> u32 {
    30
}

fn default_retention_interval_secs() -> u64 {
    3600
}

/// Which store answers ranged reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatsSource {
    #[default]
    Local,
    /// ClickHouse for ranges at least `min_range_hours` wide
    Auto,
    /// ClickHouse for every ranged read
    Clickhouse,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseConfig {
    #[serde(default)]
    pub enabled: bool,
    /// HTTP interface, e.g. http://localhost:8123
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_clickhouse_database")]
    pub database: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub source: StatsSource,
    /// Propagate adapter failures instead of falling back to SQLite
    #[serde(default)]
    pub strict: bool,
    #[serde(default = "default_min_range_hours")]
    pub min_range_hours: i64,
    #[serde(default = "default_clickhouse_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            database: default_clickhouse_database(),
            user: None,
            password: None,
            source: StatsSource::Local,
            strict: false,
            min_range_hours: default_min_range_hours(),
            timeout_ms: default_clickhouse_timeout_ms(),
        }
    }
}

fn default_clickhouse_database() -> String {
    "flowstats".to_string()
}

fn default_min_range_hours() -> i64 {
    24
}

fn default_clickhouse_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("FLOWSTATS_CONFIG").unwrap_or_else(|_| "config.toml".to_string());

        let builder = config::Config::builder()
            .add_source(config::File::with_name(&config_path).required(false))
            .add_source(config::Environment::with_prefix("FLOWSTATS").separator("__"));

        let settings = builder.build()?;
        let config: Config = settings.try_deserialize()?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }
        if self.database.max_connections == 0 {
            anyhow::bail!("database.max_connections must be at least 1");
        }

        if self.writer.batch_size == 0 || self.writer.max_rows_per_transaction == 0 {
            anyhow::bail!("writer.batch_size and writer.max_rows_per_transaction must be positive");
        }

        if self.cache.max_entries == 0 {
            anyhow::bail!("cache.max_entries must be positive");
        }
        if self.cache.live_ttl_secs >= self.cache.historical_ttl_secs {
            anyhow::bail!(
                "cache.live_ttl_secs ({}) must be shorter than cache.historical_ttl_secs ({})",
                self.cache.live_ttl_secs,
                self.cache.historical_ttl_secs
            );
        }

        if self.clickhouse.enabled && self.clickhouse.url.is_empty() {
            anyhow::bail!("ClickHouse is enabled but clickhouse.url is empty");
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!("Invalid logging level '{}'. Must be one of: {:?}", self.logging.level, valid_levels);
        }

        Ok(())
    }

    pub fn clickhouse_enabled(&self) -> bool {
        self.clickhouse.enabled && self.clickhouse.source != StatsSource::Local
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache.live_ttl_secs, 8);
        assert_eq!(config.cache.max_entries, 1024);
        assert!(!config.clickhouse_enabled());
    }

    #[test]
    fn test_rejects_inverted_ttls() {
        let mut config = Config::default();
        config.cache.live_ttl_secs = 600;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_clickhouse_without_url() {
        let mut config = Config::default();
        config.clickhouse.enabled = true;
        config.clickhouse.source = StatsSource::Auto;
        assert!(config.validate().is_err());
        config.clickhouse.url = "http://localhost:8123".into();
        assert!(config.validate().is_ok());
        assert!(config.clickhouse_enabled());
    }

    #[test]
    fn test_rejects_unknown_log_level() {
        let mut config = Config::default();
        config.logging.level = "loud".into();
        assert!(config.validate().is_err());
    }
}
