//! Database schema definitions
//!
//! One canonical layout. Every table except the GeoIP/ASN caches and
//! `app_config` is scoped by `backend_id` and cascades on backend deletion.

pub const CREATE_BACKEND_CONFIGS: &str = r#"
CREATE TABLE IF NOT EXISTS backend_configs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    url TEXT NOT NULL DEFAULT '',
    token TEXT NOT NULL DEFAULT '',
    enabled INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER NOT NULL
)
"#;

// === CUMULATIVE DIMENSION TABLES ===

pub const CREATE_DOMAIN_STATS: &str = r#"
CREATE TABLE IF NOT EXISTS domain_stats (
    backend_id INTEGER NOT NULL REFERENCES backend_configs(id) ON DELETE CASCADE,
    domain TEXT NOT NULL,
    total_upload INTEGER NOT NULL DEFAULT 0,
    total_download INTEGER NOT NULL DEFAULT 0,
    total_connections INTEGER NOT NULL DEFAULT 0,
    last_seen INTEGER NOT NULL DEFAULT 0,
    ips TEXT NOT NULL DEFAULT '',
    rules TEXT NOT NULL DEFAULT '',
    chains TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (backend_id, domain)
)
"#;

pub const CREATE_IP_STATS: &str = r#"
CREATE TABLE IF NOT EXISTS ip_stats (
    backend_id INTEGER NOT NULL REFERENCES backend_configs(id) ON DELETE CASCADE,
    ip TEXT NOT NULL,
    total_upload INTEGER NOT NULL DEFAULT 0,
    total_download INTEGER NOT NULL DEFAULT 0,
    total_connections INTEGER NOT NULL DEFAULT 0,
    last_seen INTEGER NOT NULL DEFAULT 0,
    domains TEXT NOT NULL DEFAULT '',
    chains TEXT NOT NULL DEFAULT '',
    asn TEXT,
    PRIMARY KEY (backend_id, ip)
)
"#;

pub const CREATE_PROXY_STATS: &str = r#"
CREATE TABLE IF NOT EXISTS proxy_stats (
    backend_id INTEGER NOT NULL REFERENCES backend_configs(id) ON DELETE CASCADE,
    chain TEXT NOT NULL,
    total_upload INTEGER NOT NULL DEFAULT 0,
    total_download INTEGER NOT NULL DEFAULT 0,
    total_connections INTEGER NOT NULL DEFAULT 0,
    last_seen INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (backend_id, chain)
)
"#;

pub const CREATE_RULE_STATS: &str = r#"
CREATE TABLE IF NOT EXISTS rule_stats (
    backend_id INTEGER NOT NULL REFERENCES backend_configs(id) ON DELETE CASCADE,
    rule TEXT NOT NULL,
    final_proxy TEXT NOT NULL DEFAULT '',
    total_upload INTEGER NOT NULL DEFAULT 0,
    total_download INTEGER NOT NULL DEFAULT 0,
    total_connections INTEGER NOT NULL DEFAULT 0,
    last_seen INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (backend_id, rule)
)
"#;

pub const CREATE_COUNTRY_STATS: &str = r#"
CREATE TABLE IF NOT EXISTS country_stats (
    backend_id INTEGER NOT NULL REFERENCES backend_configs(id) ON DELETE CASCADE,
    country TEXT NOT NULL,
    country_name TEXT NOT NULL DEFAULT '',
    continent TEXT NOT NULL DEFAULT '',
    total_upload INTEGER NOT NULL DEFAULT 0,
    total_download INTEGER NOT NULL DEFAULT 0,
    total_connections INTEGER NOT NULL DEFAULT 0,
    last_seen INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (backend_id, country)
)
"#;

pub const CREATE_DEVICE_STATS: &str = r#"
CREATE TABLE IF NOT EXISTS device_stats (
    backend_id INTEGER NOT NULL REFERENCES backend_configs(id) ON DELETE CASCADE,
    source_ip TEXT NOT NULL,
    total_upload INTEGER NOT NULL DEFAULT 0,
    total_download INTEGER NOT NULL DEFAULT 0,
    total_connections INTEGER NOT NULL DEFAULT 0,
    last_seen INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (backend_id, source_ip)
)
"#;

// === CROSS-REFERENCE TABLES ===

/// Two-key cumulative table with the standard counter columns.
macro_rules! pair_table {
    ($name:literal, $a:literal, $b:literal) => {
        concat!(
            "CREATE TABLE IF NOT EXISTS ", $name, " (\n",
            "    backend_id INTEGER NOT NULL REFERENCES backend_configs(id) ON DELETE CASCADE,\n",
            "    ", $a, " TEXT NOT NULL,\n",
            "    ", $b, " TEXT NOT NULL,\n",
            "    total_upload INTEGER NOT NULL DEFAULT 0,\n",
            "    total_download INTEGER NOT NULL DEFAULT 0,\n",
            "    total_connections INTEGER NOT NULL DEFAULT 0,\n",
            "    last_seen INTEGER NOT NULL DEFAULT 0,\n",
            "    PRIMARY KEY (backend_id, ", $a, ", ", $b, ")\n",
            ")"
        )
    };
}

pub const CREATE_RULE_PROXY_MAP: &str = pair_table!("rule_proxy_map", "rule", "proxy");
pub const CREATE_RULE_CHAIN_TRAFFIC: &str = pair_table!("rule_chain_traffic", "rule", "chain");
pub const CREATE_RULE_DOMAIN_TRAFFIC: &str = pair_table!("rule_domain_traffic", "rule", "domain");
pub const CREATE_RULE_IP_TRAFFIC: &str = pair_table!("rule_ip_traffic", "rule", "ip");
pub const CREATE_DEVICE_DOMAIN_STATS: &str =
    pair_table!("device_domain_stats", "source_ip", "domain");
pub const CREATE_DEVICE_IP_STATS: &str = pair_table!("device_ip_stats", "source_ip", "ip");
pub const CREATE_DOMAIN_PROXY_STATS: &str = pair_table!("domain_proxy_stats", "domain", "chain");

pub const CREATE_IP_PROXY_STATS: &str = r#"
CREATE TABLE IF NOT EXISTS ip_proxy_stats (
    backend_id INTEGER NOT NULL REFERENCES backend_configs(id) ON DELETE CASCADE,
    ip TEXT NOT NULL,
    chain TEXT NOT NULL,
    total_upload INTEGER NOT NULL DEFAULT 0,
    total_download INTEGER NOT NULL DEFAULT 0,
    total_connections INTEGER NOT NULL DEFAULT 0,
    last_seen INTEGER NOT NULL DEFAULT 0,
    domains TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (backend_id, ip, chain)
)
"#;

// === TIME-BUCKET FACT TABLES ===

macro_rules! overall_table {
    ($name:literal) => {
        concat!(
            "CREATE TABLE IF NOT EXISTS ", $name, " (\n",
            "    backend_id INTEGER NOT NULL REFERENCES backend_configs(id) ON DELETE CASCADE,\n",
            "    bucket TEXT NOT NULL,\n",
            "    upload INTEGER NOT NULL DEFAULT 0,\n",
            "    download INTEGER NOT NULL DEFAULT 0,\n",
            "    connections INTEGER NOT NULL DEFAULT 0,\n",
            "    PRIMARY KEY (backend_id, bucket)\n",
            ")"
        )
    };
}

macro_rules! dim_table {
    ($name:literal) => {
        concat!(
            "CREATE TABLE IF NOT EXISTS ", $name, " (\n",
            "    backend_id INTEGER NOT NULL REFERENCES backend_configs(id) ON DELETE CASCADE,\n",
            "    bucket TEXT NOT NULL,\n",
            "    domain TEXT NOT NULL DEFAULT '',\n",
            "    ip TEXT NOT NULL DEFAULT '',\n",
            "    source_ip TEXT NOT NULL DEFAULT '',\n",
            "    chain TEXT NOT NULL DEFAULT '',\n",
            "    rule TEXT NOT NULL DEFAULT '',\n",
            "    upload INTEGER NOT NULL DEFAULT 0,\n",
            "    download INTEGER NOT NULL DEFAULT 0,\n",
            "    connections INTEGER NOT NULL DEFAULT 0,\n",
            "    PRIMARY KEY (backend_id, bucket, domain, ip, source_ip, chain, rule)\n",
            ")"
        )
    };
}

macro_rules! country_table {
    ($name:literal) => {
        concat!(
            "CREATE TABLE IF NOT EXISTS ", $name, " (\n",
            "    backend_id INTEGER NOT NULL REFERENCES backend_configs(id) ON DELETE CASCADE,\n",
            "    bucket TEXT NOT NULL,\n",
            "    country TEXT NOT NULL,\n",
            "    country_name TEXT NOT NULL DEFAULT '',\n",
            "    continent TEXT NOT NULL DEFAULT '',\n",
            "    upload INTEGER NOT NULL DEFAULT 0,\n",
            "    download INTEGER NOT NULL DEFAULT 0,\n",
            "    connections INTEGER NOT NULL DEFAULT 0,\n",
            "    PRIMARY KEY (backend_id, bucket, country)\n",
            ")"
        )
    };
}

pub const CREATE_MINUTE_STATS: &str = overall_table!("minute_stats");
pub const CREATE_HOURLY_STATS: &str = overall_table!("hourly_stats");
pub const CREATE_MINUTE_DIM_STATS: &str = dim_table!("minute_dim_stats");
pub const CREATE_HOURLY_DIM_STATS: &str = dim_table!("hourly_dim_stats");
pub const CREATE_MINUTE_COUNTRY_STATS: &str = country_table!("minute_country_stats");
pub const CREATE_HOURLY_COUNTRY_STATS: &str = country_table!("hourly_country_stats");

// === UNSCOPED CACHES ===

pub const CREATE_ASN_CACHE: &str = r#"
CREATE TABLE IF NOT EXISTS asn_cache (
    ip TEXT PRIMARY KEY,
    asn TEXT NOT NULL DEFAULT '',
    org TEXT NOT NULL DEFAULT '',
    queried_at INTEGER NOT NULL DEFAULT 0
)
"#;

pub const CREATE_GEOIP_CACHE: &str = r#"
CREATE TABLE IF NOT EXISTS geoip_cache (
    ip TEXT PRIMARY KEY,
    country TEXT NOT NULL DEFAULT '',
    country_name TEXT NOT NULL DEFAULT '',
    city TEXT NOT NULL DEFAULT '',
    asn TEXT NOT NULL DEFAULT '',
    as_name TEXT NOT NULL DEFAULT '',
    continent TEXT NOT NULL DEFAULT '',
    queried_at INTEGER NOT NULL DEFAULT 0
)
"#;

pub const CREATE_APP_CONFIG: &str = r#"
CREATE TABLE IF NOT EXISTS app_config (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

pub const CREATE_TABLES: &[&str] = &[
    CREATE_BACKEND_CONFIGS,
    CREATE_DOMAIN_STATS,
    CREATE_IP_STATS,
    CREATE_PROXY_STATS,
    CREATE_RULE_STATS,
    CREATE_COUNTRY_STATS,
    CREATE_DEVICE_STATS,
    CREATE_RULE_PROXY_MAP,
    CREATE_RULE_CHAIN_TRAFFIC,
    CREATE_RULE_DOMAIN_TRAFFIC,
    CREATE_RULE_IP_TRAFFIC,
    CREATE_DEVICE_DOMAIN_STATS,
    CREATE_DEVICE_IP_STATS,
    CREATE_DOMAIN_PROXY_STATS,
    CREATE_IP_PROXY_STATS,
    CREATE_MINUTE_STATS,
    CREATE_HOURLY_STATS,
    CREATE_MINUTE_DIM_STATS,
    CREATE_HOURLY_DIM_STATS,
    CREATE_MINUTE_COUNTRY_STATS,
    CREATE_HOURLY_COUNTRY_STATS,
    CREATE_ASN_CACHE,
    CREATE_GEOIP_CACHE,
    CREATE_APP_CONFIG,
];

// === INDEXES (range scans filter by backend + bucket first) ===

pub const CREATE_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_minute_dim_bucket ON minute_dim_stats(backend_id, bucket)",
    "CREATE INDEX IF NOT EXISTS idx_hourly_dim_bucket ON hourly_dim_stats(backend_id, bucket)",
    "CREATE INDEX IF NOT EXISTS idx_minute_dim_rule ON minute_dim_stats(backend_id, rule, bucket)",
    "CREATE INDEX IF NOT EXISTS idx_hourly_dim_rule ON hourly_dim_stats(backend_id, rule, bucket)",
    "CREATE INDEX IF NOT EXISTS idx_minute_dim_source ON minute_dim_stats(backend_id, source_ip, bucket)",
    "CREATE INDEX IF NOT EXISTS idx_minute_country_bucket ON minute_country_stats(backend_id, bucket)",
    "CREATE INDEX IF NOT EXISTS idx_hourly_country_bucket ON hourly_country_stats(backend_id, bucket)",
    "CREATE INDEX IF NOT EXISTS idx_domain_stats_traffic ON domain_stats(backend_id, total_upload + total_download)",
    "CREATE INDEX IF NOT EXISTS idx_ip_stats_traffic ON ip_stats(backend_id, total_upload + total_download)",
    "CREATE INDEX IF NOT EXISTS idx_rule_chain_rule ON rule_chain_traffic(backend_id, rule)",
];

// === LEGACY LAYOUT MIGRATION ===

/// Fact layout that predates device tracking: no `source_ip` column, so the
/// primary key has to be rebuilt rather than altered.
pub const REBUILD_MINUTE_DIM_STATS: &[&str] = &[
    "ALTER TABLE minute_dim_stats RENAME TO minute_dim_stats_legacy",
    CREATE_MINUTE_DIM_STATS,
    r#"INSERT INTO minute_dim_stats (backend_id, bucket, domain, ip, source_ip, chain, rule, upload, download, connections)
       SELECT backend_id, bucket, domain, ip, '', chain, rule, SUM(upload), SUM(download), SUM(connections)
       FROM minute_dim_stats_legacy
       GROUP BY backend_id, bucket, domain, ip, chain, rule"#,
    "DROP TABLE minute_dim_stats_legacy",
];

pub const ADD_IP_STATS_ASN: &str = "ALTER TABLE ip_stats ADD COLUMN asn TEXT";

// === HOURLY BACKFILL ===

pub const BACKFILL_HOURLY_STATS: &str = r#"
INSERT INTO hourly_stats (backend_id, bucket, upload, download, connections)
SELECT backend_id, substr(bucket, 1, 13) || ':00:00', SUM(upload), SUM(download), SUM(connections)
FROM minute_stats
GROUP BY backend_id, substr(bucket, 1, 13)
"#;

pub const BACKFILL_HOURLY_DIM_STATS: &str = r#"
INSERT INTO hourly_dim_stats (backend_id, bucket, domain, ip, source_ip, chain, rule, upload, download, connections)
SELECT backend_id, substr(bucket, 1, 13) || ':00:00', domain, ip, source_ip, chain, rule,
       SUM(upload), SUM(download), SUM(connections)
FROM minute_dim_stats
GROUP BY backend_id, substr(bucket, 1, 13), domain, ip, source_ip, chain, rule
"#;

pub const BACKFILL_HOURLY_COUNTRY_STATS: &str = r#"
INSERT INTO hourly_country_stats (backend_id, bucket, country, country_name, continent, upload, download, connections)
SELECT backend_id, substr(bucket, 1, 13) || ':00:00', country, MAX(country_name), MAX(continent),
       SUM(upload), SUM(download), SUM(connections)
FROM minute_country_stats
GROUP BY backend_id, substr(bucket, 1, 13), country
"#;

/// Tables holding time-bucketed facts, pruned by age.
pub const MINUTE_FACT_TABLES: &[&str] = &["minute_stats", "minute_dim_stats", "minute_country_stats"];
pub const HOURLY_FACT_TABLES: &[&str] = &["hourly_stats", "hourly_dim_stats", "hourly_country_stats"];

/// All-time tables, only ever wiped whole.
pub const DIMENSION_TABLES: &[&str] = &[
    "domain_stats",
    "ip_stats",
    "proxy_stats",
    "rule_stats",
    "rule_proxy_map",
    "rule_chain_traffic",
    "rule_domain_traffic",
    "rule_ip_traffic",
    "country_stats",
    "device_stats",
    "device_domain_stats",
    "device_ip_stats",
    "domain_proxy_stats",
    "ip_proxy_stats",
];
