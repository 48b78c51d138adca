//! Flowstats - replay a gateway traffic feed into the aggregation store
//!
//! Reads NDJSON connection deltas from stdin, one per line:
//! `{"backendId": 1, "domain": "a.com", "chains": ["ProxyA", "RuleX"], "upload": 10, ...}`
//! A line carrying a `country` object is recorded as a country delta instead.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use flowstats::config::Config;
use flowstats::db::{start_write_buffer, Database, RangeFilter, WriteOp};
use flowstats::model::{CountryUpdate, TrafficUpdate};
use flowstats::stats::StatsService;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IngestLine {
    backend_id: i64,
    #[serde(default)]
    country: Option<CountryUpdate>,
    #[serde(flatten)]
    update: TrafficUpdate,
}

impl IngestLine {
    fn into_op(self) -> WriteOp {
        match self.country {
            Some(country) => WriteOp::Country(self.backend_id, country),
            None => WriteOp::Traffic(self.backend_id, self.update),
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // Use LOG_FORMAT=gcp for structured GCP Cloud Logging
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "gcp" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (before any other initialization)
    let _ = dotenvy::dotenv();

    let config = Config::load()?;
    init_logging(&config.logging.level);
    info!("Starting flowstats...");

    let db = Arc::new(Database::new(&config.database, &config.writer).await?);
    db.run_migrations().await?;
    info!("Database initialized at {}", config.database.url);

    let service = StatsService::new(db.clone(), &config)?;
    if config.clickhouse_enabled() {
        info!("ClickHouse reads enabled ({:?})", config.clickhouse.source);
    }
    let retention = service.start_retention(config.retention.clone());
    let sweeper = service.cache().clone().start_sweeper();

    let (write_tx, writer) = start_write_buffer(db.clone(), &config.writer);

    let mut known_backends = HashSet::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_no = 0u64;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let record: IngestLine = match serde_json::from_str(&line) {
            Ok(record) => record,
            Err(e) => {
                warn!(line = line_no, "Skipping malformed record: {}", e);
                continue;
            }
        };
        if known_backends.insert(record.backend_id) {
            db.ensure_backend(record.backend_id).await?;
        }
        if write_tx.send(record.into_op()).is_err() {
            warn!("Write buffer stopped, ending ingest");
            break;
        }
    }

    // Closing the channel makes the buffer flush and exit
    drop(write_tx);
    let summary = writer.await?;
    retention.abort();
    sweeper.abort();

    for (backend_id, stats) in &summary {
        let totals = service.get_summary(*backend_id, None, &RangeFilter::default()).await?;
        info!(
            backend_id,
            events = stats.events,
            dropped = stats.dropped,
            rows = stats.rows,
            transactions = stats.transactions,
            upload = totals.totals.total_upload,
            download = totals.totals.total_download,
            domains = totals.unique_domains,
            "Ingest finished"
        );
    }
    info!("Processed {} lines", line_no);

    Ok(())
}
