//! Write buffer for async batch inserts
//!
//! Updates are sent to a channel and flushed to the database in batches,
//! one `write_batch` per backend, so a burst of connection deltas becomes a
//! handful of aggregated upserts instead of one transaction each.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::{Database, FlushStats};
use crate::config::WriterConfig;
use crate::model::{CountryUpdate, TrafficUpdate};

/// One queued mutation, tagged with its backend.
#[derive(Debug, Clone)]
pub enum WriteOp {
    Traffic(i64, TrafficUpdate),
    Country(i64, CountryUpdate),
}

/// Sender handle for queueing updates
pub type WriteSender = mpsc::UnboundedSender<WriteOp>;

/// Per-backend totals accumulated until the buffer shuts down.
pub type FlushSummary = BTreeMap<i64, FlushStats>;

/// Start the write buffer background task.
///
/// The task runs until every sender is dropped, flushes what is left and
/// resolves to the per-backend totals it wrote.
pub fn start_write_buffer(db: Arc<Database>, config: &WriterConfig) -> (WriteSender, JoinHandle<FlushSummary>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(write_buffer_task(
        db,
        rx,
        config.batch_size.max(1),
        Duration::from_millis(config.flush_interval_ms.max(1)),
    ));
    (tx, handle)
}

#[derive(Default)]
struct Pending {
    traffic: BTreeMap<i64, Vec<TrafficUpdate>>,
    countries: BTreeMap<i64, Vec<CountryUpdate>>,
    len: usize,
}

impl Pending {
    fn push(&mut self, op: WriteOp) {
        match op {
            WriteOp::Traffic(backend_id, update) => self.traffic.entry(backend_id).or_default().push(update),
            WriteOp::Country(backend_id, update) => self.countries.entry(backend_id).or_default().push(update),
        }
        self.len += 1;
    }

    fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Background task that collects updates and writes them in batches
async fn write_buffer_task(
    db: Arc<Database>,
    mut rx: mpsc::UnboundedReceiver<WriteOp>,
    batch_size: usize,
    flush_every: Duration,
) -> FlushSummary {
    let mut pending = Pending::default();
    let mut summary = FlushSummary::new();
    let mut flush_interval = tokio::time::interval(flush_every);

    info!(
        "Write buffer started (batch_size={}, flush_interval={}ms)",
        batch_size,
        flush_every.as_millis()
    );

    loop {
        tokio::select! {
            op = rx.recv() => {
                match op {
                    Some(op) => {
                        pending.push(op);
                        if pending.len >= batch_size {
                            flush(&db, &mut pending, &mut summary).await;
                        }
                    }
                    None => {
                        // Channel closed, flush remaining and exit
                        if !pending.is_empty() {
                            flush(&db, &mut pending, &mut summary).await;
                        }
                        info!("Write buffer shutting down");
                        break;
                    }
                }
            }
            // Periodic flush for low-traffic periods
            _ = flush_interval.tick() => {
                if !pending.is_empty() {
                    flush(&db, &mut pending, &mut summary).await;
                }
            }
        }
    }
    summary
}

/// Flush every backend's buffered updates. A failed backend loses its batch;
/// the others are still written.
async fn flush(db: &Database, pending: &mut Pending, summary: &mut FlushSummary) {
    let batch = std::mem::take(pending);
    debug!("Flushing {} buffered updates", batch.len);

    for (backend_id, updates) in batch.traffic {
        match db.write_batch(backend_id, &updates).await {
            Ok(stats) => accumulate(summary.entry(backend_id).or_default(), &stats),
            Err(e) => error!(backend_id, "Failed to flush {} traffic updates: {}", updates.len(), e),
        }
    }
    for (backend_id, updates) in batch.countries {
        match db.write_country_batch(backend_id, &updates).await {
            Ok(stats) => accumulate(summary.entry(backend_id).or_default(), &stats),
            Err(e) => error!(backend_id, "Failed to flush {} country updates: {}", updates.len(), e),
        }
    }
}

fn accumulate(total: &mut FlushStats, stats: &FlushStats) {
    total.events += stats.events;
    total.dropped += stats.dropped;
    total.rows += stats.rows;
    total.transactions += stats.transactions;
}
