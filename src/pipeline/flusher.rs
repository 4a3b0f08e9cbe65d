use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info};

use crate::health::HealthMetrics;
use crate::series::SeriesSnapshot;
use crate::store::Store;

/// One flusher shard. Shares the worker pool's `id mod workers` affinity,
/// so snapshots for a given series reach the store strictly in the order
/// the owning worker produced them. Flush errors are never fatal: the
/// snapshot is discarded and the next flush retries the then-current
/// state.
pub(crate) async fn run(
    shard: usize,
    mut inbox: mpsc::Receiver<SeriesSnapshot>,
    store: Arc<dyn Store>,
    health: Arc<HealthMetrics>,
    started: mpsc::Sender<()>,
) {
    info!(flusher = shard, "flusher started");
    let _ = started.send(()).await;
    drop(started);

    while let Some(snapshot) = inbox.recv().await {
        match store.flush_series(&snapshot).await {
            Ok(()) => health.flushes.inc(),
            Err(e) => {
                health.flush_errors.inc();
                error!(
                    flusher = shard,
                    series = %snapshot.name,
                    id = snapshot.id,
                    error = %e,
                    "flush failed",
                );
            }
        }
    }

    info!(flusher = shard, "inbox closed, flusher finished");
}
