use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::health::HealthMetrics;
use crate::registry::Registry;
use crate::series::{create_series, DataPoint, SeriesSnapshot, Stat};

use super::ResolvedPoint;

/// Everything the dispatcher needs to drain the pipeline in order once
/// the arrival queue closes: stats first, then workers, then flushers.
pub(crate) struct Stages {
    pub worker_txs: Vec<mpsc::Sender<ResolvedPoint>>,
    pub worker_handles: Vec<JoinHandle<()>>,
    pub flusher_txs: Vec<mpsc::Sender<SeriesSnapshot>>,
    pub flusher_handles: Vec<JoinHandle<()>>,
    pub stat_tx: mpsc::Sender<Stat>,
    pub stat_cancel: CancellationToken,
    pub stat_handle: JoinHandle<()>,
}

/// The dispatcher: single owner of the arrival queue. Resolves or lazily
/// creates the target series for each point and forwards it to the
/// owning worker shard. Concentrating creation here guarantees
/// at-most-one insert per name without cross-shard coordination.
pub(crate) async fn run(
    mut dp_rx: mpsc::Receiver<DataPoint>,
    cancel: CancellationToken,
    registry: Arc<Registry>,
    cfg: Arc<Config>,
    stages: Stages,
    health: Arc<HealthMetrics>,
) {
    info!("dispatcher started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // Refuse new input but dispatch everything already queued
                // so no accepted point is abandoned.
                dp_rx.close();
                info!("arrival queue closed, draining backlog");
                while let Some(dp) = dp_rx.recv().await {
                    dispatch_point(dp, &registry, &cfg, &stages.worker_txs, &health).await;
                }
                break;
            }

            dp = dp_rx.recv() => match dp {
                Some(dp) => dispatch_point(dp, &registry, &cfg, &stages.worker_txs, &health).await,
                None => break,
            },
        }
    }

    info!("dispatcher shutting down pipeline stages");
    shutdown_stages(stages).await;
    info!("dispatcher finished");
}

async fn dispatch_point(
    dp: DataPoint,
    registry: &Registry,
    cfg: &Config,
    worker_txs: &[mpsc::Sender<ResolvedPoint>],
    health: &HealthMetrics,
) {
    let series = match registry.get_by_name(&dp.name) {
        Some(series) => series,
        None => {
            let Some(spec) = cfg.find_matching_spec(&dp.name) else {
                // Unknown name with no provisioning rule: not an error.
                health.points_unprovisioned.inc();
                debug!(series = %dp.name, "no spec matches, dropping point");
                return;
            };

            let id = registry.allocate_id();
            match create_series(id, &dp.name, &spec) {
                Ok(series) => {
                    let series = Arc::new(series);
                    registry.insert(Arc::clone(&series));
                    health.series_count.set(registry.len() as f64);
                    debug!(series = %dp.name, id, "created series");
                    series
                }
                Err(e) => {
                    error!(series = %dp.name, error = %e, "creating series failed");
                    return;
                }
            }
        }
    };

    let shard = (series.id.rem_euclid(worker_txs.len() as i64)) as usize;
    let point = ResolvedPoint {
        series,
        timestamp: dp.timestamp,
        value: dp.value,
    };
    if worker_txs[shard].send(point).await.is_err() {
        warn!(worker = shard, "worker inbox closed, dropping point");
    }
}

/// True once a bounded channel holds no queued messages. Messages already
/// received by the consumer task do not count, mirroring a queue-length
/// poll.
fn channel_empty<T>(tx: &mpsc::Sender<T>) -> bool {
    tx.capacity() == tx.max_capacity()
}

const DRAIN_POLL: Duration = Duration::from_millis(100);

async fn shutdown_stages(stages: Stages) {
    let Stages {
        worker_txs,
        worker_handles,
        flusher_txs,
        flusher_handles,
        stat_tx,
        stat_cancel,
        stat_handle,
    } = stages;

    // Stats first: their final flush may still emit derived points, and
    // the workers must outlive anything that can feed them.
    info!("waiting for stat queue to empty");
    while !channel_empty(&stat_tx) {
        tokio::time::sleep(DRAIN_POLL).await;
    }
    stat_cancel.cancel();
    if let Err(e) = stat_handle.await {
        error!(error = %e, "stat aggregator join failed");
    }
    info!("stat aggregator stopped");

    // Workers: wait until every shard inbox is empty, then close them by
    // dropping the only senders. Closing triggers each worker's final
    // unconditional flush pass.
    info!("waiting for worker queues to empty");
    loop {
        if worker_txs.iter().all(channel_empty) {
            break;
        }
        tokio::time::sleep(DRAIN_POLL).await;
    }
    drop(worker_txs);
    for (shard, handle) in worker_handles.into_iter().enumerate() {
        if let Err(e) = handle.await {
            error!(worker = shard, error = %e, "worker join failed");
        }
    }
    info!("all workers finished");

    // Flushers last, after every producer of snapshots is gone.
    drop(flusher_txs);
    for (shard, handle) in flusher_handles.into_iter().enumerate() {
        if let Err(e) = handle.await {
            error!(flusher = shard, error = %e, "flusher join failed");
        }
    }
    info!("all flushers finished");
}
