use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::health::HealthMetrics;
use crate::registry::Registry;
use crate::series::{Series, SeriesSnapshot};

use super::{CopyRequest, FlushTuning, ResolvedPoint};

/// Jittered delay before the next periodic flush check, drawn uniformly
/// from `[min_cache, max_cache]` in milliseconds. The jitter spreads
/// flushes across shards so the store never sees a correlated burst.
fn flush_check_delay(tuning: &FlushTuning) -> Duration {
    let min = tuning.min_cache.as_millis() as u64;
    let max = (tuning.max_cache.as_millis() as u64).max(min);
    Duration::from_millis(rand::thread_rng().gen_range(min..=max))
}

/// Snapshots the series (stamping the flush time and clearing the rotated
/// buffers in the same critical section) and hands the copy to the
/// shard's flusher.
async fn flush_series(series: &Series, flusher_tx: &mpsc::Sender<SeriesSnapshot>) {
    let snapshot = series
        .state
        .lock()
        .flush_snapshot(series.id, &series.name, SystemTime::now());

    if flusher_tx.send(snapshot).await.is_err() {
        warn!(series = %series.name, "flusher inbox closed, dropping snapshot");
    }
}

/// One worker shard. Exclusively owns every series whose `id mod workers`
/// equals this shard index: all sample application, flush decisions, and
/// read copies for those series happen on this task.
pub(crate) async fn run(
    shard: usize,
    mut inbox: mpsc::Receiver<ResolvedPoint>,
    mut copy_rx: mpsc::Receiver<CopyRequest>,
    flusher_tx: mpsc::Sender<SeriesSnapshot>,
    registry: Arc<Registry>,
    tuning: FlushTuning,
    health: Arc<HealthMetrics>,
    started: mpsc::Sender<()>,
) {
    // Series mutated since their last flush decision.
    let mut recent: HashSet<i64> = HashSet::new();

    info!(worker = shard, "worker started");
    let _ = started.send(()).await;
    drop(started);

    let mut flush_check = Box::pin(tokio::time::sleep(flush_check_delay(&tuning)));

    loop {
        tokio::select! {
            () = &mut flush_check => {
                periodic_flush(shard, &mut recent, &registry, &flusher_tx, &tuning).await;
                flush_check
                    .as_mut()
                    .reset(Instant::now() + flush_check_delay(&tuning));
            }

            point = inbox.recv() => match point {
                Some(point) => {
                    apply_point(shard, point, &mut recent, &flusher_tx, &tuning, &health).await;
                }
                None => {
                    // Inbox closed: unconditionally flush everything we
                    // still hold, then exit.
                    info!(worker = shard, "inbox closed, flushing all cached series");
                    let ids: Vec<i64> = recent.drain().collect();
                    for id in ids {
                        match registry.get_by_id(id) {
                            Some(series) => flush_series(&series, &flusher_tx).await,
                            None => warn!(
                                worker = shard,
                                series = id,
                                "series vanished before final flush"
                            ),
                        }
                    }
                    break;
                }
            },

            Some(request) = copy_rx.recv() => {
                // Read path: copies never alter the recent set.
                match registry.get_by_id(request.id) {
                    Some(series) => {
                        let snapshot = series
                            .state
                            .lock()
                            .read_snapshot(series.id, &series.name);
                        let _ = request.resp.send(snapshot);
                    }
                    None => warn!(
                        worker = shard,
                        series = request.id,
                        "copy requested for unknown series id"
                    ),
                }
            }
        }
    }

    info!(worker = shard, "worker finished");
}

async fn apply_point(
    shard: usize,
    point: ResolvedPoint,
    recent: &mut HashSet<i64>,
    flusher_tx: &mpsc::Sender<SeriesSnapshot>,
    tuning: &FlushTuning,
    health: &HealthMetrics,
) {
    let series = point.series;

    let outcome = {
        let mut state = series.state.lock();
        state.process(point.value, point.timestamp).map(|()| {
            state.should_be_flushed(
                tuning.max_points,
                tuning.min_cache,
                tuning.max_cache,
                SystemTime::now(),
            )
        })
    };

    match outcome {
        Ok(true) => {
            flush_series(&series, flusher_tx).await;
            recent.remove(&series.id);
        }
        Ok(false) => {
            recent.insert(series.id);
        }
        Err(e) => {
            health.process_errors.inc();
            warn!(worker = shard, series = %series.name, error = %e, "dropping sample");
        }
    }
}

async fn periodic_flush(
    shard: usize,
    recent: &mut HashSet<i64>,
    registry: &Registry,
    flusher_tx: &mpsc::Sender<SeriesSnapshot>,
    tuning: &FlushTuning,
) {
    let ids: Vec<i64> = recent.iter().copied().collect();
    for id in ids {
        let Some(series) = registry.get_by_id(id) else {
            warn!(worker = shard, series = id, "cannot look up series id to flush");
            recent.remove(&id);
            continue;
        };

        let due = series.state.lock().should_be_flushed(
            tuning.max_points,
            tuning.min_cache,
            tuning.max_cache,
            SystemTime::now(),
        );
        if due {
            flush_series(&series, flusher_tx).await;
            recent.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flush_check_delay_stays_in_range() {
        let tuning = FlushTuning {
            min_cache: Duration::from_millis(100),
            max_cache: Duration::from_millis(200),
            max_points: 100,
        };

        for _ in 0..1000 {
            let d = flush_check_delay(&tuning);
            assert!(d >= tuning.min_cache && d <= tuning.max_cache);
        }
    }

    #[test]
    fn test_flush_check_delay_handles_collapsed_range() {
        let tuning = FlushTuning {
            min_cache: Duration::from_millis(250),
            max_cache: Duration::from_millis(250),
            max_points: 100,
        };
        assert_eq!(flush_check_delay(&tuning), Duration::from_millis(250));
    }
}
