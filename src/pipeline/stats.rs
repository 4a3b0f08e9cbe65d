use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::health::HealthMetrics;
use crate::series::{DataPoint, Stat};

/// Accumulated statsd-style observations for one flush interval.
///
/// Counters sum, gauges keep the last write, timers collect every
/// observation. Draining converts the buckets into derived data points
/// and resets them.
#[derive(Default)]
pub struct StatBuckets {
    counts: HashMap<String, i64>,
    gauges: HashMap<String, f64>,
    timers: HashMap<String, Vec<f64>>,
}

impl StatBuckets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one stat in. Returns false for an unknown metric kind, which
    /// the caller logs and drops.
    pub fn apply(&mut self, stat: &Stat) -> bool {
        match stat.metric.as_str() {
            "c" => {
                *self.counts.entry(stat.name.clone()).or_insert(0) += stat.value as i64;
            }
            "g" => {
                self.gauges.insert(stat.name.clone(), stat.value);
            }
            "ms" => {
                self.timers.entry(stat.name.clone()).or_default().push(stat.value);
            }
            _ => return false,
        }
        true
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty() && self.gauges.is_empty() && self.timers.is_empty()
    }

    /// Converts the buckets into derived data points, stamped `now`, and
    /// resets all three maps.
    ///
    /// Counters emit `<prefix>.<name>` as a per-second rate over
    /// `interval`. Gauges emit `<prefix>.gauges.<name>` with the stored
    /// value. Timers always emit `.count`, plus `.lower`/`.upper`/
    /// `.sum`/`.mean` when any observations arrived.
    pub fn drain_into(
        &mut self,
        prefix: &str,
        interval: Duration,
        now: SystemTime,
        out: &mut Vec<DataPoint>,
    ) {
        let secs = interval.as_secs_f64();

        for (name, count) in self.counts.drain() {
            out.push(DataPoint {
                name: format!("{prefix}.{name}"),
                timestamp: now,
                value: count as f64 / secs,
            });
        }

        for (name, gauge) in self.gauges.drain() {
            out.push(DataPoint {
                name: format!("{prefix}.gauges.{name}"),
                timestamp: now,
                value: gauge,
            });
        }

        for (name, times) in self.timers.drain() {
            out.push(DataPoint {
                name: format!("{prefix}.timers.{name}.count"),
                timestamp: now,
                value: times.len() as f64,
            });

            if let Some((&first, rest)) = times.split_first() {
                let mut lower = first;
                let mut upper = first;
                let mut sum = first;
                for &v in rest {
                    lower = lower.min(v);
                    upper = upper.max(v);
                    sum += v;
                }

                for (suffix, value) in [
                    ("lower", lower),
                    ("upper", upper),
                    ("sum", sum),
                    ("mean", sum / times.len() as f64),
                ] {
                    out.push(DataPoint {
                        name: format!("{prefix}.timers.{name}.{suffix}"),
                        timestamp: now,
                        value,
                    });
                }
            }
        }
    }
}

/// Time to sleep so the next wake lands on the next wall-clock multiple
/// of `every`. A wake exactly on a boundary sleeps a full interval.
fn until_next_boundary(now: SystemTime, every: Duration) -> Duration {
    let since_epoch = now.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
    let period = every.as_nanos().max(1);
    let rem = since_epoch.as_nanos() % period;
    Duration::from_nanos((period - rem) as u64)
}

/// Signals the aggregator at wall-clock multiples of `every` through a
/// single-slot channel. A deliberate wall-clock sleep rather than a
/// monotonic ticker: emissions stay aligned to externally observable
/// clock boundaries even across clock adjustments. If the previous tick
/// has not been consumed yet the new one is dropped.
async fn aligned_ticks(
    tick_tx: mpsc::Sender<()>,
    every: Duration,
    cancel: CancellationToken,
    health: Arc<HealthMetrics>,
) {
    loop {
        let wait = until_next_boundary(SystemTime::now(), every);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }

        if tick_tx.try_send(()).is_err() {
            health.stat_ticks_dropped.inc();
            warn!("dropping stat flush tick, aggregator busy");
        }
    }
}

async fn flush_buckets(
    buckets: &mut StatBuckets,
    prefix: &str,
    interval: Duration,
    dp_tx: &mpsc::Sender<DataPoint>,
) {
    if buckets.is_empty() {
        return;
    }

    let mut points = Vec::new();
    buckets.drain_into(prefix, interval, SystemTime::now(), &mut points);
    debug!(points = points.len(), "flushing aggregated stats");

    for dp in points {
        if dp_tx.send(dp).await.is_err() {
            debug!("arrival queue closed, dropping derived stat point");
        }
    }
}

/// The stats aggregator: consumes raw stats, flushes derived data points
/// back into the arrival queue at wall-aligned intervals, and performs a
/// final flush when its inbox closes or shutdown is signalled.
pub(crate) async fn run(
    mut stat_rx: mpsc::Receiver<Stat>,
    dp_tx: mpsc::Sender<DataPoint>,
    cancel: CancellationToken,
    flush_every: Duration,
    prefix: String,
    health: Arc<HealthMetrics>,
    started: mpsc::Sender<()>,
) {
    let (tick_tx, mut tick_rx) = mpsc::channel::<()>(1);
    tokio::spawn(aligned_ticks(
        tick_tx,
        flush_every,
        cancel.clone(),
        Arc::clone(&health),
    ));

    info!("stat aggregator started");
    let _ = started.send(()).await;
    drop(started);

    let mut buckets = StatBuckets::new();

    loop {
        // A due flush preempts draining of queued stats; check it
        // non-blockingly before selecting.
        if tick_rx.try_recv().is_ok() {
            flush_buckets(&mut buckets, &prefix, flush_every, &dp_tx).await;
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                while let Ok(stat) = stat_rx.try_recv() {
                    if !buckets.apply(&stat) {
                        warn!(kind = %stat.metric, name = %stat.name, "invalid stat metric kind, ignoring");
                    }
                }
                flush_buckets(&mut buckets, &prefix, flush_every, &dp_tx).await;
                break;
            }

            Some(()) = tick_rx.recv() => {
                flush_buckets(&mut buckets, &prefix, flush_every, &dp_tx).await;
            }

            stat = stat_rx.recv() => match stat {
                Some(stat) => {
                    if !buckets.apply(&stat) {
                        warn!(kind = %stat.metric, name = %stat.name, "invalid stat metric kind, ignoring");
                    }
                }
                None => {
                    flush_buckets(&mut buckets, &prefix, flush_every, &dp_tx).await;
                    break;
                }
            },
        }
    }

    info!("stat aggregator finished");
}
