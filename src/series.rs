use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use thiserror::Error;

/// One arriving sample, as handed in by the wire-side receivers.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPoint {
    /// Series name (dot-separated path).
    pub name: String,
    /// Observation time.
    pub timestamp: SystemTime,
    /// The observed value.
    pub value: f64,
}

impl DataPoint {
    /// Creates a data point stamped with the current time.
    pub fn now(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            timestamp: SystemTime::now(),
            value,
        }
    }
}

/// One statsd-style event. `metric` carries the wire kind: "c" for
/// counters, "g" for gauges, "ms" for timers. Unknown kinds are dropped
/// by the aggregator, so the raw form is kept rather than an enum.
#[derive(Debug, Clone, PartialEq)]
pub struct Stat {
    pub name: String,
    pub metric: String,
    pub value: f64,
}

impl Stat {
    pub fn new(name: impl Into<String>, metric: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            metric: metric.into(),
            value,
        }
    }
}

/// Pattern-derived schema for a series: nominal step, heartbeat, and the
/// round-robin archives it materializes into. Immutable after config load.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesSpec {
    /// Nominal interval between logical samples.
    pub step: Duration,
    /// Maximum gap between samples before the interval is undefined.
    pub heartbeat: Duration,
    pub archives: Vec<ArchiveSpec>,
}

/// One round-robin archive definition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArchiveSpec {
    /// Width of one archive slot.
    pub resolution: Duration,
    /// Number of slots in the circular buffer.
    pub size: usize,
}

/// Error applying a sample to a live series.
#[derive(Debug, Error)]
pub enum SeriesError {
    #[error("sample value is not finite")]
    NonFiniteValue,
    #[error("sample timestamp predates the last update")]
    TimestampOutOfOrder,
    #[error("series spec has no archives")]
    EmptySpec,
    #[error("archive has zero resolution or zero size")]
    DegenerateArchive,
}

/// A single live time series. The id and name never change; the cached
/// state behind the mutex is mutated only by the owning worker shard
/// (`id mod workers`), which also serves read copies, so the lock is
/// uncontended in steady state.
pub struct Series {
    pub id: i64,
    pub name: String,
    pub state: Mutex<SeriesState>,
}

/// Constructs a live series from its spec. Fails on degenerate specs
/// (config validation normally rejects these before they get here).
pub fn create_series(id: i64, name: &str, spec: &SeriesSpec) -> Result<Series, SeriesError> {
    if spec.archives.is_empty() {
        return Err(SeriesError::EmptySpec);
    }
    if spec
        .archives
        .iter()
        .any(|a| a.size == 0 || a.resolution.is_zero())
    {
        return Err(SeriesError::DegenerateArchive);
    }

    Ok(Series {
        id,
        name: name.to_string(),
        state: Mutex::new(SeriesState::new(spec.clone(), SystemTime::now())),
    })
}

/// In-memory cached state of a series: per-archive pending slots plus the
/// update/flush bookkeeping the flush decision runs on.
pub struct SeriesState {
    spec: SeriesSpec,
    /// Pending slot values per archive, keyed by slot index
    /// (timestamp / resolution). Consolidation inside a slot is
    /// last-write-wins; consolidation functions proper live in the
    /// storage backend.
    pending: Vec<BTreeMap<i64, f64>>,
    last_update: Option<SystemTime>,
    last_flush: SystemTime,
}

impl SeriesState {
    pub fn new(spec: SeriesSpec, created: SystemTime) -> Self {
        let pending = spec.archives.iter().map(|_| BTreeMap::new()).collect();
        Self {
            spec,
            pending,
            last_update: None,
            last_flush: created,
        }
    }

    pub fn spec(&self) -> &SeriesSpec {
        &self.spec
    }

    pub fn last_update(&self) -> Option<SystemTime> {
        self.last_update
    }

    pub fn last_flush(&self) -> SystemTime {
        self.last_flush
    }

    /// Applies one sample. Timestamps must not move backwards within a
    /// series; the dispatcher and the per-shard FIFO guarantee arrival
    /// order, so a regression here is a producer bug, not a race.
    pub fn process(&mut self, value: f64, timestamp: SystemTime) -> Result<(), SeriesError> {
        if !value.is_finite() {
            return Err(SeriesError::NonFiniteValue);
        }
        if let Some(last) = self.last_update {
            if timestamp < last {
                return Err(SeriesError::TimestampOutOfOrder);
            }
        }

        let since_epoch = timestamp
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        for (archive, pending) in self.spec.archives.iter().zip(self.pending.iter_mut()) {
            let slot = (since_epoch.as_nanos() / archive.resolution.as_nanos().max(1)) as i64;
            pending.insert(slot, value);
        }
        self.last_update = Some(timestamp);

        Ok(())
    }

    /// Number of buffered slots, taken as the maximum across archives
    /// (the finest archive accumulates fastest and drives the flush
    /// threshold).
    pub fn pending_points(&self) -> usize {
        self.pending.iter().map(BTreeMap::len).max().unwrap_or(0)
    }

    /// Flush decision: never below `min_cache` since the last flush;
    /// above that, flush when at least `max_points` slots are buffered
    /// or the last flush is older than `max_cache`.
    pub fn should_be_flushed(
        &self,
        max_points: usize,
        min_cache: Duration,
        max_cache: Duration,
        now: SystemTime,
    ) -> bool {
        let age = now
            .duration_since(self.last_flush)
            .unwrap_or(Duration::ZERO);
        if age < min_cache {
            return false;
        }
        if self.pending_points() >= max_points {
            return true;
        }
        age > max_cache
    }

    /// Produces the flushable copy: stamps `now` as the last flush time
    /// on both the snapshot and the live state, then clears the rotated
    /// slot buffers so the flusher and subsequent writers see disjoint
    /// state.
    pub fn flush_snapshot(&mut self, id: i64, name: &str, now: SystemTime) -> SeriesSnapshot {
        let snapshot = SeriesSnapshot {
            id,
            name: name.to_string(),
            archives: self.archive_snapshots(),
            last_update: self.last_update,
            last_flush: now,
        };
        self.last_flush = now;
        self.clear_archives();
        snapshot
    }

    /// A structural copy safe to read outside the owning shard. Does not
    /// touch the flush bookkeeping or the pending buffers.
    pub fn read_snapshot(&self, id: i64, name: &str) -> SeriesSnapshot {
        SeriesSnapshot {
            id,
            name: name.to_string(),
            archives: self.archive_snapshots(),
            last_update: self.last_update,
            last_flush: self.last_flush,
        }
    }

    /// Drops all pending slot values, keeping the archive definitions.
    pub fn clear_archives(&mut self) {
        for pending in &mut self.pending {
            pending.clear();
        }
    }

    fn archive_snapshots(&self) -> Vec<ArchiveSnapshot> {
        self.spec
            .archives
            .iter()
            .zip(self.pending.iter())
            .map(|(archive, pending)| ArchiveSnapshot {
                resolution: archive.resolution,
                size: archive.size,
                slots: pending.clone(),
            })
            .collect()
    }
}

/// Flushable copy of a series, disjoint from further mutation of the
/// live state. Created by the owning worker, consumed once by a flusher.
#[derive(Debug, Clone)]
pub struct SeriesSnapshot {
    pub id: i64,
    pub name: String,
    pub archives: Vec<ArchiveSnapshot>,
    pub last_update: Option<SystemTime>,
    pub last_flush: SystemTime,
}

/// Materialized slots of one archive at snapshot time.
#[derive(Debug, Clone)]
pub struct ArchiveSnapshot {
    pub resolution: Duration,
    pub size: usize,
    pub slots: BTreeMap<i64, f64>,
}
