use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::series::{ArchiveSpec, SeriesSpec};

/// Top-level configuration for the roundhouse engine.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Number of worker shards (and flusher shards). Default: CPU count.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Floor on the time between flushes of a series. Default: 5s.
    #[serde(default = "default_min_cache", with = "humantime_serde")]
    pub min_cache: Duration,

    /// Ceiling on the time a series may go unflushed. Default: 30s.
    #[serde(default = "default_max_cache", with = "humantime_serde")]
    pub max_cache: Duration,

    /// Buffered-slot count that forces a flush regardless of age.
    /// Default: 4096.
    #[serde(default = "default_max_cached_points")]
    pub max_cached_points: usize,

    /// Stat aggregation interval; flushes align to wall-clock multiples
    /// of this duration. Default: 10s.
    #[serde(default = "default_stat_flush", with = "humantime_serde")]
    pub stat_flush: Duration,

    /// Name prefix for data points derived from stats. Default: "stats".
    #[serde(default = "default_stats_prefix")]
    pub stats_prefix: String,

    /// Channel depths for the pipeline stages.
    #[serde(default)]
    pub queues: QueueConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Ordered series provisioning rules; the first matching pattern wins.
    #[serde(default)]
    pub series: Vec<SeriesSpecConfig>,
}

/// Channel depths for the pipeline stages. The arrival queue is sized to
/// absorb a graceful-restart backlog; the flusher queue defaults to 1 so
/// a slow store throttles flush rate without stalling ingestion.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_arrival_queue")]
    pub arrival: usize,

    #[serde(default = "default_worker_queue")]
    pub worker: usize,

    #[serde(default = "default_stat_queue")]
    pub stat: usize,

    #[serde(default = "default_flusher_queue")]
    pub flusher: usize,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9099".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

/// One provisioning rule: a dot-glob name pattern plus the series schema
/// created for names it matches.
#[derive(Debug, Clone, Deserialize)]
pub struct SeriesSpecConfig {
    /// Dot-separated pattern. `*` matches exactly one segment; a trailing
    /// `**` matches one or more remaining segments.
    pub pattern: String,

    /// Nominal interval between logical samples. Default: 10s.
    #[serde(default = "default_step", with = "humantime_serde")]
    pub step: Duration,

    /// Maximum gap between samples before the interval is undefined.
    /// Default: 2h.
    #[serde(default = "default_heartbeat", with = "humantime_serde")]
    pub heartbeat: Duration,

    pub archives: Vec<ArchiveConfig>,
}

/// One round-robin archive definition.
#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveConfig {
    /// Width of one archive slot.
    #[serde(with = "humantime_serde")]
    pub resolution: Duration,

    /// Number of slots in the circular buffer.
    pub size: usize,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_min_cache() -> Duration {
    Duration::from_secs(5)
}

fn default_max_cache() -> Duration {
    Duration::from_secs(30)
}

fn default_max_cached_points() -> usize {
    4096
}

fn default_stat_flush() -> Duration {
    Duration::from_secs(10)
}

fn default_stats_prefix() -> String {
    "stats".to_string()
}

fn default_arrival_queue() -> usize {
    1 << 20
}

fn default_worker_queue() -> usize {
    1024
}

fn default_stat_queue() -> usize {
    1024
}

fn default_flusher_queue() -> usize {
    1
}

fn default_health_addr() -> String {
    ":9099".to_string()
}

fn default_step() -> Duration {
    Duration::from_secs(10)
}

fn default_heartbeat() -> Duration {
    Duration::from_secs(7200)
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            workers: default_workers(),
            min_cache: default_min_cache(),
            max_cache: default_max_cache(),
            max_cached_points: default_max_cached_points(),
            stat_flush: default_stat_flush(),
            stats_prefix: default_stats_prefix(),
            queues: QueueConfig::default(),
            health: HealthConfig::default(),
            series: Vec::new(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            arrival: default_arrival_queue(),
            worker: default_worker_queue(),
            stat: default_stat_queue(),
            flusher: default_flusher_queue(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            bail!("workers must be positive");
        }

        if self.min_cache > self.max_cache {
            bail!("min_cache must not exceed max_cache");
        }

        if self.max_cached_points == 0 {
            bail!("max_cached_points must be positive");
        }

        if self.stat_flush.is_zero() {
            bail!("stat_flush must be positive");
        }

        if self.queues.arrival == 0
            || self.queues.worker == 0
            || self.queues.stat == 0
            || self.queues.flusher == 0
        {
            bail!("queue depths must be positive");
        }

        for rule in &self.series {
            if rule.pattern.is_empty() || rule.pattern.split('.').any(str::is_empty) {
                bail!("series pattern {:?} has empty segments", rule.pattern);
            }

            if rule.step.is_zero() {
                bail!("series pattern {:?}: step must be positive", rule.pattern);
            }

            if rule.archives.is_empty() {
                bail!("series pattern {:?} has no archives", rule.pattern);
            }

            for archive in &rule.archives {
                if archive.size == 0 || archive.resolution.is_zero() {
                    bail!(
                        "series pattern {:?}: archives need a positive size and resolution",
                        rule.pattern
                    );
                }
            }
        }

        Ok(())
    }

    /// Returns the schema for the first provisioning rule whose pattern
    /// matches `name`, or None if the name is not provisioned.
    pub fn find_matching_spec(&self, name: &str) -> Option<SeriesSpec> {
        self.series
            .iter()
            .find(|rule| pattern_matches(&rule.pattern, name))
            .map(SeriesSpecConfig::to_spec)
    }
}

impl SeriesSpecConfig {
    fn to_spec(&self) -> SeriesSpec {
        SeriesSpec {
            step: self.step,
            heartbeat: self.heartbeat,
            archives: self
                .archives
                .iter()
                .map(|a| ArchiveSpec {
                    resolution: a.resolution,
                    size: a.size,
                })
                .collect(),
        }
    }
}

/// Dot-glob match: `*` matches exactly one segment, a trailing `**`
/// matches one or more remaining segments.
fn pattern_matches(pattern: &str, name: &str) -> bool {
    let pat: Vec<&str> = pattern.split('.').collect();
    let segs: Vec<&str> = name.split('.').collect();

    for (i, p) in pat.iter().enumerate() {
        if *p == "**" && i == pat.len() - 1 {
            return segs.len() > i;
        }
        match segs.get(i) {
            Some(s) if *p == "*" || p == s => {}
            _ => return false,
        }
    }

    pat.len() == segs.len()
}
