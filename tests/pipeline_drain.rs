use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use roundhouse::config::{ArchiveConfig, Config, SeriesSpecConfig};
use roundhouse::pipeline::{NoopServiceManager, Pipeline};
use roundhouse::series::{DataPoint, SeriesSnapshot, Stat};
use roundhouse::store::{MemStore, StoredSeries};

fn rule(pattern: &str) -> SeriesSpecConfig {
    SeriesSpecConfig {
        pattern: pattern.to_string(),
        step: Duration::from_secs(1),
        heartbeat: Duration::from_secs(300),
        archives: vec![ArchiveConfig {
            resolution: Duration::from_secs(1),
            size: 1 << 16,
        }],
    }
}

/// Config tuned for determinism: no flush floor, a periodic check range
/// wide enough that age-based flushes never fire inside a test, and a
/// random health port.
fn test_config(workers: usize, max_points: usize, patterns: &[&str]) -> Config {
    let mut cfg = Config::default();
    cfg.workers = workers;
    cfg.min_cache = Duration::ZERO;
    cfg.max_cache = Duration::from_secs(3600);
    cfg.max_cached_points = max_points;
    cfg.stat_flush = Duration::from_secs(1);
    cfg.stats_prefix = "s".to_string();
    cfg.queues.arrival = 1 << 16;
    cfg.health.addr = ":0".to_string();
    cfg.series = patterns.iter().map(|p| rule(p)).collect();
    cfg
}

async fn started_pipeline(cfg: Config, store: Arc<MemStore>) -> Pipeline {
    let mut pipeline =
        Pipeline::new(cfg, store, Box::new(NoopServiceManager)).expect("pipeline builds");
    pipeline.start("").await.expect("pipeline starts");
    pipeline
}

fn at(secs: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs)
}

fn slot_count(snap: &SeriesSnapshot) -> usize {
    snap.archives[0].slots.len()
}

fn first_value(snap: &SeriesSnapshot) -> f64 {
    *snap.archives[0].slots.values().next().expect("has a slot")
}

/// Sleeps until shortly after the next wall-clock multiple of `every`,
/// so subsequent queueing cannot straddle a stat flush boundary.
async fn sleep_past_boundary(every: Duration) {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    let to_boundary = every.as_nanos() - since_epoch.as_nanos() % every.as_nanos();
    tokio::time::sleep(Duration::from_nanos(to_boundary as u64) + Duration::from_millis(120)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_lazy_creation_and_point_threshold_flush() {
    let store = Arc::new(MemStore::new());
    let mut pipeline = started_pipeline(test_config(1, 3, &["foo.*"]), Arc::clone(&store)).await;

    for (i, v) in [1.0, 2.0, 3.0].into_iter().enumerate() {
        pipeline
            .queue_data_point(DataPoint {
                name: "foo.bar".to_string(),
                timestamp: at(i as u64),
                value: v,
            })
            .await;
    }

    // Reaching max_points flushes from the ingest path, before shutdown.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let flushed = store.flushed().await;
    assert_eq!(flushed.len(), 1);
    assert_eq!(flushed[0].name, "foo.bar");
    assert_eq!(slot_count(&flushed[0]), 3);
    assert_eq!(
        flushed[0].archives[0].slots.values().copied().collect::<Vec<_>>(),
        vec![1.0, 2.0, 3.0]
    );

    let registry = Arc::clone(pipeline.registry());
    assert_eq!(registry.len(), 1);
    let id = registry.get_by_name("foo.bar").expect("series exists").id;

    // The live series was cleared when the snapshot rotated out.
    let copy = pipeline.request_series_copy(id).await.expect("copy");
    assert_eq!(slot_count(&copy), 0);

    pipeline.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unprovisioned_names_are_dropped_silently() {
    let store = Arc::new(MemStore::new());
    let mut pipeline = started_pipeline(test_config(1, 3, &["foo.*"]), Arc::clone(&store)).await;

    pipeline
        .queue_data_point(DataPoint {
            name: "bar.unknown".to_string(),
            timestamp: at(0),
            value: 1.0,
        })
        .await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(pipeline.registry().is_empty());

    pipeline.stop().await;
    assert!(store.flushed().await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_graceful_drain_flushes_every_series() {
    let store = Arc::new(MemStore::new());
    let mut pipeline =
        started_pipeline(test_config(4, 1 << 30, &["load.*"]), Arc::clone(&store)).await;

    let series = 10;
    let points_per_series = 1_000u64;
    for s in 0..series {
        let name = format!("load.s{s}");
        for i in 0..points_per_series {
            pipeline
                .queue_data_point(DataPoint {
                    name: name.clone(),
                    timestamp: at(i),
                    value: i as f64,
                })
                .await;
        }
    }

    // Stop immediately after the last point; the drain protocol must
    // still deliver every one of them to the store.
    pipeline.stop().await;

    let flushed = store.flushed().await;
    assert_eq!(flushed.len(), series);

    let names: HashSet<&str> = flushed.iter().map(|s| s.name.as_str()).collect();
    for s in 0..series {
        assert!(names.contains(format!("load.s{s}").as_str()));
    }

    let total: usize = flushed.iter().map(slot_count).sum();
    assert_eq!(total, series * points_per_series as usize);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_same_name_creates_one_series() {
    let store = Arc::new(MemStore::new());
    let pipeline = Arc::new(
        started_pipeline(test_config(2, 1 << 30, &["foo.*"]), Arc::clone(&store)).await,
    );

    let mut producers = Vec::new();
    for _ in 0..8 {
        let handle = pipeline.handle();
        producers.push(tokio::spawn(async move {
            for _ in 0..50 {
                handle
                    .queue_data_point(DataPoint {
                        name: "foo.same".to_string(),
                        timestamp: at(1_000),
                        value: 1.0,
                    })
                    .await;
            }
        }));
    }
    for p in producers {
        p.await.unwrap();
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(pipeline.registry().len(), 1);

    let mut pipeline = Arc::try_unwrap(pipeline).ok().expect("sole owner");
    pipeline.stop().await;

    let flushed = store.flushed().await;
    assert_eq!(flushed.len(), 1);
    // All 400 points shared a timestamp, so they consolidated into one slot.
    assert_eq!(slot_count(&flushed[0]), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_flush_order_per_series_is_monotone() {
    let store = Arc::new(MemStore::new());
    let mut pipeline = started_pipeline(test_config(1, 2, &["foo.*"]), Arc::clone(&store)).await;

    for i in 0..6u64 {
        pipeline
            .queue_data_point(DataPoint {
                name: "foo.ordered".to_string(),
                timestamp: at(i),
                value: i as f64,
            })
            .await;
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    pipeline.stop().await;

    let flushed = store.flushed().await;
    assert_eq!(flushed.len(), 3);
    for pair in flushed.windows(2) {
        assert!(pair[0].last_flush <= pair[1].last_flush);
        assert_eq!(pair[0].name, "foo.ordered");
    }
    for snap in &flushed {
        assert_eq!(slot_count(snap), 2);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stats_round_trip_into_flushed_series() {
    let store = Arc::new(MemStore::new());
    let mut pipeline =
        started_pipeline(test_config(1, 1 << 30, &["s.**"]), Arc::clone(&store)).await;

    // Land just after a flush boundary so the whole batch aggregates
    // into a single interval.
    sleep_past_boundary(Duration::from_secs(1)).await;

    for v in [2.0, 3.0, 5.0] {
        pipeline.queue_stat(Stat::new("hits", "c", v)).await;
    }
    for v in [0.4, 0.9, 0.2] {
        pipeline.queue_stat(Stat::new("cpu", "g", v)).await;
    }
    for v in [10.0, 20.0, 30.0] {
        pipeline.queue_stat(Stat::new("rt", "ms", v)).await;
    }
    // Unknown metric kind: logged and ignored, aggregator stays live.
    pipeline.queue_stat(Stat::new("x", "q", 1.0)).await;

    // Cover the next boundary plus dispatch margin.
    tokio::time::sleep(Duration::from_millis(1_300)).await;
    pipeline.stop().await;

    let flushed = store.flushed().await;
    let value_of = |name: &str| -> f64 {
        let snap = flushed
            .iter()
            .find(|s| s.name == name)
            .unwrap_or_else(|| panic!("series {name} was flushed"));
        first_value(snap)
    };

    assert_eq!(value_of("s.hits"), 10.0);
    assert_eq!(value_of("s.gauges.cpu"), 0.2);
    assert_eq!(value_of("s.timers.rt.count"), 3.0);
    assert_eq!(value_of("s.timers.rt.lower"), 10.0);
    assert_eq!(value_of("s.timers.rt.upper"), 30.0);
    assert_eq!(value_of("s.timers.rt.sum"), 60.0);
    assert_eq!(value_of("s.timers.rt.mean"), 20.0);

    assert!(!flushed.iter().any(|s| s.name == "s.x"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_series_copy_reads_live_state_without_clearing() {
    let store = Arc::new(MemStore::new());
    let mut pipeline =
        started_pipeline(test_config(2, 1 << 30, &["foo.*"]), Arc::clone(&store)).await;

    pipeline
        .queue_data_point(DataPoint {
            name: "foo.copied".to_string(),
            timestamp: at(0),
            value: 1.0,
        })
        .await;
    pipeline
        .queue_data_point(DataPoint {
            name: "foo.copied".to_string(),
            timestamp: at(1),
            value: 2.0,
        })
        .await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    let id = pipeline
        .registry()
        .get_by_name("foo.copied")
        .expect("series exists")
        .id;

    let copy = pipeline.request_series_copy(id).await.expect("copy");
    assert_eq!(copy.name, "foo.copied");
    assert_eq!(slot_count(&copy), 2);

    assert!(pipeline.request_series_copy(9_999).await.is_none());

    // The read copy left the pending slots in place for the final flush.
    pipeline.stop().await;
    let flushed = store.flushed().await;
    assert_eq!(flushed.len(), 1);
    assert_eq!(slot_count(&flushed[0]), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_registry_reload_resumes_stored_series() {
    let store = Arc::new(MemStore::with_series(vec![StoredSeries {
        id: 5,
        name: "foo.preloaded".to_string(),
        spec: roundhouse::series::SeriesSpec {
            step: Duration::from_secs(1),
            heartbeat: Duration::from_secs(300),
            archives: vec![roundhouse::series::ArchiveSpec {
                resolution: Duration::from_secs(1),
                size: 60,
            }],
        },
    }]));
    let mut pipeline =
        started_pipeline(test_config(2, 1 << 30, &["foo.*"]), Arc::clone(&store)).await;

    assert_eq!(pipeline.registry().len(), 1);

    pipeline
        .queue_data_point(DataPoint {
            name: "foo.preloaded".to_string(),
            timestamp: at(0),
            value: 1.0,
        })
        .await;
    pipeline
        .queue_data_point(DataPoint {
            name: "foo.fresh".to_string(),
            timestamp: at(0),
            value: 2.0,
        })
        .await;

    tokio::time::sleep(Duration::from_millis(300)).await;

    // The restored series kept its stored id; new ids start past it.
    assert_eq!(
        pipeline.registry().get_by_name("foo.preloaded").unwrap().id,
        5
    );
    assert_eq!(pipeline.registry().get_by_name("foo.fresh").unwrap().id, 6);

    pipeline.stop().await;

    let names: HashSet<String> = store
        .flushed()
        .await
        .iter()
        .map(|s| s.name.clone())
        .collect();
    assert!(names.contains("foo.preloaded"));
    assert!(names.contains("foo.fresh"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_without_traffic_is_clean() {
    let store = Arc::new(MemStore::new());
    let mut pipeline = started_pipeline(test_config(2, 3, &["foo.*"]), Arc::clone(&store)).await;

    // Stats queued right before stop are drained by the aggregator; the
    // derived points cannot re-enter the closed arrival queue and are
    // dropped rather than wedging shutdown.
    pipeline.queue_stat(Stat::new("hits", "c", 1.0)).await;

    tokio::time::timeout(Duration::from_secs(10), pipeline.stop())
        .await
        .expect("shutdown completes promptly");

    assert!(store.flushed().await.is_empty());
}
