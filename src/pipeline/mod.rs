mod dispatcher;
mod flusher;
pub mod stats;
mod worker;

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::health::HealthMetrics;
use crate::registry::Registry;
use crate::series::{DataPoint, SeriesSnapshot, Stat};
use crate::store::Store;

/// A data point whose target series has been resolved by the dispatcher,
/// on its way to the owning worker shard.
pub(crate) struct ResolvedPoint {
    pub series: Arc<crate::series::Series>,
    pub timestamp: SystemTime,
    pub value: f64,
}

/// Request for a read copy of a live series, served by the owning worker
/// shard so the copy never races a mutation.
pub(crate) struct CopyRequest {
    pub id: i64,
    pub resp: oneshot::Sender<SeriesSnapshot>,
}

/// Worker flush-decision parameters, lifted out of config once at start.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FlushTuning {
    pub min_cache: Duration,
    pub max_cache: Duration,
    pub max_points: usize,
}

/// The wire-side listener surface. Binds sockets on `start` and, on
/// `close_listeners`, stops accepting and waits for in-flight receiver
/// connections to finish. The real TCP/UDP/HTTP receivers live outside
/// this crate.
#[async_trait]
pub trait ServiceManager: Send + Sync {
    async fn start(&mut self, graceful_protos: &str) -> Result<()>;
    async fn close_listeners(&mut self) -> Result<()>;
}

/// Service manager that binds nothing. Used by tests and by deployments
/// where receivers are wired up externally.
pub struct NoopServiceManager;

#[async_trait]
impl ServiceManager for NoopServiceManager {
    async fn start(&mut self, _graceful_protos: &str) -> Result<()> {
        Ok(())
    }

    async fn close_listeners(&mut self) -> Result<()> {
        Ok(())
    }
}

/// The ingestion pipeline: dispatcher, worker shards, flusher shards, and
/// the stats aggregator, plus the machinery to start and drain them in
/// the correct order.
pub struct Pipeline {
    cfg: Arc<Config>,
    registry: Arc<Registry>,
    store: Arc<dyn Store>,
    service: Box<dyn ServiceManager>,
    health: Arc<HealthMetrics>,

    dp_tx: mpsc::Sender<DataPoint>,
    dp_rx: Option<mpsc::Receiver<DataPoint>>,
    stat_tx: mpsc::Sender<Stat>,
    stat_rx: Option<mpsc::Receiver<Stat>>,
    copy_txs: Vec<mpsc::Sender<CopyRequest>>,

    cancel: CancellationToken,
    dispatcher: Option<JoinHandle<()>>,
}

impl Pipeline {
    /// Creates the pipeline with its arrival and stat queues allocated.
    /// Producers may queue immediately; nothing is consumed until
    /// `start` launches the dispatcher.
    pub fn new(
        cfg: Config,
        store: Arc<dyn Store>,
        service: Box<dyn ServiceManager>,
    ) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        let (dp_tx, dp_rx) = mpsc::channel(cfg.queues.arrival);
        let (stat_tx, stat_rx) = mpsc::channel(cfg.queues.stat);

        Ok(Self {
            cfg: Arc::new(cfg),
            registry: Arc::new(Registry::new()),
            store,
            service,
            health,
            dp_tx,
            dp_rx: Some(dp_rx),
            stat_tx,
            stat_rx: Some(stat_rx),
            copy_txs: Vec::new(),
            cancel: CancellationToken::new(),
            dispatcher: None,
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    /// Producer surface for all receivers. Blocks only when the arrival
    /// queue is full.
    pub async fn queue_data_point(&self, dp: DataPoint) {
        self.health.points_received.inc();
        if self.dp_tx.send(dp).await.is_err() {
            warn!("arrival queue closed, dropping data point");
        }
    }

    /// Producer surface for statsd-style events.
    pub async fn queue_stat(&self, stat: Stat) {
        self.health.stats_received.inc();
        if self.stat_tx.send(stat).await.is_err() {
            debug!("stat queue closed, dropping stat");
        }
    }

    /// A cheap clonable producer handle for receiver tasks.
    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle {
            dp_tx: self.dp_tx.clone(),
            stat_tx: self.stat_tx.clone(),
            health: Arc::clone(&self.health),
        }
    }

    /// Synchronous read path: a structural copy of the live series
    /// produced by its owning worker shard, or None if the id is
    /// unknown (or the pipeline has stopped).
    pub async fn request_series_copy(&self, id: i64) -> Option<SeriesSnapshot> {
        if self.copy_txs.is_empty() {
            return None;
        }

        let shard = (id.rem_euclid(self.copy_txs.len() as i64)) as usize;
        let (resp, rx) = oneshot::channel();
        self.copy_txs[shard]
            .send(CopyRequest { id, resp })
            .await
            .ok()?;
        rx.await.ok()
    }

    /// Starts every stage in dependency order. With a nonempty
    /// `graceful_protos` the predecessor process is signalled to flush
    /// and this process waits for its SIGUSR1 before hydrating the
    /// registry; either way the dispatcher launches last.
    pub async fn start(&mut self, graceful_protos: &str) -> Result<()> {
        let n = self.cfg.workers;
        let tuning = FlushTuning {
            min_cache: self.cfg.min_cache,
            max_cache: self.cfg.max_cache,
            max_points: self.cfg.max_cached_points,
        };

        // Health endpoint first so probes respond while we come up.
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        let expected = 2 * n + 1;
        let (started_tx, mut started_rx) = mpsc::channel::<()>(expected);

        // 1. Flusher channels exist before the workers that feed them.
        let mut flusher_txs = Vec::with_capacity(n);
        let mut flusher_rxs = Vec::with_capacity(n);
        for _ in 0..n {
            let (tx, rx) = mpsc::channel(self.cfg.queues.flusher);
            flusher_txs.push(tx);
            flusher_rxs.push(rx);
        }

        // 2. Workers. Shard i owns all series with id mod n == i, and
        //    flushes through flusher shard i only.
        info!(workers = n, "starting workers");
        let mut worker_txs = Vec::with_capacity(n);
        let mut worker_handles = Vec::with_capacity(n);
        self.copy_txs.clear();
        for shard in 0..n {
            let (tx, rx) = mpsc::channel(self.cfg.queues.worker);
            let (copy_tx, copy_rx) = mpsc::channel(self.cfg.queues.worker);
            worker_txs.push(tx);
            self.copy_txs.push(copy_tx);

            worker_handles.push(tokio::spawn(worker::run(
                shard,
                rx,
                copy_rx,
                flusher_txs[shard].clone(),
                Arc::clone(&self.registry),
                tuning,
                Arc::clone(&self.health),
                started_tx.clone(),
            )));
        }

        // 3. Flushers.
        info!(flushers = n, "starting flushers");
        let mut flusher_handles = Vec::with_capacity(n);
        for (shard, rx) in flusher_rxs.into_iter().enumerate() {
            flusher_handles.push(tokio::spawn(flusher::run(
                shard,
                rx,
                Arc::clone(&self.store),
                Arc::clone(&self.health),
                started_tx.clone(),
            )));
        }

        // 4. Stats aggregator.
        info!("starting stat aggregator");
        let stat_cancel = CancellationToken::new();
        let stat_rx = self
            .stat_rx
            .take()
            .expect("start called more than once");
        let stat_handle = tokio::spawn(stats::run(
            stat_rx,
            self.dp_tx.clone(),
            stat_cancel.clone(),
            self.cfg.stat_flush,
            self.cfg.stats_prefix.clone(),
            Arc::clone(&self.health),
            started_tx.clone(),
        ));
        drop(started_tx);

        // 5. Service manager binds sockets and begins accepting.
        self.service
            .start(graceful_protos)
            .await
            .context("starting service manager")?;

        // 6. Wait for every stage to report in.
        for _ in 0..expected {
            if started_rx.recv().await.is_none() {
                bail!("a pipeline stage exited during startup");
            }
        }
        info!("all pipeline stages running, good to go");

        // 7. Graceful hand-off: tell the predecessor to flush, wait for
        //    its all-clear before loading what it wrote.
        if !graceful_protos.is_empty() {
            parent_handoff().await?;
        }

        // 8. Hydrate the registry, then open the floodgates.
        self.registry
            .reload(self.store.as_ref())
            .await
            .context("reloading registry")?;
        self.health.series_count.set(self.registry.len() as f64);

        let dp_rx = self.dp_rx.take().expect("start called more than once");
        let stages = dispatcher::Stages {
            worker_txs,
            worker_handles,
            flusher_txs,
            flusher_handles,
            stat_tx: self.stat_tx.clone(),
            stat_cancel,
            stat_handle,
        };
        self.dispatcher = Some(tokio::spawn(dispatcher::run(
            dp_rx,
            self.cancel.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.cfg),
            stages,
            Arc::clone(&self.health),
        )));

        Ok(())
    }

    /// Ordered shutdown: listeners first (bounded by the service
    /// manager's own connection drain), then the arrival queue; the
    /// dispatcher drains its backlog and cascades through stats, workers,
    /// and flushers so no accepted point is abandoned.
    pub async fn stop(&mut self) {
        info!("closing service listeners");
        if let Err(e) = self.service.close_listeners().await {
            error!(error = %e, "closing service listeners");
        }

        info!("closing arrival queue");
        self.cancel.cancel();
        if let Some(handle) = self.dispatcher.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "dispatcher join failed");
            }
        }

        if let Err(e) = self.health.stop().await {
            error!(error = %e, "stopping health metrics server");
        }

        info!("pipeline stopped");
    }
}

/// Clonable producer surface handed to receiver tasks; callable from
/// many concurrent tasks without touching the pipeline itself.
#[derive(Clone)]
pub struct PipelineHandle {
    dp_tx: mpsc::Sender<DataPoint>,
    stat_tx: mpsc::Sender<Stat>,
    health: Arc<HealthMetrics>,
}

impl PipelineHandle {
    /// Pushes one data point onto the arrival queue. Blocks only when
    /// the queue is full.
    pub async fn queue_data_point(&self, dp: DataPoint) {
        self.health.points_received.inc();
        if self.dp_tx.send(dp).await.is_err() {
            warn!("arrival queue closed, dropping data point");
        }
    }

    /// Pushes one stat event onto the aggregator's queue.
    pub async fn queue_stat(&self, stat: Stat) {
        self.health.stats_received.inc();
        if self.stat_tx.send(stat).await.is_err() {
            debug!("stat queue closed, dropping stat");
        }
    }
}

/// Graceful-restart rendezvous with the predecessor process: SIGTERM to
/// the parent tells it to flush and exit; its SIGUSR1 back signals that
/// the flush is complete and durable state is safe to load.
async fn parent_handoff() -> Result<()> {
    // SAFETY: getppid cannot fail and has no preconditions.
    let parent = unsafe { libc::getppid() };

    info!(parent, "signalling parent to flush and exit");
    // SAFETY: plain kill(2) with a valid signal number.
    if unsafe { libc::kill(parent, libc::SIGTERM) } != 0 {
        return Err(anyhow::Error::new(std::io::Error::last_os_error())
            .context("signalling parent"));
    }

    info!("waiting for the parent to signal that its flush is complete");
    let mut usr1 = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::user_defined1())
        .context("registering SIGUSR1 handler")?;
    usr1.recv().await;
    info!("parent flush complete, proceeding to load data");

    Ok(())
}
