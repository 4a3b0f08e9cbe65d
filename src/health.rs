use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Counter, Encoder, Gauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Prometheus metrics for engine health and observability, served on
/// /metrics with a trivial /healthz probe.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Total data points accepted on the arrival queue.
    pub points_received: Counter,
    /// Total data points dropped because no provisioning rule matched.
    pub points_unprovisioned: Counter,
    /// Total samples rejected by a live series.
    pub process_errors: Counter,
    /// Total snapshots flushed to the store.
    pub flushes: Counter,
    /// Total snapshots the store rejected.
    pub flush_errors: Counter,
    /// Total stat events accepted.
    pub stats_received: Counter,
    /// Total stat flush ticks dropped because the aggregator was busy.
    pub stat_ticks_dropped: Counter,
    /// Number of live series in the registry.
    pub series_count: Gauge,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let points_received = Counter::with_opts(
            Opts::new(
                "points_received_total",
                "Total data points accepted on the arrival queue.",
            )
            .namespace("roundhouse"),
        )?;
        let points_unprovisioned = Counter::with_opts(
            Opts::new(
                "points_unprovisioned_total",
                "Total data points dropped because no provisioning rule matched.",
            )
            .namespace("roundhouse"),
        )?;
        let process_errors = Counter::with_opts(
            Opts::new(
                "process_errors_total",
                "Total samples rejected by a live series.",
            )
            .namespace("roundhouse"),
        )?;
        let flushes = Counter::with_opts(
            Opts::new("flushes_total", "Total snapshots flushed to the store.")
                .namespace("roundhouse"),
        )?;
        let flush_errors = Counter::with_opts(
            Opts::new("flush_errors_total", "Total snapshots the store rejected.")
                .namespace("roundhouse"),
        )?;
        let stats_received = Counter::with_opts(
            Opts::new("stats_received_total", "Total stat events accepted.")
                .namespace("roundhouse"),
        )?;
        let stat_ticks_dropped = Counter::with_opts(
            Opts::new(
                "stat_ticks_dropped_total",
                "Total stat flush ticks dropped because the aggregator was busy.",
            )
            .namespace("roundhouse"),
        )?;
        let series_count = Gauge::with_opts(
            Opts::new("series_count", "Number of live series in the registry.")
                .namespace("roundhouse"),
        )?;

        registry.register(Box::new(points_received.clone()))?;
        registry.register(Box::new(points_unprovisioned.clone()))?;
        registry.register(Box::new(process_errors.clone()))?;
        registry.register(Box::new(flushes.clone()))?;
        registry.register(Box::new(flush_errors.clone()))?;
        registry.register(Box::new(stats_received.clone()))?;
        registry.register(Box::new(stat_ticks_dropped.clone()))?;
        registry.register(Box::new(series_count.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            points_received,
            points_unprovisioned,
            process_errors,
            flushes,
            flush_errors,
            stats_received,
            stat_ticks_dropped,
            series_count,
        })
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9099"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
