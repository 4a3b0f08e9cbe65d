use anyhow::Result;
use async_trait::async_trait;

use crate::series::{SeriesSnapshot, SeriesSpec};

/// A series as persisted by the durable store, enough to reconstruct the
/// live state at startup.
#[derive(Debug, Clone)]
pub struct StoredSeries {
    pub id: i64,
    pub name: String,
    pub spec: SeriesSpec,
}

/// The durable storage backend. Flushes may block for as long as the
/// backend needs; the pipeline isolates that latency to the owning
/// flusher shard.
#[async_trait]
pub trait Store: Send + Sync {
    /// Persists one flushed snapshot.
    async fn flush_series(&self, snapshot: &SeriesSnapshot) -> Result<()>;

    /// Returns every series known to the store, for registry hydration.
    async fn load_series(&self) -> Result<Vec<StoredSeries>>;
}

/// In-memory store: records every flushed snapshot and serves a fixed
/// set of seed series. Used by tests and as the default wiring until a
/// disk- or DB-backed store is configured.
#[derive(Default)]
pub struct MemStore {
    seed: Vec<StoredSeries>,
    flushed: tokio::sync::Mutex<Vec<SeriesSnapshot>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_series(seed: Vec<StoredSeries>) -> Self {
        Self {
            seed,
            flushed: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Every snapshot flushed so far, in arrival order.
    pub async fn flushed(&self) -> Vec<SeriesSnapshot> {
        self.flushed.lock().await.clone()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn flush_series(&self, snapshot: &SeriesSnapshot) -> Result<()> {
        self.flushed.lock().await.push(snapshot.clone());
        Ok(())
    }

    async fn load_series(&self) -> Result<Vec<StoredSeries>> {
        Ok(self.seed.clone())
    }
}
