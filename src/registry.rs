use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use tracing::info;

use crate::series::{create_series, Series};
use crate::store::Store;

/// Both lookup directions, swapped as a unit so readers always observe a
/// consistent name/id pairing.
#[derive(Default)]
struct RegistryMaps {
    by_name: HashMap<String, Arc<Series>>,
    by_id: HashMap<i64, Arc<Series>>,
}

/// In-memory index of all known series. Reads are lock-free; writes go
/// through read-copy-update and are rare (the dispatcher inserts on
/// first sight of a name, and `reload` runs once before the dispatcher
/// starts).
pub struct Registry {
    maps: ArcSwap<RegistryMaps>,
    next_id: AtomicI64,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            maps: ArcSwap::from_pointee(RegistryMaps::default()),
            next_id: AtomicI64::new(1),
        }
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<Series>> {
        self.maps.load().by_name.get(name).cloned()
    }

    pub fn get_by_id(&self, id: i64) -> Option<Arc<Series>> {
        self.maps.load().by_id.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.maps.load().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hands out a fresh series id. Ids are never reused.
    pub fn allocate_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Inserts a series under its name and id. Single-writer: only the
    /// dispatcher calls this, so the load/clone/store cycle cannot lose
    /// a concurrent insert.
    pub fn insert(&self, series: Arc<Series>) {
        let current = self.maps.load();
        let mut by_name = current.by_name.clone();
        let mut by_id = current.by_id.clone();
        by_name.insert(series.name.clone(), Arc::clone(&series));
        by_id.insert(series.id, series);
        self.maps.store(Arc::new(RegistryMaps { by_name, by_id }));
    }

    /// Hydrates the index from durable storage, replacing whatever is
    /// loaded and seeding the id counter past the largest stored id.
    pub async fn reload(&self, store: &dyn Store) -> Result<()> {
        let stored = store.load_series().await.context("loading stored series")?;

        let mut maps = RegistryMaps::default();
        let mut max_id = 0;
        for row in &stored {
            let series = Arc::new(
                create_series(row.id, &row.name, &row.spec)
                    .with_context(|| format!("restoring series {:?}", row.name))?,
            );
            maps.by_name.insert(row.name.clone(), Arc::clone(&series));
            maps.by_id.insert(row.id, series);
            max_id = max_id.max(row.id);
        }

        self.next_id.store(max_id + 1, Ordering::Relaxed);
        self.maps.store(Arc::new(maps));

        info!(series = stored.len(), "registry reloaded from store");

        Ok(())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::series::{ArchiveSpec, SeriesSpec};
    use crate::store::{MemStore, StoredSeries};

    fn spec() -> SeriesSpec {
        SeriesSpec {
            step: Duration::from_secs(1),
            heartbeat: Duration::from_secs(300),
            archives: vec![ArchiveSpec {
                resolution: Duration::from_secs(1),
                size: 60,
            }],
        }
    }

    #[test]
    fn test_insert_and_lookup() {
        let registry = Registry::new();
        assert!(registry.is_empty());

        let id = registry.allocate_id();
        let series = Arc::new(create_series(id, "foo.bar", &spec()).unwrap());
        registry.insert(series);

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get_by_name("foo.bar").unwrap().id, id);
        assert_eq!(registry.get_by_id(id).unwrap().name, "foo.bar");
        assert!(registry.get_by_name("foo.other").is_none());
        assert!(registry.get_by_id(id + 1).is_none());
    }

    #[test]
    fn test_allocate_id_is_monotone() {
        let registry = Registry::new();
        let a = registry.allocate_id();
        let b = registry.allocate_id();
        let c = registry.allocate_id();
        assert!(a < b && b < c);
    }

    #[tokio::test]
    async fn test_reload_seeds_maps_and_id_counter() {
        let store = MemStore::with_series(vec![
            StoredSeries {
                id: 3,
                name: "foo.a".to_string(),
                spec: spec(),
            },
            StoredSeries {
                id: 7,
                name: "foo.b".to_string(),
                spec: spec(),
            },
        ]);

        let registry = Registry::new();
        registry.reload(&store).await.unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get_by_name("foo.b").unwrap().id, 7);
        assert_eq!(registry.allocate_id(), 8);
    }
}
