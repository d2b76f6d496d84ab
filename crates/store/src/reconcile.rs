//! Write-back of cached counters to the origin under optimistic concurrency.
//!
//! The cached `version` is the version the origin row had when the hash was loaded. A
//! successful conditional update bumps both sides; a conflict means another writer got
//! there first, so the cache is resynced from the origin and the local increments since
//! the last sync are dropped.

use std::sync::Arc;

use anyhow::{Context, Result};
use hotrank_cache::Cache;
use hotrank_core::keys::item_key;
use hotrank_core::ItemId;
use hotrank_persist::ItemStore;
use metrics::counter;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::codec::{decode_item, encode_item, is_null_marker};
use crate::config::LoaderConfig;
use crate::pool::WorkerPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ReconcileOutcome {
    /// Origin accepted the cached counters.
    Synced { version: i64 },
    /// Version conflict; the cache now mirrors the origin row.
    Resynced { version: i64 },
    /// The origin row is gone; the cache entry was evicted.
    Evicted,
    /// Nothing cached for the item.
    NotCached,
}

impl ReconcileOutcome {
    fn label(self) -> &'static str {
        match self {
            ReconcileOutcome::Synced { .. } => "synced",
            ReconcileOutcome::Resynced { .. } => "resynced",
            ReconcileOutcome::Evicted => "evicted",
            ReconcileOutcome::NotCached => "not_cached",
        }
    }
}

pub struct Reconciler {
    cache: Arc<dyn Cache>,
    origin: Arc<dyn ItemStore>,
    loader_cfg: LoaderConfig,
}

impl Reconciler {
    pub fn new(cache: Arc<dyn Cache>, origin: Arc<dyn ItemStore>, loader_cfg: LoaderConfig) -> Self {
        Self { cache, origin, loader_cfg }
    }

    pub async fn reconcile(&self, id: ItemId) -> Result<ReconcileOutcome> {
        let key = item_key(id);
        let outcome = match self.cache.hgetall(&key).await? {
            Some(f) if !is_null_marker(&f) => {
                let item = decode_item(&f)?;
                let origin = Arc::clone(&self.origin);
                let counters = item.counters;
                let expected = item.version;
                let applied = tokio::task::spawn_blocking(move || origin.update_counters(id, &counters, expected))
                    .await
                    .context("counter write-back task")??;
                if applied {
                    // A concurrent resync may have replaced the hash; the bump is then a no-op.
                    self.cache.hincr_by(&key, "version", 1).await?;
                    ReconcileOutcome::Synced { version: expected + 1 }
                } else {
                    self.resync(id, &key).await?
                }
            }
            _ => ReconcileOutcome::NotCached,
        };
        counter!("reconcile_total", 1u64, "outcome" => outcome.label());
        Ok(outcome)
    }

    async fn resync(&self, id: ItemId, key: &str) -> Result<ReconcileOutcome> {
        let origin = Arc::clone(&self.origin);
        let row = tokio::task::spawn_blocking(move || origin.get_item(id)).await.context("resync load task")??;
        match row {
            Some(fresh) => {
                self.cache.hset_all(key, &encode_item(&fresh), Some(self.loader_cfg.item_ttl())).await?;
                warn!(item = id, version = fresh.version, "version conflict; cache resynced from origin");
                Ok(ReconcileOutcome::Resynced { version: fresh.version })
            }
            None => {
                self.cache.del(key).await?;
                info!(item = id, "item vanished from origin; cache entry evicted");
                Ok(ReconcileOutcome::Evicted)
            }
        }
    }
}

/// Per-item queue state. An item is in the map from its first request until the last pass
/// over it has returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    /// Waiting for a worker; further requests fold into this pass.
    Queued,
    /// A pass is running. `dirty` asks for one more pass once it returns.
    Running { dirty: bool },
}

/// Schedules reconciliations on the worker pool. Passes over one item never overlap, so the
/// only version conflicts left are with other writers of the origin row.
#[derive(Clone)]
pub struct ReconcileQueue {
    reconciler: Arc<Reconciler>,
    workers: Arc<WorkerPool>,
    slots: Arc<Mutex<FxHashMap<ItemId, Slot>>>,
}

impl ReconcileQueue {
    pub fn new(reconciler: Arc<Reconciler>, workers: Arc<WorkerPool>) -> Self {
        Self { reconciler, workers, slots: Arc::new(Mutex::new(FxHashMap::default())) }
    }

    pub fn enqueue(&self, id: ItemId) {
        {
            let mut slots = self.slots.lock();
            match slots.get_mut(&id) {
                None => {
                    slots.insert(id, Slot::Queued);
                }
                Some(Slot::Queued) => {
                    counter!("reconcile_coalesced_total", 1u64);
                    return;
                }
                Some(Slot::Running { dirty }) => {
                    *dirty = true;
                    counter!("reconcile_coalesced_total", 1u64);
                    return;
                }
            }
        }
        let reconciler = Arc::clone(&self.reconciler);
        let slots = Arc::clone(&self.slots);
        self.workers.spawn("reconcile", async move {
            slots.lock().insert(id, Slot::Running { dirty: false });
            loop {
                match reconciler.reconcile(id).await {
                    Ok(outcome) => debug!(item = id, ?outcome, "reconciled"),
                    Err(e) => warn!(item = id, error = %e, "reconcile failed"),
                }
                let again = {
                    let mut guard = slots.lock();
                    match guard.get(&id).copied() {
                        Some(Slot::Running { dirty: true }) => {
                            guard.insert(id, Slot::Running { dirty: false });
                            true
                        }
                        _ => {
                            guard.remove(&id);
                            false
                        }
                    }
                };
                if !again {
                    break;
                }
            }
        });
    }

    /// Items queued or being reconciled.
    pub fn pending(&self) -> usize { self.slots.lock().len() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hotrank_cache::MemCache;
    use hotrank_core::Counters;
    use hotrank_persist::{NewItem, SqliteStore};

    async fn cached_item() -> (Arc<MemCache>, Arc<SqliteStore>, Reconciler, ItemId) {
        let cache = Arc::new(MemCache::new());
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let id = store
            .insert_item(&NewItem { title: "x".into(), content: String::new(), category_id: None, created_at_ms: 0 })
            .unwrap();
        let item = store.get_item(id).unwrap().unwrap();
        cache.hset_all(&item_key(id), &encode_item(&item), None).await.unwrap();
        let r = Reconciler::new(cache.clone(), store.clone(), LoaderConfig::default());
        (cache, store, r, id)
    }

    #[tokio::test]
    async fn sync_bumps_both_versions() {
        let (cache, store, r, id) = cached_item().await;
        cache.hincr_by(&item_key(id), "views", 3).await.unwrap();
        assert_eq!(r.reconcile(id).await.unwrap(), ReconcileOutcome::Synced { version: 1 });
        let row = store.get_item(id).unwrap().unwrap();
        assert_eq!((row.version, row.counters.views), (1, 3));
        let cached = decode_item(&cache.hgetall(&item_key(id)).await.unwrap().unwrap()).unwrap();
        assert_eq!(cached.version, 1);
        // Next pass keeps working off the bumped version.
        assert_eq!(r.reconcile(id).await.unwrap(), ReconcileOutcome::Synced { version: 2 });
    }

    #[tokio::test]
    async fn conflict_resyncs_from_origin() {
        let (cache, store, r, id) = cached_item().await;
        // Another node wrote first.
        assert!(store.update_counters(id, &Counters { views: 50, ..Default::default() }, 0).unwrap());
        cache.hincr_by(&item_key(id), "views", 1).await.unwrap();
        assert_eq!(r.reconcile(id).await.unwrap(), ReconcileOutcome::Resynced { version: 1 });
        let cached = decode_item(&cache.hgetall(&item_key(id)).await.unwrap().unwrap()).unwrap();
        assert_eq!((cached.version, cached.counters.views), (1, 50));
    }

    #[tokio::test]
    async fn vanished_row_is_evicted() {
        let (cache, store, r, id) = cached_item().await;
        assert!(store.delete_item(id).unwrap());
        assert_eq!(r.reconcile(id).await.unwrap(), ReconcileOutcome::Evicted);
        assert!(cache.hgetall(&item_key(id)).await.unwrap().is_none());
        assert_eq!(r.reconcile(id).await.unwrap(), ReconcileOutcome::NotCached);
    }

    #[tokio::test]
    async fn queued_requests_coalesce() {
        let (_cache, store, r, id) = cached_item().await;
        let workers = Arc::new(WorkerPool::new("w", 1));
        // Occupy the only slot so the queued job cannot start yet.
        workers.spawn("block", async { tokio::time::sleep(std::time::Duration::from_millis(50)).await });
        let q = ReconcileQueue::new(Arc::new(r), workers.clone());
        q.enqueue(id);
        q.enqueue(id);
        q.enqueue(id);
        assert_eq!(q.pending(), 1);
        assert!(workers.drain(std::time::Duration::from_secs(2)).await);
        assert_eq!(q.pending(), 0);
        assert_eq!(store.get_item(id).unwrap().unwrap().version, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn passes_over_one_item_never_overlap() {
        let (cache, store, r, id) = cached_item().await;
        let workers = Arc::new(WorkerPool::new("w", 8));
        let q = ReconcileQueue::new(Arc::new(r), workers.clone());
        for _ in 0..100 {
            cache.hincr_by(&item_key(id), "views", 1).await.unwrap();
            q.enqueue(id);
            tokio::task::yield_now().await;
        }
        assert!(workers.drain(std::time::Duration::from_secs(5)).await);
        assert_eq!(q.pending(), 0);

        // Every pass synced; none conflicted with another pass and rewound the cache.
        let row = store.get_item(id).unwrap().unwrap();
        let cached = decode_item(&cache.hgetall(&item_key(id)).await.unwrap().unwrap()).unwrap();
        assert_eq!(row.counters.views, 100);
        assert_eq!(cached.counters.views, 100);
        assert_eq!(cached.version, row.version);
    }
}
