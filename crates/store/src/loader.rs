//! Read-through loading with stampede protection.
//!
//! A miss takes a leased per-key lock, re-checks the cache, and only then goes to the
//! origin. At most one origin load per key runs while the lease holds. Absent rows are
//! cached as a short-lived sentinel. A caller that cannot get the lock within its
//! attempts degrades to a miss instead of piling onto the origin.

use std::sync::Arc;

use anyhow::{Context, Result};
use hotrank_cache::{Cache, CacheLock, Fields};
use hotrank_core::keys::{category_items_key, category_key, category_lock_key, item_key, item_lock_key};
use hotrank_core::{Category, CategoryId, Item, ItemId};
use hotrank_persist::ItemStore;
use metrics::{counter, histogram};
use tracing::{debug, warn};

use crate::codec::{decode_category, decode_item, encode_category, encode_item, is_null_marker, null_marker};
use crate::config::LoaderConfig;
use crate::pool::WorkerPool;

/// An entity that is cached as a hash and loaded from the origin by id.
trait Resource: Send + Sync + 'static {
    type Value: Send + 'static;
    const KIND: &'static str;

    fn cache_key(id: i64) -> String;
    fn lock_key(id: i64) -> String;
    fn encode(v: &Self::Value) -> Fields;
    fn decode(f: &Fields) -> Result<Self::Value>;
    fn load(origin: &dyn ItemStore, id: i64) -> Result<Option<Self::Value>>;
}

struct ItemRes;
struct CategoryRes;

impl Resource for ItemRes {
    type Value = Item;
    const KIND: &'static str = "item";

    fn cache_key(id: i64) -> String { item_key(id) }
    fn lock_key(id: i64) -> String { item_lock_key(id) }
    fn encode(v: &Item) -> Fields { encode_item(v) }
    fn decode(f: &Fields) -> Result<Item> { decode_item(f) }
    fn load(origin: &dyn ItemStore, id: i64) -> Result<Option<Item>> { origin.get_item(id) }
}

impl Resource for CategoryRes {
    type Value = Category;
    const KIND: &'static str = "category";

    fn cache_key(id: i64) -> String { category_key(id) }
    fn lock_key(id: i64) -> String { category_lock_key(id) }
    fn encode(v: &Category) -> Fields { encode_category(v) }
    fn decode(f: &Fields) -> Result<Category> { decode_category(f) }
    fn load(origin: &dyn ItemStore, id: i64) -> Result<Option<Category>> { origin.get_category(id) }
}

enum Cached<T> {
    Hit(T),
    /// Negative-cache sentinel.
    Absent,
    Miss,
}

enum Source {
    Cache,
    Origin,
}

#[derive(Clone)]
pub struct Loader {
    cache: Arc<dyn Cache>,
    origin: Arc<dyn ItemStore>,
    cfg: Arc<LoaderConfig>,
    workers: Arc<WorkerPool>,
}

impl Loader {
    pub fn new(cache: Arc<dyn Cache>, origin: Arc<dyn ItemStore>, cfg: LoaderConfig, workers: Arc<WorkerPool>) -> Self {
        Self { cache, origin, cfg: Arc::new(cfg), workers }
    }

    /// Resolve an item through the cache. `None` covers absent rows, lock exhaustion and
    /// an unavailable cache; the last two are logged.
    pub async fn get_item(&self, id: ItemId) -> Option<Item> {
        match self.read_through::<ItemRes>(id).await {
            Ok((Some(item), Source::Origin)) => {
                if let Some(cat) = item.category_id {
                    self.warm_category(cat, item.id);
                }
                Some(item)
            }
            Ok((item, _)) => item,
            Err(e) => {
                warn!(item = id, error = %e, "item lookup failed; treating as miss");
                counter!("loader_errors_total", 1u64, "kind" => ItemRes::KIND);
                None
            }
        }
    }

    pub async fn get_category(&self, id: CategoryId) -> Option<Category> {
        match self.read_through::<CategoryRes>(id).await {
            Ok((cat, _)) => cat,
            Err(e) => {
                warn!(category = id, error = %e, "category lookup failed; treating as miss");
                counter!("loader_errors_total", 1u64, "kind" => CategoryRes::KIND);
                None
            }
        }
    }

    /// Register the item under its category and make sure the category itself is cached.
    /// Runs on the worker pool.
    fn warm_category(&self, category: CategoryId, item: ItemId) {
        let this = self.clone();
        self.workers.spawn("warm_category", async move {
            if let Err(e) = this.cache.sadd(&category_items_key(category), item).await {
                warn!(category, item, error = %e, "category membership warm failed");
            }
            let _ = this.get_category(category).await;
        });
    }

    async fn read_through<R: Resource>(&self, id: i64) -> Result<(Option<R::Value>, Source)> {
        let key = R::cache_key(id);
        for attempt in 1..=self.cfg.attempts {
            match self.read_cached::<R>(&key).await? {
                Cached::Hit(v) => {
                    counter!("loader_hits_total", 1u64, "kind" => R::KIND);
                    return Ok((Some(v), Source::Cache));
                }
                Cached::Absent => {
                    counter!("loader_negative_hits_total", 1u64, "kind" => R::KIND);
                    return Ok((None, Source::Cache));
                }
                Cached::Miss => {
                    counter!("loader_misses_total", 1u64, "kind" => R::KIND);
                }
            }
            let lock_key = R::lock_key(id);
            match CacheLock::acquire(&*self.cache, &lock_key, self.cfg.lock_wait, self.cfg.lock_lease).await? {
                Some(lock) => {
                    let loaded = self.load_locked::<R>(id, &key).await;
                    match lock.release(&*self.cache).await {
                        Ok(true) => {}
                        Ok(false) => warn!(key = %lock_key, "lock lease expired before release"),
                        Err(e) => warn!(key = %lock_key, error = %e, "lock release failed"),
                    }
                    return loaded;
                }
                None => {
                    counter!("loader_lock_contention_total", 1u64, "kind" => R::KIND);
                    debug!(kind = R::KIND, id, attempt, "lock busy");
                    if attempt < self.cfg.attempts {
                        tokio::time::sleep(self.cfg.retry_backoff).await;
                    }
                }
            }
        }
        warn!(kind = R::KIND, id, attempts = self.cfg.attempts, "lock attempts exhausted; degrading to miss");
        counter!("loader_exhausted_total", 1u64, "kind" => R::KIND);
        Ok((None, Source::Cache))
    }

    /// Holder of the lock: re-check, then load from the origin and populate the cache.
    async fn load_locked<R: Resource>(&self, id: i64, key: &str) -> Result<(Option<R::Value>, Source)> {
        match self.read_cached::<R>(key).await? {
            Cached::Hit(v) => return Ok((Some(v), Source::Cache)),
            Cached::Absent => return Ok((None, Source::Cache)),
            Cached::Miss => {}
        }
        let origin = Arc::clone(&self.origin);
        let started = std::time::Instant::now();
        let row = tokio::task::spawn_blocking(move || R::load(&*origin, id))
            .await
            .with_context(|| format!("{} {} origin load task", R::KIND, id))??;
        histogram!("loader_origin_ms", started.elapsed().as_secs_f64() * 1000.0, "kind" => R::KIND);
        counter!("loader_origin_loads_total", 1u64, "kind" => R::KIND);
        match row {
            Some(v) => {
                self.cache.hset_all(key, &R::encode(&v), Some(self.cfg.item_ttl())).await?;
                debug!(kind = R::KIND, id, "loaded from origin");
                Ok((Some(v), Source::Origin))
            }
            None => {
                self.cache.hset_all(key, &null_marker(), Some(self.cfg.null_ttl)).await?;
                debug!(kind = R::KIND, id, "absent at origin; cached sentinel");
                Ok((None, Source::Origin))
            }
        }
    }

    async fn read_cached<R: Resource>(&self, key: &str) -> Result<Cached<R::Value>> {
        let Some(f) = self.cache.hgetall(key).await? else { return Ok(Cached::Miss) };
        if is_null_marker(&f) {
            return Ok(Cached::Absent);
        }
        match R::decode(&f) {
            Ok(v) => Ok(Cached::Hit(v)),
            Err(e) => {
                warn!(key, error = %e, "undecodable cache entry; reloading");
                self.cache.del(key).await?;
                Ok(Cached::Miss)
            }
        }
    }
}
