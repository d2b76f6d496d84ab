//! Last-event stamp and cached corpus metadata.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use hotrank_cache::{Cache, Fields};
use hotrank_core::keys::{ITEM_RANGE_KEY, LAST_EVENT_KEY};
use hotrank_core::{Clock, ItemId};
use hotrank_persist::ItemStore;
use tracing::{info, warn};

/// Records when the last action event arrived so refreshes can be skipped while idle.
#[derive(Clone)]
pub struct ActivityTracker {
    cache: Arc<dyn Cache>,
    clock: Arc<dyn Clock>,
}

impl ActivityTracker {
    pub fn new(cache: Arc<dyn Cache>, clock: Arc<dyn Clock>) -> Self { Self { cache, clock } }

    pub async fn touch(&self) {
        let now = self.clock.now_ms();
        if let Err(e) = self.cache.set(LAST_EVENT_KEY, &now.to_string(), None).await {
            warn!(error = %e, "failed to record last event time");
        }
    }

    pub async fn last_event_ms(&self) -> Option<i64> {
        match self.cache.get(LAST_EVENT_KEY).await {
            Ok(v) => v.and_then(|s| s.parse().ok()),
            Err(e) => {
                warn!(error = %e, "failed to read last event time");
                None
            }
        }
    }

    /// Whether an event arrived within `window` of now. Never-active reads as idle.
    pub async fn active_within(&self, window: Duration) -> bool {
        let now = self.clock.now_ms();
        match self.last_event_ms().await {
            Some(t) => now.saturating_sub(t) <= window.as_millis() as i64,
            None => false,
        }
    }
}

/// Item id range kept in the cache for cold-start backfill, reloaded from the origin daily.
#[derive(Clone)]
pub struct Metadata {
    cache: Arc<dyn Cache>,
    origin: Arc<dyn ItemStore>,
}

impl Metadata {
    pub fn new(cache: Arc<dyn Cache>, origin: Arc<dyn ItemStore>) -> Self { Self { cache, origin } }

    /// Re-read min/max item id from the origin and cache them.
    pub async fn reload(&self) -> Result<Option<(ItemId, ItemId)>> {
        let origin = Arc::clone(&self.origin);
        let range = tokio::task::spawn_blocking(move || origin.id_range())
            .await
            .context("id range task")??;
        match range {
            Some((lo, hi)) => {
                let f = Fields::from([("min".to_string(), lo.to_string()), ("max".to_string(), hi.to_string())]);
                self.cache.hset_all(ITEM_RANGE_KEY, &f, None).await?;
                info!(min = lo, max = hi, "item range reloaded");
            }
            None => {
                self.cache.del(ITEM_RANGE_KEY).await?;
                info!("item range reloaded; corpus is empty");
            }
        }
        Ok(range)
    }

    /// Cached range, loading it on first use.
    pub async fn item_range(&self) -> Result<Option<(ItemId, ItemId)>> {
        if let Some(f) = self.cache.hgetall(ITEM_RANGE_KEY).await? {
            let lo = f.get("min").and_then(|v| v.parse().ok());
            let hi = f.get("max").and_then(|v| v.parse().ok());
            if let (Some(lo), Some(hi)) = (lo, hi) {
                return Ok(Some((lo, hi)));
            }
            warn!("cached item range is malformed; reloading");
        }
        self.reload().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hotrank_cache::MemCache;
    use hotrank_core::ManualClock;
    use hotrank_persist::{NewItem, SqliteStore};

    #[tokio::test]
    async fn idle_until_touched() {
        let clock = ManualClock::new(1_000_000);
        let t = ActivityTracker::new(Arc::new(MemCache::new()), Arc::new(clock.clone()));
        assert!(!t.active_within(Duration::from_secs(270)).await);
        t.touch().await;
        clock.advance(270_000);
        assert!(t.active_within(Duration::from_secs(270)).await);
        clock.advance(1);
        assert!(!t.active_within(Duration::from_secs(270)).await);
    }

    #[tokio::test]
    async fn range_is_loaded_lazily_and_reloaded() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let cache = Arc::new(MemCache::new());
        let meta = Metadata::new(cache.clone(), store.clone());
        assert_eq!(meta.item_range().await.unwrap(), None);
        let new = |t: &str| NewItem { title: t.into(), content: String::new(), category_id: None, created_at_ms: 0 };
        let a = store.insert_item(&new("a")).unwrap();
        let b = store.insert_item(&new("b")).unwrap();
        assert_eq!(meta.item_range().await.unwrap(), Some((a, b)));
        let c = store.insert_item(&new("c")).unwrap();
        // Cached until the daily reload.
        assert_eq!(meta.item_range().await.unwrap(), Some((a, b)));
        assert_eq!(meta.reload().await.unwrap(), Some((a, c)));
        assert_eq!(meta.item_range().await.unwrap(), Some((a, c)));
    }
}
