//! hotrank public API façade (in-process).
//!
//! Frontends (the CLI, a future HTTP layer) depend on [`HotRankApi`] rather than on the
//! engine directly. [`InProcApi`] wraps a running engine; [`MockApi`] serves canned data.

#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use hotrank_core::{ActionEvent, ActionKind, ActorId, Category, CategoryId, Item, ItemId, Period};
use hotrank_store::{Engine, EngineStats, RankSnapshot, RankedItem, RefreshOutcome};
use metrics::counter;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

/// API errors suitable for transport over RPC later.
#[derive(Debug, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum HotRankError {
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type HotRankResult<T> = Result<T, HotRankError>;

#[derive(Debug, Clone, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMeta {
    /// Engine has not finished its startup refresh; rankings may be empty.
    pub warming_up: bool,
    pub epoch: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopResponse {
    pub period: Period,
    pub generated_at_ms: i64,
    pub items: Vec<RankedItem>,
    pub meta: ResponseMeta,
}

impl TopResponse {
    fn from_snapshot(snap: &RankSnapshot, limit: Option<usize>, warming_up: bool) -> Self {
        let n = limit.unwrap_or(snap.items.len()).min(snap.items.len());
        Self {
            period: snap.period,
            generated_at_ms: snap.generated_at_ms,
            items: snap.items[..n].to_vec(),
            meta: ResponseMeta { warming_up, epoch: snap.epoch },
        }
    }
}

/// Read and admin surface of the ranking engine.
#[async_trait::async_trait]
pub trait HotRankApi: Send + Sync {
    /// Current ranking of `period`, optionally cut to `limit` entries.
    async fn top(&self, period: Period, limit: Option<usize>) -> HotRankResult<TopResponse>;

    async fn item(&self, id: ItemId) -> HotRankResult<Item>;

    async fn category(&self, id: CategoryId) -> HotRankResult<Category>;

    /// Ids of items seen under a category since their details were cached.
    async fn category_items(&self, id: CategoryId) -> HotRankResult<Vec<ItemId>>;

    /// Whether `actor` currently holds a SUPPORT, OPPOSE or FAVORITE on `item`.
    async fn has_acted(&self, actor: ActorId, kind: ActionKind, item: ItemId) -> HotRankResult<bool>;

    /// Queue an action event. Returns once queued, not once applied.
    async fn submit(&self, event: ActionEvent) -> HotRankResult<()>;

    /// Admin: refresh every period now.
    async fn force_refresh(&self) -> HotRankResult<Vec<(Period, RefreshOutcome)>>;

    /// Admin: persist the cache dataset.
    async fn flush(&self) -> HotRankResult<()>;

    async fn stats(&self) -> HotRankResult<EngineStats>;

    /// Notified whenever any ranking is republished.
    fn watch_epoch(&self) -> watch::Receiver<u64>;
}

fn validate_tracked(kind: ActionKind) -> HotRankResult<ActionKind> {
    let base = kind.base();
    if base.is_tracked() {
        Ok(base)
    } else {
        Err(HotRankError::Validation(format!("{} is not tracked per actor", kind)))
    }
}

// ----------------- In-process implementation -----------------

/// In-process implementation over a shared engine.
pub struct InProcApi {
    engine: Arc<Engine>,
}

impl InProcApi {
    pub fn new(engine: Arc<Engine>) -> Self { Self { engine } }

    pub fn engine(&self) -> &Arc<Engine> { &self.engine }

    fn map_err(e: anyhow::Error) -> HotRankError { HotRankError::Internal(format!("{:#}", e)) }
}

#[async_trait::async_trait]
impl HotRankApi for InProcApi {
    async fn top(&self, period: Period, limit: Option<usize>) -> HotRankResult<TopResponse> {
        counter!("api_requests_total", 1u64, "op" => "top");
        let snap = self.engine.top(period);
        Ok(TopResponse::from_snapshot(&snap, limit, !self.engine.is_ready()))
    }

    async fn item(&self, id: ItemId) -> HotRankResult<Item> {
        counter!("api_requests_total", 1u64, "op" => "item");
        self.engine.item(id).await.ok_or_else(|| HotRankError::NotFound(format!("item {}", id)))
    }

    async fn category(&self, id: CategoryId) -> HotRankResult<Category> {
        counter!("api_requests_total", 1u64, "op" => "category");
        self.engine.category(id).await.ok_or_else(|| HotRankError::NotFound(format!("category {}", id)))
    }

    async fn category_items(&self, id: CategoryId) -> HotRankResult<Vec<ItemId>> {
        counter!("api_requests_total", 1u64, "op" => "category_items");
        self.engine.category_items(id).await.map_err(|e| HotRankError::Unavailable(format!("{:#}", e)))
    }

    async fn has_acted(&self, actor: ActorId, kind: ActionKind, item: ItemId) -> HotRankResult<bool> {
        counter!("api_requests_total", 1u64, "op" => "has_acted");
        let kind = validate_tracked(kind)?;
        self.engine.has_acted(actor, kind, item).await.map_err(|e| HotRankError::Unavailable(format!("{:#}", e)))
    }

    async fn submit(&self, event: ActionEvent) -> HotRankResult<()> {
        if self.engine.is_draining() {
            return Err(HotRankError::Unavailable("engine is shutting down".into()));
        }
        self.engine.submit(event);
        Ok(())
    }

    async fn force_refresh(&self) -> HotRankResult<Vec<(Period, RefreshOutcome)>> {
        let t0 = Instant::now();
        info!("api: force refresh start");
        let out = self.engine.force_refresh().await.map_err(Self::map_err)?;
        info!(took_ms = %t0.elapsed().as_millis(), "api: force refresh ok");
        Ok(out)
    }

    async fn flush(&self) -> HotRankResult<()> {
        let t0 = Instant::now();
        self.engine.flush().await.map_err(Self::map_err)?;
        info!(took_ms = %t0.elapsed().as_millis(), "api: flush ok");
        Ok(())
    }

    async fn stats(&self) -> HotRankResult<EngineStats> { Ok(self.engine.stats().await) }

    fn watch_epoch(&self) -> watch::Receiver<u64> { self.engine.subscribe_epoch() }
}

// ----------------- Mock implementation -----------------

/// Simple in-memory mock implementation for frontend tests.
pub struct MockApi {
    pub snapshots: HashMap<Period, RankSnapshot>,
    pub items: HashMap<ItemId, Item>,
    pub categories: HashMap<CategoryId, Category>,
    pub category_members: HashMap<CategoryId, Vec<ItemId>>,
    /// `(actor, base kind, item)` triples that report as acted.
    pub acted: HashSet<(ActorId, ActionKind, ItemId)>,
    pub stats: Option<EngineStats>,
    pub submitted: Mutex<Vec<ActionEvent>>,
    epoch_tx: watch::Sender<u64>,
}

impl Default for MockApi {
    fn default() -> Self {
        let (epoch_tx, _) = watch::channel(0);
        Self {
            snapshots: HashMap::new(),
            items: HashMap::new(),
            categories: HashMap::new(),
            category_members: HashMap::new(),
            acted: HashSet::new(),
            stats: None,
            submitted: Mutex::new(Vec::new()),
            epoch_tx,
        }
    }
}

impl MockApi {
    pub fn new() -> Self { Self::default() }
}

#[async_trait::async_trait]
impl HotRankApi for MockApi {
    async fn top(&self, period: Period, limit: Option<usize>) -> HotRankResult<TopResponse> {
        let snap = self.snapshots.get(&period).cloned().unwrap_or_else(|| RankSnapshot::empty(period));
        Ok(TopResponse::from_snapshot(&snap, limit, false))
    }

    async fn item(&self, id: ItemId) -> HotRankResult<Item> {
        self.items.get(&id).cloned().ok_or_else(|| HotRankError::NotFound(format!("item {}", id)))
    }

    async fn category(&self, id: CategoryId) -> HotRankResult<Category> {
        self.categories.get(&id).cloned().ok_or_else(|| HotRankError::NotFound(format!("category {}", id)))
    }

    async fn category_items(&self, id: CategoryId) -> HotRankResult<Vec<ItemId>> {
        Ok(self.category_members.get(&id).cloned().unwrap_or_default())
    }

    async fn has_acted(&self, actor: ActorId, kind: ActionKind, item: ItemId) -> HotRankResult<bool> {
        let kind = validate_tracked(kind)?;
        Ok(self.acted.contains(&(actor, kind, item)))
    }

    async fn submit(&self, event: ActionEvent) -> HotRankResult<()> {
        self.submitted.lock().push(event);
        Ok(())
    }

    async fn force_refresh(&self) -> HotRankResult<Vec<(Period, RefreshOutcome)>> {
        Ok(Period::ALL.iter().map(|&p| (p, RefreshOutcome::Skipped)).collect())
    }

    async fn flush(&self) -> HotRankResult<()> { Ok(()) }

    async fn stats(&self) -> HotRankResult<EngineStats> {
        self.stats.clone().ok_or_else(|| HotRankError::Unavailable("no stats configured".into()))
    }

    fn watch_epoch(&self) -> watch::Receiver<u64> { self.epoch_tx.subscribe() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hotrank_cache::MemCache;
    use hotrank_core::ManualClock;
    use hotrank_persist::{ItemStore, NewItem, SqliteStore};
    use hotrank_store::EngineConfig;

    const T: i64 = 1_709_991_900_000;

    #[tokio::test]
    async fn category_lists_items_loaded_under_it() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let cat = store.insert_category("sports").unwrap();
        let id = store
            .insert_item(&NewItem { title: "match".into(), content: String::new(), category_id: Some(cat), created_at_ms: T })
            .unwrap();
        let engine = Engine::new(Arc::new(MemCache::new()), store, Arc::new(ManualClock::new(T)), EngineConfig::default());
        let api = InProcApi::new(Arc::new(engine));
        assert!(api.category_items(cat).await.unwrap().is_empty());

        api.item(id).await.unwrap();
        // Category warming runs on the worker pool.
        assert!(api.engine().shutdown(std::time::Duration::from_secs(2)).await);
        assert_eq!(api.category_items(cat).await.unwrap(), vec![id]);
        assert_eq!(api.category(cat).await.unwrap().name, "sports");
    }

    fn inproc() -> (InProcApi, ItemId) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let id = store
            .insert_item(&NewItem { title: "a".into(), content: String::new(), category_id: None, created_at_ms: T })
            .unwrap();
        let engine = Engine::new(Arc::new(MemCache::new()), store, Arc::new(ManualClock::new(T)), EngineConfig::default());
        (InProcApi::new(Arc::new(engine)), id)
    }

    #[tokio::test]
    async fn inproc_maps_misses_and_validation() {
        let (api, id) = inproc();
        assert_eq!(api.item(id).await.unwrap().title, "a");
        assert_eq!(api.item(id + 100).await.unwrap_err(), HotRankError::NotFound(format!("item {}", id + 100)));
        assert!(matches!(api.has_acted(1, ActionKind::View, id).await, Err(HotRankError::Validation(_))));
        assert!(!api.has_acted(1, ActionKind::UnSupport, id).await.unwrap());
    }

    #[tokio::test]
    async fn inproc_reports_warm_up_until_started() {
        let (api, id) = inproc();
        let top = api.top(Period::Hour, None).await.unwrap();
        assert!(top.meta.warming_up && top.items.is_empty());

        api.engine().process(ActionEvent::new(id, 1, ActionKind::View, T)).await.unwrap();
        api.engine().start().await.unwrap();
        let top = api.top(Period::Hour, Some(5)).await.unwrap();
        assert!(!top.meta.warming_up);
        assert_eq!(top.items.len(), 1);
        assert_eq!(top.items[0].item_id, id);
        assert!(api.flush().await.is_err(), "in-memory cache has nowhere to flush");
    }

    #[tokio::test]
    async fn submit_is_refused_while_draining() {
        let (api, id) = inproc();
        assert!(api.engine().shutdown(std::time::Duration::from_secs(1)).await);
        let err = api.submit(ActionEvent::new(id, 1, ActionKind::View, T)).await.unwrap_err();
        assert!(matches!(err, HotRankError::Unavailable(_)));
    }

    #[tokio::test]
    async fn mock_serves_canned_data() {
        let mut mock = MockApi::new();
        mock.acted.insert((3, ActionKind::Favorite, 9));
        assert!(mock.has_acted(3, ActionKind::UnFavorite, 9).await.unwrap());
        assert!(!mock.has_acted(4, ActionKind::Favorite, 9).await.unwrap());
        assert!(mock.top(Period::Week, Some(3)).await.unwrap().items.is_empty());
        mock.submit(ActionEvent::new(9, 3, ActionKind::View, T)).await.unwrap();
        assert_eq!(mock.submitted.lock().len(), 1);
        assert!(matches!(mock.stats().await, Err(HotRankError::Unavailable(_))));
    }
}
