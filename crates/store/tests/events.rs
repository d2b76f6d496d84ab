#![forbid(unsafe_code)]

use std::sync::Arc;

use hotrank_cache::{Cache, MemCache};
use hotrank_core::keys::{hour_key, membership_key};
use hotrank_core::{hotness, ActionEvent, ActionKind, ItemId, ManualClock, Weights};
use hotrank_persist::{ItemStore, NewItem, SqliteStore};
use hotrank_store::{Applied, Engine, EngineConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

// 2024-03-09T13:45:00Z
const T: i64 = 1_709_991_900_000;

fn seeded(n: usize) -> (Arc<SqliteStore>, Vec<ItemId>) {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let ids = (0..n)
        .map(|i| {
            store
                .insert_item(&NewItem {
                    title: format!("story {}", i),
                    content: String::new(),
                    category_id: None,
                    created_at_ms: T - 30 * 60 * 1000,
                })
                .unwrap()
        })
        .collect();
    (store, ids)
}

fn build(store: Arc<SqliteStore>, cfg: EngineConfig) -> (Arc<MemCache>, Engine) {
    let cache = Arc::new(MemCache::new());
    let engine = Engine::new(cache.clone(), store, Arc::new(ManualClock::new(T)), cfg);
    (cache, engine)
}

fn ev(item: ItemId, actor: i64, action: ActionKind) -> ActionEvent { ActionEvent::new(item, actor, action, T) }

#[tokio::test]
async fn support_then_oppose_moves_the_vote() {
    let (store, ids) = seeded(1);
    let (cache, engine) = build(store, EngineConfig::default());
    let id = ids[0];

    engine.process(ev(id, 7, ActionKind::Support)).await.unwrap();
    let item = engine.item(id).await.unwrap();
    assert_eq!((item.counters.supports, item.counters.opposes), (1, 0));

    engine.process(ev(id, 7, ActionKind::Oppose)).await.unwrap();
    let item = engine.item(id).await.unwrap();
    assert_eq!((item.counters.supports, item.counters.opposes), (0, 1));
    assert!(!cache.sismember(&membership_key(7, ActionKind::Support), id).await.unwrap());
    assert!(cache.sismember(&membership_key(7, ActionKind::Oppose), id).await.unwrap());
    assert!(engine.has_acted(7, ActionKind::Oppose, id).await.unwrap());
    assert!(!engine.has_acted(7, ActionKind::Support, id).await.unwrap());
}

#[tokio::test]
async fn event_is_scored_into_current_hour() {
    let (store, ids) = seeded(1);
    let (cache, engine) = build(store, EngineConfig::default());
    let id = ids[0];
    engine.process(ev(id, 1, ActionKind::View)).await.unwrap();
    engine.process(ev(id, 2, ActionKind::Comment)).await.unwrap();
    let res = engine.process(ev(id, 3, ActionKind::Favorite)).await.unwrap();

    let item = engine.item(id).await.unwrap();
    let expected = hotness(&item.counters, item.created_at_ms, T, &Weights::default());
    assert_eq!(res, Applied::Scored { item: id, score: expected });
    assert_eq!(cache.zscore(&hour_key(T), id).await.unwrap(), Some(expected));
    // ln(2) * 1.5 + 3.0 + 4.0, no decay in the first hour.
    assert!((expected - (2f64.ln() * 1.5 + 7.0)).abs() < 1e-9);
    let ttl = cache.ttl(&hour_key(T)).await.unwrap().unwrap();
    assert!(ttl > std::time::Duration::from_secs(24 * 3600));
}

#[tokio::test]
async fn unknown_item_is_dropped_without_side_effects() {
    let (store, _ids) = seeded(1);
    let (cache, engine) = build(store, EngineConfig::default());
    assert_eq!(engine.process(ev(4242, 1, ActionKind::Support)).await.unwrap(), Applied::Dropped);
    assert!(!cache.sismember(&membership_key(1, ActionKind::Support), 4242).await.unwrap());
    assert_eq!(cache.zcard(&hour_key(T)).await.unwrap(), 0);
}

#[tokio::test]
async fn cancels_never_go_negative_and_redelivery_is_idempotent() {
    let (store, ids) = seeded(1);
    let (_cache, engine) = build(store, EngineConfig::default());
    let id = ids[0];

    engine.process(ev(id, 1, ActionKind::UnView)).await.unwrap();
    engine.process(ev(id, 1, ActionKind::UnComment)).await.unwrap();
    engine.process(ev(id, 1, ActionKind::UnFavorite)).await.unwrap();
    let c = engine.item(id).await.unwrap().counters;
    assert_eq!((c.views, c.comments, c.favorites), (0, 0, 0));

    // A redelivered favorite counts once; a redelivered cancel removes it once.
    engine.process(ev(id, 1, ActionKind::Favorite)).await.unwrap();
    engine.process(ev(id, 1, ActionKind::Favorite)).await.unwrap();
    assert_eq!(engine.item(id).await.unwrap().counters.favorites, 1);
    engine.process(ev(id, 1, ActionKind::UnFavorite)).await.unwrap();
    engine.process(ev(id, 1, ActionKind::UnFavorite)).await.unwrap();
    assert_eq!(engine.item(id).await.unwrap().counters.favorites, 0);
}

#[tokio::test]
async fn support_and_oppose_stay_exclusive_under_random_streams() {
    let (store, ids) = seeded(3);
    let (cache, engine) = build(store, EngineConfig::default());
    let kinds = [
        ActionKind::Support,
        ActionKind::Oppose,
        ActionKind::UnSupport,
        ActionKind::UnOppose,
        ActionKind::Favorite,
        ActionKind::UnFavorite,
    ];
    let actors = [11i64, 12, 13, 14];
    let mut rng = StdRng::seed_from_u64(0x5eed);

    for _ in 0..400 {
        let item = ids[rng.gen_range(0..ids.len())];
        let actor = actors[rng.gen_range(0..actors.len())];
        let kind = kinds[rng.gen_range(0..kinds.len())];
        engine.process(ev(item, actor, kind)).await.unwrap();

        let s = cache.sismember(&membership_key(actor, ActionKind::Support), item).await.unwrap();
        let o = cache.sismember(&membership_key(actor, ActionKind::Oppose), item).await.unwrap();
        assert!(!(s && o), "actor {} holds both on item {}", actor, item);
    }

    // Counters equal the number of actors holding each membership.
    for &item in &ids {
        let c = engine.item(item).await.unwrap().counters;
        let mut supports = 0;
        let mut opposes = 0;
        let mut favorites = 0;
        for &a in &actors {
            supports += cache.sismember(&membership_key(a, ActionKind::Support), item).await.unwrap() as i64;
            opposes += cache.sismember(&membership_key(a, ActionKind::Oppose), item).await.unwrap() as i64;
            favorites += cache.sismember(&membership_key(a, ActionKind::Favorite), item).await.unwrap() as i64;
        }
        assert_eq!((c.supports, c.opposes, c.favorites), (supports, opposes, favorites), "item {}", item);
    }
    assert!(engine.shutdown(std::time::Duration::from_secs(5)).await);
}

#[tokio::test]
async fn writes_back_to_origin() {
    let (store, ids) = seeded(1);
    let (_cache, engine) = build(store.clone(), EngineConfig::default());
    let id = ids[0];
    for actor in 0..5 {
        engine.process(ev(id, actor, ActionKind::View)).await.unwrap();
    }
    assert!(engine.shutdown(std::time::Duration::from_secs(5)).await);
    let row = store.get_item(id).unwrap().unwrap();
    assert_eq!(row.counters.views, 5);
    assert!(row.version >= 1);
    assert_eq!(engine.item(id).await.unwrap().version, row.version);
}
