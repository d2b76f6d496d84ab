//! Published rankings. Readers load the current snapshot without locks; the refresher
//! swaps in a complete replacement, so a reader sees either the old list or the new one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use hotrank_core::{CategoryId, Counters, ItemId, Period};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedItem {
    /// Dense, 1-based.
    pub rank: u32,
    pub item_id: ItemId,
    pub score: f64,
    pub title: String,
    pub category_id: Option<CategoryId>,
    pub counters: Counters,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankSnapshot {
    pub period: Period,
    /// 0 until the first publish.
    pub epoch: u64,
    pub generated_at_ms: i64,
    pub items: Vec<RankedItem>,
}

impl RankSnapshot {
    pub fn empty(period: Period) -> Self { Self { period, epoch: 0, generated_at_ms: 0, items: Vec::new() } }
    pub fn len(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }
}

pub struct Snapshots {
    slots: [ArcSwap<RankSnapshot>; 3],
    epoch: AtomicU64,
    swap: Mutex<()>,
    epoch_tx: watch::Sender<u64>,
}

impl Default for Snapshots {
    fn default() -> Self { Self::new() }
}

impl Snapshots {
    pub fn new() -> Self {
        let (epoch_tx, _) = watch::channel(0u64);
        Self {
            slots: Period::ALL.map(|p| ArcSwap::from_pointee(RankSnapshot::empty(p))),
            epoch: AtomicU64::new(0),
            swap: Mutex::new(()),
            epoch_tx,
        }
    }

    fn slot(&self, period: Period) -> &ArcSwap<RankSnapshot> {
        match period {
            Period::Hour => &self.slots[0],
            Period::Day => &self.slots[1],
            Period::Week => &self.slots[2],
        }
    }

    pub fn current(&self, period: Period) -> Arc<RankSnapshot> { self.slot(period).load_full() }

    /// Replace the ranking of `period`. Ranks are reassigned densely from 1. Returns the new epoch.
    pub fn publish(&self, period: Period, mut items: Vec<RankedItem>, generated_at_ms: i64) -> u64 {
        for (i, it) in items.iter_mut().enumerate() {
            it.rank = i as u32 + 1;
        }
        let _guard = self.swap.lock();
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.slot(period).store(Arc::new(RankSnapshot { period, epoch, generated_at_ms, items }));
        self.epoch_tx.send_replace(epoch);
        epoch
    }

    /// Latest epoch across all periods.
    pub fn epoch(&self) -> u64 { self.epoch.load(Ordering::SeqCst) }
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_tx.subscribe() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranked(id: ItemId, score: f64) -> RankedItem {
        RankedItem { rank: 0, item_id: id, score, title: format!("#{}", id), category_id: None, counters: Counters::default() }
    }

    #[test]
    fn publish_swaps_whole_list_and_bumps_epoch() {
        let s = Snapshots::new();
        let mut rx = s.subscribe_epoch();
        assert!(s.current(Period::Hour).is_empty());
        let held = s.current(Period::Hour);
        let e1 = s.publish(Period::Hour, vec![ranked(5, 3.0), ranked(2, 1.0)], 10);
        assert_eq!(e1, 1);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 1);
        // An earlier reader keeps its view.
        assert!(held.is_empty());
        let now = s.current(Period::Hour);
        assert_eq!(now.items.iter().map(|r| r.rank).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(now.items[0].item_id, 5);
        assert!(s.current(Period::Day).is_empty());
        assert_eq!(s.publish(Period::Week, vec![], 11), 2);
        assert_eq!(s.epoch(), 2);
    }

    #[test]
    fn wire_shape() {
        let s = Snapshots::new();
        s.publish(Period::Day, vec![ranked(1, 2.5)], 99);
        let v = serde_json::to_value(&*s.current(Period::Day)).unwrap();
        assert_eq!(v["period"], "24h");
        assert_eq!(v["items"][0]["itemId"], 1);
        assert_eq!(v["items"][0]["rank"], 1);
    }
}
