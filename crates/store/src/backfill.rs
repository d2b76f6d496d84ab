//! Cold-start backfill: when the hour window is thinner than the target, synthesize system
//! VIEW events for random existing ids so readers never see a near-empty ranking.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use hotrank_cache::Cache;
use hotrank_core::{ActionEvent, ActionKind, Clock, ItemId, SYSTEM_ACTOR};
use metrics::counter;
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{info, warn};

use crate::activity::Metadata;
use crate::processor::EventProcessor;

/// Ranges up to this many times the request are enumerated and sampled without
/// replacement; larger ones are drawn by rejection.
const ENUMERATE_FACTOR: i64 = 8;

pub struct Backfiller {
    cache: Arc<dyn Cache>,
    meta: Metadata,
    processor: Arc<EventProcessor>,
    clock: Arc<dyn Clock>,
    target: usize,
}

impl Backfiller {
    pub fn new(
        cache: Arc<dyn Cache>,
        meta: Metadata,
        processor: Arc<EventProcessor>,
        clock: Arc<dyn Clock>,
        target: usize,
    ) -> Self {
        Self { cache, meta, processor, clock, target }
    }

    /// Top up `window` to the target size. Returns the ids that received a synthetic view.
    pub async fn backfill(&self, window: &str) -> Result<Vec<ItemId>> {
        let have = self.cache.zcard(window).await?;
        if have >= self.target {
            return Ok(Vec::new());
        }
        let Some((lo, hi)) = self.meta.item_range().await? else {
            return Ok(Vec::new());
        };
        let present: HashSet<ItemId> = self.cache.zrevrange(window, usize::MAX).await?.into_iter().map(|(id, _)| id).collect();
        let ids = pick_candidates(&mut rand::thread_rng(), lo, hi, self.target - have, &present);

        let now = self.clock.now_ms();
        for &id in &ids {
            if let Err(e) = self.processor.apply(ActionEvent::new(id, SYSTEM_ACTOR, ActionKind::View, now)).await {
                warn!(item = id, error = %e, "synthetic view failed");
            }
        }
        counter!("backfill_injected_total", ids.len() as u64);
        info!(window, have, injected = ids.len(), "cold-start backfill");
        Ok(ids)
    }
}

/// Up to `need` distinct ids from `[lo, hi]` that are not in `exclude`.
pub fn pick_candidates<R: Rng + ?Sized>(rng: &mut R, lo: ItemId, hi: ItemId, need: usize, exclude: &HashSet<ItemId>) -> Vec<ItemId> {
    if need == 0 || hi < lo {
        return Vec::new();
    }
    let span = hi - lo + 1;
    let excluded = exclude.iter().filter(|id| (lo..=hi).contains(*id)).count() as i64;
    let available = (span - excluded).max(0) as usize;
    let take = need.min(available);
    if take == 0 {
        return Vec::new();
    }
    if span <= take as i64 * ENUMERATE_FACTOR {
        let pool: Vec<ItemId> = (lo..=hi).filter(|id| !exclude.contains(id)).collect();
        return pool.choose_multiple(rng, take).copied().collect();
    }
    // Sparse draw: at most 1/ENUMERATE_FACTOR of the range is wanted, so rejections are rare.
    let mut picked = HashSet::with_capacity(take);
    let mut out = Vec::with_capacity(take);
    while out.len() < take {
        let id = rng.gen_range(lo..=hi);
        if !exclude.contains(&id) && picked.insert(id) {
            out.push(id);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn picks_exactly_the_shortfall() {
        let mut rng = StdRng::seed_from_u64(7);
        let present: HashSet<ItemId> = (1..=6).collect();
        for _ in 0..100 {
            let ids = pick_candidates(&mut rng, 1, 10_000, 4, &present);
            assert_eq!(ids.len(), 4);
            let distinct: HashSet<_> = ids.iter().copied().collect();
            assert_eq!(distinct.len(), 4);
            assert!(ids.iter().all(|id| (1..=10_000).contains(id) && !present.contains(id)));
        }
    }

    #[test]
    fn small_ranges_are_capped() {
        let mut rng = StdRng::seed_from_u64(1);
        let present: HashSet<ItemId> = [3].into_iter().collect();
        let mut ids = pick_candidates(&mut rng, 1, 5, 10, &present);
        ids.sort();
        assert_eq!(ids, vec![1, 2, 4, 5]);
        assert!(pick_candidates(&mut rng, 3, 3, 10, &present).is_empty());
        assert!(pick_candidates(&mut rng, 9, 1, 10, &HashSet::new()).is_empty());
    }
}
