//! Applies one action event: membership bookkeeping, counter deltas, re-scoring into the
//! current hour window, then a queued write-back.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use hotrank_cache::Cache;
use hotrank_core::keys::{hour_key, item_key, membership_key, HOUR_WINDOW_TTL};
use hotrank_core::{hotness, ActionEvent, ActionKind, ActorId, Clock, ItemId, Metric, Weights};
use metrics::{counter, histogram};
use tracing::{debug, warn};

use crate::activity::ActivityTracker;
use crate::codec::{decode_item, is_null_marker};
use crate::loader::Loader;
use crate::reconcile::ReconcileQueue;

/// What happened to an event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Applied {
    /// Scored into the current hour window.
    Scored { item: ItemId, score: f64 },
    /// The item does not exist (or could not be resolved); nothing changed.
    Dropped,
}

pub struct EventProcessor {
    cache: Arc<dyn Cache>,
    loader: Loader,
    activity: ActivityTracker,
    reconcile: ReconcileQueue,
    clock: Arc<dyn Clock>,
    weights: Weights,
}

impl EventProcessor {
    pub fn new(
        cache: Arc<dyn Cache>,
        loader: Loader,
        activity: ActivityTracker,
        reconcile: ReconcileQueue,
        clock: Arc<dyn Clock>,
        weights: Weights,
    ) -> Self {
        Self { cache, loader, activity, reconcile, clock, weights }
    }

    /// Apply and log. Errors never surface to the event source.
    pub async fn process_event(&self, ev: ActionEvent) {
        match self.apply(ev).await {
            Ok(Applied::Scored { item, score }) => debug!(item, action = %ev.action, score, "event applied"),
            Ok(Applied::Dropped) => {}
            Err(e) => {
                counter!("events_failed_total", 1u64);
                warn!(item = ev.item_id, actor = ev.actor_id, action = %ev.action, error = %e, "event processing failed");
            }
        }
    }

    pub async fn apply(&self, ev: ActionEvent) -> Result<Applied> {
        let started = std::time::Instant::now();
        self.activity.touch().await;

        if self.loader.get_item(ev.item_id).await.is_none() {
            counter!("events_dropped_total", 1u64);
            debug!(item = ev.item_id, action = %ev.action, "dropping event for unknown item");
            return Ok(Applied::Dropped);
        }
        let key = item_key(ev.item_id);

        // SUPPORT and OPPOSE exclude each other per actor.
        if let Some(other) = ev.action.exclusive_with() {
            if self.cache.srem(&membership_key(ev.actor_id, other), ev.item_id).await? {
                self.bump(&key, other.metric(), -1).await?;
            }
        }

        let moved = if ev.action.is_tracked() {
            let set = membership_key(ev.actor_id, ev.action);
            if ev.action.is_cancel() {
                self.cache.srem(&set, ev.item_id).await?
            } else {
                self.cache.sadd(&set, ev.item_id).await?
            }
        } else {
            true
        };
        if moved {
            self.bump(&key, ev.action.metric(), ev.action.delta()).await?;
        }

        let fields = self
            .cache
            .hgetall(&key)
            .await?
            .filter(|f| !is_null_marker(f))
            .ok_or_else(|| anyhow!("item {} left the cache mid-update", ev.item_id))?;
        let item = decode_item(&fields)?;
        let now = self.clock.now_ms();
        let score = hotness(&item.counters, item.created_at_ms, now, &self.weights);
        let window = hour_key(now);
        self.cache.zadd(&window, ev.item_id, score).await?;
        if self.cache.ttl(&window).await?.is_none() {
            self.cache.expire(&window, HOUR_WINDOW_TTL).await?;
        }

        self.reconcile.enqueue(ev.item_id);
        counter!("events_applied_total", 1u64, "action" => ev.action.as_str());
        histogram!("event_apply_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(Applied::Scored { item: ev.item_id, score })
    }

    /// Add `delta` to one counter, clamping at zero.
    async fn bump(&self, key: &str, metric: Metric, delta: i64) -> Result<()> {
        match self.cache.hincr_by(key, metric.field(), delta).await? {
            Some(v) if v < 0 => {
                self.cache.hset(key, metric.field(), "0").await?;
            }
            Some(_) => {}
            None => warn!(key, field = metric.field(), "item evicted before counter update"),
        }
        Ok(())
    }

    /// Whether `actor` currently holds a support, oppose or favorite on `item`.
    pub async fn has_acted(&self, actor: ActorId, kind: ActionKind, item: ItemId) -> Result<bool> {
        if !kind.is_tracked() {
            return Ok(false);
        }
        self.cache.sismember(&membership_key(actor, kind), item).await
    }
}
