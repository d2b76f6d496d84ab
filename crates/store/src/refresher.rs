//! Rebuilds the published top-N of each period: merge windows, top up the hour window on
//! cold start, resolve item details, then swap the snapshot.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use futures::future::join_all;
use hotrank_core::{Clock, Period};
use metrics::{counter, gauge, histogram};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::activity::ActivityTracker;
use crate::backfill::Backfiller;
use crate::config::EngineConfig;
use crate::loader::Loader;
use crate::pool::WorkerPool;
use crate::snapshot::{RankedItem, Snapshots};
use crate::windows::WindowAggregator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum RefreshOutcome {
    /// No event within the period's freshness window.
    Skipped,
    Published { entries: usize, epoch: u64 },
}

pub struct SnapshotRefresher {
    windows: WindowAggregator,
    loader: Loader,
    backfiller: Arc<Backfiller>,
    activity: ActivityTracker,
    snapshots: Arc<Snapshots>,
    clock: Arc<dyn Clock>,
    cfg: Arc<EngineConfig>,
}

impl SnapshotRefresher {
    pub fn new(
        windows: WindowAggregator,
        loader: Loader,
        backfiller: Arc<Backfiller>,
        activity: ActivityTracker,
        snapshots: Arc<Snapshots>,
        clock: Arc<dyn Clock>,
        cfg: Arc<EngineConfig>,
    ) -> Self {
        Self { windows, loader, backfiller, activity, snapshots, clock, cfg }
    }

    /// Refresh one period. Unless `force`d, an idle system keeps its current snapshot.
    pub async fn refresh(&self, period: Period, force: bool) -> Result<RefreshOutcome> {
        self.refresh_with(period, force, true).await
    }

    /// Like [`refresh`](Self::refresh); with `backfill` off a cold hour window is published
    /// as it is, and no synthetic events are written.
    pub async fn refresh_with(&self, period: Period, force: bool, backfill: bool) -> Result<RefreshOutcome> {
        if !force && !self.activity.active_within(self.cfg.freshness(period)).await {
            counter!("refresh_skipped_total", 1u64, "period" => period.as_str());
            debug!(%period, "idle; keeping current snapshot");
            return Ok(RefreshOutcome::Skipped);
        }
        let started = std::time::Instant::now();
        let now = self.clock.now_ms();
        let working = period.working_key();
        self.windows.merge_for(period, now).await?;

        if backfill && period == Period::Hour {
            match self.backfiller.backfill(&working).await {
                Ok(ids) if !ids.is_empty() => {
                    self.windows.merge_for(period, now).await?;
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "backfill failed; publishing what is there"),
            }
        }

        let top = self.windows.top(&working, self.cfg.top_n).await?;
        let mut entries = Vec::with_capacity(top.len());
        for (id, score) in top {
            // Items that vanished since they were scored are left out; ranks stay dense.
            if let Some(item) = self.loader.get_item(id).await {
                entries.push(RankedItem {
                    rank: 0,
                    item_id: id,
                    score,
                    title: item.title,
                    category_id: item.category_id,
                    counters: item.counters,
                });
            }
        }
        let n = entries.len();
        let epoch = self.snapshots.publish(period, entries, now);
        histogram!("refresh_ms", started.elapsed().as_secs_f64() * 1000.0, "period" => period.as_str());
        counter!("refresh_published_total", 1u64, "period" => period.as_str());
        gauge!("snapshot_entries", n as f64, "period" => period.as_str());
        info!(%period, entries = n, epoch, force, "snapshot published");
        Ok(RefreshOutcome::Published { entries: n, epoch })
    }

    /// Refresh all periods concurrently on `pool`. Every period is attempted; the first
    /// failure is reported.
    pub async fn refresh_all(
        self: &Arc<Self>,
        pool: &WorkerPool,
        force: bool,
        backfill: bool,
    ) -> Result<Vec<(Period, RefreshOutcome)>> {
        let handles = Period::ALL.map(|p| {
            let this = Arc::clone(self);
            (p, pool.run("refresh", async move { this.refresh_with(p, force, backfill).await }))
        });
        let results = join_all(handles.into_iter().map(|(p, h)| async move { (p, h.await) })).await;
        let mut out = Vec::with_capacity(results.len());
        let mut first_err = None;
        for (p, joined) in results {
            match joined {
                Ok(Some(Ok(outcome))) => out.push((p, outcome)),
                Ok(Some(Err(e))) => {
                    warn!(period = %p, error = %e, "refresh failed");
                    first_err.get_or_insert(e.context(format!("refreshing {}", p)));
                }
                Ok(None) => {
                    first_err.get_or_insert(anyhow!("refresh of {} dropped: pool closed", p));
                }
                Err(e) => {
                    first_err.get_or_insert(anyhow!("refresh of {} panicked: {}", p, e));
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(out),
        }
    }
}
