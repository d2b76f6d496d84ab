//! Wiring and lifecycle: one engine owns the pools, the pipeline components and the
//! published snapshots.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{anyhow, Result};
use hotrank_cache::Cache;
use hotrank_core::{ActionEvent, ActionKind, ActorId, Category, CategoryId, Clock, Item, ItemId, Period};
use hotrank_persist::ItemStore;
use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::activity::{ActivityTracker, Metadata};
use crate::backfill::Backfiller;
use crate::config::EngineConfig;
use crate::loader::Loader;
use crate::pool::WorkerPool;
use crate::processor::{Applied, EventProcessor};
use crate::reconcile::{ReconcileOutcome, ReconcileQueue, Reconciler};
use crate::refresher::{RefreshOutcome, SnapshotRefresher};
use crate::schedule::{ScheduleHandle, Scheduler};
use crate::snapshot::{RankSnapshot, Snapshots};
use crate::windows::WindowAggregator;

/// Point-in-time view of engine health.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub ready: bool,
    pub draining: bool,
    pub epoch: u64,
    pub last_event_ms: Option<i64>,
    pub workers_in_flight: usize,
    pub timers_in_flight: usize,
    pub pending_reconciles: usize,
    pub snapshot_sizes: Vec<(Period, usize)>,
}

pub struct Engine {
    cfg: Arc<EngineConfig>,
    cache: Arc<dyn Cache>,
    clock: Arc<dyn Clock>,
    workers: Arc<WorkerPool>,
    timers: Arc<WorkerPool>,
    activity: ActivityTracker,
    meta: Metadata,
    loader: Loader,
    processor: Arc<EventProcessor>,
    windows: WindowAggregator,
    reconciler: Arc<Reconciler>,
    reconcile_queue: ReconcileQueue,
    refresher: Arc<SnapshotRefresher>,
    snapshots: Arc<Snapshots>,
    ready: AtomicBool,
    cancel: CancellationToken,
    schedule: Mutex<Option<ScheduleHandle>>,
}

impl Engine {
    pub fn new(cache: Arc<dyn Cache>, origin: Arc<dyn ItemStore>, clock: Arc<dyn Clock>, cfg: EngineConfig) -> Self {
        let cfg = Arc::new(cfg);
        let workers = Arc::new(WorkerPool::new("workers", cfg.workers));
        let timers = Arc::new(WorkerPool::new("timers", cfg.timer_workers));
        let activity = ActivityTracker::new(Arc::clone(&cache), Arc::clone(&clock));
        let meta = Metadata::new(Arc::clone(&cache), Arc::clone(&origin));
        let loader = Loader::new(Arc::clone(&cache), Arc::clone(&origin), cfg.loader.clone(), Arc::clone(&workers));
        let reconciler = Arc::new(Reconciler::new(Arc::clone(&cache), Arc::clone(&origin), cfg.loader.clone()));
        let reconcile_queue = ReconcileQueue::new(Arc::clone(&reconciler), Arc::clone(&workers));
        let processor = Arc::new(EventProcessor::new(
            Arc::clone(&cache),
            loader.clone(),
            activity.clone(),
            reconcile_queue.clone(),
            Arc::clone(&clock),
            cfg.weights,
        ));
        let backfiller = Arc::new(Backfiller::new(
            Arc::clone(&cache),
            meta.clone(),
            Arc::clone(&processor),
            Arc::clone(&clock),
            cfg.backfill_target,
        ));
        let windows = WindowAggregator::new(Arc::clone(&cache));
        let snapshots = Arc::new(Snapshots::new());
        let refresher = Arc::new(SnapshotRefresher::new(
            windows.clone(),
            loader.clone(),
            backfiller,
            activity.clone(),
            Arc::clone(&snapshots),
            Arc::clone(&clock),
            Arc::clone(&cfg),
        ));
        Self {
            cfg,
            cache,
            clock,
            workers,
            timers,
            activity,
            meta,
            loader,
            processor,
            windows,
            reconciler,
            reconcile_queue,
            refresher,
            snapshots,
            ready: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            schedule: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &EngineConfig { &self.cfg }
    pub fn is_ready(&self) -> bool { self.ready.load(Ordering::SeqCst) }
    pub fn is_draining(&self) -> bool { self.cancel.is_cancelled() }

    /// Startup: load corpus metadata and publish every period, idle or not. The engine is
    /// marked ready even when a period failed so readers get whatever was published.
    pub async fn start(&self) -> Result<()> {
        if let Err(e) = self.meta.reload().await {
            warn!(error = %e, "initial metadata load failed");
        }
        let res = self.refresher.refresh_all(&self.workers, true, true).await;
        self.ready.store(true, Ordering::SeqCst);
        match &res {
            Ok(outcomes) => info!(?outcomes, "engine ready"),
            Err(e) => warn!(error = %e, "engine ready with incomplete snapshots"),
        }
        res.map(|_| ())
    }

    /// Publish every period from what the cache already holds, without backfilling a cold
    /// hour window. Nothing is written back to the origin.
    pub async fn rebuild(&self) -> Result<Vec<(Period, RefreshOutcome)>> {
        let res = self.refresher.refresh_all(&self.workers, true, false).await;
        self.ready.store(true, Ordering::SeqCst);
        res
    }

    /// Queue an event for processing on the worker pool and return immediately.
    pub fn submit(&self, ev: ActionEvent) {
        if self.is_draining() {
            counter!("events_rejected_total", 1u64);
            warn!(item = ev.item_id, action = %ev.action, "engine draining; event rejected");
            return;
        }
        let processor = Arc::clone(&self.processor);
        self.workers.spawn("event", async move { processor.process_event(ev).await });
    }

    /// Process an event inline.
    pub async fn process(&self, ev: ActionEvent) -> Result<Applied> { self.processor.apply(ev).await }

    pub fn top(&self, period: Period) -> Arc<RankSnapshot> { self.snapshots.current(period) }
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.snapshots.subscribe_epoch() }

    pub async fn item(&self, id: ItemId) -> Option<Item> { self.loader.get_item(id).await }
    pub async fn category(&self, id: CategoryId) -> Option<Category> { self.loader.get_category(id).await }

    /// Ids registered under a category by item loads so far.
    pub async fn category_items(&self, id: CategoryId) -> Result<Vec<ItemId>> {
        self.cache.smembers(&hotrank_core::keys::category_items_key(id)).await
    }

    pub async fn has_acted(&self, actor: ActorId, kind: ActionKind, item: ItemId) -> Result<bool> {
        self.processor.has_acted(actor, kind, item).await
    }

    pub async fn refresh(&self, period: Period, force: bool) -> Result<RefreshOutcome> {
        self.refresher.refresh(period, force).await
    }

    /// Admin: refresh every period now, ignoring the idle gate.
    pub async fn force_refresh(&self) -> Result<Vec<(Period, RefreshOutcome)>> {
        self.refresher.refresh_all(&self.workers, true, true).await
    }

    pub async fn reconcile(&self, id: ItemId) -> Result<ReconcileOutcome> { self.reconciler.reconcile(id).await }

    /// Admin: persist the cache dataset.
    pub async fn flush(&self) -> Result<()> {
        let started = std::time::Instant::now();
        self.cache.save().await?;
        info!(elapsed_ms = started.elapsed().as_millis() as u64, "cache flushed");
        Ok(())
    }

    /// Reload the id range on the worker pool.
    pub async fn reload_metadata(&self) -> Result<Option<(ItemId, ItemId)>> {
        let meta = self.meta.clone();
        self.on_workers("reload_metadata", async move { meta.reload().await }).await
    }

    /// Roll yesterday's hour buckets into its day bucket, on the worker pool.
    pub async fn merge_previous_day(&self) -> Result<usize> {
        let windows = self.windows.clone();
        let now = self.clock.now_ms();
        self.on_workers("merge_previous_day", async move { windows.merge_previous_day(now).await }).await
    }

    /// Idle-gated refresh of one period, run on the worker pool.
    async fn refresh_on_workers(&self, period: Period) -> Result<RefreshOutcome> {
        let refresher = Arc::clone(&self.refresher);
        self.on_workers("refresh", async move { refresher.refresh(period, false).await }).await
    }

    async fn on_workers<F, T>(&self, job: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        match self.workers.run(job, fut).await {
            Ok(Some(res)) => res,
            Ok(None) => Err(anyhow!("{} dropped: worker pool abandoned", job)),
            Err(e) => Err(anyhow!("{} panicked: {}", job, e)),
        }
    }

    pub async fn stats(&self) -> EngineStats {
        EngineStats {
            ready: self.is_ready(),
            draining: self.is_draining(),
            epoch: self.snapshots.epoch(),
            last_event_ms: self.activity.last_event_ms().await,
            workers_in_flight: self.workers.in_flight(),
            timers_in_flight: self.timers.in_flight(),
            pending_reconciles: self.reconcile_queue.pending(),
            snapshot_sizes: Period::ALL.iter().map(|&p| (p, self.snapshots.current(p).len())).collect(),
        }
    }

    /// Start the refresh cadences and the daily jobs. Timers trigger on the timer pool; the
    /// work itself runs on the worker pool.
    pub fn spawn_schedule(self: &Arc<Self>) {
        let mut slot = self.schedule.lock();
        if slot.is_some() {
            warn!("schedule already running");
            return;
        }
        let s = &self.cfg.schedule;
        let handle = Scheduler::new(Arc::clone(&self.timers), Arc::clone(&self.clock), self.cancel.child_token())
            .job("refresh_1h", s.hour_refresh, refresh_job(Arc::downgrade(self), Period::Hour))
            .job("refresh_24h", s.day_refresh, refresh_job(Arc::downgrade(self), Period::Day))
            .job("refresh_7d", s.week_refresh, refresh_job(Arc::downgrade(self), Period::Week))
            .job("reload_metadata", s.metadata_reload, {
                let weak = Arc::downgrade(self);
                move || {
                    let weak = weak.clone();
                    async move {
                        let Some(engine) = weak.upgrade() else { return };
                        if let Err(e) = engine.reload_metadata().await {
                            warn!(error = %e, "scheduled metadata reload failed");
                        }
                    }
                }
            })
            .job("merge_previous_day", s.day_merge, {
                let weak = Arc::downgrade(self);
                move || {
                    let weak = weak.clone();
                    async move {
                        let Some(engine) = weak.upgrade() else { return };
                        match engine.merge_previous_day().await {
                            Ok(n) => info!(members = n, "previous day merged"),
                            Err(e) => warn!(error = %e, "scheduled day merge failed"),
                        }
                    }
                }
            })
            .start();
        *slot = Some(handle);
        info!("schedule started");
    }

    /// Stop scheduling, reject new events, and wait for queued work up to `timeout`.
    /// Returns whether everything finished in time.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        self.cancel.cancel();
        let schedule = self.schedule.lock().take();
        if let Some(handle) = schedule {
            handle.stop().await;
        }
        let timers_done = self.timers.drain(deadline.saturating_duration_since(Instant::now())).await;
        let workers_done = self.workers.drain(deadline.saturating_duration_since(Instant::now())).await;
        let clean = timers_done && workers_done;
        if clean {
            info!("engine drained");
        } else {
            warn!(?timeout, "shutdown timed out with work still running");
        }
        clean
    }
}

fn refresh_job(weak: Weak<Engine>, period: Period) -> impl Fn() -> futures::future::BoxFuture<'static, ()> + Send + Sync {
    move || {
        let weak = weak.clone();
        Box::pin(async move {
            let Some(engine) = weak.upgrade() else { return };
            match engine.refresh_on_workers(period).await {
                Ok(outcome) => tracing::debug!(%period, ?outcome, "scheduled refresh"),
                Err(e) => warn!(%period, error = %e, "scheduled refresh failed"),
            }
        })
    }
}
