//! Periodic and daily jobs. Each job has a timing loop; a tick hands the job body to the
//! timer pool and goes back to sleep. A tick that finds the previous run still going is
//! skipped.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hotrank_core::keys::DAY_MS;
use hotrank_core::Clock;
use metrics::counter;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::config::Cadence;
use crate::pool::WorkerPool;

pub type JobFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
type JobFn = Arc<dyn Fn() -> JobFuture + Send + Sync>;

struct Job {
    name: &'static str,
    cadence: Cadence,
    body: JobFn,
    running: Arc<AtomicBool>,
}

pub struct Scheduler {
    jobs: Vec<Job>,
    timers: Arc<WorkerPool>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    loops: TaskTracker,
}

impl Scheduler {
    pub fn new(timers: Arc<WorkerPool>, clock: Arc<dyn Clock>, cancel: CancellationToken) -> Self {
        Self { jobs: Vec::new(), timers, clock, cancel, loops: TaskTracker::new() }
    }

    pub fn job<F, Fut>(mut self, name: &'static str, cadence: Cadence, body: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let body: JobFn = Arc::new(move || Box::pin(body()) as JobFuture);
        self.jobs.push(Job { name, cadence, body, running: Arc::new(AtomicBool::new(false)) });
        self
    }

    /// Start every timing loop. Loops stop when the cancellation token fires.
    pub fn start(self) -> ScheduleHandle {
        for job in self.jobs {
            let timers = Arc::clone(&self.timers);
            let clock = Arc::clone(&self.clock);
            let cancel = self.cancel.clone();
            self.loops.spawn(run_loop(job, timers, clock, cancel));
        }
        self.loops.close();
        ScheduleHandle { cancel: self.cancel, loops: self.loops }
    }
}

pub struct ScheduleHandle {
    cancel: CancellationToken,
    loops: TaskTracker,
}

impl ScheduleHandle {
    /// Stop the timing loops. Job bodies already handed to the timer pool keep running.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.loops.wait().await;
    }
}

async fn run_loop(job: Job, timers: Arc<WorkerPool>, clock: Arc<dyn Clock>, cancel: CancellationToken) {
    debug!(job = job.name, cadence = ?job.cadence, "schedule loop started");
    match job.cadence {
        Cadence::Every { initial_delay, period } => {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(initial_delay) => {}
            }
            let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => fire(&job, &timers),
                }
            }
        }
        Cadence::DailyAt(offset) => loop {
            let wait = until_next_daily(clock.now_ms(), offset);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => fire(&job, &timers),
            }
        },
    }
    debug!(job = job.name, "schedule loop stopped");
}

fn fire(job: &Job, timers: &WorkerPool) {
    if job.running.swap(true, Ordering::SeqCst) {
        counter!("schedule_overlap_skipped_total", 1u64, "job" => job.name);
        info!(job = job.name, "previous run still in progress; skipping tick");
        return;
    }
    counter!("schedule_fired_total", 1u64, "job" => job.name);
    let body = (job.body)();
    let running = Arc::clone(&job.running);
    timers.spawn(job.name, async move {
        body.await;
        running.store(false, Ordering::SeqCst);
    });
}

/// Time from `now_ms` to the next UTC time-of-day `offset`. Exactly on the mark waits a full day.
pub fn until_next_daily(now_ms: i64, offset: Duration) -> Duration {
    let into_day = now_ms.rem_euclid(DAY_MS);
    let target = (offset.as_millis() as i64).rem_euclid(DAY_MS);
    let wait = if into_day < target { target - into_day } else { DAY_MS - into_day + target };
    Duration::from_millis(wait as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hotrank_core::ManualClock;
    use std::sync::atomic::AtomicUsize;

    // 2024-03-09T13:45:00Z
    const T: i64 = 1_709_991_900_000;

    #[test]
    fn next_daily_boundaries() {
        let midnight = T - T.rem_euclid(DAY_MS);
        assert_eq!(until_next_daily(T, Duration::ZERO), Duration::from_millis((DAY_MS - (T - midnight)) as u64));
        assert_eq!(until_next_daily(midnight, Duration::from_secs(30)), Duration::from_secs(30));
        assert_eq!(until_next_daily(midnight + 30_000, Duration::from_secs(30)), Duration::from_millis(DAY_MS as u64));
        assert_eq!(until_next_daily(midnight + 31_000, Duration::from_secs(30)), Duration::from_millis(DAY_MS as u64 - 1000));
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_job_runs_on_timer_pool_until_stopped() {
        let timers = Arc::new(WorkerPool::new("timers", 1));
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let handle = Scheduler::new(timers.clone(), Arc::new(ManualClock::new(T)), CancellationToken::new())
            .job(
                "count",
                Cadence::Every { initial_delay: Duration::from_secs(60), period: Duration::from_secs(60) },
                move || {
                    let h = h.clone();
                    async move {
                        h.fetch_add(1, Ordering::SeqCst);
                    }
                },
            )
            .start();
        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(62)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        handle.stop().await;
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_tick_is_skipped() {
        let timers = Arc::new(WorkerPool::new("timers", 2));
        let started = Arc::new(AtomicUsize::new(0));
        let s = started.clone();
        let handle = Scheduler::new(timers.clone(), Arc::new(ManualClock::new(T)), CancellationToken::new())
            .job(
                "slow",
                Cadence::Every { initial_delay: Duration::ZERO, period: Duration::from_secs(1) },
                move || {
                    let s = s.clone();
                    async move {
                        s.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(3500)).await;
                    }
                },
            )
            .start();
        tokio::time::sleep(Duration::from_millis(3200)).await;
        assert_eq!(started.load(Ordering::SeqCst), 1);
        handle.stop().await;
        assert!(timers.drain(Duration::from_secs(10)).await);
    }
}
