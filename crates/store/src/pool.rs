//! Bounded task pools. The engine runs two: a general worker pool and a small timer pool
//! for scheduled jobs, so a long merge never holds a worker slot.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

pub struct WorkerPool {
    name: &'static str,
    size: usize,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl WorkerPool {
    pub fn new(name: &'static str, size: usize) -> Self {
        let size = size.max(1);
        Self { name, size, permits: Arc::new(Semaphore::new(size)), tracker: TaskTracker::new() }
    }

    /// Tasks spawned and not yet finished, queued ones included.
    pub fn in_flight(&self) -> usize { self.tracker.len() }
    pub fn is_draining(&self) -> bool { self.tracker.is_closed() }

    /// Fire-and-forget. The job waits for a free slot; callers return immediately.
    pub fn spawn<F>(&self, job: &'static str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let _ = self.run(job, fut);
    }

    /// Like [`spawn`](Self::spawn) but hands back the job's output.
    pub fn run<F, T>(&self, job: &'static str, fut: F) -> JoinHandle<Option<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        let pool = self.name;
        let size = self.size;
        counter!("pool_jobs_total", 1u64, "pool" => pool, "job" => job);
        self.tracker.spawn(async move {
            let Ok(_permit) = Arc::clone(&permits).acquire_owned().await else {
                counter!("pool_jobs_dropped_total", 1u64, "pool" => pool, "job" => job);
                warn!(pool, job, "pool abandoned; dropping queued job");
                return None;
            };
            gauge!("pool_busy", size.saturating_sub(permits.available_permits()) as f64, "pool" => pool);
            Some(fut.await)
        })
    }

    /// Close the pool and wait for in-flight jobs, up to `timeout`. Jobs spawned while
    /// draining are still tracked. On timeout, jobs still waiting for a slot are abandoned
    /// and running ones are left to finish; returns false.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.tracker.close();
        let pending = self.tracker.len();
        debug!(pool = self.name, pending, "draining pool");
        match tokio::time::timeout(timeout, self.tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                self.permits.close();
                warn!(pool = self.name, remaining = self.tracker.len(), ?timeout, "pool drain timed out");
                false
            }
        }
    }
}
