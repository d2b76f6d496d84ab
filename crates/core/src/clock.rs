//! Wall-clock source, injectable so window placement and decay can be tested.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

pub trait Clock: Send + Sync {
    /// Epoch millis.
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
        now.as_millis() as i64
    }
}

/// Clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    ms: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(ms: i64) -> Self { Self { ms: Arc::new(AtomicI64::new(ms)) } }
    pub fn set(&self, ms: i64) { self.ms.store(ms, Ordering::SeqCst); }
    pub fn advance(&self, ms: i64) { self.ms.fetch_add(ms, Ordering::SeqCst); }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 { self.ms.load(Ordering::SeqCst) }
}
