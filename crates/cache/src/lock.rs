//! Leased mutual exclusion on top of conditional set / conditional delete.

use std::time::Duration;

use anyhow::Result;
use tokio::time::Instant;
use tracing::trace;

use crate::Cache;

const POLL: Duration = Duration::from_millis(10);

/// Ownership of a lock key, proven by a random token.
#[derive(Debug)]
#[must_use = "a lock should be released once the guarded work is done"]
pub struct CacheLock {
    key: String,
    token: String,
}

impl CacheLock {
    /// Try to take `key` for `lease`, polling for at most `wait`.
    ///
    /// `Ok(None)` means someone else kept the lock for the whole wait.
    pub async fn acquire(cache: &dyn Cache, key: &str, wait: Duration, lease: Duration) -> Result<Option<CacheLock>> {
        let token = uuid::Uuid::new_v4().to_string();
        let deadline = Instant::now() + wait;
        loop {
            if cache.set_nx(key, &token, lease).await? {
                trace!(key, "lock acquired");
                return Ok(Some(CacheLock { key: key.to_string(), token }));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL.min(deadline - now)).await;
        }
    }

    /// Delete the lock key only if it still carries our token. A lease that expired and was
    /// taken by another caller is left alone.
    pub async fn release(self, cache: &dyn Cache) -> Result<bool> {
        let released = cache.del_if_eq(&self.key, &self.token).await?;
        trace!(key = %self.key, released, "lock released");
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemCache;

    #[tokio::test]
    async fn second_caller_times_out_while_held() {
        let c = MemCache::new();
        let held = CacheLock::acquire(&c, "lock:item:9", Duration::from_millis(50), Duration::from_secs(10))
            .await
            .unwrap()
            .expect("free lock");
        let t0 = std::time::Instant::now();
        let other = CacheLock::acquire(&c, "lock:item:9", Duration::from_millis(50), Duration::from_secs(10)).await.unwrap();
        assert!(other.is_none());
        assert!(t0.elapsed() >= Duration::from_millis(45));
        assert!(held.release(&c).await.unwrap());
        let again = CacheLock::acquire(&c, "lock:item:9", Duration::from_millis(50), Duration::from_secs(10)).await.unwrap();
        assert!(again.is_some());
    }

    #[tokio::test]
    async fn stale_owner_cannot_release_new_owner() {
        let c = MemCache::new();
        let first = CacheLock::acquire(&c, "lock:item:1", Duration::ZERO, Duration::from_millis(10)).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = CacheLock::acquire(&c, "lock:item:1", Duration::ZERO, Duration::from_secs(10)).await.unwrap().unwrap();
        assert!(!first.release(&c).await.unwrap());
        assert!(c.get("lock:item:1").await.unwrap().is_some());
        assert!(second.release(&c).await.unwrap());
    }
}
