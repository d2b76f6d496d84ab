//! hotrank cache boundary.
//!
//! The engine keeps all shared mutable state behind [`Cache`]: item hashes, per-actor
//! membership sets, hour/day/week score structures, leased locks and the last-event stamp.
//! [`MemCache`] is the in-process backend; it can dump itself to disk on demand.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;

pub mod lock;
pub mod mem;

pub use lock::CacheLock;
pub use mem::MemCache;

/// Field/value pairs of a hash entry.
pub type Fields = BTreeMap<String, String>;

/// Key-value, hash, set and sorted-set operations. Set and sorted-set members are item ids.
///
/// Every operation is atomic with respect to the key(s) it touches. Errors mean the
/// backend is unavailable or a key holds a value of another type.
#[async_trait::async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;
    /// Set only if absent. Returns whether the value was written.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;
    async fn del(&self, key: &str) -> Result<bool>;
    /// Delete only if the current string value equals `expected`.
    async fn del_if_eq(&self, key: &str, expected: &str) -> Result<bool>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;
    /// Remaining time to live; `None` for missing keys and keys without expiry.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;

    async fn hgetall(&self, key: &str) -> Result<Option<Fields>>;
    /// Replace the whole hash.
    async fn hset_all(&self, key: &str, fields: &Fields, ttl: Option<Duration>) -> Result<()>;
    /// Set one field of an existing hash. Returns false if the hash does not exist.
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<bool>;
    /// Increment an integer field of an existing hash; `None` if the hash does not exist.
    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<Option<i64>>;

    async fn sadd(&self, key: &str, member: i64) -> Result<bool>;
    /// Remove a member. Returns whether it was present.
    async fn srem(&self, key: &str, member: i64) -> Result<bool>;
    async fn sismember(&self, key: &str, member: i64) -> Result<bool>;
    async fn smembers(&self, key: &str) -> Result<Vec<i64>>;

    /// Set a member's score. Returns whether the member was new.
    async fn zadd(&self, key: &str, member: i64, score: f64) -> Result<bool>;
    async fn zcard(&self, key: &str) -> Result<usize>;
    async fn zscore(&self, key: &str, member: i64) -> Result<Option<f64>>;
    /// Highest scores first; equal scores ordered by member ascending.
    async fn zrevrange(&self, key: &str, limit: usize) -> Result<Vec<(i64, f64)>>;
    /// Replace `dest` with the union of `sources`, summing scores. Returns the member count.
    async fn zunion_store(&self, dest: &str, sources: &[String], ttl: Option<Duration>) -> Result<usize>;

    /// Flush the dataset to the backend's persistence layer.
    async fn save(&self) -> Result<()>;
}
