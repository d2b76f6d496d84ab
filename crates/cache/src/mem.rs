//! In-process cache backend with lazy expiry and JSON dump/restore.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use metrics::{counter, gauge, histogram};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{Cache, Fields};

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Value {
    Str(String),
    Hash(Fields),
    Set(BTreeSet<i64>),
    ZSet(FxHashMap<i64, f64>),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::Hash(_) => "hash",
            Value::Set(_) => "set",
            Value::ZSet(_) => "zset",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    value: Value,
    /// Wall-clock epoch millis.
    expires_at_ms: Option<i64>,
}

impl Entry {
    fn new(value: Value, ttl: Option<Duration>, now: i64) -> Self {
        Self { value, expires_at_ms: ttl.map(|t| now + t.as_millis() as i64) }
    }
    fn expired(&self, now: i64) -> bool {
        self.expires_at_ms.map(|at| at <= now).unwrap_or(false)
    }
}

#[derive(Serialize, Deserialize)]
struct Dump {
    saved_at_ms: i64,
    entries: BTreeMap<String, Entry>,
}

type Map = FxHashMap<String, Entry>;

/// Single-instance cache living in this process.
pub struct MemCache {
    map: Mutex<Map>,
    dump_path: Option<PathBuf>,
    offline: AtomicBool,
}

impl Default for MemCache {
    fn default() -> Self { Self::new() }
}

fn now_ms() -> i64 {
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    now.as_millis() as i64
}

fn wrong_type(key: &str, found: &Value, want: &str) -> anyhow::Error {
    anyhow!("WRONGTYPE key {} holds a {}, expected {}", key, found.kind(), want)
}

/// Drop `key` if it has expired, then hand back the live entry.
fn live<'a>(map: &'a mut Map, key: &str, now: i64) -> Option<&'a mut Entry> {
    if map.get(key).map(|e| e.expired(now)).unwrap_or(false) {
        map.remove(key);
    }
    map.get_mut(key)
}

impl MemCache {
    pub fn new() -> Self {
        Self { map: Mutex::new(FxHashMap::default()), dump_path: None, offline: AtomicBool::new(false) }
    }

    /// Open a cache persisted at `path`, restoring a previous dump when one exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut me = Self::new();
        if path.exists() {
            let started = std::time::Instant::now();
            let bytes = std::fs::read(&path).with_context(|| format!("reading cache dump {}", path.display()))?;
            let dump: Dump = serde_json::from_slice(&bytes).with_context(|| format!("decoding cache dump {}", path.display()))?;
            let now = now_ms();
            let restored: Map = dump.entries.into_iter().filter(|(_, e)| !e.expired(now)).collect();
            info!(path = %path.display(), keys = restored.len(), saved_at_ms = dump.saved_at_ms, "cache dump restored");
            histogram!("cache_restore_ms", started.elapsed().as_secs_f64() * 1000.0);
            *me.map.get_mut() = restored;
        }
        me.dump_path = Some(path);
        Ok(me)
    }

    /// Simulate an outage: every operation fails while offline.
    pub fn set_offline(&self, offline: bool) { self.offline.store(offline, Ordering::SeqCst); }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = now_ms();
        self.map.lock().values().filter(|e| !e.expired(now)).count()
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    fn with_map<T>(&self, f: impl FnOnce(&mut Map, i64) -> Result<T>) -> Result<T> {
        if self.offline.load(Ordering::SeqCst) {
            counter!("cache_unavailable_total", 1u64);
            bail!("cache unavailable");
        }
        let mut map = self.map.lock();
        f(&mut map, now_ms())
    }
}

#[async_trait::async_trait]
impl Cache for MemCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.with_map(|m, now| match live(m, key, now) {
            None => Ok(None),
            Some(Entry { value: Value::Str(s), .. }) => Ok(Some(s.clone())),
            Some(e) => Err(wrong_type(key, &e.value, "string")),
        })
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.with_map(|m, now| {
            m.insert(key.to_string(), Entry::new(Value::Str(value.to_string()), ttl, now));
            Ok(())
        })
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.with_map(|m, now| {
            if live(m, key, now).is_some() {
                return Ok(false);
            }
            m.insert(key.to_string(), Entry::new(Value::Str(value.to_string()), Some(ttl), now));
            Ok(true)
        })
    }

    async fn del(&self, key: &str) -> Result<bool> {
        self.with_map(|m, now| Ok(live(m, key, now).is_some() && m.remove(key).is_some()))
    }

    async fn del_if_eq(&self, key: &str, expected: &str) -> Result<bool> {
        self.with_map(|m, now| {
            let owned = matches!(live(m, key, now), Some(Entry { value: Value::Str(s), .. }) if s.as_str() == expected);
            if owned {
                m.remove(key);
            }
            Ok(owned)
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.with_map(|m, now| match live(m, key, now) {
            Some(e) => {
                e.expires_at_ms = Some(now + ttl.as_millis() as i64);
                Ok(true)
            }
            None => Ok(false),
        })
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        self.with_map(|m, now| {
            Ok(live(m, key, now)
                .and_then(|e| e.expires_at_ms)
                .map(|at| Duration::from_millis((at - now).max(0) as u64)))
        })
    }

    async fn hgetall(&self, key: &str) -> Result<Option<Fields>> {
        self.with_map(|m, now| match live(m, key, now) {
            None => Ok(None),
            Some(Entry { value: Value::Hash(h), .. }) => Ok(Some(h.clone())),
            Some(e) => Err(wrong_type(key, &e.value, "hash")),
        })
    }

    async fn hset_all(&self, key: &str, fields: &Fields, ttl: Option<Duration>) -> Result<()> {
        self.with_map(|m, now| {
            m.insert(key.to_string(), Entry::new(Value::Hash(fields.clone()), ttl, now));
            Ok(())
        })
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        self.with_map(|m, now| match live(m, key, now) {
            None => Ok(false),
            Some(Entry { value: Value::Hash(h), .. }) => {
                h.insert(field.to_string(), value.to_string());
                Ok(true)
            }
            Some(e) => Err(wrong_type(key, &e.value, "hash")),
        })
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<Option<i64>> {
        self.with_map(|m, now| match live(m, key, now) {
            None => Ok(None),
            Some(Entry { value: Value::Hash(h), .. }) => {
                let cur = match h.get(field) {
                    Some(v) => v.parse::<i64>().with_context(|| format!("field {} of {} is not an integer", field, key))?,
                    None => 0,
                };
                let next = cur.saturating_add(delta);
                h.insert(field.to_string(), next.to_string());
                Ok(Some(next))
            }
            Some(e) => Err(wrong_type(key, &e.value, "hash")),
        })
    }

    async fn sadd(&self, key: &str, member: i64) -> Result<bool> {
        self.with_map(|m, now| {
            if live(m, key, now).is_none() {
                m.insert(key.to_string(), Entry::new(Value::Set(BTreeSet::new()), None, now));
            }
            match m.get_mut(key).map(|e| &mut e.value) {
                Some(Value::Set(s)) => Ok(s.insert(member)),
                Some(other) => Err(wrong_type(key, other, "set")),
                None => Ok(false),
            }
        })
    }

    async fn srem(&self, key: &str, member: i64) -> Result<bool> {
        self.with_map(|m, now| {
            let (removed, now_empty) = match live(m, key, now) {
                None => return Ok(false),
                Some(Entry { value: Value::Set(s), .. }) => (s.remove(&member), s.is_empty()),
                Some(e) => return Err(wrong_type(key, &e.value, "set")),
            };
            if now_empty {
                m.remove(key);
            }
            Ok(removed)
        })
    }

    async fn sismember(&self, key: &str, member: i64) -> Result<bool> {
        self.with_map(|m, now| match live(m, key, now) {
            None => Ok(false),
            Some(Entry { value: Value::Set(s), .. }) => Ok(s.contains(&member)),
            Some(e) => Err(wrong_type(key, &e.value, "set")),
        })
    }

    async fn smembers(&self, key: &str) -> Result<Vec<i64>> {
        self.with_map(|m, now| match live(m, key, now) {
            None => Ok(Vec::new()),
            Some(Entry { value: Value::Set(s), .. }) => Ok(s.iter().copied().collect()),
            Some(e) => Err(wrong_type(key, &e.value, "set")),
        })
    }

    async fn zadd(&self, key: &str, member: i64, score: f64) -> Result<bool> {
        self.with_map(|m, now| {
            if live(m, key, now).is_none() {
                m.insert(key.to_string(), Entry::new(Value::ZSet(FxHashMap::default()), None, now));
            }
            match m.get_mut(key).map(|e| &mut e.value) {
                Some(Value::ZSet(z)) => Ok(z.insert(member, score).is_none()),
                Some(other) => Err(wrong_type(key, other, "zset")),
                None => Ok(false),
            }
        })
    }

    async fn zcard(&self, key: &str) -> Result<usize> {
        self.with_map(|m, now| match live(m, key, now) {
            None => Ok(0),
            Some(Entry { value: Value::ZSet(z), .. }) => Ok(z.len()),
            Some(e) => Err(wrong_type(key, &e.value, "zset")),
        })
    }

    async fn zscore(&self, key: &str, member: i64) -> Result<Option<f64>> {
        self.with_map(|m, now| match live(m, key, now) {
            None => Ok(None),
            Some(Entry { value: Value::ZSet(z), .. }) => Ok(z.get(&member).copied()),
            Some(e) => Err(wrong_type(key, &e.value, "zset")),
        })
    }

    async fn zrevrange(&self, key: &str, limit: usize) -> Result<Vec<(i64, f64)>> {
        self.with_map(|m, now| match live(m, key, now) {
            None => Ok(Vec::new()),
            Some(Entry { value: Value::ZSet(z), .. }) => {
                let mut out: Vec<(i64, f64)> = z.iter().map(|(k, v)| (*k, *v)).collect();
                out.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
                out.truncate(limit);
                Ok(out)
            }
            Some(e) => Err(wrong_type(key, &e.value, "zset")),
        })
    }

    async fn zunion_store(&self, dest: &str, sources: &[String], ttl: Option<Duration>) -> Result<usize> {
        self.with_map(|m, now| {
            let mut acc: FxHashMap<i64, f64> = FxHashMap::default();
            for src in sources {
                match live(m, src, now) {
                    None => {}
                    Some(Entry { value: Value::ZSet(z), .. }) => {
                        for (member, score) in z.iter() {
                            *acc.entry(*member).or_insert(0.0) += *score;
                        }
                    }
                    Some(e) => return Err(wrong_type(src, &e.value, "zset")),
                }
            }
            let n = acc.len();
            if n == 0 {
                m.remove(dest);
            } else {
                m.insert(dest.to_string(), Entry::new(Value::ZSet(acc), ttl, now));
            }
            debug!(dest, sources = sources.len(), members = n, "zunion_store");
            Ok(n)
        })
    }

    async fn save(&self) -> Result<()> {
        let path = self.dump_path.clone().ok_or_else(|| anyhow!("cache has no dump path configured"))?;
        let started = std::time::Instant::now();
        let dump = self.with_map(|m, now| {
            let entries: BTreeMap<String, Entry> =
                m.iter().filter(|(_, e)| !e.expired(now)).map(|(k, e)| (k.clone(), e.clone())).collect();
            Ok(Dump { saved_at_ms: now, entries })
        })?;
        let keys = dump.entries.len();
        let bytes = serde_json::to_vec(&dump).context("encoding cache dump")?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &bytes).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &path).with_context(|| format!("renaming {} to {}", tmp.display(), path.display()))?;
        histogram!("cache_save_ms", started.elapsed().as_secs_f64() * 1000.0);
        gauge!("cache_keys", keys as f64);
        info!(path = %path.display(), keys, bytes = bytes.len(), "cache flushed to disk");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dump() -> PathBuf {
        let f = format!(
            "hotrank-cache-test-{}.json",
            std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos()
        );
        std::env::temp_dir().join(f)
    }

    #[tokio::test]
    async fn conditional_set_and_owner_delete() {
        let c = MemCache::new();
        assert!(c.set_nx("lock:item:1", "a", Duration::from_secs(10)).await.unwrap());
        assert!(!c.set_nx("lock:item:1", "b", Duration::from_secs(10)).await.unwrap());
        assert!(!c.del_if_eq("lock:item:1", "b").await.unwrap());
        assert!(c.del_if_eq("lock:item:1", "a").await.unwrap());
        assert_eq!(c.get("lock:item:1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expired_keys_disappear() {
        let c = MemCache::new();
        c.set("k", "v", Some(Duration::from_millis(20))).await.unwrap();
        assert_eq!(c.get("k").await.unwrap().as_deref(), Some("v"));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(c.get("k").await.unwrap(), None);
        // An expired lock can be taken over.
        assert!(c.set_nx("k", "w", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn hincr_only_touches_existing_hash() {
        let c = MemCache::new();
        assert_eq!(c.hincr_by("item:1", "views", 1).await.unwrap(), None);
        let mut f = Fields::new();
        f.insert("views".into(), "4".into());
        c.hset_all("item:1", &f, None).await.unwrap();
        assert_eq!(c.hincr_by("item:1", "views", 1).await.unwrap(), Some(5));
        assert_eq!(c.hincr_by("item:1", "supports", -1).await.unwrap(), Some(-1));
    }

    #[tokio::test]
    async fn srem_reports_presence() {
        let c = MemCache::new();
        assert!(c.sadd("user:1:support", 7).await.unwrap());
        assert!(!c.sadd("user:1:support", 7).await.unwrap());
        assert!(c.srem("user:1:support", 7).await.unwrap());
        assert!(!c.srem("user:1:support", 7).await.unwrap());
        assert!(c.smembers("user:1:support").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn wrong_type_is_an_error() {
        let c = MemCache::new();
        c.set("s", "x", None).await.unwrap();
        assert!(c.zadd("s", 1, 1.0).await.is_err());
        assert!(c.hgetall("s").await.is_err());
    }

    #[tokio::test]
    async fn offline_cache_fails_every_call() {
        let c = MemCache::new();
        c.set_offline(true);
        assert!(c.get("a").await.is_err());
        assert!(c.zadd("z", 1, 1.0).await.is_err());
        c.set_offline(false);
        assert!(c.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dump_survives_reopen() {
        let path = temp_dump();
        {
            let c = MemCache::open(&path).unwrap();
            c.zadd("hot:1h:2024030913", 42, 1.25).await.unwrap();
            c.sadd("user:3:favorite", 42).await.unwrap();
            c.set("gone", "x", Some(Duration::from_millis(1))).await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
            c.save().await.unwrap();
        }
        let c = MemCache::open(&path).unwrap();
        assert_eq!(c.zscore("hot:1h:2024030913", 42).await.unwrap(), Some(1.25));
        assert!(c.sismember("user:3:favorite", 42).await.unwrap());
        assert_eq!(c.get("gone").await.unwrap(), None);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn save_without_path_is_rejected() {
        assert!(MemCache::new().save().await.is_err());
    }
}
