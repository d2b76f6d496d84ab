//! Engine tunables. Defaults match production; every field can be overridden from
//! `HOTRANK_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use hotrank_core::{Period, Weights};
use rand::Rng;
use tracing::warn;

/// Read-through loader and cache write policy.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Lock rounds before a lookup degrades to a miss.
    pub attempts: u32,
    pub lock_wait: Duration,
    pub lock_lease: Duration,
    /// Pause between lock rounds.
    pub retry_backoff: Duration,
    /// Item TTL is drawn uniformly from `[ttl_min, ttl_max)`.
    pub ttl_min: Duration,
    pub ttl_max: Duration,
    /// Lifetime of the negative-cache sentinel.
    pub null_ttl: Duration,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            attempts: 2,
            lock_wait: Duration::from_millis(50),
            lock_lease: Duration::from_secs(10),
            retry_backoff: Duration::from_millis(30),
            ttl_min: Duration::from_secs(120 * 60),
            ttl_max: Duration::from_secs(300 * 60),
            null_ttl: Duration::from_secs(120),
        }
    }
}

impl LoaderConfig {
    /// Jittered TTL for a freshly cached item.
    pub fn item_ttl(&self) -> Duration {
        let lo = self.ttl_min.as_secs();
        let hi = self.ttl_max.as_secs();
        if hi <= lo {
            return self.ttl_min;
        }
        Duration::from_secs(rand::thread_rng().gen_range(lo..hi))
    }
}

/// When a scheduled job fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    Every { initial_delay: Duration, period: Duration },
    /// Once per UTC day, at this offset from midnight.
    DailyAt(Duration),
}

#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub hour_refresh: Cadence,
    pub day_refresh: Cadence,
    pub week_refresh: Cadence,
    pub metadata_reload: Cadence,
    pub day_merge: Cadence,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        let every = |initial: u64, period: u64| Cadence::Every {
            initial_delay: Duration::from_secs(initial),
            period: Duration::from_secs(period),
        };
        Self {
            hour_refresh: every(120, 180),
            day_refresh: every(300, 600),
            week_refresh: every(600, 1800),
            metadata_reload: Cadence::DailyAt(Duration::ZERO),
            day_merge: Cadence::DailyAt(Duration::from_secs(30)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// General worker pool size (event processing, reconciliation, warming, refresh loads).
    pub workers: usize,
    /// Timer pool size for scheduled jobs.
    pub timer_workers: usize,
    /// Capacity of the ingest channel.
    pub ingest_queue: usize,
    pub top_n: usize,
    /// Cold-start floor for the hour window.
    pub backfill_target: usize,
    /// Idle gate per period: a refresh is skipped when the last event is older than this.
    pub fresh_hour: Duration,
    pub fresh_day: Duration,
    pub fresh_week: Duration,
    pub drain_timeout: Duration,
    pub weights: Weights,
    pub loader: LoaderConfig,
    pub schedule: ScheduleConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            timer_workers: 2,
            ingest_queue: 4096,
            top_n: 10,
            backfill_target: 10,
            fresh_hour: Duration::from_secs(270),
            fresh_day: Duration::from_secs(750),
            fresh_week: Duration::from_secs(2100),
            drain_timeout: Duration::from_secs(10),
            weights: Weights::default(),
            loader: LoaderConfig::default(),
            schedule: ScheduleConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn freshness(&self, period: Period) -> Duration {
        match period {
            Period::Hour => self.fresh_hour,
            Period::Day => self.fresh_day,
            Period::Week => self.fresh_week,
        }
    }

    /// Defaults overridden by whatever `HOTRANK_*` variables are set. Unparsable values are
    /// ignored with a warning.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = env_parse::<usize>("HOTRANK_WORKERS") { cfg.workers = v.max(1); }
        if let Some(v) = env_parse::<usize>("HOTRANK_TIMER_WORKERS") { cfg.timer_workers = v.max(1); }
        if let Some(v) = env_parse::<usize>("HOTRANK_QUEUE_CAP") { cfg.ingest_queue = v.max(1); }
        if let Some(v) = env_parse::<usize>("HOTRANK_TOP_N") { cfg.top_n = v; }
        if let Some(v) = env_parse::<usize>("HOTRANK_BACKFILL_TARGET") { cfg.backfill_target = v; }
        if let Some(v) = env_secs("HOTRANK_FRESH_1H_SECS") { cfg.fresh_hour = v; }
        if let Some(v) = env_secs("HOTRANK_FRESH_24H_SECS") { cfg.fresh_day = v; }
        if let Some(v) = env_secs("HOTRANK_FRESH_7D_SECS") { cfg.fresh_week = v; }
        if let Some(v) = env_secs("HOTRANK_DRAIN_TIMEOUT_SECS") { cfg.drain_timeout = v; }

        let l = &mut cfg.loader;
        if let Some(v) = env_parse::<u32>("HOTRANK_LOAD_ATTEMPTS") { l.attempts = v.max(1); }
        if let Some(v) = env_millis("HOTRANK_LOCK_WAIT_MS") { l.lock_wait = v; }
        if let Some(v) = env_millis("HOTRANK_LOCK_LEASE_MS") { l.lock_lease = v; }
        if let Some(v) = env_millis("HOTRANK_RETRY_BACKOFF_MS") { l.retry_backoff = v; }
        if let Some(v) = env_secs("HOTRANK_NULL_TTL_SECS") { l.null_ttl = v; }

        let s = &mut cfg.schedule;
        if let Some(v) = env_secs("HOTRANK_REFRESH_1H_SECS") { s.hour_refresh = with_period(s.hour_refresh, v); }
        if let Some(v) = env_secs("HOTRANK_REFRESH_24H_SECS") { s.day_refresh = with_period(s.day_refresh, v); }
        if let Some(v) = env_secs("HOTRANK_REFRESH_7D_SECS") { s.week_refresh = with_period(s.week_refresh, v); }
        cfg
    }
}

fn with_period(c: Cadence, period: Duration) -> Cadence {
    match c {
        Cadence::Every { initial_delay, .. } => Cadence::Every { initial_delay, period },
        daily => daily,
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(var = name, value = %raw, "ignoring unparsable setting");
            None
        }
    }
}

fn env_secs(name: &str) -> Option<Duration> { env_parse::<u64>(name).map(Duration::from_secs) }
fn env_millis(name: &str) -> Option<Duration> { env_parse::<u64>(name).map(Duration::from_millis) }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_ttl_stays_in_jitter_band() {
        let l = LoaderConfig::default();
        for _ in 0..200 {
            let ttl = l.item_ttl();
            assert!(ttl >= Duration::from_secs(7200) && ttl < Duration::from_secs(18000), "{:?}", ttl);
        }
    }

    #[test]
    fn degenerate_band_uses_min() {
        let l = LoaderConfig { ttl_min: Duration::from_secs(60), ttl_max: Duration::from_secs(60), ..Default::default() };
        assert_eq!(l.item_ttl(), Duration::from_secs(60));
    }

    #[test]
    fn env_overrides_apply() {
        std::env::set_var("HOTRANK_TOP_N", "25");
        std::env::set_var("HOTRANK_LOCK_WAIT_MS", "not-a-number");
        std::env::set_var("HOTRANK_REFRESH_1H_SECS", "60");
        let cfg = EngineConfig::from_env();
        std::env::remove_var("HOTRANK_TOP_N");
        std::env::remove_var("HOTRANK_LOCK_WAIT_MS");
        std::env::remove_var("HOTRANK_REFRESH_1H_SECS");
        assert_eq!(cfg.top_n, 25);
        assert_eq!(cfg.loader.lock_wait, Duration::from_millis(50));
        assert_eq!(
            cfg.schedule.hour_refresh,
            Cadence::Every { initial_delay: Duration::from_secs(120), period: Duration::from_secs(60) }
        );
        assert_eq!(cfg.freshness(Period::Week), Duration::from_secs(2100));
    }
}
