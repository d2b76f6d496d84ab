//! Window merges: hour buckets roll up into day buckets and into the working structures
//! the refresher reads. Merges are sums, so an item's merged score is the total of its
//! per-bucket scores.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use hotrank_cache::Cache;
use hotrank_core::keys::{
    day_key, hour_key, hour_keys_of_day, hour_keys_of_day_so_far, past_day_keys, past_hour_keys, DAY_MS,
    DAY_WINDOW_TTL, TODAY_WORKING_KEY, WEEK_KEY, WORKING_SLACK,
};
use hotrank_core::{ItemId, Period};
use metrics::histogram;
use tracing::debug;

#[derive(Clone)]
pub struct WindowAggregator {
    cache: Arc<dyn Cache>,
}

impl WindowAggregator {
    pub fn new(cache: Arc<dyn Cache>) -> Self { Self { cache } }

    /// Union of the current hour and the given past hours into `target`.
    pub async fn merge_hour(&self, target: &str, current: &str, past: &[String], ttl: Duration) -> Result<usize> {
        let mut sources = Vec::with_capacity(past.len() + 1);
        sources.push(current.to_string());
        sources.extend_from_slice(past);
        self.merge(target, &sources, ttl).await
    }

    /// Roll a completed day's hour buckets into its day bucket.
    pub async fn merge_day(&self, day: &str, hours: &[String]) -> Result<usize> {
        self.merge(day, hours, DAY_WINDOW_TTL).await
    }

    /// Today's working structure plus the past day buckets into the week structure.
    pub async fn merge_week(&self, week: &str, today: &str, past_days: &[String]) -> Result<usize> {
        let mut sources = Vec::with_capacity(past_days.len() + 1);
        sources.push(today.to_string());
        sources.extend_from_slice(past_days);
        self.merge(week, &sources, Period::Week.resolution() + WORKING_SLACK).await
    }

    async fn merge(&self, target: &str, sources: &[String], ttl: Duration) -> Result<usize> {
        let started = std::time::Instant::now();
        let n = self.cache.zunion_store(target, sources, Some(ttl)).await?;
        histogram!("window_merge_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(key = target, sources = sources.len(), members = n, "window merged");
        Ok(n)
    }

    /// Rebuild the working structure of `period` as of `now_ms`.
    pub async fn merge_for(&self, period: Period, now_ms: i64) -> Result<usize> {
        let current = hour_key(now_ms);
        match period {
            Period::Hour | Period::Day => {
                let lookback = if period == Period::Hour { 1 } else { 24 };
                let past = past_hour_keys(now_ms, lookback);
                self.merge_hour(&period.working_key(), &current, &past, period.resolution() + WORKING_SLACK).await
            }
            Period::Week => {
                let mut earlier = hour_keys_of_day_so_far(now_ms);
                earlier.pop();
                self.merge_hour(TODAY_WORKING_KEY, &current, &earlier, Duration::from_secs(24 * 3600) + WORKING_SLACK)
                    .await?;
                self.merge_week(WEEK_KEY, TODAY_WORKING_KEY, &past_day_keys(now_ms, 7)).await
            }
        }
    }

    /// Roll up the day before the one containing `now_ms`. Runs just after midnight.
    pub async fn merge_previous_day(&self, now_ms: i64) -> Result<usize> {
        let yesterday = now_ms - DAY_MS;
        self.merge_day(&day_key(yesterday), &hour_keys_of_day(yesterday)).await
    }

    /// Top `n` of a merged structure: score descending, then item id ascending.
    pub async fn top(&self, key: &str, n: usize) -> Result<Vec<(ItemId, f64)>> {
        let mut top = self.cache.zrevrange(key, n).await?;
        top.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        Ok(top)
    }
}
