//! Cache key schema. Window keys are cut on UTC calendar boundaries.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ActionKind, ActorId, CategoryId, ItemId};

pub const HOUR_MS: i64 = 3_600_000;
pub const DAY_MS: i64 = 24 * HOUR_MS;

/// Hour windows live for a day plus one hour of slack.
pub const HOUR_WINDOW_TTL: Duration = Duration::from_secs(25 * 3600);
/// Day windows outlive the week view by one day.
pub const DAY_WINDOW_TTL: Duration = Duration::from_secs(8 * 24 * 3600);
/// Slack added to a merged working key on top of its resolution.
pub const WORKING_SLACK: Duration = Duration::from_secs(3600);

pub const WEEK_KEY: &str = "hot:7d";
pub const TODAY_WORKING_KEY: &str = "hot:merged:today";
pub const ITEM_RANGE_KEY: &str = "meta:item_range";
pub const LAST_EVENT_KEY: &str = "meta:last_event";

/// Ranking resolution served to readers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Period {
    #[serde(rename = "1h")]
    Hour,
    #[serde(rename = "24h")]
    Day,
    #[serde(rename = "7d")]
    Week,
}

impl Period {
    pub const ALL: [Period; 3] = [Period::Hour, Period::Day, Period::Week];

    pub const fn as_str(self) -> &'static str {
        match self {
            Period::Hour => "1h",
            Period::Day => "24h",
            Period::Week => "7d",
        }
    }

    pub const fn resolution(self) -> Duration {
        match self {
            Period::Hour => Duration::from_secs(3600),
            Period::Day => Duration::from_secs(24 * 3600),
            Period::Week => Duration::from_secs(7 * 24 * 3600),
        }
    }

    /// Merged structure the refresher reads its top-N from.
    pub fn working_key(self) -> String {
        match self {
            Period::Week => WEEK_KEY.to_string(),
            p => format!("hot:merged:{}", p.as_str()),
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Period {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1h" | "hour" => Ok(Period::Hour),
            "24h" | "1d" | "day" => Ok(Period::Day),
            "7d" | "week" => Ok(Period::Week),
            other => Err(format!("unknown period: {} (expect 1h, 24h or 7d)", other)),
        }
    }
}

fn utc(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

pub fn item_key(id: ItemId) -> String {
    format!("item:{}", id)
}

pub fn category_key(id: CategoryId) -> String {
    format!("category:{}", id)
}

pub fn category_items_key(id: CategoryId) -> String {
    format!("category:{}:items", id)
}

/// Per-(actor, action) membership set; cancellations share the base kind's set.
pub fn membership_key(actor: ActorId, kind: ActionKind) -> String {
    format!("user:{}:{}", actor, kind.base().as_str().to_ascii_lowercase())
}

pub fn item_lock_key(id: ItemId) -> String {
    format!("lock:item:{}", id)
}

pub fn category_lock_key(id: CategoryId) -> String {
    format!("lock:category:{}", id)
}

/// `hot:1h:<yyyyMMddHH>` for the hour containing `ms`.
pub fn hour_key(ms: i64) -> String {
    format!("hot:1h:{}", utc(ms).format("%Y%m%d%H"))
}

/// `hot:1d:<yyyyMMdd>` for the day containing `ms`.
pub fn day_key(ms: i64) -> String {
    format!("hot:1d:{}", utc(ms).format("%Y%m%d"))
}

/// Start of the UTC day containing `ms`.
pub fn day_start(ms: i64) -> i64 {
    ms - ms.rem_euclid(DAY_MS)
}

/// Hour keys for the `n` hours preceding the one containing `now_ms`, most recent first.
pub fn past_hour_keys(now_ms: i64, n: usize) -> Vec<String> {
    (1..=n as i64).map(|i| hour_key(now_ms - i * HOUR_MS)).collect()
}

/// Day keys for the `n` days preceding the one containing `now_ms`, most recent first.
pub fn past_day_keys(now_ms: i64, n: usize) -> Vec<String> {
    (1..=n as i64).map(|i| day_key(now_ms - i * DAY_MS)).collect()
}

/// All 24 hour keys of the day containing `ms`.
pub fn hour_keys_of_day(ms: i64) -> Vec<String> {
    let start = day_start(ms);
    (0..24).map(|h| hour_key(start + h * HOUR_MS)).collect()
}

/// Hour keys of the in-progress day up to and including the current hour.
pub fn hour_keys_of_day_so_far(now_ms: i64) -> Vec<String> {
    let start = day_start(now_ms);
    let hours = (now_ms - start) / HOUR_MS;
    (0..=hours).map(|h| hour_key(start + h * HOUR_MS)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2024-03-09T13:45:00Z
    const T: i64 = 1_709_991_900_000;

    #[test]
    fn window_keys_follow_calendar() {
        assert_eq!(hour_key(T), "hot:1h:2024030913");
        assert_eq!(day_key(T), "hot:1d:20240309");
        assert_eq!(past_hour_keys(T, 2), vec!["hot:1h:2024030912", "hot:1h:2024030911"]);
        assert_eq!(past_day_keys(T, 1), vec!["hot:1d:20240308"]);
    }

    #[test]
    fn day_hours_cover_whole_day() {
        let hours = hour_keys_of_day(T);
        assert_eq!(hours.len(), 24);
        assert_eq!(hours[0], "hot:1h:2024030900");
        assert_eq!(hours[23], "hot:1h:2024030923");
        let so_far = hour_keys_of_day_so_far(T);
        assert_eq!(so_far.len(), 14);
        assert_eq!(so_far.last().map(String::as_str), Some("hot:1h:2024030913"));
    }

    #[test]
    fn membership_normalizes_cancellations() {
        assert_eq!(membership_key(5, ActionKind::UnSupport), "user:5:support");
        assert_eq!(membership_key(5, ActionKind::Favorite), "user:5:favorite");
    }

    #[test]
    fn working_keys() {
        assert_eq!(Period::Hour.working_key(), "hot:merged:1h");
        assert_eq!(Period::Day.working_key(), "hot:merged:24h");
        assert_eq!(Period::Week.working_key(), WEEK_KEY);
        assert_eq!("24h".parse::<Period>().unwrap(), Period::Day);
    }
}
