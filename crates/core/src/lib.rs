//! hotrank core types: items, action events, hotness scoring and the cache key schema.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

pub mod action;
pub mod clock;
pub mod keys;
pub mod score;

pub use action::{ActionKind, Metric, ParseActionError, Weights};
pub use clock::{Clock, ManualClock, SystemClock};
pub use keys::Period;
pub use score::{decay_rate, hotness};

pub type ItemId = i64;
pub type ActorId = i64;
pub type CategoryId = i64;

/// Actor id used for events synthesized by the engine itself (cold-start backfill).
pub const SYSTEM_ACTOR: ActorId = 0;

/// The five engagement counters of an item.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Counters {
    pub views: i64,
    pub supports: i64,
    pub opposes: i64,
    pub comments: i64,
    pub favorites: i64,
}

impl Counters {
    pub fn get(&self, metric: Metric) -> i64 {
        match metric {
            Metric::Views => self.views,
            Metric::Supports => self.supports,
            Metric::Opposes => self.opposes,
            Metric::Comments => self.comments,
            Metric::Favorites => self.favorites,
        }
    }

    pub fn set(&mut self, metric: Metric, value: i64) {
        let slot = match metric {
            Metric::Views => &mut self.views,
            Metric::Supports => &mut self.supports,
            Metric::Opposes => &mut self.opposes,
            Metric::Comments => &mut self.comments,
            Metric::Favorites => &mut self.favorites,
        };
        *slot = value.max(0);
    }
}

/// A ranked entity (a news article).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Item {
    pub id: ItemId,
    pub title: String,
    pub content: String,
    pub category_id: Option<CategoryId>,
    pub counters: Counters,
    /// Bumped by exactly one per successful reconciliation against the system-of-record.
    pub version: i64,
    /// Epoch millis.
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Category {
    pub id: CategoryId,
    pub name: String,
}

/// Immutable user-action fact as delivered by the event bus.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ActionEvent {
    pub item_id: ItemId,
    pub actor_id: ActorId,
    pub action: ActionKind,
    pub timestamp_millis: i64,
}

impl ActionEvent {
    pub fn new(item_id: ItemId, actor_id: ActorId, action: ActionKind, timestamp_millis: i64) -> Self {
        Self { item_id, actor_id, action, timestamp_millis }
    }
}

pub mod prelude {
    pub use super::{
        ActionEvent, ActionKind, ActorId, Category, CategoryId, Clock, Counters, Item, ItemId, Metric, Period,
        Weights,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_wire_format_uses_camel_case() {
        let raw = r#"{"itemId":42,"actorId":7,"action":"UN_SUPPORT","timestampMillis":1700000000000}"#;
        let ev: ActionEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(ev, ActionEvent::new(42, 7, ActionKind::UnSupport, 1_700_000_000_000));
    }

    #[test]
    fn unknown_action_is_rejected_at_decode() {
        let raw = r#"{"itemId":1,"actorId":1,"action":"SHARE","timestampMillis":0}"#;
        assert!(serde_json::from_str::<ActionEvent>(raw).is_err());
    }

    #[test]
    fn counters_never_go_negative() {
        let mut c = Counters::default();
        c.set(Metric::Opposes, -3);
        assert_eq!(c.opposes, 0);
        c.set(Metric::Views, 12);
        assert_eq!(c.get(Metric::Views), 12);
    }
}
