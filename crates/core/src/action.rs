//! Action kinds, the counter they move and the weight table used by scoring.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Counter field of an item.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Metric {
    Views,
    Supports,
    Opposes,
    Comments,
    Favorites,
}

impl Metric {
    pub const ALL: [Metric; 5] = [Metric::Views, Metric::Supports, Metric::Opposes, Metric::Comments, Metric::Favorites];

    /// Field name inside the cached item hash and the `items` table column.
    pub const fn field(self) -> &'static str {
        match self {
            Metric::Views => "views",
            Metric::Supports => "supports",
            Metric::Opposes => "opposes",
            Metric::Comments => "comments",
            Metric::Favorites => "favorites",
        }
    }

    const fn index(self) -> usize {
        match self {
            Metric::Views => 0,
            Metric::Supports => 1,
            Metric::Opposes => 2,
            Metric::Comments => 3,
            Metric::Favorites => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    View,
    Support,
    Oppose,
    Comment,
    Favorite,
    UnView,
    UnSupport,
    UnOppose,
    UnComment,
    UnFavorite,
}

impl ActionKind {
    pub const ALL: [ActionKind; 10] = [
        ActionKind::View,
        ActionKind::Support,
        ActionKind::Oppose,
        ActionKind::Comment,
        ActionKind::Favorite,
        ActionKind::UnView,
        ActionKind::UnSupport,
        ActionKind::UnOppose,
        ActionKind::UnComment,
        ActionKind::UnFavorite,
    ];

    /// Primary kind with the cancellation stripped.
    pub const fn base(self) -> ActionKind {
        match self {
            ActionKind::View | ActionKind::UnView => ActionKind::View,
            ActionKind::Support | ActionKind::UnSupport => ActionKind::Support,
            ActionKind::Oppose | ActionKind::UnOppose => ActionKind::Oppose,
            ActionKind::Comment | ActionKind::UnComment => ActionKind::Comment,
            ActionKind::Favorite | ActionKind::UnFavorite => ActionKind::Favorite,
        }
    }

    pub const fn is_cancel(self) -> bool {
        matches!(
            self,
            ActionKind::UnView | ActionKind::UnSupport | ActionKind::UnOppose | ActionKind::UnComment | ActionKind::UnFavorite
        )
    }

    /// Counter delta: +1 for a primary action, -1 for its cancellation.
    pub const fn delta(self) -> i64 {
        if self.is_cancel() { -1 } else { 1 }
    }

    pub const fn metric(self) -> Metric {
        match self.base() {
            ActionKind::View => Metric::Views,
            ActionKind::Support => Metric::Supports,
            ActionKind::Oppose => Metric::Opposes,
            ActionKind::Comment => Metric::Comments,
            _ => Metric::Favorites,
        }
    }

    /// Whether per-actor membership is kept for this kind (support, oppose, favorite).
    pub const fn is_tracked(self) -> bool {
        matches!(self.base(), ActionKind::Support | ActionKind::Oppose | ActionKind::Favorite)
    }

    /// The mutually exclusive counterpart of SUPPORT / OPPOSE.
    pub const fn exclusive_with(self) -> Option<ActionKind> {
        match self {
            ActionKind::Support => Some(ActionKind::Oppose),
            ActionKind::Oppose => Some(ActionKind::Support),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            ActionKind::View => "VIEW",
            ActionKind::Support => "SUPPORT",
            ActionKind::Oppose => "OPPOSE",
            ActionKind::Comment => "COMMENT",
            ActionKind::Favorite => "FAVORITE",
            ActionKind::UnView => "UN_VIEW",
            ActionKind::UnSupport => "UN_SUPPORT",
            ActionKind::UnOppose => "UN_OPPOSE",
            ActionKind::UnComment => "UN_COMMENT",
            ActionKind::UnFavorite => "UN_FAVORITE",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown action kind: {0}")]
pub struct ParseActionError(pub String);

impl FromStr for ActionKind {
    type Err = ParseActionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm = s.trim().to_ascii_uppercase().replace('-', "_");
        ActionKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == norm || k.as_str().replace('_', "") == norm)
            .ok_or_else(|| ParseActionError(s.to_string()))
    }
}

/// Default weight table indexed by `Metric`. Supports and opposes share a weight.
const DEFAULT_WEIGHTS: [f64; 5] = [1.5, 2.5, 2.5, 3.0, 4.0];

/// Scoring weights; a fixed parameter table, overridable for deployments.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Weights {
    table: [f64; 5],
}

impl Default for Weights {
    fn default() -> Self {
        Self { table: DEFAULT_WEIGHTS }
    }
}

impl Weights {
    /// Build a table; `engagement` applies to both supports and opposes.
    pub fn new(view: f64, engagement: f64, comment: f64, favorite: f64) -> Self {
        Self { table: [view, engagement, engagement, comment, favorite] }
    }

    pub fn of(&self, metric: Metric) -> f64 {
        self.table[metric.index()]
    }

    /// Weight carried by an action kind (its cancellation carries the same weight).
    pub fn for_action(&self, kind: ActionKind) -> f64 {
        self.of(kind.metric())
    }
}
