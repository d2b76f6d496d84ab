//! Time-decayed hotness score.

use crate::{Counters, Metric, Weights};

const MS_PER_HOUR: f64 = 3_600_000.0;

/// Piecewise decay rate by hours elapsed since creation.
pub fn decay_rate(hours_elapsed: f64) -> f64 {
    if hours_elapsed < 1.0 {
        0.0
    } else if hours_elapsed < 24.0 {
        0.05
    } else if hours_elapsed < 72.0 {
        0.10
    } else if hours_elapsed < 120.0 {
        0.15
    } else {
        0.20
    }
}

/// Undecayed weighted engagement.
pub fn base_score(c: &Counters, w: &Weights) -> f64 {
    let views = c.views.max(0) as f64;
    (views + 1.0).ln() * w.of(Metric::Views)
        + (c.supports + c.opposes).max(0) as f64 * w.of(Metric::Supports)
        + c.comments.max(0) as f64 * w.of(Metric::Comments)
        + c.favorites.max(0) as f64 * w.of(Metric::Favorites)
}

/// Hotness of an item with the given counters, created at `created_at_ms`, observed at `now_ms`.
///
/// Pure function of its inputs: recomputing from the same counters always yields the same value.
pub fn hotness(c: &Counters, created_at_ms: i64, now_ms: i64, w: &Weights) -> f64 {
    let hours = (now_ms.saturating_sub(created_at_ms)).max(0) as f64 / MS_PER_HOUR;
    base_score(c, w) * (-decay_rate(hours) * hours).exp()
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: i64 = 3_600_000;

    fn counters(views: i64, supports: i64, opposes: i64) -> Counters {
        Counters { views, supports, opposes, comments: 0, favorites: 0 }
    }

    #[test]
    fn item_created_thirty_hours_ago() {
        let c = counters(9, 3, 1);
        let w = Weights::default();
        let base = base_score(&c, &w);
        assert!((base - 13.4539).abs() < 1e-3, "base={base}");
        let now = 100 * HOUR;
        let s = hotness(&c, now - 30 * HOUR, now, &w);
        assert!((s - 0.6698).abs() < 1e-3, "score={s}");
    }

    #[test]
    fn fresh_items_are_not_decayed() {
        let c = counters(0, 2, 0);
        let w = Weights::default();
        let now = 10 * HOUR;
        assert_eq!(hotness(&c, now - HOUR / 2, now, &w), base_score(&c, &w));
        // Clock skew: a creation time in the future counts as zero elapsed.
        assert_eq!(hotness(&c, now + HOUR, now, &w), base_score(&c, &w));
    }

    #[test]
    fn recomputation_is_deterministic() {
        let c = Counters { views: 120, supports: 7, opposes: 2, comments: 5, favorites: 3 };
        let w = Weights::default();
        let a = hotness(&c, 0, 50 * HOUR, &w);
        let b = hotness(&c, 0, 50 * HOUR, &w);
        assert_eq!(a.to_bits(), b.to_bits());
    }

    #[test]
    fn decay_is_monotonic_within_each_bucket() {
        let c = counters(50, 10, 4);
        let w = Weights::default();
        let buckets = [(1, 24), (24, 72), (72, 120), (120, 400)];
        for (lo, hi) in buckets {
            let mut prev = f64::INFINITY;
            for minutes in (lo * 60..hi * 60).step_by(17) {
                let s = hotness(&c, 0, minutes as i64 * 60_000, &w);
                assert!(s <= prev, "score rose inside bucket [{lo},{hi}) at {minutes}min");
                prev = s;
            }
        }
    }

    #[test]
    fn rate_boundaries() {
        assert_eq!(decay_rate(0.99), 0.0);
        assert_eq!(decay_rate(1.0), 0.05);
        assert_eq!(decay_rate(23.9), 0.05);
        assert_eq!(decay_rate(24.0), 0.10);
        assert_eq!(decay_rate(71.9), 0.10);
        assert_eq!(decay_rate(72.0), 0.15);
        assert_eq!(decay_rate(120.0), 0.20);
    }
}
