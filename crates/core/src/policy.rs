//! Retry policy configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-work-type retry configuration.
///
/// Resolved by the registry through an explicit lookup keyed on the work
/// type name; a type without an entry gets `RetryPolicy::default()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum attempts before the record is exhausted.
    pub try_limit: u32,
    /// How long after `schedule_at` the record stays eligible at all.
    pub expire_after: Duration,
    /// Explicit per-attempt backoff intervals. Empty means the default
    /// bucket policy applies.
    pub backoff_intervals: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            // One attempt roughly every few minutes for a day.
            try_limit: 200,
            expire_after: Duration::from_secs(60 * 60 * 24),
            backoff_intervals: Vec::new(),
        }
    }
}

impl RetryPolicy {
    pub fn new(try_limit: u32, expire_after: Duration) -> Self {
        Self {
            try_limit,
            expire_after,
            ..Default::default()
        }
    }

    pub fn with_intervals(mut self, intervals: Vec<Duration>) -> Self {
        self.backoff_intervals = intervals;
        self
    }

    /// Backoff interval to apply after attempt number `tried_count`
    /// (1-indexed, i.e. the count *including* the attempt that just ran).
    ///
    /// With explicit intervals the list is indexed by `tried_count - 1`,
    /// clamped to the last entry. Otherwise the coarse default buckets
    /// apply: attempts 1-10 wait 1 minute, 11-20 wait 5 minutes, later
    /// attempts wait 10 minutes.
    pub fn next_interval(&self, tried_count: u32) -> Duration {
        if self.backoff_intervals.is_empty() {
            return match tried_count {
                0..=10 => Duration::from_secs(60),
                11..=20 => Duration::from_secs(5 * 60),
                _ => Duration::from_secs(10 * 60),
            };
        }
        let last = self.backoff_intervals.len() - 1;
        let index = (tried_count.saturating_sub(1) as usize).min(last);
        self.backoff_intervals[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn default_buckets() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.next_interval(1), Duration::from_secs(60));
        assert_eq!(policy.next_interval(10), Duration::from_secs(60));
        assert_eq!(policy.next_interval(11), Duration::from_secs(300));
        assert_eq!(policy.next_interval(20), Duration::from_secs(300));
        assert_eq!(policy.next_interval(21), Duration::from_secs(600));
        assert_eq!(policy.next_interval(1000), Duration::from_secs(600));
    }

    #[test]
    fn explicit_intervals_clamp_to_last() {
        let policy = RetryPolicy::default().with_intervals(vec![
            Duration::from_secs(5),
            Duration::from_secs(30),
        ]);

        assert_eq!(policy.next_interval(1), Duration::from_secs(5));
        assert_eq!(policy.next_interval(2), Duration::from_secs(30));
        assert_eq!(policy.next_interval(3), Duration::from_secs(30));
        assert_eq!(policy.next_interval(99), Duration::from_secs(30));
    }

    #[test]
    fn zero_tried_count_uses_first_entry() {
        let policy =
            RetryPolicy::default().with_intervals(vec![Duration::from_secs(7)]);
        assert_eq!(policy.next_interval(0), Duration::from_secs(7));
    }

    proptest! {
        #[test]
        fn default_backoff_is_monotone(a in 0u32..1000, b in 0u32..1000) {
            let policy = RetryPolicy::default();
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(policy.next_interval(lo) <= policy.next_interval(hi));
        }
    }
}
