//! Consecutive decode failure tracking per connection

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, warn};

/// Failure run of one connection
#[derive(Debug, Clone, Copy)]
struct FailureRun {
    count: u32,
    last_failure: DateTime<Utc>,
}

/// Counts consecutive decode failures per connection key.
///
/// Any successful decode resets the count, so only an unbroken run of
/// malformed records escalates. Runs of connections that went quiet are
/// dropped by [`DecodeFailureTracker::prune_stale_at`].
#[derive(Debug)]
pub struct DecodeFailureTracker {
    failures: DashMap<String, FailureRun>,
    threshold: u32,
}

impl DecodeFailureTracker {
    /// Create a tracker escalating at `threshold` consecutive failures.
    /// A threshold of `0` never escalates.
    pub fn new(threshold: u32) -> Self {
        Self {
            failures: DashMap::new(),
            threshold,
        }
    }

    /// Escalation threshold
    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Record a failure. Returns the current run length and whether the
    /// threshold was reached.
    ///
    /// Nothing is tracked when escalation is disabled.
    pub fn record_failure(&self, connection_key: &str) -> (u32, bool) {
        self.record_failure_at(connection_key, Utc::now())
    }

    /// Record a failure observed at `now`
    pub fn record_failure_at(&self, connection_key: &str, now: DateTime<Utc>) -> (u32, bool) {
        if self.threshold == 0 {
            return (0, false);
        }

        let count = {
            let mut run = self
                .failures
                .entry(connection_key.to_string())
                .or_insert(FailureRun {
                    count: 0,
                    last_failure: now,
                });
            run.count = run.count.saturating_add(1);
            run.last_failure = now;
            run.count
        };

        let exceeded = count >= self.threshold;
        if exceeded {
            warn!(
                "Connection {} reached {} consecutive decode failures",
                connection_key, count
            );
        } else {
            debug!(
                "Recorded decode failure for {} (count: {})",
                connection_key, count
            );
        }
        (count, exceeded)
    }

    /// Record a success, clearing the run. Returns whether a run was cleared.
    pub fn record_success(&self, connection_key: &str) -> bool {
        self.failures.remove(connection_key).is_some()
    }

    /// Current run length
    pub fn failure_count(&self, connection_key: &str) -> u32 {
        self.failures
            .get(connection_key)
            .map(|entry| entry.value().count)
            .unwrap_or(0)
    }

    /// Forget a connection
    pub fn clear(&self, connection_key: &str) {
        self.failures.remove(connection_key);
    }

    /// Number of connections with an open failure run
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    /// Whether no connection has an open failure run
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Drop runs whose last failure is older than `max_age_secs`.
    /// Returns how many were dropped.
    pub fn prune_stale_at(&self, max_age_secs: u64, now: DateTime<Utc>) -> usize {
        let max_age_ms = i64::try_from(max_age_secs)
            .unwrap_or(i64::MAX)
            .saturating_mul(1000);
        let before = self.failures.len();
        self.failures.retain(|_, run| {
            run.last_failure
                .timestamp_millis()
                .saturating_add(max_age_ms)
                >= now.timestamp_millis()
        });
        let pruned = before.saturating_sub(self.failures.len());
        if pruned > 0 {
            debug!("Dropped {} stale decode failure runs", pruned);
        }
        pruned
    }
}
