//! Async status watch types.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A registered poll of an external resource on behalf of a paused instance.
///
/// Keyed by instance: an instance waits on at most one resource at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncWatch {
    pub instance_id: Uuid,
    pub resource_id: String,
    pub next_poll_at: DateTime<Utc>,
    /// Number of polls that came back unchanged.
    pub attempt: u32,
    pub backoff_base_secs: u64,
    pub max_interval_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl AsyncWatch {
    /// Register a new watch; the first poll is one base interval out.
    pub fn new(
        instance_id: Uuid,
        resource_id: impl Into<String>,
        backoff_base_secs: u64,
        max_interval_secs: u64,
        now: DateTime<Utc>,
    ) -> Self {
        let mut watch = Self {
            instance_id,
            resource_id: resource_id.into(),
            next_poll_at: now,
            attempt: 0,
            backoff_base_secs,
            max_interval_secs,
            last_status: None,
            created_at: now,
        };
        watch.next_poll_at = now + watch.interval();
        watch
    }

    /// Interval for the current attempt: `base * 2^attempt`, capped at the maximum.
    pub fn interval(&self) -> Duration {
        backoff_interval(self.backoff_base_secs, self.attempt, self.max_interval_secs)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_poll_at <= now
    }

    /// Record an unchanged poll: bump the attempt and push `next_poll_at` out.
    pub fn reschedule(&mut self, now: DateTime<Utc>, status: Option<Value>) {
        self.attempt = self.attempt.saturating_add(1);
        self.last_status = status;
        self.next_poll_at = now + self.interval();
    }
}

/// `min(base * 2^attempt, max)` in whole seconds, without overflow.
pub fn backoff_interval(base_secs: u64, attempt: u32, max_secs: u64) -> Duration {
    let factor = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
    let secs = base_secs.saturating_mul(factor).min(max_secs);
    Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_then_caps() {
        let secs: Vec<i64> = (0..9)
            .map(|a| backoff_interval(2, a, 300).num_seconds())
            .collect();
        assert_eq!(secs, vec![2, 4, 8, 16, 32, 64, 128, 256, 300]);
    }

    #[test]
    fn test_backoff_huge_attempt_saturates() {
        assert_eq!(backoff_interval(2, 200, 300).num_seconds(), 300);
    }

    #[test]
    fn test_new_watch_first_poll_after_base() {
        let now = Utc::now();
        let watch = AsyncWatch::new(Uuid::now_v7(), "SUB-1", 2, 300, now);
        assert_eq!(watch.attempt, 0);
        assert_eq!(watch.next_poll_at, now + Duration::seconds(2));
        assert!(!watch.is_due(now));
        assert!(watch.is_due(now + Duration::seconds(2)));
    }

    #[test]
    fn test_reschedule_sequence() {
        let now = Utc::now();
        let mut watch = AsyncWatch::new(Uuid::now_v7(), "SUB-1", 2, 300, now);
        let mut gaps = Vec::new();
        let mut t = watch.next_poll_at;
        for _ in 0..4 {
            watch.reschedule(t, None);
            gaps.push((watch.next_poll_at - t).num_seconds());
            t = watch.next_poll_at;
        }
        assert_eq!(gaps, vec![4, 8, 16, 32]);
        assert_eq!(watch.attempt, 4);
    }
}
