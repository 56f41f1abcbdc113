//! Scheduled re-key policy.
//!
//! Rotation itself lives in the store; this module only answers "is it
//! time yet". The default interval is fourteen days from the last rotation
//! (store creation counts as a rotation).

use chrono::{DateTime, Duration, Utc};

pub const DEFAULT_ROTATION_INTERVAL_DAYS: i64 = 14;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationPolicy {
    pub interval: Duration,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::days(DEFAULT_ROTATION_INTERVAL_DAYS),
        }
    }
}

impl RotationPolicy {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Whether the interval has elapsed since `rotated_at`. Clock skew into
    /// the past never makes rotation due early.
    pub fn is_due(&self, rotated_at: DateTime<Utc>) -> bool {
        self.is_due_at(rotated_at, Utc::now())
    }

    fn is_due_at(&self, rotated_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(rotated_at) >= self.interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_rotation_is_not_due() {
        let policy = RotationPolicy::default();
        let now = Utc::now();
        assert!(!policy.is_due_at(now, now));
        assert!(!policy.is_due_at(now - Duration::days(13), now));
    }

    #[test]
    fn due_after_interval() {
        let policy = RotationPolicy::default();
        let now = Utc::now();
        assert!(policy.is_due_at(now - Duration::days(14), now));
        assert!(policy.is_due_at(now - Duration::days(90), now));
    }

    #[test]
    fn custom_interval() {
        let policy = RotationPolicy::new(Duration::days(1));
        let now = Utc::now();
        assert!(policy.is_due_at(now - Duration::hours(25), now));
        assert!(!policy.is_due_at(now - Duration::hours(23), now));
    }
}
