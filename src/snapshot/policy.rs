use tokio::time::{Duration, Instant};

/// When to take a snapshot: after `interval` has passed or after `threshold` entries were applied,
/// whichever comes first, and only if something was applied since the last one.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SnapshotPolicy {
    pub(crate) interval: Duration,
    pub(crate) threshold: u64,
}

impl SnapshotPolicy {
    pub(crate) fn should_snapshot(&self, applied_since_last: u64, last_snapshot_time: Instant, now: Instant) -> bool {
        if applied_since_last == 0 {
            return false;
        }

        applied_since_last >= self.threshold || now.saturating_duration_since(last_snapshot_time) >= self.interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_or_threshold() {
        let policy = SnapshotPolicy {
            interval: Duration::from_secs(20),
            threshold: 100,
        };
        let start = Instant::now();

        // Nothing new, never.
        assert!(!policy.should_snapshot(0, start, start + Duration::from_secs(3600)));

        assert!(!policy.should_snapshot(99, start, start + Duration::from_secs(19)));
        assert!(policy.should_snapshot(100, start, start + Duration::from_secs(1)));
        assert!(policy.should_snapshot(1, start, start + Duration::from_secs(20)));
    }
}
