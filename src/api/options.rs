use std::convert::TryFrom;
use tokio::time::Duration;

#[derive(Clone, Default)]
pub struct RaftOptions {
    pub leader_heartbeat_duration: Option<Duration>,
    pub follower_min_timeout: Option<Duration>,
    pub follower_max_timeout: Option<Duration>,
    pub leader_append_entries_timeout: Option<Duration>,
    pub max_entries_per_append: Option<usize>,
    /// How long `set()` and membership changes wait for commit and apply.
    pub propose_timeout: Option<Duration>,
    pub snapshot_interval: Option<Duration>,
    /// Applied entries since the last snapshot that force a new one.
    pub snapshot_threshold: Option<u64>,
}

pub(crate) struct RaftOptionsValidated {
    pub leader_heartbeat_duration: Duration,
    pub follower_min_timeout: Duration,
    pub follower_max_timeout: Duration,
    pub leader_append_entries_timeout: Duration,
    pub max_entries_per_append: usize,
    pub propose_timeout: Duration,
    pub snapshot_interval: Duration,
    pub snapshot_threshold: u64,
}

impl RaftOptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.leader_heartbeat_duration >= self.follower_min_timeout {
            return Err("Follower minimum timeout must be greater than leader's heartbeat");
        }
        if self.follower_min_timeout >= self.follower_max_timeout {
            return Err("Follower minimum timeout must be less than maximum timeout");
        }
        if self.leader_append_entries_timeout >= self.follower_min_timeout {
            return Err("Leader's AppendEntries RPC timeout must be less than the follower's heartbeat timeout");
        }
        if self.max_entries_per_append == 0 {
            return Err("Max entries per AppendEntries must be positive");
        }
        if self.snapshot_threshold == 0 {
            return Err("Snapshot threshold must be positive");
        }

        Ok(())
    }
}

impl TryFrom<RaftOptions> for RaftOptionsValidated {
    type Error = &'static str;

    fn try_from(options: RaftOptions) -> Result<Self, Self::Error> {
        let values = RaftOptionsValidated {
            leader_heartbeat_duration: options.leader_heartbeat_duration.unwrap_or(Duration::from_millis(100)),
            follower_min_timeout: options.follower_min_timeout.unwrap_or(Duration::from_millis(500)),
            follower_max_timeout: options.follower_max_timeout.unwrap_or(Duration::from_millis(1500)),
            leader_append_entries_timeout: options
                .leader_append_entries_timeout
                .unwrap_or(Duration::from_millis(300)),
            max_entries_per_append: options.max_entries_per_append.unwrap_or(64),
            propose_timeout: options.propose_timeout.unwrap_or(Duration::from_secs(5)),
            snapshot_interval: options.snapshot_interval.unwrap_or(Duration::from_secs(20)),
            snapshot_threshold: options.snapshot_threshold.unwrap_or(1024),
        };

        values.validate()?;
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let validated = RaftOptionsValidated::try_from(RaftOptions::default()).unwrap();
        assert_eq!(validated.leader_heartbeat_duration, Duration::from_millis(100));
        assert_eq!(validated.max_entries_per_append, 64);
        assert_eq!(validated.snapshot_threshold, 1024);
    }

    #[test]
    fn heartbeat_must_be_shorter_than_follower_timeout() {
        let options = RaftOptions {
            leader_heartbeat_duration: Some(Duration::from_millis(600)),
            ..RaftOptions::default()
        };
        assert!(RaftOptionsValidated::try_from(options).is_err());
    }

    #[test]
    fn zero_snapshot_threshold_is_rejected() {
        let options = RaftOptions {
            snapshot_threshold: Some(0),
            ..RaftOptions::default()
        };
        assert_eq!(
            RaftOptionsValidated::try_from(options).err(),
            Some("Snapshot threshold must be positive")
        );
    }
}
