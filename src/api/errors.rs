use crate::api::types::RaftLeaderInfo;
use crate::replica::EnqueueForReplicationError;
use std::io;

/// Why a write (or membership change) did not take effect.
#[derive(Debug, thiserror::Error)]
pub enum ProposeError {
    #[error("Not leader. Leader hint: {0:?}")]
    NotLeader(Option<RaftLeaderInfo>),

    // Can be retried with exponential backoff with recommended initial delay of 200ms. Likely an
    // election is in progress.
    #[error("No leader is known. An election is probably in progress.")]
    NoLeader,

    /// The entry may or may not commit later. Timeouts don't retract anything.
    #[error("Timed out waiting for the entry to commit and apply")]
    CommitTimeout,

    #[error("Another membership change is in progress, or the change would remove the last voter")]
    MembershipConflict,

    #[error("Committed entry could not be applied: {0}")]
    Serialization(String),

    /// Fatal. The local replica stops participating after this.
    #[error("Local storage failure: {0:?}")]
    StorageIo(io::Error),

    /// The entry was discarded from this node's log before it was seen to commit, most likely
    /// overwritten by a newer leader.
    #[error("Entry was dropped from the log before commit")]
    EntryDropped,

    #[error("Local replica has stopped")]
    ReplicaExited,
}

impl From<EnqueueForReplicationError> for ProposeError {
    fn from(e: EnqueueForReplicationError) -> Self {
        match e {
            EnqueueForReplicationError::LeaderRedirect(leader) => ProposeError::NotLeader(Some(leader.into())),
            EnqueueForReplicationError::NoLeader => ProposeError::NoLeader,
            EnqueueForReplicationError::MembershipChangeInProgress | EnqueueForReplicationError::LastVoter => {
                ProposeError::MembershipConflict
            }
            EnqueueForReplicationError::LocalIoError(e) => ProposeError::StorageIo(e),
            EnqueueForReplicationError::ActorExited => ProposeError::ReplicaExited,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NodeCreationError {
    #[error("Illegal options for configuring node: {0}")]
    IllegalOptions(String),
    #[error("Invalid address '{0}'")]
    InvalidAddress(String),
    #[error("Failed to open storage: {0:?}")]
    StorageInitialization(io::Error),
    /// A stored snapshot or log record failed to decode.
    #[error("Stored state is unreadable: {0:?}")]
    CorruptState(io::Error),
}

impl From<io::Error> for NodeCreationError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::InvalidData {
            NodeCreationError::CorruptState(e)
        } else {
            NodeCreationError::StorageInitialization(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::{LeaderRedirectInfo, ReplicaId};

    #[test]
    fn enqueue_errors_map_to_client_taxonomy() {
        let redirect = EnqueueForReplicationError::LeaderRedirect(LeaderRedirectInfo {
            replica_id: ReplicaId::new("node-2"),
            raft_address: "127.0.0.1:9002".into(),
        });
        match ProposeError::from(redirect) {
            ProposeError::NotLeader(Some(leader)) => {
                assert_eq!(leader.replica_id, "node-2");
                assert_eq!(leader.raft_address, "127.0.0.1:9002");
            }
            other => panic!("Unexpected {:?}", other),
        }

        assert!(matches!(
            ProposeError::from(EnqueueForReplicationError::LastVoter),
            ProposeError::MembershipConflict
        ));
        assert!(matches!(
            ProposeError::from(EnqueueForReplicationError::ActorExited),
            ProposeError::ReplicaExited
        ));
    }

    #[test]
    fn decode_failures_are_reported_as_corruption() {
        let corrupt = io::Error::new(io::ErrorKind::InvalidData, "bad checksum");
        assert!(matches!(
            NodeCreationError::from(corrupt),
            NodeCreationError::CorruptState(_)
        ));

        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        assert!(matches!(
            NodeCreationError::from(denied),
            NodeCreationError::StorageInitialization(_)
        ));
    }
}
