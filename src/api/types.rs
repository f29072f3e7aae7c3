use crate::api::event_bus::ElectionEvent;
use crate::replica;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RaftLeaderInfo {
    pub replica_id: String,
    pub raft_address: String,
}

impl From<replica::LeaderRedirectInfo> for RaftLeaderInfo {
    fn from(internal_leader: replica::LeaderRedirectInfo) -> Self {
        Self {
            replica_id: internal_leader.replica_id.into_inner(),
            raft_address: internal_leader.raft_address,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RaftMemberInfo {
    pub replica_id: String,
    pub raft_address: String,
}

/// Point-in-time view of a node. Indexes are `None` while the log (or snapshot) is empty.
#[derive(Clone, Debug)]
pub struct NodeStatus {
    pub replica_id: String,
    pub term: u64,
    pub election_state: ElectionEvent,
    pub commit_index: Option<u64>,
    pub latest_index: Option<u64>,
    pub snapshot_index: Option<u64>,
    pub voters: Vec<RaftMemberInfo>,
}

impl From<replica::ReplicaStatus> for NodeStatus {
    fn from(status: replica::ReplicaStatus) -> Self {
        Self {
            replica_id: status.replica_id.into_inner(),
            term: status.term.as_u64(),
            election_state: ElectionEvent::from(status.election_state),
            commit_index: status.commit_index.map(|i| i.as_u64()),
            latest_index: status.latest_index.map(|i| i.as_u64()),
            snapshot_index: status.snapshot_index.map(|i| i.as_u64()),
            voters: status
                .membership
                .iter()
                .map(|(id, address)| RaftMemberInfo {
                    replica_id: id.as_str().to_string(),
                    raft_address: address.to_string(),
                })
                .collect(),
        }
    }
}
