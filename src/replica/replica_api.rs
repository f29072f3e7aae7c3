use crate::commitlog::Index;
use crate::replica::local_state::Term;
use crate::replica::membership::Membership;
use crate::replica::peers::ReplicaId;
use crate::replica::write_ahead_log::{AppliedNotifier, EntryPayload};
use crate::replica::ElectionStateSnapshot;
use crate::snapshot::Snapshot;
use bytes::Bytes;
use std::io;
use std::sync::Arc;

#[derive(Debug)]
pub(crate) struct EnqueueForReplicationInput {
    pub(crate) proposal: Proposal,
    pub(crate) applied_notifier: AppliedNotifier,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Proposal {
    Command(Bytes),
    AddVoter { replica_id: ReplicaId, raft_address: String },
    RemoveVoter { replica_id: ReplicaId },
}

#[derive(Debug)]
pub(crate) struct EnqueueForReplicationOutput {
    pub(crate) enqueued_term: Term,
    // None if the proposal was already in effect and nothing was appended.
    pub(crate) enqueued_index: Option<Index>,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum EnqueueForReplicationError {
    #[error("I'm not leader")]
    LeaderRedirect(LeaderRedirectInfo),

    // Can be retried with exponential backoff with recommended initial delay of 200ms. Likely an
    // election is in progress.
    #[error("Cluster is in a tough shape. No one is leader.")]
    NoLeader,

    #[error("A membership change is already in progress")]
    MembershipChangeInProgress,

    #[error("Refusing to remove the last voter")]
    LastVoter,

    #[error("Failed to persist log: {0:?}")]
    LocalIoError(io::Error),

    #[error("Replica actor is dead RIP")]
    ActorExited,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LeaderRedirectInfo {
    pub(crate) replica_id: ReplicaId,
    pub(crate) raft_address: String,
}

#[derive(Debug)]
pub(crate) struct RequestVoteInput {
    pub(crate) candidate_term: Term,
    pub(crate) candidate_id: ReplicaId,
    pub(crate) candidate_last_log_entry: Option<(Term, Index)>,
}

#[derive(Debug)]
pub(crate) struct RequestVoteOutput {
    pub(crate) vote_granted: bool,
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum RequestVoteError {
    #[error("Requesting candidate's term is out of date")]
    RequestTermOutOfDate(TermOutOfDateInfo),
    #[error("We (server) had an IO failure: {0:?}")]
    ServerIoError(io::Error),
    #[error("We (server) are unavailable because actor is dead RIP")]
    ActorExited,
}

#[derive(Debug, Clone)]
pub(crate) struct AppendEntriesInput {
    pub(crate) leader_term: Term,
    pub(crate) leader: LeaderRedirectInfo,
    // "Previous log entry" is the log entry immediately preceding the new ones in AppendEntriesInput.
    pub(crate) leader_previous_log_entry: Option<(Term, Index)>,
    pub(crate) leader_commit_index: Option<Index>,
    pub(crate) new_entries: Vec<AppendEntriesLogEntry>,
}

#[derive(Debug, Clone)]
pub(crate) struct AppendEntriesLogEntry {
    pub(crate) term: Term,
    pub(crate) payload: EntryPayload,
}

#[derive(Debug)]
pub(crate) struct AppendEntriesOutput {
    // Nothing
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum AppendEntriesError {
    #[error("Client's term is out of date")]
    ClientTermOutOfDate(TermOutOfDateInfo),
    #[error("We (server) are missing previous log entry")]
    ServerMissingPreviousLogEntry { last_log_index: Option<Index> },
    #[error("We (server) had an IO failure: {0:?}")]
    ServerIoError(io::Error),
    #[error("We (server) are unavailable because actor is dead RIP")]
    ActorExited,
}

#[derive(Debug, Clone)]
pub(crate) struct InstallSnapshotInput {
    pub(crate) leader_term: Term,
    pub(crate) leader: LeaderRedirectInfo,
    pub(crate) snapshot: Arc<Snapshot>,
}

#[derive(Debug)]
pub(crate) struct InstallSnapshotOutput {
    // Nothing
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum InstallSnapshotError {
    #[error("Client's term is out of date")]
    ClientTermOutOfDate(TermOutOfDateInfo),
    #[error("We (server) had an IO failure: {0:?}")]
    ServerIoError(io::Error),
    #[error("We (server) are unavailable because actor is dead RIP")]
    ActorExited,
}

#[derive(Debug)]
pub(crate) struct TermOutOfDateInfo {
    pub(crate) current_term: Term,
}

#[derive(Debug)]
pub(crate) struct RequestVoteReplyFromPeer {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
    pub(crate) result: RequestVoteResult,
}

#[derive(Debug, PartialEq)]
pub(crate) enum RequestVoteResult {
    VoteGranted,
    VoteNotGranted,
    StaleTerm { new_term: Term },
    RetryableFailure,
    MalformedReply,
}

#[derive(Debug)]
pub(crate) struct AppendEntriesReplyFromPeer {
    pub(crate) descriptor: AppendEntriesReplyFromPeerDescriptor,
    pub(crate) result: Result<(), AppendEntriesReplyFromPeerError>,
}

// This is basically info about the original request
#[derive(Debug)]
pub(crate) struct AppendEntriesReplyFromPeerDescriptor {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
    pub(crate) seq_no: u64,
    pub(crate) previous_log_entry_index: Option<Index>,
    pub(crate) num_log_entries: usize,
}

#[derive(Debug, PartialEq)]
pub(crate) enum AppendEntriesReplyFromPeerError {
    PeerMissingPreviousLogEntry { last_log_index: Option<Index> },
    RetryableFailure(String),
    StaleTerm { new_term: Term },
}

#[derive(Debug)]
pub(crate) struct InstallSnapshotReplyFromPeer {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
    pub(crate) seq_no: u64,
    pub(crate) last_included_index: Index,
    pub(crate) result: Result<(), AppendEntriesReplyFromPeerError>,
}

/// LeaderTimerTick contains info for a single tick of a leader's per-peer timer.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LeaderTimerTick {
    pub(crate) peer_id: ReplicaId,
    pub(crate) term: Term,
}

/// Point-in-time view of the replica, for operators and tests.
#[derive(Debug, Clone)]
pub(crate) struct ReplicaStatus {
    pub(crate) replica_id: ReplicaId,
    pub(crate) term: Term,
    pub(crate) election_state: ElectionStateSnapshot,
    pub(crate) commit_index: Option<Index>,
    pub(crate) latest_index: Option<Index>,
    pub(crate) snapshot_index: Option<Index>,
    pub(crate) membership: Membership,
}
