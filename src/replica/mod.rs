mod election;
mod local_state;
mod membership;
mod peer_client;
mod peers;
mod replica;
mod replica_api;
mod replica_wiring;
mod write_ahead_log;

pub(crate) use election::ElectionStateChangeListener;
pub(crate) use election::ElectionStateSnapshot;
pub(crate) use local_state::DurableLocalState;
pub(crate) use local_state::PersistentLocalState;
pub(crate) use local_state::Term;
pub(crate) use local_state::VolatileLocalState;
pub(crate) use membership::Membership;
pub(crate) use peer_client::GrpcPeerConnector;
pub(crate) use peer_client::PeerConnector;
pub(crate) use peers::ReplicaId;
pub(crate) use peers::ReplicaMetadata;
pub(crate) use replica::Replica;
pub(crate) use replica_api::*;
pub(crate) use replica_wiring::create_replica;
pub(crate) use replica_wiring::ReplicaParts;
pub(crate) use replica_wiring::ReplicaTimings;
pub(crate) use write_ahead_log::wired as wired_write_ahead_log;
pub(crate) use write_ahead_log::AppliedNotifier;
pub(crate) use write_ahead_log::ApplyOutcome;
pub(crate) use write_ahead_log::CommitStream;
pub(crate) use write_ahead_log::CommitStreamItem;
pub(crate) use write_ahead_log::CommittedEntry;
pub(crate) use write_ahead_log::EntryPayload;
pub(crate) use write_ahead_log::WriteAheadLogEntry;

#[cfg(test)]
pub(crate) use peer_client::LocalNetwork;
