use crate::actor::ActorClient;
use crate::api::errors::ProposeError;
use crate::api::event_bus::{ElectionEvent, EventListener};
use crate::api::types::{NodeStatus, RaftLeaderInfo};
use crate::kv::{Cache, KvCommand, WriteGate};
use crate::replica::{
    ApplyOutcome, ElectionStateChangeListener, ElectionStateSnapshot, EnqueueForReplicationInput, Proposal, ReplicaId,
};
use crate::server::ShutdownHandle;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// NodeCore is everything a client-facing surface needs from a running node. It holds the only
/// strong handle to the replica actor, so the replica lives as long as the last `NodeCore`.
pub(crate) struct NodeCore {
    logger: slog::Logger,
    replica_id: ReplicaId,
    actor_client: ActorClient,
    cache: Arc<Cache>,
    write_gate: WriteGate,
    election_state_change_listener: ElectionStateChangeListener,
    propose_timeout: Duration,
}

impl NodeCore {
    pub(crate) fn new(
        logger: slog::Logger,
        replica_id: ReplicaId,
        actor_client: ActorClient,
        cache: Arc<Cache>,
        write_gate: WriteGate,
        election_state_change_listener: ElectionStateChangeListener,
        propose_timeout: Duration,
    ) -> Self {
        NodeCore {
            logger,
            replica_id,
            actor_client,
            cache,
            write_gate,
            election_state_change_listener,
            propose_timeout,
        }
    }

    /// Reads the local cache. Possibly stale on a non-leader.
    pub(crate) fn get(&self, key: &str) -> Option<String> {
        self.cache.get(key)
    }

    pub(crate) async fn set(&self, key: String, value: String) -> Result<(), ProposeError> {
        if !self.write_gate.is_open() {
            return Err(ProposeError::NotLeader(self.leader_hint()));
        }

        let command = KvCommand::Set { key, value };
        self.propose(Proposal::Command(Bytes::from(command.encode()))).await
    }

    pub(crate) async fn add_voter(&self, replica_id: String, raft_address: String) -> Result<(), ProposeError> {
        slog::info!(self.logger, "Proposing to add voter {} at {}", replica_id, raft_address);
        self.propose(Proposal::AddVoter {
            replica_id: ReplicaId::new(replica_id),
            raft_address,
        })
        .await
    }

    pub(crate) async fn remove_voter(&self, replica_id: String) -> Result<(), ProposeError> {
        slog::info!(self.logger, "Proposing to remove voter {}", replica_id);
        self.propose(Proposal::RemoveVoter {
            replica_id: ReplicaId::new(replica_id),
        })
        .await
    }

    pub(crate) fn is_write_enabled(&self) -> bool {
        self.write_gate.is_open()
    }

    pub(crate) fn replica_id(&self) -> &str {
        self.replica_id.as_str()
    }

    pub(crate) async fn status(&self) -> Option<NodeStatus> {
        self.actor_client.status().await.map(NodeStatus::from)
    }

    pub(crate) fn event_listener(&self) -> EventListener {
        EventListener::new(self.election_state_change_listener.clone())
    }

    fn leader_hint(&self) -> Option<RaftLeaderInfo> {
        match self.election_state_change_listener.current() {
            ElectionStateSnapshot::Follower(leader) => Some(leader.into()),
            _ => None,
        }
    }

    /// Enqueues on the leader, then waits for the entry to be applied locally. The whole wait is
    /// bounded by the propose timeout.
    async fn propose(&self, proposal: Proposal) -> Result<(), ProposeError> {
        let (applied_tx, applied_rx) = oneshot::channel();
        let input = EnqueueForReplicationInput {
            proposal,
            applied_notifier: applied_tx,
        };

        let wait_for_apply = async {
            let output = self.actor_client.enqueue_for_replication(input).await?;
            slog::debug!(
                self.logger,
                "Enqueued at {:?} in term {:?}",
                output.enqueued_index,
                output.enqueued_term
            );

            match applied_rx.await {
                Ok(ApplyOutcome::Applied) => Ok(()),
                Ok(ApplyOutcome::Malformed(message)) => Err(ProposeError::Serialization(message)),
                Err(_) if self.actor_client.is_closed() => Err(ProposeError::ReplicaExited),
                Err(_) => Err(ProposeError::EntryDropped),
            }
        };

        match tokio::time::timeout(self.propose_timeout, wait_for_apply).await {
            Ok(result) => result,
            Err(_) => Err(ProposeError::CommitTimeout),
        }
    }
}

/// RaftKvNode is a running member of a replicated key-value cluster. Dropping it (or calling
/// `shutdown()`) stops the node's servers and its replica.
pub struct RaftKvNode {
    core: Arc<NodeCore>,
    // Stops the client-facing server when the node is dropped.
    _kv_server_shutdown_handle: Option<ShutdownHandle>,
    tasks: Vec<JoinHandle<()>>,
}

impl RaftKvNode {
    pub(crate) fn new(
        core: Arc<NodeCore>,
        kv_server_shutdown_handle: Option<ShutdownHandle>,
        tasks: Vec<JoinHandle<()>>,
    ) -> Self {
        RaftKvNode {
            core,
            _kv_server_shutdown_handle: kv_server_shutdown_handle,
            tasks,
        }
    }

    pub fn replica_id(&self) -> &str {
        self.core.replica_id()
    }

    /// Reads this node's copy of the data. Only the leader is guaranteed to see its own acked
    /// writes; followers converge eventually.
    pub fn get(&self, key: &str) -> Option<String> {
        self.core.get(key)
    }

    /// Replicates the write and returns once it's committed and applied on this node.
    pub async fn set(&self, key: impl Into<String>, value: impl Into<String>) -> Result<(), ProposeError> {
        self.core.set(key.into(), value.into()).await
    }

    pub async fn add_voter(
        &self,
        replica_id: impl Into<String>,
        raft_address: impl Into<String>,
    ) -> Result<(), ProposeError> {
        self.core.add_voter(replica_id.into(), raft_address.into()).await
    }

    pub async fn remove_voter(&self, replica_id: impl Into<String>) -> Result<(), ProposeError> {
        self.core.remove_voter(replica_id.into()).await
    }

    /// True while this node believes it's leader and accepts writes.
    pub fn is_write_enabled(&self) -> bool {
        self.core.is_write_enabled()
    }

    pub fn election_state(&self) -> ElectionEvent {
        self.core.event_listener().current()
    }

    /// Returns None if the replica has stopped.
    pub async fn status(&self) -> Option<NodeStatus> {
        self.core.status().await
    }

    pub fn event_listener(&self) -> EventListener {
        self.core.event_listener()
    }

    pub(crate) fn core(&self) -> &Arc<NodeCore> {
        &self.core
    }

    /// Stops the node and waits for its replica, servers, and applier to exit.
    pub async fn shutdown(mut self) {
        let logger = self.core.logger.clone();
        let tasks = std::mem::take(&mut self.tasks);
        drop(self);

        for task in tasks {
            if let Err(e) = task.await {
                slog::warn!(logger, "Node task failed during shutdown: {:?}", e);
            }
        }
        slog::info!(logger, "Node shut down.");
    }
}
