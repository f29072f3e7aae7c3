use crate::actor::{ActorClient, ReplicaActor, WeakActorClient};
use crate::api::errors::NodeCreationError;
use crate::api::node::{NodeCore, RaftKvNode};
use crate::api::options::{RaftOptions, RaftOptionsValidated};
use crate::api::EventListener;
use crate::commitlog::{DiskLog, Log, StorageConfig};
use crate::kv::{Cache, KvStateMachine, WriteGate};
use crate::replica::{
    self, DurableLocalState, GrpcPeerConnector, Membership, PeerConnector, PersistentLocalState, ReplicaId,
    ReplicaMetadata, ReplicaTimings, WriteAheadLogEntry,
};
use crate::server::{self, KvService, RpcServer};
use crate::snapshot::{DiskSnapshotStore, SnapshotManager, SnapshotPolicy, SnapshotStore};
use crate::state_machine::{Applier, StateMachine};
use std::convert::TryFrom;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;

const ACTOR_QUEUE_SIZE: usize = 128;

pub struct RaftKvConfig {
    pub replica_id: String,
    /// Address peers use to reach this node's raft server. Also what it binds to.
    pub raft_address: String,
    /// Address to serve the client-facing KV API on, if any.
    pub client_address: Option<String>,
    // Holds the log, term/vote state, and snapshots.
    pub data_dir: PathBuf,
    /// Seed a brand new cluster with this node as the only voter. Ignored if the data directory
    /// already has a log.
    pub bootstrap: bool,
    pub logger: slog::Logger,
    pub options: RaftOptions,
}

/// Opens (or creates) the node's storage under `data_dir` and starts it. A node that neither
/// bootstraps nor has prior state waits, as a non-voter, for a leader to add it.
pub async fn try_create_node(config: RaftKvConfig) -> Result<RaftKvNode, NodeCreationError> {
    let logger = config
        .logger
        .new(slog::o!("ReplicaId" => config.replica_id.clone()));

    let options = RaftOptionsValidated::try_from(config.options)
        .map_err(|e| NodeCreationError::IllegalOptions(e.to_string()))?;
    let raft_socket_addr = resolve(&config.raft_address)?;
    let client_socket_addr = match &config.client_address {
        Some(address) => Some(resolve(address)?),
        None => None,
    };

    let replica_id = ReplicaId::new(config.replica_id);
    let log = DiskLog::open(StorageConfig {
        directory: config.data_dir.join("raft-log"),
    })?;
    let local_state = DurableLocalState::open(config.data_dir.clone(), replica_id.clone())?;
    let snapshot_store = DiskSnapshotStore::open(config.data_dir.join("snapshots"))?;

    let (node, _) = assemble_node(NodeParts {
        logger: logger.clone(),
        me: ReplicaMetadata::new(replica_id, config.raft_address),
        log,
        local_state: Box::new(local_state),
        snapshot_store: Arc::new(snapshot_store),
        peer_connector: Arc::new(GrpcPeerConnector::new(logger)),
        bootstrap: config.bootstrap,
        options,
        raft_socket_addr: Some(raft_socket_addr),
        client_socket_addr,
    })?;

    Ok(node)
}

fn resolve(address: &str) -> Result<SocketAddr, NodeCreationError> {
    address
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| NodeCreationError::InvalidAddress(address.to_string()))
}

/// Everything a node is made of, independent of where its storage and network come from.
pub(crate) struct NodeParts<L> {
    pub logger: slog::Logger,
    pub me: ReplicaMetadata,
    pub log: L,
    pub local_state: Box<dyn PersistentLocalState + Send>,
    pub snapshot_store: Arc<dyn SnapshotStore>,
    pub peer_connector: Arc<dyn PeerConnector>,
    pub bootstrap: bool,
    pub options: RaftOptionsValidated,
    // None when peers reach the replica some other way (in-process tests).
    pub raft_socket_addr: Option<SocketAddr>,
    pub client_socket_addr: Option<SocketAddr>,
}

/// Starts every task of a node. Must be called within a tokio runtime. Also returns a weak handle
/// to the replica for in-process peer networks.
pub(crate) fn assemble_node<L>(parts: NodeParts<L>) -> Result<(RaftKvNode, WeakActorClient), NodeCreationError>
where
    L: Log<WriteAheadLogEntry> + Send + 'static,
{
    let logger = parts.logger;
    let options = parts.options;
    let replica_id = parts.me.replica_id().clone();
    let bootstrap = if parts.bootstrap {
        Some(Membership::singleton(
            replica_id.clone(),
            parts.me.raft_address().to_string(),
        ))
    } else {
        None
    };

    let (actor_client, actor_queue_rx) = ActorClient::new(ACTOR_QUEUE_SIZE);
    let (raft_server_shutdown_handle, raft_server_shutdown_signal) = server::shutdown_signal();

    let replica_parts = replica::create_replica(
        logger.clone(),
        parts.me,
        parts.log,
        parts.local_state,
        parts.snapshot_store.clone(),
        parts.peer_connector,
        actor_client.weak(),
        bootstrap,
        ReplicaTimings {
            leader_heartbeat_duration: options.leader_heartbeat_duration,
            follower_min_timeout: options.follower_min_timeout,
            follower_max_timeout: options.follower_max_timeout,
            append_entries_timeout: options.leader_append_entries_timeout,
            max_entries_per_append: options.max_entries_per_append,
        },
        parts.raft_socket_addr.map(|_| raft_server_shutdown_handle),
    )?;

    let cache = Arc::new(Cache::new());
    let state_machine = Arc::new(KvStateMachine::new(cache.clone()));
    let last_applied = match &replica_parts.latest_snapshot {
        Some(snapshot) => {
            state_machine.restore(&snapshot.data)?;
            slog::info!(logger, "Restored {} keys from snapshot", cache.len());
            Some((snapshot.last_included_term, snapshot.last_included_index))
        }
        None => None,
    };

    let mut tasks = Vec::new();

    let replica_actor = ReplicaActor::new(logger.clone(), actor_queue_rx, replica_parts.replica);
    tasks.push(tokio::spawn(replica_actor.run_event_loop()));

    if let Some(raft_socket_addr) = parts.raft_socket_addr {
        let replica_raft_server = RpcServer::new(logger.clone(), actor_client.weak());
        tasks.push(tokio::spawn(
            replica_raft_server.run(raft_socket_addr, raft_server_shutdown_signal),
        ));
    }

    let snapshot_manager = SnapshotManager::new(
        logger.clone(),
        parts.snapshot_store,
        SnapshotPolicy {
            interval: options.snapshot_interval,
            threshold: options.snapshot_threshold,
        },
        actor_client.weak(),
        last_applied.map(|(_, index)| index),
    );
    let applier = Applier::new(
        logger.clone(),
        state_machine,
        replica_parts.commit_stream,
        snapshot_manager,
        last_applied,
        replica_parts.applied_membership,
    );
    tasks.push(tokio::spawn(applier.run()));

    let write_gate = WriteGate::closed();
    write_gate.spawn_consumer(
        logger.clone(),
        EventListener::new(replica_parts.election_state_change_listener.clone()),
    );

    let weak_actor_client = actor_client.weak();
    let core = Arc::new(NodeCore::new(
        logger.clone(),
        replica_id,
        actor_client,
        cache,
        write_gate,
        replica_parts.election_state_change_listener,
        options.propose_timeout,
    ));

    let kv_server_shutdown_handle = match parts.client_socket_addr {
        Some(client_socket_addr) => {
            let (handle, signal) = server::shutdown_signal();
            let kv_service = KvService::new(logger.clone(), core.clone());
            tasks.push(tokio::spawn(kv_service.run(client_socket_addr, signal)));
            Some(handle)
        }
        None => None,
    };

    Ok((RaftKvNode::new(core, kv_server_shutdown_handle, tasks), weak_actor_client))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ProposeError;
    use tokio::time::Duration;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn fast_options() -> RaftOptions {
        RaftOptions {
            leader_heartbeat_duration: Some(Duration::from_millis(20)),
            follower_min_timeout: Some(Duration::from_millis(100)),
            follower_max_timeout: Some(Duration::from_millis(200)),
            leader_append_entries_timeout: Some(Duration::from_millis(50)),
            ..RaftOptions::default()
        }
    }

    #[test]
    fn unresolvable_address_is_rejected() {
        assert!(matches!(
            resolve("not an address"),
            Err(NodeCreationError::InvalidAddress(_))
        ));
        assert_eq!(resolve("127.0.0.1:7000").unwrap().port(), 7000);
    }

    #[tokio::test]
    async fn invalid_options_fail_creation() {
        let dir = tempfile::tempdir().unwrap();
        let result = try_create_node(RaftKvConfig {
            replica_id: "node-1".into(),
            raft_address: "127.0.0.1:0".into(),
            client_address: None,
            data_dir: dir.path().to_path_buf(),
            bootstrap: true,
            logger: test_logger(),
            options: RaftOptions {
                follower_min_timeout: Some(Duration::from_millis(10)),
                ..fast_options()
            },
        })
        .await;

        assert!(matches!(result, Err(NodeCreationError::IllegalOptions(_))));
    }

    #[tokio::test]
    async fn bootstrapped_node_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = || RaftKvConfig {
            replica_id: "node-1".into(),
            raft_address: "127.0.0.1:0".into(),
            client_address: None,
            data_dir: dir.path().to_path_buf(),
            bootstrap: true,
            logger: test_logger(),
            options: fast_options(),
        };

        let node = try_create_node(config()).await.unwrap();
        wait_for_write_enabled(&node).await;
        node.set("color", "blue").await.unwrap();
        let term_before = node.status().await.unwrap().term;
        node.shutdown().await;

        let node = try_create_node(config()).await.unwrap();
        wait_for_write_enabled(&node).await;
        assert!(node.status().await.unwrap().term > term_before);
        // Re-learning the commit index replays the log.
        node.set("shape", "circle").await.unwrap();
        assert_eq!(node.get("color"), Some("blue".to_string()));
        assert_eq!(node.get("shape"), Some("circle".to_string()));
    }

    #[tokio::test]
    async fn node_without_state_or_bootstrap_never_leads() {
        let dir = tempfile::tempdir().unwrap();
        let node = try_create_node(RaftKvConfig {
            replica_id: "node-2".into(),
            raft_address: "127.0.0.1:0".into(),
            client_address: None,
            data_dir: dir.path().to_path_buf(),
            bootstrap: false,
            logger: test_logger(),
            options: fast_options(),
        })
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!node.is_write_enabled());
        assert!(matches!(
            node.set("k", "v").await,
            Err(ProposeError::NotLeader(None))
        ));
    }

    async fn wait_for_write_enabled(node: &RaftKvNode) {
        for _ in 0..100 {
            if node.is_write_enabled() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("Node never became leader");
    }
}
