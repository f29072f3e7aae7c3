//! Multi-replica behaviour, run in-process over `LocalNetwork` with real on-disk storage.
use crate::api::options::{RaftOptions, RaftOptionsValidated};
use crate::api::wiring::{assemble_node, NodeParts};
use crate::api::{ElectionEvent, ProposeError, RaftKvNode};
use crate::commitlog::{DiskLog, StorageConfig};
use crate::replica::{DurableLocalState, LocalNetwork, ReplicaId, ReplicaMetadata};
use crate::snapshot::DiskSnapshotStore;
use slog::Drain;
use std::collections::{HashMap, HashSet};
use std::convert::TryFrom;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::time::{Duration, Instant};

const WAIT_LIMIT: Duration = Duration::from_secs(10);

struct TestCluster {
    network: LocalNetwork,
    root: TempDir,
    options: fn() -> RaftOptions,
    nodes: HashMap<String, RaftKvNode>,
    isolated: HashSet<String>,
}

impl TestCluster {
    fn new(options: fn() -> RaftOptions) -> Self {
        TestCluster {
            network: LocalNetwork::default(),
            root: tempfile::tempdir().unwrap(),
            options,
            nodes: HashMap::new(),
            isolated: HashSet::new(),
        }
    }

    /// Starts `n` nodes. The first bootstraps, every other one is added through the leader.
    async fn with_voters(n: usize, options: fn() -> RaftOptions) -> Self {
        let mut cluster = TestCluster::new(options);
        cluster.start_node(&node_id(1), true);
        let leader = cluster.wait_for_leader().await;
        assert_eq!(leader, node_id(1));

        for i in 2..=n {
            cluster.start_node(&node_id(i), false);
            cluster
                .node(&leader)
                .add_voter(node_id(i), raft_address(&node_id(i)))
                .await
                .unwrap();
        }

        cluster
    }

    fn start_node(&mut self, id: &str, bootstrap: bool) {
        let data_dir = self.root.path().join(id);
        let replica_id = ReplicaId::new(id);
        let logger = test_logger().new(slog::o!("ReplicaId" => id.to_string()));

        let (node, weak_actor_client) = assemble_node(NodeParts {
            logger,
            me: ReplicaMetadata::new(replica_id.clone(), raft_address(id)),
            log: DiskLog::open(StorageConfig {
                directory: data_dir.join("raft-log"),
            })
            .unwrap(),
            local_state: Box::new(DurableLocalState::open(data_dir.clone(), replica_id).unwrap()),
            snapshot_store: Arc::new(DiskSnapshotStore::open(data_dir.join("snapshots")).unwrap()),
            peer_connector: self.network.connector(&raft_address(id)),
            bootstrap,
            options: RaftOptionsValidated::try_from((self.options)()).unwrap(),
            raft_socket_addr: None,
            client_socket_addr: None,
        })
        .unwrap();

        self.network.register(&raft_address(id), weak_actor_client);
        self.nodes.insert(id.to_string(), node);
    }

    async fn stop_node(&mut self, id: &str) {
        let node = self.nodes.remove(id).unwrap();
        node.shutdown().await;
    }

    fn node(&self, id: &str) -> &RaftKvNode {
        self.nodes.get(id).unwrap()
    }

    fn isolate(&mut self, id: &str) {
        self.network.isolate(&raft_address(id));
        self.isolated.insert(id.to_string());
    }

    fn heal(&mut self, id: &str) {
        self.network.heal(&raft_address(id));
        self.isolated.remove(id);
    }

    fn connected_leaders(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(id, _)| !self.isolated.contains(*id))
            .filter(|(_, node)| node.election_state() == ElectionEvent::Leader && node.is_write_enabled())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Waits until exactly one reachable node is leader with its write gate open.
    async fn wait_for_leader(&self) -> String {
        let deadline = Instant::now() + WAIT_LIMIT;
        loop {
            let leaders = self.connected_leaders();
            if leaders.len() == 1 {
                return leaders[0].clone();
            }
            assert!(Instant::now() < deadline, "No single leader. Saw {:?}", leaders);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn wait_for_value(&self, id: &str, key: &str, value: &str) {
        let deadline = Instant::now() + WAIT_LIMIT;
        while self.node(id).get(key).as_deref() != Some(value) {
            assert!(
                Instant::now() < deadline,
                "{} never saw {}={}. Has {:?}",
                id,
                key,
                value,
                self.node(id).get(key)
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Asserts no term ever has two leaders, as far as the current statuses can tell.
    async fn assert_one_leader_per_term(&self) {
        let mut leader_terms = HashMap::new();
        for (id, node) in &self.nodes {
            if let Some(status) = node.status().await {
                if status.election_state == ElectionEvent::Leader {
                    if let Some(other) = leader_terms.insert(status.term, id.clone()) {
                        panic!("{} and {} both lead term {}", id, other, status.term);
                    }
                }
            }
        }
    }
}

fn node_id(i: usize) -> String {
    format!("node-{}", i)
}

fn raft_address(id: &str) -> String {
    format!("{}.local:7000", id)
}

fn fast_options() -> RaftOptions {
    RaftOptions {
        leader_heartbeat_duration: Some(Duration::from_millis(20)),
        follower_min_timeout: Some(Duration::from_millis(100)),
        follower_max_timeout: Some(Duration::from_millis(200)),
        leader_append_entries_timeout: Some(Duration::from_millis(50)),
        propose_timeout: Some(Duration::from_secs(2)),
        ..RaftOptions::default()
    }
}

fn fast_options_eager_snapshots() -> RaftOptions {
    RaftOptions {
        snapshot_threshold: Some(5),
        snapshot_interval: Some(Duration::from_secs(3600)),
        ..fast_options()
    }
}

fn test_logger() -> slog::Logger {
    let decorator = slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog::LevelFilter::new(drain, slog::Level::Info).fuse();

    slog::Logger::root(drain, slog::o!())
}

#[tokio::test]
async fn single_node_reads_its_own_writes() {
    let cluster = TestCluster::with_voters(1, fast_options).await;
    let node = cluster.node(&node_id(1));

    assert_eq!(node.get("k"), None);
    node.set("k", "v1").await.unwrap();
    assert_eq!(node.get("k"), Some("v1".to_string()));
    node.set("k", "").await.unwrap();
    assert_eq!(node.get("k"), Some(String::new()));
}

#[tokio::test]
async fn three_nodes_replicate_to_every_follower() {
    let cluster = TestCluster::with_voters(3, fast_options).await;
    let leader = cluster.wait_for_leader().await;

    for i in 0..10 {
        cluster
            .node(&leader)
            .set(format!("key-{}", i), format!("value-{}", i))
            .await
            .unwrap();
    }

    for i in 1..=3 {
        cluster.wait_for_value(&node_id(i), "key-9", "value-9").await;
        assert_eq!(cluster.node(&node_id(i)).get("key-0"), Some("value-0".to_string()));
    }
    let status = cluster.node(&leader).status().await.unwrap();
    assert_eq!(status.voters.len(), 3);
    cluster.assert_one_leader_per_term().await;
}

#[tokio::test]
async fn follower_rejects_writes_with_leader_hint() {
    let cluster = TestCluster::with_voters(3, fast_options).await;
    let leader = cluster.wait_for_leader().await;
    cluster.node(&leader).set("k", "v").await.unwrap();

    let follower = (1..=3).map(node_id).find(|id| *id != leader).unwrap();
    cluster.wait_for_value(&follower, "k", "v").await;

    match cluster.node(&follower).set("k", "other").await {
        Err(ProposeError::NotLeader(Some(hint))) => {
            assert_eq!(hint.replica_id, leader);
            assert_eq!(hint.raft_address, raft_address(&leader));
        }
        other => panic!("Expected redirect, got {:?}", other),
    }
}

#[tokio::test]
async fn isolated_leader_is_replaced_and_converges_after_heal() {
    let mut cluster = TestCluster::with_voters(3, fast_options).await;
    let old_leader = cluster.wait_for_leader().await;
    let old_term = cluster.node(&old_leader).status().await.unwrap().term;
    cluster.node(&old_leader).set("k", "before").await.unwrap();

    cluster.isolate(&old_leader);
    let new_leader = cluster.wait_for_leader().await;
    assert_ne!(new_leader, old_leader);
    assert!(cluster.node(&new_leader).status().await.unwrap().term > old_term);

    // The minority side can't commit anything.
    match cluster.node(&old_leader).set("k", "lost").await {
        Err(ProposeError::CommitTimeout) | Err(ProposeError::NotLeader(_)) | Err(ProposeError::NoLeader) => {}
        other => panic!("Expected the isolated write to fail, got {:?}", other),
    }
    cluster.node(&new_leader).set("k", "after").await.unwrap();
    cluster.assert_one_leader_per_term().await;

    cluster.heal(&old_leader);
    cluster.wait_for_value(&old_leader, "k", "after").await;
    assert_eq!(cluster.wait_for_leader().await, new_leader);
    assert_ne!(cluster.node(&old_leader).election_state(), ElectionEvent::Leader);
}

#[tokio::test]
async fn restarted_follower_catches_up() {
    let mut cluster = TestCluster::with_voters(3, fast_options).await;
    let leader = cluster.wait_for_leader().await;
    let follower = (1..=3).map(node_id).find(|id| *id != leader).unwrap();

    cluster.node(&leader).set("a", "1").await.unwrap();
    cluster.wait_for_value(&follower, "a", "1").await;
    cluster.stop_node(&follower).await;

    // Two of three voters are still up.
    cluster.node(&leader).set("b", "2").await.unwrap();

    cluster.start_node(&follower, false);
    cluster.wait_for_value(&follower, "b", "2").await;
    assert_eq!(cluster.node(&follower).get("a"), Some("1".to_string()));
}

#[tokio::test]
async fn node_joining_after_compaction_installs_snapshot() {
    let mut cluster = TestCluster::with_voters(1, fast_options_eager_snapshots).await;
    let leader = node_id(1);
    for i in 0..20 {
        cluster.node(&leader).set(format!("k{}", i), i.to_string()).await.unwrap();
    }

    let deadline = Instant::now() + WAIT_LIMIT;
    loop {
        let status = cluster.node(&leader).status().await.unwrap();
        if matches!(status.snapshot_index, Some(i) if i >= 10) {
            break;
        }
        assert!(Instant::now() < deadline, "Leader never compacted: {:?}", status);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    cluster.start_node(&node_id(2), false);
    cluster
        .node(&leader)
        .add_voter(node_id(2), raft_address(&node_id(2)))
        .await
        .unwrap();

    cluster.wait_for_value(&node_id(2), "k19", "19").await;
    assert_eq!(cluster.node(&node_id(2)).get("k0"), Some("0".to_string()));
    let status = cluster.node(&node_id(2)).status().await.unwrap();
    assert!(status.snapshot_index.is_some());
    assert_eq!(status.voters.len(), 2);
}

#[tokio::test]
async fn removed_voters_stop_counting() {
    let cluster = TestCluster::with_voters(3, fast_options).await;
    let leader = cluster.wait_for_leader().await;
    let mut followers = (1..=3).map(node_id).filter(|id| *id != leader);
    let removed = followers.next().unwrap();
    let survivor = followers.next().unwrap();

    cluster.node(&leader).remove_voter(removed.clone()).await.unwrap();
    let status = cluster.node(&leader).status().await.unwrap();
    assert!(status.voters.iter().all(|v| v.replica_id != removed));
    cluster.node(&leader).set("k", "v").await.unwrap();

    // Removing the leader itself hands the cluster to the last voter.
    cluster.node(&leader).remove_voter(leader.clone()).await.unwrap();
    let deadline = Instant::now() + WAIT_LIMIT;
    while !cluster.node(&survivor).is_write_enabled() {
        assert!(Instant::now() < deadline, "{} never took over", survivor);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cluster.node(&survivor).set("k", "v2").await.unwrap();
    assert!(!cluster.node(&leader).is_write_enabled());
}

#[tokio::test]
async fn one_membership_change_at_a_time() {
    let mut cluster = TestCluster::with_voters(1, fast_options).await;
    cluster.start_node(&node_id(2), false);
    cluster.start_node(&node_id(3), false);
    let leader = cluster.node(&node_id(1));

    let (first, second) = tokio::join!(
        leader.add_voter(node_id(2), raft_address(&node_id(2))),
        leader.add_voter(node_id(3), raft_address(&node_id(3))),
    );
    first.unwrap();
    assert!(matches!(second, Err(ProposeError::MembershipConflict)));

    // Already a voter: nothing to do.
    leader.add_voter(node_id(2), raft_address(&node_id(2))).await.unwrap();
    leader.add_voter(node_id(3), raft_address(&node_id(3))).await.unwrap();
    assert_eq!(leader.status().await.unwrap().voters.len(), 3);
}

#[tokio::test]
async fn last_voter_cannot_be_removed() {
    let cluster = TestCluster::with_voters(1, fast_options).await;

    assert!(matches!(
        cluster.node(&node_id(1)).remove_voter(node_id(1)).await,
        Err(ProposeError::MembershipConflict)
    ));
    cluster.node(&node_id(1)).set("still", "leader").await.unwrap();
}
