use crate::actor::WeakActorClient;
use crate::commitlog::Log;
use crate::replica::election::{ElectionConfig, ElectionState};
use crate::replica::local_state::{PersistentLocalState, Term};
use crate::replica::membership::Membership;
use crate::replica::peer_client::PeerConnector;
use crate::replica::peers::{ClusterTracker, ReplicaMetadata};
use crate::replica::replica::{Replica, ReplicaConfig};
use crate::replica::write_ahead_log::{self, CommitStream, EntryPayload, WriteAheadLogEntry};
use crate::replica::ElectionStateChangeListener;
use crate::server::ShutdownHandle;
use crate::snapshot::{Snapshot, SnapshotStore};
use std::io;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Debug)]
pub(crate) struct ReplicaTimings {
    pub leader_heartbeat_duration: Duration,
    pub follower_min_timeout: Duration,
    pub follower_max_timeout: Duration,
    pub append_entries_timeout: Duration,
    pub max_entries_per_append: usize,
}

pub(crate) struct ReplicaParts<L>
where
    L: Log<WriteAheadLogEntry>,
{
    pub replica: Replica<L>,
    pub commit_stream: CommitStream,
    pub election_state_change_listener: ElectionStateChangeListener,
    // What the state machine must be restored from before applying the commit stream.
    pub latest_snapshot: Option<Arc<Snapshot>>,
    pub applied_membership: Membership,
}

/// Builds a replica from whatever is on disk. `bootstrap` seeds a brand new log with an initial
/// configuration; it's ignored if the replica already has state.
pub(crate) fn create_replica<L>(
    logger: slog::Logger,
    me: ReplicaMetadata,
    log: L,
    mut local_state: Box<dyn PersistentLocalState + Send>,
    snapshot_store: Arc<dyn SnapshotStore>,
    peer_connector: Arc<dyn PeerConnector>,
    actor_client: WeakActorClient,
    bootstrap: Option<Membership>,
    timings: ReplicaTimings,
    server_shutdown_handle: Option<ShutdownHandle>,
) -> Result<ReplicaParts<L>, io::Error>
where
    L: Log<WriteAheadLogEntry> + 'static,
{
    let latest_snapshot = snapshot_store.load_latest()?.map(Arc::new);
    if let Some(snapshot) = &latest_snapshot {
        slog::info!(logger, "Loaded snapshot through {:?}", snapshot.last_included_index);
    }

    let (mut write_ahead_log, commit_stream) =
        write_ahead_log::wired(logger.clone(), log, latest_snapshot.clone())?;

    if let Some(initial_membership) = bootstrap {
        if write_ahead_log.latest_index().is_none() {
            slog::info!(logger, "Bootstrapping new cluster with {:?}", initial_membership);
            let bootstrap_term = Term::new(1);
            local_state.store_term_if_increased(bootstrap_term)?;
            write_ahead_log.append(WriteAheadLogEntry {
                term: bootstrap_term,
                payload: EntryPayload::Membership(initial_membership),
            })?;
        } else {
            slog::info!(logger, "Log already has entries. Ignoring bootstrap.");
        }
    }

    let (mut cluster_tracker, applied_membership) = match &latest_snapshot {
        Some(snapshot) => (
            ClusterTracker::new(
                me.clone(),
                Some(snapshot.last_included_index),
                snapshot.membership.clone(),
            ),
            snapshot.membership.clone(),
        ),
        None => (ClusterTracker::new(me.clone(), None, Membership::empty()), Membership::empty()),
    };
    for (index, membership) in write_ahead_log.membership_entries()? {
        cluster_tracker.on_membership_appended(index, membership);
    }
    slog::info!(logger, "Starting with configuration {:?}", cluster_tracker.current());

    let (election_state, election_state_change_listener) = ElectionState::new_follower(
        ElectionConfig {
            my_replica_id: me.replica_id().clone(),
            leader_heartbeat_duration: timings.leader_heartbeat_duration,
            follower_min_timeout: timings.follower_min_timeout,
            follower_max_timeout: timings.follower_max_timeout,
        },
        actor_client.clone(),
    );

    let replica = Replica::new(ReplicaConfig {
        logger,
        cluster_tracker,
        local_state,
        election_state,
        write_ahead_log,
        peer_connector,
        snapshot_store,
        actor_client,
        append_entries_timeout: timings.append_entries_timeout,
        max_entries_per_append: timings.max_entries_per_append,
        request_vote_retry_backoff: timings.leader_heartbeat_duration,
        server_shutdown_handle,
    });

    Ok(ReplicaParts {
        replica,
        commit_stream,
        election_state_change_listener,
        latest_snapshot,
        applied_membership,
    })
}
