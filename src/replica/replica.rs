use crate::actor::WeakActorClient;
use crate::commitlog::{Index, Log};
use crate::replica::election::{ElectionState, PeerStateUpdate};
use crate::replica::local_state::{PersistentLocalState, Term};
use crate::replica::peer_client::{PeerClient, PeerConnector};
use crate::replica::peers::{ClusterTracker, ReplicaId, ReplicaMetadata};
use crate::replica::replica_api::{
    AppendEntriesError, AppendEntriesInput, AppendEntriesOutput, AppendEntriesReplyFromPeer,
    EnqueueForReplicationError, EnqueueForReplicationInput, EnqueueForReplicationOutput, InstallSnapshotError,
    InstallSnapshotInput, InstallSnapshotOutput, InstallSnapshotReplyFromPeer, Proposal, RequestVoteError,
    RequestVoteInput, RequestVoteOutput, RequestVoteReplyFromPeer, TermOutOfDateInfo,
};
use crate::replica::write_ahead_log::{ApplyOutcome, EntryPayload, WriteAheadLog, WriteAheadLogEntry};
use crate::replica::{
    AppendEntriesReplyFromPeerDescriptor, AppendEntriesReplyFromPeerError, ElectionStateSnapshot, LeaderRedirectInfo,
    LeaderTimerTick, ReplicaStatus, RequestVoteResult,
};
use crate::server::ShutdownHandle;
use crate::snapshot::{Snapshot, SnapshotStore};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::{cmp, io};
use tokio::time::Duration;

pub(crate) struct ReplicaConfig<L>
where
    L: Log<WriteAheadLogEntry>,
{
    pub logger: slog::Logger,
    pub cluster_tracker: ClusterTracker,
    pub local_state: Box<dyn PersistentLocalState + Send>,
    pub election_state: ElectionState,
    pub write_ahead_log: WriteAheadLog<L>,
    pub peer_connector: Arc<dyn PeerConnector>,
    pub snapshot_store: Arc<dyn SnapshotStore>,
    pub actor_client: WeakActorClient,
    pub append_entries_timeout: Duration,
    pub max_entries_per_append: usize,
    pub request_vote_retry_backoff: Duration,
    pub server_shutdown_handle: Option<ShutdownHandle>,
}

pub(crate) struct Replica<L>
where
    L: Log<WriteAheadLogEntry>,
{
    logger: slog::Logger,
    my_replica_id: ReplicaId,
    cluster_tracker: ClusterTracker,
    local_state: Box<dyn PersistentLocalState + Send>,
    election_state: ElectionState,
    write_ahead_log: WriteAheadLog<L>,
    peer_connector: Arc<dyn PeerConnector>,
    peer_clients: HashMap<ReplicaId, (String, Arc<dyn PeerClient>)>,
    snapshot_store: Arc<dyn SnapshotStore>,
    actor_client: WeakActorClient,
    append_entries_timeout: Duration,
    max_entries_per_append: usize,
    request_vote_retry_backoff: Duration,
    // Index of the no-op this replica appended when it last became leader. Membership changes wait
    // until it commits.
    leader_noop_index: Option<Index>,
    // Set on any storage failure. The actor stops once it sees this.
    failed: bool,
    _server_shutdown_handle: Option<ShutdownHandle>,
}

impl<L> Replica<L>
where
    L: Log<WriteAheadLogEntry> + 'static,
{
    pub(crate) fn new(config: ReplicaConfig<L>) -> Self {
        let my_replica_id = config.cluster_tracker.my_replica_id().clone();
        let logger = config
            .logger
            .new(slog::o!("ReplicaId" => format!("{:?}", my_replica_id)));

        Replica {
            logger,
            my_replica_id,
            cluster_tracker: config.cluster_tracker,
            local_state: config.local_state,
            election_state: config.election_state,
            write_ahead_log: config.write_ahead_log,
            peer_connector: config.peer_connector,
            peer_clients: HashMap::new(),
            snapshot_store: config.snapshot_store,
            actor_client: config.actor_client,
            append_entries_timeout: config.append_entries_timeout,
            max_entries_per_append: config.max_entries_per_append,
            request_vote_retry_backoff: config.request_vote_retry_backoff,
            leader_noop_index: None,
            failed: false,
            _server_shutdown_handle: config.server_shutdown_handle,
        }
    }

    pub(crate) fn has_failed(&self) -> bool {
        self.failed
    }

    fn fail(&mut self, context: &str, error: &io::Error) {
        slog::crit!(self.logger, "Storage failure while {}: {:?}", context, error);
        self.failed = true;
    }

    fn my_leader_info(&self) -> LeaderRedirectInfo {
        let me = self.cluster_tracker.my_metadata();
        LeaderRedirectInfo {
            replica_id: me.replica_id().clone(),
            raft_address: me.raft_address().to_string(),
        }
    }

    pub(crate) fn status(&self) -> ReplicaStatus {
        ReplicaStatus {
            replica_id: self.my_replica_id.clone(),
            term: self.local_state.current_term(),
            election_state: self.election_state.current_state(),
            commit_index: self.write_ahead_log.commit_index(),
            latest_index: self.write_ahead_log.latest_index(),
            snapshot_index: self.write_ahead_log.snapshot_boundary().map(|(_, index)| index),
            membership: self.cluster_tracker.current().clone(),
        }
    }

    pub(crate) fn handle_enqueue_for_replication(
        &mut self,
        input: EnqueueForReplicationInput,
    ) -> Result<EnqueueForReplicationOutput, EnqueueForReplicationError> {
        // Leader check
        match self.election_state.current_state() {
            ElectionStateSnapshot::Leader => { /* carry on */ }
            ElectionStateSnapshot::Follower(leader) => {
                return Err(EnqueueForReplicationError::LeaderRedirect(leader));
            }
            ElectionStateSnapshot::Candidate | ElectionStateSnapshot::FollowerNoLeader => {
                return Err(EnqueueForReplicationError::NoLeader);
            }
        }

        let term = self.local_state.current_term();
        let payload = match input.proposal {
            Proposal::Command(data) => EntryPayload::Command(data),
            Proposal::AddVoter {
                replica_id,
                raft_address,
            } => {
                self.check_membership_change_allowed()?;
                let mut membership = self.cluster_tracker.current().clone();
                if membership.address(&replica_id) == Some(raft_address.as_str()) {
                    slog::info!(self.logger, "{:?} is already a voter. Nothing to do.", replica_id);
                    let _ = input.applied_notifier.send(ApplyOutcome::Applied);
                    return Ok(EnqueueForReplicationOutput {
                        enqueued_term: term,
                        enqueued_index: None,
                    });
                }
                membership.add(replica_id, raft_address);
                EntryPayload::Membership(membership)
            }
            Proposal::RemoveVoter { replica_id } => {
                self.check_membership_change_allowed()?;
                let mut membership = self.cluster_tracker.current().clone();
                if !membership.remove(&replica_id) {
                    slog::info!(self.logger, "{:?} is not a voter. Nothing to do.", replica_id);
                    let _ = input.applied_notifier.send(ApplyOutcome::Applied);
                    return Ok(EnqueueForReplicationOutput {
                        enqueued_term: term,
                        enqueued_index: None,
                    });
                }
                if membership.is_empty() {
                    return Err(EnqueueForReplicationError::LastVoter);
                }
                EntryPayload::Membership(membership)
            }
        };

        // > If command received from client: append entry to local log,
        // > respond after entry applied to state machine (§5.3)
        let appended_index = match self.append_to_local_log(term, payload) {
            Ok(index) => index,
            Err(e) => {
                self.fail("appending a proposal", &e);
                return Err(EnqueueForReplicationError::LocalIoError(e));
            }
        };
        self.write_ahead_log
            .register_notifier(appended_index, term, input.applied_notifier);

        self.replicate_to_all_peers(term);
        self.try_advance_commit_index();

        Ok(EnqueueForReplicationOutput {
            enqueued_term: term,
            enqueued_index: Some(appended_index),
        })
    }

    /// Single-server changes only: the previous change, and this leader's no-op, must be committed
    /// before another change is proposed.
    fn check_membership_change_allowed(&self) -> Result<(), EnqueueForReplicationError> {
        let commit_index = self.write_ahead_log.commit_index();
        let committed = |index: Option<Index>| match (index, commit_index) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(index), Some(commit_index)) => index <= commit_index,
        };

        if committed(self.cluster_tracker.current_config_index()) && committed(self.leader_noop_index) {
            Ok(())
        } else {
            Err(EnqueueForReplicationError::MembershipChangeInProgress)
        }
    }

    /// Leader path. Membership entries take effect as soon as they're appended.
    fn append_to_local_log(&mut self, term: Term, payload: EntryPayload) -> Result<Index, io::Error> {
        let membership = match &payload {
            EntryPayload::Membership(m) => Some(m.clone()),
            _ => None,
        };

        let appended_index = self.write_ahead_log.append(WriteAheadLogEntry { term, payload })?;

        if let Some(membership) = membership {
            slog::info!(
                self.logger,
                "Appended membership change at {:?}: {:?}",
                appended_index,
                membership
            );
            self.cluster_tracker
                .on_membership_appended(appended_index, membership);
            self.on_membership_changed();
        }

        Ok(appended_index)
    }

    fn on_membership_changed(&mut self) {
        let peer_ids = self.cluster_tracker.peer_ids();
        self.election_state.sync_leader_peers(
            self.local_state.current_term(),
            &peer_ids,
            self.write_ahead_log.latest_index(),
        );
        self.peer_clients.retain(|id, _| peer_ids.contains(id));
    }

    fn peer_client(&mut self, peer: &ReplicaMetadata) -> Arc<dyn PeerClient> {
        if let Some((address, client)) = self.peer_clients.get(peer.replica_id()) {
            if address == peer.raft_address() {
                return client.clone();
            }
        }

        let client = self.peer_connector.connect(peer.replica_id(), peer.raft_address());
        self.peer_clients.insert(
            peer.replica_id().clone(),
            (peer.raft_address().to_string(), client.clone()),
        );
        client
    }

    pub(crate) fn server_handle_request_vote(
        &mut self,
        input: RequestVoteInput,
    ) -> Result<RequestVoteOutput, RequestVoteError> {
        // A replica that was removed (and never learned it) shouldn't be able to depose the
        // leader by bumping everyone's term.
        if !self.cluster_tracker.contains_member(&input.candidate_id) {
            slog::info!(
                self.logger,
                "Not granting vote. Candidate {:?} is not a voter.",
                input.candidate_id
            );
            return Ok(RequestVoteOutput { vote_granted: false });
        }

        // Read our local term/vote state as 1 atomic action.
        let (current_term, mut opt_voted_for) = self.local_state.voted_for_current_term();

        // 1. Reply false if term < currentTerm (§5.1)
        if input.candidate_term < current_term {
            slog::info!(self.logger, "Not granting vote. Client term is out of date.");
            return Err(RequestVoteError::RequestTermOutOfDate(TermOutOfDateInfo {
                current_term,
            }));
        }

        // > If RPC request or response contains term T > currentTerm:
        // > set currentTerm = T, convert to follower (§5.1)
        let increased = match self.local_state.store_term_if_increased(input.candidate_term) {
            Ok(increased) => increased,
            Err(e) => {
                self.fail("storing term", &e);
                return Err(RequestVoteError::ServerIoError(e));
            }
        };
        if increased {
            self.election_state.transition_to_follower(None);
            slog::info!(
                self.logger,
                "Observed increased term in RequestVote call. Transitioning to follower. Election state: {:?}",
                self.election_state
            );
            // If we've increased the term, it means we haven't voted for anyone this term.
            opt_voted_for = None;
        }

        // 2. If votedFor is null or candidateId, and candidate’s log is at
        // least as up-to-date as receiver’s log, grant vote (§5.2, §5.4).

        // If votedFor is null or candidateId, and...
        if let Some(voted_for) = opt_voted_for {
            if *voted_for != input.candidate_id {
                slog::info!(self.logger, "Not granting vote. We already voted for {:?}.", voted_for);
                return Ok(RequestVoteOutput { vote_granted: false });
            }
        }

        // ...and candidate’s log is at least as up-to-date as receiver’s log...
        if !self.is_candidate_log_gte_mine(input.candidate_last_log_entry) {
            slog::info!(self.logger, "Not granting vote. Candidate log is out of date.");
            return Ok(RequestVoteOutput { vote_granted: false });
        }

        // ...grant vote
        slog::info!(self.logger, "Voting for {:?}.", input.candidate_id);
        let cas_success = match self
            .local_state
            .store_vote_for_term_if_unvoted(input.candidate_term, input.candidate_id.clone())
        {
            Ok(success) => success,
            Err(e) => {
                self.fail("storing vote", &e);
                return Err(RequestVoteError::ServerIoError(e));
            }
        };

        if cas_success {
            // Granting a vote counts as hearing from a would-be leader.
            self.election_state.reset_timeout_if_follower();
            return Ok(RequestVoteOutput { vote_granted: true });
        }

        // CAS failed, which means we already voted this term. Grant only if it was the same
        // candidate retrying.
        if let (reread_current_term, Some(reread_voted_for)) = self.local_state.voted_for_current_term() {
            if reread_current_term == input.candidate_term && reread_voted_for.as_ref() == &input.candidate_id {
                return Ok(RequestVoteOutput { vote_granted: true });
            }
        }

        slog::info!(self.logger, "Not granting vote. Lost vote CAS.");
        Ok(RequestVoteOutput { vote_granted: false })
    }

    fn is_candidate_log_gte_mine(&self, candidate_last_entry: Option<(Term, Index)>) -> bool {
        // > Raft determines which of two logs is more up-to-date
        // > by comparing the index and term of the last entries in the
        // > logs. If the logs have last entries with different terms, then
        // > the log with the later term is more up-to-date. If the logs
        // > end with the same term, then whichever log is longer is
        // > more up-to-date.
        match (self.write_ahead_log.latest_entry(), candidate_last_entry) {
            (None, None) => true,
            (Some(_), None) => false,
            (None, Some(_)) => true,
            (
                Some((my_last_entry_term, my_last_entry_index)),
                Some((candidate_last_entry_term, candidate_last_entry_index)),
            ) => {
                if candidate_last_entry_term > my_last_entry_term {
                    return true;
                } else if candidate_last_entry_term < my_last_entry_term {
                    return false;
                }

                candidate_last_entry_index >= my_last_entry_index
            }
        }
    }

    pub(crate) fn handle_request_vote_reply_from_peer(&mut self, reply: RequestVoteReplyFromPeer) {
        let current_term = self.local_state.current_term();
        if current_term != reply.term {
            slog::info!(
                self.logger,
                "Received vote for outdated term {:?}, current term: {:?}.",
                reply.term,
                current_term,
            );
            return;
        }

        match reply.result {
            RequestVoteResult::VoteGranted => {
                if !self.cluster_tracker.contains_member(&reply.peer_id) {
                    slog::info!(self.logger, "Ignoring vote from non-voter {:?}", reply.peer_id);
                    return;
                }
                let num_votes_received = match self.election_state.add_vote_if_candidate(reply.peer_id) {
                    Some(v) => v,
                    None => {
                        slog::info!(
                            self.logger,
                            "Received vote for term {:?} after transitioning to a election state: {:?}",
                            reply.term,
                            self.election_state,
                        );
                        return;
                    }
                };

                let num_voting_replicas = self.cluster_tracker.num_voting_replicas();
                slog::info!(
                    self.logger,
                    "Received {}/{} votes for term {:?}",
                    num_votes_received,
                    num_voting_replicas,
                    reply.term,
                );

                if num_votes_received >= Self::get_majority_vote_count(num_voting_replicas) {
                    self.become_leader(reply.term);
                }
            }
            RequestVoteResult::VoteNotGranted => {
                slog::info!(
                    self.logger,
                    "Vote not granted from {:?} for term {:?}",
                    reply.peer_id,
                    reply.term,
                );
            }
            RequestVoteResult::StaleTerm { new_term } => {
                match self.local_state.store_term_if_increased(new_term) {
                    Ok(true) => {
                        slog::info!(
                            self.logger,
                            "Peer {:?} is on newer term {:?}. Transitioning to follower.",
                            reply.peer_id,
                            new_term
                        );
                        self.election_state.transition_to_follower(None);
                    }
                    Ok(false) => {}
                    Err(e) => self.fail("storing term", &e),
                }
            }
            RequestVoteResult::RetryableFailure | RequestVoteResult::MalformedReply => {
                if !matches!(self.election_state.current_state(), ElectionStateSnapshot::Candidate) {
                    return;
                }
                match self.cluster_tracker.metadata(&reply.peer_id) {
                    Some(peer) => self.spawn_request_vote(peer, reply.term, Some(self.request_vote_retry_backoff)),
                    None => slog::warn!(
                        self.logger,
                        "Peer {:?} not found while retrying RequestVote",
                        reply.peer_id
                    ),
                }
            }
        }
    }

    fn get_majority_vote_count(num_voting_replicas: usize) -> usize {
        (num_voting_replicas / 2) + 1
    }

    fn become_leader(&mut self, term: Term) {
        self.election_state.transition_to_leader(
            term,
            self.cluster_tracker.peer_ids(),
            self.write_ahead_log.latest_index(),
        );
        slog::info!(self.logger, "Became leader for term {:?}", term);

        // Entries from earlier terms can only commit once an entry from this term does.
        match self.append_to_local_log(term, EntryPayload::Noop) {
            Ok(index) => {
                self.leader_noop_index = Some(index);
                self.replicate_to_all_peers(term);
                self.try_advance_commit_index();
            }
            Err(e) => self.fail("appending leader no-op", &e),
        }
    }

    pub(crate) fn handle_follower_timeout(&mut self) {
        if self.election_state.is_leader() {
            return;
        }
        if !self.cluster_tracker.am_i_voter() {
            slog::debug!(self.logger, "Follower timeout, but not a voter. Not campaigning.");
            return;
        }

        // Write-ahead log style: Vote for self on local state before transitioning to candidate.
        let new_term = match self.local_state.increment_term_and_vote_for_self() {
            Ok(term) => term,
            Err(e) => {
                self.fail("starting election", &e);
                return;
            }
        };
        let num_votes = self.election_state.transition_to_candidate_and_vote_for_self();
        slog::info!(
            self.logger,
            "Timed out as follower. Changed to candidate for term {:?}. Election state: {:?}",
            new_term,
            self.election_state,
        );

        if num_votes >= Self::get_majority_vote_count(self.cluster_tracker.num_voting_replicas()) {
            self.become_leader(new_term);
            return;
        }

        let peers: Vec<ReplicaMetadata> = self.cluster_tracker.iter_peers().collect();
        for peer in peers {
            self.spawn_request_vote(peer, new_term, None);
        }
    }

    fn spawn_request_vote(&mut self, peer: ReplicaMetadata, term: Term, delay: Option<Duration>) {
        let client = self.peer_client(&peer);
        let input = RequestVoteInput {
            candidate_term: term,
            candidate_id: self.my_replica_id.clone(),
            candidate_last_log_entry: self.write_ahead_log.latest_entry(),
        };
        let actor_client = self.actor_client.clone();
        let peer_id = peer.replica_id().clone();
        let rpc_timeout = self.append_entries_timeout;

        tokio::task::spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Self::call_peer_request_vote(client, input, rpc_timeout, actor_client, peer_id).await;
        });
    }

    async fn call_peer_request_vote(
        peer_client: Arc<dyn PeerClient>,
        input: RequestVoteInput,
        rpc_timeout: Duration,
        callback: WeakActorClient,
        peer_id: ReplicaId,
    ) {
        let term = input.candidate_term;
        let result = tokio::time::timeout(rpc_timeout, peer_client.request_vote(input))
            .await
            .unwrap_or(RequestVoteResult::RetryableFailure);

        let _ = callback
            .notify_request_vote_reply_from_peer(RequestVoteReplyFromPeer { peer_id, term, result })
            .await;
    }

    /// Accepts `leader` as the leader for `leader_term`, or returns our newer term.
    fn observe_leader(&mut self, leader_term: Term, leader: &LeaderRedirectInfo) -> Result<(), ObserveLeaderError> {
        // 1. Reply false if term < currentTerm (§5.1)
        let current_term = self.local_state.current_term();
        if leader_term < current_term {
            return Err(ObserveLeaderError::StaleTerm(current_term));
        }

        // > If RPC request or response contains term T > currentTerm:
        // > set currentTerm = T, convert to follower (§5.1)
        let increased = match self.local_state.store_term_if_increased(leader_term) {
            Ok(increased) => increased,
            Err(e) => {
                self.fail("storing term", &e);
                return Err(ObserveLeaderError::Io(e));
            }
        };
        if increased {
            self.election_state.transition_to_follower(Some(leader.clone()));
        } else {
            self.election_state.set_leader_if_unknown(leader);
        }

        self.election_state.reset_timeout_if_follower();

        Ok(())
    }

    pub(crate) fn server_handle_append_entries(
        &mut self,
        input: AppendEntriesInput,
    ) -> Result<AppendEntriesOutput, AppendEntriesError> {
        self.observe_leader(input.leader_term, &input.leader)
            .map_err(|e| match e {
                ObserveLeaderError::StaleTerm(current_term) => {
                    AppendEntriesError::ClientTermOutOfDate(TermOutOfDateInfo { current_term })
                }
                ObserveLeaderError::Io(e) => AppendEntriesError::ServerIoError(e),
            })?;

        match self.append_leader_entries(input) {
            Ok(result) => result,
            Err(e) => {
                self.fail("appending leader entries", &e);
                Err(AppendEntriesError::ServerIoError(e))
            }
        }
    }

    // Outer Result is a local storage failure; inner is the reply to the leader.
    fn append_leader_entries(
        &mut self,
        input: AppendEntriesInput,
    ) -> Result<Result<AppendEntriesOutput, AppendEntriesError>, io::Error> {
        let snapshot_boundary = self.write_ahead_log.snapshot_boundary().map(|(_, index)| index);
        let is_compacted = |index: Index| matches!(snapshot_boundary, Some(b) if index <= b);

        // 2. Reply false if [my] log doesn't contain an entry at [leader's]
        // prevLogIndex whose term matches [leader's] prevLogTerm (§5.3)
        if let Some((leader_prev_entry_term, leader_prev_entry_index)) = input.leader_previous_log_entry {
            // Anything we've compacted is committed, so it matches the leader.
            if !is_compacted(leader_prev_entry_index) {
                match self.write_ahead_log.term_at(leader_prev_entry_index)? {
                    Some(term) if term == leader_prev_entry_term => {}
                    Some(_) => {
                        return Ok(Err(AppendEntriesError::ServerMissingPreviousLogEntry {
                            last_log_index: leader_prev_entry_index.checked_minus(1),
                        }))
                    }
                    None => {
                        return Ok(Err(AppendEntriesError::ServerMissingPreviousLogEntry {
                            last_log_index: self.write_ahead_log.latest_index(),
                        }))
                    }
                }
            }
        }

        // 3. If [my] existing entry conflicts with [leader's new entries]
        // (same index but different terms), delete [my] existing entry and
        // all that follow it (§5.3)
        // 4. Append any new entries not already in the log
        let mut index_of_last_new_entry = input.leader_previous_log_entry.map(|(_, index)| index);
        let mut membership_changed = false;
        for new_entry in input.new_entries {
            let next_entry_index = index_of_last_new_entry
                .map(|i| i.plus(1))
                .unwrap_or_else(Index::start_index);
            index_of_last_new_entry = Some(next_entry_index);

            if is_compacted(next_entry_index) {
                continue;
            }

            match self.write_ahead_log.term_at(next_entry_index)? {
                // 4. (no-op)
                Some(existing_term) if existing_term == new_entry.term => continue,
                // 3. (delete)
                Some(_) => {
                    slog::info!(self.logger, "Truncating conflicting log suffix from {:?}", next_entry_index);
                    self.write_ahead_log.truncate(next_entry_index)?;
                    membership_changed |= self.cluster_tracker.on_log_truncated(next_entry_index);
                }
                None => {}
            }

            // 4. (append)
            let membership = match &new_entry.payload {
                EntryPayload::Membership(m) => Some(m.clone()),
                _ => None,
            };
            let appended_index = self.write_ahead_log.append(WriteAheadLogEntry {
                term: new_entry.term,
                payload: new_entry.payload,
            })?;
            assert_eq!(
                appended_index, next_entry_index,
                "Appended log entry to unexpected index."
            );
            if let Some(membership) = membership {
                self.cluster_tracker
                    .on_membership_appended(appended_index, membership);
                membership_changed = true;
            }
        }

        // 5. If leaderCommit > commitIndex, set commitIndex = min(leaderCommit, index of last new entry)
        if let (Some(leader_commit_index), Some(last_new)) = (input.leader_commit_index, index_of_last_new_entry) {
            self.write_ahead_log
                .ratchet_fwd_commit_index_if_changed(cmp::min(leader_commit_index, last_new));
        }

        // > If commitIndex > lastApplied: increment lastApplied, apply
        // > log[lastApplied] to state machine (§5.3)
        self.write_ahead_log.publish_committed_entries()?;

        if membership_changed {
            self.on_membership_changed();
        }

        Ok(Ok(AppendEntriesOutput {}))
    }

    pub(crate) fn server_handle_install_snapshot(
        &mut self,
        input: InstallSnapshotInput,
    ) -> Result<InstallSnapshotOutput, InstallSnapshotError> {
        self.observe_leader(input.leader_term, &input.leader)
            .map_err(|e| match e {
                ObserveLeaderError::StaleTerm(current_term) => {
                    InstallSnapshotError::ClientTermOutOfDate(TermOutOfDateInfo { current_term })
                }
                ObserveLeaderError::Io(e) => InstallSnapshotError::ServerIoError(e),
            })?;

        let snapshot = input.snapshot;
        let through = snapshot.last_included_index;
        if matches!(self.write_ahead_log.commit_index(), Some(ci) if ci >= through) {
            slog::info!(
                self.logger,
                "Already committed through {:?}. Ignoring snapshot.",
                through
            );
            return Ok(InstallSnapshotOutput {});
        }

        match self.install_snapshot(snapshot) {
            Ok(()) => Ok(InstallSnapshotOutput {}),
            Err(e) => {
                self.fail("installing snapshot", &e);
                Err(InstallSnapshotError::ServerIoError(e))
            }
        }
    }

    fn install_snapshot(&mut self, snapshot: Arc<Snapshot>) -> Result<(), io::Error> {
        let through = snapshot.last_included_index;
        slog::info!(self.logger, "Installing leader snapshot through {:?}", through);

        self.snapshot_store.persist_if_newer(&snapshot)?;
        let kept_suffix = self.write_ahead_log.install_snapshot(snapshot.clone())?;
        if kept_suffix {
            self.cluster_tracker.on_log_compacted(through);
        } else {
            self.cluster_tracker
                .reset_to_snapshot(through, snapshot.membership.clone());
        }
        self.write_ahead_log.publish_committed_entries()?;
        self.on_membership_changed();

        Ok(())
    }

    pub(crate) fn handle_append_entries_reply_from_peer(&mut self, reply: AppendEntriesReplyFromPeer) {
        let logger = self
            .logger
            .new(slog::o!("Peer" => format!("{:?}", reply.descriptor.peer_id), "SeqNo" => reply.descriptor.seq_no));
        slog::debug!(logger, "AE reply from peer result: {:?}", reply.result);

        // 1. Check for stale term rejection
        let peer_log_update = match reply.result {
            Err(AppendEntriesReplyFromPeerError::StaleTerm { new_term }) => {
                match self.step_down_if_stale(&logger, new_term) {
                    true => return,
                    false => PeerStateUpdate::OtherError,
                }
            }
            Err(AppendEntriesReplyFromPeerError::PeerMissingPreviousLogEntry { last_log_index }) => {
                slog::info!(logger, "Peer is missing previous log entry. Peer's last index: {:?}", last_log_index);
                PeerStateUpdate::PeerLogBehind {
                    peer_last_log_index: last_log_index,
                }
            }
            Err(AppendEntriesReplyFromPeerError::RetryableFailure(err_msg)) => {
                slog::warn!(logger, "AE failure: {:?}", err_msg);
                PeerStateUpdate::OtherError
            }
            Ok(_) => {
                slog::debug!(logger, "Successful AE reply");
                PeerStateUpdate::Success {
                    previous_log_entry: reply.descriptor.previous_log_entry_index,
                    num_entries_replicated: reply.descriptor.num_log_entries,
                }
            }
        };

        let descriptor = reply.descriptor;
        self.handle_peer_update(
            &logger,
            descriptor.peer_id,
            descriptor.term,
            descriptor.seq_no,
            peer_log_update,
        );
    }

    pub(crate) fn handle_install_snapshot_reply_from_peer(&mut self, reply: InstallSnapshotReplyFromPeer) {
        let logger = self
            .logger
            .new(slog::o!("Peer" => format!("{:?}", reply.peer_id), "SeqNo" => reply.seq_no));
        slog::debug!(logger, "InstallSnapshot reply from peer result: {:?}", reply.result);

        let peer_log_update = match reply.result {
            Ok(_) => {
                slog::info!(logger, "Peer installed snapshot through {:?}", reply.last_included_index);
                PeerStateUpdate::SnapshotInstalled {
                    last_included_index: reply.last_included_index,
                }
            }
            Err(AppendEntriesReplyFromPeerError::StaleTerm { new_term }) => {
                match self.step_down_if_stale(&logger, new_term) {
                    true => return,
                    false => PeerStateUpdate::OtherError,
                }
            }
            Err(e) => {
                slog::warn!(logger, "InstallSnapshot failure: {:?}", e);
                PeerStateUpdate::OtherError
            }
        };

        self.handle_peer_update(&logger, reply.peer_id, reply.term, reply.seq_no, peer_log_update);
    }

    /// Returns true if we stepped down.
    fn step_down_if_stale(&mut self, logger: &slog::Logger, new_term: Term) -> bool {
        slog::warn!(logger, "Rejected by peer because my term is stale.");
        match self.local_state.store_term_if_increased(new_term) {
            Ok(true) => {
                self.election_state.transition_to_follower(None);
                slog::info!(logger, "Transitioned to follower.");
                true
            }
            Ok(false) => {
                slog::warn!(logger, "Treating non-incrementing StaleTerm err as generic failure.");
                false
            }
            Err(e) => {
                self.fail("storing term", &e);
                true
            }
        }
    }

    fn handle_peer_update(
        &mut self,
        logger: &slog::Logger,
        peer_id: ReplicaId,
        term: Term,
        seq_no: u64,
        update: PeerStateUpdate,
    ) {
        let current_term = self.local_state.current_term();
        if current_term != term {
            slog::info!(
                logger,
                "Received reply for outdated term {:?}, but we're on term {:?}",
                term,
                current_term
            );
            return;
        }

        let made_progress = !matches!(update, PeerStateUpdate::OtherError);

        // 2. Update peer log tracker
        let next_index = match self.election_state.leader_state_mut() {
            None => {
                slog::info!(logger, "No longer leader");
                return;
            }
            Some(leader_state) => match leader_state.peer_state_mut(&peer_id) {
                None => {
                    slog::info!(logger, "Peer {:?} is no longer tracked", peer_id);
                    return;
                }
                Some(peer_state) => {
                    peer_state.handle_append_entries_result(logger, seq_no, update);
                    peer_state.next_and_previous_log_index().0
                }
            },
        };

        // 3. Check for majority replication and apply new commits.
        self.try_advance_commit_index();

        // 4. Enqueue next peer timer event.
        // > If last log index ≥ nextIndex for a follower: send
        // > AppendEntries RPC with log entries starting at nextIndex
        // Failures wait for the next heartbeat instead of retrying hot.
        let behind = matches!(self.write_ahead_log.latest_index(), Some(last) if last >= next_index);
        if made_progress && behind && self.election_state.is_leader() {
            let actor_client = self.actor_client.clone();
            let tick = LeaderTimerTick { peer_id, term };
            tokio::task::spawn(async move {
                let _ = actor_client.leader_timer(tick).await;
            });
        }
    }

    /// > If there exists an N such that N > commitIndex, a majority
    /// > of matchIndex[i] ≥ N, and log[N].term == currentTerm:
    /// > set commitIndex = N (§5.3, §5.4).
    ///
    /// Only voters in the current configuration count, which includes this leader only while it's
    /// still a voter.
    fn try_advance_commit_index(&mut self) {
        let voters_matched_index: Vec<Option<Index>> = match self.election_state.leader_state() {
            None => return,
            Some(leader_state) => self
                .cluster_tracker
                .current()
                .voter_ids()
                .map(|id| match id == &self.my_replica_id {
                    true => self.write_ahead_log.latest_index(),
                    false => leader_state.matched(id),
                })
                .collect(),
        };

        if let Some(tentative_new_commit_index) = Self::get_cluster_commit_index(voters_matched_index) {
            let current_term = self.local_state.current_term();
            match self
                .write_ahead_log
                .ratchet_fwd_commit_index_if_valid(tentative_new_commit_index, current_term)
            {
                Ok(true) => slog::debug!(self.logger, "Commit index is now {:?}", tentative_new_commit_index),
                Ok(false) => {}
                Err(e) => {
                    self.fail("confirming new commit index", &e);
                    return;
                }
            }
        }

        if let Err(e) = self.write_ahead_log.publish_committed_entries() {
            self.fail("publishing committed entries", &e);
            return;
        }

        // A leader that removed itself keeps leading until that removal is committed.
        let removal_committed = matches!(
            (self.cluster_tracker.current_config_index(), self.write_ahead_log.commit_index()),
            (Some(config_index), Some(commit_index)) if config_index <= commit_index
        );
        if !self.cluster_tracker.am_i_voter() && removal_committed {
            slog::info!(self.logger, "My removal from the cluster is committed. Stepping down.");
            self.election_state.transition_to_follower(None);
        }
    }

    /// Takes the matched index of every voter. Returns the highest index a majority has.
    fn get_cluster_commit_index(mut voters_matched_indexes: Vec<Option<Index>>) -> Option<Index> {
        if voters_matched_indexes.is_empty() {
            return None;
        }
        voters_matched_indexes.sort_by_key(|matched| match matched {
            None => 0u64,
            Some(m) => m.as_u64(),
        });

        // Everything at or right of `quorum_idx` makes a majority.
        let majority = Self::get_majority_vote_count(voters_matched_indexes.len());
        let quorum_idx = voters_matched_indexes.len() - majority;

        voters_matched_indexes.remove(quorum_idx)
    }

    fn replicate_to_all_peers(&mut self, term: Term) {
        let peer_ids = match self.election_state.leader_state() {
            Some(leader_state) => leader_state.peer_ids(),
            None => return,
        };
        for peer_id in peer_ids {
            self.handle_leader_timer(LeaderTimerTick { peer_id, term });
        }
    }

    pub(crate) fn handle_leader_timer(&mut self, input: LeaderTimerTick) {
        let current_term = self.local_state.current_term();
        if current_term != input.term {
            slog::debug!(
                self.logger,
                "Received leader heartbeat for outdated term {:?}, current term: {:?}",
                input.term,
                current_term
            );
            return;
        }

        let peer = match self.cluster_tracker.metadata(&input.peer_id) {
            Some(peer) => peer,
            None => {
                slog::info!(self.logger, "Peer {:?} is no longer a voter", input.peer_id);
                return;
            }
        };

        match self.try_handle_leader_timer_for_peer(peer, current_term) {
            Ok(_) => {}
            Err(HandleLeaderTimerError::NoLongerLeader) => {
                slog::debug!(self.logger, "Received leader timer event but no longer leader.")
            }
            Err(HandleLeaderTimerError::PeerConcurrencyThrottle) => {
                slog::debug!(self.logger, "Outstanding request to peer {:?}", input.peer_id)
            }
            Err(HandleLeaderTimerError::DiskRead(index, ioe)) => {
                slog::error!(self.logger, "Failed to read log entry at index {:?}: {:?}", index, ioe);
                self.fail("reading log for replication", &ioe);
            }
            Err(HandleLeaderTimerError::UnexpectedMissingLogEntry(index)) => {
                slog::error!(
                    self.logger,
                    "LeaderStateTracker is tracking index {:?}, but entry is missing from log.",
                    index
                );
            }
            Err(HandleLeaderTimerError::LeaderStateMissingPeer {
                leader_state_tracker_peers,
            }) => {
                slog::error!(
                    self.logger,
                    "Peer {:?} is a voter but missing in LeaderStateTracker. LeaderStateTracker peers: [{:?}]",
                    input.peer_id,
                    leader_state_tracker_peers,
                )
            }
        }
    }

    fn try_handle_leader_timer_for_peer(
        &mut self,
        peer: ReplicaMetadata,
        current_term: Term,
    ) -> Result<(), HandleLeaderTimerError> {
        let client = self.peer_client(&peer);
        let leader = self.my_leader_info();

        let leader_state = match self.election_state.leader_state_mut() {
            None => return Err(HandleLeaderTimerError::NoLongerLeader),
            Some(leader_state) => leader_state,
        };
        let peer_state = match leader_state.peer_state_mut(peer.replica_id()) {
            Some(ps) => ps,
            None => {
                return Err(HandleLeaderTimerError::LeaderStateMissingPeer {
                    leader_state_tracker_peers: leader_state.peer_ids(),
                })
            }
        };

        let request = leader_timer_handler::new_peer_request(
            current_term,
            leader,
            peer.replica_id().clone(),
            peer_state,
            &self.write_ahead_log,
            self.max_entries_per_append,
        )?;

        let logger = self
            .logger
            .new(slog::o!("Peer" => format!("{:?}", peer.replica_id())));
        match request {
            leader_timer_handler::PeerRequest::AppendEntries(input, descriptor) => {
                tokio::task::spawn(Self::call_peer_append_entries(
                    logger,
                    client,
                    input,
                    self.append_entries_timeout,
                    self.actor_client.clone(),
                    descriptor,
                ));
            }
            leader_timer_handler::PeerRequest::InstallSnapshot(input, seq_no) => {
                slog::info!(
                    logger,
                    "Peer is behind our log start. Sending snapshot through {:?}",
                    input.snapshot.last_included_index
                );
                tokio::task::spawn(Self::call_peer_install_snapshot(
                    client,
                    input,
                    self.append_entries_timeout,
                    self.actor_client.clone(),
                    peer.replica_id().clone(),
                    seq_no,
                ));
            }
        }

        peer_state.reset_heartbeat_timer();

        Ok(())
    }

    async fn call_peer_append_entries(
        logger: slog::Logger,
        peer_client: Arc<dyn PeerClient>,
        input: AppendEntriesInput,
        rpc_timeout: Duration,
        callback: WeakActorClient,
        descriptor: AppendEntriesReplyFromPeerDescriptor,
    ) {
        let result = match tokio::time::timeout(rpc_timeout, peer_client.append_entries(input)).await {
            Ok(result) => result,
            Err(_timeout) => Err(AppendEntriesReplyFromPeerError::RetryableFailure(
                "Timed out calling AppendEntries".into(),
            )),
        };

        if callback
            .notify_append_entries_reply_from_peer(AppendEntriesReplyFromPeer { descriptor, result })
            .await
            .is_err()
        {
            slog::debug!(logger, "Replica exited before AE reply was delivered");
        }
    }

    async fn call_peer_install_snapshot(
        peer_client: Arc<dyn PeerClient>,
        input: InstallSnapshotInput,
        rpc_timeout: Duration,
        callback: WeakActorClient,
        peer_id: ReplicaId,
        seq_no: u64,
    ) {
        let term = input.leader_term;
        let last_included_index = input.snapshot.last_included_index;
        let result = match tokio::time::timeout(rpc_timeout, peer_client.install_snapshot(input)).await {
            Ok(result) => result,
            Err(_timeout) => Err(AppendEntriesReplyFromPeerError::RetryableFailure(
                "Timed out calling InstallSnapshot".into(),
            )),
        };

        let _ = callback
            .notify_install_snapshot_reply_from_peer(InstallSnapshotReplyFromPeer {
                peer_id,
                term,
                seq_no,
                last_included_index,
                result,
            })
            .await;
    }

    /// Our own applier persisted a snapshot. Drop the log prefix it covers.
    pub(crate) fn handle_snapshot_persisted(&mut self, snapshot: Arc<Snapshot>) {
        match self.write_ahead_log.compact_to_snapshot(snapshot) {
            Ok(Some(through)) => {
                slog::info!(self.logger, "Compacted log through {:?}", through);
                self.cluster_tracker.on_log_compacted(through);
            }
            Ok(None) => slog::debug!(self.logger, "Snapshot is not newer than current boundary"),
            Err(e) => self.fail("compacting log", &e),
        }
    }
}

enum ObserveLeaderError {
    StaleTerm(Term),
    Io(io::Error),
}

enum HandleLeaderTimerError {
    NoLongerLeader,
    PeerConcurrencyThrottle,
    DiskRead(Index, io::Error),
    UnexpectedMissingLogEntry(Index),
    LeaderStateMissingPeer {
        leader_state_tracker_peers: HashSet<ReplicaId>,
    },
}

mod leader_timer_handler {
    use crate::commitlog::Log;
    use crate::replica::election::PeerState;
    use crate::replica::replica::HandleLeaderTimerError;
    use crate::replica::write_ahead_log::{WriteAheadLog, WriteAheadLogEntry};
    use crate::replica::{
        AppendEntriesInput, AppendEntriesLogEntry, AppendEntriesReplyFromPeerDescriptor, InstallSnapshotInput,
        LeaderRedirectInfo, ReplicaId, Term,
    };

    pub(super) enum PeerRequest {
        AppendEntries(AppendEntriesInput, AppendEntriesReplyFromPeerDescriptor),
        InstallSnapshot(InstallSnapshotInput, u64),
    }

    pub(super) fn new_peer_request<L>(
        current_term: Term,
        leader: LeaderRedirectInfo,
        peer_id: ReplicaId,
        peer_state: &mut PeerState,
        wal: &WriteAheadLog<L>,
        max_entries: usize,
    ) -> Result<PeerRequest, HandleLeaderTimerError>
    where
        L: Log<WriteAheadLogEntry>,
    {
        // Simplicity vs throughput tradeoff. We're just going to allow 1 outstanding request per
        // peer; no pipelining. Entries are still batched, up to `max_entries` per request.
        if peer_state.has_outstanding_request() {
            return Err(HandleLeaderTimerError::PeerConcurrencyThrottle);
        }

        let (next_index, opt_previous_index) = peer_state.next_and_previous_log_index();

        // The entries this peer needs next were folded into our snapshot.
        if next_index < wal.first_index() {
            let snapshot = wal
                .latest_snapshot()
                .ok_or(HandleLeaderTimerError::UnexpectedMissingLogEntry(next_index))?;
            let seq_no = peer_state.next_seq_no();
            return Ok(PeerRequest::InstallSnapshot(
                InstallSnapshotInput {
                    leader_term: current_term,
                    leader,
                    snapshot,
                },
                seq_no,
            ));
        }

        let leader_previous_log_entry = match opt_previous_index {
            None => None,
            Some(previous_index) => match wal.term_at(previous_index) {
                Ok(Some(term)) => Some((term, previous_index)),
                Ok(None) => return Err(HandleLeaderTimerError::UnexpectedMissingLogEntry(previous_index)),
                Err(e) => return Err(HandleLeaderTimerError::DiskRead(previous_index, e)),
            },
        };

        let new_entries: Vec<AppendEntriesLogEntry> = wal
            .read_range(next_index, max_entries)
            .map_err(|e| HandleLeaderTimerError::DiskRead(next_index, e))?
            .into_iter()
            .map(|entry| AppendEntriesLogEntry {
                term: entry.term,
                payload: entry.payload,
            })
            .collect();

        // Only claim a seq-no once the request can actually be sent.
        let seq_no = peer_state.next_seq_no();
        let descriptor = AppendEntriesReplyFromPeerDescriptor {
            peer_id,
            term: current_term,
            seq_no,
            previous_log_entry_index: opt_previous_index,
            num_log_entries: new_entries.len(),
        };

        let input = AppendEntriesInput {
            leader_term: current_term,
            leader,
            leader_previous_log_entry,
            leader_commit_index: wal.commit_index(),
            new_entries,
        };

        Ok(PeerRequest::AppendEntries(input, descriptor))
    }
}
