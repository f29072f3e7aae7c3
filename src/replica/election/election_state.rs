use crate::actor::WeakActorClient;
use crate::commitlog::Index;
use crate::replica::election::state_change_listener::ElectionStateChangeNotifier;
use crate::replica::election::timers::{FollowerTimerHandle, LeaderTimerHandle};
use crate::replica::election::{state_change_listener, LeaderStateTracker, PeerState};
use crate::replica::{ElectionStateChangeListener, ElectionStateSnapshot, LeaderRedirectInfo, ReplicaId, Term};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

#[derive(Clone)]
pub(crate) struct ElectionConfig {
    pub my_replica_id: ReplicaId,
    pub leader_heartbeat_duration: Duration,
    pub follower_min_timeout: Duration,
    pub follower_max_timeout: Duration,
}

/// ElectionState tracks which role this replica plays and owns the timers that go with the role.
/// Changing role drops the old timers. It decides nothing about terms or logs; the replica does
/// that and tells it which role to take.
pub(crate) struct ElectionState {
    role: Role,
    config: ElectionConfig,
    actor_client: WeakActorClient,
    notifier: ElectionStateChangeNotifier,
}

enum Role {
    Leader {
        tracker: LeaderStateTracker,
    },
    Candidate {
        votes: HashSet<ReplicaId>,
        _election_timer: FollowerTimerHandle,
    },
    Follower {
        leader: Option<LeaderRedirectInfo>,
        election_timer: FollowerTimerHandle,
    },
}

impl ElectionState {
    /// Every replica starts as a follower that doesn't know the leader.
    pub(crate) fn new_follower(
        config: ElectionConfig,
        actor_client: WeakActorClient,
    ) -> (Self, ElectionStateChangeListener) {
        let election_timer = FollowerTimerHandle::spawn_timer_task(
            config.follower_min_timeout,
            config.follower_max_timeout,
            actor_client.clone(),
        );
        let role = Role::Follower {
            leader: None,
            election_timer,
        };
        let (notifier, listener) = state_change_listener::new(role.snapshot());

        let election_state = ElectionState {
            role,
            config,
            actor_client,
            notifier,
        };

        (election_state, listener)
    }

    pub(crate) fn transition_to_follower(&mut self, leader: Option<LeaderRedirectInfo>) {
        let election_timer = self.spawn_election_timer();
        self.change_role(Role::Follower { leader, election_timer });
    }

    /// Returns how many votes we hold, which is just our own.
    pub(crate) fn transition_to_candidate_and_vote_for_self(&mut self) -> usize {
        let mut votes = HashSet::new();
        votes.insert(self.config.my_replica_id.clone());
        let num_votes = votes.len();

        let _election_timer = self.spawn_election_timer();
        self.change_role(Role::Candidate { votes, _election_timer });

        num_votes
    }

    pub(crate) fn transition_to_leader(
        &mut self,
        term: Term,
        peer_ids: HashSet<ReplicaId>,
        previous_log_entry_index: Option<Index>,
    ) {
        let peers: HashMap<ReplicaId, PeerState> = peer_ids
            .into_iter()
            .map(|peer_id| {
                let peer_state = self.new_peer_state(term, peer_id.clone(), previous_log_entry_index);
                (peer_id, peer_state)
            })
            .collect();

        self.change_role(Role::Leader {
            tracker: LeaderStateTracker::new(peers),
        });
    }

    pub(crate) fn current_state(&self) -> ElectionStateSnapshot {
        self.role.snapshot()
    }

    pub(crate) fn is_leader(&self) -> bool {
        matches!(self.role, Role::Leader { .. })
    }

    /// Called whenever we hear from a legitimate leader.
    pub(crate) fn reset_timeout_if_follower(&self) {
        if let Role::Follower { election_timer, .. } = &self.role {
            election_timer.reset_timeout();
        }
    }

    /// A candidate that hears from a leader of its own term steps down.
    pub(crate) fn set_leader_if_unknown(&mut self, leader: &LeaderRedirectInfo) {
        match &mut self.role {
            Role::Follower { leader: known @ None, .. } => {
                known.replace(leader.clone());
                self.notifier.publish(self.role.snapshot());
            }
            Role::Candidate { .. } => self.transition_to_follower(Some(leader.clone())),
            Role::Follower { .. } | Role::Leader { .. } => {}
        }
    }

    /// Returns the number of distinct votes so far, or None if we're no longer a candidate.
    pub(crate) fn add_vote_if_candidate(&mut self, vote_from: ReplicaId) -> Option<usize> {
        match &mut self.role {
            Role::Candidate { votes, .. } => {
                votes.insert(vote_from);
                Some(votes.len())
            }
            _ => None,
        }
    }

    pub(crate) fn leader_state(&self) -> Option<&LeaderStateTracker> {
        match &self.role {
            Role::Leader { tracker } => Some(tracker),
            _ => None,
        }
    }

    pub(crate) fn leader_state_mut(&mut self) -> Option<&mut LeaderStateTracker> {
        match &mut self.role {
            Role::Leader { tracker } => Some(tracker),
            _ => None,
        }
    }

    /// Leader only: start or stop replicating to peers after the voter set changed. Existing
    /// peers keep their progress.
    pub(crate) fn sync_leader_peers(&mut self, term: Term, peer_ids: &HashSet<ReplicaId>, latest_index: Option<Index>) {
        let current = match self.leader_state() {
            Some(tracker) => tracker.peer_ids(),
            None => return,
        };

        let added: Vec<(ReplicaId, PeerState)> = peer_ids
            .difference(&current)
            .map(|peer_id| (peer_id.clone(), self.new_peer_state(term, peer_id.clone(), latest_index)))
            .collect();

        if let Some(tracker) = self.leader_state_mut() {
            for removed in current.difference(peer_ids) {
                tracker.remove_peer(removed);
            }
            for (peer_id, peer_state) in added {
                tracker.insert_peer(peer_id, peer_state);
            }
        }
    }

    fn change_role(&mut self, role: Role) {
        self.role = role;
        self.notifier.publish(self.role.snapshot());
    }

    fn spawn_election_timer(&self) -> FollowerTimerHandle {
        FollowerTimerHandle::spawn_timer_task(
            self.config.follower_min_timeout,
            self.config.follower_max_timeout,
            self.actor_client.clone(),
        )
    }

    fn new_peer_state(&self, term: Term, peer_id: ReplicaId, previous_log_entry_index: Option<Index>) -> PeerState {
        let timer = LeaderTimerHandle::spawn_timer_task(
            self.config.leader_heartbeat_duration,
            self.actor_client.clone(),
            peer_id,
            term,
        );
        PeerState::new(timer, previous_log_entry_index)
    }
}

impl Role {
    fn snapshot(&self) -> ElectionStateSnapshot {
        match self {
            Role::Leader { .. } => ElectionStateSnapshot::Leader,
            Role::Candidate { .. } => ElectionStateSnapshot::Candidate,
            Role::Follower { leader: Some(leader), .. } => ElectionStateSnapshot::Follower(leader.clone()),
            Role::Follower { leader: None, .. } => ElectionStateSnapshot::FollowerNoLeader,
        }
    }
}

impl fmt::Debug for ElectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.role {
            Role::Leader { .. } => write!(f, "Leader"),
            Role::Candidate { votes, .. } => write!(f, "Candidate(Votes={})", votes.len()),
            Role::Follower { leader: Some(leader), .. } => write!(f, "Follower(Leader={:?})", leader.replica_id),
            Role::Follower { leader: None, .. } => write!(f, "Follower(Leader=None)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorClient;

    fn election_state(actor_client: &ActorClient) -> (ElectionState, ElectionStateChangeListener) {
        let config = ElectionConfig {
            my_replica_id: ReplicaId::new("me"),
            leader_heartbeat_duration: Duration::from_secs(60),
            follower_min_timeout: Duration::from_secs(60),
            follower_max_timeout: Duration::from_secs(120),
        };
        ElectionState::new_follower(config, actor_client.weak())
    }

    fn leader_info(id: &str) -> LeaderRedirectInfo {
        LeaderRedirectInfo {
            replica_id: ReplicaId::new(id),
            raft_address: format!("{}:7000", id),
        }
    }

    fn ids(ids: &[&str]) -> HashSet<ReplicaId> {
        ids.iter().map(|id| ReplicaId::new(*id)).collect()
    }

    #[tokio::test]
    async fn candidate_counts_distinct_votes_including_its_own() {
        let (actor_client, _rx) = ActorClient::new(10);
        let (mut es, listener) = election_state(&actor_client);
        assert_eq!(es.add_vote_if_candidate(ReplicaId::new("b")), None);

        assert_eq!(es.transition_to_candidate_and_vote_for_self(), 1);
        assert_eq!(listener.current(), ElectionStateSnapshot::Candidate);
        assert_eq!(es.add_vote_if_candidate(ReplicaId::new("b")), Some(2));
        assert_eq!(es.add_vote_if_candidate(ReplicaId::new("b")), Some(2));
        assert_eq!(es.add_vote_if_candidate(ReplicaId::new("me")), Some(2));
    }

    #[tokio::test]
    async fn candidate_steps_down_when_it_hears_from_a_leader() {
        let (actor_client, _rx) = ActorClient::new(10);
        let (mut es, listener) = election_state(&actor_client);
        es.transition_to_candidate_and_vote_for_self();

        es.set_leader_if_unknown(&leader_info("b"));
        assert_eq!(listener.current(), ElectionStateSnapshot::Follower(leader_info("b")));

        // A follower keeps the leader it already knows.
        es.set_leader_if_unknown(&leader_info("c"));
        assert_eq!(es.current_state(), ElectionStateSnapshot::Follower(leader_info("b")));
    }

    #[tokio::test]
    async fn leader_peers_follow_voter_set() {
        let (actor_client, _rx) = ActorClient::new(10);
        let (mut es, listener) = election_state(&actor_client);
        es.sync_leader_peers(Term::new(1), &ids(&["b"]), None);
        assert!(es.leader_state().is_none());

        es.transition_to_leader(Term::new(1), ids(&["b", "c"]), Some(Index::new(4)));
        assert!(es.is_leader());
        assert_eq!(listener.current(), ElectionStateSnapshot::Leader);

        es.sync_leader_peers(Term::new(1), &ids(&["c", "d"]), Some(Index::new(6)));
        let tracker = es.leader_state().unwrap();
        assert_eq!(tracker.peer_ids(), ids(&["c", "d"]));

        es.transition_to_follower(None);
        assert!(es.leader_state().is_none());
        assert_eq!(listener.current(), ElectionStateSnapshot::FollowerNoLeader);
    }
}
