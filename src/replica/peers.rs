use crate::commitlog::Index;
use crate::replica::membership::Membership;
use std::collections::HashSet;
use std::fmt;

/// ReplicaId...or maybe it should be NodeId or ServerId. Idk.
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) struct ReplicaId(String);

impl ReplicaId {
    pub(crate) fn new(id: impl Into<String>) -> Self {
        ReplicaId(id.into())
    }

    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Debug for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ReplicaMetadata {
    replica_id: ReplicaId,
    raft_address: String,
}

impl ReplicaMetadata {
    pub(crate) fn new(replica_id: ReplicaId, raft_address: String) -> Self {
        ReplicaMetadata {
            replica_id,
            raft_address,
        }
    }

    pub(crate) fn replica_id(&self) -> &ReplicaId {
        &self.replica_id
    }

    pub(crate) fn raft_address(&self) -> &str {
        &self.raft_address
    }
}

/// ClusterTracker tracks which configuration governs this replica. A configuration takes effect
/// as soon as its entry is in the local log, so the tracker keeps every configuration that is
/// still in the log. That lets it fall back to the previous one when a conflicting suffix is
/// truncated away.
pub(crate) struct ClusterTracker {
    me: ReplicaMetadata,
    // Ascending by index. The first element is the base configuration: it came from a snapshot or
    // a compacted prefix (or is empty for a brand new replica), and is never removed.
    history: Vec<(Option<Index>, Membership)>,
}

impl ClusterTracker {
    pub(crate) fn new(me: ReplicaMetadata, base_index: Option<Index>, base: Membership) -> Self {
        ClusterTracker {
            me,
            history: vec![(base_index, base)],
        }
    }

    pub(crate) fn my_replica_id(&self) -> &ReplicaId {
        self.me.replica_id()
    }

    pub(crate) fn my_metadata(&self) -> &ReplicaMetadata {
        &self.me
    }

    pub(crate) fn current(&self) -> &Membership {
        &self.latest().1
    }

    /// Log index of the entry that introduced the current configuration.
    pub(crate) fn current_config_index(&self) -> Option<Index> {
        self.latest().0
    }

    fn latest(&self) -> &(Option<Index>, Membership) {
        self.history
            .last()
            .expect("ClusterTracker history always holds a base configuration")
    }

    pub(crate) fn am_i_voter(&self) -> bool {
        self.current().contains(self.my_replica_id())
    }

    pub(crate) fn contains_member(&self, replica_id: &ReplicaId) -> bool {
        self.current().contains(replica_id)
    }

    pub(crate) fn num_voting_replicas(&self) -> usize {
        self.current().len()
    }

    pub(crate) fn metadata(&self, replica_id: &ReplicaId) -> Option<ReplicaMetadata> {
        self.current()
            .address(replica_id)
            .map(|address| ReplicaMetadata::new(replica_id.clone(), address.to_string()))
    }

    /// Every voter other than me.
    pub(crate) fn peer_ids(&self) -> HashSet<ReplicaId> {
        self.current()
            .voter_ids()
            .filter(|id| *id != self.my_replica_id())
            .cloned()
            .collect()
    }

    pub(crate) fn iter_peers(&self) -> impl Iterator<Item = ReplicaMetadata> + '_ {
        let my_id = self.my_replica_id();
        self.current()
            .iter()
            .filter(move |(id, _)| *id != my_id)
            .map(|(id, address)| ReplicaMetadata::new(id.clone(), address.to_string()))
    }

    pub(crate) fn on_membership_appended(&mut self, index: Index, membership: Membership) {
        if let Some(latest_index) = self.latest().0 {
            assert!(
                index > latest_index,
                "Membership entries must be appended in index order. Latest={:?}, New={:?}",
                latest_index,
                index
            );
        }
        self.history.push((Some(index), membership));
    }

    /// Forget configurations whose entries were removed by a log truncation at `from_index`.
    /// Returns true if the current configuration changed.
    pub(crate) fn on_log_truncated(&mut self, from_index: Index) -> bool {
        let before = self.history.len();
        while self.history.len() > 1 {
            match self.latest().0 {
                Some(index) if index >= from_index => {
                    self.history.pop();
                }
                _ => break,
            }
        }

        before != self.history.len()
    }

    /// Collapse every configuration at or below `through` into the base configuration.
    pub(crate) fn on_log_compacted(&mut self, through: Index) {
        // The newest configuration at or below `through` becomes the new base.
        let new_base = self
            .history
            .iter()
            .rposition(|(index, _)| index.map(|i| i <= through).unwrap_or(true))
            .unwrap_or(0);
        self.history.drain(..new_base);
    }

    /// Replace all known configurations with one installed from a snapshot.
    pub(crate) fn reset_to_snapshot(&mut self, index: Index, membership: Membership) {
        self.history.clear();
        self.history.push((Some(index), membership));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn me() -> ReplicaMetadata {
        ReplicaMetadata::new(ReplicaId::new("a"), "127.0.0.1:7000".into())
    }

    fn members(ids: &[&str]) -> Membership {
        let mut m = Membership::empty();
        for id in ids {
            m.add(ReplicaId::new(*id), format!("{}-addr", id));
        }
        m
    }

    #[test]
    fn new_replica_is_not_a_voter() {
        let tracker = ClusterTracker::new(me(), None, Membership::empty());
        assert!(!tracker.am_i_voter());
        assert_eq!(tracker.num_voting_replicas(), 0);
        assert_eq!(tracker.current_config_index(), None);
    }

    #[test]
    fn append_and_truncate_revert_configuration() {
        let mut tracker = ClusterTracker::new(me(), None, Membership::empty());
        tracker.on_membership_appended(Index::new(1), members(&["a"]));
        tracker.on_membership_appended(Index::new(4), members(&["a", "b"]));
        tracker.on_membership_appended(Index::new(7), members(&["a", "b", "c"]));

        assert_eq!(tracker.num_voting_replicas(), 3);
        assert_eq!(
            tracker.peer_ids(),
            vec![ReplicaId::new("b"), ReplicaId::new("c")].into_iter().collect()
        );

        assert!(tracker.on_log_truncated(Index::new(5)));
        assert_eq!(tracker.current(), &members(&["a", "b"]));
        assert_eq!(tracker.current_config_index(), Some(Index::new(4)));

        assert!(!tracker.on_log_truncated(Index::new(5)));

        assert!(tracker.on_log_truncated(Index::new(1)));
        assert_eq!(tracker.current(), &Membership::empty());

        // The base configuration is never dropped.
        assert!(!tracker.on_log_truncated(Index::new(1)));
    }

    #[test]
    fn compaction_collapses_history() {
        let mut tracker = ClusterTracker::new(me(), None, Membership::empty());
        tracker.on_membership_appended(Index::new(1), members(&["a"]));
        tracker.on_membership_appended(Index::new(4), members(&["a", "b"]));
        tracker.on_membership_appended(Index::new(7), members(&["a", "b", "c"]));

        tracker.on_log_compacted(Index::new(5));
        // Truncation can no longer go below the compacted configuration.
        tracker.on_log_truncated(Index::new(6));
        assert_eq!(tracker.current(), &members(&["a", "b"]));
        tracker.on_log_truncated(Index::new(2));
        assert_eq!(tracker.current(), &members(&["a", "b"]));
    }

    #[test]
    fn snapshot_resets_history() {
        let mut tracker = ClusterTracker::new(me(), None, Membership::empty());
        tracker.on_membership_appended(Index::new(1), members(&["a"]));
        tracker.reset_to_snapshot(Index::new(10), members(&["a", "b", "c"]));

        assert_eq!(tracker.current_config_index(), Some(Index::new(10)));
        assert_eq!(tracker.num_voting_replicas(), 3);
        assert!(tracker.metadata(&ReplicaId::new("c")).is_some());
    }
}
