use crate::replica::LeaderRedirectInfo;
use tokio::sync::watch;

/// The externally visible part of a replica's election state.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum ElectionStateSnapshot {
    Leader,
    Candidate,
    Follower(LeaderRedirectInfo),
    FollowerNoLeader,
}

pub(super) fn new(initial_state: ElectionStateSnapshot) -> (ElectionStateChangeNotifier, ElectionStateChangeListener) {
    let (tx, rx) = watch::channel(initial_state);

    (ElectionStateChangeNotifier { tx }, ElectionStateChangeListener { rx })
}

pub(super) struct ElectionStateChangeNotifier {
    tx: watch::Sender<ElectionStateSnapshot>,
}

impl ElectionStateChangeNotifier {
    /// Listeners only wake up if the state actually differs from what they last saw published.
    pub(super) fn publish(&self, new_state: ElectionStateSnapshot) {
        self.tx.send_if_modified(|current| {
            if *current == new_state {
                false
            } else {
                *current = new_state;
                true
            }
        });
    }
}

/// Listeners see the latest state. Intermediate states may be skipped if the listener is slow.
#[derive(Clone)]
pub(crate) struct ElectionStateChangeListener {
    rx: watch::Receiver<ElectionStateSnapshot>,
}

impl ElectionStateChangeListener {
    pub(crate) fn current(&self) -> ElectionStateSnapshot {
        self.rx.borrow().clone()
    }

    /// None once the replica is gone.
    pub(crate) async fn next(&mut self) -> Option<ElectionStateSnapshot> {
        self.rx.changed().await.ok()?;
        let state = self.rx.borrow().clone();
        Some(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::ReplicaId;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn repeated_state_is_not_republished() {
        let (notifier, mut listener) = new(ElectionStateSnapshot::FollowerNoLeader);

        notifier.publish(ElectionStateSnapshot::FollowerNoLeader);
        assert!(timeout(Duration::from_millis(10), listener.next()).await.is_err());

        let leader = LeaderRedirectInfo {
            replica_id: ReplicaId::new("a"),
            raft_address: "a:1".to_string(),
        };
        notifier.publish(ElectionStateSnapshot::Follower(leader.clone()));
        assert_eq!(listener.next().await, Some(ElectionStateSnapshot::Follower(leader)));

        drop(notifier);
        assert_eq!(listener.next().await, None);
    }
}
