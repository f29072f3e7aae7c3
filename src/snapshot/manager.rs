use crate::actor::WeakActorClient;
use crate::commitlog::Index;
use crate::replica::{Membership, Term};
use crate::snapshot::{Snapshot, SnapshotPolicy, SnapshotStore};
use crate::state_machine::StateMachine;
use bytes::Bytes;
use chrono::Utc;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::{Duration, Instant};

/// SnapshotManager decides when the applier should snapshot and runs the snapshot off the
/// applier task. Capture happens on the applier (cheap), serialization and the disk write happen on
/// the blocking pool, and then the replica is told it may compact its log. A failed write is
/// latched and reported on the next check; snapshotting never resumes after one.
pub(crate) struct SnapshotManager {
    logger: slog::Logger,
    store: Arc<dyn SnapshotStore>,
    policy: SnapshotPolicy,
    actor_client: WeakActorClient,
    last_snapshot_index: Option<Index>,
    last_snapshot_time: Instant,
    applied_since_last: u64,
    in_flight: Arc<AtomicBool>,
    persist_failure: Arc<Mutex<Option<(io::ErrorKind, String)>>>,
}

impl SnapshotManager {
    pub(crate) fn new(
        logger: slog::Logger,
        store: Arc<dyn SnapshotStore>,
        policy: SnapshotPolicy,
        actor_client: WeakActorClient,
        last_snapshot_index: Option<Index>,
    ) -> Self {
        SnapshotManager {
            logger,
            store,
            policy,
            actor_client,
            last_snapshot_index,
            last_snapshot_time: Instant::now(),
            applied_since_last: 0,
            in_flight: Arc::new(AtomicBool::new(false)),
            persist_failure: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) fn check_period(&self) -> Duration {
        self.policy.interval.min(Duration::from_secs(1))
    }

    pub(crate) fn on_applied(&mut self) {
        self.applied_since_last += 1;
    }

    pub(crate) fn on_restored(&mut self, snapshot_index: Index) {
        self.last_snapshot_index.replace(snapshot_index);
        self.last_snapshot_time = Instant::now();
        self.applied_since_last = 0;
    }

    /// Returns true if a snapshot was started, or the error of an earlier snapshot write.
    pub(crate) fn maybe_snapshot<S: StateMachine>(
        &mut self,
        state_machine: &S,
        last_applied: Option<(Term, Index)>,
        membership: &Membership,
    ) -> Result<bool, io::Error> {
        if let Some((kind, message)) = &*self.persist_failure.lock().expect("Snapshot failure mutex poisoned") {
            return Err(io::Error::new(*kind, message.clone()));
        }

        let (last_applied_term, last_applied_index) = match last_applied {
            Some(la) => la,
            None => return Ok(false),
        };
        if matches!(self.last_snapshot_index, Some(i) if i >= last_applied_index) {
            return Ok(false);
        }
        if !self
            .policy
            .should_snapshot(self.applied_since_last, self.last_snapshot_time, Instant::now())
        {
            return Ok(false);
        }
        if self.in_flight.swap(true, Ordering::AcqRel) {
            slog::debug!(self.logger, "Snapshot already in flight");
            return Ok(false);
        }

        let image = state_machine.capture();
        self.last_snapshot_index.replace(last_applied_index);
        self.last_snapshot_time = Instant::now();
        self.applied_since_last = 0;

        let logger = self.logger.new(slog::o!("SnapshotIndex" => last_applied_index.as_u64()));
        let store = self.store.clone();
        let actor_client = self.actor_client.clone();
        let in_flight = self.in_flight.clone();
        let persist_failure = self.persist_failure.clone();
        let membership = membership.clone();
        tokio::task::spawn(async move {
            let persisted = tokio::task::spawn_blocking(move || {
                let snapshot = Snapshot {
                    last_included_index: last_applied_index,
                    last_included_term: last_applied_term,
                    membership,
                    data: Bytes::from(S::serialize_image(&image)),
                    created_at_millis: Utc::now().timestamp_millis(),
                };
                store.persist_if_newer(&snapshot).map(|newer| (snapshot, newer))
            })
            .await;

            let failure = match persisted {
                Ok(Ok((snapshot, true))) => {
                    slog::info!(logger, "Persisted snapshot ({} bytes)", snapshot.data.len());
                    let _ = actor_client.snapshot_persisted(Arc::new(snapshot)).await;
                    None
                }
                Ok(Ok((_, false))) => {
                    slog::info!(logger, "A newer snapshot is already stored. Discarding.");
                    None
                }
                Ok(Err(ioe)) => {
                    slog::error!(logger, "Failed to persist snapshot: {:?}", ioe);
                    Some((ioe.kind(), ioe.to_string()))
                }
                Err(join_error) => {
                    slog::error!(logger, "Snapshot task panicked: {:?}", join_error);
                    Some((io::ErrorKind::Other, join_error.to_string()))
                }
            };
            if failure.is_some() {
                *persist_failure.lock().expect("Snapshot failure mutex poisoned") = failure;
            }
            // Cleared last so a check that sees no snapshot in flight also sees its failure.
            in_flight.store(false, Ordering::Release);
        });

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorClient;
    use crate::kv::{Cache, KvStateMachine};
    use crate::snapshot::FailingSnapshotStore;

    #[tokio::test]
    async fn failed_persist_is_reported_and_stops_snapshotting() {
        let (actor_client, mut actor_rx) = ActorClient::new(10);
        let mut manager = SnapshotManager::new(
            slog::Logger::root(slog::Discard, slog::o!()),
            Arc::new(FailingSnapshotStore::default()),
            SnapshotPolicy {
                interval: Duration::from_secs(3600),
                threshold: 1,
            },
            actor_client.weak(),
            None,
        );
        let state_machine = KvStateMachine::new(Arc::new(Cache::new()));
        let membership = Membership::empty();

        manager.on_applied();
        let started = manager.maybe_snapshot(&state_machine, Some((Term::new(1), Index::new(1))), &membership);
        assert!(started.unwrap());

        let mut next_index = 2;
        let error = loop {
            manager.on_applied();
            let last_applied = Some((Term::new(1), Index::new(next_index)));
            match manager.maybe_snapshot(&state_machine, last_applied, &membership) {
                Err(e) => break e,
                Ok(_) => tokio::time::sleep(Duration::from_millis(5)).await,
            }
            next_index += 1;
            assert!(next_index < 1000, "Persist failure was never reported");
        };
        assert!(error.to_string().contains("No space left"));

        // Still failed on later checks, and the replica was never told to compact.
        let last_applied = Some((Term::new(1), Index::new(next_index + 1)));
        assert!(manager.maybe_snapshot(&state_machine, last_applied, &membership).is_err());
        assert!(actor_rx.try_recv().is_err());
    }
}
