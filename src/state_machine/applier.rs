use crate::commitlog::Index;
use crate::replica::{ApplyOutcome, CommitStream, CommitStreamItem, CommittedEntry, EntryPayload, Membership, Term};
use crate::snapshot::{Snapshot, SnapshotManager};
use crate::state_machine::StateMachine;
use std::io;
use std::sync::Arc;

/// Applier is the single task that applies committed entries to the state machine, strictly in
/// index order, and triggers snapshots in between.
pub(crate) struct Applier<S: StateMachine> {
    logger: slog::Logger,
    state_machine: Arc<S>,
    commit_stream: CommitStream,
    snapshots: SnapshotManager,
    last_applied: Option<(Term, Index)>,
    // Voters as of `last_applied`, recorded into snapshots.
    membership: Membership,
}

impl<S: StateMachine> Applier<S> {
    pub(crate) fn new(
        logger: slog::Logger,
        state_machine: Arc<S>,
        commit_stream: CommitStream,
        snapshots: SnapshotManager,
        last_applied: Option<(Term, Index)>,
        membership: Membership,
    ) -> Self {
        Applier {
            logger,
            state_machine,
            commit_stream,
            snapshots,
            last_applied,
            membership,
        }
    }

    /// Runs until the replica drops its end of the commit stream.
    pub(crate) async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.snapshots.check_period());
        loop {
            tokio::select! {
                item = self.commit_stream.recv() => {
                    let result = match item {
                        None => {
                            slog::info!(self.logger, "Commit stream closed. Applier exiting.");
                            return;
                        }
                        Some(CommitStreamItem::Entry(entry)) => {
                            self.handle_committed_entry(entry);
                            Ok(())
                        }
                        Some(CommitStreamItem::Restore(snapshot)) => self.handle_restore(snapshot),
                    };
                    if let Err(e) = result {
                        slog::crit!(self.logger, "State machine restore failed, applier exiting: {:?}", e);
                        return;
                    }
                }
                _ = ticker.tick() => {}
            }

            let snapshot_result = self
                .snapshots
                .maybe_snapshot(self.state_machine.as_ref(), self.last_applied, &self.membership);
            if let Err(e) = snapshot_result {
                slog::crit!(self.logger, "Snapshot persist failed, applier exiting: {:?}", e);
                return;
            }
        }
    }

    fn handle_committed_entry(&mut self, entry: CommittedEntry) {
        let expected_index = match self.last_applied {
            Some((_, index)) => index.plus(1),
            None => Index::start_index(),
        };
        assert_eq!(
            entry.index, expected_index,
            "Committed entries must be applied exactly once, in order"
        );

        let outcome = match entry.payload {
            EntryPayload::Command(command) => match self.state_machine.apply(&command) {
                Ok(()) => ApplyOutcome::Applied,
                Err(e) => {
                    slog::warn!(self.logger, "Skipping malformed command at {:?}: {:?}", entry.index, e);
                    ApplyOutcome::Malformed(e.to_string())
                }
            },
            EntryPayload::Membership(membership) => {
                slog::info!(self.logger, "Applied membership at {:?}: {:?}", entry.index, membership);
                self.membership = membership;
                ApplyOutcome::Applied
            }
            EntryPayload::Noop => ApplyOutcome::Applied,
        };

        self.last_applied = Some((entry.term, entry.index));
        self.snapshots.on_applied();

        if let Some(notifier) = entry.notifier {
            let _ = notifier.send(outcome);
        }
    }

    fn handle_restore(&mut self, snapshot: Arc<Snapshot>) -> Result<(), io::Error> {
        slog::info!(self.logger, "Restoring state machine from {:?}", snapshot);
        self.state_machine.restore(&snapshot.data)?;
        self.last_applied = Some((snapshot.last_included_term, snapshot.last_included_index));
        self.membership = snapshot.membership.clone();
        self.snapshots.on_restored(snapshot.last_included_index);

        Ok(())
    }
}
