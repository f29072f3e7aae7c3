use crate::commitlog;
use crate::commitlog::Index;
use crate::replica::local_state::Term;
use crate::replica::membership::Membership;
use crate::replica::write_ahead_log::commit_stream::{
    AppliedNotifier, ApplyOutcome, CommitStreamPublisher, CommittedEntry,
};
use crate::replica::{EntryPayload, WriteAheadLogEntry};
use crate::snapshot::Snapshot;
use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;

/// WriteAheadLog is the raft-specific log facade.
///
/// Note: A log entry has 3 states (not modeled directly in code):
/// 1. Persisted - written to disk, not yet replicated to majority
/// 2. Committed - written to disk, replicated to majority
/// 3. Applied - a committed entry that has also been applied to the state machine
///
/// A log entry's state has no global truth. Each replica will have their own local view of what
/// state the log entry is in.
///
/// Entries at or below the snapshot boundary have been folded into a snapshot and may no longer be
/// readable from the underlying log.
pub(crate) struct WriteAheadLog<L>
where
    L: commitlog::Log<WriteAheadLogEntry>,
{
    // Application's info/debug log.
    logger: slog::Logger,

    // This is the log that we're replicating.
    log: L,
    // Metadata about the highest log entry that we've locally written. It must be updated atomically.
    latest_entry_metadata: Option<(Term, Index)>,

    // Last entry covered by the latest snapshot.
    snapshot_boundary: Option<(Term, Index)>,
    latest_snapshot: Option<Arc<Snapshot>>,

    // Commit stream to publish committed entries to. Consumed by the applier task.
    commit_stream: CommitStreamPublisher,
    // Index of highest log entry known to be committed. None if nothing is committed.
    commit_index: Option<Index>,
    // Index of highest log entry handed to the commit stream. None if nothing is published.
    last_published_index: Option<Index>,

    // Proposers waiting for their entry to be applied, keyed by the index the entry landed at.
    pending_notifiers: BTreeMap<Index, (Term, AppliedNotifier)>,
}

impl<L> WriteAheadLog<L>
where
    L: commitlog::Log<WriteAheadLogEntry>,
{
    pub(super) fn new(
        logger: slog::Logger,
        mut log: L,
        latest_snapshot: Option<Arc<Snapshot>>,
        commit_stream: CommitStreamPublisher,
    ) -> Result<Self, io::Error> {
        let snapshot_boundary = latest_snapshot
            .as_ref()
            .map(|s| (s.last_included_term, s.last_included_index));

        match snapshot_boundary {
            Some((_, boundary_index)) => {
                if log.first_index() > boundary_index.plus(1) {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!(
                            "log starts at {:?} but latest snapshot only covers through {:?}",
                            log.first_index(),
                            boundary_index
                        ),
                    ));
                }
                // We may have crashed after persisting the snapshot but before compacting.
                log.compact(boundary_index)?;
            }
            None => {
                if log.first_index() != Index::start_index() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("log starts at {:?} but there is no snapshot", log.first_index()),
                    ));
                }
            }
        }

        let latest_entry_metadata = match log.next_index().checked_minus(1) {
            Some(last_index) if last_index >= log.first_index() => match log.read(last_index)? {
                Some(entry) => Some((entry.term, last_index)),
                None => snapshot_boundary,
            },
            _ => snapshot_boundary,
        };

        let boundary_index = snapshot_boundary.map(|(_, index)| index);

        Ok(WriteAheadLog {
            logger,
            log,
            latest_entry_metadata,
            snapshot_boundary,
            latest_snapshot,
            commit_stream,
            commit_index: boundary_index,
            last_published_index: boundary_index,
            pending_notifiers: BTreeMap::new(),
        })
    }

    pub(crate) fn latest_entry(&self) -> Option<(Term, Index)> {
        self.latest_entry_metadata
    }

    pub(crate) fn latest_index(&self) -> Option<Index> {
        self.latest_entry_metadata.map(|(_, index)| index)
    }

    pub(crate) fn snapshot_boundary(&self) -> Option<(Term, Index)> {
        self.snapshot_boundary
    }

    pub(crate) fn latest_snapshot(&self) -> Option<Arc<Snapshot>> {
        self.latest_snapshot.clone()
    }

    /// Lowest index that can still be read as an entry.
    pub(crate) fn first_index(&self) -> Index {
        self.log.first_index()
    }

    pub(crate) fn read(&self, index: Index) -> Result<Option<WriteAheadLogEntry>, io::Error> {
        self.log.read(index)
    }

    pub(crate) fn read_range(&self, start: Index, max_entries: usize) -> Result<Vec<WriteAheadLogEntry>, io::Error> {
        self.log.read_range(start, max_entries)
    }

    fn read_required(&self, index: Index) -> Result<WriteAheadLogEntry, io::Error> {
        match self.read(index)? {
            Some(entry) => Ok(entry),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no log entry for index {:?}", index),
            )),
        }
    }

    /// Term of the entry at `index`, including the entry folded into the snapshot boundary.
    pub(crate) fn term_at(&self, index: Index) -> Result<Option<Term>, io::Error> {
        if let Some((boundary_term, boundary_index)) = self.snapshot_boundary {
            if index == boundary_index {
                return Ok(Some(boundary_term));
            }
        }

        Ok(self.read(index)?.map(|entry| entry.term))
    }

    /// Remove anything starting at `index` and later. Proposers waiting on removed entries are
    /// dropped, which tells them their entry will never commit.
    pub(crate) fn truncate(&mut self, index: Index) -> Result<(), io::Error> {
        if let Some(commit_index) = self.commit_index {
            assert!(
                index > commit_index,
                "Can't truncate committed entries. CommitIndex={:?}, TruncateFrom={:?}",
                commit_index,
                index
            );
        }

        let new_latest_entry_metadata = match index.checked_minus(1) {
            None => None,
            Some(new_latest_entry_index) => self.term_at(new_latest_entry_index)?.map(|t| (t, new_latest_entry_index)),
        };

        self.log.truncate(index)?;

        self.latest_entry_metadata = new_latest_entry_metadata;
        let dropped = self.pending_notifiers.split_off(&index);
        if !dropped.is_empty() {
            slog::info!(self.logger, "Dropped {} pending proposals due to log truncation", dropped.len());
        }

        Ok(())
    }

    pub(crate) fn append(&mut self, entry: WriteAheadLogEntry) -> Result<Index, io::Error> {
        let appended_term = entry.term;
        let appended_index = self.log.append(entry)?;
        // Only update state after log action completes.
        self.latest_entry_metadata = Some((appended_term, appended_index));

        Ok(appended_index)
    }

    pub(crate) fn register_notifier(&mut self, index: Index, term: Term, notifier: AppliedNotifier) {
        self.pending_notifiers.insert(index, (term, notifier));
    }

    pub(crate) fn commit_index(&self) -> Option<Index> {
        self.commit_index
    }

    pub(crate) fn ratchet_fwd_commit_index_if_valid(
        &mut self,
        tentative_new_commit_index: Index,
        current_term: Term,
    ) -> Result<bool, io::Error> {
        if let Some(current_commit_index) = self.commit_index {
            if tentative_new_commit_index <= current_commit_index {
                return Ok(false);
            }
        }

        // > If there exists an N such that N > commitIndex, a majority
        // > of matchIndex[i] ≥ N, and log[N].term == currentTerm:
        // > set commitIndex = N (§5.3, §5.4).
        let entry = self.read_required(tentative_new_commit_index)?;
        if entry.term != current_term {
            return Ok(false);
        }

        self.ratchet_fwd_commit_index_panicking(tentative_new_commit_index);

        Ok(true)
    }

    /// Follower path. Stale or reordered leader commit indexes are ignored.
    pub(crate) fn ratchet_fwd_commit_index_if_changed(&mut self, new_commit_index: Index) {
        if matches!(self.commit_index(), Some(ci) if ci >= new_commit_index) {
            return;
        }

        self.ratchet_fwd_commit_index_panicking(new_commit_index);
    }

    fn ratchet_fwd_commit_index_panicking(&mut self, new_commit_index: Index) {
        // Assert we only mark as committed if we have the entry locally.
        let latest_locally_written_index = self
            .latest_index()
            .expect("Can't ratchet commit index forward if we don't have any local logs");
        assert!(
            latest_locally_written_index >= new_commit_index,
            "Can't ratchet commit index forwards past our local log. Expected [latest log] {:?} >= {:?} [input]",
            latest_locally_written_index,
            new_commit_index,
        );

        self.commit_index.replace(new_commit_index);
    }

    /// Hands every committed but unpublished entry to the applier, in order.
    pub(crate) fn publish_committed_entries(&mut self) -> Result<(), io::Error> {
        let commit_index = match self.commit_index {
            Some(ci) => ci,
            None => return Ok(()),
        };

        let mut next_index = match self.last_published_index {
            Some(last) => last.plus(1),
            None => Index::start_index(),
        };

        // This may be a long running loop, and starve the Replica event loop from handling
        // another event. It only runs long when a follower is catching up on commits.
        while next_index <= commit_index {
            let entry = self.read_required(next_index)?;
            let notifier = match self.pending_notifiers.remove(&next_index) {
                Some((term, notifier)) if term == entry.term => Some(notifier),
                Some(_) => {
                    slog::warn!(
                        self.logger,
                        "Pending proposal at {:?} was replaced by another term's entry",
                        next_index
                    );
                    None
                }
                None => None,
            };

            self.commit_stream.notify_commit(
                &self.logger,
                CommittedEntry {
                    term: entry.term,
                    index: next_index,
                    payload: entry.payload,
                    notifier,
                },
            );
            self.last_published_index.replace(next_index);
            next_index = next_index.plus(1);
        }

        Ok(())
    }

    /// The applier persisted a snapshot of our own state. Fold the log prefix it covers.
    pub(crate) fn compact_to_snapshot(&mut self, snapshot: Arc<Snapshot>) -> Result<Option<Index>, io::Error> {
        let through = snapshot.last_included_index;
        if let Some((_, boundary_index)) = self.snapshot_boundary {
            if through <= boundary_index {
                return Ok(None);
            }
        }
        assert!(
            matches!(self.commit_index, Some(ci) if ci >= through),
            "Snapshot at {:?} is ahead of commit index {:?}",
            through,
            self.commit_index
        );

        self.log.compact(through)?;
        self.snapshot_boundary = Some((snapshot.last_included_term, through));
        self.latest_snapshot = Some(snapshot);

        Ok(Some(through))
    }

    /// A leader sent us a snapshot ahead of our commit index. Returns true if our log suffix after
    /// the snapshot was kept.
    ///
    /// > If existing log entry has same index and term as snapshot’s
    /// > last included entry, retain log entries following it and reply
    /// > Otherwise, discard the entire log
    pub(crate) fn install_snapshot(&mut self, snapshot: Arc<Snapshot>) -> Result<bool, io::Error> {
        let through = snapshot.last_included_index;
        let through_term = snapshot.last_included_term;

        let keep_suffix = matches!(self.term_at(through)?, Some(term) if term == through_term);
        let folded = self.pending_notifiers.split_off(&through.plus(1));
        let folded = std::mem::replace(&mut self.pending_notifiers, folded);
        if keep_suffix {
            // Our prefix matches the leader's, so anything we still hold at its proposed term is
            // part of the snapshot.
            for (index, (term, notifier)) in folded {
                if self.term_at(index)? == Some(term) {
                    let _ = notifier.send(ApplyOutcome::Applied);
                }
            }
        }
        if !keep_suffix {
            let first_index = self.log.first_index();
            self.log.truncate(first_index)?;
        }
        self.log.compact(through)?;

        if !keep_suffix {
            self.latest_entry_metadata = Some((through_term, through));
            self.pending_notifiers.clear();
        }
        self.snapshot_boundary = Some((through_term, through));
        self.latest_snapshot = Some(snapshot.clone());
        self.commit_index = Some(self.commit_index.map_or(through, |ci| ci.max(through)));
        self.last_published_index = Some(through);

        self.commit_stream.notify_restore(&self.logger, snapshot);

        Ok(keep_suffix)
    }

    /// Membership entries still present in the log, in index order.
    pub(crate) fn membership_entries(&self) -> Result<Vec<(Index, Membership)>, io::Error> {
        let mut memberships = Vec::new();
        let mut index = self.log.first_index();
        while index < self.log.next_index() {
            if let Some(WriteAheadLogEntry {
                payload: EntryPayload::Membership(membership),
                ..
            }) = self.read(index)?
            {
                memberships.push((index, membership));
            }
            index = index.plus(1);
        }

        Ok(memberships)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitlog::InMemoryLog;
    use crate::replica::write_ahead_log::commit_stream::{self, ApplyOutcome, CommitStream, CommitStreamItem};
    use bytes::Bytes;
    use tokio::sync::oneshot;

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn wal() -> (WriteAheadLog<InMemoryLog<WriteAheadLogEntry>>, CommitStream) {
        let (publisher, stream) = commit_stream::new();
        let log = InMemoryLog::create().unwrap();
        (WriteAheadLog::new(logger(), log, None, publisher).unwrap(), stream)
    }

    fn command(term: u64, data: &'static [u8]) -> WriteAheadLogEntry {
        WriteAheadLogEntry {
            term: Term::new(term),
            payload: EntryPayload::Command(Bytes::from_static(data)),
        }
    }

    async fn recv_entry(stream: &mut CommitStream) -> CommittedEntry {
        match stream.recv().await {
            Some(CommitStreamItem::Entry(entry)) => entry,
            _ => panic!("Expected committed entry"),
        }
    }

    #[tokio::test]
    async fn commit_requires_current_term_entry() {
        let (mut wal, mut stream) = wal();
        wal.append(command(1, b"a")).unwrap();
        wal.append(command(2, b"b")).unwrap();

        // Index 1 is from an older term, so a term-2 leader can't commit it directly.
        assert!(!wal.ratchet_fwd_commit_index_if_valid(Index::new(1), Term::new(2)).unwrap());
        assert_eq!(wal.commit_index(), None);

        assert!(wal.ratchet_fwd_commit_index_if_valid(Index::new(2), Term::new(2)).unwrap());
        wal.publish_committed_entries().unwrap();

        assert_eq!(recv_entry(&mut stream).await.index, Index::new(1));
        assert_eq!(recv_entry(&mut stream).await.index, Index::new(2));
    }

    #[tokio::test]
    async fn truncation_drops_pending_notifiers() {
        let (mut wal, mut stream) = wal();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();

        let i1 = wal.append(command(1, b"keep")).unwrap();
        wal.register_notifier(i1, Term::new(1), tx1);
        let i2 = wal.append(command(1, b"lost")).unwrap();
        wal.register_notifier(i2, Term::new(1), tx2);

        wal.truncate(i2).unwrap();
        assert_eq!(wal.latest_entry(), Some((Term::new(1), i1)));
        assert!(rx2.await.is_err());

        wal.ratchet_fwd_commit_index_if_changed(i1);
        wal.publish_committed_entries().unwrap();
        let committed = recv_entry(&mut stream).await;
        committed.notifier.unwrap().send(ApplyOutcome::Applied).unwrap();
        assert_eq!(rx1.await.unwrap(), ApplyOutcome::Applied);
    }

    #[tokio::test]
    async fn follower_commit_never_moves_backwards() {
        let (mut wal, _stream) = wal();
        for _ in 0..3 {
            wal.append(command(1, b"x")).unwrap();
        }
        wal.ratchet_fwd_commit_index_if_changed(Index::new(3));
        wal.ratchet_fwd_commit_index_if_changed(Index::new(2));
        assert_eq!(wal.commit_index(), Some(Index::new(3)));
    }

    #[tokio::test]
    async fn install_snapshot_discards_conflicting_log() {
        let (mut wal, mut stream) = wal();
        for _ in 0..3 {
            wal.append(command(1, b"x")).unwrap();
        }

        let snapshot = Arc::new(Snapshot {
            last_included_index: Index::new(5),
            last_included_term: Term::new(2),
            membership: Membership::empty(),
            data: Bytes::new(),
            created_at_millis: 0,
        });
        assert!(!wal.install_snapshot(snapshot).unwrap());

        assert_eq!(wal.latest_entry(), Some((Term::new(2), Index::new(5))));
        assert_eq!(wal.commit_index(), Some(Index::new(5)));
        assert_eq!(wal.first_index(), Index::new(6));
        assert_eq!(wal.term_at(Index::new(5)).unwrap(), Some(Term::new(2)));
        assert!(matches!(stream.recv().await, Some(CommitStreamItem::Restore(_))));

        // Replication resumes right after the snapshot.
        assert_eq!(wal.append(command(2, b"y")).unwrap(), Index::new(6));
    }

    #[tokio::test]
    async fn install_snapshot_keeps_matching_suffix() {
        let (mut wal, _stream) = wal();
        for _ in 0..4 {
            wal.append(command(1, b"x")).unwrap();
        }

        let snapshot = Arc::new(Snapshot {
            last_included_index: Index::new(2),
            last_included_term: Term::new(1),
            membership: Membership::empty(),
            data: Bytes::new(),
            created_at_millis: 0,
        });
        assert!(wal.install_snapshot(snapshot).unwrap());
        assert_eq!(wal.latest_entry(), Some((Term::new(1), Index::new(4))));
        assert!(wal.read(Index::new(3)).unwrap().is_some());
        assert!(wal.read(Index::new(2)).unwrap().is_none());
    }
}
