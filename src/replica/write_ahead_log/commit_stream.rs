use crate::commitlog::Index;
use crate::replica::{EntryPayload, Term};
use crate::snapshot::Snapshot;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// What happened to a proposed entry once the applier reached its index.
#[derive(Debug, PartialEq)]
pub(crate) enum ApplyOutcome {
    Applied,
    /// Committed, but the state machine couldn't decode the command. It was skipped on every
    /// replica alike.
    Malformed(String),
}

/// Held by the proposer's entry until the applier has applied it. Dropping it without sending
/// means the entry was truncated away and will never commit.
pub(crate) type AppliedNotifier = oneshot::Sender<ApplyOutcome>;

pub(super) struct CommitStreamPublisher {
    sender: mpsc::UnboundedSender<CommitStreamItem>,
}

pub(crate) struct CommitStream {
    receiver: mpsc::UnboundedReceiver<CommitStreamItem>,
}

pub(crate) enum CommitStreamItem {
    Entry(CommittedEntry),
    /// The leader replaced our state with a snapshot; everything up to its index is covered.
    Restore(Arc<Snapshot>),
}

pub(crate) struct CommittedEntry {
    pub(crate) term: Term,
    pub(crate) index: Index,
    pub(crate) payload: EntryPayload,
    pub(crate) notifier: Option<AppliedNotifier>,
}

pub(super) fn new() -> (CommitStreamPublisher, CommitStream) {
    let (tx, rx) = mpsc::unbounded_channel();

    let applier_sender = CommitStreamPublisher { sender: tx };
    let applier_receiver = CommitStream { receiver: rx };

    (applier_sender, applier_receiver)
}

impl CommitStreamPublisher {
    pub(super) fn notify_commit(&self, logger: &slog::Logger, committed_entry: CommittedEntry) {
        self.publish(logger, CommitStreamItem::Entry(committed_entry));
    }

    pub(super) fn notify_restore(&self, logger: &slog::Logger, snapshot: Arc<Snapshot>) {
        self.publish(logger, CommitStreamItem::Restore(snapshot));
    }

    fn publish(&self, logger: &slog::Logger, item: CommitStreamItem) {
        if self.sender.send(item).is_err() {
            slog::warn!(logger, "CommitStream has disconnected.");
        }
    }
}

impl CommitStream {
    pub(crate) async fn recv(&mut self) -> Option<CommitStreamItem> {
        self.receiver.recv().await
    }
}
