use crate::commitlog::Log;
use crate::replica::{
    AppendEntriesError, AppendEntriesInput, AppendEntriesOutput, AppendEntriesReplyFromPeer,
    EnqueueForReplicationError, EnqueueForReplicationInput, EnqueueForReplicationOutput, InstallSnapshotError,
    InstallSnapshotInput, InstallSnapshotOutput, InstallSnapshotReplyFromPeer, LeaderTimerTick, Replica,
    ReplicaStatus, RequestVoteError, RequestVoteInput, RequestVoteOutput, RequestVoteReplyFromPeer,
    WriteAheadLogEntry,
};
use crate::snapshot::Snapshot;
use std::error::Error;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

// v1 Design choice: Disk interaction is synchronous inside the actor. The only long running disk
//                   work (snapshot serialization) happens on the applier's side and comes back
//                   as an event.
#[derive(Debug)]
pub(crate) enum Event {
    // Leader: Write to disk, locally buffer entry to be replicated later. Also stores callback.
    // Candidate: Reject request.
    // Follower: Redirect.
    EnqueueForReplication(
        EnqueueForReplicationInput,
        Callback<EnqueueForReplicationOutput, EnqueueForReplicationError>,
    ),

    // Leader: Grant vote if applicable (includes write to disk). Transition to follower.
    // Candidate: Grant vote if applicable (includes write to disk). Transition to follower.
    // Follower: Grant vote if applicable (includes write to disk).
    RequestVote(RequestVoteInput, Callback<RequestVoteOutput, RequestVoteError>),

    // Leader: discard
    // Candidate: Update local state. Transition to leader if quorum vote.
    // Follower: discard
    RequestVoteReplyFromPeer(RequestVoteReplyFromPeer),

    // Leader: Transition to follower if applicable. Clean up log. Respond to request.
    // Candidate: Transition to follower if applicable. Clean up log. Respond to request.
    // Follower: Write to disk then respond. Reset timeout.
    AppendEntries(AppendEntriesInput, Callback<AppendEntriesOutput, AppendEntriesError>),

    // Leader: Update local state tracking each entry's replication progress. Advance commit index.
    // Candidate: discard
    // Follower: discard
    AppendEntriesReplyFromPeer(AppendEntriesReplyFromPeer),

    // Any: Persist the leader's snapshot, replace our log prefix, restore the state machine.
    InstallSnapshot(InstallSnapshotInput, Callback<InstallSnapshotOutput, InstallSnapshotError>),

    // Leader: Move the peer's cursor past the snapshot.
    // Candidate/Follower: discard
    InstallSnapshotReplyFromPeer(InstallSnapshotReplyFromPeer),

    // Leader: Call AppendEntries (or InstallSnapshot) on the peer with the un-replicated entries.
    // Candidate/Follower: discard
    LeaderTimer(LeaderTimerTick),

    // Leader: discard
    // Candidate: Trigger new election.
    // Follower: Transition to candidate. Trigger new election.
    FollowerTimeout,

    // Any: Compact the log up to the snapshot our own applier just persisted.
    SnapshotPersisted(Arc<Snapshot>),

    Status(oneshot::Sender<ReplicaStatus>),
}

#[derive(Debug)]
pub(crate) struct Callback<O: Debug, E: Error>(oneshot::Sender<Result<O, E>>);

impl<O: Debug, E: Error> Callback<O, E> {
    pub(crate) fn send(self, message: Result<O, E>) {
        let _ = self.0.send(message);
    }
}

/// ActorClient is the owning handle to the replica actor. The actor runs until every
/// `ActorClient` is dropped.
#[derive(Clone)]
pub(crate) struct ActorClient {
    sender: mpsc::Sender<Event>,
}

/// WeakActorClient is held by everything the actor itself owns or spawns (timers, RPC tasks, the
/// RPC server, the applier) so that none of them keep the actor alive.
#[derive(Clone)]
pub(crate) struct WeakActorClient {
    sender: mpsc::WeakSender<Event>,
}

impl ActorClient {
    pub(crate) fn new(buffer_size: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(buffer_size);

        (ActorClient { sender: tx }, rx)
    }

    pub(crate) fn weak(&self) -> WeakActorClient {
        WeakActorClient {
            sender: self.sender.downgrade(),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    pub(crate) async fn enqueue_for_replication(
        &self,
        input: EnqueueForReplicationInput,
    ) -> Result<EnqueueForReplicationOutput, EnqueueForReplicationError> {
        let (tx, rx) = oneshot::channel();
        send(&self.sender, Event::EnqueueForReplication(input, Callback(tx)))
            .await
            .map_err(|_| EnqueueForReplicationError::ActorExited)?;

        rx.await.unwrap_or(Err(EnqueueForReplicationError::ActorExited))
    }

    /// Returns None if the actor has exited.
    pub(crate) async fn status(&self) -> Option<ReplicaStatus> {
        let (tx, rx) = oneshot::channel();
        send(&self.sender, Event::Status(tx)).await.ok()?;

        rx.await.ok()
    }
}

impl WeakActorClient {
    pub(crate) async fn request_vote(&self, input: RequestVoteInput) -> Result<RequestVoteOutput, RequestVoteError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::RequestVote(input, Callback(tx)))
            .await
            .map_err(|_| RequestVoteError::ActorExited)?;

        rx.await.unwrap_or(Err(RequestVoteError::ActorExited))
    }

    pub(crate) async fn append_entries(
        &self,
        input: AppendEntriesInput,
    ) -> Result<AppendEntriesOutput, AppendEntriesError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::AppendEntries(input, Callback(tx)))
            .await
            .map_err(|_| AppendEntriesError::ActorExited)?;

        rx.await.unwrap_or(Err(AppendEntriesError::ActorExited))
    }

    pub(crate) async fn install_snapshot(
        &self,
        input: InstallSnapshotInput,
    ) -> Result<InstallSnapshotOutput, InstallSnapshotError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::InstallSnapshot(input, Callback(tx)))
            .await
            .map_err(|_| InstallSnapshotError::ActorExited)?;

        rx.await.unwrap_or(Err(InstallSnapshotError::ActorExited))
    }

    pub(crate) async fn notify_request_vote_reply_from_peer(&self, reply: RequestVoteReplyFromPeer) -> Result<(), ()> {
        self.send(Event::RequestVoteReplyFromPeer(reply)).await
    }

    pub(crate) async fn notify_append_entries_reply_from_peer(
        &self,
        reply: AppendEntriesReplyFromPeer,
    ) -> Result<(), ()> {
        self.send(Event::AppendEntriesReplyFromPeer(reply)).await
    }

    pub(crate) async fn notify_install_snapshot_reply_from_peer(
        &self,
        reply: InstallSnapshotReplyFromPeer,
    ) -> Result<(), ()> {
        self.send(Event::InstallSnapshotReplyFromPeer(reply)).await
    }

    pub(crate) async fn leader_timer(&self, tick: LeaderTimerTick) -> Result<(), ()> {
        self.send(Event::LeaderTimer(tick)).await
    }

    pub(crate) async fn follower_timeout(&self) -> Result<(), ()> {
        self.send(Event::FollowerTimeout).await
    }

    pub(crate) async fn snapshot_persisted(&self, snapshot: Arc<Snapshot>) -> Result<(), ()> {
        self.send(Event::SnapshotPersisted(snapshot)).await
    }

    async fn send(&self, event: Event) -> Result<(), ()> {
        match self.sender.upgrade() {
            Some(sender) => send(&sender, event).await,
            None => Err(()),
        }
    }
}

async fn send(sender: &mpsc::Sender<Event>, event: Event) -> Result<(), ()> {
    sender.send(event).await.map_err(|_| ())
}

/// ReplicaActor is replica logic in actor model.
pub(crate) struct ReplicaActor<L>
where
    L: Log<WriteAheadLogEntry>,
{
    logger: slog::Logger,
    receiver: mpsc::Receiver<Event>,
    replica: Replica<L>,
}

impl<L> ReplicaActor<L>
where
    L: Log<WriteAheadLogEntry> + Send + 'static,
{
    pub(crate) fn new(logger: slog::Logger, receiver: mpsc::Receiver<Event>, replica: Replica<L>) -> Self {
        ReplicaActor {
            logger,
            receiver,
            replica,
        }
    }

    pub(crate) async fn run_event_loop(mut self) {
        while let Some(event) = self.receiver.recv().await {
            self.handle_event(event);
            if self.replica.has_failed() {
                slog::crit!(self.logger, "Replica hit a storage failure. Stopping event loop.");
                return;
            }
        }
        slog::info!(self.logger, "All replica handles dropped. Stopping event loop.");
    }

    // This must NOT be async. Any long running work must be spawned on another task
    // and/or come as a callback to this actor.
    fn handle_event(&mut self, event: Event) {
        match event {
            Event::EnqueueForReplication(input, callback) => {
                let result = self.replica.handle_enqueue_for_replication(input);
                callback.send(result);
            }
            Event::RequestVote(input, callback) => {
                let result = self.replica.server_handle_request_vote(input);
                callback.send(result);
            }
            Event::RequestVoteReplyFromPeer(reply) => {
                self.replica.handle_request_vote_reply_from_peer(reply);
            }
            Event::AppendEntries(input, callback) => {
                let result = self.replica.server_handle_append_entries(input);
                callback.send(result);
            }
            Event::AppendEntriesReplyFromPeer(reply) => {
                self.replica.handle_append_entries_reply_from_peer(reply);
            }
            Event::InstallSnapshot(input, callback) => {
                let result = self.replica.server_handle_install_snapshot(input);
                callback.send(result);
            }
            Event::InstallSnapshotReplyFromPeer(reply) => {
                self.replica.handle_install_snapshot_reply_from_peer(reply);
            }
            Event::LeaderTimer(tick) => {
                self.replica.handle_leader_timer(tick);
            }
            Event::FollowerTimeout => {
                self.replica.handle_follower_timeout();
            }
            Event::SnapshotPersisted(snapshot) => {
                self.replica.handle_snapshot_persisted(snapshot);
            }
            Event::Status(callback) => {
                let _ = callback.send(self.replica.status());
            }
        }
    }
}
