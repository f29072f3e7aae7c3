use crate::actor::WeakActorClient;
use crate::replica::election::timers::clock::{Clock, RealClock};
use crate::replica::election::timers::deadline::{self, DeadlineReader, DeadlineSetter, NextStep};
use crate::replica::{LeaderTimerTick, ReplicaId, Term};
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// LeaderTimerHandle drives replication to one peer. The first tick is immediate, then one tick
/// per heartbeat unless the leader resets the timer because it already talked to the peer.
pub(crate) struct LeaderTimerHandle<C: Clock = RealClock> {
    deadline: DeadlineSetter,
    heartbeat_duration: Duration,
    clock: C,
}

struct LeaderTimerTask<C: Clock> {
    deadline: DeadlineReader,
    heartbeat_duration: Duration,
    actor_client: WeakActorClient,
    clock: C,
    tick: LeaderTimerTick,
}

impl LeaderTimerHandle {
    pub(crate) fn spawn_timer_task(
        heartbeat_duration: Duration,
        actor_client: WeakActorClient,
        peer_id: ReplicaId,
        term: Term,
    ) -> Self {
        let (handle, _) = Self::spawn_with_clock(heartbeat_duration, actor_client, peer_id, term, RealClock);
        handle
    }
}

impl<C: Clock> LeaderTimerHandle<C> {
    fn spawn_with_clock(
        heartbeat_duration: Duration,
        actor_client: WeakActorClient,
        peer_id: ReplicaId,
        term: Term,
        clock: C,
    ) -> (Self, JoinHandle<()>) {
        let (setter, reader) = deadline::new();
        let task = LeaderTimerTask {
            deadline: reader,
            heartbeat_duration,
            actor_client,
            clock: clock.clone(),
            tick: LeaderTimerTick { peer_id, term },
        };
        let handle = LeaderTimerHandle {
            deadline: setter,
            heartbeat_duration,
            clock,
        };

        (handle, tokio::spawn(task.run()))
    }

    pub(crate) fn reset_heartbeat_timer(&self) {
        self.deadline.set(self.clock.now() + self.heartbeat_duration);
    }
}

impl<C: Clock> LeaderTimerTask<C> {
    async fn run(mut self) {
        loop {
            match self.deadline.next_step() {
                NextStep::Retire => return,
                NextStep::SleepUntil(deadline) => self.clock.sleep_until(deadline).await,
                NextStep::Fire => {
                    if self.actor_client.leader_timer(self.tick.clone()).await.is_err() {
                        return;
                    }
                    // Missed heartbeats are not made up for.
                    self.deadline.set(self.clock.now() + self.heartbeat_duration);
                }
            }
        }
    }
}
