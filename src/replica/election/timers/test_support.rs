use crate::actor::Event;
use crate::replica::LeaderTimerTick;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

const SANITY_TIMEOUT: Duration = Duration::from_secs(5);

/// ActorQueueWatcher stands in for the actor and checks what timers send it.
pub(super) struct ActorQueueWatcher {
    rx: mpsc::Receiver<Event>,
    quiet_period: Duration,
}

impl ActorQueueWatcher {
    pub(super) fn new(rx: mpsc::Receiver<Event>) -> Self {
        ActorQueueWatcher {
            rx,
            quiet_period: Duration::from_millis(10),
        }
    }

    pub(super) async fn expect_leader_tick(&mut self, expected: &LeaderTimerTick) {
        match self.next_event().await {
            Event::LeaderTimer(tick) => assert_eq!(&tick, expected),
            other => panic!("Expected leader tick, got {:?}", other),
        }
    }

    pub(super) async fn expect_follower_timeout(&mut self) {
        match self.next_event().await {
            Event::FollowerTimeout => {}
            other => panic!("Expected follower timeout, got {:?}", other),
        }
    }

    pub(super) async fn expect_silence(&mut self) {
        if let Ok(event) = time::timeout(self.quiet_period, self.rx.recv()).await {
            panic!("Expected no event, got {:?}", event);
        }
    }

    async fn next_event(&mut self) -> Event {
        time::timeout(SANITY_TIMEOUT, self.rx.recv())
            .await
            .expect("Timed out waiting for timer event")
            .expect("Actor queue closed")
    }
}

pub(super) async fn wait_for_exit(task: JoinHandle<()>) {
    time::timeout(SANITY_TIMEOUT, task)
        .await
        .expect("Timer task didn't exit")
        .expect("Timer task panicked");
}
