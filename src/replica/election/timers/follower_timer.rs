use crate::actor::WeakActorClient;
use crate::replica::election::timers::clock::{Clock, RealClock};
use crate::replica::election::timers::deadline::{self, DeadlineReader, DeadlineSetter, NextStep};
use rand::Rng;
use std::ops::RangeInclusive;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

/// FollowerTimerHandle is owned by followers and candidates. If it isn't reset within a random
/// timeout, the actor gets a `FollowerTimeout` and starts an election.
pub(crate) struct FollowerTimerHandle<C: Clock = RealClock> {
    deadline: DeadlineSetter,
    timeout_range: RangeInclusive<Duration>,
    clock: C,
}

struct FollowerTimerTask<C: Clock> {
    deadline: DeadlineReader,
    actor_client: WeakActorClient,
    clock: C,
    // Pause between repeated timeouts while nobody resets us.
    retry_after: Duration,
}

impl FollowerTimerHandle {
    pub(crate) fn spawn_timer_task(
        min_timeout: Duration,
        max_timeout: Duration,
        actor_client: WeakActorClient,
    ) -> Self {
        let (handle, _) = Self::spawn_with_clock(min_timeout, max_timeout, actor_client, RealClock);
        handle
    }
}

impl<C: Clock> FollowerTimerHandle<C> {
    fn spawn_with_clock(
        min_timeout: Duration,
        max_timeout: Duration,
        actor_client: WeakActorClient,
        clock: C,
    ) -> (Self, JoinHandle<()>) {
        let (setter, reader) = deadline::new();
        let handle = FollowerTimerHandle {
            deadline: setter,
            timeout_range: min_timeout..=max_timeout,
            clock: clock.clone(),
        };
        // Arm before the task starts, or it would fire straight away.
        handle.reset_timeout();

        let task = FollowerTimerTask {
            deadline: reader,
            actor_client,
            clock,
            retry_after: min_timeout,
        };

        (handle, tokio::spawn(task.run()))
    }

    pub(crate) fn reset_timeout(&self) {
        self.deadline.set(self.random_deadline());
    }

    fn random_deadline(&self) -> Instant {
        let timeout = rand::thread_rng().gen_range(self.timeout_range.clone());
        self.clock.now() + timeout
    }
}

impl<C: Clock> FollowerTimerTask<C> {
    async fn run(mut self) {
        loop {
            match self.deadline.next_step() {
                NextStep::Retire => return,
                NextStep::SleepUntil(deadline) => self.clock.sleep_until(deadline).await,
                NextStep::Fire => {
                    if self.actor_client.follower_timeout().await.is_err() {
                        return;
                    }
                    self.clock.sleep(self.retry_after).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorClient;
    use crate::replica::election::timers::clock::manual_clock;
    use crate::replica::election::timers::test_support::{wait_for_exit, ActorQueueWatcher};

    const MIN: Duration = Duration::from_millis(100);
    const MAX: Duration = Duration::from_millis(200);

    #[tokio::test]
    async fn resets_postpone_the_timeout() {
        let (actor_client, rx) = ActorClient::new(10);
        let mut queue = ActorQueueWatcher::new(rx);
        let (clock, mut driver) = manual_clock();
        let (handle, _task) = FollowerTimerHandle::spawn_with_clock(MIN, MAX, actor_client.weak(), clock);

        for _ in 0..5 {
            driver.advance(MIN / 2);
            queue.expect_silence().await;
            handle.reset_timeout();
        }

        driver.advance(MAX);
        queue.expect_follower_timeout().await;
    }

    #[tokio::test]
    async fn timeout_repeats_until_reset() {
        let (actor_client, rx) = ActorClient::new(10);
        let mut queue = ActorQueueWatcher::new(rx);
        let (clock, mut driver) = manual_clock();
        let (handle, _task) = FollowerTimerHandle::spawn_with_clock(MIN, MAX, actor_client.weak(), clock);

        driver.advance(MAX);
        queue.expect_follower_timeout().await;
        driver.advance(MIN);
        queue.expect_follower_timeout().await;

        handle.reset_timeout();
        driver.advance(MIN / 2);
        queue.expect_silence().await;
    }

    #[tokio::test]
    async fn dropping_handle_retires_task() {
        let (actor_client, rx) = ActorClient::new(10);
        let mut queue = ActorQueueWatcher::new(rx);
        let (clock, mut driver) = manual_clock();
        let (handle, task) = FollowerTimerHandle::spawn_with_clock(MIN, MAX, actor_client.weak(), clock);

        drop(handle);
        driver.advance(MAX);
        wait_for_exit(task).await;
        queue.expect_silence().await;
    }

    #[tokio::test]
    async fn task_exits_once_actor_is_gone() {
        let (actor_client, _rx) = ActorClient::new(10);
        let (clock, mut driver) = manual_clock();
        let (_handle, task) = FollowerTimerHandle::spawn_with_clock(MIN, MAX, actor_client.weak(), clock);

        drop(actor_client);
        driver.advance(MAX);
        wait_for_exit(task).await;
    }
}
