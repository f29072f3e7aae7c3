use tokio::time::{Duration, Instant};

/// Clock is the timers' only source of time, so tests can drive it by hand.
#[async_trait::async_trait]
pub(crate) trait Clock: Clone + Send + Sync + 'static {
    fn now(&self) -> Instant;

    async fn sleep_until(&mut self, deadline: Instant);

    async fn sleep(&mut self, duration: Duration) {
        let deadline = self.now() + duration;
        self.sleep_until(deadline).await;
    }
}

#[derive(Copy, Clone)]
pub(crate) struct RealClock;

#[async_trait::async_trait]
impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep_until(&mut self, deadline: Instant) {
        tokio::time::sleep_until(deadline).await;
    }
}

#[cfg(test)]
pub(super) use manual::{manual_clock, ManualClock};

#[cfg(test)]
mod manual {
    use super::*;
    use tokio::sync::watch;

    pub(in crate::replica::election::timers) fn manual_clock() -> (ManualClock, ClockDriver) {
        let start = Instant::now();
        let (tx, rx) = watch::channel(start);

        (ManualClock { now: rx }, ClockDriver { now: tx, start })
    }

    /// A clock that only moves when its `ClockDriver` says so.
    #[derive(Clone)]
    pub(in crate::replica::election::timers) struct ManualClock {
        now: watch::Receiver<Instant>,
    }

    #[async_trait::async_trait]
    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            *self.now.borrow()
        }

        async fn sleep_until(&mut self, deadline: Instant) {
            loop {
                let now = *self.now.borrow();
                if now >= deadline {
                    return;
                }
                if self.now.changed().await.is_err() {
                    // Driver is gone, time will never reach the deadline.
                    std::future::pending::<()>().await;
                }
            }
        }
    }

    pub(in crate::replica::election::timers) struct ClockDriver {
        now: watch::Sender<Instant>,
        start: Instant,
    }

    impl ClockDriver {
        pub(in crate::replica::election::timers) fn elapsed(&self) -> Duration {
            *self.now.borrow() - self.start
        }

        /// Sleepers wake once `now` is at or past their deadline, however far past. Advance in
        /// steps no larger than what the test wants to observe.
        pub(in crate::replica::election::timers) fn advance(&mut self, duration: Duration) {
            let next = *self.now.borrow() + duration;
            let _ = self.now.send(next);
        }
    }

    #[tokio::test]
    async fn sleepers_wake_only_when_driven_past_deadline() {
        let step = Duration::from_millis(100);
        let (clock, mut driver) = manual_clock();

        let mut sleeper = clock.clone();
        let deadline = clock.now() + step * 2;
        let wake = tokio::spawn(async move { sleeper.sleep_until(deadline).await });

        driver.advance(step);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!wake.is_finished());

        driver.advance(step * 3);
        tokio::time::timeout(Duration::from_secs(1), wake)
            .await
            .expect("sleeper should wake")
            .unwrap();
        assert_eq!(driver.elapsed(), step * 4);
        assert_eq!(clock.now(), deadline + step * 2);
    }
}
