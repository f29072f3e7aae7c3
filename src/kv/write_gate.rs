use crate::api::{ElectionEvent, Event, EventListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// WriteGate fast-rejects writes on replicas that aren't leader. It is only ever toggled by the
/// task consuming election events, so it can lag the replica by one event.
#[derive(Clone)]
pub(crate) struct WriteGate {
    open: Arc<AtomicBool>,
}

impl WriteGate {
    pub(crate) fn closed() -> Self {
        WriteGate {
            open: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Spawns the task that follows leadership changes. It exits when the replica does.
    pub(crate) fn spawn_consumer(&self, logger: slog::Logger, mut event_listener: EventListener) {
        let open = self.open.clone();
        tokio::task::spawn(async move {
            while let Some(event) = event_listener.next_event().await {
                let Event::Election(election_event) = event;
                let is_leader = election_event == ElectionEvent::Leader;
                if open.swap(is_leader, Ordering::AcqRel) != is_leader {
                    slog::info!(logger, "Write gate open: {}", is_leader);
                }
            }
            open.store(false, Ordering::Release);
            slog::info!(logger, "Replica exited. Write gate closed for good.");
        });
    }
}
