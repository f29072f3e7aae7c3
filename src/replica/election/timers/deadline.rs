use std::sync::{Arc, Mutex};
use tokio::time::Instant;

#[derive(Default)]
struct State {
    deadline: Option<Instant>,
    retired: bool,
}

/// What a timer task should do next.
#[derive(Debug, PartialEq)]
pub(super) enum NextStep {
    SleepUntil(Instant),
    /// The last deadline passed and nobody pushed it out.
    Fire,
    /// The owning handle was dropped.
    Retire,
}

pub(super) fn new() -> (DeadlineSetter, DeadlineReader) {
    let state = Arc::new(Mutex::new(State::default()));

    (DeadlineSetter { state: state.clone() }, DeadlineReader { state })
}

/// DeadlineSetter lives in the timer handle. Dropping it retires the task.
pub(super) struct DeadlineSetter {
    state: Arc<Mutex<State>>,
}

impl DeadlineSetter {
    pub(super) fn set(&self, deadline: Instant) {
        lock(&self.state).deadline.replace(deadline);
    }
}

impl Drop for DeadlineSetter {
    fn drop(&mut self) {
        lock(&self.state).retired = true;
    }
}

pub(super) struct DeadlineReader {
    state: Arc<Mutex<State>>,
}

impl DeadlineReader {
    /// Consumes the pending deadline. Once consumed, the deadline counts as passed unless the
    /// setter replaces it before the next call.
    pub(super) fn next_step(&self) -> NextStep {
        let mut state = lock(&self.state);
        if state.retired {
            return NextStep::Retire;
        }
        match state.deadline.take() {
            Some(deadline) => NextStep::SleepUntil(deadline),
            None => NextStep::Fire,
        }
    }

    pub(super) fn set(&self, deadline: Instant) {
        lock(&self.state).deadline.replace(deadline);
    }
}

fn lock(state: &Mutex<State>) -> std::sync::MutexGuard<'_, State> {
    state.lock().expect("Timer deadline mutex guard poison")
}
