use crate::task::{FailureReason, Id, State};
use std::sync::Arc;

/// Mutable scheduling data of a task. Only the thread holding the task
/// writes to it while it is in flight, with one exception: a failing
/// dependency may set `failed_dependency` from another thread.
#[derive(Debug, Default)]
pub(crate) struct Header {
    pub(super) state: State,

    /// Index of the `TaskThread` holding the task, `None` when not in flight.
    pub(super) thread: Option<usize>,

    /// Scans that could not run the task, plus retries requested by its work.
    pub(super) deferrals: u64,

    /// Retries requested in `retry_round`, used to park busy-looping work.
    pub(super) retries: u32,
    pub(super) retry_round: u64,

    /// Round in which the task was parked. A task is parked only while this
    /// matches the current round, so nothing has to be unparked explicitly.
    pub(super) parked_round: Option<u64>,

    /// Round in which the task reached a terminal state.
    pub(super) finished_round: Option<u64>,

    pub(super) failure: Option<FailureReason>,

    /// First failed dependency, set by that dependency under the cascade
    /// policy.
    pub(super) failed_dependency: Option<(Id, Arc<str>)>,
}

impl Header {
    /// Per-submission state is cleared when a task enters a thread's queue.
    pub(super) fn submit(&mut self, thread: usize) {
        *self = Header {
            state: State::Queued,
            thread: Some(thread),
            ..Header::default()
        };
    }

    pub(super) fn is_parked(&self, round: u64) -> bool {
        self.parked_round == Some(round)
    }

    /// Returns the number of retries requested during `round`.
    pub(super) fn retry(&mut self, round: u64) -> u32 {
        if self.retry_round != round {
            self.retry_round = round;
            self.retries = 0;
        }

        self.deferrals += 1;
        self.retries += 1;
        self.retries
    }

    pub(super) fn finish(&mut self, state: State, round: u64) {
        debug_assert!(state.is_terminal());
        self.state = state;
        self.thread = None;
        self.parked_round = None;
        self.finished_round = Some(round);
    }
}
