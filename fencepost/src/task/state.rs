use std::fmt;

/// Lifecycle of a [`Task`](crate::task::Task).
///
/// ```text
/// New ──push──> Queued ──execute──> Active ─┬─> Completed
///                 │                  │  ^   └─> Failed
///                 │                  └──┘ retry
///                 └──────────────────────────> Failed (starved, dependency failed)
///
/// Completed | Failed ──push──> Queued          (re-submission)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum State {
    /// Constructed but never pushed to a thread, or explicitly reset.
    #[default]
    New,

    /// Held by a thread, `execute()` not invoked yet.
    Queued,

    /// `execute()` has been invoked at least once and asked to run again.
    Active,

    Completed,

    Failed,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Completed | State::Failed)
    }

    /// The task belongs to a thread's queue.
    pub fn is_in_flight(self) -> bool {
        matches!(self, State::Queued | State::Active)
    }

    pub(crate) fn can_transition_to(self, next: State) -> bool {
        use State::*;

        matches!(
            (self, next),
            (New, Queued)
                | (Queued, Active)
                | (Active, Active)
                | (Active, Completed)
                | (Active, Failed)
                | (Queued, Failed)
                | (Completed, Queued)
                | (Failed, Queued)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            State::New => "NEW",
            State::Queued => "QUEUED",
            State::Active => "ACTIVE",
            State::Completed => "COMPLETED",
            State::Failed => "FAILED",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
