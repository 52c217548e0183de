use crate::task::{Id, State};
use std::fmt;
use std::time::Duration;

/// Contract violations reported by the scheduler. None of them abort the
/// process, they are returned to the caller that broke the contract.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("task {name}({id}) is already queued on thread {thread}")]
    AlreadyQueued { id: Id, name: String, thread: usize },

    #[error("task {name}({id}) is not waiting for task {dependency}")]
    UnknownDependency { id: Id, name: String, dependency: Id },

    #[error("task {name}({id}) dependencies are frozen while {state}")]
    DependencyFrozen { id: Id, name: String, state: State },

    #[error("task {name}({id}) cannot depend on itself")]
    SelfDependency { id: Id, name: String },

    #[error("task {name}({id}) cannot transition from {from} to {to}")]
    InvalidTransition {
        id: Id,
        name: String,
        from: State,
        to: State,
    },

    #[error("task {name}({id}) is held by thread {thread}")]
    Busy { id: Id, name: String, thread: usize },

    #[error("fence on thread {thread} is not set")]
    FenceNotSet { thread: usize },

    #[error("{pending} thread(s) did not reach their fence within {elapsed:?}")]
    FenceTimeout { elapsed: Duration, pending: usize },

    #[error("task manager is shut down")]
    ShutDown,
}

/// Why a task ended up [`State::Failed`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    #[error("{0}")]
    Explicit(String),

    #[error("dependency {name}({id}) failed")]
    DependencyFailed { id: Id, name: String },

    #[error("starved after {deferrals} deferrals")]
    Starved { deferrals: u64 },

    #[error("panicked: {0}")]
    Panicked(String),
}

/// Entry of the manager's failure log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub id: Id,
    pub name: String,
    pub owner: String,
    pub reason: FailureReason,
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: task {}({}) failed: {}",
            self.owner, self.name, self.id, self.reason
        )
    }
}
