use crate::task::Id;
use std::fmt;
use std::sync::Arc;

/// What a single `execute()` invocation decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The work is done, dependents are released.
    Completed,

    /// Run again on a later scan. Counts as a deferral.
    Retry,

    /// Terminal failure, never retried within this submission.
    Failed(String),
}

impl Outcome {
    pub fn failed(reason: impl fmt::Display) -> Self {
        Outcome::Failed(reason.to_string())
    }
}

/// Read-only view of the executing task handed to [`Work::execute`].
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub(crate) id: Id,
    pub(crate) name: Arc<str>,
    pub(crate) thread: usize,
    pub(crate) deferrals: u64,
    pub(crate) round: u64,
}

impl TaskContext {
    pub fn id(&self) -> Id {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Index of the [`TaskThread`](crate::runtime::TaskThread) executing the work.
    pub fn thread(&self) -> usize {
        self.thread
    }

    /// Deferrals accumulated by the task so far in this submission.
    pub fn deferrals(&self) -> u64 {
        self.deferrals
    }

    pub fn round(&self) -> u64 {
        self.round
    }
}

/// The unit of work a subsystem plugs into a [`Task`](crate::task::Task).
///
/// An `Err` is a transient execution error: it is treated exactly like
/// [`Outcome::Retry`]. A panic is caught and fails the task.
pub trait Work: Send + 'static {
    fn execute(&mut self, ctx: &TaskContext) -> anyhow::Result<Outcome>;
}

impl<F> Work for F
where
    F: FnMut(&TaskContext) -> anyhow::Result<Outcome> + Send + 'static,
{
    fn execute(&mut self, ctx: &TaskContext) -> anyhow::Result<Outcome> {
        self(ctx)
    }
}
