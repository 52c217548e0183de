use crate::context;
use std::sync::atomic::{AtomicU64, Ordering};

use std::{fmt, num::NonZeroU64};

/// An opaque ID that uniquely identifies a task among every task created from
/// the same [`IdGenerator`].
///
/// # Notes
///
/// - Task IDs are monotonically increasing in creation order, they are never
///   reset while the generator lives.
/// - The ID of the currently executing task can be obtained from inside
///   [`Work::execute`] via [`task::try_id()`](crate::task::try_id()) and
///   [`task::id()`](crate::task::id()), and from outside via [`Task::id()`].
///
/// [`Work::execute`]: crate::task::Work::execute
/// [`Task::id()`]: crate::task::Task::id
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct Id(pub(crate) NonZeroU64);

/// Returns the [`Id`] of the currently executing task.
///
/// # Panics
///
/// This function panics if called from outside a task. For a version of this
/// function that doesn't panic, see [`task::try_id()`](crate::task::try_id()).
pub fn id() -> Id {
    context::current_task_id().expect("Can't get a task id when not inside a task")
}

/// Returns the [`Id`] of the currently executing task, or `None` if called
/// outside of a task.
pub fn try_id() -> Option<Id> {
    context::current_task_id()
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Id {
    pub fn as_u64(&self) -> u64 {
        self.0.get()
    }
}

/// Atomic source of task ids. The [`TaskManager`] owns one and shares it with
/// every [`TaskQueue`] that creates tasks for it.
///
/// [`TaskManager`]: crate::runtime::TaskManager
/// [`TaskQueue`]: crate::queue::TaskQueue
#[derive(Debug)]
pub struct IdGenerator {
    counter: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> Id {
        let id = self.counter.fetch_add(1, Ordering::Relaxed);

        // Even at 1 billion tasks/sec, it would take 584 years to wrap around.
        let Some(id) = NonZeroU64::new(id) else {
            Self::exhausted();
        };

        Id(id)
    }

    /// Number of ids handed out so far.
    pub fn issued(&self) -> u64 {
        self.counter.load(Ordering::Relaxed) - 1
    }

    #[cold]
    fn exhausted() -> ! {
        panic!("failed to generate unique task ID: bitspace exhausted")
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Set and clear the task id in the context while the task's work executes.
pub(crate) struct TaskIdGuard {
    parent_task_id: Option<Id>,
}

impl TaskIdGuard {
    pub(crate) fn enter(id: Id) -> Self {
        TaskIdGuard {
            parent_task_id: context::set_current_task_id(Some(id)),
        }
    }
}

impl Drop for TaskIdGuard {
    fn drop(&mut self) {
        context::set_current_task_id(self.parent_task_id);
    }
}
