use crate::task::{Id, Task, WeakTask};
use smallvec::SmallVec;
use std::fmt;

/// Most tasks wait on a handful of others, keep the edges on the stack.
pub(crate) const INLINE_EDGES: usize = 4;

pub(crate) type TaskVec = SmallVec<[Task; INLINE_EDGES]>;

/// Both directions of a task's dependency edges.
///
/// Dependencies are held strongly so they stay alive until they notify us,
/// dependents weakly so a completed graph does not keep itself alive.
#[derive(Default)]
pub(crate) struct Dependencies {
    waiting_for: TaskVec,
    waiting_for_me: SmallVec<[WeakTask; INLINE_EDGES]>,
}

impl Dependencies {
    pub(super) fn is_waiting(&self) -> bool {
        !self.waiting_for.is_empty()
    }

    pub(super) fn is_waiting_for(&self, id: Id) -> bool {
        self.waiting_for.iter().any(|t| t.id() == id)
    }

    pub(super) fn num_waiting_for(&self) -> usize {
        self.waiting_for.len()
    }

    pub(super) fn num_waiting_for_me(&self) -> usize {
        self.waiting_for_me.len()
    }

    pub(super) fn waiting_for(&self) -> TaskVec {
        self.waiting_for.clone()
    }

    /// Returns false if the edge already exists.
    pub(super) fn add_waiting_for(&mut self, task: Task) -> bool {
        if self.is_waiting_for(task.id()) {
            return false;
        }

        self.waiting_for.push(task);
        true
    }

    pub(super) fn remove_waiting_for(&mut self, id: Id) -> Option<Task> {
        let pos = self.waiting_for.iter().position(|t| t.id() == id)?;
        Some(self.waiting_for.remove(pos))
    }

    pub(super) fn add_waiting_for_me(&mut self, task: WeakTask) {
        if !self.waiting_for_me.iter().any(|t| t.id() == task.id()) {
            self.waiting_for_me.push(task);
        }
    }

    pub(super) fn remove_waiting_for_me(&mut self, id: Id) {
        self.waiting_for_me.retain(|t| t.id() != id);
    }

    pub(super) fn dependents(&self) -> impl Iterator<Item = Task> + '_ {
        self.waiting_for_me.iter().filter_map(WeakTask::upgrade)
    }

    pub(super) fn take_waiting_for(&mut self) -> TaskVec {
        std::mem::take(&mut self.waiting_for)
    }

    pub(super) fn take_waiting_for_me(&mut self) -> SmallVec<[WeakTask; INLINE_EDGES]> {
        std::mem::take(&mut self.waiting_for_me)
    }
}

impl fmt::Debug for Dependencies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dependencies")
            .field(
                "waiting_for",
                &self.waiting_for.iter().map(Task::id).collect::<Vec<_>>(),
            )
            .field(
                "waiting_for_me",
                &self.waiting_for_me.iter().map(WeakTask::id).collect::<Vec<_>>(),
            )
            .finish()
    }
}
