use crate::task::Id;
use std::cell::Cell;
use std::thread_local;

// The worker sets its index once on startup, `TaskIdGuard` swaps the task id
// around each `execute()`.
thread_local! {
    static CURRENT_TASK_ID: Cell<Option<Id>> = const { Cell::new(None) };
    static CURRENT_THREAD_INDEX: Cell<Option<usize>> = const { Cell::new(None) };
}

pub(crate) fn current_task_id() -> Option<Id> {
    CURRENT_TASK_ID.with(|id| id.get())
}

/// Returns the previous task id so the caller can restore it.
pub(crate) fn set_current_task_id(id: Option<Id>) -> Option<Id> {
    CURRENT_TASK_ID.with(|cell| cell.replace(id))
}

pub(crate) fn current_thread_index() -> Option<usize> {
    CURRENT_THREAD_INDEX.with(|idx| idx.get())
}

pub(crate) fn set_current_thread_index(idx: Option<usize>) {
    CURRENT_THREAD_INDEX.with(|cell| cell.set(idx));
}
