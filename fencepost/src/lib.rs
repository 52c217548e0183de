//! Dependency-aware task scheduling for frame-based runtimes.
//!
//! A [`TaskManager`] owns a fixed pool of task threads. Each frame, callers
//! push [`Task`]s, clear the fences and wait for every thread to drain its
//! queue. Tasks run only once everything they depend on has completed.

#[doc(inline)]
pub use fencepost_macros::test;

mod context;

pub mod queue;
pub use queue::{QueueReport, TaskQueue};

pub mod runtime;
pub use runtime::{Builder, TaskManager, current_thread_index};

pub mod task;
pub use task::{DestructionTask, Outcome, Task, TaskContext, TaskError, Work};

mod utils;

#[cfg(test)]
mod test_utils;
