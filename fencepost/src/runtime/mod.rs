use crate::context;

// Public API
mod builder;
pub use builder::{Builder, DependencyFailurePolicy, IdleStrategy};

pub(crate) use builder::RuntimeConfig;

mod manager;
pub use manager::TaskManager;

mod thread;
pub use thread::{TaskThread, ThreadStats};

// Exports
mod shared;

mod ticker;

/// Returns the index of the [`TaskThread`] running the caller, or `None` when
/// called from a thread the [`TaskManager`] does not own.
pub fn current_thread_index() -> Option<usize> {
    context::current_thread_index()
}

#[cfg(test)]
mod tests;
