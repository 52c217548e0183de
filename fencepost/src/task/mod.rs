// Public API
mod error;
pub use self::error::{FailureReason, TaskError, TaskFailure};

pub mod id;
pub use self::id::{Id, IdGenerator, id, try_id};

mod state;
pub use self::state::State;

mod work;
pub use self::work::{Outcome, TaskContext, Work};

#[allow(clippy::module_inception)]
mod task;
pub use self::task::{DestructionTask, Task};
pub(crate) use self::task::WeakTask;

mod dependencies;

mod header;
