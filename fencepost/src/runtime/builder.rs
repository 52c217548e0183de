use crate::runtime::TaskManager;
use anyhow::{Result, anyhow};
use std::convert::TryFrom;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

/// How many retries a task may request within a single round before it is
/// parked until the next one.
const MAX_RETRIES_PER_ROUND: u32 = 64;

/// Log the queue status every N scan passes.
#[cfg(not(test))]
const REPORT_INTERVAL: u32 = 1024;

#[cfg(test)]
const REPORT_INTERVAL: u32 = 8; // make tests report faster

#[derive(Clone)]
pub(crate) struct ThreadNameFn(pub(crate) Arc<dyn Fn() -> String + Send + Sync + 'static>);

fn default_thread_name_fn() -> ThreadNameFn {
    let worker_count = Arc::new(AtomicUsize::new(0));

    ThreadNameFn(Arc::new(move || {
        let id = worker_count.fetch_add(1, Ordering::Relaxed);
        format!("fencepost-{}", id)
    }))
}

impl fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ThreadNameFn").field(&"<function>").finish()
    }
}

/// What a fenced worker does while it waits for its next round.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleStrategy {
    /// Spin on `thread::yield_now()`. Lowest wake-up latency, burns a core
    /// per idle worker.
    #[default]
    Yield,

    /// Park the thread with a bounded timeout. `clear_fences()` and shutdown
    /// unpark it.
    Park,
}

/// What happens to the dependents of a task that failed.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyFailurePolicy {
    /// Dependents fail with [`FailureReason::DependencyFailed`] on their next
    /// scan.
    ///
    /// [`FailureReason::DependencyFailed`]: crate::task::FailureReason::DependencyFailed
    #[default]
    Cascade,

    /// The failed dependency is cleared as if it had completed, dependents
    /// may run.
    Release,
}

#[derive(Debug)]
pub struct Builder {
    /// Number of `TaskThread`s. Defaults to one per core minus the thread
    /// driving the simulation.
    worker_threads: Option<usize>,

    /// Name fn used for threads spawned by the `TaskManager`.
    thread_name: ThreadNameFn,

    /// Stack size used for threads spawned by the `TaskManager`.
    thread_stack_size: Option<usize>,

    idle_strategy: IdleStrategy,

    max_retries_per_round: u32,

    /// Deferrals after which a task is demoted to `Failed(Starved)`. Unbounded
    /// by default.
    deferral_ceiling: Option<u64>,

    dependency_failure_policy: DependencyFailurePolicy,

    report_interval: u32,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Builder {
        Builder {
            worker_threads: None,
            thread_name: default_thread_name_fn(),
            thread_stack_size: None,
            idle_strategy: IdleStrategy::default(),
            max_retries_per_round: MAX_RETRIES_PER_ROUND,
            deferral_ceiling: None,
            dependency_failure_policy: DependencyFailurePolicy::default(),
            report_interval: REPORT_INTERVAL,
        }
    }

    /// The number of `TaskThread`s owned by the manager.
    ///
    /// Defaults to `max(available_parallelism - 1, 1)`.
    #[track_caller]
    pub fn worker_threads(mut self, val: usize) -> Self {
        assert!(val > 0, "worker_threads must be greater than 0");
        self.worker_threads = Some(val);
        self
    }

    /// Sets name of threads spawned by the `TaskManager`.
    ///
    /// The default name is "fencepost-{id}", where id is monotonically
    /// increasing.
    pub fn thread_name(mut self, val: impl Into<String>) -> Self {
        let val = val.into();
        self.thread_name = ThreadNameFn(Arc::new(move || val.clone()));
        self
    }

    /// Sets a function used to generate the name of threads spawned by the
    /// `TaskManager`.
    pub fn thread_name_fn<F>(mut self, f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.thread_name = ThreadNameFn(Arc::new(f));
        self
    }

    /// Sets the stack size (in bytes) for worker threads.
    ///
    /// The actual stack size may be greater than this value if the platform
    /// specifies minimal stack size.
    #[track_caller]
    pub fn thread_stack_size(mut self, val: usize) -> Self {
        assert!(
            val.is_power_of_two(),
            "thread_stack_size must be a power of two"
        );
        self.thread_stack_size = Some(val);
        self
    }

    pub fn idle_strategy(mut self, val: IdleStrategy) -> Self {
        self.idle_strategy = val;
        self
    }

    /// A task requesting more retries than this within one round is parked
    /// until the next round, so a permanently retrying task cannot hold the
    /// fence forever.
    #[track_caller]
    pub fn max_retries_per_round(mut self, val: u32) -> Self {
        assert!(val > 0, "max_retries_per_round must be greater than 0");
        self.max_retries_per_round = val;
        self
    }

    /// Demote tasks to `Failed(Starved)` once their deferral counter reaches
    /// `val`.
    #[track_caller]
    pub fn deferral_ceiling(mut self, val: u64) -> Self {
        assert!(val > 0, "deferral_ceiling must be greater than 0");
        self.deferral_ceiling = Some(val);
        self
    }

    pub fn dependency_failure_policy(mut self, val: DependencyFailurePolicy) -> Self {
        self.dependency_failure_policy = val;
        self
    }

    /// Log each thread's queue status every `val` scan passes.
    #[track_caller]
    pub fn report_interval(mut self, val: u32) -> Self {
        assert!(val > 0, "report_interval must be greater than 0");
        self.report_interval = val;
        self
    }

    /// Creates the configured `TaskManager`.
    ///
    /// Every thread is started and fenced when this returns, ready to accept
    /// tasks.
    pub fn try_build(self) -> Result<TaskManager> {
        let cfg = RuntimeConfig::try_from(self)?;
        TaskManager::start(cfg)
    }
}

// Export the builder as a RuntimeConfig object shared by the manager and every
// thread.
#[derive(Debug, Clone)]
pub(crate) struct RuntimeConfig {
    pub(crate) worker_threads: usize,
    pub(crate) thread_name: ThreadNameFn,
    pub(crate) thread_stack_size: Option<usize>,
    pub(crate) idle_strategy: IdleStrategy,
    pub(crate) max_retries_per_round: u32,
    pub(crate) deferral_ceiling: Option<u64>,
    pub(crate) dependency_failure_policy: DependencyFailurePolicy,
    pub(crate) report_interval: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            worker_threads: 1,
            thread_name: default_thread_name_fn(),
            thread_stack_size: None,
            idle_strategy: IdleStrategy::default(),
            max_retries_per_round: MAX_RETRIES_PER_ROUND,
            deferral_ceiling: None,
            dependency_failure_policy: DependencyFailurePolicy::default(),
            report_interval: REPORT_INTERVAL,
        }
    }
}

impl RuntimeConfig {
    fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 {
            return Err(anyhow!("a TaskManager needs at least one worker thread"));
        }

        Ok(())
    }
}

impl TryFrom<Builder> for RuntimeConfig {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Self, Self::Error> {
        let worker_threads = match builder.worker_threads {
            Some(n) => n,
            None => default_worker_threads()?,
        };

        let cfg = RuntimeConfig {
            worker_threads,
            thread_name: builder.thread_name,
            thread_stack_size: builder.thread_stack_size,
            idle_strategy: builder.idle_strategy,
            max_retries_per_round: builder.max_retries_per_round,
            deferral_ceiling: builder.deferral_ceiling,
            dependency_failure_policy: builder.dependency_failure_policy,
            report_interval: builder.report_interval,
        };

        cfg.validate()?;

        Ok(cfg)
    }
}

/// One thread per core, minus the thread that submits work and waits on the
/// fence.
fn default_worker_threads() -> Result<usize> {
    let cores = thread::available_parallelism()?.get();
    Ok(cores.saturating_sub(1).max(1))
}
