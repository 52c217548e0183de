use crate::queue::TaskQueue;
use crate::runtime::shared::Shared;
use crate::runtime::{Builder, RuntimeConfig, TaskThread, ThreadStats};
use crate::task::{
    DestructionTask, IdGenerator, Outcome, Task, TaskContext, TaskError, TaskFailure, Work,
};
use anyhow::{Result, anyhow};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Owner label of tasks created directly through the manager.
const MANAGER_OWNER: &str = "TaskManager";

/// Owns the pool of [`TaskThread`]s and hands out work round-robin.
///
/// One round is: push tasks, [`clear_fences`](TaskManager::clear_fences),
/// [`wait_for_fence`](TaskManager::wait_for_fence).
#[derive(Debug)]
pub struct TaskManager {
    shared: Arc<Shared>,

    threads: Vec<Arc<TaskThread>>,

    /// Next thread offered a task.
    cursor: AtomicUsize,

    ids: Arc<IdGenerator>,
}

impl TaskManager {
    /// Starts a manager with the default configuration, see [`Builder`].
    pub fn new() -> Result<TaskManager> {
        Builder::new().try_build()
    }

    pub fn builder() -> Builder {
        Builder::new()
    }

    pub(crate) fn start(cfg: RuntimeConfig) -> Result<TaskManager> {
        let shared = Arc::new(Shared::new(&cfg));

        let threads = (0..cfg.worker_threads)
            .map(|index| Arc::new(TaskThread::new(index, Arc::clone(&shared))))
            .collect::<Vec<_>>();

        let manager = TaskManager {
            shared,
            threads,
            cursor: AtomicUsize::new(0),
            ids: Arc::new(IdGenerator::new()),
        };

        // On error, dropping the manager stops the threads already spawned.
        for thread in &manager.threads {
            thread.spawn()?;
        }

        info!(threads = cfg.worker_threads, "task manager started");
        Ok(manager)
    }

    pub fn num_threads(&self) -> usize {
        self.threads.len()
    }

    pub fn thread(&self, index: usize) -> Option<&TaskThread> {
        self.threads.get(index).map(Arc::as_ref)
    }

    pub fn threads(&self) -> impl Iterator<Item = &TaskThread> {
        self.threads.iter().map(Arc::as_ref)
    }

    /// Id generator shared with every queue creating tasks for this manager.
    pub fn ids(&self) -> &Arc<IdGenerator> {
        &self.ids
    }

    pub fn new_task<W: Work>(&self, name: impl Into<Arc<str>>, work: W) -> Task {
        Task::new(self.ids.next(), name, MANAGER_OWNER, work)
    }

    pub fn task_fn<F>(&self, name: impl Into<Arc<str>>, f: F) -> Task
    where
        F: FnMut(&TaskContext) -> anyhow::Result<Outcome> + Send + 'static,
    {
        Task::from_fn(self.ids.next(), name, MANAGER_OWNER, f)
    }

    pub fn new_destruction_task<W: Work>(
        &self,
        name: impl Into<Arc<str>>,
        work: W,
    ) -> DestructionTask {
        DestructionTask::new(self.ids.next(), name, MANAGER_OWNER, work)
    }

    pub fn destruction_task_fn<F>(&self, name: impl Into<Arc<str>>, f: F) -> DestructionTask
    where
        F: FnMut(&TaskContext) -> anyhow::Result<Outcome> + Send + 'static,
    {
        DestructionTask::from_fn(self.ids.next(), name, MANAGER_OWNER, f)
    }

    /// Creates a named queue sharing this manager's id generator.
    pub fn task_queue(&self, name: impl Into<Arc<str>>) -> TaskQueue<Task> {
        TaskQueue::new(name, Arc::clone(&self.ids))
    }

    pub fn destruction_queue(&self, name: impl Into<Arc<str>>) -> TaskQueue<DestructionTask> {
        TaskQueue::new(name, Arc::clone(&self.ids))
    }

    /// Hands `task` to the next fenced thread, returning that thread's index.
    ///
    /// A task already held by a thread is rejected with
    /// [`TaskError::AlreadyQueued`]. Threads busy with a round refuse the
    /// task, in which case the next thread is tried until one accepts.
    pub fn push_task(&self, task: &Task) -> Result<usize, TaskError> {
        self.dispatch(task, |thread| thread.push_task(task))
    }

    /// Same protocol as [`TaskManager::push_task`], against the threads'
    /// destruction queues.
    pub fn push_destruction_task(&self, task: &DestructionTask) -> Result<usize, TaskError> {
        self.dispatch(task, |thread| thread.push_destruction_task(task))
    }

    fn dispatch<F>(&self, task: &Task, push: F) -> Result<usize, TaskError>
    where
        F: Fn(&TaskThread) -> Result<bool, TaskError>,
    {
        if self.shared.is_shutdown() {
            return Err(TaskError::ShutDown);
        }

        if let Some(thread) = task.thread() {
            return Err(TaskError::AlreadyQueued {
                id: task.id(),
                name: task.name().to_string(),
                thread,
            });
        }

        loop {
            let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.threads.len();
            if push(self.threads[index].as_ref())? {
                return Ok(index);
            }

            thread::yield_now();
        }
    }

    /// Starts a new round on every thread.
    ///
    /// Fails with [`TaskError::FenceNotSet`], clearing nothing, if a thread is
    /// still busy with the previous round.
    pub fn clear_fences(&self) -> Result<(), TaskError> {
        if self.shared.is_shutdown() {
            return Err(TaskError::ShutDown);
        }

        let round = self.shared.clear_fences()?;
        debug!(round, "fences cleared");
        Ok(())
    }

    /// Yields until every thread has raised its fence.
    pub fn wait_for_fence(&self) {
        while self.shared.num_unfenced() > 0 {
            thread::yield_now();
        }
    }

    /// Like [`TaskManager::wait_for_fence`], giving up after `timeout`.
    pub fn wait_for_fence_timeout(&self, timeout: Duration) -> Result<(), TaskError> {
        let start = Instant::now();

        loop {
            let pending = self.shared.num_unfenced();
            if pending == 0 {
                return Ok(());
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(TaskError::FenceTimeout { elapsed, pending });
            }

            thread::yield_now();
        }
    }

    /// Clears the fences and waits for every thread to finish the round.
    pub fn execute_round(&self) -> Result<(), TaskError> {
        self.clear_fences()?;
        self.wait_for_fence();
        Ok(())
    }

    pub fn all_fenced(&self) -> bool {
        self.shared.num_unfenced() == 0
    }

    /// Number of rounds started so far.
    pub fn round(&self) -> u64 {
        self.shared.round()
    }

    /// Drains the failure log.
    pub fn take_failures(&self) -> Vec<TaskFailure> {
        self.shared.take_failures()
    }

    pub fn thread_stats(&self) -> Vec<ThreadStats> {
        self.threads.iter().map(|t| t.stats()).collect()
    }

    /// Stops every thread, interrupting a round in progress, and joins them.
    /// Calling it again is a no-op.
    pub fn shutdown(&self) -> Result<()> {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        for thread in &self.threads {
            thread.set_running(false);
        }
        self.shared.unpark_all_threads();

        let errors = self
            .threads
            .iter()
            .filter_map(|thread| thread.join().err())
            .collect::<Vec<_>>();

        info!(threads = self.threads.len(), "task manager stopped");

        if errors.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("{} thread(s) panicked", errors.len()))
        }
    }

    #[cfg(test)]
    pub(crate) fn tracker(&self) -> &crate::utils::Tracker {
        &self.shared.tracker
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("error during task manager shutdown: {:?}", e);
        }
    }
}
