use crate::runtime::TaskManager;
use crate::task::{
    DestructionTask, Id, IdGenerator, Outcome, State, Task, TaskContext, TaskError, TaskFailure,
    Work,
};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

mod sealed {
    pub trait Sealed {}

    impl Sealed for crate::task::Task {}
    impl Sealed for crate::task::DestructionTask {}
}

/// Task flavors a [`TaskQueue`] can hold.
pub trait Submit: sealed::Sealed + Clone + AsRef<Task> + fmt::Debug + Send + Sync + 'static {
    #[doc(hidden)]
    fn submit_to(&self, manager: &TaskManager) -> Result<usize, TaskError>;
}

impl Submit for Task {
    fn submit_to(&self, manager: &TaskManager) -> Result<usize, TaskError> {
        manager.push_task(self)
    }
}

impl Submit for DestructionTask {
    fn submit_to(&self, manager: &TaskManager) -> Result<usize, TaskError> {
        manager.push_destruction_task(self)
    }
}

/// Outcome of one [`TaskQueue::collect`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct QueueReport {
    pub completed: Vec<Id>,
    pub failed: Vec<TaskFailure>,
    /// Tasks carried over to the next round.
    pub pending: usize,
}

impl QueueReport {
    /// Every task completed.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.pending == 0
    }
}

/// A subsystem's tasks for one simulation step.
///
/// Tasks are pushed into the queue, handed to the [`TaskManager`] by
/// [`submit`](TaskQueue::submit), and removed again by
/// [`collect`](TaskQueue::collect) once they completed or failed. Tasks still
/// in flight, parked for instance, are kept until a later collect.
#[derive(Debug)]
pub struct TaskQueue<T: Submit = Task> {
    name: Arc<str>,

    ids: Arc<IdGenerator>,

    /// Not handed to the manager yet.
    pending: Vec<T>,

    /// Handed to the manager, not collected yet.
    submitted: Vec<T>,
}

impl<T: Submit> TaskQueue<T> {
    pub fn new(name: impl Into<Arc<str>>, ids: Arc<IdGenerator>) -> Self {
        Self {
            name: name.into(),
            ids,
            pending: Vec::new(),
            submitted: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds `task` to the next submission. Returns false if the queue already
    /// holds it.
    pub fn push(&mut self, task: T) -> bool {
        if self.contains(task.as_ref()) {
            debug!(queue = %self.name, task = %task.as_ref().name_and_id(), "already in queue");
            return false;
        }

        self.pending.push(task);
        true
    }

    pub fn contains(&self, task: &Task) -> bool {
        self.tasks().any(|t| t.as_ref() == task)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &T> {
        self.submitted.iter().chain(self.pending.iter())
    }

    pub fn len(&self) -> usize {
        self.pending.len() + self.submitted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    pub fn num_submitted(&self) -> usize {
        self.submitted.len()
    }

    /// Pushes every pending task to `manager`, in queue order. On error the
    /// offending task and the ones after it stay pending.
    pub fn submit(&mut self, manager: &TaskManager) -> Result<usize, TaskError> {
        let mut pending = std::mem::take(&mut self.pending).into_iter();
        let mut submitted = 0;
        let mut error = None;

        for task in pending.by_ref() {
            if let Err(e) = task.submit_to(manager) {
                self.pending.push(task);
                error = Some(e);
                break;
            }

            self.submitted.push(task);
            submitted += 1;
        }
        self.pending.extend(pending);

        debug!(queue = %self.name, submitted, "submitted");

        match error {
            Some(e) => Err(e),
            None => Ok(submitted),
        }
    }

    /// Removes finished tasks and reports what happened to them.
    pub fn collect(&mut self) -> QueueReport {
        let mut report = QueueReport::default();

        self.submitted.retain(|task| {
            let task = task.as_ref();
            match task.state() {
                State::Completed => {
                    report.completed.push(task.id());
                    false
                }
                State::Failed => {
                    report.failed.extend(task.failure_record());
                    false
                }
                _ => true,
            }
        });

        report.pending = self.len();
        report
    }

    /// Runs one full cycle for this queue: submit, clear the fences, wait for
    /// the fence, collect. An empty queue does nothing.
    pub fn execute_queue(&mut self, manager: &TaskManager) -> Result<QueueReport, TaskError> {
        if self.is_empty() {
            trace!(queue = %self.name, "nothing to execute");
            return Ok(QueueReport::default());
        }

        self.submit(manager)?;
        manager.clear_fences()?;
        manager.wait_for_fence();

        let report = self.collect();
        debug!(
            queue = %self.name,
            completed = report.completed.len(),
            failed = report.failed.len(),
            pending = report.pending,
            "queue executed"
        );
        Ok(report)
    }
}

impl TaskQueue<Task> {
    /// Creates a task owned by this queue. The task still has to be pushed.
    pub fn new_task<W: Work>(&self, name: impl Into<Arc<str>>, work: W) -> Task {
        Task::new(self.ids.next(), name, Arc::clone(&self.name), work)
    }

    pub fn task_fn<F>(&self, name: impl Into<Arc<str>>, f: F) -> Task
    where
        F: FnMut(&TaskContext) -> anyhow::Result<Outcome> + Send + 'static,
    {
        Task::from_fn(self.ids.next(), name, Arc::clone(&self.name), f)
    }
}

impl TaskQueue<DestructionTask> {
    pub fn new_destruction_task<W: Work>(
        &self,
        name: impl Into<Arc<str>>,
        work: W,
    ) -> DestructionTask {
        DestructionTask::new(self.ids.next(), name, Arc::clone(&self.name), work)
    }

    pub fn destruction_task_fn<F>(&self, name: impl Into<Arc<str>>, f: F) -> DestructionTask
    where
        F: FnMut(&TaskContext) -> anyhow::Result<Outcome> + Send + 'static,
    {
        DestructionTask::from_fn(self.ids.next(), name, Arc::clone(&self.name), f)
    }
}
