use crate::task::dependencies::{Dependencies, TaskVec};
use crate::task::header::Header;
use crate::task::id::TaskIdGuard;
use crate::task::{FailureReason, Id, Outcome, State, TaskContext, TaskError, TaskFailure, Work};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use tracing::{error, trace};

struct Inner {
    id: Id,
    name: Arc<str>,
    owner: Arc<str>,

    header: Mutex<Header>,

    deps: Mutex<Dependencies>,

    /// Only the thread holding the task locks this, for the duration of one
    /// `execute()`.
    work: Mutex<Box<dyn Work>>,
}

/// Shared handle to a unit of schedulable work.
///
/// Cloning a `Task` is cheap and every clone refers to the same task: the
/// subsystem that created it, its thread's queue and the tasks depending on it
/// all hold handles.
///
/// None of the task's locks are ever held while locking another task.
#[derive(Clone)]
pub struct Task {
    inner: Arc<Inner>,
}

#[derive(Clone)]
pub(crate) struct WeakTask {
    id: Id,
    inner: Weak<Inner>,
}

impl WeakTask {
    pub(crate) fn id(&self) -> Id {
        self.id
    }

    pub(crate) fn upgrade(&self) -> Option<Task> {
        self.inner.upgrade().map(|inner| Task { inner })
    }
}

/// Snapshot of the header taken once per scan.
#[derive(Debug)]
pub(crate) struct Scan {
    pub(crate) state: State,
    pub(crate) parked: bool,
    pub(crate) failed_dependency: Option<(Id, Arc<str>)>,
}

impl Task {
    pub fn new<W: Work>(
        id: Id,
        name: impl Into<Arc<str>>,
        owner: impl Into<Arc<str>>,
        work: W,
    ) -> Task {
        Task {
            inner: Arc::new(Inner {
                id,
                name: name.into(),
                owner: owner.into(),
                header: Mutex::new(Header::default()),
                deps: Mutex::new(Dependencies::default()),
                work: Mutex::new(Box::new(work) as Box<dyn Work>),
            }),
        }
    }

    /// Same as [`Task::new`], with the closure signature spelled out so
    /// closures type-check without annotations.
    pub fn from_fn<F>(
        id: Id,
        name: impl Into<Arc<str>>,
        owner: impl Into<Arc<str>>,
        f: F,
    ) -> Task
    where
        F: FnMut(&TaskContext) -> anyhow::Result<Outcome> + Send + 'static,
    {
        Task::new(id, name, owner, f)
    }

    pub fn id(&self) -> Id {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Label of the subsystem or queue that created the task.
    pub fn owner(&self) -> &str {
        &self.inner.owner
    }

    pub fn state(&self) -> State {
        self.inner.header.lock().state
    }

    pub fn has_state(&self, state: State) -> bool {
        self.state() == state
    }

    /// Index of the thread currently holding the task.
    pub fn thread(&self) -> Option<usize> {
        self.inner.header.lock().thread
    }

    pub fn deferral_count(&self) -> u64 {
        self.inner.header.lock().deferrals
    }

    pub fn failure(&self) -> Option<FailureReason> {
        self.inner.header.lock().failure.clone()
    }

    pub fn failure_record(&self) -> Option<TaskFailure> {
        self.failure().map(|reason| self.failure_with(reason))
    }

    pub fn is_waiting_for_dependencies(&self) -> bool {
        self.inner.deps.lock().is_waiting()
    }

    pub fn is_waiting_for(&self, other: &Task) -> bool {
        self.inner.deps.lock().is_waiting_for(other.id())
    }

    pub fn num_dependencies(&self) -> usize {
        self.inner.deps.lock().num_waiting_for()
    }

    pub fn num_dependents(&self) -> usize {
        self.inner.deps.lock().num_waiting_for_me()
    }

    /// Diagnostic label of the form `[thread.id]name`, with `-` in place of
    /// the thread when the task is not in flight.
    pub fn name_and_id(&self) -> String {
        match self.thread() {
            Some(thread) => format!("[{}.{}]{}", thread, self.id(), self.name()),
            None => format!("[-.{}]{}", self.id(), self.name()),
        }
    }

    /// Registers that `other` must complete before this task may execute.
    ///
    /// The dependency graph is frozen while either task is in flight, and
    /// registering an existing edge again is a no-op.
    pub fn depends_on(&self, other: &Task) -> Result<(), TaskError> {
        if self.id() == other.id() {
            return Err(TaskError::SelfDependency {
                id: self.id(),
                name: self.name().to_string(),
            });
        }

        self.ensure_unfrozen()?;
        other.ensure_unfrozen()?;

        if !self.inner.deps.lock().add_waiting_for(other.clone()) {
            return Ok(());
        }

        other.inner.deps.lock().add_waiting_for_me(self.downgrade());

        trace!(task = %self.name_and_id(), dependency = %other.name_and_id(), "depends_on");
        Ok(())
    }

    /// Removes `other` from the set of tasks this task is waiting for.
    pub fn clear_dependency(&self, other: &Task) -> Result<(), TaskError> {
        if self.inner.deps.lock().remove_waiting_for(other.id()).is_none() {
            return Err(TaskError::UnknownDependency {
                id: self.id(),
                name: self.name().to_string(),
                dependency: other.id(),
            });
        }

        other.inner.deps.lock().remove_waiting_for_me(self.id());
        Ok(())
    }

    /// Releases every task waiting for this one. The set of dependents is
    /// consumed, so a second call does nothing. Returns how many dependents
    /// were released.
    pub fn notify_tasks_waiting_for_me(&self) -> usize {
        let dependents = self.inner.deps.lock().take_waiting_for_me();

        let mut notified = 0;
        for dependent in dependents.iter().filter_map(|weak| weak.upgrade()) {
            match dependent.clear_dependency(self) {
                Ok(()) => notified += 1,
                Err(e) => {
                    error!(task = %self.name_and_id(), "dependency bookkeeping: {e}");
                    debug_assert!(false, "dependency bookkeeping: {e}");
                }
            }
        }

        notified
    }

    /// Returns an idle task to [`State::New`], clearing its deferrals and
    /// failure and detaching it from every task it is linked to.
    pub fn reset(&self) -> Result<(), TaskError> {
        if let Some(thread) = self.thread() {
            return Err(TaskError::Busy {
                id: self.id(),
                name: self.name().to_string(),
                thread,
            });
        }

        let (dependencies, dependents) = {
            let deps = self.inner.deps.lock();
            (deps.waiting_for(), deps.dependents().collect::<TaskVec>())
        };

        // A neighbor in flight may be notifying us right now.
        for neighbor in dependencies.iter().chain(dependents.iter()) {
            neighbor.ensure_unfrozen()?;
        }

        let (dependencies, dependents) = {
            let mut deps = self.inner.deps.lock();
            (deps.take_waiting_for(), deps.take_waiting_for_me())
        };

        for dependency in dependencies {
            dependency.inner.deps.lock().remove_waiting_for_me(self.id());
        }

        for dependent in dependents.iter().filter_map(|weak| weak.upgrade()) {
            dependent.inner.deps.lock().remove_waiting_for(self.id());
        }

        *self.inner.header.lock() = Header::default();
        Ok(())
    }

    fn ensure_unfrozen(&self) -> Result<(), TaskError> {
        let state = self.state();
        if state.is_in_flight() {
            return Err(TaskError::DependencyFrozen {
                id: self.id(),
                name: self.name().to_string(),
                state,
            });
        }

        Ok(())
    }

    fn downgrade(&self) -> WeakTask {
        WeakTask {
            id: self.id(),
            inner: Arc::downgrade(&self.inner),
        }
    }

    fn failure_with(&self, reason: FailureReason) -> TaskFailure {
        TaskFailure {
            id: self.id(),
            name: self.name().to_string(),
            owner: self.owner().to_string(),
            reason,
        }
    }

    fn invalid_transition(&self, from: State, to: State) -> TaskError {
        TaskError::InvalidTransition {
            id: self.id(),
            name: self.name().to_string(),
            from,
            to,
        }
    }
}

// Scheduler side of the task, only called by the thread holding it.
impl Task {
    /// Hands the task to `thread`. This is the single place thread affinity
    /// is acquired, so a task can never sit in two queues.
    pub(crate) fn submit(&self, thread: usize) -> Result<(), TaskError> {
        let mut header = self.inner.header.lock();

        if let Some(held_by) = header.thread {
            return Err(TaskError::AlreadyQueued {
                id: self.id(),
                name: self.name().to_string(),
                thread: held_by,
            });
        }

        if !header.state.can_transition_to(State::Queued) {
            return Err(self.invalid_transition(header.state, State::Queued));
        }

        header.submit(thread);
        Ok(())
    }

    pub(crate) fn scan(&self, round: u64) -> Scan {
        let header = self.inner.header.lock();
        Scan {
            state: header.state,
            parked: header.is_parked(round),
            failed_dependency: header.failed_dependency.clone(),
        }
    }

    pub(crate) fn outstanding_dependencies(&self) -> TaskVec {
        self.inner.deps.lock().waiting_for()
    }

    /// Outstanding dependencies that failed before `round`. Their dependents
    /// were told back then, a task submitted or wired up since then only
    /// finds out here.
    pub(crate) fn failed_dependencies(&self, round: u64) -> TaskVec {
        self.outstanding_dependencies()
            .into_iter()
            .filter(|dep| {
                let header = dep.inner.header.lock();
                header.state == State::Failed
                    && header.finished_round.is_some_and(|finished| finished < round)
            })
            .collect()
    }

    /// Whether this task, as a dependency, will make no more progress during
    /// `round`. `thread_finished` tells whether a thread is done with `round`.
    pub(crate) fn is_settled(&self, round: u64, thread_finished: impl Fn(usize) -> bool) -> bool {
        let header = self.inner.header.lock();

        match header.state {
            State::New => true,
            // Finished this round: its notification is still on the way.
            State::Completed | State::Failed => header.finished_round != Some(round),
            State::Queued | State::Active => {
                header.is_parked(round) || header.thread.is_some_and(thread_finished)
            }
        }
    }

    /// Returns the new deferral count.
    pub(crate) fn defer(&self) -> u64 {
        let mut header = self.inner.header.lock();
        header.deferrals += 1;
        header.deferrals
    }

    /// Returns the new deferral count and the retries requested this round.
    pub(crate) fn retry(&self, round: u64) -> (u64, u32) {
        let mut header = self.inner.header.lock();
        let retries = header.retry(round);
        (header.deferrals, retries)
    }

    pub(crate) fn park(&self, round: u64) {
        self.inner.header.lock().parked_round = Some(round);
    }

    /// Moves the task to [`State::Active`] and builds the context for its work.
    pub(crate) fn activate(&self, round: u64) -> Result<TaskContext, TaskError> {
        let mut header = self.inner.header.lock();

        if !header.state.can_transition_to(State::Active) {
            return Err(self.invalid_transition(header.state, State::Active));
        }
        header.state = State::Active;

        Ok(TaskContext {
            id: self.id(),
            name: Arc::clone(&self.inner.name),
            thread: header.thread.unwrap_or_default(),
            deferrals: header.deferrals,
            round,
        })
    }

    /// Runs the work with the task id installed in the thread context. A
    /// panic is caught and returned as its message.
    pub(crate) fn run(&self, ctx: &TaskContext) -> Result<anyhow::Result<Outcome>, String> {
        let _guard = TaskIdGuard::enter(self.id());
        let mut work = self.inner.work.lock();

        panic::catch_unwind(AssertUnwindSafe(|| work.execute(ctx))).map_err(panic_message)
    }

    pub(crate) fn complete(&self, round: u64) -> Result<(), TaskError> {
        let mut header = self.inner.header.lock();

        if !header.state.can_transition_to(State::Completed) {
            return Err(self.invalid_transition(header.state, State::Completed));
        }

        header.finish(State::Completed, round);
        Ok(())
    }

    pub(crate) fn fail(&self, reason: FailureReason, round: u64) -> Result<TaskFailure, TaskError> {
        let mut header = self.inner.header.lock();

        if !header.state.can_transition_to(State::Failed) {
            return Err(self.invalid_transition(header.state, State::Failed));
        }

        header.finish(State::Failed, round);
        header.failure = Some(reason.clone());
        drop(header);

        Ok(self.failure_with(reason))
    }

    /// Tells every dependent that this task failed. They keep their edge and
    /// fail on their next scan.
    pub(crate) fn cascade_failure(&self) -> usize {
        let dependents = self.inner.deps.lock().dependents().collect::<TaskVec>();

        for dependent in &dependents {
            dependent
                .inner
                .header
                .lock()
                .failed_dependency
                .get_or_insert_with(|| (self.id(), Arc::clone(&self.inner.name)));
        }

        dependents.len()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Task {}

impl Hash for Task {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl AsRef<Task> for Task {
    fn as_ref(&self) -> &Task {
        self
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header = self.inner.header.lock();
        f.debug_struct("Task")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("owner", &self.inner.owner)
            .field("state", &header.state)
            .field("thread", &header.thread)
            .field("deferrals", &header.deferrals)
            .finish()
    }
}

/// Cleanup work submitted independently of the object it cleans up after.
///
/// Its work owns everything it needs (`Work: 'static`), so the queue can keep
/// it alive after its owner is gone. Threads drain destruction tasks after
/// their regular queue.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct DestructionTask(Task);

impl DestructionTask {
    pub fn new<W: Work>(
        id: Id,
        name: impl Into<Arc<str>>,
        owner: impl Into<Arc<str>>,
        work: W,
    ) -> DestructionTask {
        DestructionTask(Task::new(id, name, owner, work))
    }

    pub fn from_fn<F>(
        id: Id,
        name: impl Into<Arc<str>>,
        owner: impl Into<Arc<str>>,
        f: F,
    ) -> DestructionTask
    where
        F: FnMut(&TaskContext) -> anyhow::Result<Outcome> + Send + 'static,
    {
        DestructionTask(Task::new(id, name, owner, f))
    }

    pub fn task(&self) -> &Task {
        &self.0
    }
}

impl Deref for DestructionTask {
    type Target = Task;

    fn deref(&self) -> &Task {
        &self.0
    }
}

impl AsRef<Task> for DestructionTask {
    fn as_ref(&self) -> &Task {
        &self.0
    }
}

impl fmt::Debug for DestructionTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DestructionTask").field(&self.0).finish()
    }
}
