use crate::context;
use crate::runtime::shared::Shared;
use crate::runtime::ticker::{Ticker, TickerData, TickerEvents};
use crate::runtime::{DependencyFailurePolicy, IdleStrategy, RuntimeConfig};
use crate::task::{DestructionTask, FailureReason, Outcome, Task, TaskError};
use crate::utils::ScopeGuard;
use anyhow::{Result, anyhow};
use parking_lot::{Mutex, MutexGuard};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

#[cfg(test)]
use crate::utils::Method;

/// Upper bound on how long an idle thread parks before re-checking its fence.
/// `clear_fences()` and shutdown unpark it sooner.
const PARK_TIMEOUT: Duration = Duration::from_millis(50);

/// One OS thread draining its own queues once per round.
///
/// The fence is raised when the thread is idle with its round finished, and
/// lowered while it scans its queues. Tasks are only accepted while the fence
/// is raised.
#[derive(Debug)]
pub struct TaskThread {
    index: usize,

    shared: Arc<Shared>,

    /// Locked by the thread for the duration of a round.
    queue: Mutex<Vec<Task>>,

    /// Drained after `queue`, with the same protocol.
    destruction_queue: Mutex<Vec<DestructionTask>>,

    // Queue lengths readable without waiting for the round to end.
    num_tasks: AtomicUsize,
    num_destruction_tasks: AtomicUsize,

    stats: Stats,

    handle: Mutex<Option<JoinHandle<()>>>,
}

/// What happened to a task during one scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// Completed or failed, leaves the queue.
    Done,

    /// Stays queued, not scanned again this round.
    Parked,

    /// Executed and asked to run again.
    Ran,

    /// Blocked on dependencies. `local` when every dependency still able to
    /// make progress this round is held by this same thread.
    Waiting { local: bool },
}

impl TaskThread {
    pub(crate) fn new(index: usize, shared: Arc<Shared>) -> Self {
        Self {
            index,
            shared,
            queue: Mutex::new(Vec::new()),
            destruction_queue: Mutex::new(Vec::new()),
            num_tasks: AtomicUsize::new(0),
            num_destruction_tasks: AtomicUsize::new(0),
            stats: Stats::default(),
            handle: Mutex::new(None),
        }
    }

    pub(crate) fn spawn(self: &Arc<Self>) -> Result<()> {
        let cfg = &self.shared.cfg;
        let mut builder = thread::Builder::new().name((cfg.thread_name.0)());

        if let Some(stack_size) = cfg.thread_stack_size {
            builder = builder.stack_size(stack_size);
        }

        let this = Arc::clone(self);
        let handle = builder.spawn(move || this.event_loop())?;

        self.shared
            .register_thread(self.index, handle.thread().clone());
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_fenced(&self) -> bool {
        self.shared.is_fenced(self.index)
    }

    /// Queues `task` on this thread.
    ///
    /// Returns `Ok(false)` and leaves the task untouched when the thread is in
    /// the middle of a round.
    pub fn push_task(&self, task: &Task) -> Result<bool, TaskError> {
        let Some(mut queue) = self.lock_if_fenced(&self.queue)? else {
            return Ok(false);
        };

        task.submit(self.index)?;
        queue.push(task.clone());
        self.num_tasks.store(queue.len(), Ordering::Release);
        self.on_received(task);
        Ok(true)
    }

    /// Same protocol as [`TaskThread::push_task`], against the destruction
    /// queue.
    pub fn push_destruction_task(&self, task: &DestructionTask) -> Result<bool, TaskError> {
        let Some(mut queue) = self.lock_if_fenced(&self.destruction_queue)? else {
            return Ok(false);
        };

        task.submit(self.index)?;
        queue.push(task.clone());
        self.num_destruction_tasks
            .store(queue.len(), Ordering::Release);
        self.on_received(task);
        Ok(true)
    }

    pub fn has_task(&self) -> bool {
        self.num_tasks() > 0
    }

    pub fn num_tasks(&self) -> usize {
        self.num_tasks.load(Ordering::Acquire)
    }

    pub fn num_destruction_tasks(&self) -> usize {
        self.num_destruction_tasks.load(Ordering::Acquire)
    }

    /// `name_and_id()` of every queued task, regular queue first. Returns
    /// `None` while the thread is draining its queues.
    pub fn queued_task_names(&self) -> Option<Vec<String>> {
        let queue = self.queue.try_lock()?;
        let destruction_queue = self.destruction_queue.try_lock()?;

        Some(
            queue
                .iter()
                .map(Task::name_and_id)
                .chain(destruction_queue.iter().map(|t| t.name_and_id()))
                .collect(),
        )
    }

    pub fn stats(&self) -> ThreadStats {
        self.stats.snapshot()
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.shared.set_running(self.index, running);
    }

    pub(crate) fn join(&self) -> Result<()> {
        let Some(handle) = self.handle.lock().take() else {
            return Ok(());
        };

        handle
            .join()
            .map_err(|_| anyhow!("task thread {} panicked", self.index))
    }

    fn accepts(&self) -> Result<bool, TaskError> {
        if self.shared.is_shutdown() {
            return Err(TaskError::ShutDown);
        }

        Ok(self.is_fenced())
    }

    /// Locks `queue` for a push, or returns `None` when the thread is busy
    /// with a round. Never waits for the lock: the thread holds it while
    /// draining, possibly while running the very task that is pushing.
    fn lock_if_fenced<'a, T>(
        &self,
        queue: &'a Mutex<Vec<T>>,
    ) -> Result<Option<MutexGuard<'a, Vec<T>>>, TaskError> {
        if !self.accepts()? {
            return Ok(None);
        }

        let Some(queue) = queue.try_lock() else {
            return Ok(None);
        };

        // The fence may have been cleared before the lock was taken.
        if !self.accepts()? {
            return Ok(None);
        }

        Ok(Some(queue))
    }

    fn on_received(&self, task: &Task) {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        self.stats.received_this_round.fetch_add(1, Ordering::Relaxed);

        #[cfg(test)]
        self.shared
            .tracker
            .record(Method::Push, self.index, task.id(), self.shared.round());

        debug!(thread = self.index, task = %task.name_and_id(), "queued");
    }
}

impl TaskThread {
    fn event_loop(&self) {
        context::set_current_thread_index(Some(self.index));

        // Raise the fence on the way out, even on panic, so `wait_for_fence`
        // never waits on a dead thread.
        let _guard = ScopeGuard::new(|| {
            self.shared.raise_fence(self.index, self.shared.round());
            context::set_current_thread_index(None);
        });

        info!(thread = self.index, "task thread started");

        let mut ticker = Ticker::new();
        let mut cfg = EventLoopConfig::new(self.index, &self.shared.cfg);

        'event_loop: loop {
            if self.shared.is_shutdown() || !self.shared.is_running(self.index) {
                break 'event_loop;
            }

            if self.is_fenced() {
                self.idle();
                continue;
            }

            let round = self.shared.round();
            if let ControlFlow::Break(()) = self.run_round(round, &mut ticker, &mut cfg) {
                break 'event_loop;
            }

            self.stats.rounds.fetch_add(1, Ordering::Relaxed);
            self.shared.raise_fence(self.index, round);
            debug!(
                thread = self.index,
                round,
                pending = self.num_tasks() + self.num_destruction_tasks(),
                "fence raised"
            );
        }

        info!(thread = self.index, "task thread stopped");
    }

    fn idle(&self) {
        match self.shared.cfg.idle_strategy {
            IdleStrategy::Yield => thread::yield_now(),
            IdleStrategy::Park => thread::park_timeout(PARK_TIMEOUT),
        }
    }

    fn run_round(
        &self,
        round: u64,
        ticker: &mut Ticker,
        cfg: &mut EventLoopConfig,
    ) -> ControlFlow<()> {
        let received = self.stats.received_this_round.swap(0, Ordering::Relaxed);
        self.stats
            .max_received_per_round
            .fetch_max(received, Ordering::Relaxed);

        debug!(thread = self.index, round, received, "round started");

        let mut queue = self.queue.lock();
        if let ControlFlow::Break(()) = self.drain(&mut queue, &self.num_tasks, round, ticker, cfg)
        {
            return ControlFlow::Break(());
        }
        drop(queue);

        let mut queue = self.destruction_queue.lock();
        self.drain(&mut queue, &self.num_destruction_tasks, round, ticker, cfg)
    }

    /// Scans `queue` until it is empty or every remaining task is parked.
    fn drain<T: AsRef<Task>>(
        &self,
        queue: &mut Vec<T>,
        len: &AtomicUsize,
        round: u64,
        ticker: &mut Ticker,
        cfg: &mut EventLoopConfig,
    ) -> ControlFlow<()> {
        loop {
            let events = ticker.tick(&*self.shared, cfg);
            if let ControlFlow::Break(()) = self.process_ticker_events(events, round) {
                return ControlFlow::Break(());
            }

            let settled = self.scan(queue, round);
            len.store(queue.len(), Ordering::Release);

            if settled {
                return ControlFlow::Continue(());
            }

            thread::yield_now();
        }
    }

    #[inline(always)]
    fn process_ticker_events(&self, events: TickerEvents, round: u64) -> ControlFlow<()> {
        if events.contains(TickerEvents::SHUTDOWN) {
            return ControlFlow::Break(());
        }

        if events.contains(TickerEvents::REPORT) {
            debug!(
                thread = self.index,
                round,
                tasks = self.num_tasks(),
                destruction_tasks = self.num_destruction_tasks(),
                "queue status"
            );
        }

        ControlFlow::Continue(())
    }

    /// One pass over the queue, front to back. Returns true once the queue has
    /// nothing left to do this round.
    fn scan<T: AsRef<Task>>(&self, queue: &mut Vec<T>, round: u64) -> bool {
        let mut progress = false;
        let mut stuck_locally = true;
        let mut num_waiting = 0;

        queue.retain(|task| match self.step(task.as_ref(), round) {
            Step::Done => {
                progress = true;
                false
            }
            Step::Parked => true,
            Step::Ran => {
                progress = true;
                stuck_locally = false;
                true
            }
            Step::Waiting { local } => {
                num_waiting += 1;
                stuck_locally &= local;
                true
            }
        });

        if num_waiting == 0 && !progress {
            // Empty, or everything left is parked.
            return true;
        }

        // Every waiting task waits on another waiting task of this thread, a
        // dependency cycle. Nothing here can move until the graph changes.
        if !progress && stuck_locally {
            for task in queue.iter().map(AsRef::as_ref) {
                if !task.scan(round).parked {
                    warn!(task = %task.name_and_id(), "dependency cycle, parked until next round");
                    task.park(round);
                }
            }
            return true;
        }

        false
    }

    fn step(&self, task: &Task, round: u64) -> Step {
        let scan = task.scan(round);

        if !scan.state.is_in_flight() {
            error!(task = %task.name_and_id(), state = %scan.state, "task in queue is not in flight");
            debug_assert!(false, "task in queue is not in flight");
            return Step::Done;
        }

        if scan.parked {
            return Step::Parked;
        }

        if let Some((id, name)) = scan.failed_dependency {
            let reason = FailureReason::DependencyFailed {
                id,
                name: name.to_string(),
            };
            return self.fail(task, reason, round);
        }

        if let Some(step) = self.handle_failed_dependencies(task, round) {
            return step;
        }

        if task.is_waiting_for_dependencies() {
            return self.defer(task, round);
        }

        self.execute(task, round)
    }

    /// Applies the dependency-failure policy to dependencies that failed in
    /// an earlier round, before this task was submitted or wired to them.
    fn handle_failed_dependencies(&self, task: &Task, round: u64) -> Option<Step> {
        let failed = task.failed_dependencies(round);
        let first = failed.first()?;

        match self.shared.cfg.dependency_failure_policy {
            DependencyFailurePolicy::Cascade => {
                let reason = FailureReason::DependencyFailed {
                    id: first.id(),
                    name: first.name().to_string(),
                };
                Some(self.fail(task, reason, round))
            }
            DependencyFailurePolicy::Release => {
                for dependency in &failed {
                    if let Err(e) = task.clear_dependency(dependency) {
                        error!(task = %task.name_and_id(), "dependency bookkeeping: {e}");
                        debug_assert!(false, "dependency bookkeeping: {e}");
                    }
                }
                None
            }
        }
    }

    fn defer(&self, task: &Task, round: u64) -> Step {
        let deferrals = task.defer();
        self.stats.deferrals.fetch_add(1, Ordering::Relaxed);

        if self.is_starved(deferrals) {
            return self.fail(task, FailureReason::Starved { deferrals }, round);
        }

        let unsettled = task
            .outstanding_dependencies()
            .into_iter()
            .filter(|dep| !dep.is_settled(round, |t| self.shared.has_finished_round(t, round)))
            .collect::<Vec<_>>();

        if unsettled.is_empty() {
            debug!(task = %task.name_and_id(), deferrals, "dependencies settled, parked until next round");
            task.park(round);
            return Step::Parked;
        }

        trace!(task = %task.name_and_id(), deferrals, waiting_for = unsettled.len(), "deferred");
        Step::Waiting {
            local: unsettled.iter().all(|dep| dep.thread() == Some(self.index)),
        }
    }

    fn execute(&self, task: &Task, round: u64) -> Step {
        let ctx = match task.activate(round) {
            Ok(ctx) => ctx,
            Err(e) => {
                error!(task = %task.name_and_id(), "{e}");
                debug_assert!(false, "{e}");
                return Step::Done;
            }
        };

        #[cfg(test)]
        self.shared
            .tracker
            .record(Method::Execute, self.index, task.id(), round);

        trace!(task = %task.name_and_id(), "execute");

        match task.run(&ctx) {
            Ok(Ok(Outcome::Completed)) => self.complete(task, round),
            Ok(Ok(Outcome::Failed(reason))) => {
                self.fail(task, FailureReason::Explicit(reason), round)
            }
            Ok(Ok(Outcome::Retry)) => self.retry(task, round),
            Ok(Err(e)) => {
                debug!(task = %task.name_and_id(), error = %e, "transient error, retrying");
                self.retry(task, round)
            }
            Err(panic) => self.fail(task, FailureReason::Panicked(panic), round),
        }
    }

    fn complete(&self, task: &Task, round: u64) -> Step {
        if let Err(e) = task.complete(round) {
            error!(task = %task.name_and_id(), "{e}");
            debug_assert!(false, "{e}");
            return Step::Done;
        }

        self.stats.completed.fetch_add(1, Ordering::Relaxed);

        #[cfg(test)]
        self.shared
            .tracker
            .record(Method::Complete, self.index, task.id(), round);

        let released = task.notify_tasks_waiting_for_me();
        trace!(thread = self.index, task = %task.name_and_id(), released, "completed");
        Step::Done
    }

    fn retry(&self, task: &Task, round: u64) -> Step {
        let (deferrals, retries) = task.retry(round);
        self.stats.deferrals.fetch_add(1, Ordering::Relaxed);

        if self.is_starved(deferrals) {
            return self.fail(task, FailureReason::Starved { deferrals }, round);
        }

        if retries >= self.shared.cfg.max_retries_per_round {
            warn!(task = %task.name_and_id(), deferrals, retries, "retry budget spent, parked until next round");
            task.park(round);
            return Step::Parked;
        }

        Step::Ran
    }

    fn fail(&self, task: &Task, reason: FailureReason, round: u64) -> Step {
        let label = task.name_and_id();
        let failure = match task.fail(reason, round) {
            Ok(failure) => failure,
            Err(e) => {
                error!(task = %label, "{e}");
                debug_assert!(false, "{e}");
                return Step::Done;
            }
        };

        error!(task = %label, owner = %failure.owner, reason = %failure.reason, "task failed");
        self.stats.failed.fetch_add(1, Ordering::Relaxed);

        #[cfg(test)]
        self.shared
            .tracker
            .record(Method::Fail, self.index, task.id(), round);

        match self.shared.cfg.dependency_failure_policy {
            DependencyFailurePolicy::Cascade => task.cascade_failure(),
            DependencyFailurePolicy::Release => task.notify_tasks_waiting_for_me(),
        };

        self.shared.record_failure(failure);
        Step::Done
    }

    fn is_starved(&self, deferrals: u64) -> bool {
        self.shared
            .cfg
            .deferral_ceiling
            .is_some_and(|ceiling| deferrals >= ceiling)
    }
}

/// Counters kept by each thread, see [`ThreadStats`].
#[derive(Debug, Default)]
struct Stats {
    received: AtomicU64,
    received_this_round: AtomicU64,
    max_received_per_round: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    deferrals: AtomicU64,
    rounds: AtomicU64,
}

impl Stats {
    fn snapshot(&self) -> ThreadStats {
        ThreadStats {
            received: self.received.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            deferrals: self.deferrals.load(Ordering::Relaxed),
            rounds: self.rounds.load(Ordering::Relaxed),
            max_received_per_round: self
                .max_received_per_round
                .load(Ordering::Relaxed)
                .max(self.received_this_round.load(Ordering::Relaxed)),
        }
    }
}

/// Snapshot of a [`TaskThread`]'s counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadStats {
    /// Tasks and destruction tasks pushed to the thread.
    pub received: u64,
    pub completed: u64,
    pub failed: u64,
    pub deferrals: u64,
    /// Rounds finished, i.e. times the fence was raised.
    pub rounds: u64,
    /// Most tasks pushed to the thread ahead of a single round.
    pub max_received_per_round: u64,
}

#[derive(Debug, Clone)]
struct EventLoopConfig {
    index: usize,

    report_interval: u32,
}

impl EventLoopConfig {
    fn new(index: usize, cfg: &RuntimeConfig) -> Self {
        Self {
            index,
            report_interval: cfg.report_interval,
        }
    }
}

impl TickerData for EventLoopConfig {
    type Context = Shared;

    #[inline(always)]
    fn update_and_check(&mut self, shared: &Self::Context, tick: u32) -> TickerEvents {
        // Fast-path to enforce shutdown
        if shared.is_shutdown() || !shared.is_running(self.index) {
            return TickerEvents::SHUTDOWN;
        }

        let mut events = TickerEvents::empty();

        if tick.is_multiple_of(self.report_interval) {
            events.insert(TickerEvents::REPORT);
        }

        events
    }
}
