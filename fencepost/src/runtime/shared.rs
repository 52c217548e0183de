use crate::runtime::RuntimeConfig;
use crate::task::{TaskError, TaskFailure};
use parking_lot::Mutex;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::Thread;

/// Per-thread data other threads need to read: the fence, and how far the
/// thread got through the rounds.
#[derive(Debug)]
pub(crate) struct ThreadSlot {
    fence: AtomicBool,

    running: AtomicBool,

    /// Last round this thread finished. Tasks on other threads use it to
    /// decide whether a dependency queued here can still make progress.
    finished_round: AtomicU64,

    /// Handle used to unpark the thread when it idles with `IdleStrategy::Park`.
    thread: OnceLock<Thread>,
}

impl ThreadSlot {
    fn new() -> Self {
        Self {
            // Threads start fenced, ready to accept the first round's tasks.
            fence: AtomicBool::new(true),
            running: AtomicBool::new(true),
            finished_round: AtomicU64::new(0),
            thread: OnceLock::new(),
        }
    }

    fn unpark(&self) {
        if let Some(thread) = self.thread.get() {
            thread.unpark();
        }
    }
}

/// State shared by the manager and every `TaskThread`.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) cfg: RuntimeConfig,

    pub(crate) shutdown: AtomicBool,

    /// Incremented by `clear_fences()` before any fence is cleared, so a
    /// thread observing a cleared fence always observes the new round.
    round: AtomicU64,

    slots: Box<[ThreadSlot]>,

    failures: Mutex<Vec<TaskFailure>>,

    #[cfg(test)]
    pub(crate) tracker: crate::utils::Tracker,
}

impl Shared {
    pub(crate) fn new(cfg: &RuntimeConfig) -> Self {
        Self {
            cfg: cfg.clone(),
            shutdown: AtomicBool::new(false),
            round: AtomicU64::new(0),
            slots: (0..cfg.worker_threads).map(|_| ThreadSlot::new()).collect(),
            failures: Mutex::new(Vec::new()),
            #[cfg(test)]
            tracker: crate::utils::Tracker::new(),
        }
    }

    #[inline(always)]
    pub(crate) fn round(&self) -> u64 {
        self.round.load(Ordering::Acquire)
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    #[track_caller]
    fn slot(&self, index: usize) -> &ThreadSlot {
        &self.slots[index]
    }

    pub(crate) fn register_thread(&self, index: usize, thread: Thread) {
        let res = self.slot(index).thread.set(thread);
        debug_assert!(res.is_ok(), "thread {index} registered twice");
    }

    pub(crate) fn is_fenced(&self, index: usize) -> bool {
        self.slot(index).fence.load(Ordering::Acquire)
    }

    pub(crate) fn is_running(&self, index: usize) -> bool {
        self.slot(index).running.load(Ordering::Acquire)
    }

    pub(crate) fn set_running(&self, index: usize, running: bool) {
        let slot = self.slot(index);
        slot.running.store(running, Ordering::Release);
        if !running {
            slot.unpark();
        }
    }

    pub(crate) fn has_finished_round(&self, index: usize, round: u64) -> bool {
        self.slot(index).finished_round.load(Ordering::Acquire) >= round
    }

    /// Only the owning thread raises its fence.
    pub(crate) fn raise_fence(&self, index: usize, round: u64) {
        let slot = self.slot(index);
        slot.finished_round.fetch_max(round, Ordering::AcqRel);
        slot.fence.store(true, Ordering::Release);
    }

    pub(crate) fn clear_fence(&self, index: usize) -> Result<(), TaskError> {
        let slot = self.slot(index);
        slot.fence
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| TaskError::FenceNotSet { thread: index })?;
        slot.unpark();
        Ok(())
    }

    /// Starts a new round on every thread. Either every fence is cleared or,
    /// if one thread is still busy, none is.
    pub(crate) fn clear_fences(&self) -> Result<u64, TaskError> {
        if let Some(thread) = (0..self.slots.len()).find(|&i| !self.is_fenced(i)) {
            return Err(TaskError::FenceNotSet { thread });
        }

        let round = self.round.fetch_add(1, Ordering::AcqRel) + 1;
        for index in 0..self.slots.len() {
            self.clear_fence(index)?;
        }

        Ok(round)
    }

    /// Number of threads whose fence is still down.
    pub(crate) fn num_unfenced(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| !slot.fence.load(Ordering::Acquire))
            .count()
    }

    pub(crate) fn unpark_all_threads(&self) {
        self.slots.iter().for_each(ThreadSlot::unpark);
    }

    pub(crate) fn record_failure(&self, failure: TaskFailure) {
        self.failures.lock().push(failure);
    }

    pub(crate) fn take_failures(&self) -> Vec<TaskFailure> {
        std::mem::take(&mut *self.failures.lock())
    }
}
