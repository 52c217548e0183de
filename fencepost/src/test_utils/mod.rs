use crate::runtime::{RuntimeConfig, TaskManager};
use crate::task::{DestructionTask, IdGenerator, Outcome, Task, TaskContext};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing_subscriber::EnvFilter;

/// Installs a fmt subscriber honoring `RUST_LOG`. Safe to call from every test.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub(crate) fn default_max_retries() -> u32 {
    RuntimeConfig::default().max_retries_per_round
}

pub(crate) fn completing_task(ids: &IdGenerator, name: &str) -> Task {
    Task::from_fn(ids.next(), name, "tests", |_| Ok(Outcome::Completed))
}

#[derive(Debug, Default, Clone)]
pub(crate) struct Flag(Arc<AtomicBool>);

impl Flag {
    pub(crate) fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub(crate) fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Default, Clone)]
pub(crate) struct Counter(Arc<AtomicUsize>);

impl Counter {
    /// Returns the value after the increment.
    pub(crate) fn incr(&self) -> usize {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}

/// Stands in for an engine object whose resources are released by a
/// destruction task after the object itself is gone.
#[derive(Debug)]
pub(crate) struct Owner {
    name: String,
    buffer: Vec<u8>,
    freed: Flag,
}

impl Owner {
    pub(crate) fn new(name: &str, freed: Flag) -> Self {
        Self {
            name: name.to_string(),
            buffer: vec![0; 64],
            freed,
        }
    }

    pub(crate) fn into_cleanup(
        self,
    ) -> impl FnMut(&TaskContext) -> anyhow::Result<Outcome> + Send + 'static {
        let mut owned = Some(self);

        move |_| {
            if let Some(owner) = owned.take() {
                assert_eq!(owner.buffer.len(), 64);
                owner.freed.set();
            }
            Ok(Outcome::Completed)
        }
    }

    pub(crate) fn into_destruction_task(self, ids: &IdGenerator) -> DestructionTask {
        let name = format!("free-{}", self.name);
        DestructionTask::from_fn(ids.next(), name, "tests", self.into_cleanup())
    }
}

/// Execution order shared by the tasks of one test.
#[derive(Debug, Default, Clone)]
pub(crate) struct OrderLog(Arc<Mutex<Vec<String>>>);

impl OrderLog {
    pub(crate) fn record(&self, name: &str) {
        self.0.lock().push(name.to_string());
    }

    pub(crate) fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub(crate) fn position(&self, name: &str) -> Option<usize> {
        self.0.lock().iter().position(|entry| entry == name)
    }

    pub(crate) fn len(&self) -> usize {
        self.0.lock().len()
    }
}

/// A task that appends its name to `log` and completes.
pub(crate) fn logging_task(manager: &TaskManager, log: &OrderLog, name: &str) -> Task {
    let log = log.clone();
    let label = name.to_string();
    manager.task_fn(name, move |_| {
        log.record(&label);
        Ok(Outcome::Completed)
    })
}
