use crate::task::Id;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Method {
    Push,
    Execute,
    Complete,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Call {
    /// Global order across every method and thread.
    pub(crate) seq: u64,
    pub(crate) thread: usize,
    pub(crate) id: Id,
    pub(crate) round: u64,
}

/// Records what the task threads did, so tests can assert on ordering.
#[derive(Debug, Clone)]
pub(crate) struct Tracker {
    seq: Arc<AtomicU64>,
    calls: Arc<DashMap<Method, Vec<Call>>>,
}

impl Tracker {
    pub(crate) fn new() -> Self {
        let map = DashMap::new();
        map.insert(Method::Push, Vec::new());
        map.insert(Method::Execute, Vec::new());
        map.insert(Method::Complete, Vec::new());
        map.insert(Method::Fail, Vec::new());

        Self {
            seq: Arc::new(AtomicU64::new(0)),
            calls: Arc::new(map),
        }
    }

    pub(crate) fn record(&self, method: Method, thread: usize, id: Id, round: u64) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);

        self.calls
            .get_mut(&method)
            .expect("method not found")
            .push(Call {
                seq,
                thread,
                id,
                round,
            })
    }

    pub(crate) fn get_calls(&self, method: &Method) -> Vec<Call> {
        self.calls
            .get(method)
            .expect("method not found")
            .value()
            .clone()
    }

    pub(crate) fn calls_for(&self, method: &Method, id: Id) -> Vec<Call> {
        self.get_calls(method)
            .into_iter()
            .filter(|call| call.id == id)
            .collect()
    }

    pub(crate) fn num_calls(&self, method: &Method) -> usize {
        self.calls.get(method).map_or(0, |calls| calls.len())
    }
}
