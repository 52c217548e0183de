use crate as fencepost;
use crate::runtime::{Builder, DependencyFailurePolicy, TaskManager, current_thread_index};
use crate::task::{self, FailureReason, Id, Outcome, State, Task, TaskError};
use crate::test_utils::*;
use crate::utils::Method;
use anyhow::{Result, anyhow};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn assert_completed_before_executed(manager: &TaskManager, dependency: &Task, dependent: &Task) {
    let tracker = manager.tracker();
    let completed = tracker.calls_for(&Method::Complete, dependency.id());
    let executed = tracker.calls_for(&Method::Execute, dependent.id());

    assert_eq!(completed.len(), 1, "{} completed once", dependency.name());
    assert!(!executed.is_empty(), "{} executed", dependent.name());
    assert!(
        executed.iter().all(|call| call.seq > completed[0].seq),
        "{} ran before {} completed",
        dependent.name(),
        dependency.name()
    );
}

fn assert_queues_drained(manager: &TaskManager) {
    assert!(manager.all_fenced());
    for thread in manager.threads() {
        assert!(thread.is_fenced());
        assert!(!thread.has_task(), "thread {} kept tasks", thread.index());
        assert_eq!(thread.num_destruction_tasks(), 0);
    }
}

#[fencepost::test(worker_threads = 1)]
fn test_dependency_completes_before_dependent(manager: &TaskManager) -> Result<()> {
    let log = OrderLog::default();
    let b = logging_task(manager, &log, "b");
    let a = logging_task(manager, &log, "a");
    a.depends_on(&b)?;

    manager.push_task(&b)?;
    manager.push_task(&a)?;
    manager.execute_round()?;

    assert_eq!(a.state(), State::Completed);
    assert_eq!(b.state(), State::Completed);
    assert_eq!(log.entries(), vec!["b", "a"]);
    assert_completed_before_executed(manager, &b, &a);
    assert_queues_drained(manager);
    Ok(())
}

#[fencepost::test(worker_threads = 1)]
fn test_dependent_pushed_first_is_deferred(manager: &TaskManager) -> Result<()> {
    let log = OrderLog::default();
    let b = logging_task(manager, &log, "b");
    let a = logging_task(manager, &log, "a");
    a.depends_on(&b)?;

    manager.push_task(&a)?;
    manager.push_task(&b)?;
    manager.execute_round()?;

    assert_eq!(log.entries(), vec!["b", "a"]);
    assert!(a.deferral_count() >= 1);
    assert_eq!(b.deferral_count(), 0);
    assert_queues_drained(manager);
    Ok(())
}

#[fencepost::test(worker_threads = 4)]
fn test_chain_across_threads(manager: &TaskManager) -> Result<()> {
    let log = OrderLog::default();
    let names = (0..12).map(|i| format!("stage-{i}")).collect::<Vec<_>>();
    let chain = names
        .iter()
        .map(|name| logging_task(manager, &log, name))
        .collect::<Vec<_>>();

    for pair in chain.windows(2) {
        pair[1].depends_on(&pair[0])?;
    }

    // Last stage first, every stage lands on a different thread than the
    // one it waits for.
    for task in chain.iter().rev() {
        manager.push_task(task)?;
    }
    manager.execute_round()?;

    assert!(chain.iter().all(|t| t.has_state(State::Completed)));
    assert_eq!(log.entries(), names);
    for pair in chain.windows(2) {
        assert_completed_before_executed(manager, &pair[0], &pair[1]);
    }
    assert_queues_drained(manager);
    Ok(())
}

#[fencepost::test(worker_threads = 3)]
fn test_diamond_across_threads(manager: &TaskManager) -> Result<()> {
    let log = OrderLog::default();
    let root = logging_task(manager, &log, "root");
    let left = logging_task(manager, &log, "left");
    let right = logging_task(manager, &log, "right");
    let join = logging_task(manager, &log, "join");

    left.depends_on(&root)?;
    right.depends_on(&root)?;
    join.depends_on(&left)?;
    join.depends_on(&right)?;

    for task in [&join, &right, &left, &root] {
        manager.push_task(task)?;
    }
    manager.execute_round()?;

    assert_eq!(log.len(), 4);
    assert_eq!(log.position("root"), Some(0));
    assert_eq!(log.position("join"), Some(3));
    assert_completed_before_executed(manager, &left, &join);
    assert_completed_before_executed(manager, &right, &join);
    assert_eq!(root.num_dependents(), 0);
    assert!(!join.is_waiting_for_dependencies());
    Ok(())
}

#[fencepost::test(worker_threads = 4)]
fn test_round_robin_dispatch(manager: &TaskManager) -> Result<()> {
    let tasks = (0..10)
        .map(|i| manager.task_fn(format!("job-{i}"), |_| Ok(Outcome::Completed)))
        .collect::<Vec<_>>();

    let threads = tasks
        .iter()
        .map(|task| manager.push_task(task))
        .collect::<Result<Vec<_>, _>>()?;
    assert_eq!(threads, vec![0, 1, 2, 3, 0, 1, 2, 3, 0, 1]);

    manager.execute_round()?;

    assert!(tasks.iter().all(|t| t.has_state(State::Completed)));

    let stats = manager.thread_stats();
    assert_eq!(stats.iter().map(|s| s.received).sum::<u64>(), 10);
    assert_eq!(stats.iter().map(|s| s.completed).sum::<u64>(), 10);
    assert!(stats.iter().all(|s| s.max_received_per_round <= 3));
    assert!(stats.iter().all(|s| s.rounds == 1));
    assert!(
        manager
            .tracker()
            .get_calls(&Method::Execute)
            .iter()
            .all(|call| call.round == 1)
    );

    for index in 0..manager.num_threads() {
        let pushed = manager
            .tracker()
            .get_calls(&Method::Push)
            .into_iter()
            .filter(|call| call.thread == index)
            .count();
        assert!(pushed <= 3);
    }
    Ok(())
}

#[fencepost::test(worker_threads = 2)]
fn test_erroring_task_retried_every_round(manager: &TaskManager) -> Result<()> {
    let task = manager.task_fn("flaky", |_| Err(anyhow!("device lost")));
    manager.push_task(&task)?;

    let mut last = 0;
    for _ in 0..3 {
        manager.execute_round()?;

        let deferrals = task.deferral_count();
        assert!(deferrals > last);
        last = deferrals;

        assert_eq!(task.state(), State::Active);
        assert!(task.thread().is_some());
    }

    assert!(manager.take_failures().is_empty());
    assert_eq!(
        manager.tracker().calls_for(&Method::Execute, task.id()).len() as u32,
        3 * default_max_retries()
    );
    Ok(())
}

#[fencepost::test(worker_threads = 2)]
fn test_failed_task_never_runs_again(manager: &TaskManager) -> Result<()> {
    let calls = Counter::default();
    let task = manager.task_fn("decode", {
        let calls = calls.clone();
        move |_| {
            calls.incr();
            Ok(Outcome::failed("checksum mismatch"))
        }
    });

    manager.push_task(&task)?;
    for _ in 0..3 {
        manager.execute_round()?;
    }

    assert_eq!(task.state(), State::Failed);
    assert_eq!(
        task.failure(),
        Some(FailureReason::Explicit("checksum mismatch".to_string()))
    );
    assert_eq!(calls.get(), 1);
    assert_eq!(manager.tracker().num_calls(&Method::Fail), 1);

    let failures = manager.take_failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].id, task.id());
    assert_eq!(failures[0].owner, "TaskManager");
    assert!(manager.take_failures().is_empty());
    Ok(())
}

#[fencepost::test(worker_threads = 2)]
fn test_panicking_task_fails(manager: &TaskManager) -> Result<()> {
    let task = manager.task_fn("shader", |_| -> Result<Outcome> { panic!("bad uniform") });

    manager.push_task(&task)?;
    manager.execute_round()?;

    assert_eq!(task.state(), State::Failed);
    assert_eq!(
        task.failure(),
        Some(FailureReason::Panicked("bad uniform".to_string()))
    );
    assert_queues_drained(manager);
    Ok(())
}

#[fencepost::test(worker_threads = 2)]
fn test_double_push_rejected(manager: &TaskManager) -> Result<()> {
    let task = manager.task_fn("upload", |_| Ok(Outcome::Completed));

    let thread = manager.push_task(&task)?;
    assert!(matches!(
        manager.push_task(&task),
        Err(TaskError::AlreadyQueued { thread: held_by, .. }) if held_by == thread
    ));

    manager.execute_round()?;
    assert_eq!(task.state(), State::Completed);
    assert_eq!(manager.tracker().calls_for(&Method::Push, task.id()).len(), 1);

    // Finished tasks may be submitted again.
    manager.push_task(&task)?;
    manager.execute_round()?;
    assert_eq!(task.state(), State::Completed);
    assert_eq!(
        manager.tracker().calls_for(&Method::Execute, task.id()).len(),
        2
    );
    Ok(())
}

#[fencepost::test(worker_threads = 4)]
fn test_concurrent_push_accepts_once(manager: &TaskManager) -> Result<()> {
    let task = manager.task_fn("contended", |_| Ok(Outcome::Completed));

    let results = thread::scope(|s| {
        let handles = (0..4)
            .map(|_| s.spawn(|| manager.push_task(&task)))
            .collect::<Vec<_>>();

        handles
            .into_iter()
            .map(|h| h.join().expect("pusher panicked"))
            .collect::<Vec<_>>()
    });

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(
        results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, TaskError::AlreadyQueued { .. }))
    );
    assert_eq!(manager.threads().map(|t| t.num_tasks()).sum::<usize>(), 1);

    manager.execute_round()?;
    assert_eq!(
        manager.tracker().calls_for(&Method::Execute, task.id()).len(),
        1
    );
    Ok(())
}

#[fencepost::test(worker_threads = 2)]
fn test_destruction_task_outlives_owner(manager: &TaskManager) -> Result<()> {
    let freed = Flag::default();
    let task = {
        let owner = Owner::new("mesh", freed.clone());
        owner.into_destruction_task(manager.ids())
    };

    manager.push_destruction_task(&task)?;
    assert!(matches!(
        manager.push_destruction_task(&task),
        Err(TaskError::AlreadyQueued { .. })
    ));
    manager.execute_round()?;

    assert_eq!(task.state(), State::Completed);
    assert!(freed.is_set());
    assert_queues_drained(manager);
    Ok(())
}

#[fencepost::test(worker_threads = 1)]
fn test_destruction_queue_drains_last(manager: &TaskManager) -> Result<()> {
    let log = OrderLog::default();
    let cleanup = manager.destruction_task_fn("cleanup", {
        let log = log.clone();
        move |_| {
            log.record("cleanup");
            Ok(Outcome::Completed)
        }
    });
    let update = logging_task(manager, &log, "update");

    manager.push_destruction_task(&cleanup)?;
    manager.push_task(&update)?;
    manager.execute_round()?;

    assert_eq!(log.entries(), vec!["update", "cleanup"]);
    Ok(())
}

#[fencepost::test(worker_threads = 2)]
fn test_failure_cascades_to_dependents(manager: &TaskManager) -> Result<()> {
    let ran = Counter::default();
    let body = |ran: &Counter| {
        let ran = ran.clone();
        move |_: &task::TaskContext| -> Result<Outcome> {
            ran.incr();
            Ok(Outcome::Completed)
        }
    };

    let a = manager.task_fn("a", |_| Ok(Outcome::failed("out of memory")));
    let b = manager.task_fn("b", body(&ran));
    let c = manager.task_fn("c", body(&ran));
    b.depends_on(&a)?;
    c.depends_on(&b)?;

    for task in [&c, &b, &a] {
        manager.push_task(task)?;
    }
    manager.execute_round()?;

    assert_eq!(ran.get(), 0);
    assert!([&a, &b, &c].iter().all(|t| t.has_state(State::Failed)));
    assert_eq!(
        b.failure(),
        Some(FailureReason::DependencyFailed {
            id: a.id(),
            name: "a".to_string()
        })
    );
    assert_eq!(
        c.failure(),
        Some(FailureReason::DependencyFailed {
            id: b.id(),
            name: "b".to_string()
        })
    );

    let mut failed = manager
        .take_failures()
        .into_iter()
        .map(|f| f.id)
        .collect::<Vec<Id>>();
    failed.sort();
    assert_eq!(failed, vec![a.id(), b.id(), c.id()]);
    assert_queues_drained(manager);
    Ok(())
}

#[fencepost::test(worker_threads = 2)]
fn test_dependency_failed_in_earlier_round(manager: &TaskManager) -> Result<()> {
    let ran = Counter::default();
    let body = |ran: &Counter| {
        let ran = ran.clone();
        move |_: &task::TaskContext| -> Result<Outcome> {
            ran.incr();
            Ok(Outcome::Completed)
        }
    };

    let b = manager.task_fn("b", |_| Ok(Outcome::failed("boom")));
    let a = manager.task_fn("a", body(&ran));
    a.depends_on(&b)?;

    manager.push_task(&b)?;
    manager.execute_round()?;
    assert_eq!(b.state(), State::Failed);

    // Wired after `b` already failed.
    let c = manager.task_fn("c", body(&ran));
    c.depends_on(&b)?;

    manager.push_task(&a)?;
    manager.push_task(&c)?;
    manager.execute_round()?;

    assert_eq!(ran.get(), 0);
    for task in [&a, &c] {
        assert_eq!(task.state(), State::Failed);
        assert_eq!(
            task.failure(),
            Some(FailureReason::DependencyFailed {
                id: b.id(),
                name: "b".to_string()
            })
        );
    }

    let mut failed = manager
        .take_failures()
        .into_iter()
        .map(|f| f.id)
        .collect::<Vec<Id>>();
    failed.sort();
    assert_eq!(failed, vec![b.id(), a.id(), c.id()]);
    assert_queues_drained(manager);
    Ok(())
}

#[test]
fn test_release_policy_after_earlier_failure() -> Result<()> {
    init_tracing();
    let manager = Builder::new()
        .worker_threads(2)
        .dependency_failure_policy(DependencyFailurePolicy::Release)
        .try_build()?;

    let a = manager.task_fn("a", |_| Ok(Outcome::failed("missing asset")));
    manager.push_task(&a)?;
    manager.execute_round()?;

    let b = manager.task_fn("b", |_| Ok(Outcome::Completed));
    b.depends_on(&a)?;
    manager.push_task(&b)?;
    manager.execute_round()?;

    assert_eq!(b.state(), State::Completed);
    assert!(!b.is_waiting_for_dependencies());
    assert_eq!(a.num_dependents(), 0);
    assert_eq!(manager.take_failures().len(), 1);
    Ok(())
}

#[test]
fn test_release_policy_runs_dependents() -> Result<()> {
    init_tracing();
    let manager = Builder::new()
        .worker_threads(2)
        .dependency_failure_policy(DependencyFailurePolicy::Release)
        .try_build()?;

    let a = manager.task_fn("a", |_| Ok(Outcome::failed("missing asset")));
    let b = manager.task_fn("b", |_| Ok(Outcome::Completed));
    b.depends_on(&a)?;

    manager.push_task(&b)?;
    manager.push_task(&a)?;
    manager.execute_round()?;

    assert_eq!(a.state(), State::Failed);
    assert_eq!(b.state(), State::Completed);
    assert_eq!(manager.take_failures().len(), 1);
    Ok(())
}

#[fencepost::test(worker_threads = 2)]
fn test_unsubmitted_dependency_parks_dependent(manager: &TaskManager) -> Result<()> {
    let never = manager.task_fn("never", |_| Ok(Outcome::Completed));
    let task = manager.task_fn("orphan", |_| Ok(Outcome::Completed));
    task.depends_on(&never)?;

    manager.push_task(&task)?;
    manager.execute_round()?;
    let after_first = task.deferral_count();

    assert_eq!(task.state(), State::Queued);
    assert!(after_first >= 1);

    manager.execute_round()?;
    assert!(task.deferral_count() > after_first);

    // Submitting the missing dependency unblocks it.
    manager.push_task(&never)?;
    manager.execute_round()?;
    assert_eq!(never.state(), State::Completed);
    assert_eq!(task.state(), State::Completed);
    assert_queues_drained(manager);
    Ok(())
}

#[test]
fn test_cycle_across_threads_starves() -> Result<()> {
    init_tracing();
    let manager = Builder::new()
        .worker_threads(2)
        .deferral_ceiling(1_000)
        .try_build()?;

    let a = manager.task_fn("a", |_| Ok(Outcome::Completed));
    let b = manager.task_fn("b", |_| Ok(Outcome::Completed));
    a.depends_on(&b)?;
    b.depends_on(&a)?;

    assert_eq!(manager.push_task(&a)?, 0);
    assert_eq!(manager.push_task(&b)?, 1);
    manager.execute_round()?;

    assert_eq!(a.state(), State::Failed);
    assert_eq!(b.state(), State::Failed);
    assert!(
        [a.failure(), b.failure()]
            .iter()
            .any(|f| matches!(f, Some(FailureReason::Starved { .. })))
    );
    Ok(())
}

#[fencepost::test(worker_threads = 2, idle = "park")]
fn test_parked_workers_wake_every_round(manager: &TaskManager) -> Result<()> {
    for round in 1..=3 {
        let task = manager.task_fn(format!("frame-{round}"), |_| Ok(Outcome::Completed));
        manager.push_task(&task)?;
        manager.execute_round()?;

        assert_eq!(task.state(), State::Completed);
        assert_eq!(manager.round(), round);
    }

    assert!(manager.thread_stats().iter().all(|s| s.rounds == 3));
    Ok(())
}

#[fencepost::test(worker_threads = 1)]
fn test_fence_timeout_and_busy_clear(manager: &TaskManager) -> Result<()> {
    let task = manager.task_fn("slow", |_| {
        thread::sleep(Duration::from_millis(200));
        Ok(Outcome::Completed)
    });

    manager.push_task(&task)?;
    manager.clear_fences()?;

    assert!(matches!(
        manager.clear_fences(),
        Err(TaskError::FenceNotSet { thread: 0 })
    ));
    assert!(matches!(
        manager.wait_for_fence_timeout(Duration::from_millis(10)),
        Err(TaskError::FenceTimeout { pending: 1, .. })
    ));

    manager.wait_for_fence_timeout(Duration::from_secs(10))?;
    assert_eq!(task.state(), State::Completed);
    assert_eq!(manager.round(), 1);
    Ok(())
}

#[fencepost::test(worker_threads = 2)]
fn test_push_while_round_in_progress(manager: &TaskManager) -> Result<()> {
    let gate = Flag::default();
    let blocker = manager.task_fn("blocker", {
        let gate = gate.clone();
        move |_| {
            while !gate.is_set() {
                thread::yield_now();
            }
            Ok(Outcome::Completed)
        }
    });
    let late = manager.task_fn("late", |_| Ok(Outcome::Completed));

    assert_eq!(manager.push_task(&blocker)?, 0);
    manager.clear_fences()?;

    // Thread 0 is busy, thread 1 raises its fence once its empty round ends.
    let pusher = thread::scope(|s| {
        let handle = s.spawn(|| manager.push_task(&late));
        let index = handle.join().expect("pusher panicked");
        gate.set();
        index
    })?;
    assert_eq!(pusher, 1);

    manager.wait_for_fence();
    assert_eq!(blocker.state(), State::Completed);
    assert_eq!(late.state(), State::Queued);

    manager.execute_round()?;
    assert_eq!(late.state(), State::Completed);
    Ok(())
}

#[fencepost::test(worker_threads = 2)]
fn test_push_skips_busy_cursor_thread(manager: &TaskManager) -> Result<()> {
    let gate = Flag::default();
    let blocker = manager.task_fn("blocker", {
        let gate = gate.clone();
        move |_| {
            while !gate.is_set() {
                thread::yield_now();
            }
            Ok(Outcome::Completed)
        }
    });
    let filler = manager.task_fn("filler", |_| Ok(Outcome::Completed));
    let late = manager.task_fn("late", |_| Ok(Outcome::Completed));

    assert_eq!(manager.push_task(&blocker)?, 0);
    assert_eq!(manager.push_task(&filler)?, 1);
    manager.clear_fences()?;

    let idle = manager.thread(1).ok_or_else(|| anyhow!("missing thread 1"))?;
    while !idle.is_fenced() {
        thread::yield_now();
    }

    // The cursor is back on thread 0, still running `blocker`.
    let (index, released_by_timeout) = thread::scope(|s| {
        s.spawn(|| {
            let deadline = Instant::now() + Duration::from_secs(2);
            while !gate.is_set() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            gate.set();
        });

        let index = manager.push_task(&late);
        let released_by_timeout = gate.is_set();
        gate.set();
        (index, released_by_timeout)
    });

    assert!(!released_by_timeout, "push waited for the busy thread");
    assert_eq!(index?, 1);

    manager.wait_for_fence();
    assert_eq!(blocker.state(), State::Completed);
    assert_eq!(late.state(), State::Queued);

    manager.execute_round()?;
    assert_eq!(late.state(), State::Completed);
    assert_queues_drained(manager);
    Ok(())
}

#[fencepost::test(worker_threads = 2)]
fn test_task_context_inside_work(manager: &TaskManager) -> Result<()> {
    let seen = Arc::new(Mutex::new(None));
    let task = manager.task_fn("probe", {
        let seen = Arc::clone(&seen);
        move |ctx| {
            *seen.lock() = Some((task::try_id(), current_thread_index(), ctx.id(), ctx.round()));
            Ok(Outcome::Completed)
        }
    });

    let thread = manager.push_task(&task)?;
    manager.execute_round()?;

    assert_eq!(
        *seen.lock(),
        Some((Some(task.id()), Some(thread), task.id(), 1))
    );
    assert_eq!(task::try_id(), None);
    assert_eq!(current_thread_index(), None);
    Ok(())
}

#[fencepost::test(worker_threads = 2)]
fn test_shutdown_rejects_work(manager: &TaskManager) -> Result<()> {
    let task = manager.task_fn("after", |_| Ok(Outcome::Completed));

    manager.shutdown()?;
    manager.shutdown()?;

    assert_eq!(manager.push_task(&task), Err(TaskError::ShutDown));
    assert!(matches!(
        manager.push_destruction_task(&manager.destruction_task_fn("gc", |_| Ok(Outcome::Completed))),
        Err(TaskError::ShutDown)
    ));
    assert_eq!(manager.clear_fences(), Err(TaskError::ShutDown));
    assert_eq!(task.state(), State::New);
    Ok(())
}

#[test]
fn test_shutdown_interrupts_round() -> Result<()> {
    init_tracing();
    let manager = Builder::new()
        .worker_threads(1)
        .max_retries_per_round(u32::MAX)
        .try_build()?;

    // Never parks, the round only ends through shutdown.
    let calls = Counter::default();
    let task = manager.task_fn("spinner", {
        let calls = calls.clone();
        move |_| {
            calls.incr();
            Ok(Outcome::Retry)
        }
    });

    manager.push_task(&task)?;
    manager.clear_fences()?;
    while calls.get() < 100 {
        thread::yield_now();
    }
    assert!(!manager.all_fenced());

    manager.shutdown()?;
    assert!(manager.all_fenced());
    assert_eq!(task.state(), State::Active);
    assert_eq!(manager.thread_stats()[0].rounds, 0);
    Ok(())
}

#[test]
fn test_default_manager() -> Result<()> {
    init_tracing();
    let manager = TaskManager::new()?;

    let expected = thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1).max(1))
        .unwrap_or(1);
    assert_eq!(manager.num_threads(), expected);
    assert!(manager.all_fenced());

    manager.execute_round()?;
    assert_eq!(manager.round(), 1);
    Ok(())
}
