//! Worker-thread scheduling: same-sort concurrency, the barrier rendezvous,
//! blocking waits, abort isolation, and thread lifecycle.

mod common;

use common::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};
use taskline::{test_complete, test_phase};
use taskline::{ChainLifecycle, DoneStatus, Task, TaskManager};

#[test]
fn same_sort_tasks_run_concurrently_across_workers() {
    init_test_logging();
    test_phase!("4 workers, 4 same-sort tasks, all in flight at once");

    let manager = TaskManager::new("threaded-concurrency", 0);
    let chain = manager.make_chain("wide");

    // Every task blocks on the rendezvous until all four are running; if
    // the chain serialized them, this would deadlock instead of passing.
    let rendezvous = Arc::new(Barrier::new(4));
    let completed = Arc::new(AtomicUsize::new(0));
    for priority in 0..4 {
        let rendezvous = Arc::clone(&rendezvous);
        let completed = Arc::clone(&completed);
        let task = Task::builder(format!("wide-{priority}"))
            .chain("wide")
            .priority(priority)
            .build_fn(move |_| {
                rendezvous.wait();
                completed.fetch_add(1, Ordering::SeqCst);
                DoneStatus::Done
            });
        manager.add(&task).unwrap();
    }

    // The barrier task at the next sort value must observe all four done.
    let completed_at_barrier = Arc::clone(&completed);
    let observed = Arc::new(AtomicUsize::new(usize::MAX));
    let observed_clone = Arc::clone(&observed);
    let fence = Task::builder("fence")
        .chain("wide")
        .sort(1)
        .build_fn(move |_| {
            observed_clone.store(completed_at_barrier.load(Ordering::SeqCst), Ordering::SeqCst);
            DoneStatus::Done
        });
    manager.add(&fence).unwrap();

    // Start the workers only after the whole epoch is queued, so all four
    // same-sort tasks are staged together.
    chain.set_num_threads(4);
    manager.wait_for_tasks();
    assert_eq!(completed.load(Ordering::SeqCst), 4);
    assert_eq!(observed.load(Ordering::SeqCst), 4);

    manager.cleanup();
    test_complete!("same_sort_tasks_run_concurrently_across_workers");
}

#[test]
fn single_worker_dequeues_by_priority() {
    init_test_logging();
    let manager = TaskManager::new("threaded-priority", 0);
    let chain = manager.make_chain("serial");

    let log = NameLog::new();
    for (name, priority) in [("p2", 2), ("p7", 7), ("p4", 4)] {
        let task = logging_task(
            Task::builder(name).chain("serial").priority(priority),
            &log,
            DoneStatus::Done,
        );
        manager.add(&task).unwrap();
    }

    // Queue everything before the worker starts draining.
    chain.set_num_threads(1);
    manager.wait_for_tasks();
    assert_eq!(log.entries(), vec!["p7", "p4", "p2"]);
    manager.cleanup();
}

#[test]
fn delayed_task_wakes_in_real_time() {
    init_test_logging();
    let manager = TaskManager::new("threaded-sleep", 0);
    let chain = manager.make_chain("timers");
    chain.set_num_threads(1);

    let started = Instant::now();
    let task = Task::builder("delayed")
        .chain("timers")
        .delay(Duration::from_millis(50))
        .build_fn(|_| DoneStatus::Done);
    manager.add(&task).unwrap();
    manager.wait_for_tasks();

    assert!(
        started.elapsed() >= Duration::from_millis(50),
        "woke early after {:?}",
        started.elapsed()
    );
    manager.cleanup();
}

#[test]
fn abort_stops_only_its_own_chain() {
    init_test_logging();
    test_phase!("DS_abort flags one chain; the manager keeps going");

    let manager = TaskManager::new("threaded-abort", 0);
    let doomed = manager.make_chain("doomed");
    doomed.set_num_threads(2);

    let aborter = Task::builder("aborter")
        .chain("doomed")
        .build_fn(|_| DoneStatus::Abort);
    manager.add(&aborter).unwrap();

    // The chain transitions to Aborting once the worker dispatches Abort.
    let deadline = Instant::now() + Duration::from_secs(5);
    while doomed.state() != ChainLifecycle::Aborting {
        assert!(Instant::now() < deadline, "chain never aborted");
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(doomed.num_tasks(), 0);

    // Other chains are unaffected: the default chain still services work.
    let ran = Arc::new(AtomicUsize::new(0));
    let ran_clone = Arc::clone(&ran);
    let bystander = Task::from_fn("bystander", move |_| {
        ran_clone.fetch_add(1, Ordering::SeqCst);
        DoneStatus::Done
    });
    manager.add(&bystander).unwrap();
    manager.poll();
    assert_eq!(ran.load(Ordering::SeqCst), 1);

    manager.cleanup();
    test_complete!("abort_stops_only_its_own_chain");
}

#[test]
fn stop_threads_preserves_pending_tasks() {
    init_test_logging();
    let manager = TaskManager::new("threaded-stop", 0);
    let chain = manager.make_chain("pausable");
    chain.set_num_threads(1);

    let runs = Arc::new(AtomicUsize::new(0));
    let runs_clone = Arc::clone(&runs);
    let task = Task::builder("steady")
        .chain("pausable")
        .build_fn(move |_| {
            runs_clone.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(1));
            DoneStatus::Continue
        });
    manager.add(&task).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while runs.load(Ordering::SeqCst) == 0 {
        assert!(Instant::now() < deadline, "task never ran");
        std::thread::sleep(Duration::from_millis(5));
    }

    chain.stop_threads();
    assert_eq!(chain.num_running_threads(), 0);
    assert_eq!(chain.num_tasks(), 1, "stopping must not drop the task");

    let after_stop = runs.load(Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(runs.load(Ordering::SeqCst), after_stop, "no thread, no runs");

    // Restarting resumes servicing the same task.
    chain.start_threads();
    let deadline = Instant::now() + Duration::from_secs(5);
    while runs.load(Ordering::SeqCst) == after_stop {
        assert!(Instant::now() < deadline, "task never resumed");
        std::thread::sleep(Duration::from_millis(5));
    }

    assert!(manager.remove(&task));
    manager.cleanup();
}

#[test]
fn wait_for_tasks_blocks_until_threaded_chain_drains() {
    init_test_logging();
    let manager = TaskManager::new("threaded-wait", 0);
    let chain = manager.make_chain("busy");
    chain.set_num_threads(2);

    for index in 0..6 {
        let task = Task::builder(format!("job-{index}"))
            .chain("busy")
            .build_fn(|_| {
                std::thread::sleep(Duration::from_millis(10));
                DoneStatus::Done
            });
        manager.add(&task).unwrap();
    }

    manager.wait_for_tasks();
    assert_eq!(manager.num_tasks(), 0);
    manager.cleanup();
}

#[test]
fn threads_start_lazily_on_first_add() {
    init_test_logging();
    let manager = TaskManager::new("threaded-lazy", 0);
    let chain = manager.make_chain("lazy");
    chain.set_num_threads(2);
    assert_eq!(chain.num_running_threads(), 0);

    let task = Task::builder("starter")
        .chain("lazy")
        .build_fn(|_| DoneStatus::Done);
    manager.add(&task).unwrap();
    assert_eq!(chain.num_running_threads(), 2);
    assert_eq!(chain.state(), ChainLifecycle::Started);

    manager.wait_for_tasks();
    manager.cleanup();
    assert_eq!(chain.num_running_threads(), 0);
    assert_eq!(chain.state(), ChainLifecycle::Initial);
}
