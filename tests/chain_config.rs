//! Chain configuration semantics: frame budgets, pickup mode, clock
//! ticking, and timeslice priority, driven deterministically on a manual
//! clock whose time only moves when the tasks say so.

mod common;

use common::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use taskline::{Clock, DoneStatus, Task, TaskManager};

#[test]
fn frame_budget_stops_polling_mid_frame() {
    init_test_logging();
    let (manager, clock) = manual_manager("config-budget");
    let chain = manager.default_chain();
    chain.set_frame_budget(Some(Duration::from_millis(10)));

    // Each task costs 20ms of (manual) real time, far over the budget.
    let runs = Arc::new(AtomicUsize::new(0));
    for index in 0..3 {
        let clock = Arc::clone(&clock);
        let runs = Arc::clone(&runs);
        let task = Task::from_fn(format!("expensive-{index}"), move |_| {
            clock.advance(Duration::from_millis(20));
            runs.fetch_add(1, Ordering::SeqCst);
            DoneStatus::Done
        });
        manager.add(&task).unwrap();
    }

    // One task per frame: the budget is blown after the first service.
    manager.poll();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(manager.num_tasks(), 2);

    // Same frame, still over budget: nothing runs.
    manager.poll();
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    // Next frame resets the budget accounting.
    clock.tick();
    manager.poll();
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    clock.tick();
    manager.poll();
    assert_eq!(runs.load(Ordering::SeqCst), 3);
    assert_eq!(manager.num_tasks(), 0);
}

#[test]
fn pickup_reruns_within_one_poll_under_budget() {
    init_test_logging();
    let (manager, clock) = manual_manager("config-pickup");
    let chain = manager.default_chain();
    chain.set_frame_budget(Some(Duration::from_millis(100)));

    // Returns Pickup twice, then Done; each run costs 1ms.
    let runs = Arc::new(AtomicUsize::new(0));
    let task = {
        let clock = Arc::clone(&clock);
        let runs = Arc::clone(&runs);
        Task::from_fn("eager", move |_| {
            clock.advance(Duration::from_millis(1));
            match runs.fetch_add(1, Ordering::SeqCst) {
                0 | 1 => DoneStatus::Pickup,
                _ => DoneStatus::Done,
            }
        })
    };
    manager.add(&task).unwrap();

    // A single poll drains the pickup reruns: the budget has room.
    manager.poll();
    assert_eq!(runs.load(Ordering::SeqCst), 3);
    assert_eq!(manager.num_tasks(), 0);
}

#[test]
fn tick_clock_advances_frames_at_epoch_boundaries() {
    init_test_logging();
    let (manager, clock) = manual_manager("config-tick");
    let chain = manager.default_chain();
    chain.set_tick_clock(true);
    assert!(chain.tick_clock());

    let task = Task::from_fn("frame-task", |_| DoneStatus::Continue);
    manager.add(&task).unwrap();
    assert_eq!(clock.frame_count(), 0);

    // First poll begins the first epoch (one tick) and rolls it over at
    // the end (a second tick).
    manager.poll();
    assert_eq!(clock.frame_count(), 2);

    // Steady state: one epoch, one tick.
    manager.poll();
    assert_eq!(clock.frame_count(), 3);

    assert!(manager.remove(&task));
}

#[test]
fn timeslice_priority_postpones_expensive_tasks() {
    init_test_logging();
    let (manager, clock) = manual_manager("config-timeslice");
    let chain = manager.default_chain();
    chain.set_timeslice_priority(true);
    assert!(chain.timeslice_priority());

    let expensive_runs = Arc::new(AtomicUsize::new(0));
    let cheap_runs = Arc::new(AtomicUsize::new(0));

    let expensive = {
        let clock = Arc::clone(&clock);
        let runs = Arc::clone(&expensive_runs);
        Task::from_fn("expensive", move |_| {
            clock.advance(Duration::from_millis(30));
            runs.fetch_add(1, Ordering::SeqCst);
            DoneStatus::Continue
        })
    };
    let cheap = {
        let runs = Arc::clone(&cheap_runs);
        Task::from_fn("cheap", move |_| {
            runs.fetch_add(1, Ordering::SeqCst);
            DoneStatus::Continue
        })
    };
    manager.add(&expensive).unwrap();
    manager.add(&cheap).unwrap();

    // Epoch 1: no history yet, both run. Afterwards the expensive task has
    // consumed more than its (equal-priority) share and is postponed each
    // epoch, while the cheap one keeps running.
    for _ in 0..4 {
        manager.poll();
    }
    assert_eq!(expensive_runs.load(Ordering::SeqCst), 1);
    assert_eq!(cheap_runs.load(Ordering::SeqCst), 4);

    assert!(manager.remove(&expensive));
    assert!(manager.remove(&cheap));
}

#[test]
fn frame_sync_runs_at_most_one_epoch_per_tick() {
    init_test_logging();
    let (manager, clock) = manual_manager("config-frame-sync");
    let chain = manager.default_chain();
    chain.set_frame_sync(true);
    assert!(chain.frame_sync());

    let runs = Arc::new(AtomicUsize::new(0));
    let task = {
        let runs = Arc::clone(&runs);
        Task::from_fn("synced", move |_| {
            runs.fetch_add(1, Ordering::SeqCst);
            DoneStatus::Continue
        })
    };
    manager.add(&task).unwrap();

    // Repolling within one clock frame does not rerun the epoch.
    clock.tick();
    manager.poll();
    let after_first_frame = runs.load(Ordering::SeqCst);
    manager.poll();
    manager.poll();
    assert_eq!(runs.load(Ordering::SeqCst), after_first_frame);

    // Ticking the clock releases one more epoch.
    clock.tick();
    manager.poll();
    assert_eq!(runs.load(Ordering::SeqCst), after_first_frame + 1);

    assert!(manager.remove(&task));
}

#[test]
fn stats_spans_bracket_task_execution() {
    init_test_logging();
    let stats = taskline::test_utils::RecordingStats::new();
    let manager = TaskManager::builder("config-stats")
        .clock(Arc::new(taskline::ManualClock::new()))
        .stats(stats.clone())
        .build_without_env();

    for index in 0..2 {
        let task = Task::from_fn(format!("measured-{index}"), |_| DoneStatus::Done);
        manager.add(&task).unwrap();
    }
    manager.poll();

    let (started, stopped, _, _) = stats.counts();
    assert_eq!(started, 2);
    assert_eq!(stopped, 2);
}

#[test]
fn env_overrides_configure_the_default_chain() {
    init_test_logging();
    // Builder values win over the environment; unset values fall through.
    std::env::set_var(taskline::manager::ENV_DEFAULT_THREADS, "3");
    let manager = TaskManager::builder("config-env").build().unwrap();
    assert_eq!(manager.default_chain().num_threads(), 3);

    let explicit = TaskManager::builder("config-env-explicit")
        .default_threads(1)
        .build()
        .unwrap();
    assert_eq!(explicit.default_chain().num_threads(), 1);
    std::env::remove_var(taskline::manager::ENV_DEFAULT_THREADS);

    std::env::set_var(taskline::manager::ENV_FRAME_BUDGET_MS, "not-a-number");
    assert!(TaskManager::builder("config-env-bad").build().is_err());
    std::env::remove_var(taskline::manager::ENV_FRAME_BUDGET_MS);
}
