//! Poll-mode scheduling semantics: priority order, the sort barrier,
//! sleeping tasks, and status dispatch, all on a manual clock.

mod common;

use common::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use taskline::{test_complete, test_phase};
use taskline::{DoneStatus, Task, TaskState, Time};

#[test]
fn one_poll_services_priorities_in_order() {
    init_test_logging();
    test_phase!("priority order within one sort value");

    let (manager, _clock) = manual_manager("poll-priorities");
    let log = NameLog::new();
    for (name, priority) in [("p5", 5), ("p1", 1), ("p9", 9)] {
        let task = logging_task(
            Task::builder(name).priority(priority),
            &log,
            DoneStatus::Done,
        );
        manager.add(&task).unwrap();
    }

    assert_eq!(manager.num_tasks(), 3);
    manager.poll();

    assert_eq!(log.entries(), vec!["p9", "p5", "p1"]);
    assert_eq!(manager.num_tasks(), 0);
    test_complete!("one_poll_services_priorities_in_order");
}

#[test]
fn sort_barrier_beats_priority() {
    init_test_logging();
    test_phase!("low sort finishes before high sort starts");

    let (manager, _clock) = manual_manager("poll-barrier");
    let log = NameLog::new();

    let a = {
        let log = log.clone();
        Task::builder("a").sort(0).priority(1).build_fn(move |_| {
            log.push("a-start");
            log.push("a-end");
            DoneStatus::Done
        })
    };
    let b = {
        let log = log.clone();
        Task::builder("b").sort(1).priority(100).build_fn(move |_| {
            log.push("b-start");
            DoneStatus::Done
        })
    };
    manager.add(&a).unwrap();
    manager.add(&b).unwrap();
    manager.poll();

    assert_eq!(log.entries(), vec!["a-start", "a-end", "b-start"]);
    test_complete!("sort_barrier_beats_priority");
}

#[test]
fn delayed_task_wakes_on_schedule() {
    init_test_logging();
    test_phase!("delay=2.0 at t=10.0 wakes at t>=12.0");

    let (manager, clock) = manual_manager("poll-sleep");
    clock.set_time(Time::from_secs_f64(10.0));

    let task = Task::builder("sleeper")
        .delay(Duration::from_secs_f64(2.0))
        .build_fn(|_| DoneStatus::Done);
    manager.add(&task).unwrap();

    assert_eq!(task.state(), TaskState::Sleeping);
    assert_eq!(task.wake_time(), Time::from_secs_f64(12.0));
    assert_eq!(manager.sleeping_tasks().len(), 1);

    clock.set_time(Time::from_secs_f64(11.9));
    manager.poll();
    assert_eq!(task.state(), TaskState::Sleeping);

    clock.set_time(Time::from_secs_f64(12.0));
    manager.poll();
    assert_eq!(task.state(), TaskState::Inactive);
    assert_eq!(manager.num_tasks(), 0);
    test_complete!("delayed_task_wakes_on_schedule");
}

#[test]
fn again_resleeps_with_reset_start_time() {
    init_test_logging();
    test_phase!("DS_again at t=5.0 with delay=1.0 sleeps until 6.0");

    let (manager, clock) = manual_manager("poll-again");
    clock.set_time(Time::from_secs_f64(5.0));

    let runs = Arc::new(AtomicUsize::new(0));
    let task = {
        let runs = Arc::clone(&runs);
        Task::builder("waker")
            .delay(Duration::from_secs_f64(1.0))
            .build_fn(move |_| {
                if runs.fetch_add(1, Ordering::SeqCst) == 0 {
                    DoneStatus::Again
                } else {
                    DoneStatus::Done
                }
            })
    };
    manager.add(&task).unwrap();
    // Submitted with a delay: sleeps until 6.0 first.
    clock.set_time(Time::from_secs_f64(6.0));
    manager.poll();
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    // The work function returned Again at t=6.0 with delay 1.0.
    assert_eq!(task.state(), TaskState::Sleeping);
    assert_eq!(task.wake_time(), Time::from_secs_f64(7.0));
    assert_eq!(task.start_time(), Time::from_secs_f64(7.0));

    clock.set_time(Time::from_secs_f64(7.0));
    manager.poll();
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(task.state(), TaskState::Inactive);
    test_complete!("again_resleeps_with_reset_start_time");
}

#[test]
fn continue_runs_once_per_poll() {
    init_test_logging();
    let (manager, _clock) = manual_manager("poll-continue");

    let runs = Arc::new(AtomicUsize::new(0));
    let task = {
        let runs = Arc::clone(&runs);
        Task::from_fn("ticker", move |_| {
            runs.fetch_add(1, Ordering::SeqCst);
            DoneStatus::Continue
        })
    };
    manager.add(&task).unwrap();

    for expected in 1..=3 {
        manager.poll();
        assert_eq!(runs.load(Ordering::SeqCst), expected);
        assert_eq!(task.state(), TaskState::Active);
    }
    assert!(manager.remove(&task));
    assert_eq!(manager.num_tasks(), 0);
}

#[test]
fn pickup_without_budget_degrades_to_continue() {
    init_test_logging();
    let (manager, _clock) = manual_manager("poll-pickup-degraded");

    let runs = Arc::new(AtomicUsize::new(0));
    let task = {
        let runs = Arc::clone(&runs);
        Task::from_fn("pickup", move |_| {
            runs.fetch_add(1, Ordering::SeqCst);
            DoneStatus::Pickup
        })
    };
    manager.add(&task).unwrap();

    manager.poll();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    manager.poll();
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    assert!(manager.remove(&task));
}

#[test]
fn exit_retires_without_clean_exit() {
    init_test_logging();
    let events = RecordingEvents::new();
    let manager = taskline::TaskManager::builder("poll-exit")
        .clock(Arc::new(taskline::ManualClock::new()))
        .event_sink(events.clone())
        .build_without_env();

    let done = Task::builder("done")
        .done_event("done-event")
        .build_fn(|_| DoneStatus::Done);
    let exit = Task::from_fn("exit", |_| DoneStatus::Exit);
    manager.add(&done).unwrap();
    manager.add(&exit).unwrap();
    manager.poll();

    let records = events.records();
    assert!(records.contains(&EventRecord::Died("done".into(), true)));
    assert!(records.contains(&EventRecord::Posted("done-event".into(), "done".into())));
    assert!(records.contains(&EventRecord::Died("exit".into(), false)));
}

#[test]
fn removing_a_servicing_task_defers_retirement() {
    init_test_logging();
    test_phase!("self-removal wins over the returned status");

    let events = RecordingEvents::new();
    let manager = taskline::TaskManager::builder("poll-self-remove")
        .clock(Arc::new(taskline::ManualClock::new()))
        .event_sink(events.clone())
        .build_without_env();

    let task = Task::from_fn("suicidal", |cx| {
        let manager = cx.manager().expect("managed task").clone();
        // Removal of a servicing task must not retire it mid-flight.
        assert!(manager.remove(cx.task()));
        assert_eq!(cx.task().state(), TaskState::ServicingRemoved);
        // The returned status is overridden by the pending removal.
        DoneStatus::Continue
    });
    manager.add(&task).unwrap();
    manager.poll();

    assert_eq!(task.state(), TaskState::Inactive);
    assert_eq!(manager.num_tasks(), 0);
    let deaths: Vec<_> = events
        .records()
        .into_iter()
        .filter(|record| matches!(record, EventRecord::Died(..)))
        .collect();
    assert_eq!(deaths, vec![EventRecord::Died("suicidal".into(), false)]);
    test_complete!("removing_a_servicing_task_defers_retirement");
}

#[test]
fn set_sort_and_priority_reorder_queued_tasks() {
    init_test_logging();
    let (manager, _clock) = manual_manager("poll-reorder");
    let log = NameLog::new();

    let low = logging_task(Task::builder("low").priority(1), &log, DoneStatus::Done);
    let high = logging_task(Task::builder("high").priority(9), &log, DoneStatus::Done);
    manager.add(&low).unwrap();
    manager.add(&high).unwrap();

    // Boost `low` above `high` while both are queued.
    low.set_priority(100);
    manager.poll();
    assert_eq!(log.entries(), vec!["low", "high"]);

    log.clear();
    let first = logging_task(Task::builder("first").sort(0), &log, DoneStatus::Done);
    let second = logging_task(Task::builder("second").sort(5), &log, DoneStatus::Done);
    manager.add(&first).unwrap();
    manager.add(&second).unwrap();
    // Push `first` into a later barrier group than `second`.
    first.set_sort(10);
    manager.poll();
    assert_eq!(log.entries(), vec!["second", "first"]);
}

#[test]
fn recalc_wake_time_rederives_from_now() {
    init_test_logging();
    let (manager, clock) = manual_manager("poll-recalc");

    let task = Task::builder("sleeper")
        .delay(Duration::from_secs(5))
        .build_fn(|_| DoneStatus::Done);
    manager.add(&task).unwrap();
    assert_eq!(task.wake_time(), Time::from_secs(5));

    clock.set_time(Time::from_secs(3));
    task.recalc_wake_time();
    assert_eq!(task.wake_time(), Time::from_secs(8));

    clock.set_time(Time::from_secs(5));
    manager.poll();
    assert_eq!(task.state(), TaskState::Sleeping);

    clock.set_time(Time::from_secs(8));
    manager.poll();
    assert_eq!(task.state(), TaskState::Inactive);
}

#[test]
fn servicing_task_can_migrate_chains() {
    init_test_logging();
    let (manager, _clock) = manual_manager("poll-migrate");
    let runs = Arc::new(AtomicUsize::new(0));

    let task = {
        let runs = Arc::clone(&runs);
        Task::from_fn("migrant", move |cx| {
            if runs.fetch_add(1, Ordering::SeqCst) == 0 {
                cx.task().set_chain("elsewhere");
                DoneStatus::Continue
            } else {
                DoneStatus::Done
            }
        })
    };
    manager.add(&task).unwrap();
    manager.poll();

    // The migration applied after work() returned.
    let elsewhere = manager.find_chain("elsewhere").expect("implicit chain");
    assert!(elsewhere.has_task(&task));
    assert_eq!(elsewhere.num_threads(), 0);

    manager.poll();
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(manager.num_tasks(), 0);
}

#[test]
fn wait_for_tasks_drains_poll_mode_chains() {
    init_test_logging();
    let (manager, _clock) = manual_manager("poll-wait");
    let runs = Arc::new(AtomicUsize::new(0));
    for index in 0..3 {
        let runs = Arc::clone(&runs);
        let task = Task::from_fn(format!("t{index}"), move |_| {
            runs.fetch_add(1, Ordering::SeqCst);
            DoneStatus::Done
        });
        manager.add(&task).unwrap();
    }
    manager.wait_for_tasks();
    assert_eq!(manager.num_tasks(), 0);
    assert_eq!(runs.load(Ordering::SeqCst), 3);
}

#[test]
fn task_counts_stay_consistent_across_queues() {
    init_test_logging();
    let (manager, clock) = manual_manager("poll-counts");

    let active = Task::from_fn("active", |_| DoneStatus::Continue);
    let sleeper = Task::builder("sleeper")
        .delay(Duration::from_secs(100))
        .build_fn(|_| DoneStatus::Done);
    manager.add(&active).unwrap();
    manager.add(&sleeper).unwrap();

    for _ in 0..3 {
        manager.poll();
        clock.advance(Duration::from_secs(1));
        assert_eq!(manager.num_tasks(), 2);
        assert_eq!(manager.active_tasks().len(), 1);
        assert_eq!(manager.sleeping_tasks().len(), 1);
        assert_eq!(manager.tasks().len(), 2);
    }

    assert!(manager.remove(&active));
    assert!(manager.remove(&sleeper));
    assert_eq!(manager.num_tasks(), 0);
    assert_eq!(manager.tasks().len(), 0);
}
