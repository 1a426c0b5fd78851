//! Test utilities shared by unit and integration tests.
//!
//! - Consistent tracing-based logging initialization
//! - Phase/section macros for readable test output
//! - Recording doubles for the event and statistics sinks
//! - A manager constructor wired to a [`ManualClock`]

use crate::clock::ManualClock;
use crate::event::EventSink;
use crate::manager::TaskManager;
use crate::stats::StatsProvider;
use crate::task::Task;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

static INIT_LOGGING: Once = Once::new();

/// Initialize test logging with trace-level output.
///
/// Safe to call multiple times; only initializes once.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .with_target(true)
            .with_thread_ids(true)
            .with_ansi(false)
            .try_init();
    });
}

/// Prints a phase banner in test output.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!("==== PHASE: {} ====", $name);
    };
}

/// Prints a section banner in test output.
#[macro_export]
macro_rules! test_section {
    ($name:expr) => {
        tracing::info!("---- {} ----", $name);
    };
}

/// Marks a test as complete in test output.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        tracing::info!("==== COMPLETE: {} ====", $name);
    };
}

/// One recorded event-sink notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventRecord {
    /// `task_born` was called.
    Born(String),
    /// `task_died` was called with the given `clean_exit`.
    Died(String, bool),
    /// `post_event` was called with the given event name.
    Posted(String, String),
}

/// An [`EventSink`] that records every notification.
#[derive(Debug, Default)]
pub struct RecordingEvents {
    records: Mutex<Vec<EventRecord>>,
}

impl RecordingEvents {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot of the recorded notifications, in order.
    #[must_use]
    pub fn records(&self) -> Vec<EventRecord> {
        self.records.lock().unwrap().clone()
    }

    /// Clears the recording.
    pub fn clear(&self) {
        self.records.lock().unwrap().clear();
    }
}

impl EventSink for RecordingEvents {
    fn task_born(&self, task: &Arc<Task>) {
        self.records
            .lock()
            .unwrap()
            .push(EventRecord::Born(task.name()));
    }

    fn task_died(&self, task: &Arc<Task>, clean_exit: bool) {
        self.records
            .lock()
            .unwrap()
            .push(EventRecord::Died(task.name(), clean_exit));
    }

    fn post_event(&self, name: &str, task: &Arc<Task>) {
        self.records
            .lock()
            .unwrap()
            .push(EventRecord::Posted(name.to_owned(), task.name()));
    }
}

/// A [`StatsProvider`] that counts span starts and stops.
#[derive(Debug, Default)]
pub struct RecordingStats {
    /// `(task_started, task_stopped, wait_started, wait_stopped)` counts.
    counts: Mutex<(usize, usize, usize, usize)>,
}

impl RecordingStats {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// `(task_started, task_stopped, wait_started, wait_stopped)` counts.
    #[must_use]
    pub fn counts(&self) -> (usize, usize, usize, usize) {
        *self.counts.lock().unwrap()
    }
}

impl StatsProvider for RecordingStats {
    fn task_started(&self, _: &str, _: &str) {
        self.counts.lock().unwrap().0 += 1;
    }

    fn task_stopped(&self, _: &str, _: &str, _: Duration) {
        self.counts.lock().unwrap().1 += 1;
    }

    fn wait_started(&self, _: &str) {
        self.counts.lock().unwrap().2 += 1;
    }

    fn wait_stopped(&self, _: &str, _: Duration) {
        self.counts.lock().unwrap().3 += 1;
    }
}

/// A poll-mode manager on a [`ManualClock`], for deterministic tests.
#[must_use]
pub fn manual_manager(name: &str) -> (TaskManager, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new());
    let manager = TaskManager::builder(name)
        .clock(Arc::clone(&clock) as Arc<dyn crate::clock::Clock>)
        .build_without_env();
    (manager, clock)
}
