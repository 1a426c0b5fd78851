#![allow(dead_code)]
//! Shared integration test utilities.
//!
//! Import with:
//! ```ignore
//! mod common;
//! use common::*;
//! ```

pub use taskline::test_utils::{init_test_logging, manual_manager, EventRecord, RecordingEvents};

use std::sync::{Arc, Mutex};
use taskline::{DoneStatus, Task, TaskBuilder};

/// A shared, ordered log of scheduling observations.
#[derive(Debug, Default, Clone)]
pub struct NameLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl NameLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.entries.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}

/// Builds a task that logs its name when serviced and returns `status`.
pub fn logging_task(builder: TaskBuilder, log: &NameLog, status: DoneStatus) -> Arc<Task> {
    let log = log.clone();
    builder.build_fn(move |cx| {
        log.push(cx.task().name());
        status
    })
}
