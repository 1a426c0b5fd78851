//! A composite task that runs a list of sub-tasks, one per epoch.

use crate::manager::TaskManager;
use crate::task::{Task, TaskCx, TaskPayload};
use crate::types::DoneStatus;
use std::sync::Arc;

/// Runs an ordered list of sub-tasks, one per epoch, with an optional
/// repeat count.
///
/// The sequence itself is a [`TaskPayload`]: wrap it in a task and submit
/// that. Sub-tasks are never submitted to a manager; the sequence drives
/// their work functions and lifecycle hooks directly and translates each
/// sub-task's status into its own:
///
/// - sub-task `Done` advances the index and continues next epoch;
/// - sub-task `Again` sleeps on the sub-task's delay and retries it;
/// - sub-task `Pause` advances first, then sleeps on the sub-task's delay;
/// - sub-task `Continue`/`Pickup` keep the sub-task current and propagate;
/// - sub-task `Exit`/`Interrupt`/`Abort` end the sequence with that status.
///
/// Running off the end restarts the sequence while repeats remain,
/// otherwise completes it.
pub struct TaskSequence {
    tasks: Vec<Arc<Task>>,
    index: usize,
    repeat_count: u32,
    current: Option<Arc<Task>>,
}

impl TaskSequence {
    /// Creates an empty sequence that runs once.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            index: 0,
            repeat_count: 0,
            current: None,
        }
    }

    /// Appends a sub-task.
    pub fn add_task(&mut self, task: Arc<Task>) -> &mut Self {
        self.tasks.push(task);
        self
    }

    /// Sets how many times the sequence restarts after its first pass.
    pub fn set_repeat_count(&mut self, repeat_count: u32) -> &mut Self {
        self.repeat_count = repeat_count;
        self
    }

    /// Remaining restarts.
    #[must_use]
    pub fn repeat_count(&self) -> u32 {
        self.repeat_count
    }

    /// Number of sub-tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// True if the sequence has no sub-tasks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Index of the sub-task that runs next.
    #[must_use]
    pub fn current_index(&self) -> usize {
        self.index
    }

    fn release_current(&mut self, manager: Option<&TaskManager>, clean_exit: bool) {
        if let Some(task) = self.current.take() {
            task.invoke_death(manager, clean_exit);
        }
    }
}

impl Default for TaskSequence {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskPayload for TaskSequence {
    fn work(&mut self, cx: &TaskCx<'_>) -> DoneStatus {
        if self.index >= self.tasks.len() {
            if self.repeat_count > 0 && !self.tasks.is_empty() {
                self.repeat_count -= 1;
                self.index = 0;
            } else {
                return DoneStatus::Done;
            }
        }

        let sub = Arc::clone(&self.tasks[self.index]);
        let newly_current = self
            .current
            .as_ref()
            .map_or(true, |current| current.id() != sub.id());
        if newly_current {
            if let Some(manager) = cx.manager() {
                sub.invoke_birth(manager);
            }
            self.current = Some(Arc::clone(&sub));
        }

        let sub_cx = cx.with_task(&sub);
        let status = sub.invoke_work(&sub_cx);
        match status {
            DoneStatus::Done => {
                self.release_current(cx.manager(), true);
                self.index += 1;
                DoneStatus::Continue
            }
            DoneStatus::Again => {
                cx.task().set_delay(sub.delay());
                DoneStatus::Again
            }
            DoneStatus::Pause => {
                self.release_current(cx.manager(), true);
                self.index += 1;
                cx.task().set_delay(sub.delay());
                DoneStatus::Again
            }
            DoneStatus::Continue | DoneStatus::Pickup => status,
            DoneStatus::Await => DoneStatus::Continue,
            DoneStatus::Exit | DoneStatus::Interrupt | DoneStatus::Abort => {
                self.release_current(cx.manager(), false);
                status
            }
        }
    }

    fn upon_death(&mut self, manager: Option<&TaskManager>, _task: &Arc<Task>, _clean_exit: bool) {
        // An interrupted sub-task never exits cleanly.
        self.release_current(manager, false);
    }
}

impl Drop for TaskSequence {
    fn drop(&mut self) {
        self.release_current(None, false);
    }
}
