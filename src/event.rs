//! Fire-and-forget task event notification.
//!
//! The scheduler posts birth and death notifications, plus the optional
//! `done_event` of a cleanly-completed task, to an [`EventSink`]. Delivery
//! is one-way: the scheduler never blocks on or inspects the sink, and all
//! sink calls happen with the shared scheduler lock released.

use crate::task::Task;
use std::sync::Arc;

/// Receiver for task lifecycle notifications.
///
/// Implementations must not call back into the posting manager's blocking
/// operations (`wait_for_tasks`, `stop_threads`); submitting new tasks is
/// fine.
pub trait EventSink: Send + Sync + 'static {
    /// Called when a task is accepted by a manager, before it is queued.
    fn task_born(&self, task: &Arc<Task>);

    /// Called when a task leaves its manager. `clean_exit` is true only for
    /// a [`DoneStatus::Done`](crate::DoneStatus::Done) completion.
    fn task_died(&self, task: &Arc<Task>, clean_exit: bool);

    /// Called with a task's configured done-event name at clean completion.
    fn post_event(&self, name: &str, task: &Arc<Task>);
}

/// An event sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpEvents;

impl EventSink for NoOpEvents {
    fn task_born(&self, _: &Arc<Task>) {}

    fn task_died(&self, _: &Arc<Task>, _: bool) {}

    fn post_event(&self, _: &str, _: &Arc<Task>) {}
}
