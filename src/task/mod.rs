//! Tasks: units of resumable work with identity and scheduling parameters.
//!
//! A [`Task`] couples a scheduling record (name, chain, sort, priority,
//! delay, timing counters) with a polymorphic [`TaskPayload`] that supplies
//! the work function and lifecycle hooks. Tasks are shared via `Arc`: the
//! chain queues hold owning references downward, while the task holds a
//! weak reference upward to its manager, cleared on detach.

pub mod collection;
pub mod sequence;

use crate::clock::Clock;
use crate::manager::{ManagerCore, SchedState, TaskManager};
use crate::types::{DoneStatus, TaskId, TaskState, Time};
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// The polymorphic face of a task: the work function and lifecycle hooks.
///
/// `work` runs with the shared scheduler lock released; the hooks likewise.
/// `is_runnable` is the one exception: it is consulted with the lock held,
/// just before insertion, and must be cheap.
pub trait TaskPayload: Send + 'static {
    /// Performs one unit of work and reports what to do next.
    fn work(&mut self, cx: &TaskCx<'_>) -> DoneStatus;

    /// Sanity check consulted before the task is queued.
    fn is_runnable(&self) -> bool {
        true
    }

    /// Called when the task is accepted by a manager.
    fn upon_birth(&mut self, manager: &TaskManager, task: &Arc<Task>) {
        let _ = (manager, task);
    }

    /// Called when the task leaves its manager. `clean_exit` is true only
    /// for a [`DoneStatus::Done`] completion; `manager` is `None` when the
    /// task dies outside any manager (e.g. a sequence discarding a
    /// never-submitted sub-task).
    fn upon_death(&mut self, manager: Option<&TaskManager>, task: &Arc<Task>, clean_exit: bool) {
        let _ = (manager, task, clean_exit);
    }
}

struct FunctionTask<F> {
    func: F,
}

impl<F> TaskPayload for FunctionTask<F>
where
    F: FnMut(&TaskCx<'_>) -> DoneStatus + Send + 'static,
{
    fn work(&mut self, cx: &TaskCx<'_>) -> DoneStatus {
        (self.func)(cx)
    }
}

/// Context handed to a task's work function.
///
/// Carries the task itself, the owning manager (if any), and the clock, so
/// work functions can query elapsed time without touching the shared lock.
pub struct TaskCx<'a> {
    task: &'a Arc<Task>,
    manager: Option<TaskManager>,
    clock: Arc<dyn Clock>,
}

impl<'a> TaskCx<'a> {
    pub(crate) fn new(
        task: &'a Arc<Task>,
        manager: Option<TaskManager>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            task,
            manager,
            clock,
        }
    }

    /// Rebinds the context to a different task, keeping manager and clock.
    pub(crate) fn with_task<'b>(&self, task: &'b Arc<Task>) -> TaskCx<'b> {
        TaskCx {
            task,
            manager: self.manager.clone(),
            clock: Arc::clone(&self.clock),
        }
    }

    /// The task being serviced.
    #[must_use]
    pub fn task(&self) -> &Arc<Task> {
        self.task
    }

    /// The manager servicing the task, if it is owned by one.
    #[must_use]
    pub fn manager(&self) -> Option<&TaskManager> {
        self.manager.as_ref()
    }

    /// Current frame time on the manager's clock.
    #[must_use]
    pub fn now(&self) -> Time {
        self.clock.now()
    }

    /// Current frame number on the manager's clock.
    #[must_use]
    pub fn frame(&self) -> u64 {
        self.clock.frame_count()
    }

    /// Frame time elapsed since the task started (or last woke).
    #[must_use]
    pub fn elapsed_time(&self) -> Duration {
        self.clock.now().duration_since(self.task.start_time())
    }

    /// Frames elapsed since the task started (or last woke).
    #[must_use]
    pub fn elapsed_frames(&self) -> u64 {
        self.clock
            .frame_count()
            .saturating_sub(self.task.sched.lock().start_frame)
    }
}

/// Scheduling record; guarded by its own lock, which is only ever taken
/// after the shared scheduler lock when both are held.
pub(crate) struct TaskSched {
    pub(crate) name: String,
    pub(crate) chain_name: String,
    pub(crate) owner_chain: Option<String>,
    pub(crate) sort: i32,
    pub(crate) priority: i32,
    pub(crate) delay: Option<Duration>,
    pub(crate) wake_time: Time,
    pub(crate) state: TaskState,
    pub(crate) start_time: Time,
    pub(crate) start_frame: u64,
    pub(crate) dt: Duration,
    pub(crate) max_dt: Duration,
    pub(crate) total_dt: Duration,
    pub(crate) num_frames: u64,
    pub(crate) seq: u64,
    pub(crate) done_event: Option<String>,
    pub(crate) manager: Weak<ManagerCore>,
}

/// A unit of resumable work.
///
/// Construct with [`Task::new`], [`Task::from_fn`], or [`Task::builder`],
/// then submit via [`TaskManager::add`](crate::TaskManager::add).
pub struct Task {
    id: TaskId,
    pub(crate) sched: Mutex<TaskSched>,
    payload: Mutex<Box<dyn TaskPayload>>,
    // Lets &self methods hand owning references to the chain queues.
    self_ref: Weak<Task>,
}

impl Task {
    /// Creates a detached task with default scheduling parameters.
    pub fn new(name: impl Into<String>, payload: impl TaskPayload) -> Arc<Self> {
        Self::builder(name).build(payload)
    }

    /// Creates a detached task backed by a closure.
    pub fn from_fn<F>(name: impl Into<String>, func: F) -> Arc<Self>
    where
        F: FnMut(&TaskCx<'_>) -> DoneStatus + Send + 'static,
    {
        Self::builder(name).build_fn(func)
    }

    /// Starts a [`TaskBuilder`] for a task with the given name.
    pub fn builder(name: impl Into<String>) -> TaskBuilder {
        TaskBuilder::new(name)
    }

    /// The task's unique id.
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// The task's current name.
    #[must_use]
    pub fn name(&self) -> String {
        self.sched.lock().name.clone()
    }

    /// The chain the task targets.
    #[must_use]
    pub fn chain_name(&self) -> String {
        self.sched.lock().chain_name.clone()
    }

    /// The task's sort value (barrier key).
    #[must_use]
    pub fn sort(&self) -> i32 {
        self.sched.lock().sort
    }

    /// The task's priority (intra-sort tie-break, higher runs first).
    #[must_use]
    pub fn priority(&self) -> i32 {
        self.sched.lock().priority
    }

    /// The task's current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TaskState {
        self.sched.lock().state
    }

    /// True while the task is attached to a manager.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.sched.lock().manager.strong_count() > 0
    }

    /// The manager currently owning the task, if any.
    #[must_use]
    pub fn manager(&self) -> Option<TaskManager> {
        self.sched
            .lock()
            .manager
            .upgrade()
            .map(TaskManager::from_core)
    }

    /// The task's configured delay.
    #[must_use]
    pub fn delay(&self) -> Option<Duration> {
        self.sched.lock().delay
    }

    /// True if a delay is configured.
    #[must_use]
    pub fn has_delay(&self) -> bool {
        self.sched.lock().delay.is_some()
    }

    /// Sets (or clears) the delay used the next time the task sleeps.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.sched.lock().delay = delay;
    }

    /// The scheduled wake time; [`Time::ZERO`] unless currently sleeping.
    #[must_use]
    pub fn wake_time(&self) -> Time {
        let sched = self.sched.lock();
        if sched.state == TaskState::Sleeping {
            sched.wake_time
        } else {
            Time::ZERO
        }
    }

    /// The event name posted on clean completion, if configured.
    #[must_use]
    pub fn done_event(&self) -> Option<String> {
        self.sched.lock().done_event.clone()
    }

    /// Sets the event name posted on clean completion.
    pub fn set_done_event(&self, name: impl Into<String>) {
        self.sched.lock().done_event = Some(name.into());
    }

    /// Duration of the most recent `work` invocation.
    #[must_use]
    pub fn dt(&self) -> Duration {
        self.sched.lock().dt
    }

    /// Longest single `work` invocation so far.
    #[must_use]
    pub fn max_dt(&self) -> Duration {
        self.sched.lock().max_dt
    }

    /// Average `work` duration per frame run.
    #[must_use]
    pub fn average_dt(&self) -> Duration {
        let sched = self.sched.lock();
        if sched.num_frames == 0 {
            Duration::ZERO
        } else {
            sched.total_dt / sched.num_frames as u32
        }
    }

    /// Number of epochs the task has been on the active queue for.
    #[must_use]
    pub fn num_frames(&self) -> u64 {
        self.sched.lock().num_frames
    }

    /// Frame time at which the task started or last woke.
    #[must_use]
    pub fn start_time(&self) -> Time {
        self.sched.lock().start_time
    }

    /// Frame time elapsed since the task started, on the manager's clock.
    ///
    /// Zero when the task is not attached to a manager.
    #[must_use]
    pub fn elapsed_time(&self) -> Duration {
        self.with_domain(
            |_core, guard| {
                let now = guard.clock.now();
                now.duration_since(self.sched.lock().start_time)
            },
            || Duration::ZERO,
        )
    }

    /// Frames elapsed since the task started, on the manager's clock.
    ///
    /// Zero when the task is not attached to a manager.
    #[must_use]
    pub fn elapsed_frames(&self) -> u64 {
        self.with_domain(
            |_core, guard| {
                let frame = guard.clock.frame_count();
                frame.saturating_sub(self.sched.lock().start_frame)
            },
            || 0,
        )
    }

    /// Renames the task, updating the manager's name index if attached.
    pub fn set_name(&self, name: impl Into<String>) {
        let name = name.into();
        let this = self.as_arc();
        self.with_domain(
            |_core, guard| crate::chain::rename_task(guard, &this, name.clone()),
            || self.sched.lock().name = name.clone(),
        );
    }

    /// Changes the task's sort value.
    ///
    /// If the task is queued for ordering this epoch it is removed and
    /// reinserted; otherwise the field is changed in place.
    pub fn set_sort(&self, sort: i32) {
        let this = self.as_arc();
        self.with_domain(
            |_core, guard| crate::chain::mutate_queued(guard, &this, |sched| sched.sort = sort),
            || self.sched.lock().sort = sort,
        );
    }

    /// Changes the task's priority; same reinsertion rule as
    /// [`Task::set_sort`].
    pub fn set_priority(&self, priority: i32) {
        let this = self.as_arc();
        self.with_domain(
            |_core, guard| {
                crate::chain::mutate_queued(guard, &this, |sched| sched.priority = priority);
            },
            || self.sched.lock().priority = priority,
        );
    }

    /// Retargets the task at a different chain.
    ///
    /// A queued task migrates immediately; a servicing task migrates when
    /// its work function returns; a detached task just records the name for
    /// its next submission.
    pub fn set_chain(&self, chain: impl Into<String>) {
        let chain = chain.into();
        let this = self.as_arc();
        self.with_domain(
            |core, guard| crate::chain::migrate_task(core, guard, &this, chain.clone()),
            || self.sched.lock().chain_name = chain.clone(),
        );
    }

    /// Re-derives `wake_time = now + delay` while sleeping and restores
    /// heap order. No effect in any other state.
    pub fn recalc_wake_time(&self) {
        let this = self.as_arc();
        self.with_domain(|_core, guard| crate::chain::resleep_task(guard, &this), || ());
    }

    pub(crate) fn invoke_work(&self, cx: &TaskCx<'_>) -> DoneStatus {
        self.payload.lock().work(cx)
    }

    pub(crate) fn invoke_is_runnable(&self) -> bool {
        self.payload.lock().is_runnable()
    }

    pub(crate) fn invoke_birth(&self, manager: &TaskManager) {
        let this = self.as_arc();
        self.payload.lock().upon_birth(manager, &this);
    }

    pub(crate) fn invoke_death(&self, manager: Option<&TaskManager>, clean_exit: bool) {
        let this = self.as_arc();
        self.payload.lock().upon_death(manager, &this, clean_exit);
    }

    /// The owning `Arc` for this task. Valid whenever a method can be
    /// called: tasks are only ever constructed inside an `Arc`.
    fn as_arc(&self) -> Arc<Self> {
        self.self_ref.upgrade().expect("task used after last Arc dropped")
    }

    /// Runs `attached` under the shared scheduler lock if the task is
    /// attached to a manager (re-verified under the lock), else `detached`.
    fn with_domain<R>(
        &self,
        attached: impl FnOnce(&Arc<ManagerCore>, &mut MutexGuard<'_, SchedState>) -> R,
        detached: impl FnOnce() -> R,
    ) -> R {
        let core = self.sched.lock().manager.upgrade();
        if let Some(core) = core {
            let mut guard = core.lock.lock();
            let still_attached = {
                let sched = self.sched.lock();
                sched
                    .manager
                    .upgrade()
                    .is_some_and(|current| Arc::ptr_eq(&current, &core))
            };
            if still_attached {
                return attached(&core, &mut guard);
            }
            drop(guard);
        }
        detached()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sched = self.sched.lock();
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &sched.name)
            .field("chain", &sched.chain_name)
            .field("sort", &sched.sort)
            .field("priority", &sched.priority)
            .field("state", &sched.state)
            .finish()
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.sched.lock().name, self.id)
    }
}

/// Builder for a detached [`Task`].
#[derive(Debug, Clone)]
pub struct TaskBuilder {
    name: String,
    chain_name: String,
    sort: i32,
    priority: i32,
    delay: Option<Duration>,
    done_event: Option<String>,
}

impl TaskBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            chain_name: TaskManager::DEFAULT_CHAIN.to_owned(),
            sort: 0,
            priority: 0,
            delay: None,
            done_event: None,
        }
    }

    /// Targets a chain by name (default `"default"`).
    #[must_use]
    pub fn chain(mut self, chain: impl Into<String>) -> Self {
        self.chain_name = chain.into();
        self
    }

    /// Sets the sort value (default 0).
    #[must_use]
    pub fn sort(mut self, sort: i32) -> Self {
        self.sort = sort;
        self
    }

    /// Sets the priority (default 0).
    #[must_use]
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the initial delay; the task starts sleeping.
    #[must_use]
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Sets the event posted on clean completion.
    #[must_use]
    pub fn done_event(mut self, event: impl Into<String>) -> Self {
        self.done_event = Some(event.into());
        self
    }

    /// Builds the task around a payload.
    pub fn build(self, payload: impl TaskPayload) -> Arc<Task> {
        self.build_boxed(Box::new(payload))
    }

    /// Builds the task around a closure.
    pub fn build_fn<F>(self, func: F) -> Arc<Task>
    where
        F: FnMut(&TaskCx<'_>) -> DoneStatus + Send + 'static,
    {
        self.build_boxed(Box::new(FunctionTask { func }))
    }

    fn build_boxed(self, payload: Box<dyn TaskPayload>) -> Arc<Task> {
        Arc::new_cyclic(|self_ref| Task {
            self_ref: self_ref.clone(),
            id: TaskId::next(),
            sched: Mutex::new(TaskSched {
                name: self.name,
                chain_name: self.chain_name,
                owner_chain: None,
                sort: self.sort,
                priority: self.priority,
                delay: self.delay,
                wake_time: Time::ZERO,
                state: TaskState::Inactive,
                start_time: Time::ZERO,
                start_frame: 0,
                dt: Duration::ZERO,
                max_dt: Duration::ZERO,
                total_dt: Duration::ZERO,
                num_frames: 0,
                seq: 0,
                done_event: self.done_event,
                manager: Weak::new(),
            }),
            payload: Mutex::new(payload),
        })
    }
}
