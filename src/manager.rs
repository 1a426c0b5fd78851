//! The task manager: a set of named chains sharing one lock domain.
//!
//! The manager is a container and router: it resolves a submitted task's
//! target chain (lazily creating a zero-thread chain when the name is
//! unknown), maintains a cross-chain ordered index of tasks by name, and
//! exposes aggregate operations (`poll`, `wait_for_tasks`, snapshots). All
//! scheduling happens in the chains; the manager contributes the shared
//! mutex and condition variables they coordinate through, which is what
//! lets a task migrate between chains without a cross-lock hazard.

use crate::chain::{self, ChainState, TaskChain};
use crate::clock::{Clock, RealClock};
use crate::error::TaskError;
use crate::event::{EventSink, NoOpEvents};
use crate::stats::{NoOpStats, StatsProvider};
use crate::task::collection::TaskCollection;
use crate::task::Task;
use crate::types::{ChainLifecycle, TaskId, TaskState, Time};
use crate::util::GlobPattern;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::sync::{Arc, Weak};

/// Environment variable overriding the default chain's thread count.
pub const ENV_DEFAULT_THREADS: &str = "TASKLINE_DEFAULT_THREADS";
/// Environment variable overriding the default chain's frame budget, in
/// milliseconds.
pub const ENV_FRAME_BUDGET_MS: &str = "TASKLINE_FRAME_BUDGET_MS";

/// Mutable scheduler state, guarded by the manager's single shared lock.
pub(crate) struct SchedState {
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) chains: BTreeMap<String, ChainState>,
    pub(crate) tasks_by_name: BTreeMap<(String, TaskId), Arc<Task>>,
    pub(crate) num_tasks: usize,
}

/// Manager-level pieces handed to chain routines alongside a `ChainState`,
/// split-borrowed so a chain and the shared counters can be mutated
/// together.
pub(crate) struct MgrCtx<'a> {
    pub(crate) clock: &'a Arc<dyn Clock>,
    pub(crate) tasks_by_name: &'a mut BTreeMap<(String, TaskId), Arc<Task>>,
    pub(crate) num_tasks: &'a mut usize,
}

impl SchedState {
    pub(crate) fn chain_parts(&mut self, name: &str) -> Option<(&mut ChainState, MgrCtx<'_>)> {
        let Self {
            clock,
            chains,
            tasks_by_name,
            num_tasks,
        } = self;
        chains.get_mut(name).map(|chain| {
            (
                chain,
                MgrCtx {
                    clock,
                    tasks_by_name,
                    num_tasks,
                },
            )
        })
    }
}

/// Shared core: the lock domain plus the injected collaborators.
pub(crate) struct ManagerCore {
    pub(crate) name: String,
    pub(crate) lock: Mutex<SchedState>,
    pub(crate) cvar: Condvar,
    pub(crate) frame_cvar: Condvar,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) stats: Arc<dyn StatsProvider>,
}

/// Creates the named chain with zero threads if it does not exist,
/// logging a diagnostic. Used on the submit and migrate paths.
pub(crate) fn ensure_chain(guard: &mut MutexGuard<'_, SchedState>, name: &str) {
    if !guard.chains.contains_key(name) {
        tracing::warn!(
            chain = name,
            "chain does not exist; creating it with zero threads"
        );
        guard
            .chains
            .insert(name.to_owned(), ChainState::new(name.to_owned(), 0));
    }
}

/// A concurrent, multi-lane cooperative task scheduler.
///
/// Cheap to clone; all clones share the same scheduler. Worker threads keep
/// the scheduler core alive, so call [`TaskManager::cleanup`] (or stop the
/// chains) when finished rather than relying on drop.
#[derive(Clone)]
pub struct TaskManager {
    core: Arc<ManagerCore>,
}

impl TaskManager {
    /// Name of the chain tasks target when none is specified.
    pub const DEFAULT_CHAIN: &'static str = "default";

    /// Creates a manager with a wall clock and a default chain configured
    /// for `default_threads` worker threads (zero means poll-only).
    #[must_use]
    pub fn new(name: impl Into<String>, default_threads: usize) -> Self {
        TaskManagerBuilder::new(name)
            .default_threads(default_threads)
            .build_without_env()
    }

    /// Starts a [`TaskManagerBuilder`].
    pub fn builder(name: impl Into<String>) -> TaskManagerBuilder {
        TaskManagerBuilder::new(name)
    }

    pub(crate) fn from_core(core: Arc<ManagerCore>) -> Self {
        Self { core }
    }

    /// The manager's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// The manager's clock.
    #[must_use]
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.core.lock.lock().clock)
    }

    /// Replaces the manager's clock.
    pub fn set_clock(&self, clock: Arc<dyn Clock>) {
        self.core.lock.lock().clock = clock;
    }

    /// Submits a task to its target chain.
    ///
    /// The task must be detached. If its chain does not exist, a
    /// zero-thread chain is created and a diagnostic logged. The birth
    /// notifications run before the task is queued, with the lock not held.
    pub fn add(&self, task: &Arc<Task>) -> Result<(), TaskError> {
        if task.is_alive() {
            debug_assert!(false, "task is already attached to a manager");
            return Err(TaskError::AlreadyAttached { name: task.name() });
        }

        self.core.events.task_born(task);
        task.invoke_birth(self);

        let mut guard = self.core.lock.lock();
        {
            let sched = task.sched.lock();
            if sched.manager.strong_count() != 0 || sched.state != TaskState::Inactive {
                drop(sched);
                debug_assert!(false, "task is already attached to a manager");
                return Err(TaskError::AlreadyAttached { name: task.name() });
            }
        }
        if !task.invoke_is_runnable() {
            tracing::warn!(task = %task.name(), "rejecting task that is not runnable");
            return Err(TaskError::NotRunnable { name: task.name() });
        }

        let chain_name = task.chain_name();
        ensure_chain(&mut guard, &chain_name);
        chain::do_add(&self.core, &mut guard, &chain_name, task);
        Ok(())
    }

    /// Removes a task from the scheduler. A servicing task is retired when
    /// its work function returns. Returns whether the removal took effect.
    pub fn remove(&self, task: &Arc<Task>) -> bool {
        if !self.has_task(task) {
            return false;
        }
        let mut guard = self.core.lock.lock();
        chain::do_remove(&self.core, &mut guard, task, true)
    }

    /// Removes every task in the collection; returns how many removals
    /// took effect.
    pub fn remove_collection(&self, tasks: &TaskCollection) -> usize {
        tasks.iter().filter(|task| self.remove(task)).count()
    }

    /// True if the task is currently owned by this manager.
    #[must_use]
    pub fn has_task(&self, task: &Arc<Task>) -> bool {
        task.sched
            .lock()
            .manager
            .upgrade()
            .is_some_and(|core| Arc::ptr_eq(&core, &self.core))
    }

    /// The first task with the given name, if any.
    #[must_use]
    pub fn find_task(&self, name: &str) -> Option<Arc<Task>> {
        let guard = self.core.lock.lock();
        guard
            .tasks_by_name
            .range((name.to_owned(), TaskId::MIN)..=(name.to_owned(), TaskId::MAX))
            .next()
            .map(|(_, task)| Arc::clone(task))
    }

    /// Every task with exactly the given name.
    #[must_use]
    pub fn find_tasks(&self, name: &str) -> TaskCollection {
        let guard = self.core.lock.lock();
        guard
            .tasks_by_name
            .range((name.to_owned(), TaskId::MIN)..=(name.to_owned(), TaskId::MAX))
            .map(|(_, task)| Arc::clone(task))
            .collect()
    }

    /// Every task whose name matches the glob pattern.
    #[must_use]
    pub fn find_tasks_matching(&self, pattern: &GlobPattern) -> TaskCollection {
        let guard = self.core.lock.lock();
        let prefix = pattern.literal_prefix().to_owned();
        guard
            .tasks_by_name
            .range((prefix.clone(), TaskId::MIN)..)
            .take_while(|((name, _), _)| name.starts_with(&prefix))
            .filter(|((name, _), _)| pattern.matches(name))
            .map(|(_, task)| Arc::clone(task))
            .collect()
    }

    /// Snapshot of every task on every chain.
    #[must_use]
    pub fn tasks(&self) -> TaskCollection {
        let guard = self.core.lock.lock();
        let mut result = TaskCollection::new();
        for chain in guard.chains.values() {
            result.add_tasks_from(&chain.active_snapshot());
            result.add_tasks_from(&chain.sleeping_snapshot());
        }
        result
    }

    /// Snapshot of the active (not sleeping) tasks on every chain.
    #[must_use]
    pub fn active_tasks(&self) -> TaskCollection {
        let guard = self.core.lock.lock();
        let mut result = TaskCollection::new();
        for chain in guard.chains.values() {
            result.add_tasks_from(&chain.active_snapshot());
        }
        result
    }

    /// Snapshot of the sleeping tasks on every chain.
    #[must_use]
    pub fn sleeping_tasks(&self) -> TaskCollection {
        let guard = self.core.lock.lock();
        let mut result = TaskCollection::new();
        for chain in guard.chains.values() {
            result.add_tasks_from(&chain.sleeping_snapshot());
        }
        result
    }

    /// Total number of tasks across all chains.
    #[must_use]
    pub fn num_tasks(&self) -> usize {
        self.core.lock.lock().num_tasks
    }

    /// Returns a handle to the named chain, creating it (zero threads,
    /// silently) if needed.
    pub fn make_chain(&self, name: impl Into<String>) -> TaskChain {
        let name = name.into();
        let mut guard = self.core.lock.lock();
        guard
            .chains
            .entry(name.clone())
            .or_insert_with(|| ChainState::new(name.clone(), 0));
        drop(guard);
        TaskChain::new(Arc::clone(&self.core), name)
    }

    /// Returns a handle to the named chain if it exists.
    #[must_use]
    pub fn find_chain(&self, name: &str) -> Option<TaskChain> {
        let guard = self.core.lock.lock();
        guard
            .chains
            .contains_key(name)
            .then(|| TaskChain::new(Arc::clone(&self.core), name.to_owned()))
    }

    /// Handle to the default chain.
    #[must_use]
    pub fn default_chain(&self) -> TaskChain {
        TaskChain::new(Arc::clone(&self.core), Self::DEFAULT_CHAIN.to_owned())
    }

    /// The names of all chains.
    #[must_use]
    pub fn chain_names(&self) -> Vec<String> {
        self.core.lock.lock().chains.keys().cloned().collect()
    }

    /// Stops the named chain's threads, retires its tasks (death hooks with
    /// `clean_exit = false`), and removes it. Returns whether it existed.
    pub fn remove_chain(&self, name: &str) -> bool {
        let mut guard = self.core.lock.lock();
        if !guard.chains.contains_key(name) {
            return false;
        }
        tracing::debug!(chain = name, "removing chain");
        chain::do_stop_threads(&self.core, &mut guard, name);
        cleanup_chain_tasks(&self.core, &mut guard, name);
        guard.chains.remove(name);
        true
    }

    /// Drives every zero-thread chain's synchronous path once.
    pub fn poll(&self) {
        let mut guard = self.core.lock.lock();
        let names: Vec<String> = guard.chains.keys().cloned().collect();
        for name in names {
            chain::do_poll(&self.core, &mut guard, &name);
        }
    }

    /// Blocks until the aggregate task count is zero or any chain leaves
    /// the Started state. Chains without worker threads are polled
    /// cooperatively; otherwise the call waits on the shared condition
    /// variable.
    pub fn wait_for_tasks(&self) {
        let mut guard = self.core.lock.lock();
        loop {
            if guard.num_tasks == 0 {
                return;
            }
            if guard.chains.values().any(|chain| {
                matches!(
                    chain.state,
                    ChainLifecycle::Shutdown | ChainLifecycle::Aborting
                )
            }) {
                return;
            }
            let threaded = guard.chains.values().any(|chain| !chain.threads.is_empty());
            if threaded {
                self.core.cvar.wait(&mut guard);
            } else {
                let names: Vec<String> = guard.chains.keys().cloned().collect();
                for name in names {
                    chain::do_poll(&self.core, &mut guard, &name);
                }
            }
        }
    }

    /// Starts the requested threads on every chain.
    pub fn start_threads(&self) {
        let mut guard = self.core.lock.lock();
        let names: Vec<String> = guard.chains.keys().cloned().collect();
        for name in names {
            chain::do_start_threads(&self.core, &mut guard, &name);
        }
    }

    /// Stops the threads on every chain. Pending tasks stay queued.
    pub fn stop_threads(&self) {
        let mut guard = self.core.lock.lock();
        let names: Vec<String> = guard.chains.keys().cloned().collect();
        for name in names {
            chain::do_stop_threads(&self.core, &mut guard, &name);
        }
    }

    /// The earliest wake time of any sleeping task, on any chain.
    #[must_use]
    pub fn next_wake_time(&self) -> Option<Time> {
        let guard = self.core.lock.lock();
        guard
            .chains
            .values()
            .filter_map(ChainState::next_wake_time)
            .min()
    }

    /// Stops every chain's threads and retires every remaining task, death
    /// hooks running with `clean_exit = false` outside the lock.
    /// Idempotent.
    pub fn cleanup(&self) {
        let mut guard = self.core.lock.lock();
        let names: Vec<String> = guard.chains.keys().cloned().collect();
        for name in &names {
            chain::do_stop_threads(&self.core, &mut guard, name);
        }
        for name in &names {
            cleanup_chain_tasks(&self.core, &mut guard, name);
        }
    }

    /// Writes a human-readable table of every chain and task.
    pub fn write_report(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        let guard = self.core.lock.lock();
        let now = guard.clock.now();
        writeln!(
            out,
            "Task manager \"{}\": {} tasks",
            self.core.name, guard.num_tasks
        )?;
        for chain in guard.chains.values() {
            write!(
                out,
                "  chain \"{}\" ({} threads, {} tasks",
                chain.name,
                chain.num_threads,
                chain.num_tasks
            )?;
            if let Some(budget) = chain.frame_budget {
                write!(out, ", frame budget {budget:?}")?;
            }
            if chain.tick_clock {
                write!(out, ", ticks clock")?;
            }
            writeln!(out, ")")?;
            writeln!(
                out,
                "    {:<32} {:>9} {:>8} {:>8} {:>8} {:>6}",
                "task", "sleep(s)", "dt(ms)", "avg(ms)", "max(ms)", "sort"
            )?;

            let mut active: Vec<Arc<Task>> = chain.active_snapshot().into_iter().collect();
            active.sort_by_key(|task| {
                let sched = task.sched.lock();
                (sched.sort, std::cmp::Reverse(sched.priority))
            });
            for task in &active {
                write_task_line(out, task, None)?;
            }

            let mut sleeping: Vec<Arc<Task>> = chain.sleeping_snapshot().into_iter().collect();
            sleeping.sort_by_key(|task| task.sched.lock().wake_time);
            for task in &sleeping {
                let until_wake = task.sched.lock().wake_time.duration_since(now);
                write_task_line(out, task, Some(until_wake.as_secs_f64()))?;
            }
        }
        Ok(())
    }

    /// The report of [`TaskManager::write_report`] as a string.
    #[must_use]
    pub fn report(&self) -> String {
        let mut out = String::new();
        let _ = self.write_report(&mut out);
        out
    }
}

fn write_task_line(out: &mut dyn fmt::Write, task: &Arc<Task>, sleep: Option<f64>) -> fmt::Result {
    let sched = task.sched.lock();
    let marker = match sched.state {
        TaskState::Servicing => '*',
        TaskState::ServicingRemoved => '-',
        _ => ' ',
    };
    let mut name = sched.name.clone();
    name.truncate(32);
    write!(out, "   {marker}{name:<32} ")?;
    match sleep {
        Some(secs) => write!(out, "{secs:>9.1}")?,
        None => write!(out, "{:>9}", "")?,
    }
    if sched.num_frames > 0 {
        let avg = sched.total_dt.as_secs_f64() * 1000.0 / sched.num_frames as f64;
        writeln!(
            out,
            " {:>8.1} {avg:>8.1} {:>8.1} {:>6}",
            sched.dt.as_secs_f64() * 1000.0,
            sched.max_dt.as_secs_f64() * 1000.0,
            sched.sort
        )
    } else {
        writeln!(out, " {:>8} {:>8} {:>8} {:>6}", "", "", "", sched.sort)
    }
}

/// Detaches every queued task of a chain and runs the death notifications
/// on the drained list with the lock released. A task currently servicing
/// on the calling thread is left for its dispatch to retire.
fn cleanup_chain_tasks(
    core: &Arc<ManagerCore>,
    guard: &mut MutexGuard<'_, SchedState>,
    chain_name: &str,
) {
    let dead: Vec<Arc<Task>> = {
        let state = &mut **guard;
        let Some((chain, mut ctx)) = state.chain_parts(chain_name) else {
            return;
        };
        let mut dead = Vec::with_capacity(chain.num_tasks);
        for entry in std::mem::take(&mut chain.active) {
            dead.push(entry.task);
        }
        dead.append(&mut chain.this_active);
        dead.append(&mut chain.next_active);
        for entry in std::mem::take(&mut chain.sleeping) {
            dead.push(entry.task);
        }

        for task in &dead {
            debug_assert!(chain.num_tasks > 0);
            chain.num_tasks -= 1;
            *ctx.num_tasks = ctx.num_tasks.saturating_sub(1);
            let mut sched = task.sched.lock();
            sched.state = TaskState::Inactive;
            sched.owner_chain = None;
            ctx.tasks_by_name.remove(&(sched.name.clone(), task.id()));
        }
        // At most the currently-servicing task may remain.
        debug_assert!(chain.num_tasks <= 1);
        dead
    };

    if dead.is_empty() {
        return;
    }
    MutexGuard::unlocked(guard, || {
        let manager = TaskManager::from_core(Arc::clone(core));
        for task in &dead {
            core.events.task_died(task, false);
            task.invoke_death(Some(&manager), false);
        }
    });
    for task in &dead {
        task.sched.lock().manager = Weak::new();
    }
}

impl fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskManager")
            .field("name", &self.core.name)
            .field("num_tasks", &self.num_tasks())
            .field("chains", &self.chain_names())
            .finish()
    }
}

impl fmt::Display for TaskManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TaskManager {}; {} tasks",
            self.core.name,
            self.num_tasks()
        )
    }
}

/// Builder for a [`TaskManager`] with injected collaborators.
///
/// Precedence for the default chain settings: builder values, then
/// `TASKLINE_*` environment variables, then defaults.
pub struct TaskManagerBuilder {
    name: String,
    clock: Option<Arc<dyn Clock>>,
    events: Option<Arc<dyn EventSink>>,
    stats: Option<Arc<dyn StatsProvider>>,
    default_threads: Option<usize>,
    default_frame_budget: Option<std::time::Duration>,
}

impl TaskManagerBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            clock: None,
            events: None,
            stats: None,
            default_threads: None,
            default_frame_budget: None,
        }
    }

    /// Injects a clock (default: [`RealClock`]).
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Injects an event sink (default: [`NoOpEvents`]).
    #[must_use]
    pub fn event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// Injects a statistics provider (default: [`NoOpStats`]).
    #[must_use]
    pub fn stats(mut self, stats: Arc<dyn StatsProvider>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Worker thread count for the default chain (default: 0, poll-only).
    #[must_use]
    pub fn default_threads(mut self, threads: usize) -> Self {
        self.default_threads = Some(threads);
        self
    }

    /// Frame budget for the default chain (default: none).
    #[must_use]
    pub fn default_frame_budget(mut self, budget: std::time::Duration) -> Self {
        self.default_frame_budget = Some(budget);
        self
    }

    /// Builds the manager, applying `TASKLINE_*` environment overrides for
    /// settings the builder left unset.
    pub fn build(mut self) -> Result<TaskManager, TaskError> {
        if self.default_threads.is_none() {
            if let Some(value) = read_env(ENV_DEFAULT_THREADS) {
                self.default_threads = Some(parse_env(ENV_DEFAULT_THREADS, &value)?);
            }
        }
        if self.default_frame_budget.is_none() {
            if let Some(value) = read_env(ENV_FRAME_BUDGET_MS) {
                let millis: u64 = parse_env(ENV_FRAME_BUDGET_MS, &value)?;
                self.default_frame_budget = Some(std::time::Duration::from_millis(millis));
            }
        }
        Ok(self.build_without_env())
    }

    /// Builds the manager from the builder values alone.
    #[must_use]
    pub fn build_without_env(self) -> TaskManager {
        let mut default_chain = ChainState::new(
            TaskManager::DEFAULT_CHAIN.to_owned(),
            self.default_threads.unwrap_or(0),
        );
        default_chain.frame_budget = self.default_frame_budget;

        let mut chains = BTreeMap::new();
        chains.insert(TaskManager::DEFAULT_CHAIN.to_owned(), default_chain);

        let core = Arc::new(ManagerCore {
            name: self.name,
            lock: Mutex::new(SchedState {
                clock: self.clock.unwrap_or_else(|| Arc::new(RealClock::new())),
                chains,
                tasks_by_name: BTreeMap::new(),
                num_tasks: 0,
            }),
            cvar: Condvar::new(),
            frame_cvar: Condvar::new(),
            events: self.events.unwrap_or_else(|| Arc::new(NoOpEvents)),
            stats: self.stats.unwrap_or_else(|| Arc::new(NoOpStats)),
        });
        TaskManager { core }
    }
}

fn read_env(var: &'static str) -> Option<String> {
    std::env::var(var).ok().filter(|value| !value.is_empty())
}

fn parse_env<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, TaskError> {
    value.parse().map_err(|_| TaskError::InvalidEnv {
        var,
        value: value.to_owned(),
    })
}
