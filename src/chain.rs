//! Task chains: independently-scheduled lanes of tasks.
//!
//! Each chain owns a ready heap, a sleeping heap, and an optional pool of
//! worker threads, and runs the sort-barrier algorithm: within one epoch,
//! every task of a lower sort value finishes before any task of a higher
//! sort value starts, and priority breaks ties within a sort value. The
//! same core routines ([`service_one`], [`finish_sort_group`]) drive both
//! the worker threads and the single-threaded [`TaskChain::poll`] path, so
//! the two cannot drift apart.
//!
//! All queue state lives under the manager's single shared lock; a task's
//! work function is the only code that runs with that lock released.

use crate::clock::Clock;
use crate::manager::{ManagerCore, SchedState, TaskManager};
use crate::task::collection::TaskCollection;
use crate::task::{Task, TaskCx, TaskSched};
use crate::types::{ChainLifecycle, DoneStatus, TaskId, TaskState, Time};
use parking_lot::MutexGuard;
use smallvec::SmallVec;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// `current_sort` value for a chain with no epoch in progress.
pub(crate) const IDLE_SORT: i64 = i64::MAX;

/// Ready-heap entry. Ordering keys are snapshotted at insertion; any
/// mutation of a queued task's keys goes through remove-then-reinsert.
pub(crate) struct ActiveEntry {
    pub(crate) sort: i32,
    pub(crate) priority: i32,
    pub(crate) start_time: Time,
    pub(crate) seq: u64,
    pub(crate) task: Arc<Task>,
}

impl ActiveEntry {
    fn from_sched(sched: &TaskSched, task: Arc<Task>) -> Self {
        Self {
            sort: sched.sort,
            priority: sched.priority,
            start_time: sched.start_time,
            seq: sched.seq,
            task,
        }
    }

    fn snapshot(task: Arc<Task>) -> Self {
        let (sort, priority, start_time, seq) = {
            let sched = task.sched.lock();
            (sched.sort, sched.priority, sched.start_time, sched.seq)
        };
        Self {
            sort,
            priority,
            start_time,
            seq,
            task,
        }
    }
}

impl Ord for ActiveEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // The heap pops its maximum, so the best task must compare
        // greatest: lowest sort, then highest priority, then earliest
        // start time, then earliest insertion.
        other
            .sort
            .cmp(&self.sort)
            .then_with(|| self.priority.cmp(&other.priority))
            .then_with(|| other.start_time.cmp(&self.start_time))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ActiveEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ActiveEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ActiveEntry {}

/// Sleeping-heap entry, ordered by wake time (earliest first).
pub(crate) struct SleepEntry {
    pub(crate) wake_time: Time,
    pub(crate) seq: u64,
    pub(crate) task: Arc<Task>,
}

impl Ord for SleepEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .wake_time
            .cmp(&self.wake_time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for SleepEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for SleepEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SleepEntry {}

/// Per-chain scheduler state. Lives inside the manager's shared lock.
pub(crate) struct ChainState {
    pub(crate) name: String,
    pub(crate) num_threads: usize,
    pub(crate) threads: SmallVec<[JoinHandle<()>; 4]>,
    pub(crate) tick_clock: bool,
    pub(crate) timeslice_priority: bool,
    pub(crate) frame_budget: Option<Duration>,
    pub(crate) frame_sync: bool,
    pub(crate) active: BinaryHeap<ActiveEntry>,
    pub(crate) this_active: Vec<Arc<Task>>,
    pub(crate) next_active: Vec<Arc<Task>>,
    pub(crate) sleeping: BinaryHeap<SleepEntry>,
    pub(crate) servicing: SmallVec<[Arc<Task>; 4]>,
    pub(crate) current_sort: i64,
    pub(crate) num_busy: usize,
    pub(crate) num_tasks: usize,
    pub(crate) state: ChainLifecycle,
    pub(crate) pickup_mode: bool,
    pub(crate) current_frame: u64,
    pub(crate) time_in_frame: Duration,
    pub(crate) block_till_next_frame: bool,
    pub(crate) next_seq: u64,
}

impl ChainState {
    pub(crate) fn new(name: String, num_threads: usize) -> Self {
        Self {
            name,
            num_threads,
            threads: SmallVec::new(),
            tick_clock: false,
            timeslice_priority: false,
            frame_budget: None,
            frame_sync: false,
            active: BinaryHeap::new(),
            this_active: Vec::new(),
            next_active: Vec::new(),
            sleeping: BinaryHeap::new(),
            servicing: SmallVec::new(),
            current_sort: IDLE_SORT,
            num_busy: 0,
            num_tasks: 0,
            state: ChainLifecycle::Initial,
            pickup_mode: false,
            current_frame: 0,
            time_in_frame: Duration::ZERO,
            block_till_next_frame: false,
            next_seq: 0,
        }
    }

    fn front_matches(&self) -> bool {
        self.active
            .peek()
            .is_some_and(|entry| i64::from(entry.sort) == self.current_sort)
    }

    /// Resets per-frame budget accounting when the clock frame changes.
    fn check_frame(&mut self, frame: u64) {
        if self.current_frame != frame {
            self.current_frame = frame;
            self.time_in_frame = Duration::ZERO;
            self.block_till_next_frame = false;
        }
    }

    fn budget_exhausted(&self) -> bool {
        self.block_till_next_frame
            || self
                .frame_budget
                .is_some_and(|budget| self.time_in_frame >= budget)
    }

    pub(crate) fn next_wake_time(&self) -> Option<Time> {
        self.sleeping.peek().map(|entry| entry.wake_time)
    }

    fn erase_active_entry(&mut self, id: TaskId) -> bool {
        let before = self.active.len();
        self.active.retain(|entry| entry.task.id() != id);
        before != self.active.len()
    }

    fn erase_listed(&mut self, id: TaskId) -> bool {
        if let Some(index) = self.this_active.iter().position(|t| t.id() == id) {
            self.this_active.remove(index);
            return true;
        }
        if let Some(index) = self.next_active.iter().position(|t| t.id() == id) {
            self.next_active.remove(index);
            return true;
        }
        false
    }

    fn erase_sleeping(&mut self, id: TaskId) -> bool {
        let before = self.sleeping.len();
        self.sleeping.retain(|entry| entry.task.id() != id);
        before != self.sleeping.len()
    }

    /// In timeslice-priority mode, postpone tasks that have already used
    /// more than their priority's share of the epoch's mean runtime.
    fn filter_timeslice_priority(&mut self) {
        if self.active.is_empty() {
            return;
        }
        let entries: Vec<ActiveEntry> = std::mem::take(&mut self.active).into_vec();

        let mut net_runtime = 0.0_f64;
        let mut net_priority = 0_i64;
        for entry in &entries {
            net_runtime += entry.task.average_dt().as_secs_f64();
            net_priority += i64::from(entry.priority.max(1));
        }
        let average_budget = net_runtime / net_priority as f64;

        let (mut keep, mut postpone): (Vec<_>, Vec<_>) = entries.into_iter().partition(|entry| {
            let runtime = entry.task.average_dt().as_secs_f64();
            let priority = f64::from(entry.priority.max(1));
            runtime / priority <= average_budget
        });

        if keep.is_empty() {
            // The epoch must make progress: run the best postponed task.
            let best = postpone
                .iter()
                .enumerate()
                .max_by_key(|(_, entry)| entry.priority)
                .map(|(index, _)| index);
            if let Some(index) = best {
                keep.push(postpone.swap_remove(index));
            }
        }

        let postponed_to = if self.pickup_mode {
            &mut self.this_active
        } else {
            &mut self.next_active
        };
        postponed_to.extend(postpone.into_iter().map(|entry| entry.task));
        self.active = keep.into_iter().collect();
    }

    pub(crate) fn active_snapshot(&self) -> TaskCollection {
        let mut result = TaskCollection::new();
        for task in &self.servicing {
            result.add_task(Arc::clone(task));
        }
        for entry in &self.active {
            result.add_task(Arc::clone(&entry.task));
        }
        for task in &self.this_active {
            result.add_task(Arc::clone(task));
        }
        for task in &self.next_active {
            result.add_task(Arc::clone(task));
        }
        result
    }

    pub(crate) fn sleeping_snapshot(&self) -> TaskCollection {
        self.sleeping
            .iter()
            .map(|entry| Arc::clone(&entry.task))
            .collect()
    }
}

/// Adds a detached, inactive task to a chain. Lock held; contract checks
/// are the caller's responsibility.
pub(crate) fn do_add(
    core: &Arc<ManagerCore>,
    guard: &mut MutexGuard<'_, SchedState>,
    chain_name: &str,
    task: &Arc<Task>,
) {
    do_start_threads(core, guard, chain_name);

    let state = &mut **guard;
    let Some((chain, mut ctx)) = state.chain_parts(chain_name) else {
        return;
    };

    let now = ctx.clock.now();
    let frame = ctx.clock.frame_count();

    let mut sched = task.sched.lock();
    debug_assert_eq!(sched.state, TaskState::Inactive);
    debug_assert_eq!(sched.manager.strong_count(), 0);
    sched.manager = Arc::downgrade(core);
    sched.owner_chain = Some(chain.name.clone());
    sched.start_time = now;
    sched.start_frame = frame;
    sched.seq = chain.next_seq;
    chain.next_seq += 1;
    ctx.tasks_by_name
        .insert((sched.name.clone(), task.id()), Arc::clone(task));

    if let Some(delay) = sched.delay {
        sched.wake_time = now + delay;
        sched.start_time = sched.wake_time;
        sched.state = TaskState::Sleeping;
        tracing::trace!(
            task = %sched.name,
            chain = %chain.name,
            wake = %sched.wake_time,
            "enqueued sleeping"
        );
        let entry = SleepEntry {
            wake_time: sched.wake_time,
            seq: sched.seq,
            task: Arc::clone(task),
        };
        drop(sched);
        chain.sleeping.push(entry);
    } else {
        sched.state = TaskState::Active;
        tracing::trace!(
            task = %sched.name,
            sort = sched.sort,
            chain = %chain.name,
            current_sort = chain.current_sort,
            "enqueued"
        );
        if i64::from(sched.sort) > chain.current_sort {
            // Ready this epoch.
            let entry = ActiveEntry::from_sched(&sched, Arc::clone(task));
            drop(sched);
            chain.active.push(entry);
        } else {
            // This sort value has already been passed; run next epoch.
            drop(sched);
            chain.next_active.push(Arc::clone(task));
        }
    }

    chain.num_tasks += 1;
    *ctx.num_tasks += 1;
    core.cvar.notify_all();
}

/// Removes a task from its owning chain. A servicing task is only marked;
/// its retirement happens when its work function returns. Returns whether
/// the removal took effect.
pub(crate) fn do_remove(
    core: &Arc<ManagerCore>,
    guard: &mut MutexGuard<'_, SchedState>,
    task: &Arc<Task>,
    upon_death: bool,
) -> bool {
    let (owner, task_state) = {
        let sched = task.sched.lock();
        (sched.owner_chain.clone(), sched.state)
    };
    let Some(owner) = owner else {
        return false;
    };

    match task_state {
        TaskState::Servicing => {
            task.sched.lock().state = TaskState::ServicingRemoved;
            true
        }
        TaskState::ServicingRemoved => false,
        TaskState::Sleeping => {
            {
                let state = &mut **guard;
                if let Some((chain, _ctx)) = state.chain_parts(&owner) {
                    let found = chain.erase_sleeping(task.id());
                    debug_assert!(found);
                }
            }
            cleanup_task(core, guard, &owner, task, upon_death, false);
            true
        }
        TaskState::Active => {
            {
                let state = &mut **guard;
                if let Some((chain, _ctx)) = state.chain_parts(&owner) {
                    let found = chain.erase_active_entry(task.id()) || chain.erase_listed(task.id());
                    debug_assert!(found);
                }
            }
            cleanup_task(core, guard, &owner, task, upon_death, false);
            true
        }
        TaskState::Inactive => false,
    }
}

/// Detaches a task that has already been pulled off every queue: fixes the
/// counters and name index, and (optionally) runs the death notifications
/// with the lock released.
pub(crate) fn cleanup_task(
    core: &Arc<ManagerCore>,
    guard: &mut MutexGuard<'_, SchedState>,
    chain_name: &str,
    task: &Arc<Task>,
    upon_death: bool,
    clean_exit: bool,
) {
    {
        let state = &mut **guard;
        let Some((chain, mut ctx)) = state.chain_parts(chain_name) else {
            return;
        };
        debug_assert!(chain.num_tasks > 0);
        chain.num_tasks -= 1;
        *ctx.num_tasks = ctx.num_tasks.saturating_sub(1);

        let mut sched = task.sched.lock();
        sched.state = TaskState::Inactive;
        sched.owner_chain = None;
        ctx.tasks_by_name.remove(&(sched.name.clone(), task.id()));
        tracing::trace!(task = %sched.name, chain = chain_name, clean_exit, "retiring");
    }

    if upon_death {
        let done_event = task.done_event();
        MutexGuard::unlocked(guard, || {
            let manager = TaskManager::from_core(Arc::clone(core));
            core.events.task_died(task, clean_exit);
            if clean_exit {
                if let Some(event) = done_event {
                    core.events.post_event(&event, task);
                }
            }
            task.invoke_death(Some(&manager), clean_exit);
        });
    }

    task.sched.lock().manager = Weak::new();
}

enum Dispatch {
    Retire { clean: bool },
    Migrate,
    Requeue { pickup: bool },
    Sleep,
    Orphaned,
}

/// Pops the best ready task, runs its work function with the shared lock
/// released, and routes it by the returned status. Callers have already
/// arranged `num_busy` accounting and verified the heap front matches
/// `current_sort`.
pub(crate) fn service_one(
    core: &Arc<ManagerCore>,
    guard: &mut MutexGuard<'_, SchedState>,
    chain_name: &str,
    worker: Option<usize>,
) {
    let clock: Arc<dyn Clock> = Arc::clone(&guard.clock);

    let task = {
        let state = &mut **guard;
        let Some((chain, _ctx)) = state.chain_parts(chain_name) else {
            return;
        };
        let Some(entry) = chain.active.pop() else {
            return;
        };
        debug_assert_eq!(i64::from(entry.sort), chain.current_sort);
        let task = entry.task;
        {
            let mut sched = task.sched.lock();
            debug_assert_eq!(sched.state, TaskState::Active);
            sched.state = TaskState::Servicing;
        }
        chain.servicing.push(Arc::clone(&task));
        task
    };

    let task_name = task.name();
    tracing::trace!(task = %task_name, chain = chain_name, worker, "servicing");

    let manager = TaskManager::from_core(Arc::clone(core));
    let cx = TaskCx::new(&task, Some(manager), Arc::clone(&clock));
    let mut dt = Duration::ZERO;
    let status = MutexGuard::unlocked(guard, || {
        core.stats.task_started(chain_name, &task_name);
        let before = clock.real_time();
        let status = task.invoke_work(&cx);
        dt = clock.real_time().duration_since(before);
        core.stats.task_stopped(chain_name, &task_name, dt);
        status
    });

    // Lock reacquired: record timing, then route.
    let mut abort_chain = false;
    let dispatch = {
        let state = &mut **guard;
        match state.chain_parts(chain_name) {
            None => Dispatch::Orphaned,
            Some((chain, _ctx)) => {
                chain.servicing.retain(|t| t.id() != task.id());
                chain.time_in_frame += dt;

                let mut sched = task.sched.lock();
                sched.dt = dt;
                if dt > sched.max_dt {
                    sched.max_dt = dt;
                }
                sched.total_dt += dt;

                if sched.state == TaskState::ServicingRemoved {
                    // Removed while running; removal wins over the status.
                    Dispatch::Retire { clean: false }
                } else if sched.chain_name != chain.name {
                    Dispatch::Migrate
                } else {
                    match status {
                        DoneStatus::Continue => Dispatch::Requeue { pickup: false },
                        DoneStatus::Await => {
                            tracing::debug!(
                                task = %sched.name,
                                "await is not supported; treating as continue"
                            );
                            Dispatch::Requeue { pickup: false }
                        }
                        DoneStatus::Pickup => Dispatch::Requeue { pickup: true },
                        DoneStatus::Again | DoneStatus::Pause => Dispatch::Sleep,
                        DoneStatus::Interrupt => {
                            abort_chain = true;
                            Dispatch::Requeue { pickup: false }
                        }
                        DoneStatus::Abort => {
                            abort_chain = true;
                            Dispatch::Retire { clean: false }
                        }
                        DoneStatus::Done => Dispatch::Retire { clean: true },
                        DoneStatus::Exit => Dispatch::Retire { clean: false },
                    }
                }
            }
        }
    };

    match dispatch {
        Dispatch::Retire { clean } => {
            cleanup_task(core, guard, chain_name, &task, true, clean);
        }
        Dispatch::Migrate => {
            cleanup_task(core, guard, chain_name, &task, false, false);
            let target = task.sched.lock().chain_name.clone();
            crate::manager::ensure_chain(guard, &target);
            do_add(core, guard, &target, &task);
        }
        Dispatch::Requeue { pickup } => {
            let state = &mut **guard;
            if let Some((chain, _ctx)) = state.chain_parts(chain_name) {
                task.sched.lock().state = TaskState::Active;
                if pickup {
                    chain.this_active.push(Arc::clone(&task));
                } else {
                    chain.next_active.push(Arc::clone(&task));
                }
                core.cvar.notify_all();
            }
        }
        Dispatch::Sleep => {
            let state = &mut **guard;
            if let Some((chain, ctx)) = state.chain_parts(chain_name) {
                let now = ctx.clock.now();
                let mut sched = task.sched.lock();
                sched.wake_time = now + sched.delay.unwrap_or(Duration::ZERO);
                sched.start_time = sched.wake_time;
                sched.state = TaskState::Sleeping;
                tracing::trace!(task = %sched.name, wake = %sched.wake_time, "sleeping");
                let entry = SleepEntry {
                    wake_time: sched.wake_time,
                    seq: sched.seq,
                    task: Arc::clone(&task),
                };
                drop(sched);
                chain.sleeping.push(entry);
                core.cvar.notify_all();
            }
        }
        Dispatch::Orphaned => {
            tracing::error!(
                task = %task_name,
                chain = chain_name,
                "chain disappeared while task was servicing"
            );
            let mut sched = task.sched.lock();
            sched.state = TaskState::Inactive;
            sched.owner_chain = None;
            sched.manager = Weak::new();
        }
    }

    if abort_chain {
        let state = &mut **guard;
        if let Some((chain, _ctx)) = state.chain_parts(chain_name) {
            if chain.state == ChainLifecycle::Started {
                tracing::debug!(chain = chain_name, "chain aborting");
                chain.state = ChainLifecycle::Aborting;
                core.cvar.notify_all();
                core.frame_cvar.notify_all();
            }
        }
    }
}

/// Advances past a completed sort group. Must only run at the
/// `num_busy == 0` rendezvous. Either advances `current_sort` to the next
/// ready group, or rolls the epoch: swap in the staged tasks, optionally
/// tick the clock, wake due sleepers, and rebuild the heap. Returns whether
/// the chain has work to do.
pub(crate) fn finish_sort_group(
    core: &Arc<ManagerCore>,
    guard: &mut MutexGuard<'_, SchedState>,
    chain_name: &str,
) -> bool {
    let state = &mut **guard;
    let Some((chain, ctx)) = state.chain_parts(chain_name) else {
        return false;
    };
    debug_assert_eq!(chain.num_busy, 0);

    if let Some(front) = chain.active.peek() {
        // More groups remain this epoch (or a later-sorted task arrived
        // mid-epoch); advance the barrier.
        debug_assert!(i64::from(front.sort) > chain.current_sort);
        chain.current_sort = i64::from(front.sort);
        core.cvar.notify_all();
        return true;
    }

    // Epoch rollover.
    let incoming: Vec<Arc<Task>>;
    if !chain.this_active.is_empty() && chain.frame_budget.is_some() {
        // Rerun the tasks that think they can still fit in this frame.
        tracing::trace!(chain = %chain.name, "next epoch (pickup mode)");
        chain.pickup_mode = true;
        incoming = std::mem::take(&mut chain.this_active);
    } else {
        tracing::trace!(chain = %chain.name, "next epoch");
        chain.pickup_mode = false;

        let mut staged = std::mem::take(&mut chain.next_active);
        staged.append(&mut chain.this_active);

        if chain.tick_clock {
            ctx.clock.tick();
            core.frame_cvar.notify_all();
        } else if chain.frame_sync {
            // Wait for someone else to tick the clock before the next epoch.
            chain.block_till_next_frame = true;
        }

        let now = ctx.clock.now();
        let frame = ctx.clock.frame_count();
        while chain
            .sleeping
            .peek()
            .is_some_and(|entry| entry.wake_time <= now)
        {
            let entry = chain.sleeping.pop().expect("peeked entry");
            {
                let mut sched = entry.task.sched.lock();
                tracing::trace!(task = %sched.name, wake = %sched.wake_time, "waking");
                sched.state = TaskState::Active;
                sched.start_frame = frame;
            }
            staged.push(entry.task);
        }

        // Every task on the queue at epoch start has run (or is about to
        // run) one frame.
        for task in &staged {
            task.sched.lock().num_frames += 1;
        }

        incoming = staged;
    }

    chain.active = incoming.into_iter().map(ActiveEntry::snapshot).collect();

    if chain.timeslice_priority {
        chain.filter_timeslice_priority();
    }

    debug_assert_eq!(
        chain.num_tasks,
        chain.active.len()
            + chain.this_active.len()
            + chain.next_active.len()
            + chain.sleeping.len()
    );

    chain.current_sort = chain
        .active
        .peek()
        .map_or(IDLE_SORT, |entry| i64::from(entry.sort));

    if !chain.active.is_empty() {
        core.cvar.notify_all();
        return true;
    }

    chain.pickup_mode = false;
    debug_assert!(chain.this_active.is_empty());
    false
}

/// Leaves pickup mode, restoring the staged lists as they would have been
/// without it, and finishes the epoch properly.
pub(crate) fn cleanup_pickup_mode(
    core: &Arc<ManagerCore>,
    guard: &mut MutexGuard<'_, SchedState>,
    chain_name: &str,
) {
    let at_rendezvous = {
        let state = &mut **guard;
        let Some((chain, _ctx)) = state.chain_parts(chain_name) else {
            return;
        };
        if !chain.pickup_mode {
            return;
        }
        chain.pickup_mode = false;
        let mut staged = std::mem::take(&mut chain.this_active);
        chain.next_active.append(&mut staged);
        let drained = std::mem::take(&mut chain.active).into_vec();
        chain
            .next_active
            .extend(drained.into_iter().map(|entry| entry.task));
        chain.num_busy == 0
    };
    // A sibling may still be servicing a pickup task; the last one out
    // finishes the epoch instead.
    if at_rendezvous {
        finish_sort_group(core, guard, chain_name);
    }
}

/// Lazily starts the chain's requested worker threads.
pub(crate) fn do_start_threads(
    core: &Arc<ManagerCore>,
    guard: &mut MutexGuard<'_, SchedState>,
    chain_name: &str,
) {
    let aborting = {
        let state = &mut **guard;
        state
            .chain_parts(chain_name)
            .is_some_and(|(chain, _)| chain.state == ChainLifecycle::Aborting)
    };
    if aborting {
        // Collect the aborted threads before restarting.
        do_stop_threads(core, guard, chain_name);
    }

    let state = &mut **guard;
    let Some((chain, _ctx)) = state.chain_parts(chain_name) else {
        return;
    };
    if chain.state != ChainLifecycle::Initial {
        return;
    }
    chain.state = ChainLifecycle::Started;
    if chain.num_threads == 0 {
        return;
    }

    tracing::debug!(
        chain = %chain.name,
        threads = chain.num_threads,
        "starting worker threads"
    );
    for index in 0..chain.num_threads {
        let thread_name = format!("{}_{}_{}", core.name, chain.name, index);
        let core_ref = Arc::clone(core);
        let chain_owned = chain.name.clone();
        let spawned = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || worker_main(&core_ref, &chain_owned, index));
        match spawned {
            Ok(handle) => chain.threads.push(handle),
            Err(error) => {
                tracing::error!(chain = %chain.name, %error, "failed to spawn worker thread");
            }
        }
    }
}

/// Stops the chain's worker threads, releasing the lock to join them, and
/// resets the chain to Initial.
pub(crate) fn do_stop_threads(
    core: &Arc<ManagerCore>,
    guard: &mut MutexGuard<'_, SchedState>,
    chain_name: &str,
) {
    let handles = {
        let state = &mut **guard;
        let Some((chain, _ctx)) = state.chain_parts(chain_name) else {
            return;
        };
        if !matches!(
            chain.state,
            ChainLifecycle::Started | ChainLifecycle::Aborting
        ) {
            return;
        }
        if !chain.threads.is_empty() {
            tracing::debug!(
                chain = %chain.name,
                count = chain.threads.len(),
                "stopping worker threads"
            );
        }
        chain.state = ChainLifecycle::Shutdown;
        std::mem::take(&mut chain.threads)
    };

    core.cvar.notify_all();
    core.frame_cvar.notify_all();

    // The workers need the lock to observe the shutdown.
    MutexGuard::unlocked(guard, || {
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!(chain = chain_name, "worker thread panicked");
            }
        }
    });

    {
        let state = &mut **guard;
        if let Some((chain, _ctx)) = state.chain_parts(chain_name) {
            chain.state = ChainLifecycle::Initial;
            // The calling thread may still be "busy" if it is a task.
            debug_assert!(chain.num_busy <= 1);
        }
    }
    cleanup_pickup_mode(core, guard, chain_name);
}

fn worker_main(core: &Arc<ManagerCore>, chain_name: &str, worker: usize) {
    tracing::debug!(chain = chain_name, worker, "worker thread running");
    let mut guard = core.lock.lock();
    loop {
        enum Step {
            Exit,
            Service,
            FrameWait,
            Finish,
            SortWait,
        }

        let step = {
            let state = &mut *guard;
            let SchedState { clock, chains, .. } = state;
            match chains.get_mut(chain_name) {
                None => Step::Exit,
                Some(chain) if chain.state != ChainLifecycle::Started => Step::Exit,
                Some(chain) => {
                    if chain.front_matches() {
                        chain.check_frame(clock.frame_count());
                        if chain.budget_exhausted() {
                            Step::FrameWait
                        } else {
                            chain.num_busy += 1;
                            Step::Service
                        }
                    } else if chain.num_busy == 0 {
                        Step::Finish
                    } else {
                        Step::SortWait
                    }
                }
            }
        };

        match step {
            Step::Exit => break,
            Step::Service => {
                service_one(core, &mut guard, chain_name, Some(worker));
                if let Some(chain) = guard.chains.get_mut(chain_name) {
                    chain.num_busy -= 1;
                }
                core.cvar.notify_all();
            }
            Step::FrameWait => {
                // Budget exhausted: sleep until the clock frame changes.
                cleanup_pickup_mode(core, &mut guard, chain_name);
                core.stats.wait_started(chain_name);
                let waited = Instant::now();
                core.frame_cvar.wait(&mut guard);
                core.stats.wait_stopped(chain_name, waited.elapsed());
            }
            Step::Finish => {
                // Last worker through the sort group.
                if !finish_sort_group(core, &mut guard, chain_name) {
                    let timeout = {
                        let state = &*guard;
                        state.chains.get(chain_name).and_then(|chain| {
                            chain
                                .next_wake_time()
                                .map(|wake| wake.duration_since(state.clock.now()))
                        })
                    };
                    core.stats.wait_started(chain_name);
                    let waited = Instant::now();
                    match timeout {
                        Some(bound) => {
                            let _ = core.cvar.wait_for(&mut guard, bound);
                        }
                        None => core.cvar.wait(&mut guard),
                    }
                    core.stats.wait_stopped(chain_name, waited.elapsed());
                }
            }
            Step::SortWait => {
                // Siblings are still working on this sort value.
                core.stats.wait_started(chain_name);
                let waited = Instant::now();
                core.cvar.wait(&mut guard);
                core.stats.wait_stopped(chain_name, waited.elapsed());
            }
        }
    }
    drop(guard);
    tracing::debug!(chain = chain_name, worker, "worker thread exiting");
}

/// Runs the chain synchronously for one epoch (plus the leading rollover
/// when the chain was idle). Does nothing when worker threads exist.
pub(crate) fn do_poll(
    core: &Arc<ManagerCore>,
    guard: &mut MutexGuard<'_, SchedState>,
    chain_name: &str,
) {
    {
        let state = &mut **guard;
        let Some((chain, _ctx)) = state.chain_parts(chain_name) else {
            return;
        };
        if chain.num_tasks == 0 {
            return;
        }
    }

    do_start_threads(core, guard, chain_name);

    {
        let state = &mut **guard;
        let Some((chain, _ctx)) = state.chain_parts(chain_name) else {
            return;
        };
        if !chain.threads.is_empty() {
            return;
        }
        if chain.num_busy != 0 {
            tracing::warn!(
                chain = %chain.name,
                "ignoring recursive poll() from within a task"
            );
            return;
        }
        debug_assert!(!chain.pickup_mode);
    }

    // An idle chain stages submissions for the next epoch; begin it now.
    {
        let idle = {
            let state = &mut **guard;
            state
                .chain_parts(chain_name)
                .is_some_and(|(chain, _)| chain.active.is_empty())
        };
        if idle && !finish_sort_group(core, guard, chain_name) {
            return;
        }
    }

    loop {
        // Drain the epoch's ready heap, group by group.
        loop {
            enum Step {
                Service,
                Budget,
                EpochDone,
                Stop,
            }
            let step = {
                let state = &mut **guard;
                let SchedState { clock, chains, .. } = state;
                match chains.get_mut(chain_name) {
                    None => Step::Stop,
                    Some(chain) => {
                        if matches!(
                            chain.state,
                            ChainLifecycle::Shutdown | ChainLifecycle::Aborting
                        ) {
                            Step::Stop
                        } else {
                            match chain.active.peek() {
                                None => Step::EpochDone,
                                Some(front) => {
                                    let sort = i64::from(front.sort);
                                    chain.check_frame(clock.frame_count());
                                    if chain.budget_exhausted() {
                                        Step::Budget
                                    } else {
                                        chain.current_sort = sort;
                                        chain.num_busy += 1;
                                        Step::Service
                                    }
                                }
                            }
                        }
                    }
                }
            };

            match step {
                Step::Stop => return,
                Step::Budget => {
                    // Out of frame budget; resume from here at the next poll.
                    cleanup_pickup_mode(core, guard, chain_name);
                    return;
                }
                Step::EpochDone => break,
                Step::Service => {
                    service_one(core, guard, chain_name, None);
                    {
                        let state = &mut **guard;
                        if let Some((chain, _ctx)) = state.chain_parts(chain_name) {
                            chain.num_busy -= 1;
                        }
                    }
                    core.cvar.notify_all();
                    let threads_started = {
                        let state = &mut **guard;
                        state
                            .chain_parts(chain_name)
                            .is_some_and(|(chain, _)| !chain.threads.is_empty())
                    };
                    if threads_started {
                        return;
                    }
                }
            }
        }

        finish_sort_group(core, guard, chain_name);

        let pickup = {
            let state = &mut **guard;
            state
                .chain_parts(chain_name)
                .is_some_and(|(chain, _)| chain.pickup_mode)
        };
        if !pickup {
            return;
        }
    }
}

/// Blocks until this chain's task list is empty, or the chain leaves the
/// Started state.
pub(crate) fn do_wait_for_tasks(
    core: &Arc<ManagerCore>,
    guard: &mut MutexGuard<'_, SchedState>,
    chain_name: &str,
) {
    do_start_threads(core, guard, chain_name);

    loop {
        let (remaining, lifecycle, threaded) = {
            let state = &mut **guard;
            match state.chain_parts(chain_name) {
                None => return,
                Some((chain, _ctx)) => (chain.num_tasks, chain.state, !chain.threads.is_empty()),
            }
        };
        if remaining == 0
            || matches!(
                lifecycle,
                ChainLifecycle::Shutdown | ChainLifecycle::Aborting
            )
        {
            return;
        }
        if threaded {
            core.stats.wait_started(chain_name);
            let waited = Instant::now();
            core.cvar.wait(guard);
            core.stats.wait_stopped(chain_name, waited.elapsed());
        } else {
            do_poll(core, guard, chain_name);
        }
    }
}

/// Applies a key mutation to a queued task, removing and reinserting its
/// ready-heap entry when the ordering decision is still pending.
pub(crate) fn mutate_queued(
    guard: &mut MutexGuard<'_, SchedState>,
    task: &Arc<Task>,
    mutate: impl FnOnce(&mut TaskSched),
) {
    let state = &mut **guard;
    let owner = task.sched.lock().owner_chain.clone();
    let Some(owner) = owner else {
        mutate(&mut task.sched.lock());
        return;
    };
    let Some((chain, _ctx)) = state.chain_parts(&owner) else {
        mutate(&mut task.sched.lock());
        return;
    };

    let queued_for_ordering =
        task.sched.lock().state == TaskState::Active && chain.erase_active_entry(task.id());
    if queued_for_ordering {
        mutate(&mut task.sched.lock());
        let sched = task.sched.lock();
        if i64::from(sched.sort) > chain.current_sort {
            let entry = ActiveEntry::from_sched(&sched, Arc::clone(task));
            drop(sched);
            chain.active.push(entry);
        } else {
            drop(sched);
            chain.next_active.push(Arc::clone(task));
        }
    } else {
        mutate(&mut task.sched.lock());
    }
}

/// Renames a task, keeping the manager's name index consistent.
pub(crate) fn rename_task(guard: &mut MutexGuard<'_, SchedState>, task: &Arc<Task>, name: String) {
    let state = &mut **guard;
    let mut sched = task.sched.lock();
    let old_key = (sched.name.clone(), task.id());
    if let Some(entry) = state.tasks_by_name.remove(&old_key) {
        state.tasks_by_name.insert((name.clone(), task.id()), entry);
    }
    sched.name = name;
}

/// Moves an attached task to a different chain. A servicing task only
/// records the new target; the owning worker migrates it after `work()`
/// returns.
pub(crate) fn migrate_task(
    core: &Arc<ManagerCore>,
    guard: &mut MutexGuard<'_, SchedState>,
    task: &Arc<Task>,
    chain: String,
) {
    let (owner, task_state) = {
        let sched = task.sched.lock();
        (sched.owner_chain.clone(), sched.state)
    };

    let queued = matches!(task_state, TaskState::Active | TaskState::Sleeping);
    let Some(owner) = owner else {
        task.sched.lock().chain_name = chain;
        return;
    };
    if !queued || owner == chain {
        task.sched.lock().chain_name = chain;
        return;
    }

    {
        let state = &mut **guard;
        if let Some((chain_state, _ctx)) = state.chain_parts(&owner) {
            let id = task.id();
            let erased = chain_state.erase_active_entry(id)
                || chain_state.erase_listed(id)
                || chain_state.erase_sleeping(id);
            debug_assert!(erased);
        }
    }
    cleanup_task(core, guard, &owner, task, false, false);
    task.sched.lock().chain_name = chain.clone();
    crate::manager::ensure_chain(guard, &chain);
    do_add(core, guard, &chain, task);
}

/// Re-derives a sleeping task's wake time from its current delay and
/// restores heap order.
pub(crate) fn resleep_task(guard: &mut MutexGuard<'_, SchedState>, task: &Arc<Task>) {
    let state = &mut **guard;
    let owner = task.sched.lock().owner_chain.clone();
    let Some(owner) = owner else {
        return;
    };
    let Some((chain, ctx)) = state.chain_parts(&owner) else {
        return;
    };
    if task.sched.lock().state != TaskState::Sleeping {
        return;
    }

    let erased = chain.erase_sleeping(task.id());
    debug_assert!(erased);
    let now = ctx.clock.now();
    let mut sched = task.sched.lock();
    sched.wake_time = now + sched.delay.unwrap_or(Duration::ZERO);
    sched.start_time = sched.wake_time;
    let entry = SleepEntry {
        wake_time: sched.wake_time,
        seq: sched.seq,
        task: Arc::clone(task),
    };
    drop(sched);
    chain.sleeping.push(entry);
}

/// A handle to one named chain of a [`TaskManager`].
///
/// Handles are cheap to clone and remain valid after the chain is removed
/// (operations on a removed chain become no-ops).
#[derive(Clone)]
pub struct TaskChain {
    core: Arc<ManagerCore>,
    name: String,
}

impl TaskChain {
    pub(crate) fn new(core: Arc<ManagerCore>, name: String) -> Self {
        Self { core, name }
    }

    /// The chain's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn read<R>(&self, default: R, f: impl FnOnce(&ChainState) -> R) -> R {
        let guard = self.core.lock.lock();
        guard.chains.get(&self.name).map_or(default, f)
    }

    fn write(&self, f: impl FnOnce(&mut ChainState)) {
        let mut guard = self.core.lock.lock();
        if let Some(chain) = guard.chains.get_mut(&self.name) {
            f(chain);
        }
    }

    /// Changes the number of worker threads. Running threads are stopped
    /// first and restarted if tasks remain.
    pub fn set_num_threads(&self, num_threads: usize) {
        let mut guard = self.core.lock.lock();
        let changed = guard
            .chains
            .get(&self.name)
            .is_some_and(|chain| chain.num_threads != num_threads);
        if !changed {
            return;
        }
        tracing::debug!(chain = %self.name, num_threads, "set_num_threads");
        do_stop_threads(&self.core, &mut guard, &self.name);
        let restart = {
            let Some(chain) = guard.chains.get_mut(&self.name) else {
                return;
            };
            chain.num_threads = num_threads;
            chain.num_tasks != 0
        };
        if restart {
            do_start_threads(&self.core, &mut guard, &self.name);
        }
    }

    /// The requested thread count.
    #[must_use]
    pub fn num_threads(&self) -> usize {
        self.read(0, |chain| chain.num_threads)
    }

    /// The number of threads actually running.
    #[must_use]
    pub fn num_running_threads(&self) -> usize {
        self.read(0, |chain| chain.threads.len())
    }

    /// Sets whether the chain ticks the manager clock at each epoch.
    pub fn set_tick_clock(&self, tick_clock: bool) {
        self.write(|chain| chain.tick_clock = tick_clock);
    }

    /// Whether the chain ticks the clock at each epoch.
    #[must_use]
    pub fn tick_clock(&self) -> bool {
        self.read(false, |chain| chain.tick_clock)
    }

    /// Caps task execution time per clock frame; `None` means no limit.
    pub fn set_frame_budget(&self, budget: Option<Duration>) {
        self.write(|chain| chain.frame_budget = budget);
    }

    /// The per-frame execution budget.
    #[must_use]
    pub fn frame_budget(&self) -> Option<Duration> {
        self.read(None, |chain| chain.frame_budget)
    }

    /// Sets whether the chain runs at most one epoch per clock frame,
    /// waiting for someone else to tick the clock.
    pub fn set_frame_sync(&self, frame_sync: bool) {
        self.write(|chain| chain.frame_sync = frame_sync);
    }

    /// The frame-sync flag.
    #[must_use]
    pub fn frame_sync(&self) -> bool {
        self.read(false, |chain| chain.frame_sync)
    }

    /// Sets whether priority is reinterpreted as a runtime share per epoch.
    pub fn set_timeslice_priority(&self, timeslice_priority: bool) {
        self.write(|chain| chain.timeslice_priority = timeslice_priority);
    }

    /// The timeslice-priority flag.
    #[must_use]
    pub fn timeslice_priority(&self) -> bool {
        self.read(false, |chain| chain.timeslice_priority)
    }

    /// Starts any requested worker threads. Normally unnecessary: adding a
    /// task starts them automatically.
    pub fn start_threads(&self) {
        let mut guard = self.core.lock.lock();
        do_start_threads(&self.core, &mut guard, &self.name);
    }

    /// Stops the chain's worker threads. Pending tasks stay queued and are
    /// serviced again after `poll()` or `start_threads()`.
    pub fn stop_threads(&self) {
        let mut guard = self.core.lock.lock();
        do_stop_threads(&self.core, &mut guard, &self.name);
    }

    /// The chain's lifecycle state.
    #[must_use]
    pub fn state(&self) -> ChainLifecycle {
        self.read(ChainLifecycle::Initial, |chain| chain.state)
    }

    /// The number of tasks queued or sleeping on this chain.
    #[must_use]
    pub fn num_tasks(&self) -> usize {
        self.read(0, |chain| chain.num_tasks)
    }

    /// True if the task currently belongs to this chain.
    #[must_use]
    pub fn has_task(&self, task: &Arc<Task>) -> bool {
        let _guard = self.core.lock.lock();
        let sched = task.sched.lock();
        sched.owner_chain.as_deref() == Some(self.name.as_str())
            && sched.state != TaskState::ServicingRemoved
            && sched
                .manager
                .upgrade()
                .is_some_and(|core| Arc::ptr_eq(&core, &self.core))
    }

    /// Snapshot of every task on the chain.
    #[must_use]
    pub fn tasks(&self) -> TaskCollection {
        self.read(TaskCollection::new(), |chain| {
            let mut result = chain.active_snapshot();
            result.add_tasks_from(&chain.sleeping_snapshot());
            result
        })
    }

    /// Snapshot of the active (not sleeping) tasks.
    #[must_use]
    pub fn active_tasks(&self) -> TaskCollection {
        self.read(TaskCollection::new(), ChainState::active_snapshot)
    }

    /// Snapshot of the sleeping tasks.
    #[must_use]
    pub fn sleeping_tasks(&self) -> TaskCollection {
        self.read(TaskCollection::new(), ChainState::sleeping_snapshot)
    }

    /// Services the chain synchronously when it has no worker threads.
    /// Safe to call in either mode; does nothing in threaded mode.
    pub fn poll(&self) {
        let mut guard = self.core.lock.lock();
        do_poll(&self.core, &mut guard, &self.name);
    }

    /// Blocks until the chain's task list is empty or the chain stops.
    pub fn wait_for_tasks(&self) {
        let mut guard = self.core.lock.lock();
        do_wait_for_tasks(&self.core, &mut guard, &self.name);
    }

    /// The wake time of the chain's next sleeping task.
    #[must_use]
    pub fn next_wake_time(&self) -> Option<Time> {
        self.read(None, ChainState::next_wake_time)
    }
}

impl std::fmt::Debug for TaskChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskChain")
            .field("name", &self.name)
            .field("num_tasks", &self.num_tasks())
            .field("num_threads", &self.num_threads())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn entry(sort: i32, priority: i32, start_nanos: u64, seq: u64) -> ActiveEntry {
        ActiveEntry {
            sort,
            priority,
            start_time: Time::from_nanos(start_nanos),
            seq,
            task: Task::from_fn("probe", |_| DoneStatus::Done),
        }
    }

    fn drain(heap: BinaryHeap<ActiveEntry>) -> Vec<(i32, i32, u64)> {
        let mut heap = heap;
        let mut order = Vec::new();
        while let Some(entry) = heap.pop() {
            order.push((entry.sort, entry.priority, entry.seq));
        }
        order
    }

    #[test]
    fn lower_sort_pops_first() {
        let mut heap = BinaryHeap::new();
        heap.push(entry(5, 100, 0, 0));
        heap.push(entry(0, 1, 0, 1));
        heap.push(entry(3, 50, 0, 2));
        let order = drain(heap);
        assert_eq!(
            order.iter().map(|e| e.0).collect::<Vec<_>>(),
            vec![0, 3, 5]
        );
    }

    #[test]
    fn higher_priority_pops_first_within_sort() {
        let mut heap = BinaryHeap::new();
        heap.push(entry(0, 5, 0, 0));
        heap.push(entry(0, 1, 0, 1));
        heap.push(entry(0, 9, 0, 2));
        let order = drain(heap);
        assert_eq!(order.iter().map(|e| e.1).collect::<Vec<_>>(), vec![9, 5, 1]);
    }

    #[test]
    fn full_ties_resolve_fifo() {
        let mut heap = BinaryHeap::new();
        heap.push(entry(0, 0, 7, 2));
        heap.push(entry(0, 0, 7, 0));
        heap.push(entry(0, 0, 7, 1));
        let order = drain(heap);
        assert_eq!(order.iter().map(|e| e.2).collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn earlier_start_time_breaks_priority_ties() {
        let mut heap = BinaryHeap::new();
        heap.push(entry(0, 3, 200, 0));
        heap.push(entry(0, 3, 100, 1));
        let order = drain(heap);
        assert_eq!(order.iter().map(|e| e.2).collect::<Vec<_>>(), vec![1, 0]);
    }

    #[test]
    fn sleep_entries_pop_earliest_wake_first() {
        let mut heap = BinaryHeap::new();
        for (nanos, seq) in [(300_u64, 0_u64), (100, 1), (200, 2)] {
            heap.push(SleepEntry {
                wake_time: Time::from_nanos(nanos),
                seq,
                task: Task::from_fn("sleeper", |_| DoneStatus::Done),
            });
        }
        let mut wakes = Vec::new();
        while let Some(entry) = heap.pop() {
            wakes.push(entry.wake_time.as_nanos());
        }
        assert_eq!(wakes, vec![100, 200, 300]);
    }

    proptest! {
        /// The pop order respects the documented tie-break chain: sort
        /// ascending, then priority descending, then start time ascending,
        /// then insertion sequence ascending.
        #[test]
        fn heap_order_matches_comparator(keys in prop::collection::vec(
            (-10_i32..10, -10_i32..10, 0_u64..5), 1..40,
        )) {
            let mut heap = BinaryHeap::new();
            for (seq, &(sort, priority, start)) in keys.iter().enumerate() {
                heap.push(entry(sort, priority, start, seq as u64));
            }

            let mut expected: Vec<(i32, i32, u64, u64)> = keys
                .iter()
                .enumerate()
                .map(|(seq, &(sort, priority, start))| (sort, priority, start, seq as u64))
                .collect();
            expected.sort_by(|a, b| {
                a.0.cmp(&b.0)
                    .then(b.1.cmp(&a.1))
                    .then(a.2.cmp(&b.2))
                    .then(a.3.cmp(&b.3))
            });

            let mut popped = Vec::new();
            let mut heap = heap;
            while let Some(e) = heap.pop() {
                popped.push((e.sort, e.priority, e.start_time.as_nanos(), e.seq));
            }
            prop_assert_eq!(popped, expected);
        }
    }
}
