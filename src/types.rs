//! Core identifier, time, and status types for the scheduler.

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// A unique identifier for a task.
///
/// Ids are assigned from a process-wide monotonic counter and are never
/// reused within a process.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) const MIN: Self = Self(0);
    pub(crate) const MAX: Self = Self(u64::MAX);

    /// Allocates the next task id.
    pub(crate) fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw id value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskId({})", self.0)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An instant on the scheduler clock, in nanoseconds since the clock epoch.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Time(u64);

impl Time {
    /// The zero instant (clock epoch).
    pub const ZERO: Self = Self(0);

    /// The maximum representable instant.
    pub const MAX: Self = Self(u64::MAX);

    /// Creates a time from nanoseconds since epoch.
    #[must_use]
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Creates a time from milliseconds since epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis.saturating_mul(1_000_000))
    }

    /// Creates a time from whole seconds since epoch.
    #[must_use]
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs.saturating_mul(1_000_000_000))
    }

    /// Creates a time from fractional seconds since epoch.
    ///
    /// Negative inputs clamp to [`Time::ZERO`].
    #[must_use]
    pub fn from_secs_f64(secs: f64) -> Self {
        Self((secs.max(0.0) * 1_000_000_000.0) as u64)
    }

    /// Returns the time as nanoseconds since epoch.
    #[must_use]
    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Returns the time as milliseconds since epoch (truncated).
    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0 / 1_000_000
    }

    /// Returns the time as fractional seconds since epoch.
    #[must_use]
    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / 1_000_000_000.0
    }

    /// Returns the duration between two times.
    ///
    /// Returns [`Duration::ZERO`] if `self` is before `earlier`.
    #[must_use]
    pub const fn duration_since(self, earlier: Self) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl std::ops::Add<Duration> for Time {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self::Output {
        Self(self.0.saturating_add(rhs.as_nanos() as u64))
    }
}

impl fmt::Debug for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Time({}ns)", self.0)
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1_000_000_000 {
            write!(
                f,
                "{}.{:03}s",
                self.0 / 1_000_000_000,
                (self.0 / 1_000_000) % 1000
            )
        } else if self.0 >= 1_000_000 {
            write!(f, "{}ms", self.0 / 1_000_000)
        } else {
            write!(f, "{}ns", self.0)
        }
    }
}

/// The outcome of one invocation of a task's work function.
///
/// The status drives where the task goes next: back onto a queue, onto the
/// sleeping heap, or out of the scheduler entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DoneStatus {
    /// The task completed cleanly and is retired. Its death hook runs with
    /// `clean_exit = true` and its done-event (if any) is posted.
    Done,
    /// The task is still alive; run it again next epoch.
    Continue,
    /// The task wants to sleep for its current delay and run again.
    Again,
    /// The task wants to run again within the same epoch if the chain's
    /// frame budget allows. Without a frame budget this behaves like
    /// [`DoneStatus::Continue`].
    Pickup,
    /// The task is finished but did not complete its purpose; it is retired
    /// without a clean exit.
    Exit,
    /// Like [`DoneStatus::Again`]: sleep on the current delay. Inside a
    /// [`TaskSequence`](crate::TaskSequence) the sequence advances to the
    /// next sub-task before sleeping.
    Pause,
    /// Requeue like [`DoneStatus::Continue`], but flag the chain as
    /// aborting so its threads wind down.
    Interrupt,
    /// Retire the task without a clean exit and flag the chain as aborting.
    Abort,
    /// Reserved for awaiting another task; treated as
    /// [`DoneStatus::Continue`] by this scheduler.
    Await,
}

/// The lifecycle state of a task with respect to its chain's queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Not attached to any chain.
    Inactive,
    /// On the active heap or staged for a coming epoch.
    Active,
    /// On the sleeping heap, waiting for its wake time.
    Sleeping,
    /// Its work function is currently executing with the shared lock
    /// released.
    Servicing,
    /// Removed while servicing; retirement is deferred until the work
    /// function returns.
    ServicingRemoved,
}

impl TaskState {
    /// True for the two servicing states.
    #[must_use]
    pub const fn is_servicing(self) -> bool {
        matches!(self, Self::Servicing | Self::ServicingRemoved)
    }
}

/// The lifecycle state of a task chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChainLifecycle {
    /// No threads running; the chain services tasks via `poll()` only.
    Initial,
    /// Threads are running (or the chain is live in poll mode).
    Started,
    /// A task aborted or interrupted the chain; threads are winding down.
    Aborting,
    /// The chain is stopping its threads.
    Shutdown,
}
