//! Pluggable time sources for the scheduler.
//!
//! The scheduler distinguishes *frame time* ([`Clock::now`]), which drives
//! wake times and elapsed-time queries, from *real time*
//! ([`Clock::real_time`]), which drives execution measurement and frame
//! budgets. A chain configured to tick the clock advances the frame counter
//! at each epoch boundary.

use crate::types::Time;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// A source of frame time, real time, and frame counts.
pub trait Clock: Send + Sync + 'static {
    /// Returns the current frame time.
    fn now(&self) -> Time;

    /// Returns the current real (wall) time.
    fn real_time(&self) -> Time;

    /// Returns the current frame number.
    fn frame_count(&self) -> u64;

    /// Advances to the next frame.
    fn tick(&self);
}

/// A wall-clock time source.
///
/// Frame time and real time both report elapsed wall time since
/// construction; [`Clock::tick`] only advances the frame counter.
#[derive(Debug)]
pub struct RealClock {
    start: Instant,
    frame: AtomicU64,
}

impl RealClock {
    /// Creates a clock whose epoch is the moment of construction.
    #[must_use]
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            frame: AtomicU64::new(0),
        }
    }
}

impl Default for RealClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for RealClock {
    fn now(&self) -> Time {
        self.real_time()
    }

    fn real_time(&self) -> Time {
        Time::from_nanos(self.start.elapsed().as_nanos() as u64)
    }

    fn frame_count(&self) -> u64 {
        self.frame.load(Ordering::Relaxed)
    }

    fn tick(&self) {
        self.frame.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy)]
struct ManualState {
    time: Time,
    frame: u64,
}

/// A manually-driven time source for tests and lockstep embedders.
///
/// Time only moves when told to: [`ManualClock::set_time`] and
/// [`ManualClock::advance`] move the clock, and [`Clock::tick`] increments
/// the frame counter and advances time by the configured per-frame step.
#[derive(Debug)]
pub struct ManualClock {
    state: Mutex<ManualState>,
    frame_step: Duration,
}

impl ManualClock {
    /// Creates a clock frozen at time zero with no per-frame step.
    #[must_use]
    pub fn new() -> Self {
        Self::with_frame_step(Duration::ZERO)
    }

    /// Creates a clock that advances by `frame_step` at each tick.
    #[must_use]
    pub fn with_frame_step(frame_step: Duration) -> Self {
        Self {
            state: Mutex::new(ManualState {
                time: Time::ZERO,
                frame: 0,
            }),
            frame_step,
        }
    }

    /// Moves the clock to an absolute time.
    pub fn set_time(&self, time: Time) {
        self.state.lock().time = time;
    }

    /// Advances the clock by a duration.
    pub fn advance(&self, by: Duration) {
        let mut state = self.state.lock();
        state.time = state.time + by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Time {
        self.state.lock().time
    }

    fn real_time(&self) -> Time {
        self.state.lock().time
    }

    fn frame_count(&self) -> u64 {
        self.state.lock().frame
    }

    fn tick(&self) {
        let mut state = self.state.lock();
        state.frame += 1;
        state.time = state.time + self.frame_step;
    }
}
