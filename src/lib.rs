//! Taskline: a concurrent, multi-lane cooperative task scheduler.
//!
//! # Overview
//!
//! Taskline schedules units of deferred work ("tasks") on named lanes
//! ("chains"), each independently serviced by zero or more worker threads.
//! Two ordering rules govern every chain:
//!
//! - **Sort barrier**: within one epoch, every ready task of a lower sort
//!   value finishes before any task of a higher sort value starts.
//! - **Priority**: within one sort value, higher-priority tasks are
//!   dequeued first; full ties resolve in submission order.
//!
//! Tasks may also sleep: a delayed task wakes at its scheduled time, at the
//! next epoch boundary. A task's work function reports what happens next by
//! returning a [`DoneStatus`] (retire, requeue, sleep again, abort the
//! chain), rather than by chaining continuations.
//!
//! A chain with zero threads is serviced synchronously by
//! [`TaskChain::poll`] (or [`TaskManager::poll`]) with the same barrier and
//! priority guarantees; both paths share one scheduling core.
//!
//! # Example
//!
//! ```
//! use taskline::{DoneStatus, Task, TaskManager};
//!
//! let manager = TaskManager::new("demo", 0);
//! let task = Task::builder("hello").priority(10).build_fn(|cx| {
//!     println!("hello from {}", cx.task().name());
//!     DoneStatus::Done
//! });
//! manager.add(&task).unwrap();
//! manager.poll();
//! assert_eq!(manager.num_tasks(), 0);
//! ```
//!
//! # Module Structure
//!
//! - [`types`]: identifiers, time, statuses
//! - [`clock`]: pluggable time sources
//! - [`task`]: the task record, payload trait, collection, and sequence
//! - [`chain`]: the per-lane scheduling engine
//! - [`manager`]: the chain container and cross-chain name index
//! - [`event`] / [`stats`]: one-way notification and profiling sinks
//! - [`test_utils`]: logging setup and recording sinks for tests

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod chain;
pub mod clock;
pub mod error;
pub mod event;
pub mod manager;
pub mod stats;
pub mod task;
pub mod test_utils;
pub mod types;
pub mod util;

pub use chain::TaskChain;
pub use clock::{Clock, ManualClock, RealClock};
pub use error::TaskError;
pub use event::{EventSink, NoOpEvents};
pub use manager::{TaskManager, TaskManagerBuilder};
pub use stats::{NoOpStats, StatsProvider};
pub use task::collection::TaskCollection;
pub use task::sequence::TaskSequence;
pub use task::{Task, TaskBuilder, TaskCx, TaskPayload};
pub use types::{ChainLifecycle, DoneStatus, TaskId, TaskState, Time};
pub use util::GlobPattern;
