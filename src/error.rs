//! Error types for the scheduler API.
//!
//! Programming-contract violations are `debug_assert!`-ed fatal in debug
//! builds; in release builds the same conditions surface as [`TaskError`]
//! values so caller misuse cannot corrupt scheduler state.

use thiserror::Error;

/// Errors surfaced by the scheduler API.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The task is already attached to a manager.
    #[error("task `{name}` is already attached to a task manager")]
    AlreadyAttached {
        /// Name of the offending task.
        name: String,
    },

    /// The task's payload declared itself not runnable.
    #[error("task `{name}` is not runnable")]
    NotRunnable {
        /// Name of the offending task.
        name: String,
    },

    /// No chain with the requested name exists.
    #[error("no task chain named `{name}`")]
    NoSuchChain {
        /// The missing chain name.
        name: String,
    },

    /// An environment variable override could not be parsed.
    #[error("invalid value for `{var}`: `{value}`")]
    InvalidEnv {
        /// The environment variable name.
        var: &'static str,
        /// The unparseable value.
        value: String,
    },
}
