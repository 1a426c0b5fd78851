//! Optional statistics/profiling spans.
//!
//! The scheduler brackets task execution and worker waiting with start/stop
//! calls keyed by chain and task name. The default provider is a no-op;
//! embedders plug in their own profiler. Providers must be cheap and
//! non-blocking: wait spans are reported with the shared lock held.

use std::time::Duration;

/// Receiver for execution and wait timing spans.
pub trait StatsProvider: Send + Sync + 'static {
    /// A task's work function is about to run.
    fn task_started(&self, chain: &str, task: &str);

    /// A task's work function returned after `elapsed`.
    fn task_stopped(&self, chain: &str, task: &str, elapsed: Duration);

    /// A worker (or a blocked caller) began waiting on the chain.
    fn wait_started(&self, chain: &str);

    /// The wait ended after `elapsed`.
    fn wait_stopped(&self, chain: &str, elapsed: Duration);
}

/// A statistics provider that records nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpStats;

impl StatsProvider for NoOpStats {
    fn task_started(&self, _: &str, _: &str) {}

    fn task_stopped(&self, _: &str, _: &str, _: Duration) {}

    fn wait_started(&self, _: &str) {}

    fn wait_stopped(&self, _: &str, _: Duration) {}
}
