//! Watchers: per-service-instance health-check workers and the contracts the
//! supervisor drives them through.

pub mod check;
pub mod reporter;
pub mod ring_buffer;
pub mod service;

use std::time::Duration;

use crate::core::config::ServiceSpec;
use crate::core::errors::Result;
use crate::daemon::reconcile::WatcherKey;

/// A running health-check worker for one watcher key.
///
/// Driven only from the coordinator thread. `is_alive`, `was_up` and
/// `repeated_report_failures` must return immediately without side effects.
pub trait WatcherTask: Send {
    /// Begin checking. Calling `start` on a started task is a no-op.
    fn start(&mut self) -> Result<()>;
    /// Stop checking, waiting at most `timeout` for the worker to exit.
    /// Stopping a task that never started, or already stopped, succeeds.
    fn stop(&mut self, timeout: Duration) -> Result<()>;
    fn is_alive(&self) -> bool;
    fn was_up(&self) -> bool;
    /// Consecutive failed registry reports.
    fn repeated_report_failures(&self) -> u64;
}

/// Constructs watcher tasks for the supervisor.
pub trait WatcherFactory {
    fn build(&self, key: &WatcherKey, spec: &ServiceSpec) -> Result<Box<dyn WatcherTask>>;
}
