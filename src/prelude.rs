//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use nerve_agent::prelude::*;
//! ```

// Core
pub use crate::core::clock::{Clock, ManualClock, MonotonicClock};
pub use crate::core::config::{NerveConfig, ServiceSpec};
pub use crate::core::errors::{NerveError, Result};
pub use crate::core::source::{ConfigSource, FileConfigSource, SourceOptions};

// Daemon
pub use crate::daemon::loop_main::{IterationReport, Orchestrator};
pub use crate::daemon::reconcile::{ReconcilePlan, WatcherKey, diff, expand};
pub use crate::daemon::signals::SignalHandler;
pub use crate::daemon::supervisor::Supervisor;
pub use crate::daemon::telemetry::WatcherCensus;

// Metrics
pub use crate::metrics::{MetricsOptions, MetricsSink, NerveMetrics, NoopSink};

// Watchers
pub use crate::watcher::service::{ServiceWatcher, ServiceWatcherFactory};
pub use crate::watcher::{WatcherFactory, WatcherTask};
