#![forbid(unsafe_code)]

//! Nerve agent: a node-local daemon that keeps one health-check watcher per
//! service instance in sync with configuration and reports up/down status to
//! a service registry.
//!
//! The core is a single-threaded reconciliation loop:
//! 1. **Reload** when triggered or when the overlay file's mtime changes
//! 2. **Reconcile** the desired watcher set against the running one
//! 3. **Sweep** liveness, relaunching dead watchers under a throttle
//! 4. **Publish** process-wide telemetry
//!
//! # Library usage
//!
//! ```rust,no_run
//! use nerve_agent::prelude::*;
//! ```

pub mod prelude;

pub mod core;
pub mod daemon;
pub mod metrics;
pub mod watcher;
