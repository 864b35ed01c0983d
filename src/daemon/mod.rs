//! Daemon subsystem: reconciliation, supervision, the main loop and signal
//! handling.

pub mod loop_main;
pub mod reconcile;
pub mod signals;
pub mod supervisor;
pub mod telemetry;
