//! Core types: errors, configuration, configuration sources, time.

pub mod clock;
pub mod config;
pub mod errors;
pub mod source;
