//! Signal handling: SIGTERM/SIGINT graceful shutdown, SIGHUP config reload.
//!
//! Uses the `signal-hook` crate for safe signal registration. The main loop
//! polls `SignalHandler` flags each iteration rather than blocking on signals.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::warn;

const SLEEP_SLICE: Duration = Duration::from_millis(50);

// ──────────────────── signal handler ────────────────────

/// Flags shared between OS signal hooks, the main loop and tests.
#[derive(Clone, Default)]
pub struct SignalHandler {
    shutdown_flag: Arc<AtomicBool>,
    reload_flag: Arc<AtomicBool>,
}

impl SignalHandler {
    /// Handler with OS signals registered.
    ///
    /// Registration is best-effort; failures are logged but not fatal.
    pub fn new() -> Self {
        let handler = Self::detached();
        handler.register_signals();
        handler
    }

    /// Handler that only reacts to programmatic requests.
    pub fn detached() -> Self {
        Self {
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            reload_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn should_shutdown(&self) -> bool {
        self.shutdown_flag.load(Ordering::Relaxed)
    }

    /// Check (and clear) whether a config reload has been requested.
    pub fn should_reload(&self) -> bool {
        self.reload_flag.swap(false, Ordering::Relaxed)
    }

    pub fn request_shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
    }

    pub fn request_reload(&self) {
        self.reload_flag.store(true, Ordering::Relaxed);
    }

    /// Sleep for `duration`, returning early once shutdown is requested.
    /// Returns `true` if shutdown was observed.
    pub fn sleep_unless_shutdown(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.should_shutdown() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }

    #[cfg(feature = "daemon")]
    fn register_signals(&self) {
        use signal_hook::consts::{SIGINT, SIGTERM};

        if let Err(e) = signal_hook::flag::register(SIGTERM, Arc::clone(&self.shutdown_flag)) {
            warn!(error = %e, "failed to register SIGTERM");
        }
        if let Err(e) = signal_hook::flag::register(SIGINT, Arc::clone(&self.shutdown_flag)) {
            warn!(error = %e, "failed to register SIGINT");
        }

        #[cfg(unix)]
        {
            use signal_hook::consts::SIGHUP;
            if let Err(e) = signal_hook::flag::register(SIGHUP, Arc::clone(&self.reload_flag)) {
                warn!(error = %e, "failed to register SIGHUP");
            }
        }
    }

    #[cfg(not(feature = "daemon"))]
    fn register_signals(&self) {
        warn!("built without the daemon feature; OS signals are not handled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reload_flag_clears_on_read() {
        let handler = SignalHandler::detached();
        assert!(!handler.should_reload());
        handler.request_reload();
        assert!(handler.should_reload());
        assert!(!handler.should_reload());
    }

    #[test]
    fn shutdown_flag_is_sticky_across_clones() {
        let handler = SignalHandler::detached();
        let clone = handler.clone();
        clone.request_shutdown();
        assert!(handler.should_shutdown());
        assert!(handler.should_shutdown());
    }

    #[test]
    fn sleep_returns_early_on_shutdown() {
        let handler = SignalHandler::detached();
        handler.request_shutdown();
        let start = Instant::now();
        assert!(handler.sleep_unless_shutdown(Duration::from_secs(30)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn sleep_runs_to_deadline_without_shutdown() {
        let handler = SignalHandler::detached();
        assert!(!handler.sleep_unless_shutdown(Duration::from_millis(20)));
    }
}
