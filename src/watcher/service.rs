//! Thread-backed watcher: checks one service instance on an interval and
//! reports rise/fall transitions through its reporter.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::core::config::ServiceSpec;
use crate::core::errors::{NerveError, Result};
use crate::daemon::reconcile::WatcherKey;
use crate::metrics::{MetricsSink, names};
use crate::watcher::check::{Check, build_checks};
use crate::watcher::reporter::{Reporter, build_reporter};
use crate::watcher::ring_buffer::RingBuffer;
use crate::watcher::{WatcherFactory, WatcherTask};

const LATENCY_HISTORY: usize = 10;

/// State the worker publishes for the supervisor to poll.
#[derive(Debug, Default)]
struct Shared {
    alive: AtomicBool,
    up: AtomicBool,
    repeated_report_failures: AtomicU64,
    /// Set when `stop` gave up waiting. A successor may already own the key,
    /// so the worker must no longer touch the reporter.
    abandoned: AtomicBool,
}

/// Marks the worker dead however it exits, panics included.
struct ExitGuard(Arc<Shared>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.0.up.store(false, Ordering::Release);
        self.0.alive.store(false, Ordering::Release);
    }
}

/// Watcher for one service instance.
pub struct ServiceWatcher {
    key: String,
    spec: ServiceSpec,
    sink: Arc<dyn MetricsSink>,
    checks: Option<Vec<Box<dyn Check>>>,
    shared: Arc<Shared>,
    stop_tx: Option<Sender<()>>,
    done_rx: Option<Receiver<()>>,
    thread: Option<JoinHandle<()>>,
}

impl ServiceWatcher {
    #[must_use]
    pub fn new(key: &str, spec: ServiceSpec, sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            key: key.to_string(),
            spec,
            sink,
            checks: None,
            shared: Arc::new(Shared::default()),
            stop_tx: None,
            done_rx: None,
            thread: None,
        }
    }

    /// Watcher running the given checks instead of the ones its spec describes.
    #[cfg(test)]
    fn with_checks(
        key: &str,
        spec: ServiceSpec,
        sink: Arc<dyn MetricsSink>,
        checks: Vec<Box<dyn Check>>,
    ) -> Self {
        let mut watcher = Self::new(key, spec, sink);
        watcher.checks = Some(checks);
        watcher
    }

    fn start_err(&self, err: &NerveError) -> NerveError {
        NerveError::WatcherStart {
            key: self.key.clone(),
            details: err.to_string(),
        }
    }
}

impl WatcherTask for ServiceWatcher {
    fn start(&mut self) -> Result<()> {
        if self.thread.is_some() {
            return Ok(());
        }
        let checks = match self.checks.take() {
            Some(checks) => checks,
            None => build_checks(&self.spec).map_err(|e| self.start_err(&e))?,
        };
        let mut reporter = build_reporter(&self.key, &self.spec).map_err(|e| self.start_err(&e))?;
        reporter.start().map_err(|e| self.start_err(&e))?;

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (done_tx, done_rx) = bounded::<()>(1);
        self.shared.alive.store(true, Ordering::Release);

        let worker = Worker {
            key: self.key.clone(),
            interval: self.spec.check_interval(),
            rise: self.spec.rise as usize,
            fall: self.spec.fall as usize,
            max_failures: self.spec.max_repeated_report_failures,
            checks,
            reporter,
            sink: Arc::clone(&self.sink),
            shared: Arc::clone(&self.shared),
            stop_rx,
        };
        let spawned = std::thread::Builder::new()
            .name(format!("nerve-watch-{}", self.key))
            .spawn(move || {
                worker.run();
                let _ = done_tx.send(());
            });
        match spawned {
            Ok(handle) => {
                self.thread = Some(handle);
                self.stop_tx = Some(stop_tx);
                self.done_rx = Some(done_rx);
                Ok(())
            }
            Err(e) => {
                self.shared.alive.store(false, Ordering::Release);
                Err(NerveError::WatcherStart {
                    key: self.key.clone(),
                    details: format!("cannot spawn worker thread: {e}"),
                })
            }
        }
    }

    fn stop(&mut self, timeout: Duration) -> Result<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.try_send(());
        }
        let Some(done_rx) = self.done_rx.take() else {
            return Ok(());
        };
        match done_rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if thread.join().is_err() {
                    return Err(NerveError::WatcherStop {
                        key: self.key.clone(),
                        details: "worker thread panicked".to_string(),
                    });
                }
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => {
                self.shared.abandoned.store(true, Ordering::Release);
                warn!(key = %self.key, ?timeout, "watcher did not stop in time, detaching its worker");
                Err(NerveError::WatcherTimeout {
                    key: self.key.clone(),
                    operation: "stop",
                    timeout,
                })
            }
        }
    }

    fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::Acquire)
    }

    fn was_up(&self) -> bool {
        self.shared.up.load(Ordering::Acquire)
    }

    fn repeated_report_failures(&self) -> u64 {
        self.shared.repeated_report_failures.load(Ordering::Acquire)
    }
}

impl Drop for ServiceWatcher {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.try_send(());
        }
    }
}

// ──────────────────── worker ────────────────────

struct Worker {
    key: String,
    interval: Duration,
    rise: usize,
    fall: usize,
    max_failures: u64,
    checks: Vec<Box<dyn Check>>,
    reporter: Box<dyn Reporter>,
    sink: Arc<dyn MetricsSink>,
    shared: Arc<Shared>,
    stop_rx: Receiver<()>,
}

impl Worker {
    fn run(mut self) {
        let _guard = ExitGuard(Arc::clone(&self.shared));
        let mut history = RingBuffer::new(self.rise.max(self.fall));
        let mut latencies: RingBuffer<f64> = RingBuffer::new(LATENCY_HISTORY);

        let jitter = self.interval.mul_f64(rand::rng().random_range(0.0..1.0));
        if self.wait(jitter) {
            self.finish();
            return;
        }

        loop {
            let passed = self.run_checks(&mut latencies);
            history.push(passed);

            let up = self.shared.up.load(Ordering::Acquire);
            let report_ok = if !up && history.last_n_equal(self.rise, &true) {
                Some(self.report(true))
            } else if up && history.last_n_equal(self.fall, &false) {
                Some(self.report(false))
            } else {
                None
            };
            let ping_ok = self.ping();

            if ping_ok && report_ok.unwrap_or(true) {
                self.shared.repeated_report_failures.store(0, Ordering::Release);
            } else {
                let failures = self
                    .shared
                    .repeated_report_failures
                    .fetch_add(1, Ordering::AcqRel)
                    + 1;
                if failures > self.max_failures {
                    warn!(
                        key = %self.key,
                        failures,
                        max = self.max_failures,
                        "too many consecutive report failures, watcher exiting"
                    );
                    self.finish();
                    return;
                }
            }

            if self.wait(self.interval) {
                break;
            }
        }
        self.finish();
    }

    /// Block for `duration`; `true` means stop was requested.
    fn wait(&self, duration: Duration) -> bool {
        match self.stop_rx.recv_timeout(duration) {
            Err(RecvTimeoutError::Timeout) => false,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
        }
    }

    fn run_checks(&self, latencies: &mut RingBuffer<f64>) -> bool {
        for check in &self.checks {
            match check.run() {
                Ok(latency) => latencies.push(latency.as_secs_f64()),
                Err(reason) => {
                    debug!(key = %self.key, target = %check.describe(), %reason, "check failed");
                    return false;
                }
            }
        }
        if let Some(avg) = latencies.average() {
            debug!(key = %self.key, avg_latency_s = avg, "checks passed");
        }
        true
    }

    fn abandoned(&self) -> bool {
        self.shared.abandoned.load(Ordering::Acquire)
    }

    fn report(&mut self, up: bool) -> bool {
        if self.abandoned() {
            return true;
        }
        let action = if up { "up" } else { "down" };
        let outcome = if up {
            self.reporter.report_up()
        } else {
            self.reporter.report_down()
        };
        match outcome {
            Ok(()) => {
                self.shared.up.store(up, Ordering::Release);
                info!(key = %self.key, state = action, "service transitioned");
                self.sink.increment(
                    names::REPORT_RESULTS_TOTAL,
                    &[("action", action), ("result", "ok")],
                    1,
                );
                true
            }
            Err(e) => {
                warn!(key = %self.key, action, error = %e, "report failed");
                self.sink.increment(
                    names::REPORT_RESULTS_TOTAL,
                    &[("action", action), ("result", "error")],
                    1,
                );
                false
            }
        }
    }

    fn ping(&mut self) -> bool {
        match self.reporter.ping() {
            Ok(()) => {
                self.sink
                    .increment(names::REPORTER_PING_RESULTS_TOTAL, &[("result", "ok")], 1);
                true
            }
            Err(e) => {
                warn!(key = %self.key, error = %e, "reporter ping failed");
                self.sink
                    .increment(names::REPORTER_PING_RESULTS_TOTAL, &[("result", "error")], 1);
                false
            }
        }
    }

    fn finish(&mut self) {
        if self.abandoned() {
            debug!(key = %self.key, "detached worker exiting without reporter teardown");
            return;
        }
        if self.shared.up.load(Ordering::Acquire) {
            self.report(false);
        }
        if let Err(e) = self.reporter.stop() {
            warn!(key = %self.key, error = %e, "reporter stop failed");
        }
    }
}

// ──────────────────── factory ────────────────────

/// Builds [`ServiceWatcher`]s sharing one metrics sink.
pub struct ServiceWatcherFactory {
    sink: Arc<dyn MetricsSink>,
}

impl ServiceWatcherFactory {
    #[must_use]
    pub fn new(sink: Arc<dyn MetricsSink>) -> Self {
        Self { sink }
    }
}

impl WatcherFactory for ServiceWatcherFactory {
    fn build(&self, key: &WatcherKey, spec: &ServiceSpec) -> Result<Box<dyn WatcherTask>> {
        Ok(Box::new(ServiceWatcher::new(
            key.as_str(),
            spec.clone(),
            Arc::clone(&self.sink),
        )))
    }
}
