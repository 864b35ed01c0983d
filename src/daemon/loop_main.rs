//! Main loop: decide whether to reload, reconcile, sweep liveness, publish
//! telemetry, then block on the heartbeat.
//!
//! Everything here runs on the coordinator thread. Watchers run on their own
//! threads but are only started, stopped and polled from here, so the
//! supervisor's maps need no locking. The heartbeat sleep is the single
//! suspend point between iterations.

#![allow(missing_docs)]

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use filetime::FileTime;
use tracing::{debug, error, info, warn};

use crate::core::clock::Clock;
use crate::core::errors::Result;
use crate::core::source::ConfigSource;
use crate::daemon::reconcile::diff;
use crate::daemon::signals::SignalHandler;
use crate::daemon::supervisor::{Supervisor, SupervisorActivity};
use crate::daemon::telemetry::WatcherCensus;
use crate::metrics::{MetricsOptions, MetricsSink, names, timed};
use crate::watcher::WatcherFactory;

/// What one iteration did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IterationReport {
    pub reloaded: bool,
    pub applied: SupervisorActivity,
    pub swept: SupervisorActivity,
    pub census: WatcherCensus,
}

pub struct Orchestrator {
    source: Box<dyn ConfigSource>,
    supervisor: Supervisor,
    sink: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
    signals: SignalHandler,
    config_to_load: bool,
    last_overlay_mtime: Option<SystemTime>,
    heartbeat_interval: Duration,
    heartbeat_path: Option<PathBuf>,
    iterations: u64,
    started_at: Instant,
    stopped: bool,
}

impl Orchestrator {
    pub fn new(
        source: Box<dyn ConfigSource>,
        factory: Box<dyn WatcherFactory>,
        sink: Arc<dyn MetricsSink>,
        clock: Arc<dyn Clock>,
        signals: SignalHandler,
    ) -> Self {
        let config = source.config();
        let supervisor = Supervisor::new(
            factory,
            Arc::clone(&sink),
            Arc::clone(&clock),
            &config.settings,
        );
        let started_at = clock.now();
        Self {
            source,
            supervisor,
            sink,
            clock,
            signals,
            config_to_load: true,
            last_overlay_mtime: None,
            heartbeat_interval: config.settings.heartbeat_interval,
            heartbeat_path: config.heartbeat_path.clone(),
            iterations: 0,
            started_at,
            stopped: false,
        }
    }

    // ──────────────────── accessors ────────────────────

    #[must_use]
    pub fn config_to_load(&self) -> bool {
        self.config_to_load
    }

    /// Force a reload on the next iteration.
    pub fn request_reload(&mut self) {
        self.config_to_load = true;
    }

    #[must_use]
    pub fn last_overlay_mtime(&self) -> Option<SystemTime> {
        self.last_overlay_mtime
    }

    #[must_use]
    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    #[must_use]
    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    // ──────────────────── loop ────────────────────

    /// Iterate until shutdown is requested, then reap every watcher.
    ///
    /// Returns an error only for a failed reload or a broken supervisor
    /// invariant; watchers are still reaped before it is returned.
    pub fn run(&mut self) -> Result<()> {
        info!(version = env!("CARGO_PKG_VERSION"), "nerve starting");

        let outcome = loop {
            if self.signals.should_shutdown() {
                info!("shutdown requested");
                break Ok(());
            }
            if let Err(e) = self.iterate() {
                error!(code = e.code(), error = %e, "fatal error in main loop");
                break Err(e);
            }
            self.heartbeat();
        };

        self.shutdown();
        outcome
    }

    /// One pass: reload if due, reconcile, sweep, publish. Does not sleep.
    pub fn iterate(&mut self) -> Result<IterationReport> {
        let sink = Arc::clone(&self.sink);
        let clock = Arc::clone(&self.clock);
        let report = timed(
            sink.as_ref(),
            clock.as_ref(),
            names::MAIN_LOOP_DURATION_SECONDS,
            &[],
            || self.iterate_inner(),
        )?;
        self.iterations += 1;
        Ok(report)
    }

    fn iterate_inner(&mut self) -> Result<IterationReport> {
        let polled = self.source.overlay_modified_time();
        let triggered = std::mem::take(&mut self.config_to_load) | self.signals.should_reload();
        let overlay_changed = polled != self.last_overlay_mtime;

        let reloaded = triggered || overlay_changed;
        if reloaded {
            if overlay_changed && !triggered {
                info!(
                    previous = ?self.last_overlay_mtime,
                    current = ?polled,
                    "overlay changed, reloading configuration"
                );
            }
            self.reload()?;
        } else {
            self.last_overlay_mtime = polled;
        }

        let config = self.source.config();
        let plan = diff(
            &config.services,
            &self.supervisor.known_keys(),
            self.supervisor.desired(),
        );
        if reloaded {
            for rejected in &plan.rejected {
                warn!(service = %rejected.name, reason = %rejected.reason, "service skipped");
                self.sink
                    .increment(names::SERVICE_CONFIG_ERRORS_TOTAL, &[], 1);
            }
        }
        let applied = self.supervisor.apply(plan);
        if !applied.is_idle() {
            debug!(?applied, "reconciled watchers");
        }

        let swept = self.supervisor.sweep();
        if !swept.is_idle() {
            debug!(?swept, "liveness sweep acted");
        }
        self.supervisor.verify()?;

        let census = WatcherCensus::collect(&self.supervisor);
        census.publish(self.sink.as_ref());

        Ok(IterationReport {
            reloaded,
            applied,
            swept,
            census,
        })
    }

    fn reload(&mut self) -> Result<()> {
        self.source.reload()?;
        let config = self.source.config();

        if let Err(e) = self.sink.configure(&MetricsOptions::from_config(&config)) {
            warn!(code = e.code(), error = %e, "metrics reconfiguration failed");
        }
        self.sink.increment(names::CONFIG_RELOADS_TOTAL, &[], 1);

        for rejected in &config.rejected_services {
            warn!(service = %rejected.name, reason = %rejected.reason, "invalid service config");
            self.sink
                .increment(names::SERVICE_CONFIG_ERRORS_TOTAL, &[], 1);
        }

        self.supervisor.update_settings(&config.settings);
        self.heartbeat_interval = config.settings.heartbeat_interval;
        self.heartbeat_path.clone_from(&config.heartbeat_path);
        self.last_overlay_mtime = config.overlay_modified_time;

        info!(
            instance_id = %config.instance_id,
            services = config.services.len(),
            "configuration loaded"
        );
        Ok(())
    }

    /// Touch the heartbeat file, then sleep until the next iteration or
    /// until shutdown is requested.
    pub fn heartbeat(&self) {
        if let Some(path) = &self.heartbeat_path
            && let Err(e) = touch(path)
        {
            warn!(path = %path.display(), error = %e, "heartbeat touch failed");
        }
        self.signals.sleep_unless_shutdown(self.heartbeat_interval);
    }

    /// Reap every watcher and release metrics resources. Idempotent.
    pub fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.supervisor.shutdown();
        self.sink.shutdown();
        let uptime = self.clock.now().saturating_duration_since(self.started_at);
        info!(
            iterations = self.iterations,
            uptime_secs = uptime.as_secs(),
            "nerve stopped"
        );
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Create `path` if missing and set its mtime to now.
fn touch(path: &Path) -> std::io::Result<()> {
    OpenOptions::new().create(true).append(true).open(path)?;
    filetime::set_file_mtime(path, FileTime::now())
}
