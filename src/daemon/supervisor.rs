//! Supervisor: owns running watcher handles, applies reconcile plans, sweeps
//! liveness and throttles relaunches.
//!
//! Single-writer: only the coordinator thread touches these maps. Keys that
//! are desired but not running (dead, throttled, failed to start) sit in the
//! pending set until the sweep relaunches them.

#![allow(missing_docs)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::core::clock::Clock;
use crate::core::config::{LoopSettings, ServiceSpec};
use crate::core::errors::{NerveError, Result};
use crate::daemon::reconcile::{ReconcilePlan, WatcherKey};
use crate::metrics::{MetricsSink, names};
use crate::watcher::{WatcherFactory, WatcherTask};

// ──────────────────── reasons ────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchReason {
    Config,
    Dead,
    Retry,
}

impl LaunchReason {
    #[must_use]
    pub const fn as_label(self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Dead => "dead",
            Self::Retry => "retry",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Config,
    Dead,
    Shutdown,
}

impl StopReason {
    #[must_use]
    pub const fn as_label(self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Dead => "dead",
            Self::Shutdown => "shutdown",
        }
    }
}

// ──────────────────── handles ────────────────────

/// A launched watcher and the spec it was launched with.
pub struct WatcherHandle {
    key: WatcherKey,
    spec: ServiceSpec,
    task: Box<dyn WatcherTask>,
    launched_at: Instant,
}

impl WatcherHandle {
    #[must_use]
    pub fn key(&self) -> &WatcherKey {
        &self.key
    }

    #[must_use]
    pub fn spec(&self) -> &ServiceSpec {
        &self.spec
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.task.is_alive()
    }

    #[must_use]
    pub fn was_up(&self) -> bool {
        self.task.was_up()
    }

    #[must_use]
    pub fn repeated_report_failures(&self) -> u64 {
        self.task.repeated_report_failures()
    }
}

#[derive(Debug, Clone)]
struct PendingLaunch {
    spec: ServiceSpec,
    reason: LaunchReason,
}

/// Counts from one `apply` or `sweep`, for logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SupervisorActivity {
    pub launched: usize,
    pub failed: usize,
    pub reaped: usize,
    pub throttled: usize,
}

impl SupervisorActivity {
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        self.launched == 0 && self.failed == 0 && self.reaped == 0 && self.throttled == 0
    }
}

// ──────────────────── supervisor ────────────────────

pub struct Supervisor {
    factory: Box<dyn WatcherFactory>,
    sink: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
    relaunch_throttle: Duration,
    stop_timeout: Duration,
    running: BTreeMap<WatcherKey, WatcherHandle>,
    pending: BTreeMap<WatcherKey, PendingLaunch>,
    desired: BTreeMap<WatcherKey, ServiceSpec>,
    last_relaunch: HashMap<WatcherKey, Instant>,
}

impl Supervisor {
    pub fn new(
        factory: Box<dyn WatcherFactory>,
        sink: Arc<dyn MetricsSink>,
        clock: Arc<dyn Clock>,
        settings: &LoopSettings,
    ) -> Self {
        Self {
            factory,
            sink,
            clock,
            relaunch_throttle: settings.relaunch_throttle,
            stop_timeout: settings.watcher_stop_timeout,
            running: BTreeMap::new(),
            pending: BTreeMap::new(),
            desired: BTreeMap::new(),
            last_relaunch: HashMap::new(),
        }
    }

    /// Adopt throttle and stop-timeout settings from a fresh snapshot.
    pub fn update_settings(&mut self, settings: &LoopSettings) {
        self.relaunch_throttle = settings.relaunch_throttle;
        self.stop_timeout = settings.watcher_stop_timeout;
    }

    /// Keys the reconciler must treat as already present.
    #[must_use]
    pub fn known_keys(&self) -> BTreeSet<WatcherKey> {
        self.running
            .keys()
            .chain(self.pending.keys())
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn running_keys(&self) -> BTreeSet<WatcherKey> {
        self.running.keys().cloned().collect()
    }

    #[must_use]
    pub fn pending_keys(&self) -> BTreeSet<WatcherKey> {
        self.pending.keys().cloned().collect()
    }

    /// Spec last applied per key.
    #[must_use]
    pub fn desired(&self) -> &BTreeMap<WatcherKey, ServiceSpec> {
        &self.desired
    }

    pub fn handles(&self) -> impl Iterator<Item = &WatcherHandle> {
        self.running.values()
    }

    #[must_use]
    pub fn handle(&self, key: &WatcherKey) -> Option<&WatcherHandle> {
        self.running.get(key)
    }

    /// Execute a plan: every reap first, then every launch.
    pub fn apply(&mut self, plan: ReconcilePlan) -> SupervisorActivity {
        let mut activity = SupervisorActivity::default();
        let ReconcilePlan {
            to_launch,
            to_replace,
            to_reap,
            expanded,
            ..
        } = plan;

        for key in to_reap.iter().chain(&to_replace) {
            if self.pending.remove(key).is_some() {
                debug!(%key, "dropped pending relaunch");
            }
            if self.reap(key, StopReason::Config) {
                activity.reaped += 1;
            }
        }

        self.desired = expanded;
        self.prune_throttle(self.clock.now());

        for key in to_launch.iter().chain(&to_replace) {
            let Some(spec) = self.desired.get(key).cloned() else {
                continue;
            };
            if self.launch(key, spec, LaunchReason::Config) {
                activity.launched += 1;
            } else {
                activity.failed += 1;
            }
        }
        activity
    }

    /// Reap dead watchers, then relaunch pending keys outside the throttle
    /// window.
    pub fn sweep(&mut self) -> SupervisorActivity {
        let mut activity = SupervisorActivity::default();

        let now = self.clock.now();
        let dead: Vec<WatcherKey> = self
            .running
            .iter()
            .filter(|(_, handle)| !handle.task.is_alive())
            .map(|(key, _)| key.clone())
            .collect();
        for key in dead {
            if let Some(handle) = self.running.get(&key) {
                let spec = handle.spec.clone();
                let lived = now.saturating_duration_since(handle.launched_at);
                warn!(%key, lived_secs = lived.as_secs(), "watcher is dead");
                if self.reap(&key, StopReason::Dead) {
                    activity.reaped += 1;
                }
                self.pending.insert(
                    key,
                    PendingLaunch {
                        spec,
                        reason: LaunchReason::Dead,
                    },
                );
            }
        }

        let pending: Vec<WatcherKey> = self.pending.keys().cloned().collect();
        for key in pending {
            if self.is_throttled(&key, now) {
                self.sink.increment(names::WATCHER_THROTTLED_TOTAL, &[], 1);
                debug!(%key, "relaunch throttled");
                activity.throttled += 1;
                continue;
            }
            let Some(PendingLaunch { spec, reason }) = self.pending.remove(&key) else {
                continue;
            };
            self.last_relaunch.insert(key.clone(), now);
            if self.launch(&key, spec, reason) {
                activity.launched += 1;
            } else {
                activity.failed += 1;
            }
        }
        activity
    }

    /// Reap everything. Safe to call repeatedly.
    pub fn shutdown(&mut self) {
        let keys: Vec<WatcherKey> = self.running.keys().cloned().collect();
        if !keys.is_empty() {
            info!(count = keys.len(), "stopping all watchers");
        }
        for key in keys {
            self.reap(&key, StopReason::Shutdown);
        }
        self.pending.clear();
    }

    /// Check that every running or pending key is desired and that no key is
    /// both running and pending.
    pub fn verify(&self) -> Result<()> {
        if let Some(key) = self
            .running
            .keys()
            .chain(self.pending.keys())
            .find(|k| !self.desired.contains_key(*k))
        {
            return Err(NerveError::Invariant {
                details: format!("watcher {key} is tracked but not desired"),
            });
        }
        if let Some(key) = self.running.keys().find(|k| self.pending.contains_key(*k)) {
            return Err(NerveError::Invariant {
                details: format!("watcher {key} is both running and pending"),
            });
        }
        Ok(())
    }

    /// Forget relaunch times for keys no longer desired once their window
    /// has passed.
    fn prune_throttle(&mut self, now: Instant) {
        let window = self.relaunch_throttle;
        let desired = &self.desired;
        self.last_relaunch.retain(|key, last| {
            desired.contains_key(key) || now.saturating_duration_since(*last) < window
        });
    }

    #[cfg(test)]
    fn throttled_keys(&self) -> BTreeSet<WatcherKey> {
        self.last_relaunch.keys().cloned().collect()
    }

    fn is_throttled(&self, key: &WatcherKey, now: Instant) -> bool {
        self.last_relaunch
            .get(key)
            .is_some_and(|last| now.saturating_duration_since(*last) < self.relaunch_throttle)
    }

    /// Build and start a watcher. On failure the key becomes pending.
    fn launch(&mut self, key: &WatcherKey, spec: ServiceSpec, reason: LaunchReason) -> bool {
        let started = self.factory.build(key, &spec).and_then(|mut task| {
            match task.start() {
                Ok(()) => Ok(task),
                Err(e) => {
                    if let Err(stop_err) = task.stop(self.stop_timeout) {
                        debug!(%key, error = %stop_err, "cleanup after failed start did not stop cleanly");
                    }
                    Err(e)
                }
            }
        });

        match started {
            Ok(task) => {
                info!(%key, reason = reason.as_label(), "launched watcher");
                self.sink.increment(
                    names::WATCHER_LAUNCHES_TOTAL,
                    &[("reason", reason.as_label())],
                    1,
                );
                self.running.insert(
                    key.clone(),
                    WatcherHandle {
                        key: key.clone(),
                        spec,
                        task,
                        launched_at: self.clock.now(),
                    },
                );
                true
            }
            Err(e) => {
                warn!(%key, error = %e, "watcher failed to launch");
                self.sink
                    .increment(names::WATCHER_LAUNCHES_TOTAL, &[("reason", "error")], 1);
                self.pending.insert(
                    key.clone(),
                    PendingLaunch {
                        spec,
                        reason: LaunchReason::Retry,
                    },
                );
                false
            }
        }
    }

    /// Stop and drop a running handle. A failed or timed-out stop is counted
    /// under `error` and the handle is dropped regardless.
    fn reap(&mut self, key: &WatcherKey, reason: StopReason) -> bool {
        let Some(mut handle) = self.running.remove(key) else {
            return false;
        };
        match handle.task.stop(self.stop_timeout) {
            Ok(()) => {
                info!(%key, reason = reason.as_label(), "reaped watcher");
                self.sink.increment(
                    names::WATCHER_STOPS_TOTAL,
                    &[("reason", reason.as_label())],
                    1,
                );
            }
            Err(e) => {
                warn!(%key, reason = reason.as_label(), error = %e, "watcher did not stop cleanly");
                self.sink
                    .increment(names::WATCHER_STOPS_TOTAL, &[("reason", "error")], 1);
            }
        }
        true
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::daemon::reconcile::diff;
    use crate::metrics::memory::MemorySink;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct Behaviour {
        fail_start: Mutex<BTreeSet<String>>,
        fail_stop: AtomicBool,
        alive: Mutex<HashMap<String, Arc<AtomicBool>>>,
    }

    struct Task {
        key: String,
        alive: Arc<AtomicBool>,
        behaviour: Arc<Behaviour>,
    }

    impl WatcherTask for Task {
        fn start(&mut self) -> Result<()> {
            if self.behaviour.fail_start.lock().contains(&self.key) {
                return Err(NerveError::WatcherStart {
                    key: self.key.clone(),
                    details: "refused".to_string(),
                });
            }
            self.alive.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn stop(&mut self, _timeout: Duration) -> Result<()> {
            self.alive.store(false, Ordering::SeqCst);
            if self.behaviour.fail_stop.load(Ordering::SeqCst) {
                return Err(NerveError::WatcherStop {
                    key: self.key.clone(),
                    details: "stuck".to_string(),
                });
            }
            Ok(())
        }

        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        fn was_up(&self) -> bool {
            true
        }

        fn repeated_report_failures(&self) -> u64 {
            0
        }
    }

    struct Factory(Arc<Behaviour>);

    impl WatcherFactory for Factory {
        fn build(&self, key: &WatcherKey, _spec: &ServiceSpec) -> Result<Box<dyn WatcherTask>> {
            let alive = Arc::new(AtomicBool::new(false));
            self.0
                .alive
                .lock()
                .insert(key.to_string(), Arc::clone(&alive));
            Ok(Box::new(Task {
                key: key.to_string(),
                alive,
                behaviour: Arc::clone(&self.0),
            }))
        }
    }

    struct Rig {
        supervisor: Supervisor,
        behaviour: Arc<Behaviour>,
        sink: Arc<MemorySink>,
        clock: Arc<ManualClock>,
    }

    impl Rig {
        fn new() -> Self {
            let behaviour = Arc::new(Behaviour::default());
            let sink = Arc::new(MemorySink::new());
            let clock = Arc::new(ManualClock::new());
            let supervisor = Supervisor::new(
                Box::new(Factory(Arc::clone(&behaviour))),
                sink.clone(),
                clock.clone(),
                &LoopSettings::default(),
            );
            Self {
                supervisor,
                behaviour,
                sink,
                clock,
            }
        }

        fn reconcile(&mut self, services: &[(&str, u16)]) -> SupervisorActivity {
            let desired: BTreeMap<String, ServiceSpec> = services
                .iter()
                .map(|(n, p)| ((*n).to_string(), ServiceSpec::new(n, "127.0.0.1", *p)))
                .collect();
            let plan = diff(
                &desired,
                &self.supervisor.known_keys(),
                self.supervisor.desired(),
            );
            self.supervisor.apply(plan)
        }

        fn kill(&self, key: &str) {
            self.behaviour.alive.lock()[key].store(false, Ordering::SeqCst);
        }

        fn launches(&self, reason: &str) -> u64 {
            self.sink
                .counter(names::WATCHER_LAUNCHES_TOTAL, &[("reason", reason)])
        }

        fn stops(&self, reason: &str) -> u64 {
            self.sink.counter(names::WATCHER_STOPS_TOTAL, &[("reason", reason)])
        }
    }

    fn keys(names: &[&str]) -> BTreeSet<WatcherKey> {
        names.iter().map(|n| WatcherKey::from(*n)).collect()
    }

    #[test]
    fn dead_watcher_is_reaped_and_relaunched_once() {
        let mut rig = Rig::new();
        rig.reconcile(&[("service1", 1234)]);
        rig.kill("service1");

        let activity = rig.supervisor.sweep();
        assert_eq!(activity.reaped, 1);
        assert_eq!(activity.launched, 1);
        assert_eq!(rig.supervisor.running_keys(), keys(&["service1"]));
        assert_eq!(rig.launches("config"), 1);
        assert_eq!(rig.launches("dead"), 1);
        assert_eq!(rig.stops("dead"), 1);

        rig.supervisor.shutdown();
        assert_eq!(rig.stops("shutdown"), 1);
    }

    #[test]
    fn relaunch_within_window_is_throttled_then_retried() {
        let mut rig = Rig::new();
        rig.reconcile(&[("service1", 1234)]);
        rig.kill("service1");
        rig.supervisor.sweep();

        rig.clock.advance(Duration::from_secs(1));
        rig.kill("service1");
        let activity = rig.supervisor.sweep();
        assert_eq!(activity.throttled, 1);
        assert!(rig.supervisor.running_keys().is_empty());
        assert_eq!(rig.supervisor.pending_keys(), keys(&["service1"]));

        // Config passes must not bypass the throttle.
        let activity = rig.reconcile(&[("service1", 1234)]);
        assert!(activity.is_idle());
        assert!(rig.supervisor.running_keys().is_empty());

        rig.clock.advance(Duration::from_secs(9));
        let activity = rig.supervisor.sweep();
        assert_eq!(activity.launched, 1);
        assert_eq!(rig.supervisor.running_keys(), keys(&["service1"]));
        assert_eq!(rig.sink.counter_total(names::WATCHER_THROTTLED_TOTAL), 1);
        assert_eq!(rig.launches("dead"), 2);
    }

    #[test]
    fn start_failure_is_isolated_and_retried() {
        let mut rig = Rig::new();
        rig.behaviour.fail_start.lock().insert("bad".to_string());

        let activity = rig.reconcile(&[("bad", 1), ("good", 2)]);
        assert_eq!(activity.launched, 1);
        assert_eq!(activity.failed, 1);
        assert_eq!(rig.supervisor.running_keys(), keys(&["good"]));
        assert_eq!(rig.launches("error"), 1);

        rig.behaviour.fail_start.lock().clear();
        rig.supervisor.sweep();
        assert_eq!(rig.supervisor.running_keys(), keys(&["bad", "good"]));
        assert_eq!(rig.launches("retry"), 1);
    }

    #[test]
    fn stop_failure_still_removes_handle() {
        let mut rig = Rig::new();
        rig.reconcile(&[("service1", 1234)]);
        rig.behaviour.fail_stop.store(true, Ordering::SeqCst);
        rig.reconcile(&[]);
        assert!(rig.supervisor.running_keys().is_empty());
        assert_eq!(rig.stops("error"), 1);
        assert_eq!(rig.stops("config"), 0);
    }

    #[test]
    fn removing_a_pending_service_cancels_its_relaunch() {
        let mut rig = Rig::new();
        rig.behaviour.fail_start.lock().insert("service1".to_string());
        rig.reconcile(&[("service1", 1234)]);
        assert_eq!(rig.supervisor.pending_keys(), keys(&["service1"]));

        rig.reconcile(&[]);
        assert!(rig.supervisor.pending_keys().is_empty());
        assert!(rig.supervisor.sweep().is_idle());
    }

    #[test]
    fn tracked_keys_stay_within_desired() {
        let mut rig = Rig::new();
        rig.behaviour.fail_start.lock().insert("bad".to_string());
        rig.reconcile(&[("bad", 1), ("good", 2)]);
        rig.supervisor.verify().unwrap();
        rig.kill("good");
        rig.supervisor.sweep();
        rig.supervisor.verify().unwrap();
        rig.reconcile(&[("good", 3)]);
        rig.supervisor.verify().unwrap();

        rig.supervisor.pending.insert(
            WatcherKey::from("ghost"),
            PendingLaunch {
                spec: ServiceSpec::new("ghost", "127.0.0.1", 9),
                reason: LaunchReason::Retry,
            },
        );
        let err = rig.supervisor.verify().unwrap_err();
        assert_eq!(err.code(), "NRV-3901");
        assert!(err.is_fatal());
    }

    #[test]
    fn throttle_entries_of_removed_keys_expire() {
        let mut rig = Rig::new();
        rig.reconcile(&[("service1", 1234), ("service2", 1235)]);
        rig.kill("service1");
        rig.supervisor.sweep();
        assert_eq!(rig.supervisor.throttled_keys(), keys(&["service1"]));

        // Still inside the window: kept.
        rig.reconcile(&[("service2", 1235)]);
        assert_eq!(rig.supervisor.throttled_keys(), keys(&["service1"]));

        rig.clock.advance(Duration::from_secs(10));
        rig.reconcile(&[("service2", 1235)]);
        assert!(rig.supervisor.throttled_keys().is_empty());
    }

    #[test]
    fn throttle_entries_of_desired_keys_are_kept() {
        let mut rig = Rig::new();
        rig.reconcile(&[("service1", 1234)]);
        rig.kill("service1");
        rig.supervisor.sweep();
        rig.clock.advance(Duration::from_secs(60));
        rig.reconcile(&[("service1", 1234)]);
        assert_eq!(rig.supervisor.throttled_keys(), keys(&["service1"]));
    }

    #[test]
    fn shutdown_is_idempotent() {
        let mut rig = Rig::new();
        rig.reconcile(&[("a", 1), ("b", 2)]);
        rig.supervisor.shutdown();
        rig.supervisor.shutdown();
        assert_eq!(rig.stops("shutdown"), 2);
        assert!(rig.supervisor.running_keys().is_empty());
    }
}
