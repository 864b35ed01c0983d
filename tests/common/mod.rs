#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::PathBuf;
use std::process::{Command, ExitStatus};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use nerve_agent::core::config::{NerveConfig, ServiceSpec};
use nerve_agent::core::errors::{NerveError, Result};
use nerve_agent::core::source::ConfigSource;
use nerve_agent::daemon::reconcile::WatcherKey;
use nerve_agent::watcher::{WatcherFactory, WatcherTask};

// ──────────────────── binary runner ────────────────────

pub struct CmdResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub log_path: PathBuf,
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn resolve_bin_path() -> PathBuf {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_nerve") {
        return PathBuf::from(path);
    }

    let exe_name = if cfg!(windows) { "nerve.exe" } else { "nerve" };
    let fallback = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(PathBuf::from))
        .and_then(|deps| deps.parent().map(PathBuf::from))
        .map(|debug_dir| debug_dir.join(exe_name));

    match fallback {
        Some(path) if path.exists() => path,
        _ => panic!("unable to resolve nerve binary path for integration test"),
    }
}

pub fn run_cli_case(case_name: &str, args: &[&str]) -> CmdResult {
    let root = std::env::temp_dir().join("nerve-test-logs");
    fs::create_dir_all(&root).expect("create temp test log dir");

    let log_path = root.join(format!("{}-{}.log", sanitize(case_name), now_millis()));
    let bin_path = resolve_bin_path();

    let output = Command::new(&bin_path)
        .args(args)
        .env_remove("NERVE_CONFIG")
        .env_remove("NERVE_CONFIG_OVERLAY")
        .env_remove("NERVE_INSTANCE_ID")
        .env_remove("NERVE_CHECK_CONFIG")
        .env("RUST_LOG", "warn")
        .env("RUST_BACKTRACE", "1")
        .output()
        .expect("execute nerve command");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    let mut log_content = String::new();
    log_content.push_str(&format!("case={case_name}\n"));
    log_content.push_str(&format!("bin={}\n", bin_path.display()));
    log_content.push_str(&format!("args={args:?}\n"));
    log_content.push_str(&format!("status={}\n", output.status));
    log_content.push_str("----- stdout -----\n");
    log_content.push_str(&stdout);
    log_content.push('\n');
    log_content.push_str("----- stderr -----\n");
    log_content.push_str(&stderr);
    log_content.push('\n');
    fs::write(&log_path, log_content).expect("write test log");

    CmdResult {
        status: output.status,
        stdout,
        stderr,
        log_path,
    }
}

// ──────────────────── config builders ────────────────────

pub const INSTANCE_ID: &str = "testid";

pub fn service(name: &str, port: u16) -> ServiceSpec {
    ServiceSpec::new(name, "localhost", port)
}

pub fn snapshot(services: Vec<ServiceSpec>) -> NerveConfig {
    let services: BTreeMap<String, ServiceSpec> = services
        .into_iter()
        .map(|spec| (spec.name.clone(), spec))
        .collect();
    NerveConfig::with_services(INSTANCE_ID, services)
}

pub fn keys(names: &[&str]) -> BTreeSet<WatcherKey> {
    names.iter().map(|n| WatcherKey::from(*n)).collect()
}

// ──────────────────── fake config source ────────────────────

type ReloadHook = Box<dyn FnMut() + Send>;

#[derive(Default)]
struct SourceState {
    next: Mutex<Option<NerveConfig>>,
    current: Mutex<Option<Arc<NerveConfig>>>,
    overlay: Mutex<Option<SystemTime>>,
    reloads: AtomicUsize,
    fail_next: AtomicBool,
    hook: Mutex<Option<ReloadHook>>,
}

/// Config source whose contents the test controls through a [`SourceHandle`].
pub struct FakeSource {
    state: Arc<SourceState>,
}

/// Test-side control over a [`FakeSource`].
#[derive(Clone)]
pub struct SourceHandle {
    state: Arc<SourceState>,
}

pub fn fake_source(initial: NerveConfig) -> (FakeSource, SourceHandle) {
    let state = Arc::new(SourceState::default());
    *state.current.lock() = Some(Arc::new(initial.clone()));
    *state.next.lock() = Some(initial);
    (
        FakeSource {
            state: Arc::clone(&state),
        },
        SourceHandle { state },
    )
}

impl SourceHandle {
    /// Served from the next reload on.
    pub fn set_config(&self, config: NerveConfig) {
        *self.state.next.lock() = Some(config);
    }

    pub fn set_overlay_mtime(&self, mtime: Option<SystemTime>) {
        *self.state.overlay.lock() = mtime;
    }

    pub fn reloads(&self) -> usize {
        self.state.reloads.load(Ordering::SeqCst)
    }

    pub fn fail_next_reload(&self) {
        self.state.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn on_reload(&self, hook: impl FnMut() + Send + 'static) {
        *self.state.hook.lock() = Some(Box::new(hook));
    }
}

impl ConfigSource for FakeSource {
    fn config(&self) -> Arc<NerveConfig> {
        self.state
            .current
            .lock()
            .clone()
            .expect("fake source has a snapshot")
    }

    fn reload(&mut self) -> Result<()> {
        self.state.reloads.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = self.state.hook.lock().as_mut() {
            hook();
        }
        if self.state.fail_next.swap(false, Ordering::SeqCst) {
            return Err(NerveError::ConfigParse {
                context: "yaml",
                details: "mapping values are not allowed here".to_string(),
            });
        }
        let mut config = self
            .state
            .next
            .lock()
            .clone()
            .expect("fake source has a config");
        config.overlay_modified_time = *self.state.overlay.lock();
        *self.state.current.lock() = Some(Arc::new(config));
        Ok(())
    }

    fn overlay_modified_time(&self) -> Option<SystemTime> {
        *self.state.overlay.lock()
    }
}

// ──────────────────── fake watchers ────────────────────

#[derive(Default)]
pub struct TaskState {
    started: AtomicBool,
    alive: AtomicBool,
    up: AtomicBool,
    failures: AtomicU64,
}

#[derive(Default)]
struct FactoryState {
    tasks: Mutex<HashMap<String, Arc<TaskState>>>,
    builds: Mutex<Vec<(String, ServiceSpec)>>,
    stops: Mutex<Vec<String>>,
    fail_start: Mutex<BTreeSet<String>>,
}

/// Watcher factory producing in-memory tasks the test can kill or flip.
pub struct FakeFactory {
    state: Arc<FactoryState>,
}

#[derive(Clone)]
pub struct FactoryHandle {
    state: Arc<FactoryState>,
}

pub fn fake_factory() -> (FakeFactory, FactoryHandle) {
    let state = Arc::new(FactoryState::default());
    (
        FakeFactory {
            state: Arc::clone(&state),
        },
        FactoryHandle { state },
    )
}

impl FactoryHandle {
    fn task(&self, key: &str) -> Arc<TaskState> {
        Arc::clone(
            self.state
                .tasks
                .lock()
                .get(key)
                .unwrap_or_else(|| panic!("no task for {key}")),
        )
    }

    pub fn kill(&self, key: &str) {
        self.task(key).alive.store(false, Ordering::SeqCst);
    }

    pub fn set_up(&self, key: &str, up: bool) {
        self.task(key).up.store(up, Ordering::SeqCst);
    }

    pub fn set_report_failures(&self, key: &str, failures: u64) {
        self.task(key).failures.store(failures, Ordering::SeqCst);
    }

    pub fn fail_start(&self, key: &str, fail: bool) {
        let mut set = self.state.fail_start.lock();
        if fail {
            set.insert(key.to_string());
        } else {
            set.remove(key);
        }
    }

    /// Launch attempts for `key`, successful or not.
    pub fn builds_of(&self, key: &str) -> usize {
        self.state
            .builds
            .lock()
            .iter()
            .filter(|(k, _)| k == key)
            .count()
    }

    pub fn last_spec(&self, key: &str) -> Option<ServiceSpec> {
        self.state
            .builds
            .lock()
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, spec)| spec.clone())
    }

    pub fn stops_of(&self, key: &str) -> usize {
        self.state.stops.lock().iter().filter(|k| *k == key).count()
    }
}

struct FakeTask {
    key: String,
    state: Arc<TaskState>,
    factory: Arc<FactoryState>,
}

impl WatcherTask for FakeTask {
    fn start(&mut self) -> Result<()> {
        if self.factory.fail_start.lock().contains(&self.key) {
            return Err(NerveError::WatcherStart {
                key: self.key.clone(),
                details: "connection refused".to_string(),
            });
        }
        self.state.started.store(true, Ordering::SeqCst);
        self.state.alive.store(true, Ordering::SeqCst);
        self.state.up.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self, _timeout: Duration) -> Result<()> {
        self.state.alive.store(false, Ordering::SeqCst);
        if self.state.started.swap(false, Ordering::SeqCst) {
            self.factory.stops.lock().push(self.key.clone());
        }
        self.state.up.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.state.alive.load(Ordering::SeqCst)
    }

    fn was_up(&self) -> bool {
        self.state.up.load(Ordering::SeqCst)
    }

    fn repeated_report_failures(&self) -> u64 {
        self.state.failures.load(Ordering::SeqCst)
    }
}

impl WatcherFactory for FakeFactory {
    fn build(&self, key: &WatcherKey, spec: &ServiceSpec) -> Result<Box<dyn WatcherTask>> {
        let state = Arc::new(TaskState::default());
        self.state
            .tasks
            .lock()
            .insert(key.to_string(), Arc::clone(&state));
        self.state
            .builds
            .lock()
            .push((key.to_string(), spec.clone()));
        Ok(Box::new(FakeTask {
            key: key.to_string(),
            state,
            factory: Arc::clone(&self.state),
        }))
    }
}
