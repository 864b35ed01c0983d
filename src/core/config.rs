//! Typed configuration snapshot: validated once at the config-source boundary
//! so the reconciler only ever sees well-formed service specs.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::errors::{NerveError, Result};

pub const DEFAULT_PROMETHEUS_BIND: &str = "0.0.0.0";
pub const DEFAULT_PROMETHEUS_PORT: u16 = 9292;
pub const DEFAULT_STATSD_HOST: &str = "localhost";
pub const DEFAULT_STATSD_PORT: u16 = 8125;
/// Upper bound on watchers one service may fan out to.
pub const MAX_LOAD_TEST_CONCURRENCY: i64 = 1024;
pub const DEFAULT_MAIN_LOOP_BUCKETS: [f64; 9] = [0.001, 0.01, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

/// One immutable configuration snapshot, produced by a `ConfigSource`.
#[derive(Debug, Clone, PartialEq)]
pub struct NerveConfig {
    pub instance_id: String,
    /// Keyed by service name; the sole driver of reconciliation.
    pub services: BTreeMap<String, ServiceSpec>,
    pub prometheus: Option<PrometheusConfig>,
    pub statsd: Option<StatsdConfig>,
    pub heartbeat_path: Option<PathBuf>,
    pub settings: LoopSettings,
    /// Service entries dropped during validation, with the reason.
    pub rejected_services: Vec<RejectedService>,
    /// Overlay mtime observed right before this snapshot was assembled.
    pub overlay_modified_time: Option<SystemTime>,
}

/// Main-loop tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopSettings {
    pub heartbeat_interval: Duration,
    pub relaunch_throttle: Duration,
    pub watcher_stop_timeout: Duration,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(500),
            relaunch_throttle: Duration::from_secs(10),
            watcher_stop_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedService {
    pub name: String,
    pub reason: String,
}

/// Pull exporter settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PrometheusConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
    pub histogram_buckets_main_loop: Option<Vec<f64>>,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: DEFAULT_PROMETHEUS_BIND.to_string(),
            port: DEFAULT_PROMETHEUS_PORT,
            histogram_buckets_main_loop: None,
        }
    }
}

impl PrometheusConfig {
    #[must_use]
    pub fn main_loop_buckets(&self) -> Vec<f64> {
        self.histogram_buckets_main_loop
            .clone()
            .unwrap_or_else(|| DEFAULT_MAIN_LOOP_BUCKETS.to_vec())
    }

    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// Push exporter settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StatsdConfig {
    pub host: String,
    pub port: u16,
}

impl Default for StatsdConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_STATSD_HOST.to_string(),
            port: DEFAULT_STATSD_PORT,
        }
    }
}

/// Per-service watcher configuration.
///
/// Compared by value to decide whether a running watcher must be replaced;
/// unrecognised keys land in `extra` and take part in that comparison.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceSpec {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub instance_id: String,
    pub host: String,
    pub port: u16,
    /// Seconds between check rounds.
    #[serde(default = "default_check_interval")]
    pub check_interval: f64,
    #[serde(default = "default_threshold")]
    pub rise: u32,
    #[serde(default = "default_threshold")]
    pub fall: u32,
    #[serde(default = "default_checks")]
    pub checks: Vec<CheckSpec>,
    #[serde(default)]
    pub reporter_type: ReporterKind,
    #[serde(default)]
    pub reporter_dir: Option<PathBuf>,
    #[serde(default = "default_concurrency")]
    pub load_test_concurrency: i64,
    #[serde(default = "default_max_report_failures")]
    pub max_repeated_report_failures: u64,
    #[serde(default)]
    pub weight: Option<u32>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A single health check performed by a watcher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CheckSpec {
    Tcp {
        #[serde(default)]
        host: Option<String>,
        #[serde(default)]
        port: Option<u16>,
        /// Seconds.
        #[serde(default = "default_check_timeout")]
        timeout: f64,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReporterKind {
    #[default]
    Log,
    File,
}

const fn default_threshold() -> u32 {
    1
}

const fn default_concurrency() -> i64 {
    1
}

const fn default_max_report_failures() -> u64 {
    10
}

const fn default_check_interval() -> f64 {
    0.5
}

const fn default_check_timeout() -> f64 {
    0.1
}

fn default_checks() -> Vec<CheckSpec> {
    vec![CheckSpec::Tcp {
        host: None,
        port: None,
        timeout: default_check_timeout(),
    }]
}

impl ServiceSpec {
    /// Minimal spec for a host/port pair with every other field defaulted.
    #[must_use]
    pub fn new(name: &str, host: &str, port: u16) -> Self {
        Self {
            name: name.to_string(),
            instance_id: String::new(),
            host: host.to_string(),
            port,
            check_interval: default_check_interval(),
            rise: default_threshold(),
            fall: default_threshold(),
            checks: default_checks(),
            reporter_type: ReporterKind::Log,
            reporter_dir: None,
            load_test_concurrency: default_concurrency(),
            max_repeated_report_failures: default_max_report_failures(),
            weight: None,
            labels: BTreeMap::new(),
            extra: Map::new(),
        }
    }

    #[must_use]
    pub fn with_concurrency(mut self, concurrency: i64) -> Self {
        self.load_test_concurrency = concurrency;
        self
    }

    #[must_use]
    pub fn check_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.check_interval)
            .unwrap_or_else(|_| Duration::from_secs_f64(default_check_interval()))
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.host.trim().is_empty() {
            return Err("host must not be empty".to_string());
        }
        if self.port == 0 {
            return Err("port must be non-zero".to_string());
        }
        if !self.check_interval.is_finite() || self.check_interval <= 0.0 {
            return Err(format!(
                "check_interval must be a positive number of seconds, got {}",
                self.check_interval
            ));
        }
        if self.rise == 0 || self.fall == 0 {
            return Err("rise and fall must be at least 1".to_string());
        }
        if self.checks.is_empty() {
            return Err("at least one check is required".to_string());
        }
        for check in &self.checks {
            let CheckSpec::Tcp { timeout, .. } = check;
            if !timeout.is_finite() || *timeout <= 0.0 {
                return Err(format!("check timeout must be positive, got {timeout}"));
            }
        }
        if self.reporter_type == ReporterKind::File && self.reporter_dir.is_none() {
            return Err("reporter_type `file` requires reporter_dir".to_string());
        }
        Ok(())
    }
}

/// Top-level keys other than `services`.
#[derive(Debug, Deserialize)]
#[serde(default)]
struct TopLevel {
    instance_id: Option<String>,
    prometheus: Option<PrometheusConfig>,
    statsd: Option<StatsdConfig>,
    heartbeat_path: Option<PathBuf>,
    heartbeat_interval_ms: u64,
    relaunch_throttle_ms: u64,
    watcher_stop_timeout_ms: u64,
}

impl Default for TopLevel {
    fn default() -> Self {
        let settings = LoopSettings::default();
        Self {
            instance_id: None,
            prometheus: None,
            statsd: None,
            heartbeat_path: None,
            heartbeat_interval_ms: duration_ms(settings.heartbeat_interval),
            relaunch_throttle_ms: duration_ms(settings.relaunch_throttle),
            watcher_stop_timeout_ms: duration_ms(settings.watcher_stop_timeout),
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl NerveConfig {
    /// Validate an untyped (already merged) document into a snapshot.
    ///
    /// Top-level problems are fatal; a malformed service entry is only
    /// recorded in `rejected_services` and skipped.
    pub fn from_document(document: Value, overlay_modified_time: Option<SystemTime>) -> Result<Self> {
        let Value::Object(mut root) = document else {
            return Err(NerveError::InvalidConfig {
                details: "configuration root must be a map".to_string(),
            });
        };

        let raw_services = match root.remove("services") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map,
            Some(other) => {
                return Err(NerveError::InvalidConfig {
                    details: format!("services must be a map, got {}", type_name(&other)),
                });
            }
        };
        root.remove("service_conf_dir");

        let top: TopLevel = serde_json::from_value(Value::Object(root))?;
        let instance_id = top
            .instance_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| NerveError::InvalidConfig {
                details: "instance_id is required".to_string(),
            })?;

        if top.heartbeat_interval_ms == 0 {
            return Err(NerveError::InvalidConfig {
                details: "heartbeat_interval_ms must be positive".to_string(),
            });
        }
        if let Some(prom) = &top.prometheus {
            validate_buckets(&prom.main_loop_buckets())?;
        }

        let mut services = BTreeMap::new();
        let mut rejected_services = Vec::new();
        for (name, raw) in raw_services {
            match build_service(&name, raw, &instance_id) {
                Ok(spec) => {
                    services.insert(name, spec);
                }
                Err(reason) => rejected_services.push(RejectedService { name, reason }),
            }
        }

        Ok(Self {
            instance_id,
            services,
            prometheus: top.prometheus,
            statsd: top.statsd,
            heartbeat_path: top.heartbeat_path,
            settings: LoopSettings {
                heartbeat_interval: Duration::from_millis(top.heartbeat_interval_ms),
                relaunch_throttle: Duration::from_millis(top.relaunch_throttle_ms),
                watcher_stop_timeout: Duration::from_millis(top.watcher_stop_timeout_ms),
            },
            rejected_services,
            overlay_modified_time,
        })
    }

    /// Snapshot with the given services and defaults everywhere else.
    #[must_use]
    pub fn with_services(instance_id: &str, services: BTreeMap<String, ServiceSpec>) -> Self {
        let services = services
            .into_iter()
            .map(|(name, mut spec)| {
                spec.name.clone_from(&name);
                instance_id.clone_into(&mut spec.instance_id);
                (name, spec)
            })
            .collect();
        Self {
            instance_id: instance_id.to_string(),
            services,
            prometheus: None,
            statsd: None,
            heartbeat_path: None,
            settings: LoopSettings::default(),
            rejected_services: Vec::new(),
            overlay_modified_time: None,
        }
    }
}

fn build_service(name: &str, raw: Value, instance_id: &str) -> std::result::Result<ServiceSpec, String> {
    let Value::Object(mut fields) = raw else {
        return Err(format!("service entry must be a map, got {}", type_name(&raw)));
    };
    fields.insert("name".to_string(), Value::String(name.to_string()));
    fields.insert(
        "instance_id".to_string(),
        Value::String(instance_id.to_string()),
    );
    let spec: ServiceSpec =
        serde_json::from_value(Value::Object(fields)).map_err(|e| e.to_string())?;
    spec.validate()?;
    Ok(spec)
}

fn validate_buckets(buckets: &[f64]) -> Result<()> {
    if buckets.is_empty() {
        return Err(NerveError::InvalidConfig {
            details: "histogram buckets must not be empty".to_string(),
        });
    }
    if buckets.windows(2).any(|pair| pair[0] >= pair[1]) {
        return Err(NerveError::InvalidConfig {
            details: format!("histogram buckets must be strictly increasing: {buckets:?}"),
        });
    }
    Ok(())
}

const fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}
