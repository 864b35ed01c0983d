//! Telemetry sinks: the loop and the watchers emit semantic metric events;
//! exporters decide how they leave the process.
//!
//! [`NerveMetrics`] is the production sink. It owns at most one Prometheus
//! exporter (pull, `/metrics` over HTTP) and at most one StatsD client (push,
//! UDP), both reconfigurable at runtime and safe to update from any thread.

pub mod memory;
pub mod prometheus;
pub mod statsd;

use std::time::Instant;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::core::clock::Clock;
use crate::core::config::{NerveConfig, PrometheusConfig, StatsdConfig};
use crate::core::errors::Result;
use crate::metrics::prometheus::PrometheusExporter;
use crate::metrics::statsd::StatsdClient;

/// Metric names. These are wire format: dashboards and alerts key on them.
pub mod names {
    pub const WATCHERS_DESIRED: &str = "nerve_watchers_desired";
    pub const WATCHERS_RUNNING: &str = "nerve_watchers_running";
    pub const WATCHERS_UP: &str = "nerve_watchers_up";
    pub const WATCHERS_DOWN: &str = "nerve_watchers_down";
    pub const REPEATED_REPORT_FAILURES_MAX: &str = "nerve_repeated_report_failures_max";
    pub const BUILD_INFO: &str = "nerve_build_info";

    pub const WATCHER_LAUNCHES_TOTAL: &str = "nerve_watcher_launches_total";
    pub const WATCHER_STOPS_TOTAL: &str = "nerve_watcher_stops_total";
    pub const WATCHER_THROTTLED_TOTAL: &str = "nerve_watcher_throttled_total";
    pub const CONFIG_RELOADS_TOTAL: &str = "nerve_config_reloads_total";
    pub const SERVICE_CONFIG_ERRORS_TOTAL: &str = "nerve_service_config_errors_total";
    pub const REPORT_RESULTS_TOTAL: &str = "nerve_report_results_total";
    pub const REPORTER_PING_RESULTS_TOTAL: &str = "nerve_reporter_ping_results_total";

    pub const MAIN_LOOP_DURATION_SECONDS: &str = "nerve_main_loop_duration_seconds";

    pub const GAUGES: &[&str] = &[
        WATCHERS_DESIRED,
        WATCHERS_RUNNING,
        WATCHERS_UP,
        WATCHERS_DOWN,
        REPEATED_REPORT_FAILURES_MAX,
        BUILD_INFO,
    ];
    pub const COUNTERS: &[&str] = &[
        WATCHER_LAUNCHES_TOTAL,
        WATCHER_STOPS_TOTAL,
        WATCHER_THROTTLED_TOTAL,
        CONFIG_RELOADS_TOTAL,
        SERVICE_CONFIG_ERRORS_TOTAL,
        REPORT_RESULTS_TOTAL,
        REPORTER_PING_RESULTS_TOTAL,
    ];
    pub const HISTOGRAMS: &[&str] = &[MAIN_LOOP_DURATION_SECONDS];

    /// Whether `name` is one of the metrics this crate defines.
    #[must_use]
    pub fn is_known(name: &str) -> bool {
        GAUGES.contains(&name) || COUNTERS.contains(&name) || HISTOGRAMS.contains(&name)
    }
}

/// Metric label pairs, in any order.
pub type Labels<'a> = [(&'a str, &'a str)];

/// Exporter settings taken from one configuration snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsOptions {
    pub prometheus: Option<PrometheusConfig>,
    pub statsd: Option<StatsdConfig>,
}

impl MetricsOptions {
    #[must_use]
    pub fn from_config(config: &NerveConfig) -> Self {
        Self {
            prometheus: config.prometheus.clone(),
            statsd: config.statsd.clone(),
        }
    }
}

/// Where telemetry goes.
///
/// Every update method silently ignores metric names it does not know, so
/// older sinks keep working when new metrics are emitted.
pub trait MetricsSink: Send + Sync {
    fn increment(&self, name: &str, labels: &Labels<'_>, by: u64);
    fn set_gauge(&self, name: &str, value: f64, labels: &Labels<'_>);
    fn observe(&self, name: &str, value: f64, labels: &Labels<'_>);
    /// Apply exporter settings. Idempotent for unchanged settings.
    fn configure(&self, options: &MetricsOptions) -> Result<()>;
    /// Release any bound network resource.
    fn shutdown(&self);
}

/// Run `f`, recording its duration in seconds as an observation of `name`.
pub fn timed<T>(
    sink: &dyn MetricsSink,
    clock: &dyn Clock,
    name: &str,
    labels: &Labels<'_>,
    f: impl FnOnce() -> T,
) -> T {
    let start = clock.now();
    let result = f();
    sink.observe(name, seconds_since(clock, start), labels);
    result
}

pub(crate) fn seconds_since(clock: &dyn Clock, start: Instant) -> f64 {
    clock.now().saturating_duration_since(start).as_secs_f64()
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn increment(&self, _name: &str, _labels: &Labels<'_>, _by: u64) {}
    fn set_gauge(&self, _name: &str, _value: f64, _labels: &Labels<'_>) {}
    fn observe(&self, _name: &str, _value: f64, _labels: &Labels<'_>) {}
    fn configure(&self, _options: &MetricsOptions) -> Result<()> {
        Ok(())
    }
    fn shutdown(&self) {}
}

/// Production sink fanning out to the configured exporters.
pub struct NerveMetrics {
    prometheus: RwLock<Option<PrometheusExporter>>,
    statsd: RwLock<Option<StatsdClient>>,
}

impl NerveMetrics {
    /// A sink with every exporter disabled.
    #[must_use]
    pub fn new() -> Self {
        Self {
            prometheus: RwLock::new(None),
            statsd: RwLock::new(None),
        }
    }

    #[must_use]
    pub fn prometheus_enabled(&self) -> bool {
        self.prometheus.read().is_some()
    }

    #[must_use]
    pub fn statsd_enabled(&self) -> bool {
        self.statsd.read().is_some()
    }

    /// Address the `/metrics` endpoint is actually bound to.
    #[must_use]
    pub fn prometheus_local_addr(&self) -> Option<std::net::SocketAddr> {
        self.prometheus
            .read()
            .as_ref()
            .and_then(PrometheusExporter::local_addr)
    }

    /// Current exposition text, if the Prometheus exporter is enabled.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.prometheus.read().as_ref().map(PrometheusExporter::render)
    }

    fn configure_prometheus(&self, desired: Option<&PrometheusConfig>) -> Result<()> {
        let mut slot = self.prometheus.write();
        let unchanged = match (slot.as_ref(), desired) {
            (None, None) => true,
            (Some(current), Some(cfg)) => current.config() == cfg,
            _ => false,
        };
        if unchanged {
            return Ok(());
        }

        if let Some(mut old) = slot.take() {
            info!("stopping prometheus metrics exporter");
            old.shutdown();
        }
        if let Some(cfg) = desired {
            let exporter = PrometheusExporter::start(cfg)?;
            info!(endpoint = %cfg.endpoint(), "prometheus metrics enabled on /metrics");
            *slot = Some(exporter);
        }
        Ok(())
    }

    fn configure_statsd(&self, desired: Option<&StatsdConfig>) -> Result<()> {
        let mut slot = self.statsd.write();
        let unchanged = match (slot.as_ref(), desired) {
            (None, None) => true,
            (Some(current), Some(cfg)) => current.config() == cfg,
            _ => false,
        };
        if unchanged {
            return Ok(());
        }

        *slot = None;
        if let Some(cfg) = desired {
            info!(host = %cfg.host, port = cfg.port, "configuring statsd");
            *slot = Some(StatsdClient::connect(cfg)?);
        }
        Ok(())
    }
}

impl Default for NerveMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSink for NerveMetrics {
    fn increment(&self, name: &str, labels: &Labels<'_>, by: u64) {
        if !names::is_known(name) {
            return;
        }
        if let Some(prom) = self.prometheus.read().as_ref() {
            prom.increment(name, labels, by);
        }
        if let Some(statsd) = self.statsd.read().as_ref() {
            statsd.count(name, by, labels);
        }
    }

    fn set_gauge(&self, name: &str, value: f64, labels: &Labels<'_>) {
        if !names::is_known(name) {
            return;
        }
        if let Some(prom) = self.prometheus.read().as_ref() {
            prom.set_gauge(name, value, labels);
        }
        if let Some(statsd) = self.statsd.read().as_ref() {
            statsd.gauge(name, value, labels);
        }
    }

    fn observe(&self, name: &str, value: f64, labels: &Labels<'_>) {
        if !names::is_known(name) {
            return;
        }
        if let Some(prom) = self.prometheus.read().as_ref() {
            prom.observe(name, value, labels);
        }
        if let Some(statsd) = self.statsd.read().as_ref() {
            statsd.histogram(name, value, labels);
        }
    }

    fn configure(&self, options: &MetricsOptions) -> Result<()> {
        let prometheus = options.prometheus.as_ref().filter(|p| p.enabled);
        let prom_result = self.configure_prometheus(prometheus);
        let statsd_result = self.configure_statsd(options.statsd.as_ref());
        if let Err(e) = &statsd_result {
            warn!(error = %e, "statsd configuration failed");
        }
        prom_result.and(statsd_result)
    }

    fn shutdown(&self) {
        if let Some(mut prom) = self.prometheus.write().take() {
            prom.shutdown();
        }
        self.statsd.write().take();
    }
}
