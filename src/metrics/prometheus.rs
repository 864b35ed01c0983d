//! Prometheus pull exporter: a private registry plus a `/metrics` endpoint
//! served from its own thread.

#![allow(missing_docs)]

use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener};
use std::thread::JoinHandle;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::core::config::PrometheusConfig;
use crate::core::errors::{NerveError, Result};
use crate::metrics::names;
use crate::metrics::Labels;

const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

// ──────────────────── metric catalogue ────────────────────

const GAUGE_DEFS: &[(&str, &str, &[&str])] = &[
    (names::WATCHERS_DESIRED, "Watchers the current configuration asks for", &[]),
    (names::WATCHERS_RUNNING, "Watchers currently held by the supervisor", &[]),
    (names::WATCHERS_UP, "Running watchers whose service is up", &[]),
    (names::WATCHERS_DOWN, "Running watchers whose service is down", &[]),
    (
        names::REPEATED_REPORT_FAILURES_MAX,
        "Highest consecutive report failure count across watchers",
        &[],
    ),
    (names::BUILD_INFO, "Build information", &["version"]),
];

const COUNTER_DEFS: &[(&str, &str, &[&str])] = &[
    (names::WATCHER_LAUNCHES_TOTAL, "Watcher launches", &["reason"]),
    (names::WATCHER_STOPS_TOTAL, "Watcher stops", &["reason"]),
    (
        names::WATCHER_THROTTLED_TOTAL,
        "Relaunches deferred by the relaunch throttle",
        &[],
    ),
    (names::CONFIG_RELOADS_TOTAL, "Configuration reloads", &[]),
    (
        names::SERVICE_CONFIG_ERRORS_TOTAL,
        "Services rejected during configuration load",
        &[],
    ),
    (
        names::REPORT_RESULTS_TOTAL,
        "Registry report attempts",
        &["action", "result"],
    ),
    (
        names::REPORTER_PING_RESULTS_TOTAL,
        "Registry liveness pings",
        &["result"],
    ),
];

/// Registry plus the HTTP server exposing it.
pub struct PrometheusExporter {
    config: PrometheusConfig,
    registry: Registry,
    counters: HashMap<&'static str, IntCounterVec>,
    gauges: HashMap<&'static str, GaugeVec>,
    histograms: HashMap<&'static str, HistogramVec>,
    server: Option<MetricsServer>,
}

impl PrometheusExporter {
    /// Register every known metric and start serving on `config.endpoint()`.
    pub fn start(config: &PrometheusConfig) -> Result<Self> {
        let mut exporter = Self::unbound(config)?;
        exporter.server = Some(MetricsServer::bind(config, exporter.registry.clone())?);
        Ok(exporter)
    }

    /// Registry without a listening endpoint.
    pub fn unbound(config: &PrometheusConfig) -> Result<Self> {
        let registry = Registry::new();

        let mut counters = HashMap::new();
        for (name, help, labels) in COUNTER_DEFS {
            let vec = IntCounterVec::new(Opts::new(*name, *help), labels)?;
            registry.register(Box::new(vec.clone()))?;
            counters.insert(*name, vec);
        }

        let mut gauges = HashMap::new();
        for (name, help, labels) in GAUGE_DEFS {
            let vec = GaugeVec::new(Opts::new(*name, *help), labels)?;
            registry.register(Box::new(vec.clone()))?;
            gauges.insert(*name, vec);
        }

        let mut histograms = HashMap::new();
        let loop_duration = HistogramVec::new(
            HistogramOpts::new(
                names::MAIN_LOOP_DURATION_SECONDS,
                "Duration of one main loop iteration",
            )
            .buckets(config.main_loop_buckets()),
            &[],
        )?;
        registry.register(Box::new(loop_duration.clone()))?;
        histograms.insert(names::MAIN_LOOP_DURATION_SECONDS, loop_duration);

        if let Some(info) = gauges.get(names::BUILD_INFO) {
            info.with_label_values(&[env!("CARGO_PKG_VERSION")]).set(1.0);
        }

        Ok(Self {
            config: config.clone(),
            registry,
            counters,
            gauges,
            histograms,
            server: None,
        })
    }

    #[must_use]
    pub fn config(&self) -> &PrometheusConfig {
        &self.config
    }

    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(|s| s.local_addr)
    }

    pub fn increment(&self, name: &str, labels: &Labels<'_>, by: u64) {
        if let Some(vec) = self.counters.get(name) {
            match vec.get_metric_with(&label_map(labels)) {
                Ok(counter) => counter.inc_by(by),
                Err(e) => debug!(metric = name, error = %e, "counter label mismatch"),
            }
        }
    }

    pub fn set_gauge(&self, name: &str, value: f64, labels: &Labels<'_>) {
        if let Some(vec) = self.gauges.get(name) {
            match vec.get_metric_with(&label_map(labels)) {
                Ok(gauge) => gauge.set(value),
                Err(e) => debug!(metric = name, error = %e, "gauge label mismatch"),
            }
        }
    }

    pub fn observe(&self, name: &str, value: f64, labels: &Labels<'_>) {
        if let Some(vec) = self.histograms.get(name) {
            match vec.get_metric_with(&label_map(labels)) {
                Ok(histogram) => histogram.observe(value),
                Err(e) => debug!(metric = name, error = %e, "histogram label mismatch"),
            }
        }
    }

    /// Exposition text for the current registry contents.
    #[must_use]
    pub fn render(&self) -> String {
        render_registry(&self.registry)
    }

    /// Stop the endpoint and release its port. Idempotent.
    pub fn shutdown(&mut self) {
        if let Some(server) = self.server.take() {
            server.shutdown();
        }
    }
}

impl Drop for PrometheusExporter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn label_map<'a>(labels: &'a Labels<'a>) -> HashMap<&'a str, &'a str> {
    labels.iter().copied().collect()
}

fn render_registry(registry: &Registry) -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        warn!(error = %e, "failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

// ──────────────────── HTTP endpoint ────────────────────

async fn metrics_handler(State(registry): State<Registry>) -> Response {
    (
        StatusCode::OK,
        [("content-type", CONTENT_TYPE)],
        render_registry(&registry),
    )
        .into_response()
}

fn metrics_router(registry: Registry) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(registry)
}

/// `/metrics` server on a dedicated thread with its own single-threaded runtime.
struct MetricsServer {
    local_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    thread: JoinHandle<()>,
}

impl MetricsServer {
    /// Bind synchronously so address conflicts surface to the caller.
    fn bind(config: &PrometheusConfig, registry: Registry) -> Result<Self> {
        let endpoint = config.endpoint();
        let exporter_err = |details: String| NerveError::MetricsExporter { details };

        let listener = TcpListener::bind(&endpoint)
            .map_err(|e| exporter_err(format!("cannot bind {endpoint}: {e}")))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| exporter_err(format!("cannot configure {endpoint}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| exporter_err(format!("cannot resolve {endpoint}: {e}")))?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| exporter_err(format!("cannot build runtime: {e}")))?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let thread = std::thread::Builder::new()
            .name("nerve-metrics".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    let listener = match tokio::net::TcpListener::from_std(listener) {
                        Ok(listener) => listener,
                        Err(e) => {
                            warn!(error = %e, "metrics listener could not be registered");
                            return;
                        }
                    };
                    let served = axum::serve(listener, metrics_router(registry))
                        .with_graceful_shutdown(async move {
                            let _ = shutdown_rx.await;
                        })
                        .await;
                    if let Err(e) = served {
                        warn!(error = %e, "metrics server exited with error");
                    }
                });
            })
            .map_err(|e| exporter_err(format!("cannot spawn metrics thread: {e}")))?;

        Ok(Self {
            local_addr,
            shutdown_tx,
            thread,
        })
    }

    fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if self.thread.join().is_err() {
            warn!("metrics server thread panicked");
        }
    }
}
