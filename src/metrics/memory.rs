//! In-process sink that records every event so behaviour can be asserted
//! without a network exporter.

#![allow(missing_docs)]

use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::core::errors::Result;
use crate::metrics::{names, Labels, MetricsOptions, MetricsSink};

type SeriesKey = (String, Vec<(String, String)>);

#[derive(Debug, Default)]
struct Recorded {
    counters: BTreeMap<SeriesKey, u64>,
    gauges: BTreeMap<SeriesKey, f64>,
    observations: BTreeMap<String, Vec<f64>>,
    configured: Vec<MetricsOptions>,
    shutdowns: usize,
}

/// Recording sink. Label order does not matter.
#[derive(Debug, Default)]
pub struct MemorySink {
    inner: Mutex<Recorded>,
}

fn series(name: &str, labels: &Labels<'_>) -> SeriesKey {
    let mut pairs: Vec<(String, String)> = labels
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect();
    pairs.sort();
    (name.to_string(), pairs)
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter value for one labelled series (0 when never incremented).
    #[must_use]
    pub fn counter(&self, name: &str, labels: &Labels<'_>) -> u64 {
        self.inner
            .lock()
            .counters
            .get(&series(name, labels))
            .copied()
            .unwrap_or(0)
    }

    /// Sum of a counter across all label values.
    #[must_use]
    pub fn counter_total(&self, name: &str) -> u64 {
        self.inner
            .lock()
            .counters
            .iter()
            .filter(|((n, _), _)| n == name)
            .map(|(_, v)| *v)
            .sum()
    }

    #[must_use]
    pub fn gauge(&self, name: &str, labels: &Labels<'_>) -> Option<f64> {
        self.inner.lock().gauges.get(&series(name, labels)).copied()
    }

    #[must_use]
    pub fn observations(&self, name: &str) -> Vec<f64> {
        self.inner
            .lock()
            .observations
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// Every options value passed to `configure`, oldest first.
    #[must_use]
    pub fn configured(&self) -> Vec<MetricsOptions> {
        self.inner.lock().configured.clone()
    }

    #[must_use]
    pub fn shutdowns(&self) -> usize {
        self.inner.lock().shutdowns
    }
}

impl MetricsSink for MemorySink {
    fn increment(&self, name: &str, labels: &Labels<'_>, by: u64) {
        if names::is_known(name) {
            *self
                .inner
                .lock()
                .counters
                .entry(series(name, labels))
                .or_insert(0) += by;
        }
    }

    fn set_gauge(&self, name: &str, value: f64, labels: &Labels<'_>) {
        if names::is_known(name) {
            self.inner.lock().gauges.insert(series(name, labels), value);
        }
    }

    fn observe(&self, name: &str, value: f64, _labels: &Labels<'_>) {
        if names::is_known(name) {
            self.inner
                .lock()
                .observations
                .entry(name.to_string())
                .or_default()
                .push(value);
        }
    }

    fn configure(&self, options: &MetricsOptions) -> Result<()> {
        self.inner.lock().configured.push(options.clone());
        Ok(())
    }

    fn shutdown(&self) {
        self.inner.lock().shutdowns += 1;
    }
}
