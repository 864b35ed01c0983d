//! Per-iteration census of supervisor state, published as gauges.

#![allow(clippy::cast_precision_loss)]

use crate::daemon::supervisor::Supervisor;
use crate::metrics::{MetricsSink, names};

/// Point-in-time watcher counts. Computing one never mutates a handle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatcherCensus {
    pub desired: usize,
    pub running: usize,
    pub up: usize,
    pub down: usize,
    /// Worst consecutive report failure count across running watchers.
    pub max_repeated_report_failures: u64,
}

impl WatcherCensus {
    #[must_use]
    pub fn collect(supervisor: &Supervisor) -> Self {
        let mut census = Self {
            desired: supervisor.desired().len(),
            ..Self::default()
        };
        for handle in supervisor.handles() {
            census.running += 1;
            if handle.was_up() {
                census.up += 1;
            } else {
                census.down += 1;
            }
            census.max_repeated_report_failures = census
                .max_repeated_report_failures
                .max(handle.repeated_report_failures());
        }
        census
    }

    pub fn publish(&self, sink: &dyn MetricsSink) {
        sink.set_gauge(names::WATCHERS_DESIRED, self.desired as f64, &[]);
        sink.set_gauge(names::WATCHERS_RUNNING, self.running as f64, &[]);
        sink.set_gauge(names::WATCHERS_UP, self.up as f64, &[]);
        sink.set_gauge(names::WATCHERS_DOWN, self.down as f64, &[]);
        sink.set_gauge(
            names::REPEATED_REPORT_FAILURES_MAX,
            self.max_repeated_report_failures as f64,
            &[],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::memory::MemorySink;

    #[test]
    fn publish_sets_every_gauge() {
        let sink = MemorySink::new();
        let census = WatcherCensus {
            desired: 4,
            running: 3,
            up: 2,
            down: 1,
            max_repeated_report_failures: 7,
        };
        census.publish(&sink);
        assert_eq!(sink.gauge(names::WATCHERS_DESIRED, &[]), Some(4.0));
        assert_eq!(sink.gauge(names::WATCHERS_RUNNING, &[]), Some(3.0));
        assert_eq!(sink.gauge(names::WATCHERS_UP, &[]), Some(2.0));
        assert_eq!(sink.gauge(names::WATCHERS_DOWN, &[]), Some(1.0));
        assert_eq!(sink.gauge(names::REPEATED_REPORT_FAILURES_MAX, &[]), Some(7.0));
    }
}
