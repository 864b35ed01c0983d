//! StatsD push client emitting DogStatsD-tagged lines over UDP.

use std::fmt::Write as _;
use std::net::UdpSocket;

use tracing::trace;

use crate::core::config::StatsdConfig;
use crate::core::errors::{NerveError, Result};
use crate::metrics::Labels;

/// Fire-and-forget UDP client. Send failures are dropped.
#[derive(Debug)]
pub struct StatsdClient {
    config: StatsdConfig,
    socket: UdpSocket,
}

impl StatsdClient {
    pub fn connect(config: &StatsdConfig) -> Result<Self> {
        let target = format!("{}:{}", config.host, config.port);
        let socket = UdpSocket::bind("0.0.0.0:0").map_err(|e| NerveError::MetricsExporter {
            details: format!("statsd socket: {e}"),
        })?;
        socket
            .connect(&target)
            .map_err(|e| NerveError::MetricsExporter {
                details: format!("statsd target {target}: {e}"),
            })?;
        Ok(Self {
            config: config.clone(),
            socket,
        })
    }

    #[must_use]
    pub fn config(&self) -> &StatsdConfig {
        &self.config
    }

    pub fn count(&self, name: &str, by: u64, labels: &Labels<'_>) {
        self.send(&format_line(name, &by.to_string(), "c", labels));
    }

    pub fn gauge(&self, name: &str, value: f64, labels: &Labels<'_>) {
        self.send(&format_line(name, &value.to_string(), "g", labels));
    }

    pub fn histogram(&self, name: &str, value: f64, labels: &Labels<'_>) {
        self.send(&format_line(name, &value.to_string(), "h", labels));
    }

    fn send(&self, line: &str) {
        if let Err(e) = self.socket.send(line.as_bytes()) {
            trace!(error = %e, "statsd send dropped");
        }
    }
}

/// `name:value|kind` with an optional `|#k:v,k:v` tag suffix.
pub fn format_line(name: &str, value: &str, kind: &str, labels: &Labels<'_>) -> String {
    let mut line = format!("{name}:{value}|{kind}");
    if !labels.is_empty() {
        line.push_str("|#");
        for (i, (k, v)) in labels.iter().enumerate() {
            if i > 0 {
                line.push(',');
            }
            let _ = write!(line, "{k}:{v}");
        }
    }
    line
}
