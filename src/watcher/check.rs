//! Health checks a watcher runs each cycle.

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use crate::core::config::{CheckSpec, ServiceSpec};
use crate::core::errors::{NerveError, Result};

/// One probe against a service endpoint.
pub trait Check: Send {
    /// Human-readable target, used in logs.
    fn describe(&self) -> String;
    /// Run the probe, returning its latency on success.
    fn run(&self) -> std::result::Result<Duration, String>;
}

/// Succeeds when a TCP connection can be opened within `timeout`.
#[derive(Debug, Clone)]
pub struct TcpCheck {
    host: String,
    port: u16,
    timeout: Duration,
}

impl TcpCheck {
    #[must_use]
    pub fn new(host: &str, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.to_string(),
            port,
            timeout,
        }
    }

    fn resolve(&self) -> std::result::Result<Vec<SocketAddr>, String> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map(Iterator::collect)
            .map_err(|e| format!("cannot resolve {}: {e}", self.describe()))
    }
}

impl Check for TcpCheck {
    fn describe(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }

    fn run(&self) -> std::result::Result<Duration, String> {
        let addrs = self.resolve()?;
        let start = Instant::now();
        let mut last_err = format!("{} resolved to no addresses", self.describe());
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(_) => return Ok(start.elapsed()),
                Err(e) => last_err = format!("{addr}: {e}"),
            }
        }
        Err(last_err)
    }
}

/// Instantiate every check a service declares. Checks without an explicit
/// target probe the service's own host and port.
pub fn build_checks(spec: &ServiceSpec) -> Result<Vec<Box<dyn Check>>> {
    spec.checks
        .iter()
        .map(|check| {
            let CheckSpec::Tcp {
                host,
                port,
                timeout,
            } = check;
            let timeout =
                Duration::try_from_secs_f64(*timeout).map_err(|e| NerveError::InvalidService {
                    service: spec.name.clone(),
                    details: format!("check timeout {timeout}: {e}"),
                })?;
            let host = host.as_deref().unwrap_or(&spec.host);
            let port = port.unwrap_or(spec.port);
            Ok(Box::new(TcpCheck::new(host, port, timeout)) as Box<dyn Check>)
        })
        .collect()
}
