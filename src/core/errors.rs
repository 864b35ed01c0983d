//! NRV-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, NerveError>;

/// Top-level error type for the nerve agent.
#[derive(Debug, Error)]
pub enum NerveError {
    #[error("[NRV-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[NRV-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[NRV-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[NRV-1005] cannot read configuration at {path}: {source}")]
    UnreadableConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[NRV-1004] invalid service {service}: {details}")]
    InvalidService { service: String, details: String },

    #[error("[NRV-2001] watcher {key} failed to start: {details}")]
    WatcherStart { key: String, details: String },

    #[error("[NRV-2002] watcher {key} failed to stop: {details}")]
    WatcherStop { key: String, details: String },

    #[error("[NRV-2003] watcher {key} timed out during {operation} after {timeout:?}")]
    WatcherTimeout {
        key: String,
        operation: &'static str,
        timeout: Duration,
    },

    #[error("[NRV-2101] report failure for {key}: {details}")]
    Report { key: String, details: String },

    #[error("[NRV-2201] metrics exporter failure: {details}")]
    MetricsExporter { details: String },

    #[error("[NRV-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[NRV-3900] runtime failure: {details}")]
    Runtime { details: String },

    #[error("[NRV-3901] internal invariant violated: {details}")]
    Invariant { details: String },
}

impl NerveError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "NRV-1001",
            Self::MissingConfig { .. } => "NRV-1002",
            Self::ConfigParse { .. } => "NRV-1003",
            Self::InvalidService { .. } => "NRV-1004",
            Self::UnreadableConfig { .. } => "NRV-1005",
            Self::WatcherStart { .. } => "NRV-2001",
            Self::WatcherStop { .. } => "NRV-2002",
            Self::WatcherTimeout { .. } => "NRV-2003",
            Self::Report { .. } => "NRV-2101",
            Self::MetricsExporter { .. } => "NRV-2201",
            Self::Io { .. } => "NRV-3002",
            Self::Runtime { .. } => "NRV-3900",
            Self::Invariant { .. } => "NRV-3901",
        }
    }

    /// Whether retrying might resolve the failure.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::WatcherStart { .. }
                | Self::WatcherStop { .. }
                | Self::WatcherTimeout { .. }
                | Self::Report { .. }
                | Self::MetricsExporter { .. }
                | Self::Io { .. }
                | Self::Runtime { .. }
        )
    }

    /// Whether the failure must terminate the process rather than be isolated.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfig { .. }
                | Self::MissingConfig { .. }
                | Self::ConfigParse { .. }
                | Self::UnreadableConfig { .. }
                | Self::Invariant { .. }
        )
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

impl From<serde_json::Error> for NerveError {
    fn from(value: serde_json::Error) -> Self {
        Self::ConfigParse {
            context: "json",
            details: value.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for NerveError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::ConfigParse {
            context: "yaml",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for NerveError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}

impl From<prometheus::Error> for NerveError {
    fn from(value: prometheus::Error) -> Self {
        Self::MetricsExporter {
            details: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_variants() -> Vec<NerveError> {
        vec![
            NerveError::InvalidConfig {
                details: String::new(),
            },
            NerveError::MissingConfig {
                path: PathBuf::new(),
            },
            NerveError::ConfigParse {
                context: "",
                details: String::new(),
            },
            NerveError::InvalidService {
                service: String::new(),
                details: String::new(),
            },
            NerveError::UnreadableConfig {
                path: PathBuf::new(),
                source: std::io::Error::other("test"),
            },
            NerveError::WatcherStart {
                key: String::new(),
                details: String::new(),
            },
            NerveError::WatcherStop {
                key: String::new(),
                details: String::new(),
            },
            NerveError::WatcherTimeout {
                key: String::new(),
                operation: "stop",
                timeout: Duration::from_secs(1),
            },
            NerveError::Report {
                key: String::new(),
                details: String::new(),
            },
            NerveError::MetricsExporter {
                details: String::new(),
            },
            NerveError::Io {
                path: PathBuf::new(),
                source: std::io::Error::other("test"),
            },
            NerveError::Runtime {
                details: String::new(),
            },
            NerveError::Invariant {
                details: String::new(),
            },
        ]
    }

    #[test]
    fn error_codes_are_unique() {
        let errors = all_variants();
        let codes: Vec<&str> = errors.iter().map(NerveError::code).collect();
        let unique: std::collections::HashSet<&&str> = codes.iter().collect();
        assert_eq!(
            codes.len(),
            unique.len(),
            "error codes must be unique: {codes:?}"
        );
    }

    #[test]
    fn error_display_includes_code() {
        for err in all_variants() {
            let msg = err.to_string();
            assert!(
                msg.contains(err.code()),
                "display should contain error code {}: {msg}",
                err.code()
            );
        }
    }

    #[test]
    fn fatal_and_retryable_are_disjoint() {
        for err in all_variants() {
            assert!(
                !(err.is_fatal() && err.is_retryable()),
                "{} cannot be both fatal and retryable",
                err.code()
            );
        }
        assert!(
            NerveError::ConfigParse {
                context: "yaml",
                details: String::new()
            }
            .is_fatal()
        );
        assert!(
            !NerveError::InvalidService {
                service: "svc".to_string(),
                details: String::new()
            }
            .is_fatal()
        );
    }

    #[test]
    fn io_convenience_constructor() {
        let err = NerveError::io(
            "/etc/nerve/nerve.yaml",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert_eq!(err.code(), "NRV-3002");
        assert!(err.to_string().contains("/etc/nerve/nerve.yaml"));
    }

    #[test]
    fn from_parser_errors() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        assert_eq!(NerveError::from(json_err).code(), "NRV-1003");

        let yaml_err = serde_yaml::from_str::<serde_json::Value>("a: [unclosed").unwrap_err();
        assert_eq!(NerveError::from(yaml_err).code(), "NRV-1003");

        let toml_err = toml::from_str::<toml::Value>("= invalid").unwrap_err();
        assert_eq!(NerveError::from(toml_err).code(), "NRV-1003");
    }
}
