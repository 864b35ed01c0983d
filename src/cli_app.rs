//! Top-level CLI definition and dispatch.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use nerve_agent::core::clock::MonotonicClock;
use nerve_agent::core::config::NerveConfig;
use nerve_agent::core::errors::NerveError;
use nerve_agent::core::source::{ConfigSource, FileConfigSource, SourceOptions};
use nerve_agent::daemon::loop_main::Orchestrator;
use nerve_agent::daemon::reconcile::expand;
use nerve_agent::daemon::signals::SignalHandler;
use nerve_agent::metrics::NerveMetrics;
use nerve_agent::watcher::service::ServiceWatcherFactory;

/// Nerve: keeps per-service health-check watchers in sync with configuration.
#[derive(Debug, Parser)]
#[command(name = "nerve", author, version, long_about = None)]
pub struct Cli {
    /// Main configuration file (YAML, JSON or TOML).
    #[arg(short = 'c', long, env = "NERVE_CONFIG", value_name = "PATH")]
    config: PathBuf,
    /// Overlay file deep-merged on top of the main config; reloaded when it changes.
    #[arg(short = 'o', long, env = "NERVE_CONFIG_OVERLAY", value_name = "PATH")]
    config_overlay: Option<PathBuf>,
    /// Instance id, overriding the config files.
    #[arg(short = 'i', long, env = "NERVE_INSTANCE_ID", value_name = "ID")]
    instance_id: Option<String>,
    /// Validate the configuration, print a summary and exit.
    #[arg(short = 'k', long, env = "NERVE_CHECK_CONFIG")]
    check_config: bool,
    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
}

/// CLI failures, each mapped to a process exit code.
#[derive(Debug, Error)]
pub enum CliError {
    /// Configuration is missing or invalid.
    #[error("{0}")]
    Config(NerveError),
    /// The agent failed while running.
    #[error("{0}")]
    Runtime(NerveError),
    /// Output write failed.
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 1,
            Self::Runtime(_) | Self::Io(_) => 2,
        }
    }
}

impl From<NerveError> for CliError {
    fn from(value: NerveError) -> Self {
        if value.is_fatal() {
            Self::Config(value)
        } else {
            Self::Runtime(value)
        }
    }
}

/// Install the global tracing subscriber. `RUST_LOG` wins; default `info`.
pub fn init_logging(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr);
    if cli.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

pub fn run(cli: &Cli) -> Result<(), CliError> {
    let source = FileConfigSource::open(SourceOptions {
        config_path: cli.config.clone(),
        overlay_path: cli.config_overlay.clone(),
        instance_id: cli.instance_id.clone(),
    })?;

    if cli.check_config {
        return check_config(&source.config());
    }

    let sink = Arc::new(NerveMetrics::new());
    let factory = ServiceWatcherFactory::new(sink.clone());
    let mut orchestrator = Orchestrator::new(
        Box::new(source),
        Box::new(factory),
        sink,
        Arc::new(MonotonicClock),
        SignalHandler::new(),
    );
    orchestrator.run()?;
    Ok(())
}

/// Print what the configuration would run. Any rejected service fails the check.
fn check_config(config: &NerveConfig) -> Result<(), CliError> {
    let expansion = expand(&config.services);
    let mut out = io::stdout().lock();

    writeln!(out, "instance_id: {}", config.instance_id)?;
    writeln!(out, "services: {}", config.services.len())?;
    for (key, spec) in &expansion.specs {
        writeln!(out, "  {key} -> {}:{}", spec.host, spec.port)?;
    }
    let prometheus = config
        .prometheus
        .as_ref()
        .filter(|p| p.enabled)
        .map_or_else(|| "disabled".to_string(), |p| p.endpoint());
    writeln!(out, "prometheus: {prometheus}")?;
    let statsd = config
        .statsd
        .as_ref()
        .map_or_else(|| "disabled".to_string(), |s| format!("{}:{}", s.host, s.port));
    writeln!(out, "statsd: {statsd}")?;

    let rejected: Vec<String> = config
        .rejected_services
        .iter()
        .chain(&expansion.rejected)
        .map(|r| format!("{}: {}", r.name, r.reason))
        .collect();
    if rejected.is_empty() {
        writeln!(out, "config ok")?;
        return Ok(());
    }
    for line in &rejected {
        writeln!(out, "  rejected {line}")?;
    }
    Err(CliError::Config(NerveError::InvalidConfig {
        details: format!("{} service(s) rejected", rejected.len()),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn short_flags_parse() {
        let cli = Cli::try_parse_from([
            "nerve", "-c", "/etc/nerve.yaml", "-o", "/etc/overlay.yaml", "-i", "host-1", "-k",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("/etc/nerve.yaml"));
        assert_eq!(cli.config_overlay, Some(PathBuf::from("/etc/overlay.yaml")));
        assert_eq!(cli.instance_id.as_deref(), Some("host-1"));
        assert!(cli.check_config);
        assert!(!cli.log_json);
    }

    #[test]
    fn config_errors_map_to_exit_one() {
        let err = CliError::from(NerveError::MissingConfig {
            path: PathBuf::from("/nope"),
        });
        assert_eq!(err.exit_code(), 1);
        let err = CliError::from(NerveError::Runtime {
            details: "x".to_string(),
        });
        assert_eq!(err.exit_code(), 2);
    }
}
