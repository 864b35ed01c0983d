//! Reporters publish a watcher's up/down transitions to a registry.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use tracing::info;

use crate::core::config::{ReporterKind, ServiceSpec};
use crate::core::errors::{NerveError, Result};

/// Registry client owned by one watcher.
pub trait Reporter: Send {
    fn start(&mut self) -> Result<()>;
    fn report_up(&mut self) -> Result<()>;
    fn report_down(&mut self) -> Result<()>;
    /// Cheap liveness probe of the registry connection.
    fn ping(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
}

/// Build the reporter a service asks for.
pub fn build_reporter(key: &str, spec: &ServiceSpec) -> Result<Box<dyn Reporter>> {
    match spec.reporter_type {
        ReporterKind::Log => Ok(Box::new(LogReporter::new(key, spec))),
        ReporterKind::File => {
            let dir = spec
                .reporter_dir
                .clone()
                .ok_or_else(|| NerveError::InvalidService {
                    service: spec.name.clone(),
                    details: "reporter_type `file` requires reporter_dir".to_string(),
                })?;
            Ok(Box::new(FileReporter::new(key, spec, dir)))
        }
    }
}

// ──────────────────── log reporter ────────────────────

/// Records transitions in the log only.
#[derive(Debug)]
pub struct LogReporter {
    key: String,
    endpoint: String,
}

impl LogReporter {
    #[must_use]
    pub fn new(key: &str, spec: &ServiceSpec) -> Self {
        Self {
            key: key.to_string(),
            endpoint: format!("{}:{}", spec.host, spec.port),
        }
    }
}

impl Reporter for LogReporter {
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn report_up(&mut self) -> Result<()> {
        info!(key = %self.key, endpoint = %self.endpoint, "service is up");
        Ok(())
    }

    fn report_down(&mut self) -> Result<()> {
        info!(key = %self.key, endpoint = %self.endpoint, "service is down");
        Ok(())
    }

    fn ping(&mut self) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}

// ──────────────────── file reporter ────────────────────

/// Registration record written while a service is up.
#[derive(Debug, Clone, Serialize)]
pub struct Registration {
    pub instance_id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub weight: Option<u32>,
    pub labels: BTreeMap<String, String>,
    pub reported_at: String,
}

/// Writes `<dir>/<key>.json` while up and removes it otherwise.
#[derive(Debug)]
pub struct FileReporter {
    key: String,
    dir: PathBuf,
    path: PathBuf,
    template: Registration,
}

impl FileReporter {
    #[must_use]
    pub fn new(key: &str, spec: &ServiceSpec, dir: PathBuf) -> Self {
        let path = dir.join(format!("{key}.json"));
        Self {
            key: key.to_string(),
            dir,
            path,
            template: Registration {
                instance_id: spec.instance_id.clone(),
                name: spec.name.clone(),
                host: spec.host.clone(),
                port: spec.port,
                weight: spec.weight,
                labels: spec.labels.clone(),
                reported_at: String::new(),
            },
        }
    }

    #[must_use]
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn report_err(&self, details: String) -> NerveError {
        NerveError::Report {
            key: self.key.clone(),
            details,
        }
    }

    fn remove_record(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(NerveError::io(&self.path, e)),
        }
    }
}

impl Reporter for FileReporter {
    fn start(&mut self) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| NerveError::io(&self.dir, e))
    }

    fn report_up(&mut self) -> Result<()> {
        let mut record = self.template.clone();
        record.reported_at = Utc::now().to_rfc3339();
        let body = serde_json::to_vec_pretty(&record)
            .map_err(|e| self.report_err(format!("encode registration: {e}")))?;

        let tmp = self.dir.join(format!(".{}.json.tmp", self.key));
        fs::write(&tmp, body).map_err(|e| NerveError::io(&tmp, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| NerveError::io(&self.path, e))
    }

    fn report_down(&mut self) -> Result<()> {
        self.remove_record()
    }

    fn ping(&mut self) -> Result<()> {
        if self.dir.is_dir() {
            Ok(())
        } else {
            Err(self.report_err(format!(
                "registry directory {} is missing",
                self.dir.display()
            )))
        }
    }

    fn stop(&mut self) -> Result<()> {
        self.remove_record()
    }
}
