//! Configuration sources: where snapshots come from and when they go stale.
//!
//! `FileConfigSource` reads the main file (YAML, JSON or TOML by extension),
//! folds in `service_conf_dir` entries, deep-merges an optional overlay file
//! on top, applies the instance-id override, and only then validates the
//! result into a typed [`NerveConfig`].

#![allow(missing_docs)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use serde_json::{Map, Value};

use crate::core::config::NerveConfig;
use crate::core::errors::{NerveError, Result};

/// Yields immutable configuration snapshots plus an overlay-freshness signal.
pub trait ConfigSource {
    /// Latest snapshot. Side-effect-free between reloads.
    fn config(&self) -> Arc<NerveConfig>;

    /// Re-read configuration. A failure here is fatal to the caller.
    fn reload(&mut self) -> Result<()>;

    /// Current overlay mtime; `None` when no overlay is set or the file is absent.
    fn overlay_modified_time(&self) -> Option<SystemTime>;
}

/// Where the file source reads from.
#[derive(Debug, Clone, Default)]
pub struct SourceOptions {
    pub config_path: PathBuf,
    pub overlay_path: Option<PathBuf>,
    /// Wins over both the main file and the overlay.
    pub instance_id: Option<String>,
}

/// File-backed configuration source.
pub struct FileConfigSource {
    options: SourceOptions,
    current: Arc<NerveConfig>,
    overlay_missing_warned: bool,
}

impl FileConfigSource {
    /// Build the source and perform the initial load.
    pub fn open(options: SourceOptions) -> Result<Self> {
        let mut source = Self {
            options,
            current: Arc::new(NerveConfig::with_services("unloaded", Default::default())),
            overlay_missing_warned: false,
        };
        source.reload()?;
        Ok(source)
    }

    #[must_use]
    pub fn options(&self) -> &SourceOptions {
        &self.options
    }

    /// Produce the merged, untyped document without validating it.
    pub fn generate_document(&mut self) -> Result<Value> {
        let mut document = parse_config_file(&self.options.config_path)?;
        let Value::Object(root) = &mut document else {
            return Err(NerveError::InvalidConfig {
                details: format!(
                    "{} must contain a map at the top level",
                    self.options.config_path.display()
                ),
            });
        };

        let services = root
            .entry("services")
            .or_insert_with(|| Value::Object(Map::new()));
        if services.is_null() {
            *services = Value::Object(Map::new());
        }

        if let Some(dir) = root.get("service_conf_dir").and_then(Value::as_str) {
            let dir = expand_home(dir);
            let entries = load_service_conf_dir(&dir)?;
            if let Some(Value::Object(services)) = root.get_mut("services") {
                services.extend(entries);
            }
        }

        if let Some(overlay_path) = self.options.overlay_path.clone() {
            match parse_overlay_file(&overlay_path) {
                Ok(Some(overlay)) => {
                    self.overlay_missing_warned = false;
                    deep_merge(&mut document, overlay);
                }
                Ok(None) => {
                    if !self.overlay_missing_warned {
                        tracing::warn!(
                            path = %overlay_path.display(),
                            "overlay config not found, continuing without it"
                        );
                        self.overlay_missing_warned = true;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(instance_id) = self.options.instance_id.as_ref().filter(|id| !id.is_empty())
            && let Value::Object(root) = &mut document
        {
            root.insert(
                "instance_id".to_string(),
                Value::String(instance_id.clone()),
            );
        }

        Ok(document)
    }
}

impl ConfigSource for FileConfigSource {
    fn config(&self) -> Arc<NerveConfig> {
        Arc::clone(&self.current)
    }

    fn reload(&mut self) -> Result<()> {
        // Sampled before the overlay is read so a write racing the reload is
        // seen as a change on the next poll.
        let overlay_mtime = self.overlay_modified_time();
        let document = self.generate_document()?;
        let config = NerveConfig::from_document(document, overlay_mtime)?;
        tracing::debug!(
            services = config.services.len(),
            rejected = config.rejected_services.len(),
            "configuration loaded"
        );
        self.current = Arc::new(config);
        Ok(())
    }

    fn overlay_modified_time(&self) -> Option<SystemTime> {
        let path = self.options.overlay_path.as_ref()?;
        fs::metadata(path).and_then(|m| m.modified()).ok()
    }
}

/// Parse one config file into an untyped document, choosing the format by extension.
pub fn parse_config_file(path: &Path) -> Result<Value> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(NerveError::MissingConfig {
                path: path.to_path_buf(),
            });
        }
        Err(e) => {
            return Err(NerveError::UnreadableConfig {
                path: path.to_path_buf(),
                source: e,
            });
        }
    };

    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    let value = match extension.as_deref() {
        Some("json") => serde_json::from_str(&raw)?,
        Some("toml") => {
            let table: toml::Value = toml::from_str(&raw)?;
            serde_json::to_value(table)?
        }
        _ => serde_yaml::from_str(&raw)?,
    };
    Ok(value)
}

/// `Ok(None)` means the overlay is absent, which is not an error.
fn parse_overlay_file(path: &Path) -> Result<Option<Value>> {
    match parse_config_file(path) {
        Ok(value) => Ok(Some(value)),
        Err(NerveError::MissingConfig { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

fn load_service_conf_dir(dir: &Path) -> Result<Map<String, Value>> {
    if !dir.is_dir() {
        return Err(NerveError::InvalidConfig {
            details: format!("service conf dir does not exist: {}", dir.display()),
        });
    }
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|e| NerveError::UnreadableConfig {
            path: dir.to_path_buf(),
            source: e,
        })?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("yaml" | "yml" | "json" | "toml")
                )
        })
        .collect();
    paths.sort();

    let mut services = Map::new();
    for path in paths {
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        services.insert(stem.to_string(), parse_config_file(&path)?);
    }
    Ok(services)
}

fn expand_home(dir: &str) -> PathBuf {
    if let Some(rest) = dir.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return PathBuf::from(home).join(rest);
    }
    PathBuf::from(dir)
}

/// Recursive map merge: overlay maps merge into base maps, anything else replaces.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(base_value) if base_value.is_object() && overlay_value.is_object() => {
                        deep_merge(base_value, overlay_value);
                    }
                    _ => {
                        base_map.insert(key, overlay_value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}
