// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Desired-state snapshots from a directory of device config files.

use std::fmt;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, error, warn};

use crate::device::{DeviceConfig, DeviceId};
use crate::error::ConfigError;
use crate::lifecycle::DesiredState;

/// Supplies desired-state snapshots to the lifecycle engine.
pub trait ConfigSource: Send + Sync + fmt::Debug {
    /// Loads the full set of device configurations.
    ///
    /// Individual broken entries are skipped and logged.
    ///
    /// # Errors
    ///
    /// Returns an error only when the snapshot as a whole cannot be taken,
    /// e.g. the directory is unreadable. Callers must not reconcile against
    /// a partial result in that case.
    fn load_snapshot(&self) -> Result<DesiredState, ConfigError>;

    /// Returns the directory whose changes should trigger a reload.
    fn watch_root(&self) -> &Path;
}

/// Returns true for `*.yaml` and `*.yml` paths.
#[must_use]
pub fn is_device_config_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml" | "yml")
    )
}

/// Reads one YAML file per device from a directory.
///
/// The file stem is the device identifier. Empty files are skipped with a
/// warning; unparseable files and files without a `type` field are skipped
/// with an error. When `p1.yaml` and `p1.yml` both exist, `p1.yml` wins.
///
/// # Examples
///
/// ```no_run
/// use meter2mqtt::config::{ConfigSource, DirectorySource};
///
/// let source = DirectorySource::new("config.d");
/// let desired = source.load_snapshot()?;
/// for (id, config) in &desired {
///     println!("{id}: {:?}", config.device_type());
/// }
/// # Ok::<(), meter2mqtt::error::ConfigError>(())
/// ```
#[derive(Debug, Clone)]
pub struct DirectorySource {
    dir: PathBuf,
}

impl DirectorySource {
    /// Creates a source reading from `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Returns the directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Loads a single device config file.
    ///
    /// Returns `Ok(None)` for an empty file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not a YAML mapping,
    /// or has no string `type` field.
    pub fn load_file(path: &Path) -> Result<Option<DeviceConfig>, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        if text.trim().is_empty() {
            return Ok(None);
        }

        let value: Value = serde_yaml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        if value.is_null() {
            return Ok(None);
        }

        let config = DeviceConfig::from_value(value).ok_or_else(|| ConfigError::Parse {
            path: path.to_path_buf(),
            message: "expected a mapping at the top level".to_string(),
        })?;
        if config.device_type().is_none() {
            return Err(ConfigError::MissingType(path.to_path_buf()));
        }
        Ok(Some(config))
    }

    fn config_files(&self) -> Result<Vec<PathBuf>, ConfigError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|source| ConfigError::Directory {
            path: self.dir.clone(),
            source,
        })?;

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| ConfigError::Directory {
                path: self.dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.is_file() && is_device_config_file(&path) {
                files.push(path);
            }
        }

        // `.yaml` files first, then `.yml`, each group by name.
        files.sort_by(|a, b| {
            let a_yml = a.extension().is_some_and(|ext| ext == "yml");
            let b_yml = b.extension().is_some_and(|ext| ext == "yml");
            a_yml.cmp(&b_yml).then_with(|| a.cmp(b))
        });
        Ok(files)
    }
}

impl ConfigSource for DirectorySource {
    fn load_snapshot(&self) -> Result<DesiredState, ConfigError> {
        let mut desired = DesiredState::new();

        for path in self.config_files()? {
            let Some(id) = DeviceId::from_path(&path) else {
                continue;
            };
            match Self::load_file(&path) {
                Ok(Some(config)) => {
                    debug!(device_id = %id, device_type = ?config.device_type(), "Loaded device config");
                    desired.insert(id, config);
                }
                Ok(None) => warn!(path = %path.display(), "Device config file is empty"),
                Err(e) => error!(error = %e, "Skipping device config"),
            }
        }

        Ok(desired)
    }

    fn watch_root(&self) -> &Path {
        &self.dir
    }
}
