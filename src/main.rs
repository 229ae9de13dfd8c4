// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use meter2mqtt::config::is_device_config_file;
use meter2mqtt::{AppConfig, Daemon, Device, DeviceId, DeviceRegistry, DirectorySource, logging};

/// Reads utility meters and publishes their readings over MQTT.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Base configuration file (broker, logging, directories).
    #[arg(long, default_value = "config.yaml", env = "METER2MQTT_CONFIG")]
    config: PathBuf,

    /// Device configuration directory, overriding `devices.config_dir`.
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Validate every device config and exit without connecting anything.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let mut settings = AppConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(dir) = args.config_dir {
        settings.devices.config_dir = dir;
    }

    let registry = Arc::new(DeviceRegistry::builtin());

    if args.check {
        return check(&settings.devices.config_dir, &registry);
    }

    logging::init(&settings.logging)?;

    let daemon = Daemon::start(settings, registry).await?;
    daemon.run_until_signal().await?;
    Ok(ExitCode::SUCCESS)
}

/// Builds every device config through the registry and prints a verdict
/// per file.
fn check(dir: &Path, registry: &DeviceRegistry) -> Result<ExitCode> {
    let entries = std::fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))?;
    let (files, errors) = config_files(entries.map(|entry| entry.map(|entry| entry.path())));

    let mut failures = errors.len();
    for e in &errors {
        println!("{}: FAILED: {e}", dir.display());
    }

    for path in &files {
        let Some(id) = DeviceId::from_path(path) else {
            continue;
        };
        let verdict = match DirectorySource::load_file(path) {
            Ok(Some(config)) => {
                let type_name = config.device_type().unwrap_or_default().to_string();
                registry
                    .create(id.clone(), &type_name, config)
                    .map(|device| format!("ok ({}, {})", device.device_type(), device.info().model))
                    .map_err(|e| e.to_string())
            }
            Ok(None) => Ok("empty, skipped".to_string()),
            Err(e) => Err(e.to_string()),
        };
        match verdict {
            Ok(message) => println!("{id}: {message}"),
            Err(message) => {
                failures += 1;
                println!("{id}: FAILED: {message}");
            }
        }
    }

    println!("{} file(s) checked, {failures} failed", files.len());
    Ok(if failures == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Splits directory entries into sorted device config files and entry
/// errors.
fn config_files(entries: impl Iterator<Item = io::Result<PathBuf>>) -> (Vec<PathBuf>, Vec<io::Error>) {
    let mut files = Vec::new();
    let mut errors = Vec::new();
    for entry in entries {
        match entry {
            Ok(path) if path.is_file() && is_device_config_file(&path) => files.push(path),
            Ok(_) => {}
            Err(e) => errors.push(e),
        }
    }
    files.sort();
    (files, errors)
}
