// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wiring of publisher, lifecycle engine, config watch and poller.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::{AppConfig, ConfigSource, DirectorySource};
use crate::device::DeviceRegistry;
use crate::error::Result;
use crate::lifecycle::LifecycleEngine;
use crate::poller::{Poller, PollerHandle};
use crate::publish::MqttPublisher;

/// How long startup waits for the first broker session before going on
/// without one.
const BROKER_WAIT: Duration = Duration::from_secs(10);

/// The running service.
#[derive(Debug)]
pub struct Daemon {
    engine: LifecycleEngine,
    publisher: Arc<MqttPublisher>,
    poller: PollerHandle,
}

impl Daemon {
    /// Starts every component.
    ///
    /// Order: MQTT session, config watch, initial reconciliation, poller.
    /// Devices that fail to start are logged and left out; they do not
    /// prevent startup.
    ///
    /// # Errors
    ///
    /// Returns an error if the MQTT settings are unusable or the config
    /// directory cannot be created, watched or listed.
    pub async fn start(settings: AppConfig, registry: Arc<DeviceRegistry>) -> Result<Self> {
        info!(
            version = env!("CARGO_PKG_VERSION"),
            config_dir = %settings.devices.config_dir.display(),
            device_types = ?registry.registered_types(),
            "Starting meter2mqtt"
        );

        let publisher = Arc::new(MqttPublisher::connect(&settings.mqtt)?);
        if !publisher.wait_connected(BROKER_WAIT).await {
            warn!(
                host = %settings.mqtt.host,
                port = settings.mqtt.port,
                "MQTT broker not reachable yet, readings are dropped until it is"
            );
        }

        let engine = LifecycleEngine::new(registry);
        let source: Arc<dyn ConfigSource> =
            Arc::new(DirectorySource::new(&settings.devices.config_dir));

        let started = async {
            engine
                .start_watching(Arc::clone(&source), settings.devices.reload_delay())
                .await?;
            engine.reload(source).await
        };
        let report = match started.await {
            Ok(report) => report,
            Err(e) => {
                engine.shutdown().await;
                publisher.shutdown().await;
                return Err(e.into());
            }
        };
        info!(running = engine.len(), failed = report.failed.len(), "Initial devices started");

        let poller = Poller::new(
            engine.clone(),
            Arc::clone(&publisher),
            settings.mqtt.topic_prefix.clone(),
        )
        .spawn(settings.devices.poll_tick());

        Ok(Self {
            engine,
            publisher,
            poller,
        })
    }

    /// Returns the lifecycle engine.
    #[must_use]
    pub fn engine(&self) -> &LifecycleEngine {
        &self.engine
    }

    /// Waits for SIGINT or SIGTERM, then shuts down.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal handlers cannot be installed.
    pub async fn run_until_signal(self) -> Result<()> {
        wait_for_signal().await?;
        info!("Shutdown signal received");
        self.shutdown().await;
        Ok(())
    }

    /// Stops the poller, then every device, then the MQTT session.
    pub async fn shutdown(self) {
        self.poller.stop().await;
        self.engine.shutdown().await;
        self.publisher.shutdown().await;
        info!("meter2mqtt stopped");
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
