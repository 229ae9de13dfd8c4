// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MQTT publish sink.
//!
//! The broker session is owned by a background task that keeps polling the
//! `rumqttc` event loop, so the client reconnects on its own after a broker
//! outage. The status topic carries `online` while a session is up; the
//! broker publishes the retained `offline` last will when the session dies
//! unexpectedly.
//!
//! # Examples
//!
//! ```no_run
//! use std::time::Duration;
//! use meter2mqtt::config::MqttSettings;
//! use meter2mqtt::publish::{MqttPublisher, PublishSink};
//!
//! # async fn example() -> Result<(), meter2mqtt::error::PublishError> {
//! let publisher = MqttPublisher::connect(&MqttSettings::default())?;
//! publisher.wait_connected(Duration::from_secs(5)).await;
//! publisher.publish("meters/dsmr/p1/electricity_currently_used", "0.412".to_string()).await?;
//! publisher.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS,
    TlsConfiguration, Transport,
};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::PublishSink;
use crate::config::MqttSettings;
use crate::error::PublishError;

/// Capacity of the client request queue.
const REQUEST_CAPACITY: usize = 64;

/// Pause between reconnection attempts.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// How long shutdown waits for `offline` and the disconnect to go out.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

const ONLINE: &str = "online";
const OFFLINE: &str = "offline";

/// Publishes readings to an MQTT broker.
pub struct MqttPublisher {
    inner: Arc<PublisherInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct PublisherInner {
    client: AsyncClient,
    settings: MqttSettings,
    qos: QoS,
    status_topic: String,
    connected: AtomicBool,
    stopping: AtomicBool,
    /// Woken on every ConnAck.
    session_up: Notify,
    /// Interrupts the reconnect back-off on shutdown.
    stop: Notify,
}

impl MqttPublisher {
    /// Creates the client and starts the background session task.
    ///
    /// Does not wait for the broker; see [`wait_connected`](Self::wait_connected).
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::InvalidSettings`] for an out-of-range QoS or
    /// incomplete TLS/credential settings, and [`PublishError::Tls`] when a
    /// certificate or key file cannot be read.
    pub fn connect(settings: &MqttSettings) -> Result<Self, PublishError> {
        let qos = qos_from_level(settings.qos)?;
        let options = mqtt_options(settings)?;
        let (client, event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);

        let inner = Arc::new(PublisherInner {
            client,
            settings: settings.clone(),
            qos,
            status_topic: settings.status_topic(),
            connected: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            session_up: Notify::new(),
            stop: Notify::new(),
        });

        let task = tokio::spawn(run_session(event_loop, Arc::clone(&inner)));

        info!(
            host = %settings.host,
            port = settings.port,
            client = %settings.client,
            tls = settings.tls_enabled,
            "MQTT publisher started"
        );

        Ok(Self {
            inner,
            task: Mutex::new(Some(task)),
        })
    }

    /// Returns whether a broker session is currently up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Waits until a broker session is up, at most `timeout`.
    ///
    /// Returns whether the session is up.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.inner.session_up.notified();
                if self.is_connected() {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    /// Returns the status topic.
    #[must_use]
    pub fn status_topic(&self) -> &str {
        &self.inner.status_topic
    }

    /// Publishes `offline`, disconnects and stops the session task.
    ///
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        let Some(mut task) = self.task.lock().take() else {
            return;
        };
        self.inner.stopping.store(true, Ordering::Release);
        self.inner.stop.notify_one();

        if self.is_connected() {
            if let Err(e) = self
                .inner
                .client
                .publish(&self.inner.status_topic, QoS::AtLeastOnce, true, OFFLINE)
                .await
            {
                warn!(error = %e, "Failed to queue offline status");
            }
            if let Err(e) = self.inner.client.disconnect().await {
                warn!(error = %e, "Failed to queue MQTT disconnect");
            }
        }

        if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
            debug!("MQTT session task did not finish in time, aborting");
            task.abort();
        }
        self.inner.connected.store(false, Ordering::Release);

        info!(
            host = %self.inner.settings.host,
            port = self.inner.settings.port,
            "MQTT publisher stopped"
        );
    }
}

impl PublishSink for MqttPublisher {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), PublishError> {
        if !self.is_connected() {
            warn!(topic = %topic, "Not connected to MQTT broker, dropping message");
            return Err(PublishError::NotConnected {
                host: self.inner.settings.host.clone(),
                port: self.inner.settings.port,
            });
        }

        self.inner
            .client
            .publish(topic, self.inner.qos, self.inner.settings.retain, payload)
            .await?;
        debug!(topic = %topic, "Published");
        Ok(())
    }

    fn is_available(&self) -> bool {
        self.is_connected()
    }
}

impl std::fmt::Debug for MqttPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttPublisher")
            .field("host", &self.inner.settings.host)
            .field("port", &self.inner.settings.port)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Session task
// ============================================================================

async fn run_session(mut event_loop: EventLoop, inner: Arc<PublisherInner>) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                debug!(?connack, "MQTT session established");
                inner.connected.store(true, Ordering::Release);
                // Polling is what drains the request queue, so never await it here.
                if let Err(e) =
                    inner
                        .client
                        .try_publish(&inner.status_topic, QoS::AtLeastOnce, true, ONLINE)
                {
                    warn!(error = %e, "Failed to queue online status");
                }
                inner.session_up.notify_waiters();
                info!(
                    host = %inner.settings.host,
                    port = inner.settings.port,
                    "Connected to MQTT broker"
                );
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                inner.connected.store(false, Ordering::Release);
                if inner.stopping.load(Ordering::Acquire) {
                    break;
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                info!("MQTT broker closed the session");
                inner.connected.store(false, Ordering::Release);
            }
            Ok(_) => {}
            Err(e) => {
                let was_connected = inner.connected.swap(false, Ordering::AcqRel);
                if inner.stopping.load(Ordering::Acquire) {
                    break;
                }
                if was_connected {
                    error!(error = %e, "Lost MQTT connection, reconnecting");
                } else {
                    warn!(error = %e, delay = ?RECONNECT_DELAY, "MQTT connection attempt failed");
                }
                tokio::select! {
                    () = tokio::time::sleep(RECONNECT_DELAY) => {}
                    () = inner.stop.notified() => break,
                }
            }
        }
    }
    debug!("MQTT session task finished");
}

// ============================================================================
// Options
// ============================================================================

fn qos_from_level(level: u8) -> Result<QoS, PublishError> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(PublishError::InvalidSettings(format!(
            "qos must be 0, 1 or 2, got {other}"
        ))),
    }
}

fn mqtt_options(settings: &MqttSettings) -> Result<MqttOptions, PublishError> {
    if settings.host.is_empty() {
        return Err(PublishError::InvalidSettings("host is required".to_string()));
    }

    let mut options = MqttOptions::new(&settings.client, &settings.host, settings.port);
    options.set_keep_alive(settings.keepalive().max(Duration::from_secs(1)));
    options.set_clean_session(true);
    options.set_last_will(LastWill::new(
        settings.status_topic(),
        OFFLINE.as_bytes().to_vec(),
        QoS::AtLeastOnce,
        true,
    ));

    if settings.authentication {
        let Some(username) = settings.username.as_deref() else {
            return Err(PublishError::InvalidSettings(
                "authentication is enabled but no username is set".to_string(),
            ));
        };
        options.set_credentials(username, settings.password.as_deref().unwrap_or_default());
    }

    if settings.tls_enabled {
        options.set_transport(tls_transport(settings)?);
    }

    Ok(options)
}

fn tls_transport(settings: &MqttSettings) -> Result<Transport, PublishError> {
    let Some(ca_path) = settings.tls_ca_cert.as_deref() else {
        return Err(PublishError::InvalidSettings(
            "tls_enabled requires tls_ca_cert".to_string(),
        ));
    };
    let ca = read_tls_file(ca_path)?;

    let client_auth = match (settings.tls_cert.as_deref(), settings.tls_key.as_deref()) {
        (Some(cert), Some(key)) => Some((read_tls_file(cert)?, read_tls_file(key)?)),
        (None, None) => None,
        _ => {
            return Err(PublishError::InvalidSettings(
                "tls_cert and tls_key must be set together".to_string(),
            ));
        }
    };

    Ok(Transport::Tls(TlsConfiguration::Simple {
        ca,
        alpn: None,
        client_auth,
    }))
}

fn read_tls_file(path: &Path) -> Result<Vec<u8>, PublishError> {
    std::fs::read(path).map_err(|source| PublishError::Tls {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn qos_levels() {
        assert_eq!(qos_from_level(0).unwrap(), QoS::AtMostOnce);
        assert_eq!(qos_from_level(2).unwrap(), QoS::ExactlyOnce);
        assert!(matches!(qos_from_level(3), Err(PublishError::InvalidSettings(_))));
    }

    #[test]
    fn options_carry_last_will() {
        let settings = MqttSettings {
            topic_prefix: "home/meters".to_string(),
            ..MqttSettings::default()
        };
        let options = mqtt_options(&settings).unwrap();
        let will = options.last_will().unwrap();
        assert_eq!(will.topic, "home/meters/status");
        assert_eq!(&will.message[..], b"offline");
        assert!(will.retain);
    }

    #[test]
    fn credentials_only_when_authentication_enabled() {
        let mut settings = MqttSettings {
            username: Some("meter".to_string()),
            password: Some("secret".to_string()),
            ..MqttSettings::default()
        };
        assert!(mqtt_options(&settings).unwrap().credentials().is_none());

        settings.authentication = true;
        assert!(mqtt_options(&settings).unwrap().credentials().is_some());
    }

    #[test]
    fn authentication_without_username_is_rejected() {
        let settings = MqttSettings {
            authentication: true,
            ..MqttSettings::default()
        };
        assert!(matches!(mqtt_options(&settings), Err(PublishError::InvalidSettings(_))));
    }

    #[test]
    fn tls_requires_readable_ca() {
        let mut settings = MqttSettings {
            tls_enabled: true,
            ..MqttSettings::default()
        };
        assert!(matches!(mqtt_options(&settings), Err(PublishError::InvalidSettings(_))));

        settings.tls_ca_cert = Some(PathBuf::from("/nonexistent/ca.pem"));
        assert!(matches!(mqtt_options(&settings), Err(PublishError::Tls { .. })));
    }

    #[test]
    fn tls_client_auth_needs_cert_and_key() {
        let dir = tempfile::tempdir().unwrap();
        let ca = dir.path().join("ca.pem");
        std::fs::write(&ca, b"-----BEGIN CERTIFICATE-----\n").unwrap();

        let settings = MqttSettings {
            tls_enabled: true,
            tls_ca_cert: Some(ca),
            tls_cert: Some(dir.path().join("client.pem")),
            ..MqttSettings::default()
        };
        assert!(matches!(mqtt_options(&settings), Err(PublishError::InvalidSettings(_))));
    }

    #[tokio::test]
    async fn publish_while_disconnected_fails_fast() {
        let settings = MqttSettings {
            host: "127.0.0.1".to_string(),
            port: 1,
            ..MqttSettings::default()
        };
        let publisher = MqttPublisher::connect(&settings).unwrap();

        assert!(!publisher.is_available());
        let result = publisher.publish("meters/dsmr/p1/x", "1".to_string()).await;
        assert!(matches!(result, Err(PublishError::NotConnected { port: 1, .. })));

        publisher.shutdown().await;
        publisher.shutdown().await;
    }
}
