// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Base configuration: broker, logging and device directory settings.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ConfigError;
use crate::publish::prefixed_topic;

/// Keys accepted from `MQTT_*` environment variables.
const MQTT_ENV_KEYS: &[&str] = &[
    "host",
    "port",
    "client",
    "qos",
    "retain",
    "keepalive",
    "authentication",
    "username",
    "password",
    "tls_enabled",
    "tls_ca_cert",
    "tls_cert",
    "tls_key",
    "topic_prefix",
];

// ============================================================================
// Sections
// ============================================================================

/// Complete base configuration.
///
/// Every field has a default, so an empty or missing file is valid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// MQTT broker connection.
    pub mqtt: MqttSettings,
    /// Log output.
    pub logging: LoggingSettings,
    /// Device config directory and timing.
    pub devices: DeviceSettings,
}

/// MQTT broker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    /// Client identifier presented to the broker.
    pub client: String,
    /// QoS for readings and status messages (0, 1 or 2).
    pub qos: u8,
    #[serde(deserialize_with = "flexible_bool")]
    pub retain: bool,
    /// Keep-alive interval in seconds.
    pub keepalive: u64,
    /// Send `username`/`password` when set.
    #[serde(deserialize_with = "flexible_bool")]
    pub authentication: bool,
    #[serde(deserialize_with = "optional_text", skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(deserialize_with = "optional_text", skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(deserialize_with = "flexible_bool")]
    pub tls_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_ca_cert: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_cert: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_key: Option<PathBuf>,
    /// First topic level for everything this daemon publishes.
    pub topic_prefix: String,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client: "meter2mqtt".to_string(),
            qos: 1,
            retain: true,
            keepalive: 60,
            authentication: false,
            username: None,
            password: None,
            tls_enabled: false,
            tls_ca_cert: None,
            tls_cert: None,
            tls_key: None,
            topic_prefix: "meters".to_string(),
        }
    }
}

impl MqttSettings {
    /// Returns the keep-alive interval.
    #[must_use]
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive)
    }

    /// Returns the topic carrying the online/offline status.
    #[must_use]
    pub fn status_topic(&self) -> String {
        prefixed_topic(&self.topic_prefix, "status")
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Full,
    Compact,
    Pretty,
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter directive, overridden by `RUST_LOG`.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Full,
        }
    }
}

/// Device directory and timing settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    /// Directory holding one YAML file per device.
    pub config_dir: PathBuf,
    /// Quiet period after the last file change before reloading.
    pub reload_delay_ms: u64,
    /// Period of the polling loop.
    pub poll_tick_ms: u64,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("config.d"),
            reload_delay_ms: 1000,
            poll_tick_ms: 1000,
        }
    }
}

impl DeviceSettings {
    #[must_use]
    pub fn reload_delay(&self) -> Duration {
        Duration::from_millis(self.reload_delay_ms)
    }

    #[must_use]
    pub fn poll_tick(&self) -> Duration {
        Duration::from_millis(self.poll_tick_ms.max(1))
    }
}

// ============================================================================
// Loading
// ============================================================================

impl AppConfig {
    /// Builds the provider stack: defaults, then `path`, then environment.
    ///
    /// A missing file contributes nothing.
    #[must_use]
    pub fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Yaml::file(path))
            .merge(
                Env::prefixed("MQTT_")
                    .only(MQTT_ENV_KEYS)
                    .map(|key| format!("mqtt.{key}").into()),
            )
            .merge(
                Env::raw()
                    .only(&["LOG_LEVEL"])
                    .map(|_| "logging.level".into()),
            )
    }

    /// Loads the base configuration from `path` and the environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Base`] if the file is malformed or a value has
    /// the wrong type.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_figment(&Self::figment(path))
    }

    /// Extracts the configuration from an arbitrary provider stack.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Base`] on extraction failure.
    pub fn from_figment(figment: &Figment) -> Result<Self, ConfigError> {
        Ok(figment.extract()?)
    }
}

// ============================================================================
// Lenient scalars
// ============================================================================

#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

/// Accepts `true`, `1`, `"yes"`, `"on"` and their negations.
fn flexible_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    match Scalar::deserialize(deserializer)? {
        Scalar::Bool(b) => Ok(b),
        Scalar::Int(n) => Ok(n != 0),
        Scalar::Float(f) => Ok(f.abs() > f64::EPSILON),
        Scalar::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" | "" => Ok(false),
            other => Err(serde::de::Error::custom(format!("expected a boolean, got '{other}'"))),
        },
    }
}

/// Keeps numeric-looking credentials (`MQTT_PASSWORD=1234`) as text.
fn optional_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Scalar>::deserialize(deserializer)?.map(|value| match value {
        Scalar::Bool(b) => b.to_string(),
        Scalar::Int(n) => n.to_string(),
        Scalar::Float(f) => f.to_string(),
        Scalar::Text(s) => s,
    }))
}
