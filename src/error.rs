// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types for `meter2mqtt`.
//!
//! Errors are split by concern: device construction and I/O, configuration
//! loading, and publishing. Device errors are always scoped to a single
//! device identifier and never abort a reconciliation pass.

use std::path::PathBuf;

use thiserror::Error;

/// The main error type for this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Error raised by a device or the device registry.
    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    /// Error raised while loading configuration.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Error raised by the publish sink.
    #[error("publish error: {0}")]
    Publish(#[from] PublishError),

    /// Signal handlers could not be installed.
    #[error("signal handling error: {0}")]
    Signal(#[from] std::io::Error),
}

/// Errors related to constructing, connecting, reading and closing devices.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// No constructor is registered for the requested device type.
    #[error("unknown device type '{type_name}' (registered: {})", known.join(", "))]
    UnknownType {
        /// The requested type name.
        type_name: String,
        /// The type names currently registered.
        known: Vec<String>,
    },

    /// A required configuration key is missing.
    #[error("invalid config for device {device}: missing required key '{key}'")]
    InvalidConfig {
        /// The device identifier.
        device: String,
        /// The missing key.
        key: String,
    },

    /// A configuration key is present but its value cannot be used.
    #[error("invalid value for '{key}' on device {device}: {reason}")]
    InvalidValue {
        /// The device identifier.
        device: String,
        /// The offending key.
        key: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// The device could not be reached.
    #[error("failed to connect device {device}: {reason}")]
    ConnectFailed {
        /// The device identifier.
        device: String,
        /// Description of the failure.
        reason: String,
    },

    /// An operation needed an open session but the device is not connected.
    #[error("device {0} is not connected")]
    NotConnected(String),

    /// One poll cycle yielded no data. The session stays open.
    #[error("read from device {device} failed: {reason}")]
    ReadFailed {
        /// The device identifier.
        device: String,
        /// Description of the failure.
        reason: String,
    },

    /// The session did not close cleanly.
    #[error("failed to disconnect device {device}: {reason}")]
    DisconnectFailed {
        /// The device identifier.
        device: String,
        /// Description of the failure.
        reason: String,
    },
}

impl DeviceError {
    /// Returns true if this error only affects the current poll cycle.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ReadFailed { .. } | Self::NotConnected(_))
    }
}

/// Errors related to loading the base config and device config files.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The device config directory could not be listed.
    #[error("cannot read config directory {path}: {source}")]
    Directory {
        /// The directory path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A device config file could not be read.
    #[error("cannot read {path}: {source}")]
    Read {
        /// The file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A device config file is not valid YAML or not a mapping.
    #[error("cannot parse {path}: {message}")]
    Parse {
        /// The file path.
        path: PathBuf,
        /// Parser message.
        message: String,
    },

    /// A device config file has no `type` field.
    #[error("{0} has no 'type' field")]
    MissingType(PathBuf),

    /// The base configuration could not be extracted.
    #[error("invalid base configuration: {0}")]
    Base(Box<figment::Error>),

    /// The config directory watcher failed.
    #[error("config watch error: {0}")]
    Watch(#[from] notify::Error),

    /// Any other I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Base(Box::new(err))
    }
}

/// Errors related to publishing readings.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The sink has no live broker session.
    #[error("not connected to MQTT broker {host}:{port}")]
    NotConnected {
        /// Broker host.
        host: String,
        /// Broker port.
        port: u16,
    },

    /// The MQTT client rejected the request.
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    /// Broker settings are unusable.
    #[error("invalid MQTT settings: {0}")]
    InvalidSettings(String),

    /// Reading a TLS certificate or key failed.
    #[error("cannot read TLS material {path}: {source}")]
    Tls {
        /// The file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_type_lists_registered_types() {
        let err = DeviceError::UnknownType {
            type_name: "warmtelink".to_string(),
            known: vec!["dsmr".to_string(), "multical".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "unknown device type 'warmtelink' (registered: dsmr, multical)"
        );
    }

    #[test]
    fn invalid_config_names_missing_key() {
        let err = DeviceError::InvalidConfig {
            device: "kitchen".to_string(),
            key: "port".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "invalid config for device kitchen: missing required key 'port'"
        );
    }

    #[test]
    fn read_failures_are_transient() {
        let read = DeviceError::ReadFailed {
            device: "a".to_string(),
            reason: "timeout".to_string(),
        };
        let connect = DeviceError::ConnectFailed {
            device: "a".to_string(),
            reason: "refused".to_string(),
        };
        assert!(read.is_transient());
        assert!(DeviceError::NotConnected("a".to_string()).is_transient());
        assert!(!connect.is_transient());
    }

    #[test]
    fn error_from_device_error() {
        let err: Error = DeviceError::NotConnected("a".to_string()).into();
        assert!(matches!(err, Error::Device(DeviceError::NotConnected(_))));
    }

    #[test]
    fn publish_error_display() {
        let err = PublishError::NotConnected {
            host: "broker".to_string(),
            port: 1883,
        };
        assert_eq!(err.to_string(), "not connected to MQTT broker broker:1883");
    }
}
