// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device capability contract and built-in meter families.
//!
//! A [`Device`] is one physical meter session. The lifecycle engine only
//! depends on this trait; concrete meter families are looked up by type
//! name in a [`DeviceRegistry`].
//!
//! Construction and connection are separate steps so that a bad
//! configuration ([`DeviceError::InvalidConfig`]) can be told apart from an
//! unreachable meter ([`DeviceError::ConnectFailed`]).
//!
//! # Blocking behaviour
//!
//! [`Device::connect`], [`Device::disconnect`] and [`Device::read`] are
//! synchronous and may block on serial or network I/O. Async callers run
//! them on the blocking thread pool.
//!
//! # Examples
//!
//! ```
//! use meter2mqtt::device::{DeviceConfig, DeviceId, DeviceRegistry};
//!
//! let registry = DeviceRegistry::builtin();
//! let config = DeviceConfig::from_value(serde_json::json!({
//!     "type": "dsmr",
//!     "connection": "network_url",
//!     "url": "192.168.1.20:2323",
//! }))
//! .unwrap();
//!
//! let device = registry
//!     .create(DeviceId::new("p1"), "dsmr", config)
//!     .unwrap();
//! assert_eq!(device.device_type(), "dsmr");
//! ```

mod config;
mod device_id;
mod dsmr;
mod multical;
mod registry;
mod transport;

pub use config::DeviceConfig;
pub use device_id::DeviceId;
pub use dsmr::DsmrDevice;
pub use multical::MulticalDevice;
pub use registry::{DeviceConstructor, DeviceRegistry};
pub use transport::{ConnectionKind, SerialSettings, TransportConfig};

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::error::DeviceError;

/// Poll interval used when a device config does not set `poll_interval`.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(300);

/// Values produced by one successful read, keyed by parameter name.
pub type Readings = BTreeMap<String, Reading>;

/// A single value read from a meter.
#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    /// A measured quantity.
    Float(f64),
    /// A counter or other integral value.
    Integer(i64),
    /// A textual value such as a timestamp or identifier.
    Text(String),
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Float(v) => write!(f, "{v}"),
            Self::Integer(v) => write!(f, "{v}"),
            Self::Text(v) => f.write_str(v),
        }
    }
}

impl From<f64> for Reading {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<i64> for Reading {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<&str> for Reading {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Reading {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// Descriptive metadata about a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// The device identifier.
    pub id: DeviceId,
    /// The device type name.
    pub device_type: String,
    /// The meter manufacturer.
    pub manufacturer: String,
    /// The meter model.
    pub model: String,
}

/// Capability contract implemented by every meter family.
///
/// Implementations keep their session state behind interior mutability so
/// that a shared handle can be read by the poller while the lifecycle
/// engine owns its bookkeeping.
pub trait Device: Send + Sync + fmt::Debug {
    /// Returns the device identifier.
    fn id(&self) -> &DeviceId;

    /// Returns the configuration this device was constructed from.
    fn config(&self) -> &DeviceConfig;

    /// Returns the type name (e.g. `dsmr`).
    fn device_type(&self) -> &'static str;

    /// Opens the session.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::ConnectFailed`] if the meter is unreachable.
    fn connect(&self) -> Result<(), DeviceError>;

    /// Closes the session.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::DisconnectFailed`] if cleanup failed. Callers
    /// treat this as non-fatal.
    fn disconnect(&self) -> Result<(), DeviceError>;

    /// Reads the current values of the enabled parameters.
    ///
    /// # Errors
    ///
    /// Returns a transient error ([`DeviceError::is_transient`]) when this
    /// poll cycle produced nothing; the session stays open.
    fn read(&self) -> Result<Readings, DeviceError>;

    /// Returns every parameter name this family can produce.
    fn available_parameters(&self) -> &[&'static str];

    /// Returns the configuration keys that must be present.
    fn required_config_keys(&self) -> Vec<&'static str>;

    /// Returns the parameters selected in the configuration, or all
    /// available parameters if none are selected.
    fn enabled_parameters(&self) -> Vec<String> {
        self.config().parameters().unwrap_or_else(|| {
            self.available_parameters()
                .iter()
                .map(|name| (*name).to_string())
                .collect()
        })
    }

    /// Returns how often the device should be read.
    fn poll_interval(&self) -> Duration {
        self.config()
            .poll_interval()
            .unwrap_or(DEFAULT_POLL_INTERVAL)
    }

    /// Returns the meter manufacturer.
    fn manufacturer(&self) -> String {
        "Unknown".to_string()
    }

    /// Returns the meter model.
    fn model(&self) -> String {
        "Unknown".to_string()
    }

    /// Returns descriptive metadata.
    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            id: self.id().clone(),
            device_type: self.device_type().to_string(),
            manufacturer: self.manufacturer(),
            model: self.model(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug)]
    struct Fixed {
        id: DeviceId,
        config: DeviceConfig,
    }

    impl Device for Fixed {
        fn id(&self) -> &DeviceId {
            &self.id
        }
        fn config(&self) -> &DeviceConfig {
            &self.config
        }
        fn device_type(&self) -> &'static str {
            "fixed"
        }
        fn connect(&self) -> Result<(), DeviceError> {
            Ok(())
        }
        fn disconnect(&self) -> Result<(), DeviceError> {
            Ok(())
        }
        fn read(&self) -> Result<Readings, DeviceError> {
            Ok(Readings::new())
        }
        fn available_parameters(&self) -> &[&'static str] {
            &["energy", "power"]
        }
        fn required_config_keys(&self) -> Vec<&'static str> {
            Vec::new()
        }
    }

    fn fixed(config: serde_json::Value) -> Fixed {
        Fixed {
            id: DeviceId::new("meter"),
            config: DeviceConfig::from_value(config).unwrap(),
        }
    }

    #[test]
    fn enabled_parameters_default_to_available() {
        let device = fixed(json!({"type": "fixed"}));
        assert_eq!(device.enabled_parameters(), vec!["energy", "power"]);
    }

    #[test]
    fn enabled_parameters_follow_config() {
        let device = fixed(json!({"type": "fixed", "parameters": ["power"]}));
        assert_eq!(device.enabled_parameters(), vec!["power"]);
    }

    #[test]
    fn poll_interval_defaults_to_five_minutes() {
        let device = fixed(json!({"type": "fixed"}));
        assert_eq!(device.poll_interval(), Duration::from_secs(300));

        let device = fixed(json!({"type": "fixed", "poll_interval": 15}));
        assert_eq!(device.poll_interval(), Duration::from_secs(15));
    }

    #[test]
    fn info_uses_unknown_defaults() {
        let info = fixed(json!({"type": "fixed"})).info();
        assert_eq!(info.id, DeviceId::new("meter"));
        assert_eq!(info.device_type, "fixed");
        assert_eq!(info.manufacturer, "Unknown");
        assert_eq!(info.model, "Unknown");
    }

    #[test]
    fn reading_display() {
        assert_eq!(Reading::Float(1.5).to_string(), "1.5");
        assert_eq!(Reading::Integer(42).to_string(), "42");
        assert_eq!(Reading::from("2024-01-01").to_string(), "2024-01-01");
    }
}
