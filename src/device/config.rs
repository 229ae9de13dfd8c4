// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-device configuration mapping.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};

/// Configuration of one device, as loaded from its config file.
///
/// The mapping is immutable once loaded and cheap to clone. A changed file
/// always produces a whole new `DeviceConfig`; nothing is patched in place.
///
/// Every device understands the `type` discriminator plus the common keys
/// `poll_interval` (seconds) and `parameters` (a list, or a single name).
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use meter2mqtt::device::DeviceConfig;
///
/// let config = DeviceConfig::from_value(serde_json::json!({
///     "type": "dsmr",
///     "port": "/dev/ttyUSB0",
///     "poll_interval": 10,
/// }))
/// .unwrap();
///
/// assert_eq!(config.device_type(), Some("dsmr"));
/// assert_eq!(config.poll_interval(), Some(Duration::from_secs(10)));
/// ```
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeviceConfig {
    fields: Arc<Map<String, Value>>,
}

impl DeviceConfig {
    /// Key holding the device type discriminator.
    pub const TYPE_KEY: &'static str = "type";

    /// Creates a configuration from a key/value mapping.
    #[must_use]
    pub fn new(fields: Map<String, Value>) -> Self {
        Self {
            fields: Arc::new(fields),
        }
    }

    /// Creates a configuration from a value tree.
    ///
    /// Returns `None` unless the value is a mapping.
    #[must_use]
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(fields) => Some(Self::new(fields)),
            _ => None,
        }
    }

    /// Returns the device type discriminator.
    #[must_use]
    pub fn device_type(&self) -> Option<&str> {
        self.get_str(Self::TYPE_KEY)
    }

    /// Returns the raw value for a key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Returns true if the key is present.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// Returns the value for a key if it is a string.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Returns the value for a key as text.
    ///
    /// Numbers are rendered, so `version: 50` and `version: "50"` both
    /// yield `"50"`.
    #[must_use]
    pub fn get_text(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Returns the value for a key if it is a non-negative integer.
    #[must_use]
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(Value::as_u64)
    }

    /// Returns the value for a key if it is a nested mapping.
    #[must_use]
    pub fn section(&self, key: &str) -> Option<&Map<String, Value>> {
        self.get(key).and_then(Value::as_object)
    }

    /// Returns the configured poll interval.
    ///
    /// Accepts integer or fractional seconds. Zero, negative, non-numeric
    /// and out of range values are ignored.
    #[must_use]
    pub fn poll_interval(&self) -> Option<Duration> {
        let secs = self.get("poll_interval").and_then(Value::as_f64)?;
        if secs > 0.0 {
            Duration::try_from_secs_f64(secs).ok()
        } else {
            None
        }
    }

    /// Returns the configured parameter names.
    ///
    /// A single string is treated as a one-element list. An empty list is
    /// the same as no list.
    #[must_use]
    pub fn parameters(&self) -> Option<Vec<String>> {
        let names: Vec<String> = match self.get("parameters")? {
            Value::String(name) => vec![name.clone()],
            Value::Array(items) => items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect(),
            _ => return None,
        };
        (!names.is_empty()).then_some(names)
    }

    /// Returns the underlying mapping.
    #[must_use]
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.fields
    }
}

impl From<Map<String, Value>> for DeviceConfig {
    fn from(fields: Map<String, Value>) -> Self {
        Self::new(fields)
    }
}
