// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Content fingerprints of device configurations.

use std::fmt;

use serde_json::Value;
use xxhash_rust::xxh3::xxh3_128;

use crate::device::DeviceConfig;

/// Digest of a device configuration, independent of key order.
///
/// Touching a config file without changing its content yields the same
/// fingerprint, so the running device is left alone.
///
/// # Examples
///
/// ```
/// use meter2mqtt::device::DeviceConfig;
/// use meter2mqtt::lifecycle::ConfigFingerprint;
/// use serde_json::json;
///
/// let a = DeviceConfig::from_value(json!({"type": "dsmr", "port": "/dev/ttyUSB0"})).unwrap();
/// let b = DeviceConfig::from_value(json!({"port": "/dev/ttyUSB0", "type": "dsmr"})).unwrap();
/// assert_eq!(ConfigFingerprint::of(&a), ConfigFingerprint::of(&b));
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConfigFingerprint(u128);

impl ConfigFingerprint {
    /// Computes the fingerprint of a configuration.
    #[must_use]
    pub fn of(config: &DeviceConfig) -> Self {
        let mut buf = Vec::with_capacity(256);
        encode_map(config.as_map(), &mut buf);
        Self(xxh3_128(&buf))
    }
}

impl fmt::Display for ConfigFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl fmt::Debug for ConfigFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConfigFingerprint({self})")
    }
}

// Canonical, self-delimiting encoding. Map entries are emitted in sorted key
// order; strings and containers carry their length so no two distinct trees
// share an encoding.

fn encode_len(len: usize, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&(len as u64).to_le_bytes());
}

fn encode_str(s: &str, buf: &mut Vec<u8>) {
    buf.push(b's');
    encode_len(s.len(), buf);
    buf.extend_from_slice(s.as_bytes());
}

fn encode_map(map: &serde_json::Map<String, Value>, buf: &mut Vec<u8>) {
    let mut entries: Vec<(&String, &Value)> = map.iter().collect();
    entries.sort_unstable_by(|a, b| a.0.cmp(b.0));

    buf.push(b'{');
    encode_len(entries.len(), buf);
    for (key, value) in entries {
        encode_str(key, buf);
        encode_value(value, buf);
    }
    buf.push(b'}');
}

fn encode_value(value: &Value, buf: &mut Vec<u8>) {
    match value {
        Value::Null => buf.push(b'n'),
        Value::Bool(true) => buf.push(b't'),
        Value::Bool(false) => buf.push(b'f'),
        Value::Number(n) => {
            buf.push(b'#');
            buf.extend_from_slice(n.to_string().as_bytes());
            buf.push(b';');
        }
        Value::String(s) => encode_str(s, buf),
        Value::Array(items) => {
            buf.push(b'[');
            encode_len(items.len(), buf);
            for item in items {
                encode_value(item, buf);
            }
            buf.push(b']');
        }
        Value::Object(map) => encode_map(map, buf),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, json};

    fn fp(value: Value) -> ConfigFingerprint {
        ConfigFingerprint::of(&DeviceConfig::from_value(value).unwrap())
    }

    #[test]
    fn insertion_order_does_not_matter() {
        let mut forward = Map::new();
        forward.insert("type".into(), json!("multical"));
        forward.insert("port".into(), json!("/dev/ttyUSB1"));
        forward.insert("serial_options".into(), json!({"baudrate": 1200, "parity": "N"}));

        let mut backward = Map::new();
        backward.insert("serial_options".into(), json!({"parity": "N", "baudrate": 1200}));
        backward.insert("port".into(), json!("/dev/ttyUSB1"));
        backward.insert("type".into(), json!("multical"));

        assert_eq!(
            ConfigFingerprint::of(&DeviceConfig::new(forward)),
            ConfigFingerprint::of(&DeviceConfig::new(backward))
        );
    }

    #[test]
    fn any_value_change_is_detected() {
        let base = fp(json!({"type": "dsmr", "port": "/dev/ttyUSB0", "poll_interval": 10}));
        assert_ne!(base, fp(json!({"type": "dsmr", "port": "/dev/ttyUSB1", "poll_interval": 10})));
        assert_ne!(base, fp(json!({"type": "dsmr", "port": "/dev/ttyUSB0", "poll_interval": 11})));
        assert_ne!(base, fp(json!({"type": "dsmr", "port": "/dev/ttyUSB0"})));
        assert_ne!(
            base,
            fp(json!({"type": "dsmr", "port": "/dev/ttyUSB0", "poll_interval": 10, "version": 42}))
        );
    }

    #[test]
    fn value_types_are_distinguished() {
        assert_ne!(fp(json!({"version": 50})), fp(json!({"version": "50"})));
        assert_ne!(fp(json!({"parameters": ["a", "b"]})), fp(json!({"parameters": ["ab"]})));
        assert_ne!(fp(json!({"parameters": []})), fp(json!({"parameters": {}})));
        assert_ne!(fp(json!({"flag": null})), fp(json!({"flag": false})));
    }

    #[test]
    fn list_order_matters() {
        assert_ne!(
            fp(json!({"parameters": ["energy", "power"]})),
            fp(json!({"parameters": ["power", "energy"]}))
        );
    }

    #[test]
    fn display_is_32_hex_digits() {
        let text = fp(json!({"type": "dsmr"})).to_string();
        assert_eq!(text.len(), 32);
        assert!(text.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
