// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Lookup table from device type names to constructors.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::{Device, DeviceConfig, DeviceId, DsmrDevice, MulticalDevice};
use crate::error::DeviceError;

/// Builds an unconnected device from its identifier and configuration.
pub type DeviceConstructor =
    dyn Fn(DeviceId, DeviceConfig) -> Result<Arc<dyn Device>, DeviceError> + Send + Sync;

/// Maps type names to device constructors.
///
/// Type names are case-insensitive. Registering a name twice replaces the
/// earlier constructor.
///
/// # Examples
///
/// ```
/// use meter2mqtt::device::DeviceRegistry;
///
/// let registry = DeviceRegistry::builtin();
/// assert_eq!(registry.registered_types(), vec!["dsmr", "multical"]);
/// assert!(registry.contains("DSMR"));
/// ```
#[derive(Default)]
pub struct DeviceRegistry {
    constructors: RwLock<HashMap<String, Arc<DeviceConstructor>>>,
}

impl DeviceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in meter families.
    #[must_use]
    pub fn builtin() -> Self {
        let registry = Self::new();
        registry.register(DsmrDevice::TYPE_NAME, |id, config| {
            Ok(Arc::new(DsmrDevice::new(id, config)?) as Arc<dyn Device>)
        });
        registry.register(MulticalDevice::TYPE_NAME, |id, config| {
            Ok(Arc::new(MulticalDevice::new(id, config)?) as Arc<dyn Device>)
        });
        registry
    }

    /// Registers a constructor for a type name, replacing any previous one.
    pub fn register<F>(&self, type_name: &str, constructor: F)
    where
        F: Fn(DeviceId, DeviceConfig) -> Result<Arc<dyn Device>, DeviceError>
            + Send
            + Sync
            + 'static,
    {
        let key = type_name.to_lowercase();
        debug!(device_type = %key, "Registered device type");
        self.constructors.write().insert(key, Arc::new(constructor));
    }

    /// Returns true if a constructor is registered for the type name.
    #[must_use]
    pub fn contains(&self, type_name: &str) -> bool {
        self.constructors
            .read()
            .contains_key(&type_name.to_lowercase())
    }

    /// Returns the registered type names in sorted order.
    #[must_use]
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.constructors.read().keys().cloned().collect();
        types.sort();
        types
    }

    /// Constructs and validates a device. Never connects it.
    ///
    /// # Errors
    ///
    /// - [`DeviceError::UnknownType`] if no constructor is registered.
    /// - [`DeviceError::InvalidConfig`] naming the first missing required
    ///   key, or any error the constructor itself reports.
    pub fn create(
        &self,
        id: DeviceId,
        type_name: &str,
        config: DeviceConfig,
    ) -> Result<Arc<dyn Device>, DeviceError> {
        let constructor = self.constructors.read().get(&type_name.to_lowercase()).cloned();
        let Some(constructor) = constructor else {
            return Err(DeviceError::UnknownType {
                type_name: type_name.to_string(),
                known: self.registered_types(),
            });
        };

        let device = constructor(id, config)?;

        if let Some(key) = device
            .required_config_keys()
            .into_iter()
            .find(|key| !device.config().contains_key(key))
        {
            return Err(DeviceError::InvalidConfig {
                device: device.id().to_string(),
                key: key.to_string(),
            });
        }

        Ok(device)
    }
}

impl fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("types", &self.registered_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Readings;
    use serde_json::json;

    #[derive(Debug)]
    struct Stub {
        id: DeviceId,
        config: DeviceConfig,
        kind: &'static str,
    }

    impl Device for Stub {
        fn id(&self) -> &DeviceId {
            &self.id
        }
        fn config(&self) -> &DeviceConfig {
            &self.config
        }
        fn device_type(&self) -> &'static str {
            self.kind
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
            &[]
        }
        fn required_config_keys(&self) -> Vec<&'static str> {
            vec!["address"]
        }
    }

    fn stub(
        kind: &'static str,
    ) -> impl Fn(DeviceId, DeviceConfig) -> Result<Arc<dyn Device>, DeviceError> + Send + Sync + 'static
    {
        move |id, config| Ok(Arc::new(Stub { id, config, kind }) as Arc<dyn Device>)
    }

    fn config(value: serde_json::Value) -> DeviceConfig {
        DeviceConfig::from_value(value).unwrap()
    }

    #[test]
    fn unknown_type_is_rejected() {
        let registry = DeviceRegistry::builtin();
        let err = registry
            .create(DeviceId::new("x"), "warmtelink", config(json!({"type": "warmtelink"})))
            .unwrap_err();
        match err {
            DeviceError::UnknownType { type_name, known } => {
                assert_eq!(type_name, "warmtelink");
                assert_eq!(known, vec!["dsmr", "multical"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let registry = DeviceRegistry::new();
        registry.register("Stub", stub("stub"));
        let device = registry
            .create(DeviceId::new("a"), "STUB", config(json!({"type": "STUB", "address": 1})))
            .unwrap();
        assert_eq!(device.device_type(), "stub");
    }

    #[test]
    fn missing_required_key_is_invalid_config() {
        let registry = DeviceRegistry::new();
        registry.register("stub", stub("stub"));
        let err = registry
            .create(DeviceId::new("a"), "stub", config(json!({"type": "stub"})))
            .unwrap_err();
        assert!(matches!(err, DeviceError::InvalidConfig { ref key, .. } if key == "address"));
    }

    #[test]
    fn last_registration_wins() {
        let registry = DeviceRegistry::new();
        registry.register("stub", stub("first"));
        registry.register("stub", stub("second"));
        let device = registry
            .create(DeviceId::new("a"), "stub", config(json!({"type": "stub", "address": 1})))
            .unwrap();
        assert_eq!(device.device_type(), "second");
        assert_eq!(registry.registered_types(), vec!["stub"]);
    }

    #[test]
    fn builtin_dsmr_requires_connection_key() {
        let registry = DeviceRegistry::builtin();
        let err = registry
            .create(
                DeviceId::new("p1"),
                "dsmr",
                config(json!({"type": "dsmr", "port": "/dev/ttyUSB0"})),
            )
            .unwrap_err();
        assert!(matches!(err, DeviceError::InvalidConfig { ref key, .. } if key == "connection"));
    }

    #[test]
    fn builtin_multical_requires_address() {
        let registry = DeviceRegistry::builtin();
        let err = registry
            .create(
                DeviceId::new("heat"),
                "multical",
                config(json!({"type": "multical", "connection": "network_url"})),
            )
            .unwrap_err();
        assert!(matches!(err, DeviceError::InvalidConfig { ref key, .. } if key == "url"));
    }

    #[test]
    fn create_never_connects() {
        let registry = DeviceRegistry::builtin();
        let device = registry
            .create(
                DeviceId::new("heat"),
                "multical",
                config(json!({"type": "multical", "connection": "serial_port", "port": "/dev/does-not-exist"})),
            )
            .unwrap();
        assert!(matches!(device.read(), Err(DeviceError::NotConnected(_))));
    }
}
