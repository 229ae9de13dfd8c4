// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device identifier type.

use std::borrow::Borrow;
use std::fmt;
use std::path::Path;

/// Identifier of a configured device.
///
/// The identifier is the stem of the device's config file name, so
/// `config.d/kitchen_heater.yaml` yields `kitchen_heater`. It stays stable
/// across reloads for as long as the file exists.
///
/// # Examples
///
/// ```
/// use meter2mqtt::device::DeviceId;
///
/// let id = DeviceId::new("kitchen_heater");
/// assert_eq!(id.as_str(), "kitchen_heater");
/// ```
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(String);

impl DeviceId {
    /// Creates an identifier from any string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derives the identifier from a config file path (its stem).
    ///
    /// Returns `None` for paths without a UTF-8 file stem.
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        path.file_stem()
            .and_then(|stem| stem.to_str())
            .filter(|stem| !stem.is_empty())
            .map(Self::new)
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", self.0)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl Borrow<str> for DeviceId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_path_uses_file_stem() {
        let id = DeviceId::from_path(Path::new("config.d/kitchen_heater.yaml")).unwrap();
        assert_eq!(id.as_str(), "kitchen_heater");
    }

    #[test]
    fn from_path_rejects_missing_stem() {
        assert!(DeviceId::from_path(Path::new("/")).is_none());
    }

    #[test]
    fn display_and_debug() {
        let id = DeviceId::new("p1");
        assert_eq!(id.to_string(), "p1");
        assert_eq!(format!("{id:?}"), "DeviceId(p1)");
    }

    #[test]
    fn borrow_allows_str_lookup() {
        use std::collections::HashMap;

        let mut map = HashMap::new();
        map.insert(DeviceId::new("a"), 1);
        assert_eq!(map.get("a"), Some(&1));
    }

    #[test]
    fn ordering_is_lexicographic() {
        let mut ids = vec![DeviceId::new("c"), DeviceId::new("a"), DeviceId::new("b")];
        ids.sort();
        assert_eq!(ids, vec!["a".into(), "b".into(), DeviceId::new("c")]);
    }
}
