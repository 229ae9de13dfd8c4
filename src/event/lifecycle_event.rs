// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Lifecycle event types.

use crate::device::DeviceId;
use crate::lifecycle::ReconcileReport;

/// Events emitted by the lifecycle engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// A device was constructed, connected and added to the running set.
    DeviceStarted {
        /// The started device.
        device_id: DeviceId,
        /// Its type name.
        device_type: String,
    },

    /// A device was disconnected and removed from the running set.
    DeviceStopped {
        /// The stopped device.
        device_id: DeviceId,
    },

    /// A device could not be constructed or connected.
    ///
    /// It stays absent until its configuration changes.
    DeviceStartFailed {
        /// The device that failed.
        device_id: DeviceId,
        /// Description of the failure.
        reason: String,
    },

    /// A reconciliation pass finished.
    ReconcileCompleted {
        /// What the pass did.
        report: ReconcileReport,
    },
}

impl LifecycleEvent {
    /// Returns the device this event concerns, if any.
    #[must_use]
    pub fn device_id(&self) -> Option<&DeviceId> {
        match self {
            Self::DeviceStarted { device_id, .. }
            | Self::DeviceStopped { device_id }
            | Self::DeviceStartFailed { device_id, .. } => Some(device_id),
            Self::ReconcileCompleted { .. } => None,
        }
    }

    /// Creates a device started event.
    #[must_use]
    pub fn device_started(device_id: DeviceId, device_type: impl Into<String>) -> Self {
        Self::DeviceStarted {
            device_id,
            device_type: device_type.into(),
        }
    }

    /// Creates a device stopped event.
    #[must_use]
    pub fn device_stopped(device_id: DeviceId) -> Self {
        Self::DeviceStopped { device_id }
    }

    /// Creates a start failure event.
    #[must_use]
    pub fn start_failed(device_id: DeviceId, reason: impl Into<String>) -> Self {
        Self::DeviceStartFailed {
            device_id,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_extraction() {
        let id = DeviceId::new("p1");
        assert_eq!(LifecycleEvent::device_started(id.clone(), "dsmr").device_id(), Some(&id));
        assert_eq!(LifecycleEvent::device_stopped(id.clone()).device_id(), Some(&id));
        assert_eq!(LifecycleEvent::start_failed(id.clone(), "refused").device_id(), Some(&id));

        let completed = LifecycleEvent::ReconcileCompleted {
            report: ReconcileReport::default(),
        };
        assert_eq!(completed.device_id(), None);
    }
}
