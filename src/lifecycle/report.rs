// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Outcome of a reconciliation pass.

use std::fmt;

use crate::device::DeviceId;

/// What one reconciliation pass did, per device.
///
/// A changed device whose restart failed appears in `failed` only; its old
/// session is gone either way.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Newly desired devices that connected.
    pub started: Vec<DeviceId>,
    /// Devices restarted because their configuration changed.
    pub reloaded: Vec<DeviceId>,
    /// Devices stopped because they are no longer desired.
    pub stopped: Vec<DeviceId>,
    /// Devices that could not be constructed or connected.
    pub failed: Vec<DeviceId>,
    /// Running devices whose configuration did not change.
    pub unchanged: Vec<DeviceId>,
}

impl ReconcileReport {
    /// Returns true if the pass started or stopped anything, or tried to.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        !(self.started.is_empty()
            && self.reloaded.is_empty()
            && self.stopped.is_empty()
            && self.failed.is_empty())
    }
}

impl fmt::Display for ReconcileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "started={} reloaded={} stopped={} failed={} unchanged={}",
            self.started.len(),
            self.reloaded.len(),
            self.stopped.len(),
            self.failed.len(),
            self.unchanged.len()
        )
    }
}
