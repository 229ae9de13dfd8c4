// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device lifecycle and reconciliation.
//!
//! The [`LifecycleEngine`] owns the set of running devices and converges it
//! to a desired-state snapshot taken from a
//! [`ConfigSource`](crate::config::ConfigSource):
//!
//! - devices no longer desired are disconnected and dropped,
//! - new devices are constructed through the registry and connected,
//! - devices whose [`ConfigFingerprint`] changed are stopped, then started
//!   again from the new configuration,
//! - everything else is left alone.
//!
//! Change notifications from the config directory are coalesced by a
//! [`Debouncer`] so that one edit triggers one pass.

mod debounce;
mod engine;
mod fingerprint;
mod report;
mod watcher;

pub use debounce::{Debouncer, Trigger};
pub use engine::{LifecycleEngine, RunningDevice};
pub use fingerprint::ConfigFingerprint;
pub use report::ReconcileReport;

use std::collections::BTreeMap;

use crate::device::{DeviceConfig, DeviceId};

/// Snapshot of the devices that should be running.
pub type DesiredState = BTreeMap<DeviceId, DeviceConfig>;
