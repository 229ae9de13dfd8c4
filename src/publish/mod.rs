// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Outbound side: where readings go.
//!
//! Readings are published to `<prefix>/<device type>/<device id>/<parameter>`
//! with the value's display text as payload.

mod mqtt;

pub use mqtt::MqttPublisher;

use std::future::Future;

use crate::error::PublishError;

/// Destination for readings.
pub trait PublishSink: Send + Sync {
    /// Publishes one payload.
    ///
    /// # Errors
    ///
    /// Returns an error when the sink is unavailable or rejects the message.
    fn publish(
        &self,
        topic: &str,
        payload: String,
    ) -> impl Future<Output = Result<(), PublishError>> + Send;

    /// Returns whether publishing is currently expected to succeed.
    fn is_available(&self) -> bool;
}

/// Builds the topic for one reading.
///
/// # Examples
///
/// ```
/// use meter2mqtt::publish::reading_topic;
///
/// assert_eq!(
///     reading_topic("meters", "dsmr", "p1", "electricity_used_tariff_1"),
///     "meters/dsmr/p1/electricity_used_tariff_1"
/// );
/// ```
#[must_use]
pub fn reading_topic(prefix: &str, device_type: &str, device_id: &str, parameter: &str) -> String {
    prefixed_topic(prefix, &format!("{device_type}/{device_id}/{parameter}"))
}

/// Joins `topic` under `prefix`, ignoring trailing slashes on the prefix.
#[must_use]
pub fn prefixed_topic(prefix: &str, topic: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        topic.to_string()
    } else {
        format!("{prefix}/{topic}")
    }
}
