// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuration loading.
//!
//! Two layers are involved:
//!
//! - The base configuration ([`AppConfig`]): broker, logging and directory
//!   settings from `config.yaml`, overridden by environment variables.
//! - The device configurations: one YAML file per device in the config
//!   directory, loaded as a snapshot by a [`ConfigSource`].

mod base;
mod source;

pub use base::{AppConfig, DeviceSettings, LogFormat, LoggingSettings, MqttSettings};
pub use source::{ConfigSource, DirectorySource, is_device_config_file};
