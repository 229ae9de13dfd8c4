// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `meter2mqtt` - read utility meters and publish their readings over MQTT.
//!
//! Each meter is declared by one YAML file in a config directory. The
//! [`LifecycleEngine`] keeps the set of connected meters in line with that
//! directory: when files are added, edited or removed it starts, restarts
//! or stops exactly the affected meters and leaves the others alone.
//!
//! # Supported Meters
//!
//! - `dsmr`: Dutch/Belgian smart meters (P1 port telegrams)
//! - `multical`: Kamstrup Multical heat meters (KMP over optical head)
//!
//! Both are reached over a serial port or a TCP serial bridge.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use meter2mqtt::{AppConfig, Daemon, DeviceRegistry};
//!
//! #[tokio::main]
//! async fn main() -> meter2mqtt::Result<()> {
//!     let settings = AppConfig::load("config.yaml".as_ref())?;
//!     let daemon = Daemon::start(settings, Arc::new(DeviceRegistry::builtin())).await?;
//!     daemon.run_until_signal().await
//! }
//! ```
//!
//! ## Reconciling by Hand
//!
//! ```no_run
//! use std::sync::Arc;
//! use meter2mqtt::{Device, DeviceRegistry, DirectorySource, LifecycleEngine};
//!
//! # async fn example() -> meter2mqtt::Result<()> {
//! let engine = LifecycleEngine::new(Arc::new(DeviceRegistry::builtin()));
//! let report = engine.reload(Arc::new(DirectorySource::new("config.d"))).await?;
//! println!("{report}");
//!
//! for (id, running) in engine.get_all() {
//!     println!("{id}: {:?}", running.device().read());
//! }
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
mod daemon;
pub mod device;
pub mod error;
pub mod event;
pub mod lifecycle;
pub mod logging;
mod poller;
pub mod publish;

pub use config::{AppConfig, ConfigSource, DirectorySource};
pub use daemon::Daemon;
pub use device::{Device, DeviceConfig, DeviceId, DeviceRegistry, Reading, Readings};
pub use error::{ConfigError, DeviceError, Error, PublishError, Result};
pub use event::{EventBus, LifecycleEvent};
pub use lifecycle::{DesiredState, LifecycleEngine, ReconcileReport, RunningDevice};
pub use poller::{Poller, PollerHandle};
pub use publish::{MqttPublisher, PublishSink};
