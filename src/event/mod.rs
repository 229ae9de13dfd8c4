// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Lifecycle notifications.
//!
//! The lifecycle engine reports every device start, stop and failed start,
//! plus a summary after each reconciliation pass, on an [`EventBus`] backed
//! by a tokio broadcast channel.
//!
//! # Examples
//!
//! ```
//! use meter2mqtt::device::DeviceId;
//! use meter2mqtt::event::{EventBus, LifecycleEvent};
//!
//! let bus = EventBus::new();
//! let mut rx = bus.subscribe();
//!
//! bus.publish(LifecycleEvent::device_stopped(DeviceId::new("p1")));
//! assert!(rx.try_recv().is_ok());
//! ```

mod event_bus;
mod lifecycle_event;

pub use event_bus::EventBus;
pub use lifecycle_event::LifecycleEvent;
