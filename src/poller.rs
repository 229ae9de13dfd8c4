// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Periodic reading of running devices.
//!
//! The poller never holds on to devices: every tick it asks the engine for
//! the current set, so devices started, stopped or reloaded between ticks
//! are picked up without coordination.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::device::{DeviceId, Readings};
use crate::error::DeviceError;
use crate::lifecycle::{ConfigFingerprint, LifecycleEngine, RunningDevice};
use crate::publish::{PublishSink, reading_topic};

/// Bookkeeping for one running device.
#[derive(Debug, Clone, Copy)]
struct Schedule {
    fingerprint: ConfigFingerprint,
    last_attempt: Instant,
}

/// Reads due devices and publishes their readings.
#[derive(Debug)]
pub struct Poller<S> {
    engine: LifecycleEngine,
    sink: Arc<S>,
    topic_prefix: String,
    schedules: HashMap<DeviceId, Schedule>,
    paused: bool,
}

impl<S: PublishSink + 'static> Poller<S> {
    /// Creates a poller over the engine's running devices.
    #[must_use]
    pub fn new(engine: LifecycleEngine, sink: Arc<S>, topic_prefix: impl Into<String>) -> Self {
        Self {
            engine,
            sink,
            topic_prefix: topic_prefix.into(),
            schedules: HashMap::new(),
            paused: false,
        }
    }

    /// Runs one polling pass and returns the number of devices read.
    ///
    /// A device is due when it has never been read, when it was restarted
    /// with a different configuration, or when its poll interval has
    /// elapsed since the last attempt. No device is read while the sink is
    /// unavailable.
    pub async fn tick(&mut self) -> usize {
        if !self.sink.is_available() {
            if !self.paused {
                warn!("Publish sink unavailable, pausing reads");
                self.paused = true;
            }
            return 0;
        }
        if self.paused {
            info!("Publish sink available, resuming reads");
            self.paused = false;
        }

        let running = self.engine.get_all();
        self.schedules.retain(|id, _| running.contains_key(id));

        let now = Instant::now();
        let mut reads = Vec::new();
        for (id, device) in running {
            if !self.is_due(&id, &device, now) {
                continue;
            }
            self.schedules.insert(
                id.clone(),
                Schedule {
                    fingerprint: device.fingerprint(),
                    last_attempt: now,
                },
            );

            let reader = Arc::clone(device.device());
            let handle = tokio::task::spawn_blocking(move || reader.read());
            reads.push((device, handle));
        }

        let polled = reads.len();
        for (device, handle) in reads {
            match handle.await {
                Ok(Ok(readings)) => self.publish(&device, readings).await,
                Ok(Err(e)) => log_read_failure(device.id(), &e),
                Err(e) => error!(device_id = %device.id(), error = %e, "Read task failed"),
            }
        }
        polled
    }

    fn is_due(&self, id: &DeviceId, device: &RunningDevice, now: Instant) -> bool {
        match self.schedules.get(id) {
            None => true,
            Some(schedule) if schedule.fingerprint != device.fingerprint() => true,
            Some(schedule) => {
                now.duration_since(schedule.last_attempt) >= device.device().poll_interval()
            }
        }
    }

    async fn publish(&self, device: &RunningDevice, readings: Readings) {
        let device_type = device.device().device_type();
        let mut published = 0usize;
        for (parameter, value) in readings {
            let topic = reading_topic(&self.topic_prefix, device_type, device.id().as_str(), &parameter);
            match self.sink.publish(&topic, value.to_string()).await {
                Ok(()) => published += 1,
                Err(e) => debug!(topic = %topic, error = %e, "Reading not published"),
            }
        }
        trace!(device_id = %device.id(), published, "Readings published");
    }

    /// Spawns the polling loop, ticking every `period`.
    #[must_use]
    pub fn spawn(mut self, period: Duration) -> PollerHandle {
        let (stop, mut stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stopped => break,
                    _ = ticker.tick() => {
                        self.tick().await;
                    }
                }
            }
            debug!("Poller stopped");
        });
        PollerHandle { stop, task }
    }
}

fn log_read_failure(id: &DeviceId, error: &DeviceError) {
    if error.is_transient() {
        warn!(device_id = %id, error = %error, "Read failed, will retry next interval");
    } else {
        error!(device_id = %id, error = %error, "Read failed");
    }
}

/// Handle to a running polling loop.
#[derive(Debug)]
pub struct PollerHandle {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    /// Stops the loop after the pass in progress, if any, completes.
    pub async fn stop(self) {
        let _ = self.stop.send(());
        let _ = self.task.await;
    }
}
