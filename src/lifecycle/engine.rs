// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The lifecycle engine.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use notify::RecommendedWatcher;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::debounce::Debouncer;
use super::fingerprint::ConfigFingerprint;
use super::report::ReconcileReport;
use super::watcher::watch_directory;
use super::DesiredState;
use crate::config::ConfigSource;
use crate::device::{Device, DeviceConfig, DeviceId, DeviceRegistry};
use crate::error::{ConfigError, DeviceError};
use crate::event::{EventBus, LifecycleEvent};

/// A connected device together with the fingerprint of the configuration
/// it was built from.
///
/// Handles stay usable after the engine stops the device; they simply stop
/// being returned by [`LifecycleEngine::get`].
pub struct RunningDevice {
    device: Arc<dyn Device>,
    fingerprint: ConfigFingerprint,
    started_at: DateTime<Utc>,
}

impl RunningDevice {
    /// Returns the device.
    #[must_use]
    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    /// Returns the device identifier.
    #[must_use]
    pub fn id(&self) -> &DeviceId {
        self.device.id()
    }

    /// Returns the fingerprint of the configuration the device runs with.
    #[must_use]
    pub fn fingerprint(&self) -> ConfigFingerprint {
        self.fingerprint
    }

    /// Returns when the device was connected.
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}

impl fmt::Debug for RunningDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningDevice")
            .field("id", self.id())
            .field("type", &self.device.device_type())
            .field("fingerprint", &self.fingerprint)
            .field("started_at", &self.started_at)
            .finish()
    }
}

struct ConfigWatch {
    watcher: RecommendedWatcher,
    debouncer: Debouncer,
}

struct EngineInner {
    registry: Arc<DeviceRegistry>,
    running: RwLock<HashMap<DeviceId, Arc<RunningDevice>>>,
    /// Serialises reconciliation passes and shutdown.
    pass: tokio::sync::Mutex<()>,
    closed: AtomicBool,
    events: EventBus,
    watch: Mutex<Option<ConfigWatch>>,
}

/// Owns the running device set and converges it to the desired state.
///
/// Cloning is cheap; clones share the same device set.
///
/// # Concurrency
///
/// At most one [`reconcile`](Self::reconcile) or
/// [`shutdown`](Self::shutdown) runs at a time. Readers ([`get`](Self::get),
/// [`get_all`](Self::get_all)) never wait for device I/O: the device map is
/// only locked for the instant it takes to insert, remove or copy entries,
/// and blocking device calls run on tokio's blocking pool.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use meter2mqtt::device::{DeviceConfig, DeviceId, DeviceRegistry};
/// use meter2mqtt::lifecycle::{DesiredState, LifecycleEngine};
///
/// # async fn example() {
/// let engine = LifecycleEngine::new(Arc::new(DeviceRegistry::builtin()));
///
/// let mut desired = DesiredState::new();
/// desired.insert(
///     DeviceId::new("p1"),
///     DeviceConfig::from_value(serde_json::json!({
///         "type": "dsmr",
///         "connection": "serial_port",
///         "port": "/dev/ttyUSB0",
///     }))
///     .unwrap(),
/// );
///
/// let report = engine.reconcile(desired).await;
/// println!("{report}");
///
/// engine.shutdown().await;
/// # }
/// ```
#[derive(Clone)]
pub struct LifecycleEngine {
    inner: Arc<EngineInner>,
}

impl LifecycleEngine {
    /// Creates an engine with an empty device set.
    #[must_use]
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self::with_event_bus(registry, EventBus::new())
    }

    /// Creates an engine that reports on the given event bus.
    #[must_use]
    pub fn with_event_bus(registry: Arc<DeviceRegistry>, events: EventBus) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                registry,
                running: RwLock::new(HashMap::new()),
                pass: tokio::sync::Mutex::new(()),
                closed: AtomicBool::new(false),
                events,
                watch: Mutex::new(None),
            }),
        }
    }

    // =========================================================================
    // Read access
    // =========================================================================

    /// Looks up a running device.
    #[must_use]
    pub fn get(&self, id: &DeviceId) -> Option<Arc<RunningDevice>> {
        self.inner.running.read().get(id).cloned()
    }

    /// Returns a copy of the running device set.
    ///
    /// The copy never reflects a later pass.
    #[must_use]
    pub fn get_all(&self) -> BTreeMap<DeviceId, Arc<RunningDevice>> {
        self.inner
            .running
            .read()
            .iter()
            .map(|(id, running)| (id.clone(), Arc::clone(running)))
            .collect()
    }

    /// Returns the number of running devices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.running.read().len()
    }

    /// Returns true if no device is running.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.running.read().is_empty()
    }

    /// Subscribes to lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.inner.events.subscribe()
    }

    /// Returns the event bus the engine reports on.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// Converges the running set to `desired`.
    ///
    /// Removed devices are stopped first. Then every desired device that is
    /// not running is started, and every device whose fingerprint changed
    /// is stopped and started again. Failures are isolated per device and
    /// reported in the returned [`ReconcileReport`]; a device that fails to
    /// start stays absent until the next pass.
    ///
    /// After [`shutdown`](Self::shutdown) this does nothing.
    pub async fn reconcile(&self, desired: DesiredState) -> ReconcileReport {
        let _pass = self.inner.pass.lock().await;
        let mut report = ReconcileReport::default();

        if self.inner.closed.load(Ordering::Acquire) {
            debug!("Engine is shut down, skipping reconciliation");
            return report;
        }

        let current: BTreeMap<DeviceId, ConfigFingerprint> = self
            .inner
            .running
            .read()
            .iter()
            .map(|(id, running)| (id.clone(), running.fingerprint))
            .collect();

        for id in current.keys().filter(|id| !desired.contains_key(*id)) {
            info!(device_id = %id, "Device removed from configuration");
            self.stop(id).await;
            report.stopped.push(id.clone());
        }

        for (id, config) in desired {
            let fingerprint = ConfigFingerprint::of(&config);
            match current.get(&id) {
                Some(old) if *old == fingerprint => report.unchanged.push(id),
                Some(old) => {
                    info!(device_id = %id, old = %old, new = %fingerprint, "Device configuration changed");
                    self.stop(&id).await;
                    if self.start(&id, config, fingerprint).await {
                        report.reloaded.push(id);
                    } else {
                        report.failed.push(id);
                    }
                }
                None => {
                    if self.start(&id, config, fingerprint).await {
                        report.started.push(id);
                    } else {
                        report.failed.push(id);
                    }
                }
            }
        }

        if report.has_changes() {
            info!(summary = %report, "Reconciliation complete");
        } else {
            debug!(summary = %report, "Reconciliation complete");
        }
        self.inner.events.publish(LifecycleEvent::ReconcileCompleted {
            report: report.clone(),
        });
        report
    }

    /// Loads a fresh snapshot from `source` and reconciles against it.
    ///
    /// # Errors
    ///
    /// Returns the load error without touching the running set.
    pub async fn reload(
        &self,
        source: Arc<dyn ConfigSource>,
    ) -> Result<ReconcileReport, ConfigError> {
        let desired = tokio::task::spawn_blocking(move || source.load_snapshot())
            .await
            .map_err(|e| ConfigError::Io(std::io::Error::other(e)))??;
        Ok(self.reconcile(desired).await)
    }

    /// Disconnects every device and stops the config watch.
    ///
    /// Later reconciliation requests are ignored.
    pub async fn shutdown(&self) {
        self.stop_watching().await;

        let _pass = self.inner.pass.lock().await;
        self.inner.closed.store(true, Ordering::Release);

        let ids: Vec<DeviceId> = self.inner.running.read().keys().cloned().collect();
        info!(count = ids.len(), "Stopping all devices");
        for id in &ids {
            self.stop(id).await;
        }
    }

    /// Returns true once [`shutdown`](Self::shutdown) has run.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Constructs, connects and records one device. Returns false if the
    /// device could not be started; the failure is logged and published.
    async fn start(
        &self,
        id: &DeviceId,
        config: DeviceConfig,
        fingerprint: ConfigFingerprint,
    ) -> bool {
        match self.try_start(id, config).await {
            Ok(device) => {
                let device_type = device.device_type();
                self.inner.running.write().insert(
                    id.clone(),
                    Arc::new(RunningDevice {
                        device,
                        fingerprint,
                        started_at: Utc::now(),
                    }),
                );
                info!(device_id = %id, device_type, %fingerprint, "Device started");
                self.inner
                    .events
                    .publish(LifecycleEvent::device_started(id.clone(), device_type));
                true
            }
            Err(e) => {
                error!(device_id = %id, error = %e, "Failed to start device");
                self.inner
                    .events
                    .publish(LifecycleEvent::start_failed(id.clone(), e.to_string()));
                false
            }
        }
    }

    async fn try_start(
        &self,
        id: &DeviceId,
        config: DeviceConfig,
    ) -> Result<Arc<dyn Device>, DeviceError> {
        let type_name = config
            .device_type()
            .ok_or_else(|| DeviceError::InvalidConfig {
                device: id.to_string(),
                key: DeviceConfig::TYPE_KEY.to_string(),
            })?
            .to_string();

        let device = self.inner.registry.create(id.clone(), &type_name, config)?;

        let connecting = Arc::clone(&device);
        tokio::task::spawn_blocking(move || connecting.connect())
            .await
            .map_err(|e| DeviceError::ConnectFailed {
                device: id.to_string(),
                reason: format!("connect task failed: {e}"),
            })??;

        Ok(device)
    }

    /// Disconnects one device, then drops it from the running set.
    ///
    /// A failed disconnect is logged and the entry is removed anyway.
    async fn stop(&self, id: &DeviceId) {
        let entry = self.inner.running.read().get(id).cloned();
        let Some(entry) = entry else {
            return;
        };

        let device = Arc::clone(&entry.device);
        match tokio::task::spawn_blocking(move || device.disconnect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(device_id = %id, error = %e, "Disconnect failed, dropping device anyway"),
            Err(e) => warn!(device_id = %id, error = %e, "Disconnect task failed, dropping device anyway"),
        }

        self.inner.running.write().remove(id);
        info!(device_id = %id, "Device stopped");
        self.inner
            .events
            .publish(LifecycleEvent::device_stopped(id.clone()));
    }

    // =========================================================================
    // Config watch
    // =========================================================================

    /// Watches the source's directory and reconciles after each burst of
    /// changes has been quiet for `window`.
    ///
    /// The directory is created if missing. Calling this again replaces the
    /// previous watch.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or watched.
    pub async fn start_watching(
        &self,
        source: Arc<dyn ConfigSource>,
        window: Duration,
    ) -> Result<(), ConfigError> {
        self.stop_watching().await;

        let dir = source.watch_root().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|source| ConfigError::Directory {
            path: dir.clone(),
            source,
        })?;

        let engine = Arc::downgrade(&self.inner);
        let debouncer = Debouncer::spawn(window, move || {
            reload_after_change(Weak::clone(&engine), Arc::clone(&source))
        });
        let watcher = match watch_directory(&dir, debouncer.handle()) {
            Ok(watcher) => watcher,
            Err(e) => {
                debouncer.close().await;
                return Err(e);
            }
        };

        info!(dir = %dir.display(), window = ?window, "Watching device configs");
        *self.inner.watch.lock() = Some(ConfigWatch { watcher, debouncer });
        Ok(())
    }

    /// Stops the config watch. A reload already running completes first;
    /// a pending one is discarded.
    pub async fn stop_watching(&self) {
        let watch = self.inner.watch.lock().take();
        if let Some(ConfigWatch { watcher, debouncer }) = watch {
            drop(watcher);
            debouncer.close().await;
            debug!("Stopped watching device configs");
        }
    }

    /// Returns true while a config watch is active.
    #[must_use]
    pub fn is_watching(&self) -> bool {
        self.inner.watch.lock().is_some()
    }

    /// Feeds one change notification to the watch debouncer, as if the
    /// directory had changed.
    ///
    /// Returns false when no watch is active.
    pub fn notify_change(&self) -> bool {
        match self.inner.watch.lock().as_ref() {
            Some(watch) => {
                watch.debouncer.trigger();
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for LifecycleEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleEngine")
            .field("running", &self.len())
            .field("watching", &self.is_watching())
            .field("closed", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

async fn reload_after_change(engine: Weak<EngineInner>, source: Arc<dyn ConfigSource>) {
    let Some(inner) = engine.upgrade() else {
        return;
    };
    let engine = LifecycleEngine { inner };
    if let Err(e) = engine.reload(source).await {
        error!(error = %e, "Could not load device configs, skipping reconciliation");
    }
}
