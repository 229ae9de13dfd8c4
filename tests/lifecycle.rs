// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Integration tests for device lifecycle reconciliation.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use meter2mqtt::device::Readings;
use meter2mqtt::lifecycle::DesiredState;
use meter2mqtt::{
    ConfigError, ConfigSource, Device, DeviceConfig, DeviceError, DeviceId, DeviceRegistry,
    DirectorySource, LifecycleEngine, LifecycleEvent,
};
use parking_lot::Mutex;
use serde_json::{Value, json};

// ============================================================================
// Recording device
// ============================================================================

/// Shared log of connect/disconnect calls, as `"connect a@1"` etc.
type Journal = Arc<Mutex<Vec<String>>>;

#[derive(Debug)]
struct Recorder {
    id: DeviceId,
    config: DeviceConfig,
    journal: Journal,
}

impl Recorder {
    fn label(&self) -> String {
        match self.config.get_text("rev") {
            Some(rev) => format!("{}@{rev}", self.id),
            None => self.id.to_string(),
        }
    }
}

impl Device for Recorder {
    fn id(&self) -> &DeviceId {
        &self.id
    }

    fn config(&self) -> &DeviceConfig {
        &self.config
    }

    fn device_type(&self) -> &'static str {
        "recorder"
    }

    fn connect(&self) -> Result<(), DeviceError> {
        self.journal.lock().push(format!("connect {}", self.label()));
        if self.config.contains_key("unreachable") {
            return Err(DeviceError::ConnectFailed {
                device: self.id.to_string(),
                reason: "no answer".to_string(),
            });
        }
        Ok(())
    }

    fn disconnect(&self) -> Result<(), DeviceError> {
        self.journal.lock().push(format!("disconnect {}", self.label()));
        if self.config.contains_key("sticky") {
            return Err(DeviceError::DisconnectFailed {
                device: self.id.to_string(),
                reason: "port busy".to_string(),
            });
        }
        Ok(())
    }

    fn read(&self) -> Result<Readings, DeviceError> {
        Ok(Readings::new())
    }

    fn available_parameters(&self) -> &[&'static str] {
        &["energy"]
    }

    fn required_config_keys(&self) -> Vec<&'static str> {
        vec!["port"]
    }
}

fn registry(journal: &Journal) -> Arc<DeviceRegistry> {
    let journal = Arc::clone(journal);
    let registry = DeviceRegistry::new();
    registry.register("recorder", move |id, config| {
        Ok(Arc::new(Recorder {
            id,
            config,
            journal: Arc::clone(&journal),
        }) as Arc<dyn Device>)
    });
    Arc::new(registry)
}

fn engine() -> (LifecycleEngine, Journal) {
    let journal = Journal::default();
    (LifecycleEngine::new(registry(&journal)), journal)
}

fn desired(entries: &[(&str, Value)]) -> DesiredState {
    entries
        .iter()
        .map(|(id, value)| (DeviceId::new(*id), DeviceConfig::from_value(value.clone()).unwrap()))
        .collect()
}

fn ids(names: &[&str]) -> Vec<DeviceId> {
    names.iter().copied().map(DeviceId::new).collect()
}

fn take(journal: &Journal) -> Vec<String> {
    std::mem::take(&mut *journal.lock())
}

// ============================================================================
// Reconciliation
// ============================================================================

mod reconcile {
    use super::*;

    #[tokio::test]
    async fn add_edit_remove_scenario() {
        let (engine, journal) = engine();

        let report = engine
            .reconcile(desired(&[
                ("a", json!({"type": "recorder", "port": "/dev/ttyUSB0", "rev": 1})),
                ("b", json!({"type": "recorder", "port": "/dev/ttyUSB1"})),
            ]))
            .await;
        assert_eq!(report.started, ids(&["a", "b"]));
        assert_eq!(engine.len(), 2);
        assert_eq!(take(&journal), vec!["connect a@1", "connect b"]);

        let report = engine
            .reconcile(desired(&[
                ("a", json!({"type": "recorder", "port": "/dev/ttyUSB0", "rev": 2})),
                ("b", json!({"type": "recorder", "port": "/dev/ttyUSB1"})),
            ]))
            .await;
        assert_eq!(report.reloaded, ids(&["a"]));
        assert_eq!(report.unchanged, ids(&["b"]));
        assert_eq!(take(&journal), vec!["disconnect a@1", "connect a@2"]);

        let report = engine
            .reconcile(desired(&[(
                "a",
                json!({"type": "recorder", "port": "/dev/ttyUSB0", "rev": 2}),
            )]))
            .await;
        assert_eq!(report.stopped, ids(&["b"]));
        assert_eq!(report.unchanged, ids(&["a"]));
        assert_eq!(take(&journal), vec!["disconnect b"]);
        assert!(engine.get(&DeviceId::new("b")).is_none());
    }

    #[tokio::test]
    async fn removal_and_addition_in_one_pass_leave_unchanged_device_alone() {
        let (engine, journal) = engine();
        let cfg_b = json!({"type": "recorder", "port": "/dev/ttyUSB1"});

        engine
            .reconcile(desired(&[
                ("a", json!({"type": "recorder", "port": "/dev/ttyUSB0"})),
                ("b", cfg_b.clone()),
            ]))
            .await;
        assert_eq!(take(&journal), vec!["connect a", "connect b"]);

        let report = engine
            .reconcile(desired(&[
                ("b", cfg_b),
                ("c", json!({"type": "recorder", "port": "/dev/ttyUSB2"})),
            ]))
            .await;

        assert_eq!(report.stopped, ids(&["a"]));
        assert_eq!(report.started, ids(&["c"]));
        assert_eq!(report.unchanged, ids(&["b"]));
        let entries = take(&journal);
        assert_eq!(entries, vec!["disconnect a", "connect c"]);
        assert!(entries.iter().all(|entry| !entry.ends_with(" b")));
        assert_eq!(engine.get_all().into_keys().collect::<Vec<_>>(), ids(&["b", "c"]));
    }

    #[tokio::test]
    async fn identical_snapshot_is_a_no_op() {
        let (engine, journal) = engine();
        let state = desired(&[("a", json!({"type": "recorder", "port": "/dev/ttyUSB0"}))]);

        engine.reconcile(state.clone()).await;
        let before = engine.get(&DeviceId::new("a")).unwrap();
        take(&journal);

        let report = engine.reconcile(state).await;

        assert!(!report.has_changes());
        assert_eq!(report.unchanged, ids(&["a"]));
        assert!(take(&journal).is_empty());
        let after = engine.get(&DeviceId::new("a")).unwrap();
        assert!(Arc::ptr_eq(&before, &after));
    }

    #[tokio::test]
    async fn key_order_does_not_trigger_reload() {
        let (engine, journal) = engine();
        engine
            .reconcile(desired(&[(
                "a",
                json!({"type": "recorder", "port": "/dev/ttyUSB0", "serial_options": {"baudrate": 9600, "parity": "E"}}),
            )]))
            .await;
        take(&journal);

        let report = engine
            .reconcile(desired(&[(
                "a",
                json!({"serial_options": {"parity": "E", "baudrate": 9600}, "port": "/dev/ttyUSB0", "type": "recorder"}),
            )]))
            .await;

        assert_eq!(report.unchanged, ids(&["a"]));
        assert!(take(&journal).is_empty());
    }

    #[tokio::test]
    async fn failures_are_isolated() {
        let (engine, _) = engine();

        let report = engine
            .reconcile(desired(&[
                ("good", json!({"type": "recorder", "port": "/dev/ttyUSB0"})),
                ("offline", json!({"type": "recorder", "port": "/dev/ttyUSB1", "unreachable": true})),
                ("portless", json!({"type": "recorder"})),
                ("alien", json!({"type": "warmtelink", "port": "/dev/ttyUSB2"})),
            ]))
            .await;

        assert_eq!(report.started, ids(&["good"]));
        assert_eq!(report.failed, ids(&["alien", "offline", "portless"]));
        assert_eq!(engine.get_all().keys().cloned().collect::<Vec<_>>(), ids(&["good"]));
    }

    #[tokio::test]
    async fn failed_device_is_retried_on_next_pass() {
        let (engine, journal) = engine();
        let state = desired(&[(
            "a",
            json!({"type": "recorder", "port": "/dev/ttyUSB0", "unreachable": true}),
        )]);

        engine.reconcile(state.clone()).await;
        let report = engine.reconcile(state).await;

        assert_eq!(report.failed, ids(&["a"]));
        assert_eq!(take(&journal), vec!["connect a", "connect a"]);
    }

    #[tokio::test]
    async fn failed_disconnect_still_removes_device() {
        let (engine, journal) = engine();
        engine
            .reconcile(desired(&[(
                "a",
                json!({"type": "recorder", "port": "/dev/ttyUSB0", "sticky": true}),
            )]))
            .await;

        let report = engine.reconcile(DesiredState::new()).await;

        assert_eq!(report.stopped, ids(&["a"]));
        assert!(engine.is_empty());
        assert_eq!(take(&journal), vec!["connect a", "disconnect a"]);
    }

    #[tokio::test]
    async fn changed_type_goes_through_registry_again() {
        let (engine, _) = engine();
        engine
            .reconcile(desired(&[("a", json!({"type": "recorder", "port": "/dev/ttyUSB0"}))]))
            .await;

        let report = engine
            .reconcile(desired(&[("a", json!({"type": "nonexistent", "port": "/dev/ttyUSB0"}))]))
            .await;

        assert_eq!(report.failed, ids(&["a"]));
        assert!(engine.is_empty());
    }

    #[tokio::test]
    async fn concurrent_passes_are_serialized() {
        let (engine, journal) = engine();
        let first = engine.clone();
        let second = engine.clone();

        let a = tokio::spawn(async move {
            first
                .reconcile(desired(&[("a", json!({"type": "recorder", "port": "/dev/ttyUSB0"}))]))
                .await
        });
        let b = tokio::spawn(async move {
            second
                .reconcile(desired(&[("a", json!({"type": "recorder", "port": "/dev/ttyUSB0"}))]))
                .await
        });
        let (a, b) = (a.await.unwrap(), b.await.unwrap());

        assert_eq!(a.started.len() + b.started.len(), 1);
        assert_eq!(a.unchanged.len() + b.unchanged.len(), 1);
        assert_eq!(take(&journal), vec!["connect a"]);
    }
}

// ============================================================================
// Events and shutdown
// ============================================================================

mod shutdown {
    use super::*;

    #[tokio::test]
    async fn disconnects_everything_and_refuses_more_work() {
        let (engine, journal) = engine();
        engine
            .reconcile(desired(&[
                ("a", json!({"type": "recorder", "port": "/dev/ttyUSB0"})),
                ("b", json!({"type": "recorder", "port": "/dev/ttyUSB1"})),
            ]))
            .await;
        take(&journal);
        let mut events = engine.subscribe();

        engine.shutdown().await;

        assert!(engine.is_empty());
        let mut log = take(&journal);
        log.sort();
        assert_eq!(log, vec!["disconnect a", "disconnect b"]);
        assert!(matches!(events.recv().await.unwrap(), LifecycleEvent::DeviceStopped { .. }));
        assert!(matches!(events.recv().await.unwrap(), LifecycleEvent::DeviceStopped { .. }));

        let report = engine
            .reconcile(desired(&[("c", json!({"type": "recorder", "port": "/dev/ttyUSB2"}))]))
            .await;
        assert!(!report.has_changes());
        assert!(engine.is_empty());
        assert!(take(&journal).is_empty());
    }

    #[tokio::test]
    async fn reload_events_are_ordered() {
        let (engine, _) = engine();
        engine
            .reconcile(desired(&[("a", json!({"type": "recorder", "port": "/dev/ttyUSB0"}))]))
            .await;
        let mut events = engine.subscribe();

        engine
            .reconcile(desired(&[("a", json!({"type": "recorder", "port": "/dev/ttyUSB9"}))]))
            .await;

        assert_eq!(
            events.recv().await.unwrap(),
            LifecycleEvent::device_stopped(DeviceId::new("a"))
        );
        assert_eq!(
            events.recv().await.unwrap(),
            LifecycleEvent::device_started(DeviceId::new("a"), "recorder")
        );
        match events.recv().await.unwrap() {
            LifecycleEvent::ReconcileCompleted { report } => {
                assert_eq!(report.reloaded, ids(&["a"]));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}

// ============================================================================
// Directory source and watch
// ============================================================================

mod directory {
    use super::*;

    fn write(dir: &Path, name: &str, content: &str) {
        std::fs::write(dir.join(name), content).unwrap();
    }

    #[tokio::test]
    async fn reload_follows_directory_contents() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.yaml", "type: recorder\nport: /dev/ttyUSB0\n");
        write(dir.path(), "b.yml", "type: recorder\nport: /dev/ttyUSB1\n");
        let source: Arc<dyn ConfigSource> = Arc::new(DirectorySource::new(dir.path()));
        let (engine, _) = engine();

        let report = engine.reload(Arc::clone(&source)).await.unwrap();
        assert_eq!(report.started, ids(&["a", "b"]));

        std::fs::remove_file(dir.path().join("b.yml")).unwrap();
        write(dir.path(), "a.yaml", "type: recorder\nport: /dev/ttyUSB3\n");

        let report = engine.reload(source).await.unwrap();
        assert_eq!(report.stopped, ids(&["b"]));
        assert_eq!(report.reloaded, ids(&["a"]));
    }

    #[tokio::test]
    async fn unreadable_directory_leaves_devices_running() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.yaml", "type: recorder\nport: /dev/ttyUSB0\n");
        let (engine, journal) = engine();
        engine
            .reload(Arc::new(DirectorySource::new(dir.path())))
            .await
            .unwrap();
        take(&journal);

        let missing = Arc::new(DirectorySource::new(dir.path().join("gone")));
        let result = engine.reload(missing).await;

        assert!(matches!(result, Err(ConfigError::Directory { .. })));
        assert_eq!(engine.len(), 1);
        assert!(take(&journal).is_empty());
    }

    #[tokio::test]
    async fn watch_picks_up_new_files() {
        let dir = tempfile::tempdir().unwrap();
        let config_dir = dir.path().join("config.d");
        let (engine, _) = engine();

        engine
            .start_watching(
                Arc::new(DirectorySource::new(&config_dir)),
                Duration::from_millis(50),
            )
            .await
            .unwrap();
        assert!(config_dir.is_dir());
        assert!(engine.is_watching());

        write(&config_dir, "p1.yaml", "type: recorder\nport: /dev/ttyUSB0\n");

        let appeared = tokio::time::timeout(Duration::from_secs(5), async {
            while engine.get(&DeviceId::new("p1")).is_none() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(appeared.is_ok(), "device was not started after file creation");

        engine.shutdown().await;
        assert!(!engine.is_watching());
    }

    /// Source that counts snapshot loads.
    #[derive(Debug)]
    struct Counting {
        root: PathBuf,
        loads: AtomicUsize,
    }

    impl ConfigSource for Counting {
        fn load_snapshot(&self) -> Result<DesiredState, ConfigError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(DesiredState::new())
        }

        fn watch_root(&self) -> &Path {
            &self.root
        }
    }

    #[tokio::test(start_paused = true)]
    async fn bursts_of_changes_reload_once() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(Counting {
            root: dir.path().to_path_buf(),
            loads: AtomicUsize::new(0),
        });
        let (engine, _) = engine();
        engine
            .start_watching(Arc::clone(&source) as Arc<dyn ConfigSource>, Duration::from_secs(1))
            .await
            .unwrap();

        for _ in 0..20 {
            assert!(engine.notify_change());
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(source.loads.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);

        engine.notify_change();
        engine.stop_watching().await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);
    }
}
