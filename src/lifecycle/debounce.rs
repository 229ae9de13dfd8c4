// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Coalescing of bursty change notifications.

use std::future::Future;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tracing::trace;

/// Pending raw events beyond this are dropped; one pending event is
/// enough to re-arm the timer.
const EVENT_BUFFER: usize = 64;

/// Cloneable handle that re-arms a [`Debouncer`].
///
/// Safe to use from any thread, including the file watcher's.
#[derive(Debug, Clone)]
pub struct Trigger {
    tx: mpsc::Sender<()>,
}

impl Trigger {
    #[cfg(test)]
    pub(crate) fn from_sender(tx: mpsc::Sender<()>) -> Self {
        Self { tx }
    }

    /// Records one raw change event.
    pub fn fire(&self) {
        // A full buffer already guarantees a pending run.
        let _ = self.tx.try_send(());
    }
}

/// Runs an action once a burst of events has been quiet for `window`.
///
/// Every event restarts the timer. The action runs on the debouncer's own
/// task, so two runs never overlap; events arriving during a run arm the
/// next one.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use meter2mqtt::lifecycle::Debouncer;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let debouncer = Debouncer::spawn(Duration::from_millis(10), || async {
///     println!("reloading");
/// });
/// debouncer.trigger();
/// debouncer.trigger();
/// debouncer.close().await;
/// # }
/// ```
#[derive(Debug)]
pub struct Debouncer {
    trigger: Trigger,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl Debouncer {
    /// Spawns the debounce task on the current runtime.
    pub fn spawn<F, Fut>(window: Duration, mut action: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
        let (stop, mut stopped) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stopped => return,
                    event = rx.recv() => if event.is_none() { return },
                }

                let timer = sleep(window);
                tokio::pin!(timer);

                loop {
                    tokio::select! {
                        biased;
                        // Stopped while a run was pending: drop it.
                        _ = &mut stopped => return,
                        () = &mut timer => break,
                        event = rx.recv() => match event {
                            Some(()) => {
                                trace!("Debounce timer re-armed");
                                timer.as_mut().reset(Instant::now() + window);
                            }
                            None => return,
                        },
                    }
                }

                action().await;
            }
        });

        Self {
            trigger: Trigger { tx },
            stop,
            task,
        }
    }

    /// Records one raw change event.
    pub fn trigger(&self) {
        self.trigger.fire();
    }

    /// Returns a handle for feeding events from elsewhere.
    #[must_use]
    pub fn handle(&self) -> Trigger {
        self.trigger.clone()
    }

    /// Stops the task and waits for it to finish.
    ///
    /// A run already in progress completes; a pending one is discarded.
    /// Outstanding [`Trigger`] handles become no-ops.
    pub async fn close(self) {
        let _ = self.stop.send(());
        let _ = self.task.await;
    }
}
