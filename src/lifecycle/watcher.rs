// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! File system watch on the device config directory.

use std::path::Path;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{trace, warn};

use super::debounce::Trigger;
use crate::config::is_device_config_file;
use crate::error::ConfigError;

/// Starts watching `dir` and fires `trigger` for every relevant event.
///
/// The watch lasts until the returned watcher is dropped.
pub(crate) fn watch_directory(dir: &Path, trigger: Trigger) -> Result<RecommendedWatcher, ConfigError> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) if is_relevant(&event) => {
            trace!(paths = ?event.paths, kind = ?event.kind, "Config change detected");
            trigger.fire();
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Config watcher error"),
    })?;
    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

/// Returns true for create, modify and remove events (renames included)
/// touching at least one device config file.
fn is_relevant(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) && event.paths.iter().any(|path| is_device_config_file(path))
}
