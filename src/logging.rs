// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Global `tracing` subscriber setup.

use thiserror::Error;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, Layer, fmt, prelude::*};

use crate::config::{LogFormat, LoggingSettings};

/// Errors raised while installing the subscriber.
#[derive(Debug, Error)]
pub enum LoggingError {
    /// The configured level is not a valid filter directive.
    #[error("invalid log level '{level}': {source}")]
    Filter {
        level: String,
        #[source]
        source: ParseError,
    },

    /// A global subscriber is already installed.
    #[error("cannot install log subscriber: {0}")]
    Init(#[from] TryInitError),
}

/// Builds the filter: `RUST_LOG` when set, otherwise the configured level.
///
/// # Errors
///
/// Returns [`LoggingError::Filter`] if `RUST_LOG` is unset and `level` does
/// not parse.
pub fn filter(level: &str) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(level.to_ascii_lowercase()).map_err(|source| LoggingError::Filter {
        level: level.to_string(),
        source,
    })
}

/// Installs the global subscriber writing to stderr.
///
/// # Errors
///
/// Returns an error for an invalid level or when called twice.
pub fn init(settings: &LoggingSettings) -> Result<(), LoggingError> {
    let filter = filter(&settings.level)?;
    let layer = match settings.format {
        LogFormat::Full => fmt::layer().with_writer(std::io::stderr).boxed(),
        LogFormat::Compact => fmt::layer().compact().with_writer(std::io::stderr).boxed(),
        LogFormat::Pretty => fmt::layer().pretty().with_writer(std::io::stderr).boxed(),
    };
    tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .try_init()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_levels_and_directives() {
        assert!(EnvFilter::try_new("info").is_ok());
        assert!(filter("DEBUG").is_ok());
        assert!(filter("meter2mqtt=trace,rumqttc=warn").is_ok());
    }

    #[test]
    fn second_init_fails() {
        let settings = LoggingSettings::default();
        let _ = init(&settings);
        assert!(matches!(init(&settings), Err(LoggingError::Init(_))));
    }
}
