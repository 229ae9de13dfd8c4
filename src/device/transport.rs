// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Serial and TCP links shared by the built-in meter families.
//!
//! A device config selects its link with the `connection` key:
//!
//! - `serial_port` (default): opens `port` with the settings from the
//!   optional `serial_options` mapping.
//! - `network_url`: connects to `url` given as `host[:port]`, default port 23.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use serde_json::{Map, Value};
use serialport::{DataBits, Parity, StopBits};

use super::{DeviceConfig, DeviceId};
use crate::error::DeviceError;

/// Default TCP port for `network_url` connections.
pub const DEFAULT_NETWORK_PORT: u16 = 23;

/// Byte stream to a meter.
pub(crate) trait Link: Read + Write + Send {}

impl<T: Read + Write + Send> Link for T {}

/// How a device reaches its meter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// A local serial port.
    SerialPort,
    /// A TCP endpoint, usually a serial-to-network bridge.
    NetworkUrl,
}

impl ConnectionKind {
    /// Parses the `connection` key. Missing means `serial_port`.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::InvalidValue`] for unknown kinds.
    pub fn from_config(id: &DeviceId, config: &DeviceConfig) -> Result<Self, DeviceError> {
        match config.get("connection") {
            None => Ok(Self::SerialPort),
            Some(Value::String(kind)) if kind == "serial_port" => Ok(Self::SerialPort),
            Some(Value::String(kind)) if kind == "network_url" => Ok(Self::NetworkUrl),
            Some(other) => Err(DeviceError::InvalidValue {
                device: id.to_string(),
                key: "connection".to_string(),
                reason: format!("unknown connection type {other}"),
            }),
        }
    }

    /// Returns the key holding the address for this kind.
    #[must_use]
    pub fn address_key(self) -> &'static str {
        match self {
            Self::SerialPort => "port",
            Self::NetworkUrl => "url",
        }
    }

    /// Returns the keys a config using this kind must contain.
    #[must_use]
    pub fn required_keys(self) -> Vec<&'static str> {
        vec!["connection", self.address_key()]
    }
}

/// Line settings for a serial link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialSettings {
    /// Baud rate.
    pub baud_rate: u32,
    /// Data bits per character.
    pub data_bits: DataBits,
    /// Parity mode.
    pub parity: Parity,
    /// Stop bits.
    pub stop_bits: StopBits,
    /// Read timeout.
    pub timeout: Duration,
}

impl SerialSettings {
    /// Applies overrides from a `serial_options` mapping.
    ///
    /// Recognised keys are `baudrate`, `bytesize`, `parity` (`N`, `E`, `O`),
    /// `stopbits` and `timeout` (seconds). Unknown keys are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::InvalidValue`] for values the serial driver
    /// cannot represent.
    pub fn with_overrides(
        mut self,
        id: &DeviceId,
        options: &Map<String, Value>,
    ) -> Result<Self, DeviceError> {
        let invalid = |key: &str, value: &Value| DeviceError::InvalidValue {
            device: id.to_string(),
            key: format!("serial_options.{key}"),
            reason: format!("unsupported value {value}"),
        };

        for (key, value) in options {
            match key.as_str() {
                "baudrate" => {
                    self.baud_rate = value
                        .as_u64()
                        .and_then(|v| u32::try_from(v).ok())
                        .filter(|v| *v > 0)
                        .ok_or_else(|| invalid(key, value))?;
                }
                "bytesize" => {
                    self.data_bits = match value.as_u64() {
                        Some(5) => DataBits::Five,
                        Some(6) => DataBits::Six,
                        Some(7) => DataBits::Seven,
                        Some(8) => DataBits::Eight,
                        _ => return Err(invalid(key, value)),
                    };
                }
                "parity" => {
                    self.parity = match value.as_str().map(str::to_ascii_uppercase).as_deref() {
                        Some("N") => Parity::None,
                        Some("E") => Parity::Even,
                        Some("O") => Parity::Odd,
                        _ => return Err(invalid(key, value)),
                    };
                }
                "stopbits" => {
                    self.stop_bits = match value.as_u64() {
                        Some(1) => StopBits::One,
                        Some(2) => StopBits::Two,
                        _ => return Err(invalid(key, value)),
                    };
                }
                "timeout" => {
                    self.timeout = value
                        .as_f64()
                        .filter(|secs| *secs > 0.0)
                        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
                        .ok_or_else(|| invalid(key, value))?;
                }
                _ => {}
            }
        }
        Ok(self)
    }
}

/// Resolved link settings for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportConfig {
    /// A local serial port.
    Serial {
        /// Port path, e.g. `/dev/ttyUSB0`.
        path: String,
        /// Line settings.
        settings: SerialSettings,
    },
    /// A TCP endpoint.
    Network {
        /// Host name or address.
        host: String,
        /// TCP port.
        port: u16,
        /// Connect and read timeout.
        timeout: Duration,
    },
}

impl TransportConfig {
    /// Resolves the link settings from a device config.
    ///
    /// `defaults` holds the family's serial line settings before any
    /// `serial_options` overrides are applied.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::InvalidConfig`] when the address key is
    /// missing and [`DeviceError::InvalidValue`] when a value is unusable.
    pub fn from_config(
        id: &DeviceId,
        config: &DeviceConfig,
        defaults: SerialSettings,
    ) -> Result<Self, DeviceError> {
        let kind = ConnectionKind::from_config(id, config)?;
        let address = config
            .get_str(kind.address_key())
            .filter(|address| !address.is_empty())
            .ok_or_else(|| DeviceError::InvalidConfig {
                device: id.to_string(),
                key: kind.address_key().to_string(),
            })?;

        let settings = match config.section("serial_options") {
            Some(options) => defaults.with_overrides(id, options)?,
            None => defaults,
        };

        match kind {
            ConnectionKind::SerialPort => Ok(Self::Serial {
                path: address.to_string(),
                settings,
            }),
            ConnectionKind::NetworkUrl => {
                let (host, port) = split_host_port(address).ok_or_else(|| {
                    DeviceError::InvalidValue {
                        device: id.to_string(),
                        key: "url".to_string(),
                        reason: format!("expected host[:port], got '{address}'"),
                    }
                })?;
                Ok(Self::Network {
                    host,
                    port,
                    timeout: settings.timeout,
                })
            }
        }
    }

    /// Returns a short human-readable description of the endpoint.
    #[must_use]
    pub fn endpoint(&self) -> String {
        match self {
            Self::Serial { path, settings } => format!("{path}@{}", settings.baud_rate),
            Self::Network { host, port, .. } => format!("{host}:{port}"),
        }
    }

    /// Opens the link.
    ///
    /// # Errors
    ///
    /// Returns the driver or socket error if the endpoint is unreachable.
    pub(crate) fn open(&self) -> io::Result<Box<dyn Link>> {
        match self {
            Self::Serial { path, settings } => {
                let port = serialport::new(path, settings.baud_rate)
                    .data_bits(settings.data_bits)
                    .parity(settings.parity)
                    .stop_bits(settings.stop_bits)
                    .timeout(settings.timeout)
                    .open()
                    .map_err(io::Error::from)?;
                Ok(Box::new(port))
            }
            Self::Network {
                host,
                port,
                timeout,
            } => {
                let mut last_err = None;
                for addr in (host.as_str(), *port).to_socket_addrs()? {
                    match TcpStream::connect_timeout(&addr, *timeout) {
                        Ok(stream) => {
                            stream.set_read_timeout(Some(*timeout))?;
                            stream.set_write_timeout(Some(*timeout))?;
                            return Ok(Box::new(stream));
                        }
                        Err(e) => last_err = Some(e),
                    }
                }
                Err(last_err.unwrap_or_else(|| {
                    io::Error::new(io::ErrorKind::NotFound, format!("{host} did not resolve"))
                }))
            }
        }
    }
}

fn split_host_port(url: &str) -> Option<(String, u16)> {
    match url.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse().ok()?;
            (!host.is_empty()).then(|| (host.to_string(), port))
        }
        None => Some((url.to_string(), DEFAULT_NETWORK_PORT)),
    }
}
