// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Dutch smart meter (DSMR) P1 port adapter.
//!
//! The meter pushes a plain-text telegram every few seconds. A telegram
//! starts with a `/` identification line, carries one OBIS object per line
//! and ends with `!` followed by a CRC-16 (DSMR 4 and later):
//!
//! ```text
//! /ISk5\2MT382-1000
//!
//! 1-0:1.8.1(123456.789*kWh)
//! 1-0:1.7.0(01.193*kW)
//! 0-1:24.2.1(101209112500W)(12785.123*m3)
//! !EF2F
//! ```

use std::fmt;
use std::io::{ErrorKind, Read};
use std::time::Duration;

use parking_lot::Mutex;
use serialport::{DataBits, Parity, StopBits};
use tracing::{debug, info};

use super::transport::Link;
use super::{ConnectionKind, Device, DeviceConfig, DeviceId, Reading, Readings, SerialSettings, TransportConfig};
use crate::error::DeviceError;

const DEFAULT_VERSION: &str = "50";

const SERIAL_DEFAULTS: SerialSettings = SerialSettings {
    baud_rate: 115_200,
    data_bits: DataBits::Eight,
    parity: Parity::None,
    stop_bits: StopBits::One,
    timeout: Duration::from_secs(20),
};

/// Upper bound on buffered bytes while waiting for a complete telegram.
const MAX_TELEGRAM_LEN: usize = 16 * 1024;

const PARAMETERS: &[&str] = &[
    "current_electricity_usage",
    "current_electricity_delivery",
    "electricity_used_tariff_1",
    "electricity_used_tariff_2",
    "electricity_delivered_tariff_1",
    "electricity_delivered_tariff_2",
    "electricity_active_import_total",
    "electricity_active_export_total",
    "gas_provided",
    "voltage_l1",
    "voltage_l2",
    "voltage_l3",
    "current_l1",
    "current_l2",
    "current_l3",
    "power_generated_l1",
    "power_generated_l2",
    "power_generated_l3",
];

/// Maps a parameter name to its OBIS reference.
///
/// Gas is reported on whichever M-Bus channel the meter is attached to, so
/// its reference omits the channel.
fn obis_reference(parameter: &str) -> Option<&'static str> {
    Some(match parameter {
        "current_electricity_usage" => "1-0:1.7.0",
        "current_electricity_delivery" => "1-0:2.7.0",
        "electricity_used_tariff_1" => "1-0:1.8.1",
        "electricity_used_tariff_2" => "1-0:1.8.2",
        "electricity_delivered_tariff_1" => "1-0:2.8.1",
        "electricity_delivered_tariff_2" => "1-0:2.8.2",
        "electricity_active_import_total" => "1-0:1.8.0",
        "electricity_active_export_total" => "1-0:2.8.0",
        "gas_provided" => ":24.2.1",
        "voltage_l1" => "1-0:32.7.0",
        "voltage_l2" => "1-0:52.7.0",
        "voltage_l3" => "1-0:72.7.0",
        "current_l1" => "1-0:31.7.0",
        "current_l2" => "1-0:51.7.0",
        "current_l3" => "1-0:71.7.0",
        "power_generated_l1" => "1-0:22.7.0",
        "power_generated_l2" => "1-0:42.7.0",
        "power_generated_l3" => "1-0:62.7.0",
        _ => return None,
    })
}

/// A DSMR electricity meter read through its P1 port.
pub struct DsmrDevice {
    id: DeviceId,
    config: DeviceConfig,
    transport: TransportConfig,
    link: Mutex<Option<Box<dyn Link>>>,
}

impl DsmrDevice {
    /// Type name under which this family is registered.
    pub const TYPE_NAME: &'static str = "dsmr";

    /// Builds the device from its config without touching the meter.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::InvalidConfig`] or [`DeviceError::InvalidValue`]
    /// when the transport settings are unusable.
    pub fn new(id: DeviceId, config: DeviceConfig) -> Result<Self, DeviceError> {
        let transport = TransportConfig::from_config(&id, &config, SERIAL_DEFAULTS)?;
        Ok(Self {
            id,
            config,
            transport,
            link: Mutex::new(None),
        })
    }

    fn version(&self) -> String {
        self.config
            .get_text("version")
            .unwrap_or_else(|| DEFAULT_VERSION.to_string())
    }

    fn read_failed(&self, reason: impl Into<String>) -> DeviceError {
        DeviceError::ReadFailed {
            device: self.id.to_string(),
            reason: reason.into(),
        }
    }
}

impl fmt::Debug for DsmrDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DsmrDevice")
            .field("id", &self.id)
            .field("transport", &self.transport)
            .field("connected", &self.link.try_lock().map(|link| link.is_some()))
            .finish_non_exhaustive()
    }
}

impl Device for DsmrDevice {
    fn id(&self) -> &DeviceId {
        &self.id
    }

    fn config(&self) -> &DeviceConfig {
        &self.config
    }

    fn device_type(&self) -> &'static str {
        Self::TYPE_NAME
    }

    fn connect(&self) -> Result<(), DeviceError> {
        let link = self
            .transport
            .open()
            .map_err(|e| DeviceError::ConnectFailed {
                device: self.id.to_string(),
                reason: format!("{}: {e}", self.transport.endpoint()),
            })?;
        *self.link.lock() = Some(link);
        info!(
            device_id = %self.id,
            version = %self.version(),
            endpoint = %self.transport.endpoint(),
            "Connected to DSMR meter"
        );
        Ok(())
    }

    fn disconnect(&self) -> Result<(), DeviceError> {
        if self.link.lock().take().is_some() {
            debug!(device_id = %self.id, "Closed DSMR link");
        }
        Ok(())
    }

    fn read(&self) -> Result<Readings, DeviceError> {
        let mut guard = self.link.lock();
        let link = guard
            .as_mut()
            .ok_or_else(|| DeviceError::NotConnected(self.id.to_string()))?;

        let raw = read_telegram(&mut **link).map_err(|e| self.read_failed(e))?;
        let telegram = Telegram::parse(&raw).map_err(|e| self.read_failed(e))?;

        let readings: Readings = self
            .enabled_parameters()
            .into_iter()
            .filter_map(|name| {
                let value = obis_reference(&name).and_then(|obis| telegram.value(obis))?;
                Some((name, Reading::Float(value)))
            })
            .collect();

        if readings.is_empty() {
            return Err(self.read_failed("telegram contained none of the enabled parameters"));
        }
        Ok(readings)
    }

    fn available_parameters(&self) -> &[&'static str] {
        PARAMETERS
    }

    fn required_config_keys(&self) -> Vec<&'static str> {
        ConnectionKind::from_config(&self.id, &self.config)
            .unwrap_or(ConnectionKind::SerialPort)
            .required_keys()
    }

    fn manufacturer(&self) -> String {
        "Various (DSMR standard)".to_string()
    }

    fn model(&self) -> String {
        format!("DSMR {}", self.version())
    }
}

/// Reads bytes until one complete telegram has been seen.
fn read_telegram(link: &mut dyn Link) -> Result<String, String> {
    let mut buf = Vec::with_capacity(2048);
    let mut chunk = [0u8; 512];

    loop {
        let n = match link.read(&mut chunk) {
            Ok(0) => return Err("link closed by peer".to_string()),
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(format!("no telegram received: {e}")),
        };
        buf.extend_from_slice(&chunk[..n]);

        if let Some(start) = buf.iter().position(|b| *b == b'/') {
            if start > 0 {
                buf.drain(..start);
            }
            if let Some(end) = telegram_end(&buf) {
                buf.truncate(end);
                return String::from_utf8(buf).map_err(|_| "telegram is not valid text".to_string());
            }
        } else {
            buf.clear();
        }

        if buf.len() > MAX_TELEGRAM_LEN {
            return Err("telegram exceeds maximum length".to_string());
        }
    }
}

/// Returns the length of the telegram in `buf` if its trailer line is
/// complete.
fn telegram_end(buf: &[u8]) -> Option<usize> {
    let bang = buf.iter().position(|b| *b == b'!')?;
    let newline = buf[bang..].iter().position(|b| *b == b'\n')?;
    Some(bang + newline + 1)
}

/// CRC-16/ARC as used by the P1 telegram trailer.
fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for byte in data {
        crc ^= u16::from(*byte);
        for _ in 0..8 {
            crc = if crc & 1 == 1 { (crc >> 1) ^ 0xA001 } else { crc >> 1 };
        }
    }
    crc
}

/// A parsed P1 telegram.
#[derive(Debug, Default)]
struct Telegram {
    objects: Vec<(String, String)>,
}

impl Telegram {
    /// Parses a telegram and checks its CRC when one is present.
    fn parse(raw: &str) -> Result<Self, String> {
        let start = raw.find('/').ok_or("telegram has no header")?;
        let bang = raw[start..]
            .find('!')
            .map(|i| start + i)
            .ok_or("telegram has no trailer")?;

        let checksum = raw[bang + 1..].trim();
        if !checksum.is_empty() {
            let expected = u16::from_str_radix(checksum, 16)
                .map_err(|_| format!("malformed telegram CRC '{checksum}'"))?;
            let actual = crc16(raw[start..=bang].as_bytes());
            if actual != expected {
                return Err(format!(
                    "telegram CRC mismatch (expected {expected:04X}, computed {actual:04X})"
                ));
            }
        }

        let objects = raw[start..bang]
            .lines()
            .skip(1)
            .filter_map(|line| {
                let line = line.trim();
                let open = line.find('(')?;
                let reference = &line[..open];
                let value = line.rfind('(').and_then(|last| {
                    let rest = &line[last + 1..];
                    rest.find(')').map(|close| &rest[..close])
                })?;
                Some((reference.to_string(), value.to_string()))
            })
            .collect();

        Ok(Self { objects })
    }

    /// Returns the numeric value of the first object whose reference ends
    /// with `obis`.
    fn value(&self, obis: &str) -> Option<f64> {
        self.objects
            .iter()
            .find(|(reference, _)| reference.ends_with(obis))
            .and_then(|(_, value)| {
                let number = value.split_once('*').map_or(value.as_str(), |(n, _)| n);
                number.parse().ok()
            })
    }
}
