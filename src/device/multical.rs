// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kamstrup Multical heat meter adapter (KMP protocol).
//!
//! Registers are requested with a `GetRegister` command. Frames are byte
//! stuffed and protected with CRC-16/CCITT. Each returned register carries a
//! unit, a mantissa and a signed decimal exponent.

use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use parking_lot::Mutex;
use serialport::{DataBits, Parity, StopBits};
use tracing::{debug, info};

use super::transport::Link;
use super::{ConnectionKind, Device, DeviceConfig, DeviceId, Reading, Readings, SerialSettings, TransportConfig};
use crate::error::DeviceError;

const DEFAULT_VERSION: &str = "402";

const SERIAL_DEFAULTS: SerialSettings = SerialSettings {
    baud_rate: 1200,
    data_bits: DataBits::Eight,
    parity: Parity::None,
    stop_bits: StopBits::Two,
    timeout: Duration::from_secs(2),
};

const DESTINATION: u8 = 0x3F;
const GET_REGISTER: u8 = 0x10;
const REQUEST_START: u8 = 0x80;
const RESPONSE_START: u8 = 0x40;
const STOP: u8 = 0x0D;
const ESCAPE: u8 = 0x1B;

/// Registers the meter accepts in a single request.
const MAX_REGISTERS_PER_REQUEST: usize = 8;

const MAX_RESPONSE_LEN: usize = 512;

/// Parameter names and their register ids.
const REGISTERS: &[(&str, u16)] = &[
    ("energy", 0x003C),
    ("power", 0x0050),
    ("temp1", 0x0056),
    ("temp2", 0x0057),
    ("volume", 0x0044),
    ("flow", 0x004A),
    ("tempdiff", 0x0059),
    ("temp1xm3", 0x0061),
    ("temp2xm3", 0x006E),
    ("minflow_m", 0x008D),
    ("maxflow_m", 0x008B),
    ("minflowDate_m", 0x008C),
    ("maxflowDate_m", 0x008A),
    ("minpower_m", 0x0091),
    ("maxpower_m", 0x008F),
    ("minpowerdate_m", 0x0090),
    ("maxpowerdate_m", 0x008E),
    ("avgtemp1_m", 0x0095),
    ("avgtemp2_m", 0x0096),
    ("minflow_y", 0x007E),
    ("maxflow_y", 0x007C),
    ("minflowdate_y", 0x007D),
    ("maxflowdate_y", 0x007B),
    ("minpower_y", 0x0082),
    ("maxpower_y", 0x0080),
    ("minpowerdate_y", 0x0081),
    ("maxpowerdate_y", 0x007F),
    ("avgtemp1_y", 0x0092),
    ("avgtemp2_y", 0x0093),
    ("infoevent", 0x0071),
    ("hourcounter", 0x03EC),
];

const PARAMETERS: &[&str] = &[
    "energy",
    "power",
    "temp1",
    "temp2",
    "volume",
    "flow",
    "tempdiff",
    "temp1xm3",
    "temp2xm3",
    "minflow_m",
    "maxflow_m",
    "minflowDate_m",
    "maxflowDate_m",
    "minpower_m",
    "maxpower_m",
    "minpowerdate_m",
    "maxpowerdate_m",
    "avgtemp1_m",
    "avgtemp2_m",
    "minflow_y",
    "maxflow_y",
    "minflowdate_y",
    "maxflowdate_y",
    "minpower_y",
    "maxpower_y",
    "minpowerdate_y",
    "maxpowerdate_y",
    "avgtemp1_y",
    "avgtemp2_y",
    "infoevent",
    "hourcounter",
];

fn register_id(parameter: &str) -> Option<u16> {
    REGISTERS
        .iter()
        .find(|(name, _)| *name == parameter)
        .map(|(_, id)| *id)
}

fn register_name(id: u16) -> Option<&'static str> {
    REGISTERS
        .iter()
        .find(|(_, reg)| *reg == id)
        .map(|(name, _)| *name)
}

/// A Kamstrup Multical heat meter read over its optical or serial port.
pub struct MulticalDevice {
    id: DeviceId,
    config: DeviceConfig,
    transport: TransportConfig,
    link: Mutex<Option<Box<dyn Link>>>,
}

impl MulticalDevice {
    /// Type name under which this family is registered.
    pub const TYPE_NAME: &'static str = "multical";

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

impl fmt::Debug for MulticalDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MulticalDevice")
            .field("id", &self.id)
            .field("transport", &self.transport)
            .field("connected", &self.link.try_lock().map(|link| link.is_some()))
            .finish_non_exhaustive()
    }
}

impl Device for MulticalDevice {
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
            "Connected to Multical meter"
        );
        Ok(())
    }

    fn disconnect(&self) -> Result<(), DeviceError> {
        if self.link.lock().take().is_some() {
            debug!(device_id = %self.id, "Closed Multical link");
        }
        Ok(())
    }

    fn read(&self) -> Result<Readings, DeviceError> {
        let mut guard = self.link.lock();
        let link = guard
            .as_mut()
            .ok_or_else(|| DeviceError::NotConnected(self.id.to_string()))?;

        let registers: Vec<u16> = self
            .enabled_parameters()
            .iter()
            .filter_map(|name| {
                let id = register_id(name);
                if id.is_none() {
                    debug!(device_id = %self.id, parameter = %name, "Skipping unknown register");
                }
                id
            })
            .collect();

        let mut readings = Readings::new();
        for batch in registers.chunks(MAX_REGISTERS_PER_REQUEST) {
            let values = request(&mut **link, batch).map_err(|e| self.read_failed(e))?;
            for (register, value) in values {
                if let Some(name) = register_name(register) {
                    readings.insert(name.to_string(), value);
                }
            }
        }

        if readings.is_empty() {
            return Err(self.read_failed("meter returned no registers"));
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
        "Kamstrup".to_string()
    }

    fn model(&self) -> String {
        format!("Multical {}", self.version())
    }
}

/// Sends one `GetRegister` request and decodes the reply.
fn request(link: &mut dyn Link, registers: &[u16]) -> Result<Vec<(u16, Reading)>, String> {
    link.write_all(&encode_request(registers))
        .and_then(|()| link.flush())
        .map_err(|e| format!("request failed: {e}"))?;
    let frame = read_response(link)?;
    decode_response(&frame)
}

/// CRC-16/CCITT (XModem variant) used by KMP.
fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for byte in data {
        crc ^= u16::from(*byte) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 == 0 { crc << 1 } else { (crc << 1) ^ 0x1021 };
        }
    }
    crc
}

fn stuff(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 4);
    for byte in data {
        if matches!(*byte, 0x06 | STOP | ESCAPE | RESPONSE_START | REQUEST_START) {
            out.push(ESCAPE);
            out.push(byte ^ 0xFF);
        } else {
            out.push(*byte);
        }
    }
    out
}

fn unstuff(data: &[u8]) -> Result<Vec<u8>, String> {
    let mut out = Vec::with_capacity(data.len());
    let mut bytes = data.iter();
    while let Some(byte) = bytes.next() {
        if *byte == ESCAPE {
            let escaped = bytes.next().ok_or("truncated escape sequence")?;
            out.push(escaped ^ 0xFF);
        } else {
            out.push(*byte);
        }
    }
    Ok(out)
}

fn encode_request(registers: &[u16]) -> Vec<u8> {
    let mut body = vec![DESTINATION, GET_REGISTER];
    // Batches never exceed MAX_REGISTERS_PER_REQUEST.
    body.push(u8::try_from(registers.len()).unwrap_or(u8::MAX));
    for register in registers {
        body.extend_from_slice(&register.to_be_bytes());
    }
    let crc = crc16(&body);
    body.extend_from_slice(&crc.to_be_bytes());

    let mut frame = vec![REQUEST_START];
    frame.extend(stuff(&body));
    frame.push(STOP);
    frame
}

/// Reads one response frame, discarding any echo of the request.
fn read_response(link: &mut dyn Link) -> Result<Vec<u8>, String> {
    let mut frame = Vec::new();
    let mut started = false;
    let mut byte = [0u8; 1];

    loop {
        match link.read(&mut byte) {
            Ok(0) => return Err("link closed by peer".to_string()),
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(format!("no response: {e}")),
        }
        match (started, byte[0]) {
            (false, RESPONSE_START) => started = true,
            (false, _) => {}
            (true, STOP) => return Ok(frame),
            (true, b) => frame.push(b),
        }
        if frame.len() > MAX_RESPONSE_LEN {
            return Err("response exceeds maximum length".to_string());
        }
    }
}

/// Decodes the stuffed body of a response frame (between start and stop).
fn decode_response(stuffed: &[u8]) -> Result<Vec<(u16, Reading)>, String> {
    let body = unstuff(stuffed)?;
    if body.len() < 4 {
        return Err("response too short".to_string());
    }
    if crc16(&body) != 0 {
        return Err("response CRC mismatch".to_string());
    }
    if body[0] != DESTINATION || body[1] != GET_REGISTER {
        return Err(format!("unexpected response header {:02X} {:02X}", body[0], body[1]));
    }

    let mut payload = &body[2..body.len() - 2];
    let mut values = Vec::new();
    while !payload.is_empty() {
        if payload.len() < 5 {
            return Err("truncated register block".to_string());
        }
        let register = u16::from_be_bytes([payload[0], payload[1]]);
        let length = usize::from(payload[3]);
        let sigexp = payload[4];
        let mantissa = payload
            .get(5..5 + length)
            .ok_or("truncated register value")?;
        values.push((register, decode_value(sigexp, mantissa)?));
        payload = &payload[5 + length..];
    }
    Ok(values)
}

/// Combines mantissa and exponent into a reading.
///
/// Bit 7 of `sigexp` is the mantissa sign, bit 6 the exponent sign and the
/// low six bits the exponent magnitude.
fn decode_value(sigexp: u8, mantissa: &[u8]) -> Result<Reading, String> {
    if mantissa.len() > 8 {
        return Err(format!("mantissa of {} bytes is too wide", mantissa.len()));
    }
    let magnitude = mantissa
        .iter()
        .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte));
    let magnitude = i64::try_from(magnitude).map_err(|_| "mantissa out of range".to_string())?;
    let mantissa = if sigexp & 0x80 == 0 { magnitude } else { -magnitude };

    let exponent = i32::from(sigexp & 0x3F);
    let exponent = if sigexp & 0x40 == 0 { exponent } else { -exponent };

    if exponent == 0 {
        return Ok(Reading::Integer(mantissa));
    }
    #[allow(clippy::cast_precision_loss)]
    let mantissa = mantissa as f64;
    let scale = 10f64.powi(exponent.abs());
    Ok(Reading::Float(if exponent < 0 {
        mantissa / scale
    } else {
        mantissa * scale
    }))
}
