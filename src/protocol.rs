use crate::telemetry::{DeviceTarget, TelemetrySnapshot};
use crate::Error;
use chrono::{DateTime, Utc};
use crc16::{State, MODBUS};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

const START_BYTE: u8 = 0xd2;
const READ_FUNCTION: u8 = 0x03;
/// Leading bytes of every request and response frame.
pub const HEADER: [u8; 2] = [START_BYTE, READ_FUNCTION];
// Read 0x3E registers starting at register 0x0000
const MAIN_INFO_ARGUMENTS: [u8; 4] = [0x00, 0x00, 0x00, 0x3e];

pub const REQUEST_LENGTH: usize = 8;
/// Header (2) + byte count (1) + 62 registers (124) + checksum (2)
pub const MAIN_INFO_REPLY_LENGTH: usize = 129;
pub const CELL_COUNT: usize = 16;

const CELL_VOLTAGE_OFFSET: usize = 3;
const TEMPERATURE_SENSORS: [(&str, usize); 2] = [("T1", 68), ("T2", 70)];
const CURRENT_OFFSET: usize = 85;
const SOC_OFFSET: usize = 87;
const CYCLES_OFFSET: usize = 106;
const MOS_STATUS_OFFSET: usize = 108;

// The BMS adds 40 to every temperature to avoid negative numbers
const TEMPERATURE_BIAS: i16 = 40;
// Current is reported in 0.1A units with a 30000 unit offset
const CURRENT_BIAS: i32 = 30000;

macro_rules! read_bit {
    ($byte:expr,$position:expr) => {
        ($byte >> $position) & 1 != 0
    };
}

/// Algorithm used for the trailing two checksum bytes of a frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChecksumKind {
    /// 16 bit wrapping sum of all preceding bytes, big-endian.
    #[default]
    Sum16,
    /// CRC-16/MODBUS over all preceding bytes, low byte first.
    Crc16Modbus,
}

impl ChecksumKind {
    pub fn calculate(self, data: &[u8]) -> u16 {
        match self {
            ChecksumKind::Sum16 => data
                .iter()
                .fold(0u16, |sum, b| sum.wrapping_add(u16::from(*b))),
            ChecksumKind::Crc16Modbus => State::<MODBUS>::calculate(data),
        }
    }

    /// Checksum of `data` in wire byte order.
    pub fn encode(self, data: &[u8]) -> [u8; 2] {
        let checksum = self.calculate(data);
        match self {
            ChecksumKind::Sum16 => checksum.to_be_bytes(),
            ChecksumKind::Crc16Modbus => checksum.to_le_bytes(),
        }
    }

    fn decode(self, bytes: [u8; 2]) -> u16 {
        match self {
            ChecksumKind::Sum16 => u16::from_be_bytes(bytes),
            ChecksumKind::Crc16Modbus => u16::from_le_bytes(bytes),
        }
    }
}

/// One outbound command frame.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RequestFrame([u8; REQUEST_LENGTH]);

impl Deref for RequestFrame {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Debug for RequestFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X?}", self.0)
    }
}

/// Bytes accumulated from notifications in answer to one [`RequestFrame`].
#[derive(Clone, PartialEq, Eq, Default)]
pub struct RawResponse(Vec<u8>);

impl RawResponse {
    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for RawResponse {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl Deref for RawResponse {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Debug for RawResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

/// Builds the "read main info" command using the default [`ChecksumKind`].
pub fn build_main_info_request() -> RequestFrame {
    build_main_info_request_with(ChecksumKind::default())
}

pub fn build_main_info_request_with(checksum: ChecksumKind) -> RequestFrame {
    let mut tx_buffer = [0; REQUEST_LENGTH];
    tx_buffer[0..2].copy_from_slice(&HEADER);
    tx_buffer[2..6].copy_from_slice(&MAIN_INFO_ARGUMENTS);
    let crc = checksum.encode(&tx_buffer[..REQUEST_LENGTH - 2]);
    tx_buffer[REQUEST_LENGTH - 2..].copy_from_slice(&crc);
    log::trace!("main info request: {tx_buffer:02X?}");
    RequestFrame(tx_buffer)
}

fn validate_len(buffer: &[u8], reply_size: usize) -> std::result::Result<(), Error> {
    if buffer.len() != reply_size {
        log::warn!(
            "Invalid buffer size - required={} received={}",
            reply_size,
            buffer.len()
        );
        return Err(Error::LengthError {
            expected: reply_size,
            received: buffer.len(),
        });
    }
    Ok(())
}

fn validate_checksum(buffer: &[u8], kind: ChecksumKind) -> std::result::Result<(), Error> {
    let (payload, trailer) = buffer.split_at(buffer.len() - 2);
    let calculated = kind.calculate(payload);
    let received = kind.decode([trailer[0], trailer[1]]);
    if calculated != received {
        log::warn!(
            "Invalid checksum - calculated={:04X} received={:04X} buffer={}",
            calculated,
            received,
            hex::encode(buffer)
        );
        return Err(Error::ChecksumError {
            calculated,
            received,
        });
    }
    Ok(())
}

fn validate_header(buffer: &[u8]) -> std::result::Result<(), Error> {
    if buffer[0..2] != HEADER {
        log::warn!("Invalid header - received={:02X?}", &buffer[0..2]);
        return Err(Error::HeaderError {
            received: [buffer[0], buffer[1]],
        });
    }
    Ok(())
}

/// Fields of a validated main info response, in protocol units.
#[derive(Debug, Clone, PartialEq)]
pub struct MainInfo {
    pub cell_voltages_mv: [u16; CELL_COUNT],
    pub current: f32, // negative=charging, positive=discharging
    pub soc_percent: f32,
    pub cycles: u8,
    pub temperatures: Vec<(&'static str, i16)>,
    pub charging_mos: bool,
    pub discharging_mos: bool,
    pub balancing: bool,
}

impl MainInfo {
    pub fn reply_size() -> usize {
        MAIN_INFO_REPLY_LENGTH
    }

    pub fn decode(rx_buffer: &[u8], checksum: ChecksumKind) -> std::result::Result<Self, Error> {
        validate_len(rx_buffer, Self::reply_size())?;
        validate_checksum(rx_buffer, checksum)?;
        validate_header(rx_buffer)?;

        let mut cell_voltages_mv = [0u16; CELL_COUNT];
        for (n_cell, voltage) in cell_voltages_mv.iter_mut().enumerate() {
            let offset = CELL_VOLTAGE_OFFSET + 2 * n_cell;
            *voltage = u16::from_be_bytes([rx_buffer[offset], rx_buffer[offset + 1]]);
            log::trace!("cell #{} mV={}", n_cell + 1, voltage);
        }

        let temperatures = TEMPERATURE_SENSORS
            .iter()
            .map(|(sensor, offset)| (*sensor, i16::from(rx_buffer[*offset]) - TEMPERATURE_BIAS))
            .collect();

        let status = rx_buffer[MOS_STATUS_OFFSET];
        Ok(Self {
            cell_voltages_mv,
            current: ((u16::from_be_bytes([rx_buffer[CURRENT_OFFSET], rx_buffer[CURRENT_OFFSET + 1]])
                as i32
                - CURRENT_BIAS) as f32)
                / 10.0,
            soc_percent: u16::from_be_bytes([rx_buffer[SOC_OFFSET], rx_buffer[SOC_OFFSET + 1]])
                as f32
                / 10.0,
            cycles: rx_buffer[CYCLES_OFFSET],
            temperatures,
            charging_mos: read_bit!(status, 0),
            discharging_mos: read_bit!(status, 1),
            balancing: read_bit!(status, 2),
        })
    }
}

/// Validates `buffer` and turns it into a snapshot of `target` captured at `captured_at`.
///
/// No field is extracted unless length, checksum and header are all valid.
pub fn parse_main_info_response(
    buffer: &[u8],
    checksum: ChecksumKind,
    target: &DeviceTarget,
    total_capacity_ah: f32,
    captured_at: DateTime<Utc>,
) -> std::result::Result<TelemetrySnapshot, Error> {
    let info = MainInfo::decode(buffer, checksum)?;
    Ok(TelemetrySnapshot::from_main_info(
        &info,
        target,
        total_capacity_ah,
        captured_at,
    ))
}
