//! Value types shared by the acquisition loop, the snapshot cache and its readers.

use crate::protocol::{MainInfo, CELL_COUNT};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const DEFAULT_ADDRESS: &str = "41:18:12:01:18:9F";
pub const DEFAULT_NAME: &str = "DL-41181201189F";

/// Identity of the one BMS this process manages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceTarget {
    address: String,
    name: String,
}

type MacAddress = [u8; 6];

fn is_separator(c: char) -> bool {
    matches!(c, ':' | '-' | '_')
}

/// Parses exactly six two digit hex groups.
fn parse_groups(groups: &[&str]) -> Option<MacAddress> {
    if groups.len() != 6 {
        return None;
    }
    let mut address = [0u8; 6];
    for (byte, group) in address.iter_mut().zip(groups) {
        if group.len() != 2 || !group.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        *byte = u8::from_str_radix(group, 16).ok()?;
    }
    Some(address)
}

/// Configured address, with or without separators.
fn parse_address(address: &str) -> Option<MacAddress> {
    let address = address.trim();
    if address.len() == 12 && !address.contains(is_separator) {
        let pairs: Vec<&str> = (0..12)
            .step_by(2)
            .filter_map(|i| address.get(i..i + 2))
            .collect();
        return parse_groups(&pairs);
    }
    let groups: Vec<&str> = address.split(is_separator).collect();
    parse_groups(&groups)
}

/// Addresses embedded in a platform device identifier such as
/// `DeviceId { device: 41:18:12:01:18:9F }` or `hci0/dev_41_18_12_01_18_9F`.
fn embedded_addresses(text: &str) -> impl Iterator<Item = MacAddress> + '_ {
    text.split(|c: char| !(c.is_ascii_hexdigit() || is_separator(c)))
        .filter_map(|chunk| {
            let groups: Vec<&str> = chunk
                .trim_matches(is_separator)
                .split(is_separator)
                .collect();
            // leading hex letters of a word may glue onto the first group
            let skip = groups.len().checked_sub(6)?;
            parse_groups(&groups[skip..])
        })
}

impl DeviceTarget {
    pub fn new(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: name.into(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// At least one of address and name is set.
    pub fn is_configured(&self) -> bool {
        !self.address.trim().is_empty() || !self.name.trim().is_empty()
    }

    /// Compares all six address bytes, ignoring case and separators.
    ///
    /// `candidate` may be a platform specific device identifier that embeds
    /// the address. A configured address that is not a full hardware address
    /// never matches.
    pub fn matches_address(&self, candidate: &str) -> bool {
        match parse_address(&self.address) {
            Some(address) => embedded_addresses(candidate).any(|found| found == address),
            None => false,
        }
    }

    pub fn matches_name(&self, candidate: &str) -> bool {
        !self.name.is_empty() && self.name == candidate
    }
}

impl Default for DeviceTarget {
    fn default() -> Self {
        Self::new(DEFAULT_ADDRESS, DEFAULT_NAME)
    }
}

impl fmt::Display for DeviceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.name, self.address)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellVoltage {
    pub cell_number: u8,
    pub voltage: f32,
}

impl CellVoltage {
    fn millivolts(&self) -> u32 {
        (self.voltage * 1000.0).round().max(0.0) as u32
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Temperature {
    pub sensor: String,
    pub temperature: i16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MosStatus {
    pub charging_mos: bool,
    pub discharging_mos: bool,
    pub balancing: bool,
}

/// One internally consistent telemetry record.
///
/// Pack voltage, minimum, maximum and spread of the cell voltages are not
/// stored; they are always derived from the cell sequence. Deserializing a
/// record recomputes them as well.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "SnapshotRecord", try_from = "SnapshotRecord")]
pub struct TelemetrySnapshot {
    captured_at: DateTime<Utc>,
    device: String,
    address: String,
    current: f32,
    soc: f32,
    remaining_capacity: f32,
    total_capacity: f32,
    cycles: u32,
    cell_voltages: Vec<CellVoltage>,
    temperatures: Vec<Temperature>,
    mos_status: MosStatus,
    valid: bool,
}

impl TelemetrySnapshot {
    pub fn from_main_info(
        info: &MainInfo,
        target: &DeviceTarget,
        total_capacity_ah: f32,
        captured_at: DateTime<Utc>,
    ) -> Self {
        let cell_voltages = info
            .cell_voltages_mv
            .iter()
            .enumerate()
            .map(|(n_cell, mv)| CellVoltage {
                cell_number: n_cell as u8 + 1,
                voltage: f32::from(*mv) / 1000.0,
            })
            .collect();
        let temperatures = info
            .temperatures
            .iter()
            .map(|(sensor, temperature)| Temperature {
                sensor: sensor.to_string(),
                temperature: *temperature,
            })
            .collect();
        Self {
            captured_at,
            device: target.name().to_string(),
            address: target.address().to_string(),
            current: info.current,
            soc: info.soc_percent,
            remaining_capacity: total_capacity_ah * info.soc_percent / 100.0,
            total_capacity: total_capacity_ah,
            cycles: u32::from(info.cycles),
            cell_voltages,
            temperatures,
            mos_status: MosStatus {
                charging_mos: info.charging_mos,
                discharging_mos: info.discharging_mos,
                balancing: info.balancing,
            },
            valid: true,
        }
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn current(&self) -> f32 {
        self.current
    }

    pub fn soc(&self) -> f32 {
        self.soc
    }

    pub fn remaining_capacity(&self) -> f32 {
        self.remaining_capacity
    }

    pub fn total_capacity(&self) -> f32 {
        self.total_capacity
    }

    pub fn cycles(&self) -> u32 {
        self.cycles
    }

    pub fn cell_voltages(&self) -> &[CellVoltage] {
        &self.cell_voltages
    }

    pub fn temperatures(&self) -> &[Temperature] {
        &self.temperatures
    }

    pub fn mos_status(&self) -> MosStatus {
        self.mos_status
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Sum of the cell voltages in volts, rounded to millivolts.
    pub fn pack_voltage(&self) -> f32 {
        let mv: u32 = self.cell_voltages.iter().map(CellVoltage::millivolts).sum();
        mv as f32 / 1000.0
    }

    pub fn min_cell_voltage(&self) -> f32 {
        self.cell_voltages
            .iter()
            .map(CellVoltage::millivolts)
            .min()
            .unwrap_or(0) as f32
            / 1000.0
    }

    pub fn max_cell_voltage(&self) -> f32 {
        self.cell_voltages
            .iter()
            .map(CellVoltage::millivolts)
            .max()
            .unwrap_or(0) as f32
            / 1000.0
    }

    pub fn cell_voltage_diff(&self) -> f32 {
        let mvs = || self.cell_voltages.iter().map(CellVoltage::millivolts);
        match (mvs().max(), mvs().min()) {
            (Some(max), Some(min)) => (max - min) as f32 / 1000.0,
            _ => 0.0,
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.captured_at)
    }
}

/// Wire shape of a snapshot in the durable mirror file.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotRecord {
    #[serde(rename = "captureTimeMs", with = "chrono::serde::ts_milliseconds")]
    captured_at: DateTime<Utc>,
    device: String,
    address: String,
    pack_voltage: f32,
    current: f32,
    soc: f32,
    remaining_capacity: f32,
    total_capacity: f32,
    cycles: u32,
    cell_voltages: Vec<CellVoltage>,
    temperatures: Vec<Temperature>,
    mos_status: MosStatus,
    #[serde(default)]
    min_cell_voltage: f32,
    #[serde(default)]
    max_cell_voltage: f32,
    #[serde(default)]
    cell_voltage_diff: f32,
    valid: bool,
}

impl From<TelemetrySnapshot> for SnapshotRecord {
    fn from(snapshot: TelemetrySnapshot) -> Self {
        Self {
            pack_voltage: snapshot.pack_voltage(),
            min_cell_voltage: snapshot.min_cell_voltage(),
            max_cell_voltage: snapshot.max_cell_voltage(),
            cell_voltage_diff: snapshot.cell_voltage_diff(),
            captured_at: snapshot.captured_at,
            device: snapshot.device,
            address: snapshot.address,
            current: snapshot.current,
            soc: snapshot.soc,
            remaining_capacity: snapshot.remaining_capacity,
            total_capacity: snapshot.total_capacity,
            cycles: snapshot.cycles,
            cell_voltages: snapshot.cell_voltages,
            temperatures: snapshot.temperatures,
            mos_status: snapshot.mos_status,
            valid: snapshot.valid,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("Expected {expected} cell voltages, found {found}")]
    CellCount { expected: usize, found: usize },
}

impl TryFrom<SnapshotRecord> for TelemetrySnapshot {
    type Error = RecordError;

    fn try_from(record: SnapshotRecord) -> Result<Self, Self::Error> {
        if record.cell_voltages.len() != CELL_COUNT {
            return Err(RecordError::CellCount {
                expected: CELL_COUNT,
                found: record.cell_voltages.len(),
            });
        }
        Ok(Self {
            captured_at: record.captured_at,
            device: record.device,
            address: record.address,
            current: record.current,
            soc: record.soc,
            remaining_capacity: record.remaining_capacity,
            total_capacity: record.total_capacity,
            cycles: record.cycles,
            cell_voltages: record.cell_voltages,
            temperatures: record.temperatures,
            mos_status: record.mos_status,
            valid: record.valid,
        })
    }
}

/// Connection state published in [`ServiceStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LinkState {
    Disconnected,
    Scanning,
    Connecting,
    ConnectedIdle,
    ConnectedAwaitingResponse,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LinkState::Disconnected => write!(f, "disconnected"),
            LinkState::Scanning => write!(f, "scanning"),
            LinkState::Connecting => write!(f, "connecting"),
            LinkState::ConnectedIdle => write!(f, "connected"),
            LinkState::ConnectedAwaitingResponse => write!(f, "awaiting response"),
        }
    }
}

/// Class of the most recent failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FaultKind {
    /// Radio or link level problem, retried after reconnecting.
    Transport,
    /// Frame failed length, checksum or header validation.
    Protocol,
    /// No target configured or the device lacks the expected GATT endpoints.
    Mismatch,
}

/// Health of the acquisition loop. Replaced wholesale, never patched in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub state: LinkState,
    pub consecutive_failures: u32,
    #[serde(rename = "lastSuccessMs", with = "chrono::serde::ts_milliseconds_option")]
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub fault: Option<FaultKind>,
    pub total_reads: u64,
    pub total_failures: u64,
    #[serde(rename = "startedAtMs", with = "chrono::serde::ts_milliseconds")]
    pub started_at: DateTime<Utc>,
}

impl ServiceStatus {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            state: LinkState::Disconnected,
            consecutive_failures: 0,
            last_success: None,
            last_error: None,
            fault: None,
            total_reads: 0,
            total_failures: 0,
            started_at,
        }
    }

    pub fn record_success(&mut self, at: DateTime<Utc>) {
        self.consecutive_failures = 0;
        self.last_success = Some(at);
        self.last_error = None;
        self.fault = None;
        self.total_reads += 1;
    }

    pub fn record_failure(&mut self, fault: FaultKind, error: impl fmt::Display) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.total_failures += 1;
        self.last_error = Some(error.to_string());
        self.fault = Some(fault);
    }
}

impl Default for ServiceStatus {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

/// Age bucket of a snapshot as seen by a reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Freshness {
    Fresh,
    Recent,
    Stale,
    Old,
}

impl Freshness {
    /// Snapshots younger than this are trustworthy.
    pub fn max_age() -> chrono::Duration {
        chrono::Duration::seconds(30)
    }

    pub fn classify(age: chrono::Duration) -> Self {
        match age.num_seconds() {
            s if s < 10 => Freshness::Fresh,
            s if s < 30 => Freshness::Recent,
            s if s < 60 => Freshness::Stale,
            _ => Freshness::Old,
        }
    }

    pub fn is_fresh(age: chrono::Duration) -> bool {
        age < Self::max_age()
    }
}
