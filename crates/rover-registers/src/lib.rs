//! Register map of the Renogy Rover family and decoding into typed values.
//!
//! All values live in holding registers. Live data is read as one contiguous
//! block starting at [`LIVE_START`]; identification and battery settings are
//! read once when the device is identified.

use thiserror::Error;
use tracing::debug;

use modbus_client::{ClientError, RegisterReader};
use types::{BatteryType, ChargingStatus, ControllerReading, DeviceInfo};

/// System rating, model, versions and serial number.
pub const INFO_START: u16 = 0x000A;
pub const INFO_LEN: u16 = 16;

/// Battery, load and solar telemetry up to the charging state register.
pub const LIVE_START: u16 = 0x0100;
pub const LIVE_LEN: u16 = 33;

/// Battery capacity, voltage setting and battery type.
pub const BATTERY_START: u16 = 0xE002;
pub const BATTERY_LEN: u16 = 3;

const MODEL_OFFSET: usize = 2;
const MODEL_REGISTERS: usize = 8;
const VERSION_OFFSET: usize = 10;
const SERIAL_OFFSET: usize = 14;

const BATTERY_SOC: usize = 0x00;
const BATTERY_VOLTAGE: usize = 0x01;
const TEMPERATURES: usize = 0x03;
const LOAD_VOLTAGE: usize = 0x04;
const LOAD_CURRENT: usize = 0x05;
const LOAD_POWER: usize = 0x06;
const SOLAR_VOLTAGE: usize = 0x07;
const SOLAR_CURRENT: usize = 0x08;
const SOLAR_POWER: usize = 0x09;
const CHARGING_AH_TODAY: usize = 0x11;
const DISCHARGING_AH_TODAY: usize = 0x12;
const GENERATION_TODAY: usize = 0x13;
const CHARGING_STATE: usize = 0x20;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("register block too short: expected {expected}, got {actual}")]
    ShortBlock { expected: usize, actual: usize },
}

#[derive(Debug, Error)]
pub enum ReadError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl ReadError {
    pub fn is_no_response(&self) -> bool {
        matches!(self, Self::Client(err) if err.is_no_response())
    }
}

/// Reads and decodes the live telemetry block.
pub async fn read_reading<R>(
    reader: &R,
    unit_id: u8,
    collected_at_ms: u64,
) -> Result<ControllerReading, ReadError>
where
    R: RegisterReader + ?Sized,
{
    let block = reader.read_range(unit_id, LIVE_START, LIVE_LEN).await?;
    Ok(decode_reading(&block, collected_at_ms)?)
}

/// Reads identification and battery settings for `unit_id`.
pub async fn read_device_info<R>(reader: &R, unit_id: u8) -> Result<DeviceInfo, ReadError>
where
    R: RegisterReader + ?Sized,
{
    let info = reader.read_range(unit_id, INFO_START, INFO_LEN).await?;
    let battery = reader.read_range(unit_id, BATTERY_START, BATTERY_LEN).await?;
    let device = decode_device_info(unit_id, &info, &battery)?;
    debug!(unit_id, model = %device.model, serial = %device.serial_number, "device info decoded");
    Ok(device)
}

pub fn decode_reading(block: &[u16], collected_at_ms: u64) -> Result<ControllerReading, DecodeError> {
    ensure_len(block, LIVE_LEN as usize)?;

    let (controller_temperature, battery_temperature) = decode_temperatures(block[TEMPERATURES]);
    let state = block[CHARGING_STATE];

    Ok(ControllerReading {
        battery_percentage: low_byte(block[BATTERY_SOC]),
        battery_voltage: scaled(block[BATTERY_VOLTAGE], 1),
        battery_temperature,
        controller_temperature,
        load_voltage: scaled(block[LOAD_VOLTAGE], 1),
        load_current: scaled(block[LOAD_CURRENT], 2),
        load_power: block[LOAD_POWER],
        solar_voltage: scaled(block[SOLAR_VOLTAGE], 1),
        solar_current: scaled(block[SOLAR_CURRENT], 2),
        solar_power: block[SOLAR_POWER],
        charging_amp_hours_today: block[CHARGING_AH_TODAY],
        discharging_amp_hours_today: block[DISCHARGING_AH_TODAY],
        power_generation_today: block[GENERATION_TODAY],
        charging_status: charging_status(state),
        load_on: high_byte(state) & 0x80 != 0,
        collected_at_ms,
    })
}

pub fn decode_device_info(unit_id: u8, info: &[u16], battery: &[u16]) -> Result<DeviceInfo, DecodeError> {
    ensure_len(info, INFO_LEN as usize)?;
    ensure_len(battery, BATTERY_LEN as usize)?;

    let (system_voltage, system_current) = decode_system_rating(info[0]);
    let (software_version, hardware_version) =
        decode_versions(&info[VERSION_OFFSET..VERSION_OFFSET + 4]);

    Ok(DeviceInfo {
        unit_id,
        model: decode_model(&info[MODEL_OFFSET..MODEL_OFFSET + MODEL_REGISTERS]),
        software_version,
        hardware_version,
        serial_number: decode_serial_number(info[SERIAL_OFFSET], info[SERIAL_OFFSET + 1]),
        system_voltage,
        system_current,
        battery_capacity_ah: battery[0],
        voltage_setting: high_byte(battery[1]),
        recognized_voltage: low_byte(battery[1]),
        battery_type: BatteryType::from_raw(battery[2]),
    })
}

/// Register 0x000A: rated voltage in the high byte, rated current in the low byte.
pub fn decode_system_rating(register: u16) -> (u8, u8) {
    (high_byte(register), low_byte(register))
}

/// Model string packed two ASCII characters per register, padded with spaces or NULs.
pub fn decode_model(registers: &[u16]) -> String {
    let bytes: Vec<u8> = registers
        .iter()
        .flat_map(|register| register.to_be_bytes())
        .collect();
    String::from_utf8_lossy(&bytes)
        .trim_matches(|ch: char| ch == '\0' || ch.is_whitespace())
        .to_string()
}

/// Software and hardware versions as `Vmajor.minor.patch`.
pub fn decode_versions(registers: &[u16]) -> (String, String) {
    let version = |major: u16, rest: u16| {
        format!("V{}.{}.{}", low_byte(major), high_byte(rest), low_byte(rest))
    };
    let get = |idx: usize| registers.get(idx).copied().unwrap_or(0);
    (version(get(0), get(1)), version(get(2), get(3)))
}

/// The serial number is the decimal rendering of both registers side by side.
pub fn decode_serial_number(high: u16, low: u16) -> String {
    format!("{high}{low}")
}

/// Sign-magnitude byte: bit 7 set means negative.
pub fn decode_temperature(raw: u8) -> i16 {
    let magnitude = i16::from(raw & 0x7F);
    if raw & 0x80 != 0 {
        -magnitude
    } else {
        magnitude
    }
}

/// Register 0x0103: (controller, battery) temperatures in °C.
pub fn decode_temperatures(register: u16) -> (i16, i16) {
    (
        decode_temperature(high_byte(register)),
        decode_temperature(low_byte(register)),
    )
}

pub fn charging_status(register: u16) -> ChargingStatus {
    ChargingStatus::from_raw(low_byte(register))
}

fn scaled(raw: u16, decimals: i32) -> f64 {
    f64::from(raw) / 10f64.powi(decimals)
}

fn high_byte(register: u16) -> u8 {
    (register >> 8) as u8
}

fn low_byte(register: u16) -> u8 {
    (register & 0x00FF) as u8
}

fn ensure_len(block: &[u16], expected: usize) -> Result<(), DecodeError> {
    if block.len() < expected {
        return Err(DecodeError::ShortBlock {
            expected,
            actual: block.len(),
        });
    }
    Ok(())
}
