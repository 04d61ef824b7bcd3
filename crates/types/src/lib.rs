use std::fmt;

use serde::{Deserialize, Serialize};

/// Where a controller is reachable: a serial port path or a Modbus TCP gateway, plus its unit address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub endpoint: String,
    pub unit_id: u8,
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.endpoint, self.unit_id)
    }
}

/// Charge stage reported in the low byte of register 0x0120.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargingStatus {
    Deactivated,
    Activated,
    Mppt,
    Equalizing,
    Boost,
    Floating,
    CurrentLimiting,
    Unknown(u8),
}

impl ChargingStatus {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Deactivated,
            1 => Self::Activated,
            2 => Self::Mppt,
            3 => Self::Equalizing,
            4 => Self::Boost,
            5 => Self::Floating,
            6 => Self::CurrentLimiting,
            other => Self::Unknown(other),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Deactivated => "deactivated",
            Self::Activated => "activated",
            Self::Mppt => "mppt",
            Self::Equalizing => "equalizing",
            Self::Boost => "boost",
            Self::Floating => "floating",
            Self::CurrentLimiting => "current limiting",
            Self::Unknown(_) => "unknown",
        }
    }
}

impl fmt::Display for ChargingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatteryType {
    Open,
    Sealed,
    Gel,
    Lithium,
    SelfCustomized,
    Unknown(u16),
}

impl BatteryType {
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            1 => Self::Open,
            2 => Self::Sealed,
            3 => Self::Gel,
            4 => Self::Lithium,
            5 => Self::SelfCustomized,
            other => Self::Unknown(other),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Sealed => "sealed",
            Self::Gel => "gel",
            Self::Lithium => "lithium",
            Self::SelfCustomized => "self-customized",
            Self::Unknown(_) => "unknown",
        }
    }
}

/// One decoded snapshot of the controller's live registers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerReading {
    pub battery_percentage: u8,
    pub battery_voltage: f64,
    pub battery_temperature: i16,
    pub controller_temperature: i16,
    pub load_voltage: f64,
    pub load_current: f64,
    pub load_power: u16,
    pub solar_voltage: f64,
    pub solar_current: f64,
    pub solar_power: u16,
    pub charging_amp_hours_today: u16,
    pub discharging_amp_hours_today: u16,
    /// Watt-hours generated since midnight (controller clock).
    pub power_generation_today: u16,
    pub charging_status: ChargingStatus,
    pub load_on: bool,
    pub collected_at_ms: u64,
}

/// Static identification read once at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub unit_id: u8,
    pub model: String,
    pub software_version: String,
    pub hardware_version: String,
    pub serial_number: String,
    pub system_voltage: u8,
    pub system_current: u8,
    pub battery_capacity_ah: u16,
    /// Configured system voltage in volts; 0xFF means auto-detect.
    pub voltage_setting: u8,
    pub recognized_voltage: u8,
    pub battery_type: BatteryType,
}
