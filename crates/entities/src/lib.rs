//! One Home Assistant sensor per measurement of a [`ControllerReading`].

use std::fmt;

use serde::Serialize;
use types::ControllerReading;

pub const UNIQUE_ID_PREFIX: &str = "renogy_rover";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKey {
    SolarVoltage,
    SolarCurrent,
    SolarPower,
    BatteryVoltage,
    BatteryPercentage,
    PowerGenerationToday,
    ChargingStatus,
    ControllerTemperature,
    BatteryTemperature,
    LoadVoltage,
    LoadCurrent,
    LoadPower,
    ChargingAmpHoursToday,
    DischargingAmpHoursToday,
    LoadStatus,
}

impl SensorKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SolarVoltage => "solar_voltage",
            Self::SolarCurrent => "solar_current",
            Self::SolarPower => "solar_power",
            Self::BatteryVoltage => "battery_voltage",
            Self::BatteryPercentage => "battery_percentage",
            Self::PowerGenerationToday => "power_generation_today",
            Self::ChargingStatus => "charging_status",
            Self::ControllerTemperature => "controller_temperature",
            Self::BatteryTemperature => "battery_temperature",
            Self::LoadVoltage => "load_voltage",
            Self::LoadCurrent => "load_current",
            Self::LoadPower => "load_power",
            Self::ChargingAmpHoursToday => "charging_amp_hours_today",
            Self::DischargingAmpHoursToday => "discharging_amp_hours_today",
            Self::LoadStatus => "load_status",
        }
    }
}

impl fmt::Display for SensorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Home Assistant `device_class` values used by the Rover sensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Voltage,
    Current,
    Power,
    Energy,
    Battery,
    Temperature,
    Enum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StateClass {
    Measurement,
    TotalIncreasing,
}

/// Home Assistant groups diagnostic entities apart from the primary readings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityCategory {
    Diagnostic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SensorDescription {
    pub key: SensorKey,
    pub name: &'static str,
    pub unit: Option<&'static str>,
    pub device_class: Option<DeviceClass>,
    pub state_class: Option<StateClass>,
    pub icon: Option<&'static str>,
    /// Allowed states for enum sensors.
    pub options: Option<&'static [&'static str]>,
    pub entity_category: Option<EntityCategory>,
}

pub const CHARGING_STATUS_OPTIONS: &[&str] = &[
    "deactivated",
    "activated",
    "mppt",
    "equalizing",
    "boost",
    "floating",
    "current limiting",
    "unknown",
];

const LOAD_STATUS_OPTIONS: &[&str] = &["on", "off"];

const fn numeric(
    key: SensorKey,
    name: &'static str,
    unit: &'static str,
    device_class: DeviceClass,
    state_class: StateClass,
) -> SensorDescription {
    SensorDescription {
        key,
        name,
        unit: Some(unit),
        device_class: Some(device_class),
        state_class: Some(state_class),
        icon: None,
        options: None,
        entity_category: None,
    }
}

const fn diagnostic(mut sensor: SensorDescription) -> SensorDescription {
    sensor.entity_category = Some(EntityCategory::Diagnostic);
    sensor
}

pub const SENSORS: &[SensorDescription] = &[
    numeric(SensorKey::SolarVoltage, "Solar Voltage", "V", DeviceClass::Voltage, StateClass::Measurement),
    numeric(SensorKey::SolarCurrent, "Solar Current", "A", DeviceClass::Current, StateClass::Measurement),
    numeric(SensorKey::SolarPower, "Solar Power", "W", DeviceClass::Power, StateClass::Measurement),
    numeric(SensorKey::BatteryVoltage, "Battery Voltage", "V", DeviceClass::Voltage, StateClass::Measurement),
    numeric(SensorKey::BatteryPercentage, "Battery Percentage", "%", DeviceClass::Battery, StateClass::Measurement),
    numeric(
        SensorKey::PowerGenerationToday,
        "Power Generation Today",
        "Wh",
        DeviceClass::Energy,
        StateClass::TotalIncreasing,
    ),
    SensorDescription {
        key: SensorKey::ChargingStatus,
        name: "Charging Status",
        unit: None,
        device_class: Some(DeviceClass::Enum),
        state_class: None,
        icon: Some("mdi:solar-power"),
        options: Some(CHARGING_STATUS_OPTIONS),
        entity_category: Some(EntityCategory::Diagnostic),
    },
    diagnostic(numeric(
        SensorKey::ControllerTemperature,
        "Controller Temperature",
        "°C",
        DeviceClass::Temperature,
        StateClass::Measurement,
    )),
    numeric(
        SensorKey::BatteryTemperature,
        "Battery Temperature",
        "°C",
        DeviceClass::Temperature,
        StateClass::Measurement,
    ),
    numeric(SensorKey::LoadVoltage, "Load Voltage", "V", DeviceClass::Voltage, StateClass::Measurement),
    numeric(SensorKey::LoadCurrent, "Load Current", "A", DeviceClass::Current, StateClass::Measurement),
    numeric(SensorKey::LoadPower, "Load Power", "W", DeviceClass::Power, StateClass::Measurement),
    SensorDescription {
        key: SensorKey::ChargingAmpHoursToday,
        name: "Charging Amp Hours Today",
        unit: Some("Ah"),
        device_class: None,
        state_class: Some(StateClass::TotalIncreasing),
        icon: Some("mdi:battery-plus"),
        options: None,
        entity_category: None,
    },
    SensorDescription {
        key: SensorKey::DischargingAmpHoursToday,
        name: "Discharging Amp Hours Today",
        unit: Some("Ah"),
        device_class: None,
        state_class: Some(StateClass::TotalIncreasing),
        icon: Some("mdi:battery-minus"),
        options: None,
        entity_category: None,
    },
    SensorDescription {
        key: SensorKey::LoadStatus,
        name: "Load Status",
        unit: None,
        device_class: Some(DeviceClass::Enum),
        state_class: None,
        icon: Some("mdi:power-plug"),
        options: Some(LOAD_STATUS_OPTIONS),
        entity_category: None,
    },
];

pub fn description(key: SensorKey) -> Option<&'static SensorDescription> {
    SENSORS.iter().find(|sensor| sensor.key == key)
}

/// `renogy_rover_<serial>_<key>`: stable across restarts and port changes.
pub fn unique_id(serial_number: &str, key: SensorKey) -> String {
    format!("{UNIQUE_ID_PREFIX}_{serial_number}_{key}")
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SensorState {
    Number(f64),
    Text(&'static str),
}

impl fmt::Display for SensorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(value) => write!(f, "{value}"),
            Self::Text(value) => f.write_str(value),
        }
    }
}

impl SensorDescription {
    /// The reading field this sensor exposes.
    pub fn state(&self, reading: &ControllerReading) -> SensorState {
        use SensorState::{Number, Text};

        match self.key {
            SensorKey::SolarVoltage => Number(reading.solar_voltage),
            SensorKey::SolarCurrent => Number(reading.solar_current),
            SensorKey::SolarPower => Number(f64::from(reading.solar_power)),
            SensorKey::BatteryVoltage => Number(reading.battery_voltage),
            SensorKey::BatteryPercentage => Number(f64::from(reading.battery_percentage)),
            SensorKey::PowerGenerationToday => Number(f64::from(reading.power_generation_today)),
            SensorKey::ChargingStatus => Text(reading.charging_status.label()),
            SensorKey::ControllerTemperature => Number(f64::from(reading.controller_temperature)),
            SensorKey::BatteryTemperature => Number(f64::from(reading.battery_temperature)),
            SensorKey::LoadVoltage => Number(reading.load_voltage),
            SensorKey::LoadCurrent => Number(reading.load_current),
            SensorKey::LoadPower => Number(f64::from(reading.load_power)),
            SensorKey::ChargingAmpHoursToday => Number(f64::from(reading.charging_amp_hours_today)),
            SensorKey::DischargingAmpHoursToday => {
                Number(f64::from(reading.discharging_amp_hours_today))
            }
            SensorKey::LoadStatus => Text(if reading.load_on { "on" } else { "off" }),
        }
    }
}

/// Every sensor's state for `reading`, in [`SENSORS`] order.
pub fn states(reading: &ControllerReading) -> Vec<(&'static SensorDescription, SensorState)> {
    SENSORS
        .iter()
        .map(|sensor| (sensor, sensor.state(reading)))
        .collect()
}
