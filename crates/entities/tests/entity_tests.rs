use std::collections::HashSet;

use entities::{
    description, states, unique_id, DeviceClass, EntityCategory, SensorKey, SensorState, StateClass, SENSORS,
};
use types::{ChargingStatus, ControllerReading};

fn reading() -> ControllerReading {
    ControllerReading {
        battery_percentage: 91,
        battery_voltage: 13.4,
        battery_temperature: -3,
        controller_temperature: 31,
        load_voltage: 13.3,
        load_current: 0.52,
        load_power: 7,
        solar_voltage: 19.6,
        solar_current: 4.12,
        solar_power: 81,
        charging_amp_hours_today: 22,
        discharging_amp_hours_today: 4,
        power_generation_today: 305,
        charging_status: ChargingStatus::Boost,
        load_on: false,
        collected_at_ms: 1_700_000_000_000,
    }
}

#[test]
fn each_sensor_reflects_its_reading_field() {
    let reading = reading();
    let by_key = |key: SensorKey| {
        states(&reading)
            .into_iter()
            .find(|(sensor, _)| sensor.key == key)
            .map(|(_, state)| state)
            .expect("sensor present")
    };

    assert_eq!(by_key(SensorKey::SolarVoltage), SensorState::Number(19.6));
    assert_eq!(by_key(SensorKey::SolarCurrent), SensorState::Number(4.12));
    assert_eq!(by_key(SensorKey::SolarPower), SensorState::Number(81.0));
    assert_eq!(by_key(SensorKey::BatteryVoltage), SensorState::Number(13.4));
    assert_eq!(by_key(SensorKey::BatteryPercentage), SensorState::Number(91.0));
    assert_eq!(by_key(SensorKey::PowerGenerationToday), SensorState::Number(305.0));
    assert_eq!(by_key(SensorKey::ChargingStatus), SensorState::Text("boost"));
    assert_eq!(by_key(SensorKey::ControllerTemperature), SensorState::Number(31.0));
    assert_eq!(by_key(SensorKey::BatteryTemperature), SensorState::Number(-3.0));
    assert_eq!(by_key(SensorKey::LoadVoltage), SensorState::Number(13.3));
    assert_eq!(by_key(SensorKey::LoadCurrent), SensorState::Number(0.52));
    assert_eq!(by_key(SensorKey::LoadPower), SensorState::Number(7.0));
    assert_eq!(by_key(SensorKey::ChargingAmpHoursToday), SensorState::Number(22.0));
    assert_eq!(by_key(SensorKey::DischargingAmpHoursToday), SensorState::Number(4.0));
    assert_eq!(by_key(SensorKey::LoadStatus), SensorState::Text("off"));
}

#[test]
fn units_match_device_classes() {
    for sensor in SENSORS {
        let expected = match sensor.device_class {
            Some(DeviceClass::Voltage) => Some("V"),
            Some(DeviceClass::Current) => Some("A"),
            Some(DeviceClass::Power) => Some("W"),
            Some(DeviceClass::Energy) => Some("Wh"),
            Some(DeviceClass::Battery) => Some("%"),
            Some(DeviceClass::Temperature) => Some("°C"),
            Some(DeviceClass::Enum) => None,
            None => sensor.unit,
        };
        assert_eq!(sensor.unit, expected, "{}", sensor.key);
    }
}

#[test]
fn enum_sensors_list_every_state_they_can_report() {
    let charging = description(SensorKey::ChargingStatus).expect("charging status");
    let options = charging.options.expect("options");
    for raw in 0..=255u8 {
        let label = ChargingStatus::from_raw(raw).label();
        assert!(options.contains(&label), "{label} missing");
    }
    assert_eq!(charging.state_class, None);
}

#[test]
fn energy_sensor_is_total_increasing() {
    let energy = description(SensorKey::PowerGenerationToday).expect("energy");
    assert_eq!(energy.state_class, Some(StateClass::TotalIncreasing));
}

#[test]
fn only_controller_temperature_and_status_are_diagnostic() {
    let diagnostic: Vec<SensorKey> = SENSORS
        .iter()
        .filter(|sensor| sensor.entity_category == Some(EntityCategory::Diagnostic))
        .map(|sensor| sensor.key)
        .collect();
    assert_eq!(
        diagnostic,
        vec![SensorKey::ChargingStatus, SensorKey::ControllerTemperature]
    );
}

#[test]
fn unique_ids_are_distinct_and_keyed_by_serial() {
    let ids: HashSet<String> = SENSORS
        .iter()
        .map(|sensor| unique_id("16071234", sensor.key))
        .collect();
    assert_eq!(ids.len(), SENSORS.len());
    assert!(ids.contains("renogy_rover_16071234_solar_voltage"));
}

#[test]
fn states_serialize_as_plain_values() {
    assert_eq!(
        serde_json::to_string(&SensorState::Number(13.4)).expect("json"),
        "13.4"
    );
    assert_eq!(
        serde_json::to_string(&SensorState::Text("mppt")).expect("json"),
        "\"mppt\""
    );
    assert_eq!(SensorState::Number(81.0).to_string(), "81");
}
