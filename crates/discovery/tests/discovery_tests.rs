use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use discovery::{
    candidate_addresses, identify, scan_serial_ports, verify_serial, DiscoveryConfig,
    DiscoveryError,
};
use modbus_client::memory::MemoryRegisters;
use modbus_client::ClientError;
use rover_registers::{BATTERY_START, INFO_START};

fn install_controller(bus: &MemoryRegisters, unit_id: u8, serial: (u16, u16)) {
    let mut info = vec![0x1828, 0];
    info.extend([
        0x524E, 0x472D, 0x4354, 0x524C, 0x2D52, 0x5652, 0x3430, 0x2020,
    ]);
    info.extend([0x0001, 0x0100, 0x0001, 0x0000]);
    info.extend([serial.0, serial.1]);
    bus.set_block(unit_id, INFO_START, &info);
    bus.set_block(unit_id, BATTERY_START, &[100, 0x1818, 3]);
}

#[tokio::test]
async fn scan_finds_first_answering_address() {
    let bus = MemoryRegisters::new();
    install_controller(&bus, 4, (16, 1001));

    let addresses = candidate_addresses(None, &DiscoveryConfig::default());
    let info = identify(&bus, &addresses).await.expect("identify");

    assert_eq!(info.unit_id, 4);
    assert_eq!(info.model, "RNG-CTRL-RVR40");
    assert_eq!(info.serial_number, "161001");
    assert_eq!(info.system_voltage, 24);

    let probed: Vec<u8> = bus.reads().iter().map(|(unit, _, _)| *unit).collect();
    assert_eq!(probed, vec![1, 2, 3, 4, 4]);
}

#[tokio::test]
async fn configured_address_is_the_only_candidate() {
    let bus = MemoryRegisters::new();
    install_controller(&bus, 1, (1, 2));
    install_controller(&bus, 7, (7, 7));

    let addresses = candidate_addresses(Some(7), &DiscoveryConfig::default());
    assert_eq!(addresses, vec![7]);

    let info = identify(&bus, &addresses).await.expect("identify");
    assert_eq!(info.serial_number, "77");
}

#[tokio::test]
async fn silent_bus_reports_no_device() {
    let bus = MemoryRegisters::new();
    let config = DiscoveryConfig {
        scan_min_address: 1,
        scan_max_address: 3,
        ..DiscoveryConfig::default()
    };

    let err = identify(&bus, &candidate_addresses(None, &config))
        .await
        .expect_err("no device");
    assert!(matches!(err, DiscoveryError::NoDeviceFound { min: 1, max: 3 }));
    assert_eq!(bus.reads().len(), 3);
}

#[tokio::test]
async fn non_timeout_failure_aborts_scan() {
    let bus = MemoryRegisters::new();
    install_controller(&bus, 2, (1, 1));
    bus.fail_next(ClientError::AddressOverflow);

    let err = identify(&bus, &[1, 2]).await.expect_err("aborted");
    assert!(matches!(err, DiscoveryError::Read(_)));
    assert_eq!(bus.reads().len(), 1);
}

#[tokio::test]
async fn serial_number_must_match_configuration() {
    let bus = MemoryRegisters::new();
    install_controller(&bus, 1, (12, 34));
    let info = identify(&bus, &[1]).await.expect("identify");

    verify_serial(None, &info).expect("no expectation");
    verify_serial(Some("1234"), &info).expect("matching serial");
    let err = verify_serial(Some("9999"), &info).expect_err("mismatch");
    assert!(matches!(err, DiscoveryError::SerialMismatch { .. }));
}

#[test]
fn by_id_links_are_preferred_and_sorted() {
    let dir = temp_dir("by_id_links");
    fs::write(dir.join("usb-Prolific_B-if00-port0"), b"").expect("write");
    fs::write(dir.join("usb-Prolific_A-if00-port0"), b"").expect("write");

    let config = DiscoveryConfig {
        by_id_dir: dir.clone(),
        ..DiscoveryConfig::default()
    };
    let ports = scan_serial_ports(&config).expect("scan");
    assert_eq!(ports.ports.len(), 2);
    assert!(ports.default_port.ends_with("usb-Prolific_A-if00-port0"));

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn empty_by_id_dir_means_no_ports() {
    let dir = temp_dir("by_id_empty");
    let config = DiscoveryConfig {
        by_id_dir: dir.clone(),
        ..DiscoveryConfig::default()
    };

    assert!(matches!(
        scan_serial_ports(&config),
        Err(DiscoveryError::NoSerialPorts)
    ));

    let _ = fs::remove_dir_all(dir);
}

fn temp_dir(prefix: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    let pid = std::process::id();
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    path.push(format!("{prefix}-{pid}-{ts}"));
    fs::create_dir_all(&path).expect("create temp dir");
    path
}
