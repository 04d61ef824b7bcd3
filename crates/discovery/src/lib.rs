use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use modbus_client::{ClientError, RegisterReader};
use rover_registers::{read_device_info, ReadError};
use types::DeviceInfo;

pub const MIN_DEVICE_ADDRESS: u8 = 1;
pub const MAX_DEVICE_ADDRESS: u8 = 16;

/// Symlinks named after the USB device id; stable across reboots unlike ttyUSBn numbering.
pub const SERIAL_BY_ID_DIR: &str = "/dev/serial/by-id";

#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Inclusive unit address range tried when no address is configured.
    pub scan_min_address: u8,
    pub scan_max_address: u8,
    pub by_id_dir: PathBuf,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            scan_min_address: MIN_DEVICE_ADDRESS,
            scan_max_address: MAX_DEVICE_ADDRESS,
            by_id_dir: PathBuf::from(SERIAL_BY_ID_DIR),
        }
    }
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("no serial ports found")]
    NoSerialPorts,
    #[error("serial port enumeration failed: {0}")]
    Enumerate(String),
    #[error("no device answered on unit addresses {min}..={max}")]
    NoDeviceFound { min: u8, max: u8 },
    #[error("device serial number {found} does not match configured {expected}")]
    SerialMismatch { expected: String, found: String },
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Read(#[from] ReadError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialPorts {
    pub ports: Vec<String>,
    pub default_port: String,
}

/// Lists candidate serial ports, preferring the by-id symlinks when the directory exists.
pub fn scan_serial_ports(config: &DiscoveryConfig) -> Result<SerialPorts, DiscoveryError> {
    let mut ports = match list_dir(&config.by_id_dir) {
        Some(ports) => ports,
        None => tokio_serial::available_ports()
            .map_err(|err| DiscoveryError::Enumerate(err.to_string()))?
            .into_iter()
            .map(|info| info.port_name)
            .collect(),
    };
    ports.sort();

    for port in &ports {
        debug!(port = %port, "found serial port");
    }

    match ports.first().cloned() {
        Some(default_port) => Ok(SerialPorts {
            ports,
            default_port,
        }),
        None => {
            warn!("no serial ports found");
            Err(DiscoveryError::NoSerialPorts)
        }
    }
}

fn list_dir(dir: &Path) -> Option<Vec<String>> {
    let entries = fs::read_dir(dir).ok()?;
    Some(
        entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path().to_string_lossy().into_owned())
            .collect(),
    )
}

/// Addresses to probe: just the configured one, or the whole scan range.
pub fn candidate_addresses(configured: Option<u8>, config: &DiscoveryConfig) -> Vec<u8> {
    match configured {
        Some(unit_id) => vec![unit_id],
        None => (config.scan_min_address..=config.scan_max_address).collect(),
    }
}

/// Probes `addresses` in order and returns the first controller that answers.
///
/// Silence on an address moves on to the next one; any other failure aborts the scan.
pub async fn identify<R>(reader: &R, addresses: &[u8]) -> Result<DeviceInfo, DiscoveryError>
where
    R: RegisterReader + ?Sized,
{
    for &unit_id in addresses {
        match read_device_info(reader, unit_id).await {
            Ok(info) => {
                info!(
                    unit_id,
                    model = %info.model,
                    serial = %info.serial_number,
                    software = %info.software_version,
                    hardware = %info.hardware_version,
                    "controller identified"
                );
                return Ok(info);
            }
            Err(err) if err.is_no_response() => {
                debug!(unit_id, error = %err, "no answer on unit address");
            }
            Err(err) => return Err(err.into()),
        }
    }

    Err(DiscoveryError::NoDeviceFound {
        min: addresses.iter().copied().min().unwrap_or(0),
        max: addresses.iter().copied().max().unwrap_or(0),
    })
}

/// Guards against a different controller having been plugged into the configured port.
pub fn verify_serial(expected: Option<&str>, info: &DeviceInfo) -> Result<(), DiscoveryError> {
    match expected {
        Some(expected) if expected != info.serial_number => Err(DiscoveryError::SerialMismatch {
            expected: expected.to_string(),
            found: info.serial_number.clone(),
        }),
        _ => Ok(()),
    }
}
