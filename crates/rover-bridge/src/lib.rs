pub mod config;
pub mod http;

pub use config::{BridgeConfig, DeviceConfig, TransportKind, AUTO_PORT};
