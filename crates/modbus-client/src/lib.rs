use std::cmp::min;
use std::fmt;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::lookup_host;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tokio_modbus::client::{rtu, tcp, Context};
use tokio_modbus::prelude::{Reader, Slave, SlaveContext};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

#[cfg(feature = "testing")]
pub mod memory;

/// How the controller is attached.
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    /// USB/RS232 adapter speaking Modbus RTU.
    Serial {
        port: String,
        baud_rate: u32,
        data_bits: u8,
        /// "none", "even" or "odd".
        parity: String,
        stop_bits: u8,
    },
    /// Serial-to-Ethernet gateway speaking Modbus TCP.
    Tcp { host: String, port: u16 },
}

impl Transport {
    pub fn serial(port: impl Into<String>) -> Self {
        Self::Serial {
            port: port.into(),
            baud_rate: 9_600,
            data_bits: 8,
            parity: "none".to_string(),
            stop_bits: 1,
        }
    }

    /// Port path or host:port, used to label logs and device identities.
    pub fn endpoint(&self) -> String {
        match self {
            Self::Serial { port, .. } => port.clone(),
            Self::Tcp { host, port } => format!("{host}:{port}"),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serial { port, baud_rate, .. } => write!(f, "rtu {port} @ {baud_rate}"),
            Self::Tcp { host, port } => write!(f, "tcp {host}:{port}"),
        }
    }
}

/// Configuration options for connecting and polling a Rover over Modbus.
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub transport: Transport,
    /// Maximum number of registers to read in a single request; devices with quirks may require lower batch sizes.
    pub max_batch_size: Option<u16>,
    /// Per-request timeout in milliseconds.
    pub timeout_ms: u64,
    /// Number of retries per request after the initial attempt.
    pub retry_count: usize,
    /// Base delay between retries in milliseconds (exponential backoff).
    pub retry_backoff_ms: u64,
    /// Upper bound for retry backoff delay in milliseconds.
    pub retry_max_backoff_ms: u64,
    /// Optional delay between split reads to placate slower devices.
    pub inter_read_delay_ms: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            transport: Transport::serial("/dev/ttyUSB0"),
            max_batch_size: None,
            timeout_ms: 500,
            retry_count: 2,
            retry_backoff_ms: 100,
            retry_max_backoff_ms: 2_000,
            inter_read_delay_ms: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("cannot resolve {0}:{1}")]
    InvalidAddress(String, u16),
    #[error("serial port {0} does not exist")]
    InvalidPort(String),
    #[error("cannot open serial port {port}: {reason}")]
    CannotOpenPort { port: String, reason: String },
    #[error("modbus transport error: {0}")]
    Modbus(io::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("register address overflow")]
    AddressOverflow,
}

impl ClientError {
    /// True when the bus is up but nobody answered, which an address scan treats as "try the next one".
    pub fn is_no_response(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Modbus(_))
    }
}

/// Anything that can hand back a range of holding registers for a unit address.
#[async_trait]
pub trait RegisterReader: Send + Sync {
    async fn read_range(&self, unit_id: u8, start: u16, count: u16) -> Result<Vec<u16>, ClientError>;
}

#[derive(Debug)]
pub struct ModbusClient {
    config: ClientConfig,
    context: Mutex<Context>,
}

impl ModbusClient {
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let context = match &config.transport {
            Transport::Serial {
                port,
                baud_rate,
                data_bits,
                parity,
                stop_bits,
            } => {
                let builder = tokio_serial::new(port, *baud_rate)
                    .data_bits(data_bits_of(*data_bits))
                    .parity(parity_of(parity))
                    .stop_bits(stop_bits_of(*stop_bits))
                    .timeout(Duration::from_millis(config.timeout_ms));
                let stream = builder
                    .open_native_async()
                    .map_err(|err| classify_open_error(port, err))?;
                info!(port = %port, baud_rate, "serial port opened");
                attach(stream)
            }
            Transport::Tcp { host, port } => {
                timeout(Duration::from_millis(config.timeout_ms), connect_tcp(host, *port))
                    .await
                    .map_err(|_| ClientError::Timeout {
                        timeout_ms: config.timeout_ms,
                    })??
            }
        };

        Ok(Self {
            config,
            context: Mutex::new(context),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

#[async_trait]
impl RegisterReader for ModbusClient {
    async fn read_range(&self, unit_id: u8, start: u16, count: u16) -> Result<Vec<u16>, ClientError> {
        let mut ctx = self.context.lock().await;
        read_batched(&mut *ctx, &self.config, unit_id, start, count).await
    }
}

/// A single holding register request, without retries or batching.
#[async_trait]
pub trait ChunkSource: Send {
    async fn read_holding(&mut self, unit_id: u8, start: u16, count: u16) -> io::Result<Vec<u16>>;
}

#[async_trait]
impl ChunkSource for Context {
    async fn read_holding(&mut self, unit_id: u8, start: u16, count: u16) -> io::Result<Vec<u16>> {
        self.set_slave(Slave(unit_id));
        self.read_holding_registers(start, count).await
    }
}

/// Reads `count` registers in requests of at most `max_batch_size`, each with timeout and retries.
pub async fn read_batched<S>(
    source: &mut S,
    config: &ClientConfig,
    unit_id: u8,
    start: u16,
    count: u16,
) -> Result<Vec<u16>, ClientError>
where
    S: ChunkSource + ?Sized,
{
    if count == 0 {
        return Ok(Vec::new());
    }

    let batch_size = config.max_batch_size.unwrap_or(count).max(1u16);
    let mut remaining = count;
    let mut offset = 0u16;
    let mut out = Vec::with_capacity(count as usize);

    while remaining > 0 {
        let chunk = min(remaining, batch_size);
        let chunk_start = u16::try_from(u32::from(start) + u32::from(offset))
            .map_err(|_| ClientError::AddressOverflow)?;
        let values = read_chunk(source, config, unit_id, chunk_start, chunk).await?;
        out.extend(values);
        remaining -= chunk;
        offset += chunk;

        if remaining > 0 {
            if let Some(delay_ms) = config.inter_read_delay_ms {
                sleep(Duration::from_millis(delay_ms)).await;
            }
        }
    }

    Ok(out)
}

async fn read_chunk<S>(
    source: &mut S,
    config: &ClientConfig,
    unit_id: u8,
    start: u16,
    count: u16,
) -> Result<Vec<u16>, ClientError>
where
    S: ChunkSource + ?Sized,
{
    let mut attempt = 0usize;

    loop {
        let request = source.read_holding(unit_id, start, count);
        let error = match timeout(Duration::from_millis(config.timeout_ms), request).await {
            Ok(Ok(values)) => {
                debug!(unit_id, start, count, "modbus read ok");
                return Ok(values);
            }
            Ok(Err(err)) => {
                warn!(unit_id, start, count, error = %err, "modbus read error");
                ClientError::Modbus(err)
            }
            Err(_) => {
                debug!(unit_id, start, count, "modbus read timeout");
                ClientError::Timeout {
                    timeout_ms: config.timeout_ms,
                }
            }
        };

        if attempt >= config.retry_count {
            return Err(error);
        }

        let delay_ms = retry_delay_ms(config, attempt);
        attempt += 1;
        sleep(Duration::from_millis(delay_ms)).await;
    }
}

/// Tries every address `host` resolves to, in resolver order.
async fn connect_tcp(host: &str, port: u16) -> Result<Context, ClientError> {
    let addrs = lookup_host((host, port))
        .await
        .map_err(|_| ClientError::InvalidAddress(host.to_string(), port))?;

    let mut last_error = ClientError::InvalidAddress(host.to_string(), port);
    for addr in addrs {
        match tcp::connect(addr).await {
            Ok(context) => {
                info!(%addr, "modbus tcp connected");
                return Ok(context);
            }
            Err(err) => {
                debug!(%addr, error = %err, "modbus tcp connect failed");
                last_error = ClientError::Io(err);
            }
        }
    }

    Err(last_error)
}

/// Exponential backoff for the `attempt`-th retry, clamped to the configured maximum.
pub fn retry_delay_ms(config: &ClientConfig, attempt: usize) -> u64 {
    let base = config.retry_backoff_ms.max(1);
    let shift = u32::try_from(attempt).unwrap_or(u32::MAX);
    let factor = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
    let delay = base.saturating_mul(factor);
    let max = config.retry_max_backoff_ms.max(base);
    min(delay, max)
}

fn attach(stream: SerialStream) -> Context {
    // Unit address is set per request.
    rtu::attach_slave(stream, Slave(1))
}

fn classify_open_error(port: &str, err: tokio_serial::Error) -> ClientError {
    match err.kind {
        tokio_serial::ErrorKind::NoDevice
        | tokio_serial::ErrorKind::Io(std::io::ErrorKind::NotFound) => {
            ClientError::InvalidPort(port.to_string())
        }
        _ => ClientError::CannotOpenPort {
            port: port.to_string(),
            reason: err.description,
        },
    }
}

fn data_bits_of(bits: u8) -> tokio_serial::DataBits {
    match bits {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        _ => tokio_serial::DataBits::Eight,
    }
}

fn parity_of(parity: &str) -> tokio_serial::Parity {
    match parity.to_ascii_lowercase().as_str() {
        "even" => tokio_serial::Parity::Even,
        "odd" => tokio_serial::Parity::Odd,
        _ => tokio_serial::Parity::None,
    }
}

fn stop_bits_of(bits: u8) -> tokio_serial::StopBits {
    match bits {
        2 => tokio_serial::StopBits::Two,
        _ => tokio_serial::StopBits::One,
    }
}
