use modbus_client::{ClientConfig, ClientError, ModbusClient, RegisterReader, Transport};

#[tokio::test]
async fn serial_integration_read() {
    let port = match std::env::var("RENOGY_TEST_PORT") {
        Ok(value) => value,
        Err(_) => return,
    };

    let unit_id = env_u16("RENOGY_TEST_UNIT_ID").unwrap_or(1) as u8;
    let start = env_u16("RENOGY_TEST_START").unwrap_or(0x0100);
    let count = env_u16("RENOGY_TEST_COUNT").unwrap_or(33);

    let mut config = ClientConfig::default();
    config.transport = Transport::serial(port);
    config.max_batch_size = env_u16("RENOGY_TEST_MAX_BATCH");
    config.timeout_ms = env_u64("RENOGY_TEST_TIMEOUT_MS").unwrap_or(1_000);
    config.retry_count = 1;

    let client = ModbusClient::connect(config).await.expect("connect");
    let values = client
        .read_range(unit_id, start, count)
        .await
        .expect("read");

    assert_eq!(values.len() as u16, count);
}

#[tokio::test]
async fn missing_serial_port_is_invalid_port() {
    let mut config = ClientConfig::default();
    config.transport = Transport::serial("/dev/renogy-rover-does-not-exist");

    match ModbusClient::connect(config).await {
        Err(ClientError::InvalidPort(port)) => {
            assert_eq!(port, "/dev/renogy-rover-does-not-exist");
        }
        Err(ClientError::CannotOpenPort { .. }) => {}
        Err(err) => panic!("unexpected connect error: {err}"),
        Ok(_) => panic!("connect to a missing port succeeded"),
    }
}

fn env_u16(key: &str) -> Option<u16> {
    std::env::var(key).ok().and_then(|value| value.parse().ok())
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|value| value.parse().ok())
}
