use modbus_client::{ClientConfig, ClientError, ModbusClient, Transport};
use tokio::net::TcpListener;

fn tcp_config(host: &str, port: u16) -> ClientConfig {
    ClientConfig {
        transport: Transport::Tcp {
            host: host.to_string(),
            port,
        },
        timeout_ms: 2_000,
        ..ClientConfig::default()
    }
}

#[tokio::test]
async fn gateway_hostname_is_resolved() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("local addr").port();
    let accept = tokio::spawn(async move { listener.accept().await.map(|(stream, _)| stream) });

    let client = ModbusClient::connect(tcp_config("localhost", port)).await;
    assert!(client.is_ok(), "connect by hostname failed: {:?}", client.err());

    let _stream = accept.await.expect("join").expect("accept");
}

#[tokio::test]
async fn unresolvable_gateway_fails_to_connect() {
    let result = ModbusClient::connect(tcp_config("rover-gateway.invalid", 502)).await;

    match result {
        Err(ClientError::InvalidAddress(host, 502)) => assert_eq!(host, "rover-gateway.invalid"),
        Err(ClientError::Timeout { .. }) => {}
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("connected to an unresolvable host"),
    }
}
