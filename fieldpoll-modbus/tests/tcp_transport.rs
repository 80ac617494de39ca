//! `ModbusTransport` against a scripted Modbus TCP server on loopback.

use fieldpoll_common::DatapointValue;
use fieldpoll_modbus::config::{ConnectionConfig, ModbusPluginConfig, TransportConfig};
use fieldpoll_modbus::session::ModbusSession;
use fieldpoll_modbus::transport::{ModbusTransport, Transport, TransportError};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// How the server answers one request.
#[derive(Debug, Clone, Copy)]
enum Reply {
    Value(u16),
    Late(Duration, u16),
    Exception(u8),
    Close,
}

/// Decides the reply from (connection index, request index on that
/// connection, register address).
type Script = dyn Fn(usize, usize, u16) -> Reply + Send + Sync;

async fn spawn_server(script: Arc<Script>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let mut connection = 0;
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve(stream, connection, script.clone()));
            connection += 1;
        }
    });

    port
}

async fn serve(mut stream: TcpStream, connection: usize, script: Arc<Script>) {
    // MBAP header (7 bytes) + function + address + quantity.
    let mut request = [0u8; 12];
    let mut index = 0;

    while stream.read_exact(&mut request).await.is_ok() {
        let address = u16::from_be_bytes([request[8], request[9]]);
        let reply = script(connection, index, address);
        index += 1;

        let (transaction, unit, function) = ([request[0], request[1]], request[6], request[7]);
        let frame = match reply {
            Reply::Value(value) | Reply::Late(_, value) => {
                let [hi, lo] = value.to_be_bytes();
                vec![
                    transaction[0],
                    transaction[1],
                    0,
                    0,
                    0,
                    5,
                    unit,
                    function,
                    2,
                    hi,
                    lo,
                ]
            }
            Reply::Exception(code) => vec![
                transaction[0],
                transaction[1],
                0,
                0,
                0,
                3,
                unit,
                function | 0x80,
                code,
            ],
            Reply::Close => return,
        };

        if let Reply::Late(delay, _) = reply {
            tokio::time::sleep(delay).await;
        }
        if stream.write_all(&frame).await.is_err() {
            return;
        }
    }
}

fn transport_config(port: u16, timeout: Duration) -> TransportConfig {
    TransportConfig {
        connection: ConnectionConfig::Tcp {
            address: "127.0.0.1".to_string(),
            port,
        },
        timeout,
    }
}

#[tokio::test]
async fn test_read_exception_and_peer_close() {
    let port = spawn_server(Arc::new(
        |connection: usize, index: usize, _: u16| match (connection, index) {
            (0, 0) => Reply::Value(235),
            (0, 1) => Reply::Exception(0x02),
            (0, _) => Reply::Close,
            _ => Reply::Value(55),
        },
    ))
    .await;

    let mut transport = ModbusTransport::new(transport_config(port, Duration::from_millis(500)));
    transport.connect().await.unwrap();
    transport.select_slave(1);

    assert_eq!(transport.read_holding_register(0).await.unwrap(), 235);

    let err = transport.read_holding_register(1).await.unwrap_err();
    assert!(matches!(err, TransportError::Exception(_)), "{err:?}");
    assert!(!err.is_broken_pipe());
    assert!(transport.is_open());

    // The server hangs up instead of answering.
    assert!(transport.read_holding_register(2).await.is_err());
    assert!(!transport.is_open());
    let err = transport.read_holding_register(2).await.unwrap_err();
    assert!(err.is_broken_pipe());

    transport.connect().await.unwrap();
    assert_eq!(transport.read_holding_register(0).await.unwrap(), 55);
}

#[tokio::test]
async fn test_late_reply_does_not_poison_later_reads() {
    let port = spawn_server(Arc::new(|connection: usize, index: usize, address: u16| {
        if (connection, index) == (0, 0) {
            Reply::Late(Duration::from_millis(300), 1)
        } else {
            Reply::Value(100 + address)
        }
    }))
    .await;

    let mut transport = ModbusTransport::new(transport_config(port, Duration::from_millis(100)));
    transport.connect().await.unwrap();

    let err = transport.read_holding_register(0).await.unwrap_err();
    assert!(matches!(err, TransportError::Timeout(_)), "{err:?}");
    assert!(!transport.is_open());

    let err = transport.read_holding_register(1).await.unwrap_err();
    assert!(matches!(err, TransportError::NotConnected));
    assert!(err.is_broken_pipe());

    transport.connect().await.unwrap();
    for address in 1..4 {
        assert_eq!(
            transport.read_holding_register(address).await.unwrap(),
            100 + address
        );
    }
}

#[tokio::test]
async fn test_session_recovers_after_timeout() {
    let port = spawn_server(Arc::new(|connection: usize, index: usize, _: u16| {
        if (connection, index) == (0, 0) {
            Reply::Late(Duration::from_millis(300), 1)
        } else {
            Reply::Value(235)
        }
    }))
    .await;

    let config = ModbusPluginConfig::from_json5(&format!(
        r#"{{ protocol: "TCP", address: "127.0.0.1", port: {}, timeout_ms: 100, map: {{ registers: {{ level: 0 }} }} }}"#,
        port
    ))
    .unwrap();

    let mut session = ModbusSession::init(&config).await.unwrap();

    let first = session.poll().await.unwrap();
    assert!(first.is_empty());
    assert!(!first.is_failed());

    for _ in 0..3 {
        let measurement = session.poll().await.unwrap();
        assert_eq!(measurement.get("level"), Some(DatapointValue::Integer(235)));
    }

    session.shutdown().await.unwrap();
}
