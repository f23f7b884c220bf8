//! End-to-end tests against simulated engines

use std::time::Duration;

use ax_engine::{AgwConfig, AgwServer, Connection, EngineEvent, ErrorKind, VaraConfig, VaraServer};
use ax_protocol::DataKind;
use ax_sim::{SimTnc, SimVaraModem};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::timeout;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

async fn next_event(events: &mut mpsc::Receiver<EngineEvent>) -> EngineEvent {
    timeout(EVENT_TIMEOUT, events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

async fn expect_connection(events: &mut mpsc::Receiver<EngineEvent>) -> Connection {
    match next_event(events).await {
        EngineEvent::Connection(conn) => conn,
        other => panic!("expected a connection event, got {other:?}"),
    }
}

async fn agw_setup(my_calls: Vec<String>) -> (SimTnc, AgwServer, mpsc::Receiver<EngineEvent>) {
    let tnc = SimTnc::bind().await.unwrap();
    let config = AgwConfig {
        port: tnc.port(),
        my_calls,
        ..AgwConfig::default()
    };
    let (server, events) = AgwServer::connect(config).await.unwrap();
    (tnc, server, events)
}

#[tokio::test]
async fn test_agw_listen_registers_on_every_port() {
    let (tnc, server, mut events) = agw_setup(vec!["N0CALL".to_string()]).await;
    let mut session = tnc.accept().await.unwrap();
    server.listen(Vec::new(), None).await.unwrap();

    // The session asks for the port count, probes each port, then
    // registers the call sign on both simulated ports.
    let mut registered_ports = Vec::new();
    for _ in 0..2 {
        let frame = session.recv_until(DataKind::Register).await.unwrap();
        assert_eq!(frame.call_from, "N0CALL");
        registered_ports.push(frame.port);
        session.serve_query(&frame).await.unwrap();
    }
    registered_ports.sort_unstable();
    assert_eq!(registered_ports, vec![0, 1]);

    for _ in 0..2 {
        match next_event(&mut events).await {
            EngineEvent::Listening { my_call, .. } => assert_eq!(my_call, "N0CALL"),
            other => panic!("expected a listening event, got {other:?}"),
        }
    }
    server.close().await;
}

#[tokio::test]
async fn test_agw_connection_round_trip() {
    let (tnc, server, mut events) = agw_setup(Vec::new()).await;
    let mut session = tnc.accept().await.unwrap();

    session.send_connect(0, "KE9YQ", "N0CALL").await.unwrap();
    let mut conn = expect_connection(&mut events).await;
    assert_eq!(conn.their_call(), "KE9YQ");
    assert_eq!(conn.my_call(), "N0CALL");
    assert_eq!(conn.port(), 0);

    session.send_data(0, "KE9YQ", "N0CALL", b"hello\r").await.unwrap();
    assert_eq!(conn.recv().await, Some(b"hello\r".to_vec()));

    // Small writes batch up and go out as one data frame.
    conn.send(b"73 ".to_vec()).await.unwrap();
    conn.send(b"de N0CALL\r".to_vec()).await.unwrap();
    let frame = session.recv_until(DataKind::Data).await.unwrap();
    assert_eq!(frame.data, b"73 de N0CALL\r");
    assert_eq!(frame.call_from, "N0CALL");
    assert_eq!(frame.call_to, "KE9YQ");

    // Graceful close: the disconnect frame arrives once the engine
    // reports its queue empty, and the stream then ends.
    conn.end().await.unwrap();
    let frame = session.recv_until(DataKind::Disconnect).await.unwrap();
    assert_eq!(frame.call_from, "N0CALL");
    assert_eq!(timeout(EVENT_TIMEOUT, conn.recv()).await.unwrap(), None);

    server.close().await;
}

#[tokio::test]
async fn test_agw_remote_disconnect_sends_no_disconnect_frame() {
    let (tnc, server, mut events) = agw_setup(Vec::new()).await;
    let mut session = tnc.accept().await.unwrap();

    session.send_connect(0, "KE9YQ", "N0CALL").await.unwrap();
    let mut conn = expect_connection(&mut events).await;

    session.send_disconnect(0, "KE9YQ", "N0CALL").await.unwrap();
    assert_eq!(timeout(EVENT_TIMEOUT, conn.recv()).await.unwrap(), None);

    // Closing drops the socket; everything sent up to that point must
    // be queries, never a disconnect of our own.
    server.close().await;
    loop {
        match session.recv_frame().await {
            Ok(frame) => assert_ne!(frame.kind, DataKind::Disconnect),
            Err(_) => break,
        }
    }
}

async fn vara_setup() -> (SimVaraModem, VaraServer, mpsc::Receiver<EngineEvent>) {
    let modem = SimVaraModem::bind().await.unwrap();
    let config = VaraConfig {
        control_port: modem.control_port(),
        data_port: modem.data_port(),
        my_calls: vec!["N0CALL".to_string()],
        ..VaraConfig::default()
    };
    let (server, events) = VaraServer::connect(config).await.unwrap();
    (modem, server, events)
}

#[tokio::test]
async fn test_vara_handshake_is_strictly_ordered() {
    let (modem, server, _events) = vara_setup().await;
    let mut control = modem.accept_control().await.unwrap();

    assert_eq!(control.recv_line().await.unwrap(), "VERSION");
    // MYCALL must not go out until VERSION is answered.
    assert!(timeout(Duration::from_millis(200), control.recv_line())
        .await
        .is_err());
    control.send_line("VERSION 4.8.7").await.unwrap();
    assert_eq!(control.recv_line().await.unwrap(), "MYCALL N0CALL");
    control.send_line("OK").await.unwrap();
    assert_eq!(control.recv_line().await.unwrap(), "LISTEN ON");
    control.send_line("OK").await.unwrap();

    server.close().await;
}

#[tokio::test]
async fn test_vara_connection_round_trip() {
    let (modem, server, mut events) = vara_setup().await;
    let mut control = modem.accept_control().await.unwrap();
    control.run_handshake().await.unwrap();

    control.send_line("PENDING").await.unwrap();
    let mut data = modem.accept_data().await.unwrap();
    control.send_line("CONNECTED KE9YQ N0CALL").await.unwrap();

    let mut conn = expect_connection(&mut events).await;
    assert_eq!(conn.their_call(), "KE9YQ");
    assert_eq!(conn.my_call(), "N0CALL");

    data.write_all(b"hello\r").await.unwrap();
    assert_eq!(conn.recv().await, Some(b"hello\r".to_vec()));

    conn.send(b"73\r".to_vec()).await.unwrap();
    let mut buf = [0u8; 16];
    let n = timeout(EVENT_TIMEOUT, data.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..n], b"73\r");

    server.close().await;
}

#[tokio::test]
async fn test_vara_disconnect_waits_for_buffer_to_drain() {
    let (modem, server, mut events) = vara_setup().await;
    let mut control = modem.accept_control().await.unwrap();
    control.run_handshake().await.unwrap();

    control.send_line("PENDING").await.unwrap();
    let _data = modem.accept_data().await.unwrap();
    control.send_line("CONNECTED KE9YQ N0CALL").await.unwrap();
    let mut conn = expect_connection(&mut events).await;

    conn.send(b"final words\r".to_vec()).await.unwrap();
    conn.end().await.unwrap();

    // The modem still holds our bytes: no DISCONNECT yet.
    assert!(timeout(Duration::from_millis(200), control.recv_line())
        .await
        .is_err());
    control.send_line("BUFFER 12").await.unwrap();
    assert!(timeout(Duration::from_millis(200), control.recv_line())
        .await
        .is_err());

    // Buffer empty: the disconnect goes out and the stream ends.
    control.send_line("BUFFER 0").await.unwrap();
    assert_eq!(control.recv_line().await.unwrap(), "DISCONNECT");
    assert_eq!(timeout(EVENT_TIMEOUT, conn.recv()).await.unwrap(), None);

    server.close().await;
}

#[tokio::test]
async fn test_vara_missing_report_is_fatal() {
    let (modem, _server, mut events) = vara_setup().await;
    let mut control = modem.accept_control().await.unwrap();

    assert_eq!(control.recv_line().await.unwrap(), "VERSION");
    control.send_line("VERSION 4.8.7").await.unwrap();
    assert_eq!(control.recv_line().await.unwrap(), "MYCALL N0CALL");
    control.send_line("MISSING CALLSIGN").await.unwrap();

    match next_event(&mut events).await {
        EngineEvent::Error { kind, message, .. } => {
            assert_eq!(kind, ErrorKind::Protocol);
            assert!(message.contains("CALLSIGN"), "{message}");
        }
        other => panic!("expected an error event, got {other:?}"),
    }
    assert!(matches!(next_event(&mut events).await, EngineEvent::Closed));
}
