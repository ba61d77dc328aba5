use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::timeout;
use tungstenite::client::IntoClientRequest;
use tungstenite::http::HeaderValue;
use tungstenite::protocol::Message as WsMessage;

use crate::auth::StaticAuthenticator;
use crate::broker::{Broker, SharedBroker, lock_broker};
use crate::client::{Client, Outbound};
use crate::config::BrokerSettings;
use crate::protocol::{
    Connack, ConnackCode, Connect, LastWill, Packet, ProtocolVersion, QoS, Subscribe, encode,
};
use crate::transport::{Connection, Flow, start_tcp_server, start_websocket_server};

const CONNACK_ACCEPTED: [u8; 4] = [0x20, 0x02, 0x00, 0x00];

fn shared_broker() -> SharedBroker {
    Arc::new(Mutex::new(Broker::default()))
}

fn connection(broker: &SharedBroker) -> (Connection, UnboundedReceiver<Outbound>) {
    let (tx, rx) = mpsc::unbounded_channel::<Outbound>();
    (Connection::new(broker.clone(), Client::new(tx)), rx)
}

fn drain(rx: &mut UnboundedReceiver<Outbound>) -> Vec<Outbound> {
    let mut out = Vec::new();
    while let Ok(item) = rx.try_recv() {
        out.push(item);
    }
    out
}

fn connect(client_id: &str, keep_alive: u16, will: Option<LastWill>) -> Connect {
    Connect {
        protocol: ProtocolVersion::V311,
        clean_session: true,
        keep_alive,
        client_id: client_id.to_string(),
        will,
        username: None,
        password: None,
    }
}

fn connect_bytes(client_id: &str, keep_alive: u16) -> Bytes {
    encode(&Packet::Connect(connect(client_id, keep_alive, None)))
}

fn accepted() -> Outbound {
    Outbound::Packet(Packet::Connack(Connack {
        session_present: false,
        code: ConnackCode::Accepted,
    }))
}

fn will(topic: &str) -> LastWill {
    LastWill {
        topic: topic.to_string(),
        payload: Bytes::from_static(b"gone"),
        qos: QoS::AtMostOnce,
        retain: false,
    }
}

/// Attaches a connection subscribed to `filter` and returns its receiver.
fn subscriber(broker: &SharedBroker, filter: &str) -> (Connection, UnboundedReceiver<Outbound>) {
    let (mut conn, mut rx) = connection(broker);
    assert_eq!(conn.feed(&connect_bytes("watcher", 0)), Flow::Continue);
    let subscribe = encode(&Packet::Subscribe(Subscribe {
        packet_id: 1,
        filters: vec![(filter.to_string(), QoS::AtMostOnce)],
    }));
    assert_eq!(conn.feed(&subscribe), Flow::Continue);
    drain(&mut rx);
    (conn, rx)
}

#[test]
fn connect_is_acknowledged() {
    let broker = shared_broker();
    let (mut conn, mut rx) = connection(&broker);

    assert_eq!(conn.feed(&connect_bytes("sensor-1", 30)), Flow::Continue);
    assert_eq!(conn.client_id(), Some("sensor-1"));
    assert_eq!(drain(&mut rx), vec![accepted()]);
    assert!(lock_broker(&broker).session("sensor-1").is_some());
}

#[test]
fn partial_packet_waits_for_the_rest() {
    let broker = shared_broker();
    let (mut conn, mut rx) = connection(&broker);
    let bytes = connect_bytes("sensor-1", 30);

    assert_eq!(conn.feed(&bytes[..5]), Flow::Continue);
    assert!(drain(&mut rx).is_empty());
    assert_eq!(conn.client_id(), None);

    assert_eq!(conn.feed(&bytes[5..]), Flow::Continue);
    assert_eq!(drain(&mut rx), vec![accepted()]);
}

#[test]
fn several_packets_in_one_read() {
    let broker = shared_broker();
    let (mut conn, mut rx) = connection(&broker);

    let mut bytes = BytesMut::from(&connect_bytes("sensor-1", 30)[..]);
    bytes.extend_from_slice(&[0xC0, 0x00]);

    assert_eq!(conn.feed(&bytes), Flow::Continue);
    assert_eq!(
        drain(&mut rx),
        vec![accepted(), Outbound::Packet(Packet::Pingresp)]
    );
}

#[test]
fn first_packet_must_be_connect() {
    let broker = shared_broker();
    let (mut conn, mut rx) = connection(&broker);

    assert_eq!(conn.feed(&[0xC0, 0x00]), Flow::Close);
    assert_eq!(drain(&mut rx), vec![Outbound::Close]);
    assert!(lock_broker(&broker).sessions().is_empty());
}

#[test]
fn unsupported_protocol_level_is_refused() {
    let broker = shared_broker();
    let (mut conn, mut rx) = connection(&broker);
    let bytes = [
        0x10, 0x0D, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x05, 0x02, 0x00, 0x3C, 0x00, 0x01, b'a',
    ];

    assert_eq!(conn.feed(&bytes), Flow::Close);
    assert_eq!(
        drain(&mut rx),
        vec![
            Outbound::Packet(Packet::Connack(Connack {
                session_present: false,
                code: ConnackCode::UnacceptableProtocolVersion,
            })),
            Outbound::Close,
        ]
    );
}

#[test]
fn malformed_packet_closes_without_reply() {
    let broker = shared_broker();
    let (mut conn, mut rx) = connection(&broker);
    conn.feed(&connect_bytes("sensor-1", 30));
    drain(&mut rx);

    // packet type 0 is reserved
    assert_eq!(conn.feed(&[0x00, 0x00]), Flow::Close);
    assert_eq!(drain(&mut rx), vec![Outbound::Close]);
}

#[test]
fn second_connect_closes_the_connection() {
    let broker = shared_broker();
    let (mut conn, mut rx) = connection(&broker);
    conn.feed(&connect_bytes("sensor-1", 30));
    drain(&mut rx);

    assert_eq!(conn.feed(&connect_bytes("sensor-1", 30)), Flow::Close);
    assert_eq!(drain(&mut rx), vec![Outbound::Close]);
}

#[test]
fn refused_connect_reports_close() {
    let broker = shared_broker();
    let (mut conn, mut rx) = connection(&broker);
    let mut packet = connect("", 30, None);
    packet.clean_session = false;

    assert_eq!(conn.feed(&encode(&Packet::Connect(packet))), Flow::Close);
    assert_eq!(conn.client_id(), None);
    assert_eq!(
        drain(&mut rx),
        vec![
            Outbound::Packet(Packet::Connack(Connack {
                session_present: false,
                code: ConnackCode::IdentifierRejected,
            })),
            Outbound::Close,
        ]
    );
}

#[test]
fn disconnect_suppresses_will() {
    let broker = shared_broker();
    let (_watcher, mut watcher_rx) = subscriber(&broker, "status/#");

    let (mut conn, _rx) = connection(&broker);
    let bytes = encode(&Packet::Connect(connect(
        "sensor-1",
        30,
        Some(will("status/sensor-1")),
    )));
    conn.feed(&bytes);

    assert_eq!(conn.feed(&[0xE0, 0x00]), Flow::Close);
    assert!(conn.is_graceful());
    conn.finish();

    assert!(drain(&mut watcher_rx).is_empty());
    assert!(lock_broker(&broker).session("sensor-1").is_none());
}

#[test]
fn dropped_connection_publishes_will() {
    let broker = shared_broker();
    let (_watcher, mut watcher_rx) = subscriber(&broker, "status/#");

    let (mut conn, _rx) = connection(&broker);
    let bytes = encode(&Packet::Connect(connect(
        "sensor-1",
        30,
        Some(will("status/sensor-1")),
    )));
    conn.feed(&bytes);
    conn.finish();

    let received = drain(&mut watcher_rx);
    assert_eq!(received.len(), 1);
    match &received[0] {
        Outbound::Packet(Packet::Publish(publish)) => {
            assert_eq!(publish.topic, "status/sensor-1");
            assert_eq!(publish.payload, Bytes::from_static(b"gone"));
        }
        other => panic!("expected will publish, got {other:?}"),
    }
}

#[test]
fn idle_timeout_follows_keepalive() {
    let broker = shared_broker();

    // before CONNECT the broker default of 60s applies
    let (mut conn, _rx) = connection(&broker);
    assert_eq!(conn.idle_timeout(), Some(Duration::from_secs(90)));
    conn.feed(&connect_bytes("sensor-1", 10));
    assert_eq!(conn.idle_timeout(), Some(Duration::from_secs(15)));

    let (mut conn, _rx) = connection(&broker);
    conn.feed(&connect_bytes("sensor-2", 0));
    assert_eq!(conn.idle_timeout(), None);
}

fn broker_with(settings: BrokerSettings) -> SharedBroker {
    Arc::new(Mutex::new(Broker::new(
        settings,
        Arc::new(StaticAuthenticator::default()),
    )))
}

#[test]
fn connect_keep_alive_setting_bounds_the_wait_for_connect() {
    let broker = broker_with(BrokerSettings {
        connect_keep_alive: 4,
        ..BrokerSettings::default()
    });
    let (conn, _rx) = connection(&broker);
    assert_eq!(conn.idle_timeout(), Some(Duration::from_secs(6)));

    let broker = broker_with(BrokerSettings {
        connect_keep_alive: 0,
        ..BrokerSettings::default()
    });
    let (conn, _rx) = connection(&broker);
    assert_eq!(conn.idle_timeout(), None);
}

async fn tcp_server() -> (SharedBroker, std::net::SocketAddr) {
    serve_tcp(shared_broker()).await
}

async fn serve_tcp(broker: SharedBroker) -> (SharedBroker, std::net::SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(start_tcp_server(listener, broker.clone()));
    (broker, addr)
}

#[tokio::test]
async fn tcp_connect_and_ping() {
    let (_broker, addr) = tcp_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    stream.write_all(&connect_bytes("tcp-client", 30)).await.unwrap();
    let mut connack = [0u8; 4];
    stream.read_exact(&mut connack).await.unwrap();
    assert_eq!(connack, CONNACK_ACCEPTED);

    stream.write_all(&[0xC0, 0x00]).await.unwrap();
    let mut pingresp = [0u8; 2];
    stream.read_exact(&mut pingresp).await.unwrap();
    assert_eq!(pingresp, [0xD0, 0x00]);
}

#[tokio::test]
async fn tcp_keepalive_expiry_closes_and_fires_will() {
    let (broker, addr) = tcp_server().await;
    let (_watcher, mut watcher_rx) = subscriber(&broker, "status/#");

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let bytes = encode(&Packet::Connect(connect(
        "sleepy",
        1,
        Some(will("status/sleepy")),
    )));
    stream.write_all(&bytes).await.unwrap();
    let mut connack = [0u8; 4];
    stream.read_exact(&mut connack).await.unwrap();

    // 1.5s of silence ends the connection
    let mut rest = Vec::new();
    let read = timeout(Duration::from_secs(5), stream.read_to_end(&mut rest))
        .await
        .expect("server should close the idle connection");
    assert_eq!(read.unwrap(), 0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let received = drain(&mut watcher_rx);
    assert!(matches!(
        received.as_slice(),
        [Outbound::Packet(Packet::Publish(p))] if p.topic == "status/sleepy"
    ));
}

#[tokio::test]
async fn tcp_connection_without_connect_times_out() {
    let (broker, addr) = serve_tcp(broker_with(BrokerSettings {
        connect_keep_alive: 1,
        ..BrokerSettings::default()
    }))
    .await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    // a fixed header announcing a body that never arrives
    stream.write_all(&[0x10, 0xFF, 0x7F]).await.unwrap();

    let mut rest = Vec::new();
    let read = timeout(Duration::from_secs(5), stream.read_to_end(&mut rest))
        .await
        .expect("server should drop a connection that never sends CONNECT");
    assert_eq!(read.unwrap(), 0);
    assert!(rest.is_empty());
    assert!(lock_broker(&broker).sessions().is_empty());
}

#[tokio::test]
async fn tcp_takeover_closes_old_socket() {
    let (_broker, addr) = tcp_server().await;

    let mut first = TcpStream::connect(addr).await.unwrap();
    first.write_all(&connect_bytes("same-id", 30)).await.unwrap();
    let mut connack = [0u8; 4];
    first.read_exact(&mut connack).await.unwrap();

    let mut second = TcpStream::connect(addr).await.unwrap();
    second.write_all(&connect_bytes("same-id", 30)).await.unwrap();
    second.read_exact(&mut connack).await.unwrap();
    assert_eq!(connack, CONNACK_ACCEPTED);

    let mut rest = Vec::new();
    let read = timeout(Duration::from_secs(2), first.read_to_end(&mut rest))
        .await
        .expect("old connection should be closed");
    assert_eq!(read.unwrap(), 0);
}

#[tokio::test]
async fn websocket_negotiates_mqtt_and_carries_packets() {
    let broker = shared_broker();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(start_websocket_server(listener, broker));

    let mut request = format!("ws://{addr}/mqtt").into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("mqtt"));
    let (mut ws, response) = tokio_tungstenite::connect_async(request).await.unwrap();
    assert_eq!(
        response.headers().get("Sec-WebSocket-Protocol").unwrap(),
        "mqtt"
    );

    // a packet split across two frames
    let bytes = connect_bytes("ws-client", 30);
    ws.send(WsMessage::binary(bytes.slice(..3))).await.unwrap();
    ws.send(WsMessage::binary(bytes.slice(3..))).await.unwrap();

    let frame = timeout(Duration::from_secs(2), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(frame, WsMessage::binary(Bytes::from_static(&CONNACK_ACCEPTED)));
}
