use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async;
use tracing::{debug, info, warn};
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::http::HeaderValue;
use tungstenite::protocol::Message as WsMessage;

use crate::broker::SharedBroker;
use crate::client::{Client, Outbound};
use crate::protocol::codec;
use crate::transport::connection::{Connection, Flow};

/// Subprotocol name MQTT clients offer in the WebSocket handshake.
pub const MQTT_SUBPROTOCOL: &str = "mqtt";

const SUBPROTOCOL_HEADER: &str = "Sec-WebSocket-Protocol";

/// Accepts MQTT-over-WebSocket connections. Each binary frame carries a
/// slice of the MQTT byte stream; frames need not align with packets.
pub async fn start_websocket_server(listener: TcpListener, broker: SharedBroker) {
    if let Ok(addr) = listener.local_addr() {
        info!("MQTT WebSocket listener on ws://{addr}");
    }

    while let Ok((stream, peer)) = listener.accept().await {
        let broker = broker.clone();
        tokio::spawn(async move {
            serve(stream, peer, broker).await;
        });
    }
}

/// Echoes the `mqtt` subprotocol back when the client offers it.
fn negotiate_subprotocol(
    request: &Request,
    mut response: Response,
) -> Result<Response, ErrorResponse> {
    let offered = request
        .headers()
        .get_all(SUBPROTOCOL_HEADER)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|protocol| protocol.trim().eq_ignore_ascii_case(MQTT_SUBPROTOCOL));

    if offered {
        response.headers_mut().insert(
            SUBPROTOCOL_HEADER,
            HeaderValue::from_static(MQTT_SUBPROTOCOL),
        );
    }
    Ok(response)
}

async fn serve(stream: TcpStream, peer: SocketAddr, broker: SharedBroker) {
    let ws_stream = match accept_hdr_async(stream, negotiate_subprotocol).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%peer, "WebSocket handshake error: {e}");
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let mut connection = Connection::new(broker, Client::new(tx));
    let connection_id = connection.connection_id().to_string();
    debug!(%peer, connection = %connection_id, "websocket connection accepted");

    let writer_id = connection_id.clone();
    let mut write_task = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            let Outbound::Packet(packet) = outbound else {
                break;
            };
            if let Err(e) = ws_sender.send(WsMessage::binary(codec::encode(&packet))).await {
                debug!(connection = %writer_id, "failed to send frame: {e}");
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let mut writer_done = false;
    loop {
        let idle = connection.idle_timeout();
        let next = async {
            match idle {
                Some(limit) => timeout(limit, ws_receiver.next()).await.ok(),
                None => Some(ws_receiver.next().await),
            }
        };

        tokio::select! {
            frame = next => match frame {
                None => {
                    info!(connection = %connection_id, client_id = ?connection.client_id(), "keepalive expired");
                    break;
                }
                Some(Some(Ok(WsMessage::Binary(data)))) => {
                    if connection.feed(&data) == Flow::Close {
                        break;
                    }
                }
                Some(Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_)))) => {}
                Some(Some(Ok(WsMessage::Close(_)))) | Some(None) => break,
                Some(Some(Ok(other))) => {
                    warn!(connection = %connection_id, "unexpected {} frame", frame_kind(&other));
                    break;
                }
                Some(Some(Err(e))) => {
                    info!(connection = %connection_id, "connection lost: {e}");
                    break;
                }
            },
            _ = &mut write_task => {
                writer_done = true;
                break;
            }
        }
    }

    connection.finish();
    drop(connection);
    if !writer_done {
        let _ = write_task.await;
    }
    debug!(%peer, connection = %connection_id, "websocket connection closed");
}

fn frame_kind(message: &WsMessage) -> &'static str {
    match message {
        WsMessage::Text(_) => "text",
        WsMessage::Binary(_) => "binary",
        WsMessage::Ping(_) => "ping",
        WsMessage::Pong(_) => "pong",
        WsMessage::Close(_) => "close",
        WsMessage::Frame(_) => "raw",
    }
}
