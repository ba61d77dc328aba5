use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::broker::SharedBroker;
use crate::client::{Client, Outbound};
use crate::protocol::codec;
use crate::transport::connection::{Connection, Flow};

const READ_BUFFER_SIZE: usize = 4096;

/// Accepts MQTT connections over plain TCP until the listener fails.
pub async fn start_tcp_server(listener: TcpListener, broker: SharedBroker) {
    if let Ok(addr) = listener.local_addr() {
        info!("MQTT listener on tcp://{addr}");
    }

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let broker = broker.clone();
                tokio::spawn(async move {
                    serve(stream, peer, broker).await;
                });
            }
            Err(e) => {
                warn!("accept failed: {e}");
            }
        }
    }
}

async fn serve(stream: TcpStream, peer: SocketAddr, broker: SharedBroker) {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let mut connection = Connection::new(broker, Client::new(tx));
    let connection_id = connection.connection_id().to_string();
    debug!(%peer, connection = %connection_id, "tcp connection accepted");

    // broker -> socket
    let writer_id = connection_id.clone();
    let mut write_task = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            let Outbound::Packet(packet) = outbound else {
                break;
            };
            if let Err(e) = writer.write_all(&codec::encode(&packet)).await {
                debug!(connection = %writer_id, "write failed: {e}");
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut writer_done = false;
    loop {
        let idle = connection.idle_timeout();
        tokio::select! {
            read = read_within(&mut reader, &mut buf, idle) => match read {
                Ok(0) => break,
                Ok(n) => {
                    if connection.feed(&buf[..n]) == Flow::Close {
                        break;
                    }
                }
                Err(e) => {
                    info!(connection = %connection_id, client_id = ?connection.client_id(), "connection lost: {e}");
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
    debug!(%peer, connection = %connection_id, "tcp connection closed");
}

/// Reads once, failing with `TimedOut` if nothing arrives within `idle`.
async fn read_within(
    reader: &mut OwnedReadHalf,
    buf: &mut [u8],
    idle: Option<Duration>,
) -> io::Result<usize> {
    match idle {
        Some(limit) => timeout(limit, reader.read(buf))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "keepalive expired"))?,
        None => reader.read(buf).await,
    }
}
