//! Per-connection protocol driver shared by the TCP and WebSocket listeners.
//!
//! The listener feeds raw bytes in as they arrive; `Connection` reassembles
//! packets, enforces the CONNECT-first rule and hands everything else to the
//! broker. It decides when the connection must close but never touches the
//! socket itself.

use std::time::Duration;

use bytes::{Buf, BytesMut};
use tracing::{debug, info, warn};

use crate::broker::{SharedBroker, lock_broker};
use crate::client::Client;
use crate::protocol::{Connack, ConnackCode, Packet, codec};
use crate::utils::{BrokerError, ProtocolError};

/// What the listener should do after feeding bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

#[derive(Debug)]
pub struct Connection {
    broker: SharedBroker,
    client: Client,
    client_id: Option<String>,
    keep_alive: u16,
    buffer: BytesMut,
    graceful: bool,
}

impl Connection {
    /// Until CONNECT is accepted the idle limit comes from
    /// `connect_keep_alive` in the broker settings.
    pub fn new(broker: SharedBroker, client: Client) -> Self {
        let keep_alive = lock_broker(&broker).settings().connect_keep_alive;
        Self {
            broker,
            client,
            client_id: None,
            keep_alive,
            buffer: BytesMut::with_capacity(1024),
            graceful: false,
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.client.id
    }

    /// Client id accepted by CONNECT, if any.
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    /// Whether the connection ended with a DISCONNECT packet.
    pub fn is_graceful(&self) -> bool {
        self.graceful
    }

    /// How long the connection may stay silent: one and a half times the
    /// keepalive. `None` when keepalive is off.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.keep_alive > 0).then(|| Duration::from_millis(u64::from(self.keep_alive) * 1500))
    }

    /// Consumes received bytes and dispatches every complete packet.
    pub fn feed(&mut self, data: &[u8]) -> Flow {
        self.buffer.extend_from_slice(data);

        loop {
            match codec::decode(&self.buffer) {
                Ok(None) => return Flow::Continue,
                Ok(Some((packet, consumed))) => {
                    self.buffer.advance(consumed);
                    if self.dispatch(packet) == Flow::Close {
                        return Flow::Close;
                    }
                }
                Err(ProtocolError::UnsupportedProtocolVersion(level))
                    if self.client_id.is_none() =>
                {
                    warn!(connection = %self.client.id, level, "unsupported protocol version");
                    self.client.send(Packet::Connack(Connack {
                        session_present: false,
                        code: ConnackCode::UnacceptableProtocolVersion,
                    }));
                    return self.close();
                }
                Err(e) => {
                    warn!(connection = %self.client.id, client_id = ?self.client_id, "protocol error: {e}");
                    return self.close();
                }
            }
        }
    }

    /// Runs the disconnect path for this connection. Unless DISCONNECT was
    /// received, the session's will is published.
    pub fn finish(&mut self) {
        if let Some(client_id) = self.client_id.take() {
            lock_broker(&self.broker).disconnect(&client_id, &self.client.id, self.graceful);
        }
    }

    fn dispatch(&mut self, packet: Packet) -> Flow {
        let Some(client_id) = self.client_id.clone() else {
            return self.dispatch_first(packet);
        };

        let disconnecting = matches!(packet, Packet::Disconnect);
        let result = lock_broker(&self.broker).handle_packet(&client_id, &self.client.id, packet);
        match result {
            Ok(()) if disconnecting => {
                self.graceful = true;
                self.close()
            }
            Ok(()) => Flow::Continue,
            Err(e) => {
                warn!(%client_id, "closing connection: {e}");
                self.close()
            }
        }
    }

    fn dispatch_first(&mut self, packet: Packet) -> Flow {
        let Packet::Connect(connect) = packet else {
            warn!(connection = %self.client.id, packet = packet.name(), "{}", BrokerError::NotConnected);
            return self.close();
        };

        let keep_alive = connect.keep_alive;
        let result = lock_broker(&self.broker).connect(connect, self.client.clone());
        match result {
            Ok(client_id) => {
                debug!(connection = %self.client.id, %client_id, "connection attached");
                self.client_id = Some(client_id);
                self.keep_alive = keep_alive;
                Flow::Continue
            }
            // the broker already queued the close, after any refusing CONNACK
            Err(e) => {
                info!(connection = %self.client.id, reason = ?e, "connection refused");
                Flow::Close
            }
        }
    }

    fn close(&self) -> Flow {
        self.client.close();
        Flow::Close
    }
}
