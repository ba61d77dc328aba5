use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::protocol::Packet;

/// Instructions for a connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Encode and write a packet.
    Packet(Packet),
    /// Flush what was queued before, then close the socket.
    Close,
}

/// Handle to one network connection.
///
/// `id` identifies the connection, not the MQTT client: a client id can be
/// served by several connections over its lifetime, and a takeover is
/// detected by comparing connection ids.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: String,
    pub sender: UnboundedSender<Outbound>,
}

impl Client {
    pub fn new(sender: UnboundedSender<Outbound>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender,
        }
    }

    /// Queues a packet for the writer. Returns `false` if the connection is
    /// already gone.
    pub fn send(&self, packet: Packet) -> bool {
        self.sender.send(Outbound::Packet(packet)).is_ok()
    }

    /// Asks the writer to close the connection after draining.
    pub fn close(&self) {
        let _ = self.sender.send(Outbound::Close);
    }
}
