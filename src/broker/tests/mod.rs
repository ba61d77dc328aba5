mod delivery;
mod topic;

use bytes::Bytes;
use tokio::sync::mpsc::{self, UnboundedReceiver};

use crate::client::{Client, Outbound};
use crate::protocol::{Connect, Packet, ProtocolVersion, Publish, QoS};

fn new_client() -> (Client, UnboundedReceiver<Outbound>) {
    let (tx, rx) = mpsc::unbounded_channel::<Outbound>();
    (Client::new(tx), rx)
}

/// Everything queued on a connection so far.
fn drain(rx: &mut UnboundedReceiver<Outbound>) -> Vec<Outbound> {
    let mut out = Vec::new();
    while let Ok(item) = rx.try_recv() {
        out.push(item);
    }
    out
}

/// Packets queued on a connection so far, ignoring close requests.
fn packets(rx: &mut UnboundedReceiver<Outbound>) -> Vec<Packet> {
    drain(rx)
        .into_iter()
        .filter_map(|item| match item {
            Outbound::Packet(packet) => Some(packet),
            Outbound::Close => None,
        })
        .collect()
}

fn connect_packet(client_id: &str, clean_session: bool) -> Connect {
    Connect {
        protocol: ProtocolVersion::V311,
        clean_session,
        keep_alive: 60,
        client_id: client_id.to_string(),
        will: None,
        username: None,
        password: None,
    }
}

fn publish_packet(topic: &str, payload: &'static [u8], qos: QoS, packet_id: Option<u16>) -> Publish {
    Publish {
        dup: false,
        qos,
        retain: false,
        topic: topic.to_string(),
        packet_id,
        payload: Bytes::from_static(payload),
    }
}
