//! The `protocol` module is the frame codec: MQTT control packet types and
//! their byte-exact encoding and decoding.

pub mod codec;
pub mod packet;

pub use codec::{decode, encode, encode_into};
pub use packet::{
    Connack, ConnackCode, Connect, LastWill, Packet, PacketType, ProtocolVersion, Publish, QoS,
    Suback, Subscribe, Unsubscribe,
};
