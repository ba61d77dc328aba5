//! Error types used within `mqbroker`.
//!
//! Codec failures are `ProtocolError`, violations the broker detects on a
//! well-formed packet are `BrokerError`, and storage failures are
//! `PersistenceError`. `Error` aggregates all of them for the binary and
//! the transport layer.

use std::io;

use thiserror::Error;

/// Main error type for mqbroker.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

/// Failures while decoding MQTT control packets.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid packet type: {0}")]
    InvalidPacketType(u8),

    #[error("Invalid remaining length encoding")]
    InvalidRemainingLength,

    #[error("Invalid fixed header flags {flags:#04x} for packet type {packet_type}")]
    InvalidFlags { packet_type: u8, flags: u8 },

    #[error("Invalid protocol name: {0:?}")]
    InvalidProtocolName(String),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedProtocolVersion(u8),

    #[error("Invalid QoS: {0}")]
    InvalidQos(u8),

    #[error("Invalid UTF-8 string")]
    InvalidUtf8,

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),
}

/// Protocol violations detected by the broker on a decoded packet.
///
/// Every variant ends the connection as an abnormal disconnect.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("first packet must be CONNECT")]
    NotConnected,

    #[error("duplicate CONNECT on an established connection")]
    DuplicateConnect,

    #[error("invalid topic name for PUBLISH: {0:?}")]
    InvalidTopicName(String),

    #[error("invalid will topic in CONNECT: {0:?}")]
    InvalidWillTopic(String),

    #[error("invalid topic filter: {0:?}")]
    InvalidTopicFilter(String),

    #[error("QoS {0} PUBLISH without a packet identifier")]
    MissingPacketId(u8),

    #[error("unexpected {0} packet from client")]
    UnexpectedPacket(&'static str),

    #[error("session for client {0} is no longer attached to this connection")]
    SessionTakenOver(String),
}

/// Failures in the retained-message store backend.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
