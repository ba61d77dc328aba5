//! The `transport` module carries the MQTT byte stream between sockets and
//! the broker.
//!
//! Both listeners share the same per-connection driver, [`Connection`]:
//!
//! - `tcp`: plain MQTT over TCP (port 1883 by default).
//! - `websocket`: MQTT over WebSocket binary frames, negotiating the `mqtt`
//!   subprotocol.
//!
//! Every connection gets a writer task fed by an unbounded channel; the
//! broker only ever pushes [`crate::client::Outbound`] items onto it.

pub mod connection;
pub mod tcp;
pub mod websocket;

pub use connection::{Connection, Flow};
pub use tcp::start_tcp_server;
pub use websocket::start_websocket_server;

#[cfg(test)]
mod tests;
