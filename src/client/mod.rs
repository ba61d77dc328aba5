//! Per-connection handle.
//!
//! The broker never touches sockets. It talks to a connection through the
//! `Client` handle, whose unbounded channel is drained by the connection's
//! writer task.

pub mod client;
pub use client::{Client, Outbound};
