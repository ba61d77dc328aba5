//! # mqbroker
//!
//! `mqbroker` is an MQTT 3.1 / 3.1.1 broker. Clients connect over plain TCP
//! or over WebSocket binary frames; the broker routes PUBLISH packets to
//! matching subscriptions with QoS 0, 1 and 2 delivery, keeps durable
//! sessions across reconnects and replays retained messages to new
//! subscribers.
//!
//! ## Core Modules
//!
//! - `protocol`: MQTT control packets and their wire codec.
//! - `broker`: topic matching, sessions, the QoS delivery engine, the
//!   retained store and the broker core that ties them together.
//! - `client`: the handle the broker uses to queue packets on a connection.
//! - `auth`: CONNECT credential checks.
//! - `config`: layered configuration (file, environment, defaults).
//! - `persistence`: optional on-disk storage for retained messages.
//! - `transport`: the TCP and WebSocket listeners.
//! - `utils`: error types, logging setup and the clock.

pub mod auth;
pub mod broker;
pub mod client;
pub mod config;
pub mod persistence;
pub mod protocol;
pub mod transport;
pub mod utils;
