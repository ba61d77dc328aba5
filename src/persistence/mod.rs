//! The `persistence` module keeps retained messages across restarts.
//!
//! It uses `sled` as an embedded key-value store. Sessions and in-flight
//! state are memory only.

pub mod sled_store;

pub use sled_store::{Persistence, StoredRetained};
