//! Retained messages backed by `sled`
//!
//! Each retained message is one JSON record in the `retained` tree, keyed by
//! its topic name. Writes go through on every change, so the store survives a
//! restart without an explicit flush on shutdown.

use std::path::Path;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use tracing::warn;

use crate::broker::retained::RetainedMessage;
use crate::protocol::QoS;
use crate::utils::PersistenceError;

const RETAINED_TREE: &str = "retained";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StoredRetained {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub timestamp: i64,
}

impl From<&RetainedMessage> for StoredRetained {
    fn from(message: &RetainedMessage) -> Self {
        Self {
            topic: message.topic.clone(),
            payload: message.payload.to_vec(),
            qos: message.qos as u8,
            timestamp: message.timestamp,
        }
    }
}

impl TryFrom<StoredRetained> for RetainedMessage {
    type Error = crate::utils::ProtocolError;

    fn try_from(stored: StoredRetained) -> Result<Self, Self::Error> {
        Ok(Self {
            topic: stored.topic,
            payload: Bytes::from(stored.payload),
            qos: QoS::try_from(stored.qos)?,
            timestamp: stored.timestamp,
        })
    }
}

#[derive(Clone)]
pub struct Persistence {
    db: Db,
    retained: Tree,
}

impl Persistence {
    /// Open or create a sled database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let db = sled::open(path)?;
        let retained = db.open_tree(RETAINED_TREE)?;
        Ok(Self { db, retained })
    }

    pub fn store_retained(&self, message: &RetainedMessage) -> Result<(), PersistenceError> {
        let record = serde_json::to_vec(&StoredRetained::from(message))?;
        self.retained.insert(message.topic.as_bytes(), record)?;
        Ok(())
    }

    pub fn remove_retained(&self, topic: &str) -> Result<(), PersistenceError> {
        self.retained.remove(topic.as_bytes())?;
        Ok(())
    }

    /// Loads every stored retained message. Records that no longer decode are
    /// skipped with a warning.
    pub fn load_retained(&self) -> Result<Vec<RetainedMessage>, PersistenceError> {
        let mut messages = Vec::new();
        for entry in self.retained.iter() {
            let (key, value) = entry?;
            let stored: StoredRetained = match serde_json::from_slice(&value) {
                Ok(stored) => stored,
                Err(e) => {
                    warn!(key = %String::from_utf8_lossy(&key), "skipping unreadable retained record: {e}");
                    continue;
                }
            };
            match RetainedMessage::try_from(stored) {
                Ok(message) => messages.push(message),
                Err(e) => warn!(key = %String::from_utf8_lossy(&key), "skipping retained record: {e}"),
            }
        }
        Ok(messages)
    }

    pub fn flush(&self) -> Result<(), PersistenceError> {
        self.db.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence")
            .field("db", &"sled::Db")
            .field("retained", &self.retained.len())
            .finish()
    }
}
