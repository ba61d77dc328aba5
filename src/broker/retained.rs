//! Retained message store
//!
//! Keeps the last retained message per exact topic name. Storing an empty
//! payload deletes the entry instead.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::broker::topic;
use crate::protocol::QoS;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetainedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    /// Unix time in milliseconds of the last set.
    pub timestamp: i64,
}

#[derive(Debug, Default)]
pub struct RetainedStore {
    messages: BTreeMap<String, RetainedMessage>,
}

impl RetainedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores or replaces the entry for `topic`; an empty payload removes it.
    ///
    /// Returns `true` when an entry was stored, `false` when the call was a
    /// delete (including deleting a topic that had no entry).
    pub fn set(&mut self, topic: &str, payload: Bytes, qos: QoS, timestamp: i64) -> bool {
        if payload.is_empty() {
            self.messages.remove(topic);
            return false;
        }
        self.messages.insert(
            topic.to_string(),
            RetainedMessage {
                topic: topic.to_string(),
                payload,
                qos,
                timestamp,
            },
        );
        true
    }

    pub fn get(&self, topic: &str) -> Option<&RetainedMessage> {
        self.messages.get(topic)
    }

    /// All entries whose topic is matched by `filter`, in topic order.
    pub fn matching<'a>(&'a self, filter: &'a str) -> impl Iterator<Item = &'a RetainedMessage> + 'a {
        self.messages
            .values()
            .filter(move |message| topic::matches(filter, &message.topic))
    }

    /// Replaces the contents with previously persisted entries.
    pub fn load(&mut self, messages: impl IntoIterator<Item = RetainedMessage>) {
        self.messages = messages
            .into_iter()
            .filter(|m| !m.payload.is_empty())
            .map(|m| (m.topic.clone(), m))
            .collect();
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
