//! Session store
//!
//! One `Session` per client id. A clean session lives exactly as long as its
//! connection. A durable session outlives it: subscriptions, in-flight state
//! and queued messages stay here until the client reconnects or the session
//! expires.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};

use tracing::info;

use crate::broker::delivery::{Delivery, DeliveryLimits};
use crate::client::Client;
use crate::protocol::{LastWill, Packet, QoS};

#[derive(Debug)]
pub struct Session {
    pub client_id: String,
    /// CONNECT clean-session bit was 0.
    pub durable: bool,
    /// filter -> granted QoS
    pub subscriptions: BTreeMap<String, QoS>,
    pub will: Option<LastWill>,
    pub keep_alive: u16,
    /// Attached connection, `None` while a durable session is offline.
    pub client: Option<Client>,
    pub delivery: Delivery,
    /// Unix millis of the last disconnect of a durable session.
    pub disconnected_at: Option<i64>,
}

impl Session {
    pub fn new(client_id: impl Into<String>, durable: bool, limits: DeliveryLimits) -> Self {
        Self {
            client_id: client_id.into(),
            durable,
            subscriptions: BTreeMap::new(),
            will: None,
            keep_alive: 0,
            client: None,
            delivery: Delivery::new(limits),
            disconnected_at: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    /// Whether `connection_id` is the connection currently serving this
    /// session.
    pub fn is_attached_to(&self, connection_id: &str) -> bool {
        self.client
            .as_ref()
            .is_some_and(|client| client.id == connection_id)
    }

    /// Adds or replaces a subscription; returns the previously granted QoS.
    pub fn subscribe(&mut self, filter: &str, qos: QoS) -> Option<QoS> {
        self.subscriptions.insert(filter.to_string(), qos)
    }

    pub fn unsubscribe(&mut self, filter: &str) -> bool {
        self.subscriptions.remove(filter).is_some()
    }

    /// Queues packets on the attached connection, if any.
    pub fn send_all(&self, packets: impl IntoIterator<Item = Packet>) {
        if let Some(client) = &self.client {
            for packet in packets {
                if !client.send(packet) {
                    break;
                }
            }
        }
    }

    pub fn send(&self, packet: Packet) {
        self.send_all([packet]);
    }
}

/// Result of attaching a connection to a client id.
#[derive(Debug)]
pub struct Opened {
    /// An existing durable session was resumed.
    pub resumed: bool,
    /// Connection that served this client id before, now evicted.
    pub evicted: Option<Client>,
}

#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: HashMap<String, Session>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, client_id: &str) -> Option<&Session> {
        self.sessions.get(client_id)
    }

    pub fn get_mut(&mut self, client_id: &str) -> Option<&mut Session> {
        self.sessions.get_mut(client_id)
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.sessions.contains_key(client_id)
    }

    /// Creates or resumes the session for `client_id` and attaches `client`.
    ///
    /// The state of an existing session is kept only if both it and the new
    /// connection are durable; otherwise it is replaced by a fresh session.
    /// Any connection previously attached is detached and returned.
    pub fn open(
        &mut self,
        client_id: &str,
        durable: bool,
        client: Client,
        limits: DeliveryLimits,
    ) -> (&mut Session, Opened) {
        let mut opened = Opened {
            resumed: false,
            evicted: None,
        };

        let session = match self.sessions.entry(client_id.to_string()) {
            Entry::Occupied(entry) => {
                let existing = entry.into_mut();
                opened.evicted = existing.client.take();
                if existing.durable && durable {
                    opened.resumed = true;
                    existing.disconnected_at = None;
                } else {
                    *existing = Session::new(client_id, durable, limits);
                }
                existing
            }
            Entry::Vacant(entry) => entry.insert(Session::new(client_id, durable, limits)),
        };
        session.client = Some(client);

        (session, opened)
    }

    pub fn remove(&mut self, client_id: &str) -> Option<Session> {
        self.sessions.remove(client_id)
    }

    /// Removes offline durable sessions disconnected at or before `cutoff`.
    /// Returns the removed client ids.
    pub fn expire(&mut self, cutoff: i64) -> Vec<String> {
        let expired: Vec<String> = self
            .sessions
            .values()
            .filter(|s| !s.is_connected() && s.disconnected_at.is_some_and(|at| at <= cutoff))
            .map(|s| s.client_id.clone())
            .collect();

        for client_id in &expired {
            self.sessions.remove(client_id);
            info!(%client_id, "expired durable session");
        }
        expired
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.sessions.values_mut()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
