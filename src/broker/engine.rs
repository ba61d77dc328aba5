//! Broker engine
//!
//! This module contains the in-memory broker responsible for:
//! - accepting or refusing CONNECT and attaching connections to sessions
//! - dispatching decoded packets from a connected client
//! - routing messages through the topic matcher to subscriber sessions
//! - keeping retained messages and firing wills on abnormal disconnects
//! - retransmitting unacknowledged QoS 1/2 messages
//!
//! Concurrency and usage notes:
//! - The public API here is synchronous and designed to be held behind a
//!   lock (`SharedBroker`) by the transport layer. Nothing in here performs
//!   I/O: outgoing packets are pushed onto each connection's unbounded
//!   channel, so a publish fan-out never waits on a slow subscriber and the
//!   lock is never held across an await.
//! - The retry loop runs as a background task and takes the same lock, so a
//!   retransmission can never race a session being resolved or torn down.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::{Authenticator, Credentials, StaticAuthenticator};
use crate::broker::delivery::{DeliveryLimits, RetryPolicy};
use crate::broker::message::Message;
use crate::broker::retained::RetainedStore;
use crate::broker::session::{Session, SessionStore};
use crate::broker::topic;
use crate::client::Client;
use crate::config::{BrokerSettings, Settings};
use crate::persistence::Persistence;
use crate::protocol::{
    Connack, ConnackCode, Connect, Packet, ProtocolVersion, Publish, QoS, Suback, Subscribe,
    Unsubscribe,
};
use crate::utils::{self, BrokerError, Error, PersistenceError};

pub type SharedBroker = Arc<Mutex<Broker>>;

/// Locks the shared broker. A panic in another connection task must not take
/// the whole broker down, so a poisoned lock is recovered.
pub fn lock_broker(broker: &SharedBroker) -> MutexGuard<'_, Broker> {
    broker.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Filters starting with a wildcard never match `$` topics.
fn hides_system_topic(filter: &str, topic_name: &str) -> bool {
    topic_name.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#'))
}

fn subscription_matches(filter: &str, topic_name: &str) -> bool {
    !hides_system_topic(filter, topic_name) && topic::matches(filter, topic_name)
}

/// Why a CONNECT did not attach a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// A refusing CONNACK with this code and a close were queued.
    Refused(ConnackCode),
    /// Protocol violation; the connection is closed without a CONNACK.
    Violation(BrokerError),
}

#[derive(Debug)]
pub struct Broker {
    sessions: SessionStore,
    retained: RetainedStore,
    settings: BrokerSettings,
    authenticator: Arc<dyn Authenticator>,
    persistence: Option<Persistence>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(
            BrokerSettings::default(),
            Arc::new(StaticAuthenticator::default()),
        )
    }
}

impl Broker {
    pub fn new(settings: BrokerSettings, authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            sessions: SessionStore::new(),
            retained: RetainedStore::new(),
            settings,
            authenticator,
            persistence: None,
        }
    }

    /// Builds a broker from the full configuration, opening the retained
    /// message store when persistence is enabled.
    pub fn from_settings(settings: &Settings) -> Result<Self, Error> {
        let authenticator = Arc::new(StaticAuthenticator::new(&settings.auth));
        let broker = Self::new(settings.broker.clone(), authenticator);
        if !settings.persistence.enabled {
            return Ok(broker);
        }
        let persistence = Persistence::open(&settings.persistence.path)?;
        Ok(broker.with_persistence(persistence)?)
    }

    /// Attaches persistence and loads the retained messages it holds.
    pub fn with_persistence(mut self, persistence: Persistence) -> Result<Self, PersistenceError> {
        let messages = persistence.load_retained()?;
        info!(count = messages.len(), "loaded retained messages");
        self.retained.load(messages);
        self.persistence = Some(persistence);
        Ok(self)
    }

    /// Flushes persisted retained messages to disk.
    pub fn flush_persistence(&self) -> Result<(), PersistenceError> {
        match &self.persistence {
            Some(persistence) => persistence.flush(),
            None => Ok(()),
        }
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    pub fn session(&self, client_id: &str) -> Option<&Session> {
        self.sessions.get(client_id)
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn retained(&self) -> &RetainedStore {
        &self.retained
    }

    /// Handles CONNECT for a new connection.
    ///
    /// On success the CONNACK, followed by any resumed in-flight and queued
    /// traffic, is queued on `client` and the effective client id is
    /// returned. On refusal the refusing CONNACK and a close are queued. A
    /// will topic that is not a valid topic name only queues the close.
    pub fn connect(&mut self, connect: Connect, client: Client) -> Result<String, ConnectError> {
        if let Some(will) = connect
            .will
            .as_ref()
            .filter(|will| !topic::is_valid_topic_name(&will.topic))
        {
            warn!(client_id = %connect.client_id, topic = %will.topic, "invalid will topic");
            client.close();
            return Err(ConnectError::Violation(BrokerError::InvalidWillTopic(
                will.topic.clone(),
            )));
        }

        let Some(client_id) = self.assign_client_id(&connect) else {
            warn!(protocol = connect.protocol.name(), "rejecting empty client id");
            return Err(Self::refuse(&client, ConnackCode::IdentifierRejected));
        };

        let decision = self.authenticator.authenticate(&Credentials {
            client_id: &client_id,
            username: connect.username.as_deref(),
            password: connect.password.as_deref(),
        });
        if !decision.is_allowed() {
            warn!(%client_id, ?decision, "refusing connection");
            return Err(Self::refuse(&client, decision.connack_code()));
        }

        let now = utils::now_millis();
        let durable = !connect.clean_session;
        let limits = DeliveryLimits::from(&self.settings);
        let (session, opened) = self.sessions.open(&client_id, durable, client, limits);

        if let Some(old) = opened.evicted {
            info!(%client_id, "client already connected, closing old connection");
            old.close();
        }

        session.will = connect.will;
        session.keep_alive = connect.keep_alive;
        session.send(Packet::Connack(Connack {
            session_present: connect.protocol == ProtocolVersion::V311 && opened.resumed,
            code: ConnackCode::Accepted,
        }));
        if opened.resumed {
            let packets = session.delivery.resume(now);
            if !packets.is_empty() {
                debug!(%client_id, count = packets.len(), "redelivering resumed session state");
            }
            session.send_all(packets);
        }

        info!(
            %client_id,
            durable,
            resumed = opened.resumed,
            keep_alive = connect.keep_alive,
            "client connected"
        );
        Ok(client_id)
    }

    /// Handles a packet received on an established connection.
    ///
    /// An error is a protocol violation; the caller closes the connection
    /// without DISCONNECT semantics.
    pub fn handle_packet(
        &mut self,
        client_id: &str,
        connection_id: &str,
        packet: Packet,
    ) -> Result<(), BrokerError> {
        if !self
            .sessions
            .get(client_id)
            .is_some_and(|session| session.is_attached_to(connection_id))
        {
            return Err(BrokerError::SessionTakenOver(client_id.to_string()));
        }

        let now = utils::now_millis();
        match packet {
            Packet::Connect(_) => Err(BrokerError::DuplicateConnect),
            Packet::Publish(publish) => self.handle_publish(client_id, publish, now),
            Packet::Puback { packet_id } => {
                self.respond(client_id, |session| session.delivery.on_puback(packet_id, now));
                Ok(())
            }
            Packet::Pubrec { packet_id } => {
                self.respond(client_id, |session| session.delivery.on_pubrec(packet_id, now));
                Ok(())
            }
            Packet::Pubrel { packet_id, .. } => {
                self.handle_pubrel(client_id, packet_id);
                Ok(())
            }
            Packet::Pubcomp { packet_id } => {
                self.respond(client_id, |session| session.delivery.on_pubcomp(packet_id, now));
                Ok(())
            }
            Packet::Subscribe(subscribe) => self.handle_subscribe(client_id, subscribe, now),
            Packet::Unsubscribe(unsubscribe) => self.handle_unsubscribe(client_id, unsubscribe),
            Packet::Pingreq => {
                self.respond(client_id, |_| vec![Packet::Pingresp]);
                Ok(())
            }
            Packet::Disconnect => {
                self.disconnect(client_id, connection_id, true);
                Ok(())
            }
            other @ (Packet::Connack(_)
            | Packet::Suback(_)
            | Packet::Unsuback { .. }
            | Packet::Pingresp) => Err(BrokerError::UnexpectedPacket(other.name())),
        }
    }

    /// Detaches `connection_id` from its session.
    ///
    /// Without a preceding DISCONNECT (`graceful == false`) the will is
    /// published. A clean session is removed; a durable one stays offline.
    /// Nothing happens if another connection has taken the session over.
    pub fn disconnect(&mut self, client_id: &str, connection_id: &str, graceful: bool) {
        let Some(session) = self.sessions.get_mut(client_id) else {
            return;
        };
        if !session.is_attached_to(connection_id) {
            debug!(%client_id, "connection no longer owns the session");
            return;
        }

        let will = session.will.take();
        if session.durable {
            session.client = None;
            session.disconnected_at = Some(utils::now_millis());
        } else {
            self.sessions.remove(client_id);
        }
        info!(%client_id, graceful, "client disconnected");

        if graceful {
            return;
        }
        if let Some(will) = will {
            info!(%client_id, topic = %will.topic, "publishing will");
            self.publish(Message::from(will));
        }
    }

    /// Routes an application message.
    ///
    /// The retained store is updated first when the retain flag is set. Each
    /// session with at least one matching subscription then gets a single
    /// copy at min(message QoS, highest granted QoS), with retain cleared.
    pub fn publish(&mut self, message: Message) {
        let now = utils::now_millis();
        if message.retain {
            self.store_retained(&message, now);
        }

        let mut routed = 0usize;
        for session in self.sessions.iter_mut() {
            let granted = session
                .subscriptions
                .iter()
                .filter(|(filter, _)| subscription_matches(filter, &message.topic))
                .map(|(_, qos)| *qos)
                .max();
            let Some(granted) = granted else {
                continue;
            };

            let copy = Message {
                topic: message.topic.clone(),
                payload: message.payload.clone(),
                qos: message.qos.min(granted),
                retain: false,
            };
            let online = session.is_connected();
            let packets = session.delivery.enqueue(copy, online, now);
            session.send_all(packets);
            routed += 1;
        }
        debug!(topic = %message.topic, qos = ?message.qos, sessions = routed, "routed message");
    }

    /// Retransmits unacknowledged messages on connected sessions.
    pub fn retry_pending(&mut self, now: i64) {
        let policy = RetryPolicy::from(&self.settings);
        for session in self.sessions.iter_mut().filter(|s| s.is_connected()) {
            let packets = session.delivery.retry(now, &policy);
            if packets.is_empty() {
                continue;
            }
            debug!(
                client_id = %session.client_id,
                count = packets.len(),
                "retransmitting unacknowledged packets"
            );
            session.send_all(packets);
        }
    }

    /// Removes offline durable sessions past the configured expiry.
    pub fn expire_sessions(&mut self, now: i64) -> Vec<String> {
        let Some(secs) = self.settings.session_expiry_secs else {
            return Vec::new();
        };
        let expiry_ms = i64::try_from(secs.saturating_mul(1000)).unwrap_or(i64::MAX);
        self.sessions.expire(now.saturating_sub(expiry_ms))
    }

    /// Periodic maintenance: retransmissions and session expiry.
    ///
    /// Ticks at the retry interval, but at least once per second so expiry
    /// stays timely.
    pub async fn start_retry_loop(broker: SharedBroker) {
        let period_ms = lock_broker(&broker).settings.retry_interval_ms.clamp(1, 1000);
        let mut ticker = tokio::time::interval(Duration::from_millis(period_ms));

        loop {
            ticker.tick().await;
            let now = utils::now_millis();
            let mut guard = lock_broker(&broker);
            guard.retry_pending(now);
            guard.expire_sessions(now);
        }
    }

    fn assign_client_id(&self, connect: &Connect) -> Option<String> {
        if !connect.client_id.is_empty() {
            return Some(connect.client_id.clone());
        }
        if connect.protocol == ProtocolVersion::V31
            || !connect.clean_session
            || !self.settings.allow_zero_length_clientid
        {
            return None;
        }
        Some(format!("{}{}", self.settings.auto_id_prefix, Uuid::new_v4()))
    }

    fn refuse(client: &Client, code: ConnackCode) -> ConnectError {
        client.send(Packet::Connack(Connack {
            session_present: false,
            code,
        }));
        client.close();
        ConnectError::Refused(code)
    }

    /// Runs `f` on the session and sends the packets it returns.
    fn respond<F>(&mut self, client_id: &str, f: F)
    where
        F: FnOnce(&mut Session) -> Vec<Packet>,
    {
        if let Some(session) = self.sessions.get_mut(client_id) {
            let packets = f(session);
            session.send_all(packets);
        }
    }

    fn handle_publish(
        &mut self,
        client_id: &str,
        publish: Publish,
        now: i64,
    ) -> Result<(), BrokerError> {
        if !topic::is_valid_topic_name(&publish.topic) {
            return Err(BrokerError::InvalidTopicName(publish.topic));
        }
        debug!(
            %client_id,
            topic = %publish.topic,
            qos = ?publish.qos,
            retain = publish.retain,
            dup = publish.dup,
            "PUBLISH received"
        );

        let Some(session) = self.sessions.get_mut(client_id) else {
            return Ok(());
        };
        let routed = match (publish.qos, publish.packet_id) {
            (QoS::AtMostOnce, _) => Some(Message::from(publish)),
            (QoS::AtLeastOnce, Some(packet_id)) => {
                let fresh = session.delivery.receive_qos1(packet_id, publish.dup);
                session.send(Packet::Puback { packet_id });
                if !fresh {
                    debug!(%client_id, packet_id, "duplicate QoS 1 PUBLISH, not routed again");
                }
                fresh.then(|| Message::from(publish))
            }
            (QoS::ExactlyOnce, Some(packet_id)) => {
                if !session
                    .delivery
                    .receive_qos2(packet_id, Message::from(publish), now)
                {
                    debug!(%client_id, packet_id, "QoS 2 packet id already held");
                }
                session.send(Packet::Pubrec { packet_id });
                None
            }
            (qos, None) => return Err(BrokerError::MissingPacketId(qos as u8)),
        };

        if let Some(message) = routed {
            self.publish(message);
        }
        Ok(())
    }

    fn handle_pubrel(&mut self, client_id: &str, packet_id: u16) {
        let Some(session) = self.sessions.get_mut(client_id) else {
            return;
        };
        let released = session.delivery.release(packet_id);
        if released.is_none() {
            debug!(%client_id, packet_id, "PUBREL for packet id not held");
        }
        session.send(Packet::Pubcomp { packet_id });

        if let Some(message) = released {
            self.publish(message);
        }
    }

    fn handle_subscribe(
        &mut self,
        client_id: &str,
        subscribe: Subscribe,
        now: i64,
    ) -> Result<(), BrokerError> {
        if let Some((filter, _)) = subscribe
            .filters
            .iter()
            .find(|(filter, _)| !topic::is_valid_filter(filter))
        {
            return Err(BrokerError::InvalidTopicFilter(filter.clone()));
        }

        let Some(session) = self.sessions.get_mut(client_id) else {
            return Ok(());
        };

        let mut return_codes = Vec::with_capacity(subscribe.filters.len());
        for (filter, qos) in &subscribe.filters {
            session.subscribe(filter, *qos);
            return_codes.push(*qos as u8);
            debug!(%client_id, %filter, ?qos, "subscribed");
        }
        session.send(Packet::Suback(Suback {
            packet_id: subscribe.packet_id,
            return_codes,
        }));

        let online = session.is_connected();
        for (filter, granted) in &subscribe.filters {
            for retained in self
                .retained
                .matching(filter)
                .filter(|m| !hides_system_topic(filter, &m.topic))
            {
                let message = Message {
                    topic: retained.topic.clone(),
                    payload: retained.payload.clone(),
                    qos: retained.qos.min(*granted),
                    retain: true,
                };
                let packets = session.delivery.enqueue(message, online, now);
                session.send_all(packets);
            }
        }
        Ok(())
    }

    fn handle_unsubscribe(
        &mut self,
        client_id: &str,
        unsubscribe: Unsubscribe,
    ) -> Result<(), BrokerError> {
        if let Some(filter) = unsubscribe
            .filters
            .iter()
            .find(|filter| !topic::is_valid_filter(filter))
        {
            return Err(BrokerError::InvalidTopicFilter(filter.clone()));
        }

        let Some(session) = self.sessions.get_mut(client_id) else {
            return Ok(());
        };
        for filter in &unsubscribe.filters {
            if session.unsubscribe(filter) {
                debug!(%client_id, %filter, "unsubscribed");
            }
        }
        session.send(Packet::Unsuback {
            packet_id: unsubscribe.packet_id,
        });
        Ok(())
    }

    fn store_retained(&mut self, message: &Message, now: i64) {
        let stored = self
            .retained
            .set(&message.topic, message.payload.clone(), message.qos, now);

        let Some(persistence) = &self.persistence else {
            return;
        };
        let result = match self.retained.get(&message.topic) {
            Some(retained) if stored => persistence.store_retained(retained),
            _ => persistence.remove_retained(&message.topic),
        };
        if let Err(e) = result {
            error!(topic = %message.topic, "failed to persist retained message: {e}");
        }
    }
}
