//! Delivery engine
//!
//! One `Delivery` per session tracks QoS 1/2 state in both directions:
//!
//! - outbound (broker to client): PUBLISH -> PUBACK for QoS 1, and
//!   PUBLISH -> PUBREC -> PUBREL -> PUBCOMP for QoS 2. Unresolved messages
//!   are retransmitted after the retry interval and on session resume.
//! - inbound (client to broker): QoS 2 ids held between PUBREC and PUBREL so
//!   a retransmitted PUBLISH is routed once, and a short history of
//!   acknowledged QoS 1 ids so a `dup` retransmission is not routed twice.
//!
//! The engine never writes to a socket. Every operation returns the packets
//! the caller should send, in order. Records are keyed by packet id and are
//! only touched through `&mut self`, so the retry path can never act on a
//! record that was already resolved or discarded with its session.

use std::collections::{HashMap, VecDeque};

use tracing::{debug, warn};

use crate::broker::message::Message;
use crate::config::BrokerSettings;
use crate::protocol::{Packet, QoS};

/// How many acknowledged inbound QoS 1 ids are remembered for duplicate
/// detection.
const RECENT_QOS1_IDS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ToClient,
    FromClient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// QoS 1 PUBLISH sent, waiting for PUBACK.
    AwaitingPuback,
    /// QoS 2 PUBLISH sent, waiting for PUBREC.
    AwaitingPubrec,
    /// PUBREL sent, waiting for PUBCOMP.
    AwaitingPubcomp,
    /// QoS 2 PUBLISH received and PUBREC sent, waiting for PUBREL.
    AwaitingPubrel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlightMessage {
    pub packet_id: u16,
    pub message: Message,
    pub direction: Direction,
    pub state: DeliveryState,
    /// Whether the last PUBLISH for this record carried the dup flag.
    pub dup: bool,
    pub last_sent_at: i64,
    pub retries: u32,
}

impl InFlightMessage {
    fn transmission(&self) -> Packet {
        match self.state {
            DeliveryState::AwaitingPubcomp => Packet::Pubrel {
                packet_id: self.packet_id,
                dup: false,
            },
            _ => Packet::Publish(self.message.to_publish(Some(self.packet_id), self.dup)),
        }
    }

    /// Any PUBLISH after the first is a duplicate. PUBREL keeps its fixed
    /// header flags.
    fn retransmission(&mut self, now: i64) -> Packet {
        if self.state != DeliveryState::AwaitingPubcomp {
            self.dup = true;
        }
        self.last_sent_at = now;
        self.transmission()
    }
}

/// Per-session flow control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryLimits {
    /// Unacknowledged outbound QoS 1/2 messages; 0 is unlimited.
    pub max_inflight: usize,
    /// Messages waiting for an in-flight slot or for the client to return;
    /// 0 is unlimited.
    pub max_queued: usize,
    /// Queue QoS 0 messages for offline sessions instead of dropping them.
    pub queue_qos0: bool,
}

impl Default for DeliveryLimits {
    fn default() -> Self {
        Self::from(&BrokerSettings::default())
    }
}

impl From<&BrokerSettings> for DeliveryLimits {
    fn from(settings: &BrokerSettings) -> Self {
        Self {
            max_inflight: settings.max_inflight_messages,
            max_queued: settings.max_queued_messages,
            queue_qos0: settings.queue_qos0_messages,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval_ms: i64,
    /// `None` retries until the message is acknowledged or the session ends.
    pub max_retries: Option<u32>,
}

impl From<&BrokerSettings> for RetryPolicy {
    fn from(settings: &BrokerSettings) -> Self {
        Self {
            interval_ms: i64::try_from(settings.retry_interval_ms).unwrap_or(i64::MAX),
            max_retries: settings.max_retries,
        }
    }
}

#[derive(Debug)]
pub struct Delivery {
    limits: DeliveryLimits,
    outbound: VecDeque<InFlightMessage>,
    queued: VecDeque<Message>,
    inbound: HashMap<u16, InFlightMessage>,
    recent_qos1: VecDeque<u16>,
    next_packet_id: u16,
}

impl Default for Delivery {
    fn default() -> Self {
        Self::new(DeliveryLimits::default())
    }
}

impl Delivery {
    pub fn new(limits: DeliveryLimits) -> Self {
        Self {
            limits,
            outbound: VecDeque::new(),
            queued: VecDeque::new(),
            inbound: HashMap::new(),
            recent_qos1: VecDeque::new(),
            next_packet_id: 0,
        }
    }

    /// Starts delivery of `message` to this session.
    ///
    /// Online, the message is sent at once if an in-flight slot is free and
    /// nothing is queued ahead of it. Otherwise it is queued, subject to the
    /// queue limit; offline QoS 0 messages are dropped unless configured.
    pub fn enqueue(&mut self, message: Message, online: bool, now: i64) -> Vec<Packet> {
        if !online {
            if message.qos == QoS::AtMostOnce && !self.limits.queue_qos0 {
                debug!(topic = %message.topic, "dropping QoS 0 message for offline session");
                return Vec::new();
            }
            self.push_queued(message);
            return Vec::new();
        }

        if message.qos == QoS::AtMostOnce {
            return vec![Packet::Publish(message.to_publish(None, false))];
        }

        if self.queued.is_empty() && self.has_capacity() {
            vec![self.start(message, now)]
        } else {
            self.push_queued(message);
            Vec::new()
        }
    }

    /// PUBACK from the client resolves a QoS 1 message.
    pub fn on_puback(&mut self, packet_id: u16, now: i64) -> Vec<Packet> {
        if !self.resolve(packet_id, DeliveryState::AwaitingPuback) {
            debug!(packet_id, "PUBACK for unknown packet id");
            return Vec::new();
        }
        self.fill(now)
    }

    /// PUBREC moves a QoS 2 message to the release phase. A repeated PUBREC
    /// gets the PUBREL again.
    pub fn on_pubrec(&mut self, packet_id: u16, now: i64) -> Vec<Packet> {
        let Some(inflight) = self.outbound.iter_mut().find(|m| m.packet_id == packet_id) else {
            debug!(packet_id, "PUBREC for unknown packet id");
            return Vec::new();
        };
        match inflight.state {
            DeliveryState::AwaitingPubrec | DeliveryState::AwaitingPubcomp => {
                inflight.state = DeliveryState::AwaitingPubcomp;
                inflight.last_sent_at = now;
                inflight.retries = 0;
                vec![inflight.transmission()]
            }
            _ => {
                debug!(packet_id, "PUBREC for a QoS 1 message");
                Vec::new()
            }
        }
    }

    /// PUBCOMP from the client resolves a QoS 2 message.
    pub fn on_pubcomp(&mut self, packet_id: u16, now: i64) -> Vec<Packet> {
        if !self.resolve(packet_id, DeliveryState::AwaitingPubcomp) {
            debug!(packet_id, "PUBCOMP for unknown packet id");
            return Vec::new();
        }
        self.fill(now)
    }

    /// Records an inbound QoS 1 PUBLISH and returns whether it should be
    /// routed.
    ///
    /// A `dup` retransmission of a recently acknowledged id returns `false`.
    /// A PUBLISH without `dup` is always a new message, even when its id was
    /// seen before.
    pub fn receive_qos1(&mut self, packet_id: u16, dup: bool) -> bool {
        let seen = self.recent_qos1.contains(&packet_id);
        if dup && seen {
            return false;
        }
        if seen {
            self.recent_qos1.retain(|id| *id != packet_id);
        }
        if self.recent_qos1.len() >= RECENT_QOS1_IDS {
            self.recent_qos1.pop_front();
        }
        self.recent_qos1.push_back(packet_id);
        true
    }

    /// Holds an inbound QoS 2 PUBLISH until PUBREL.
    ///
    /// Returns `false` when the id is already held; the message is then not
    /// stored again and the caller only repeats the PUBREC.
    pub fn receive_qos2(&mut self, packet_id: u16, message: Message, now: i64) -> bool {
        if self.inbound.contains_key(&packet_id) {
            return false;
        }
        self.inbound.insert(
            packet_id,
            InFlightMessage {
                packet_id,
                message,
                direction: Direction::FromClient,
                state: DeliveryState::AwaitingPubrel,
                dup: false,
                last_sent_at: now,
                retries: 0,
            },
        );
        true
    }

    /// Releases a held QoS 2 message on PUBREL. `None` for ids not held,
    /// which still get their PUBCOMP.
    pub fn release(&mut self, packet_id: u16) -> Option<Message> {
        self.inbound.remove(&packet_id).map(|inflight| inflight.message)
    }

    /// Packets to send right after a durable session reconnects: every
    /// unresolved outbound message in original order (PUBLISH with dup, or
    /// PUBREL), then as many queued messages as the in-flight limit allows.
    pub fn resume(&mut self, now: i64) -> Vec<Packet> {
        let mut packets: Vec<Packet> = self
            .outbound
            .iter_mut()
            .map(|inflight| inflight.retransmission(now))
            .collect();
        packets.extend(self.fill(now));
        packets
    }

    /// Retransmits outbound messages not acknowledged within the retry
    /// interval. Messages that reached the retry cap are dropped, freeing
    /// their slot for queued messages.
    pub fn retry(&mut self, now: i64, policy: &RetryPolicy) -> Vec<Packet> {
        let mut packets = Vec::new();
        let mut dropped = false;

        self.outbound.retain_mut(|inflight| {
            if now - inflight.last_sent_at < policy.interval_ms {
                return true;
            }
            if policy.max_retries.is_some_and(|max| inflight.retries >= max) {
                warn!(
                    packet_id = inflight.packet_id,
                    topic = %inflight.message.topic,
                    retries = inflight.retries,
                    "dropping message after retry limit"
                );
                dropped = true;
                return false;
            }
            inflight.retries += 1;
            packets.push(inflight.retransmission(now));
            true
        });

        if dropped {
            packets.extend(self.fill(now));
        }
        packets
    }

    pub fn inflight(&self) -> impl Iterator<Item = &InFlightMessage> {
        self.outbound.iter()
    }

    pub fn inflight_len(&self) -> usize {
        self.outbound.len()
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    pub fn is_held(&self, packet_id: u16) -> bool {
        self.inbound.contains_key(&packet_id)
    }

    fn push_queued(&mut self, message: Message) {
        if self.limits.max_queued > 0 && self.queued.len() >= self.limits.max_queued {
            warn!(topic = %message.topic, "outgoing queue full, dropping message");
            return;
        }
        self.queued.push_back(message);
    }

    fn has_capacity(&self) -> bool {
        // Leave room in the id space so allocation always terminates.
        self.outbound.len() < usize::from(u16::MAX - 1)
            && (self.limits.max_inflight == 0 || self.outbound.len() < self.limits.max_inflight)
    }

    /// Sends queued messages while in-flight slots are free.
    fn fill(&mut self, now: i64) -> Vec<Packet> {
        let mut packets = Vec::new();
        while self.has_capacity() {
            let Some(message) = self.queued.pop_front() else {
                break;
            };
            if message.qos == QoS::AtMostOnce {
                packets.push(Packet::Publish(message.to_publish(None, false)));
            } else {
                packets.push(self.start(message, now));
            }
        }
        packets
    }

    fn start(&mut self, message: Message, now: i64) -> Packet {
        let packet_id = self.allocate_packet_id();
        let state = if message.qos == QoS::ExactlyOnce {
            DeliveryState::AwaitingPubrec
        } else {
            DeliveryState::AwaitingPuback
        };
        let inflight = InFlightMessage {
            packet_id,
            message,
            direction: Direction::ToClient,
            state,
            dup: false,
            last_sent_at: now,
            retries: 0,
        };
        let packet = inflight.transmission();
        self.outbound.push_back(inflight);
        packet
    }

    fn resolve(&mut self, packet_id: u16, state: DeliveryState) -> bool {
        match self
            .outbound
            .iter()
            .position(|m| m.packet_id == packet_id && m.state == state)
        {
            Some(index) => {
                self.outbound.remove(index);
                true
            }
            None => false,
        }
    }

    /// Next non-zero id not used by an unresolved outbound message.
    fn allocate_packet_id(&mut self) -> u16 {
        loop {
            self.next_packet_id = self.next_packet_id.wrapping_add(1);
            if self.next_packet_id == 0 {
                continue;
            }
            let candidate = self.next_packet_id;
            if !self.outbound.iter().any(|m| m.packet_id == candidate) {
                return candidate;
            }
        }
    }
}
