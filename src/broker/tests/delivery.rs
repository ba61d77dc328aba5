use bytes::Bytes;

use crate::broker::delivery::{Delivery, DeliveryLimits, DeliveryState, Direction, RetryPolicy};
use crate::broker::message::Message;
use crate::protocol::{Packet, Publish, QoS};

fn message(topic: &str, qos: QoS) -> Message {
    Message::new(topic, Bytes::from_static(b"payload"), qos, false)
}

fn limits(max_inflight: usize, max_queued: usize, queue_qos0: bool) -> DeliveryLimits {
    DeliveryLimits {
        max_inflight,
        max_queued,
        queue_qos0,
    }
}

fn unbounded() -> RetryPolicy {
    RetryPolicy {
        interval_ms: 1000,
        max_retries: None,
    }
}

fn publish(packet: &Packet) -> &Publish {
    match packet {
        Packet::Publish(publish) => publish,
        other => panic!("expected PUBLISH, got {other:?}"),
    }
}

#[test]
fn test_qos0_online_is_sent_without_tracking() {
    let mut delivery = Delivery::default();
    let out = delivery.enqueue(message("a", QoS::AtMostOnce), true, 0);

    assert_eq!(out.len(), 1);
    assert_eq!(publish(&out[0]).packet_id, None);
    assert_eq!(delivery.inflight_len(), 0);
}

#[test]
fn test_first_packet_id_is_one_and_increments() {
    let mut delivery = Delivery::default();
    let first = delivery.enqueue(message("a", QoS::AtLeastOnce), true, 0);
    let second = delivery.enqueue(message("a", QoS::ExactlyOnce), true, 0);

    assert_eq!(publish(&first[0]).packet_id, Some(1));
    assert!(!publish(&first[0]).dup);
    assert_eq!(publish(&second[0]).packet_id, Some(2));
}

#[test]
fn test_qos1_outbound_resolved_by_puback() {
    let mut delivery = Delivery::default();
    delivery.enqueue(message("a", QoS::AtLeastOnce), true, 0);

    let inflight = delivery.inflight().next().unwrap();
    assert_eq!(inflight.state, DeliveryState::AwaitingPuback);
    assert_eq!(inflight.direction, Direction::ToClient);

    assert!(delivery.on_puback(1, 10).is_empty());
    assert_eq!(delivery.inflight_len(), 0);
}

#[test]
fn test_unknown_acks_are_noops() {
    let mut delivery = Delivery::default();
    delivery.enqueue(message("a", QoS::AtLeastOnce), true, 0);

    assert!(delivery.on_puback(99, 0).is_empty());
    assert!(delivery.on_pubrec(99, 0).is_empty());
    assert!(delivery.on_pubcomp(99, 0).is_empty());
    // PUBCOMP does not resolve a QoS 1 message
    assert!(delivery.on_pubcomp(1, 0).is_empty());
    assert_eq!(delivery.inflight_len(), 1);
}

#[test]
fn test_qos2_outbound_flow() {
    let mut delivery = Delivery::default();
    delivery.enqueue(message("a", QoS::ExactlyOnce), true, 0);

    let out = delivery.on_pubrec(1, 5);
    assert_eq!(out, vec![Packet::Pubrel { packet_id: 1, dup: false }]);
    assert_eq!(
        delivery.inflight().next().unwrap().state,
        DeliveryState::AwaitingPubcomp
    );

    // a repeated PUBREC gets the PUBREL again
    assert_eq!(delivery.on_pubrec(1, 6).len(), 1);

    assert!(delivery.on_pubcomp(1, 7).is_empty());
    assert_eq!(delivery.inflight_len(), 0);
}

#[test]
fn test_retry_resends_with_dup_after_interval() {
    let mut delivery = Delivery::default();
    delivery.enqueue(message("a", QoS::AtLeastOnce), true, 0);

    assert!(delivery.retry(999, &unbounded()).is_empty());

    let out = delivery.retry(1000, &unbounded());
    assert_eq!(out.len(), 1);
    let resent = publish(&out[0]);
    assert!(resent.dup);
    assert_eq!(resent.packet_id, Some(1));

    // the timer restarts from the resend
    assert!(delivery.retry(1500, &unbounded()).is_empty());
    assert_eq!(delivery.retry(2000, &unbounded()).len(), 1);
}

#[test]
fn test_retry_resends_pubrel_without_dup() {
    let mut delivery = Delivery::default();
    delivery.enqueue(message("a", QoS::ExactlyOnce), true, 0);
    delivery.on_pubrec(1, 0);

    let out = delivery.retry(1000, &unbounded());
    assert_eq!(out, vec![Packet::Pubrel { packet_id: 1, dup: false }]);
}

#[test]
fn test_retry_cap_drops_message_and_fills_slot() {
    let mut delivery = Delivery::new(limits(1, 10, false));
    let policy = RetryPolicy {
        interval_ms: 100,
        max_retries: Some(1),
    };
    delivery.enqueue(message("first", QoS::AtLeastOnce), true, 0);
    delivery.enqueue(message("second", QoS::AtLeastOnce), true, 0);
    assert_eq!(delivery.queued_len(), 1);

    assert_eq!(delivery.retry(100, &policy).len(), 1);

    let out = delivery.retry(200, &policy);
    assert_eq!(out.len(), 1);
    let next = publish(&out[0]);
    assert_eq!(next.topic, "second");
    assert!(!next.dup);
    assert_eq!(delivery.inflight_len(), 1);
    assert_eq!(delivery.queued_len(), 0);
}

#[test]
fn test_inflight_limit_queues_and_releases_in_order() {
    let mut delivery = Delivery::new(limits(2, 10, false));
    for topic in ["m1", "m2", "m3", "m4"] {
        delivery.enqueue(message(topic, QoS::AtLeastOnce), true, 0);
    }
    assert_eq!(delivery.inflight_len(), 2);
    assert_eq!(delivery.queued_len(), 2);

    let out = delivery.on_puback(1, 1);
    assert_eq!(out.len(), 1);
    assert_eq!(publish(&out[0]).topic, "m3");
    assert_eq!(publish(&out[0]).packet_id, Some(3));
}

#[test]
fn test_queue_limit_drops_new_messages() {
    let mut delivery = Delivery::new(limits(20, 2, false));
    for topic in ["m1", "m2", "m3"] {
        delivery.enqueue(message(topic, QoS::AtLeastOnce), false, 0);
    }
    assert_eq!(delivery.queued_len(), 2);
}

#[test]
fn test_offline_qos0_dropped_unless_configured() {
    let mut dropping = Delivery::new(limits(20, 100, false));
    dropping.enqueue(message("a", QoS::AtMostOnce), false, 0);
    assert_eq!(dropping.queued_len(), 0);

    let mut queueing = Delivery::new(limits(20, 100, true));
    queueing.enqueue(message("a", QoS::AtMostOnce), false, 0);
    assert_eq!(queueing.queued_len(), 1);

    let out = queueing.resume(5);
    assert_eq!(out.len(), 1);
    assert_eq!(publish(&out[0]).packet_id, None);
}

#[test]
fn test_resume_redelivers_inflight_then_queue() {
    let mut delivery = Delivery::default();
    delivery.enqueue(message("qos1", QoS::AtLeastOnce), true, 0);
    delivery.enqueue(message("qos2", QoS::ExactlyOnce), true, 0);
    delivery.enqueue(message("released", QoS::ExactlyOnce), true, 0);
    delivery.on_pubrec(3, 0);
    // session goes offline, a message is queued
    delivery.enqueue(message("queued", QoS::AtLeastOnce), false, 0);

    let out = delivery.resume(100);
    assert_eq!(out.len(), 4);

    let first = publish(&out[0]);
    assert_eq!((first.topic.as_str(), first.packet_id, first.dup), ("qos1", Some(1), true));
    let second = publish(&out[1]);
    assert_eq!((second.topic.as_str(), second.packet_id, second.dup), ("qos2", Some(2), true));
    assert_eq!(out[2], Packet::Pubrel { packet_id: 3, dup: false });
    let queued = publish(&out[3]);
    assert_eq!((queued.topic.as_str(), queued.packet_id, queued.dup), ("queued", Some(4), false));
}

#[test]
fn test_packet_ids_skip_ids_in_use() {
    let mut delivery = Delivery::new(limits(0, 0, false));
    for _ in 0..u16::MAX {
        delivery.enqueue(message("a", QoS::AtLeastOnce), true, 0);
        // resolve everything except id 1
        let last = delivery.inflight().last().unwrap().packet_id;
        if last != 1 {
            delivery.on_puback(last, 0);
        }
    }
    // the counter wrapped past 65535 and skipped both 0 and the held id 1
    let out = delivery.enqueue(message("a", QoS::AtLeastOnce), true, 0);
    assert_eq!(publish(&out[0]).packet_id, Some(2));
}

#[test]
fn test_inbound_qos1_duplicate_detection() {
    let mut delivery = Delivery::default();
    assert!(delivery.receive_qos1(7, false));
    // retransmission of an acknowledged id
    assert!(!delivery.receive_qos1(7, true));
    // id reuse without dup is a new message
    assert!(delivery.receive_qos1(7, false));
    // a dup for an id never seen is routed
    assert!(delivery.receive_qos1(8, true));
}

#[test]
fn test_inbound_qos2_held_until_release() {
    let mut delivery = Delivery::default();
    assert!(delivery.receive_qos2(9, message("a", QoS::ExactlyOnce), 0));
    assert!(delivery.is_held(9));
    // retransmitted PUBLISH before PUBREL is not stored again
    assert!(!delivery.receive_qos2(9, message("a", QoS::ExactlyOnce), 1));

    let released = delivery.release(9).unwrap();
    assert_eq!(released.topic, "a");
    assert!(!delivery.is_held(9));
    assert!(delivery.release(9).is_none());
}
