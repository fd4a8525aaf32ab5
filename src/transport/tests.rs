use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;
use tungstenite::protocol::Message as WsMessage;
use uuid::Uuid;

use crate::broker::message::{
    BrokerAddress, ConnectionId, ConsumerId, DestinationId, Packet, SysMessageId, TransactionId,
};
use crate::broker::{
    AckKind, Broadcaster, BrokerContext, ClusterRouter, PendingTxnMessages, RemoteConsumers,
};
use crate::config::Settings;
use crate::consumer::ConsumerSpec;
use crate::persistence::TxnLog;
use crate::transport::message::{ClusterPacket, decode_pending, encode_pending};
use crate::transport::websocket::{PeerLinks, dispatch};
use crate::transport::{create_transport, transport_names};
use crate::utils::BrokerError;

fn linked_router() -> (ClusterRouter, Arc<PeerLinks>) {
    let local = BrokerAddress::new("local");
    let ctx = BrokerContext::new(Settings::default(), local.clone());
    let links = PeerLinks::new(local);
    let remote = RemoteConsumers::new(ctx.clone(), links.clone(), TxnLog::temporary().unwrap());
    (ClusterRouter::new(ctx, links.clone(), remote), links)
}

fn frames(rx: &mut mpsc::UnboundedReceiver<WsMessage>) -> Vec<ClusterPacket> {
    let mut packets = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        packets.push(serde_json::from_str(frame.to_text().unwrap()).unwrap());
    }
    packets
}

#[test]
fn test_hello_wire_format() {
    let hello = ClusterPacket::Hello {
        sender: BrokerAddress::new("b1"),
    };
    let value = serde_json::to_value(&hello).unwrap();
    assert_eq!(value["type"], "hello");
    assert_eq!(value["sender"]["instance"], "b1");
    assert_eq!(hello.kind(), "hello");
}

#[test]
fn test_control_packet_defaults_optional_fields() {
    let raw = json!({ "type": "control", "kind": "ping" }).to_string();
    let packet: ClusterPacket = serde_json::from_str(&raw).unwrap();
    assert_eq!(
        packet,
        ClusterPacket::Control {
            kind: "ping".to_string(),
            consumer: None,
            prefetch: None,
        }
    );
}

#[test]
fn test_unknown_packet_type_is_rejected() {
    let raw = json!({ "type": "subscribe", "topic": "t" }).to_string();
    assert!(serde_json::from_str::<ClusterPacket>(&raw).is_err());
}

#[test]
fn test_pending_transactions_survive_the_wire() {
    let (m1, m2) = (SysMessageId::new(), SysMessageId::new());
    let mut pending = PendingTxnMessages::new();
    pending.entry(TransactionId(7)).or_default().insert(m1, 2);
    pending.entry(TransactionId(7)).or_default().insert(m2, 1);
    pending.entry(TransactionId(9)).or_default().insert(m1, 3);

    let packet = ClusterPacket::ConsumerRemoved {
        consumer: ConsumerId(4),
        pending: encode_pending(&pending),
        cleanup: true,
    };
    let raw = serde_json::to_string(&packet).unwrap();
    let ClusterPacket::ConsumerRemoved { pending: wire, .. } = serde_json::from_str(&raw).unwrap()
    else {
        panic!("expected consumer_removed");
    };
    assert_eq!(decode_pending(wire), pending);
}

#[test]
fn test_transport_table() {
    let local = BrokerAddress::new("local");
    assert!(create_transport("websocket", &local).unwrap().links.is_some());
    assert!(create_transport("log", &local).unwrap().links.is_none());
    assert!(matches!(
        create_transport("carrier-pigeon", &local),
        Err(BrokerError::UnknownTransport(name)) if name == "carrier-pigeon"
    ));
    assert_eq!(transport_names(), vec!["websocket", "log"]);
}

#[test]
fn test_redelivery_carries_flag_and_raised_count() {
    let (router, links) = linked_router();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let b1 = BrokerAddress::new("b1");
    links.register(b1.clone(), tx);
    let spec = ConsumerSpec::new(ConsumerId(3), ConnectionId(1), b1, DestinationId::queue("q1"));
    let (consumer, _deliveries) = router.context().consumers.register(spec, None).unwrap();

    let packet = Packet::new(DestinationId::queue("q1"), "payload");
    let (reference, _) = router.context().references.create_or_get(&packet, None);
    reference.write().add_interests([ConsumerId(3)]);

    links.send_message(&reference, std::slice::from_ref(&consumer), false);
    reference.redeliver(ConsumerId(3), None);
    links.send_message(&reference, &[consumer], false);

    let sent: Vec<(bool, Vec<(ConsumerId, u32)>)> = frames(&mut rx)
        .into_iter()
        .map(|packet| match packet {
            ClusterPacket::Message { packet, targets, .. } => (packet.redelivered, targets),
            other => panic!("Expected message, got {other:?}"),
        })
        .collect();
    assert_eq!(
        sent,
        vec![
            (false, vec![(ConsumerId(3), 1)]),
            (true, vec![(ConsumerId(3), 2)]),
        ]
    );
    assert!(!reference.packet().redelivered);
}

#[test]
fn test_send_without_link_is_dropped() {
    let links = PeerLinks::new(BrokerAddress::new("local"));
    let sent = links.send(
        &BrokerAddress::new("b9"),
        &ClusterPacket::TxnInquiry {
            txn: TransactionId(1),
        },
    );
    assert!(!sent);
}

#[test]
fn test_stale_session_is_not_sent() {
    let links = PeerLinks::new(BrokerAddress::new("local"));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let current = BrokerAddress::with_session("b1", Uuid::new_v4());
    links.register(current.clone(), tx);

    let packet = ClusterPacket::TxnInquiry {
        txn: TransactionId(1),
    };
    assert!(!links.send(&BrokerAddress::with_session("b1", Uuid::new_v4()), &packet));
    assert!(links.send(&current, &packet));
    assert!(links.send(&BrokerAddress::new("b1"), &packet));
    assert_eq!(frames(&mut rx).len(), 2);
}

#[test]
fn test_unregister_ignores_replaced_link() {
    let links = PeerLinks::new(BrokerAddress::new("local"));
    let (tx1, _rx1) = mpsc::unbounded_channel();
    let (tx2, _rx2) = mpsc::unbounded_channel();
    let first = links.register(BrokerAddress::new("b1"), tx1);
    let second = links.register(BrokerAddress::new("b1"), tx2);

    assert!(!links.unregister("b1", first));
    assert!(links.is_connected("b1"));
    assert!(links.unregister("b1", second));
    assert!(!links.is_connected("b1"));
}

#[test]
fn test_message_for_unknown_consumer_is_ignored_over_the_link() {
    let (router, links) = linked_router();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let b1 = BrokerAddress::new("b1");
    links.register(b1.clone(), tx);

    let packet = Packet::new(DestinationId::queue("q1"), "payload");
    let id = packet.id;
    dispatch(
        &router,
        &b1,
        ClusterPacket::Message {
            packet,
            targets: vec![(ConsumerId(42), 1)],
            delivered_ack: false,
        },
    )
    .unwrap();

    let sent = frames(&mut rx);
    assert_eq!(
        sent,
        vec![ClusterPacket::Ack {
            id,
            consumer: ConsumerId(42),
            kind: AckKind::Ignored,
            props: None,
            delivered_ack: false,
        }]
    );
}

#[test]
fn test_inbound_message_reaches_local_consumer() {
    let (router, _links) = linked_router();
    let b1 = BrokerAddress::new("b1");
    let (_consumer, mut deliveries) = router
        .register_local_consumer(ConsumerSpec::new(
            ConsumerId(1),
            ConnectionId(1),
            BrokerAddress::new("local"),
            DestinationId::queue("q1"),
        ))
        .unwrap();

    let packet = Packet::new(DestinationId::queue("q1"), "payload");
    let id = packet.id;
    dispatch(
        &router,
        &b1,
        ClusterPacket::Message {
            packet,
            targets: vec![(ConsumerId(1), 1)],
            delivered_ack: false,
        },
    )
    .unwrap();

    let delivery = deliveries.try_recv().unwrap();
    assert_eq!(delivery.reference.id(), id);
    assert_eq!(delivery.reference.home(), Some(b1));
}

#[test]
fn test_mismatched_ack_batch_is_a_protocol_error() {
    let (router, _links) = linked_router();
    let err = dispatch(
        &router,
        &BrokerAddress::new("b1"),
        ClusterPacket::AckBatch {
            ids: vec![SysMessageId::new()],
            consumers: vec![],
            kind: AckKind::Acknowledged,
            props: None,
            txn: None,
            txn_home: None,
        },
    )
    .unwrap_err();
    assert!(matches!(err, BrokerError::Protocol(_)));
}

#[test]
fn test_unknown_control_kind_is_a_protocol_error() {
    let (router, _links) = linked_router();
    let err = dispatch(
        &router,
        &BrokerAddress::new("b1"),
        ClusterPacket::Control {
            kind: "reboot".to_string(),
            consumer: None,
            prefetch: None,
        },
    )
    .unwrap_err();
    assert!(matches!(err, BrokerError::Protocol(_)));
}

#[tokio::test]
async fn test_consumer_lifecycle_packets() {
    let (router, _links) = linked_router();
    let b2 = BrokerAddress::new("b2");
    let spec = ConsumerSpec::new(
        ConsumerId(10),
        ConnectionId(3),
        b2.clone(),
        DestinationId::queue("q1"),
    );

    dispatch(&router, &b2, ClusterPacket::ConsumerAdded { consumer: spec.clone() }).unwrap();
    assert!(router.remote().get(&ConsumerId(10)).is_some());

    let err = dispatch(
        &router,
        &BrokerAddress::new("b3"),
        ClusterPacket::ConsumerAdded {
            consumer: ConsumerSpec {
                id: ConsumerId(11),
                ..spec
            },
        },
    )
    .unwrap_err();
    assert!(matches!(err, BrokerError::Protocol(_)));

    dispatch(
        &router,
        &b2,
        ClusterPacket::ConnectionClosed {
            connection: ConnectionId(3),
        },
    )
    .unwrap();
    assert!(router.remote().get(&ConsumerId(10)).is_none());
    router.shutdown();
}
