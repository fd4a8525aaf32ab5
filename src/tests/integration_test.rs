use std::sync::Arc;
use std::time::Duration;

use crate::broker::message::{
    BrokerAddress, ConnectionId, ConsumerId, DestinationId, Packet, TransactionId,
};
use crate::broker::reference::MessageReference;
use crate::broker::{
    AckKind, AckProps, Broadcaster, BrokerContext, ClusterRouter, Release, RemoteConsumers,
};
use crate::config::Settings;
use crate::consumer::{ConsumerSpec, Delivery};
use crate::persistence::{RemoteTxnState, TxnLog};
use crate::transport::create_transport;
use crate::transport::message::ClusterPacket;
use crate::transport::websocket::{PeerLinks, connect_peer, serve};
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

struct Node {
    address: BrokerAddress,
    url: String,
    router: Arc<ClusterRouter>,
    links: Arc<PeerLinks>,
}

async fn start_node(instance: &str) -> Node {
    let addr = format!(
        "127.0.0.1:{}",
        portpicker::pick_unused_port().expect("No free ports")
    );
    let address = BrokerAddress::with_session(instance, Uuid::new_v4());
    let transport = create_transport("websocket", &address).unwrap();
    let links = transport.links.clone().unwrap();
    let ctx = BrokerContext::new(Settings::default(), address.clone());
    let remote = RemoteConsumers::new(
        ctx.clone(),
        transport.broadcaster.clone(),
        TxnLog::temporary().unwrap(),
    );
    let router = Arc::new(ClusterRouter::new(ctx, transport.broadcaster, remote));

    let listener = TcpListener::bind(&addr).await.expect("Failed to bind");
    tokio::spawn(serve(listener, router.clone(), links.clone()));

    Node {
        address,
        url: format!("ws://{addr}"),
        router,
        links,
    }
}

/// Start two nodes and link `b` to `a`.
async fn linked_pair() -> (Node, Node) {
    let a = start_node("a").await;
    let b = start_node("b").await;
    tokio::spawn({
        let url = a.url.clone();
        let router = b.router.clone();
        let links = b.links.clone();
        async move { connect_peer(&url, router, links).await }
    });
    wait_for(|| a.links.is_connected("b") && b.links.is_connected("a")).await;
    (a, b)
}

async fn wait_for(mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

async fn next_delivery(rx: &mut UnboundedReceiver<Delivery>) -> Delivery {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("Timed out waiting for a delivery")
        .expect("Delivery channel closed")
}

/// Register consumer `id` on `b` and announce it to `a`.
async fn consumer_on_b(
    a: &Node,
    b: &Node,
    id: u64,
    queue: &DestinationId,
) -> UnboundedReceiver<Delivery> {
    let spec = ConsumerSpec::new(ConsumerId(id), ConnectionId(1), b.address.clone(), queue.clone());
    let (_consumer, deliveries) = b.router.register_local_consumer(spec.clone()).unwrap();
    assert!(b.links.send(&a.address, &ClusterPacket::ConsumerAdded { consumer: spec }));
    wait_for(|| a.router.remote().get(&ConsumerId(id)).is_some()).await;
    deliveries
}

/// Produce a message on `node`, owed to `consumers`, and queue it.
fn produce(node: &Node, queue: &DestinationId, consumers: &[u64]) -> Arc<MessageReference> {
    let ctx = node.router.context();
    let packet = Packet::new(queue.clone(), &b"order-created"[..]);
    let (reference, _) = ctx.references.create_or_get(&packet, None);
    reference
        .write()
        .add_interests(consumers.iter().map(|c| ConsumerId(*c)));
    ctx.destinations
        .get_or_auto_create(queue)
        .unwrap()
        .unwrap()
        .enqueue(&reference, false, false)
        .unwrap();
    reference
}

#[tokio::test]
async fn message_crosses_the_cluster_and_ack_returns_home() {
    let (a, b) = linked_pair().await;
    let queue = DestinationId::queue("orders");
    let mut deliveries = consumer_on_b(&a, &b, 1, &queue).await;

    let reference = produce(&a, &queue, &[1]);
    let id = reference.id();
    let remote_consumer = a.router.remote().get(&ConsumerId(1)).unwrap();
    assert!(remote_consumer.route_message(&reference, false));

    let delivery = next_delivery(&mut deliveries).await;
    assert_eq!(delivery.reference.id(), id);
    assert_eq!(delivery.reference.home(), Some(a.address.clone()));
    assert!(a.router.remote().has_entry(&id, &ConsumerId(1)));

    b.links.acknowledge_to_sender(
        &a.address,
        id,
        ConsumerId(1),
        AckKind::Acknowledged,
        None,
        false,
    );
    wait_for(|| a.router.context().references.lookup(&id).is_none()).await;
    assert!(!a.router.remote().has_entry(&id, &ConsumerId(1)));

    a.router.shutdown();
    b.router.shutdown();
}

#[tokio::test]
async fn transactional_batch_is_prepared_and_committed_over_the_link() {
    let (a, b) = linked_pair().await;
    let queue = DestinationId::queue("payments");
    let mut deliveries = consumer_on_b(&a, &b, 2, &queue).await;
    let remote_consumer = a.router.remote().get(&ConsumerId(2)).unwrap();

    let m1 = produce(&a, &queue, &[2]);
    let m2 = produce(&a, &queue, &[2]);
    assert!(remote_consumer.route_message(&m1, false));
    assert!(remote_consumer.route_message(&m2, false));
    next_delivery(&mut deliveries).await;
    next_delivery(&mut deliveries).await;
    wait_for(|| a.router.remote().delivered_count() == 2).await;

    let txn = TransactionId(41);
    let ids = [m1.id(), m2.id()];
    let consumers = [ConsumerId(2), ConsumerId(2)];
    b.links.acknowledge_batch_to_sender(
        &a.address,
        &ids,
        &consumers,
        AckKind::Prepare,
        None,
        Some(txn),
        Some(&b.address),
    );
    wait_for(|| {
        matches!(
            a.router.remote().txn_log().get(txn),
            Ok(Some(record)) if record.state == RemoteTxnState::Prepared
        )
    })
    .await;

    b.links.acknowledge_batch_to_sender(
        &a.address,
        &ids,
        &consumers,
        AckKind::Acknowledged,
        None,
        Some(txn),
        None,
    );
    wait_for(|| a.router.context().references.is_empty()).await;
    let record = a.router.remote().txn_log().get(txn).unwrap().unwrap();
    assert_eq!(record.state, RemoteTxnState::Committed);
    assert_eq!(a.router.remote().delivered_count(), 0);

    a.router.shutdown();
    b.router.shutdown();
}

#[tokio::test]
async fn release_from_active_transaction_redelivers_across_the_cluster() {
    let (a, b) = linked_pair().await;
    let queue = DestinationId::queue("orders");
    let mut deliveries = consumer_on_b(&a, &b, 1, &queue).await;

    let reference = produce(&a, &queue, &[1]);
    let id = reference.id();
    let remote_consumer = a.router.remote().get(&ConsumerId(1)).unwrap();
    assert!(remote_consumer.route_message(&reference, false));
    let first = next_delivery(&mut deliveries).await;
    assert!(!first.reference.is_redelivered());
    assert_eq!(first.reference.delivery_count(ConsumerId(1), None), 1);

    let txn = TransactionId(7);
    b.links.acknowledge_batch_to_sender(
        &a.address,
        &[id],
        &[ConsumerId(1)],
        AckKind::Prepare,
        None,
        Some(txn),
        Some(&b.address),
    );
    wait_for(|| a.router.remote().entry_transaction(&id, &ConsumerId(1)) == Some(txn)).await;

    b.links.acknowledge_to_sender(
        &a.address,
        id,
        ConsumerId(1),
        AckKind::Ignored,
        Some(AckProps::release(Release::Active(txn))),
        false,
    );
    let second = next_delivery(&mut deliveries).await;
    assert_eq!(second.reference.id(), id);
    assert!(second.reference.is_redelivered());
    assert_eq!(second.reference.delivery_count(ConsumerId(1), None), 2);
    assert!(a.router.remote().has_entry(&id, &ConsumerId(1)));
    assert_eq!(a.router.remote().entry_transaction(&id, &ConsumerId(1)), None);

    b.links.acknowledge_to_sender(
        &a.address,
        id,
        ConsumerId(1),
        AckKind::Acknowledged,
        None,
        false,
    );
    wait_for(|| a.router.context().references.lookup(&id).is_none()).await;

    a.router.shutdown();
    b.router.shutdown();
}

#[tokio::test]
async fn message_for_a_vanished_consumer_goes_back_to_its_queue() {
    let (a, b) = linked_pair().await;
    let queue = DestinationId::queue("orders");

    // announced to a, but never registered on b
    let ghost = ConsumerSpec::new(ConsumerId(9), ConnectionId(1), b.address.clone(), queue.clone());
    assert!(b.links.send(&a.address, &ClusterPacket::ConsumerAdded { consumer: ghost }));
    wait_for(|| a.router.remote().get(&ConsumerId(9)).is_some()).await;

    let reference = produce(&a, &queue, &[9]);
    let id = reference.id();
    a.router
        .forward_message(&reference, &[a.router.remote().get(&ConsumerId(9)).unwrap()]);
    assert!(a.router.remote().has_entry(&id, &ConsumerId(9)));

    // b answers with an ignore; the entry waits for the consumer to close
    assert!(b.links.send(
        &a.address,
        &ClusterPacket::ConsumerRemoved {
            consumer: ConsumerId(9),
            pending: Vec::new(),
            cleanup: false,
        }
    ));
    wait_for(|| a.router.remote().get(&ConsumerId(9)).is_none()).await;

    assert!(!a.router.remote().has_entry(&id, &ConsumerId(9)));
    assert!(a.router.context().references.lookup(&id).is_some());
    let orders = a.router.context().destinations.resolve(&queue).unwrap();
    assert_eq!(orders.len(), 1);
    assert!(b.router.context().references.lookup(&id).is_none());

    a.router.shutdown();
    b.router.shutdown();
}

#[tokio::test]
async fn dropped_link_removes_the_peers_consumers() {
    let (a, b) = linked_pair().await;
    let queue = DestinationId::queue("orders");
    let _deliveries = consumer_on_b(&a, &b, 3, &queue).await;

    assert!(b.links.disconnect("a"));
    wait_for(|| !a.links.is_connected("b")).await;
    wait_for(|| a.router.remote().get(&ConsumerId(3)).is_none()).await;

    a.router.shutdown();
    b.router.shutdown();
}
