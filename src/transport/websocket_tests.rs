use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, Stream, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::broker::message::{BrokerAddress, ConsumerId, DestinationId, Packet};
use crate::broker::{AckKind, BrokerContext, ClusterRouter, RemoteConsumers};
use crate::config::Settings;
use crate::persistence::TxnLog;
use crate::transport::message::ClusterPacket;
use crate::transport::websocket::{PeerLinks, serve};

async fn setup_listener() -> (String, Arc<ClusterRouter>, Arc<PeerLinks>) {
    let addr = format!(
        "127.0.0.1:{}",
        portpicker::pick_unused_port().expect("No free ports")
    );
    let local = BrokerAddress::new("local");
    let ctx = BrokerContext::new(Settings::default(), local.clone());
    let links = PeerLinks::new(local);
    let remote = RemoteConsumers::new(ctx.clone(), links.clone(), TxnLog::temporary().unwrap());
    let router = Arc::new(ClusterRouter::new(ctx, links.clone(), remote));

    let listener = TcpListener::bind(&addr).await.expect("Failed to bind");
    tokio::spawn(serve(listener, router.clone(), links.clone()));

    (format!("ws://{addr}"), router, links)
}

fn frame(packet: &ClusterPacket) -> WsMessage {
    WsMessage::Text(serde_json::to_string(packet).unwrap().into())
}

async fn next_packet<S>(ws_stream: &mut S) -> ClusterPacket
where
    S: Stream<Item = Result<WsMessage, tungstenite::Error>> + Unpin,
{
    let response = tokio::time::timeout(Duration::from_secs(5), ws_stream.next())
        .await
        .expect("Timed out waiting for a packet")
        .expect("Link closed")
        .unwrap();
    serde_json::from_slice(&response.into_data()).unwrap()
}

async fn wait_for(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_link_exchanges_hello() {
    let (url, _router, links) = setup_listener().await;
    let (mut ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .expect("WebSocket handshake failed");

    ws_stream
        .send(frame(&ClusterPacket::Hello {
            sender: BrokerAddress::new("b1"),
        }))
        .await
        .unwrap();

    match next_packet(&mut ws_stream).await {
        ClusterPacket::Hello { sender } => assert_eq!(sender, BrokerAddress::new("local")),
        other => panic!("Expected hello, got {other:?}"),
    }
    wait_for(|| links.is_connected("b1")).await;
}

#[tokio::test]
async fn test_unknown_target_is_ignored_over_a_real_link() {
    let (url, _router, links) = setup_listener().await;
    let (mut ws_stream, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    ws_stream
        .send(frame(&ClusterPacket::Hello {
            sender: BrokerAddress::new("b1"),
        }))
        .await
        .unwrap();
    let _hello = next_packet(&mut ws_stream).await;
    wait_for(|| links.is_connected("b1")).await;

    let packet = Packet::new(DestinationId::queue("q1"), "payload");
    let id = packet.id;
    ws_stream
        .send(frame(&ClusterPacket::Message {
            packet,
            targets: vec![(ConsumerId(7), 1)],
            delivered_ack: false,
        }))
        .await
        .unwrap();

    match next_packet(&mut ws_stream).await {
        ClusterPacket::Ack {
            id: acked,
            consumer,
            kind,
            ..
        } => {
            assert_eq!(acked, id);
            assert_eq!(consumer, ConsumerId(7));
            assert_eq!(kind, AckKind::Ignored);
        }
        other => panic!("Expected ack, got {other:?}"),
    }
}

#[tokio::test]
async fn test_closed_link_takes_peer_consumers_down() {
    let (url, router, links) = setup_listener().await;
    let (mut ws_stream, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    let b2 = BrokerAddress::new("b2");
    ws_stream
        .send(frame(&ClusterPacket::Hello { sender: b2.clone() }))
        .await
        .unwrap();
    let _hello = next_packet(&mut ws_stream).await;

    let spec = crate::consumer::ConsumerSpec::new(
        ConsumerId(20),
        crate::broker::message::ConnectionId(1),
        b2,
        DestinationId::queue("q1"),
    );
    ws_stream
        .send(frame(&ClusterPacket::ConsumerAdded { consumer: spec }))
        .await
        .unwrap();
    wait_for(|| router.remote().get(&ConsumerId(20)).is_some()).await;

    ws_stream.close(None).await.unwrap();
    wait_for(|| !links.is_connected("b2")).await;
    wait_for(|| router.remote().get(&ConsumerId(20)).is_none()).await;
}

#[tokio::test]
async fn test_link_without_hello_is_closed() {
    let (url, _router, links) = setup_listener().await;
    let (mut ws_stream, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    ws_stream
        .send(frame(&ClusterPacket::Control {
            kind: "ping".to_string(),
            consumer: None,
            prefetch: None,
        }))
        .await
        .unwrap();

    let _hello = next_packet(&mut ws_stream).await;
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(Ok(msg)) = ws_stream.next().await {
            if msg.is_close() {
                break;
            }
        }
    })
    .await;
    assert!(closed.is_ok());
    assert!(links.peers().is_empty());
}
