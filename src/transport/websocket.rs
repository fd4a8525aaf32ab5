//! WebSocket cluster links
//!
//! Each pair of brokers talks over one WebSocket connection carrying JSON
//! [`ClusterPacket`] frames. Responsibilities:
//! - Accept links from peers and dial the configured peers
//! - Exchange `hello` frames so each end knows the other's address
//! - Dispatch inbound packets to the [`ClusterRouter`], in arrival order
//! - Send outbound packets through [`PeerLinks`], the [`Broadcaster`] the
//!   router and the remote consumer engine are built with
//!
//! A link that closes is reported to the router as `broker_down` for the
//! peer address it announced.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::spawn;
use tokio::sync::mpsc;
use tokio_tungstenite::{WebSocketStream, accept_async, connect_async};
use tracing::{debug, info, warn};
use tungstenite::protocol::Message as WsMessage;
use uuid::Uuid;

use crate::broker::message::{BrokerAddress, ConsumerId, SysMessageId, TransactionId};
use crate::broker::reference::MessageReference;
use crate::broker::{AckKind, AckProps, Broadcaster, ClusterRouter};
use crate::consumer::Consumer;
use crate::transport::message::{ClusterPacket, decode_pending};
use crate::utils::{BrokerError, Result};

#[derive(Debug)]
struct Link {
    id: Uuid,
    peer: BrokerAddress,
    sender: mpsc::UnboundedSender<WsMessage>,
}

/// Open links to peer brokers, keyed by instance name.
#[derive(Debug)]
pub struct PeerLinks {
    local: BrokerAddress,
    links: DashMap<String, Link>,
}

impl PeerLinks {
    pub fn new(local: BrokerAddress) -> Arc<Self> {
        Arc::new(Self {
            local,
            links: DashMap::new(),
        })
    }

    pub fn local(&self) -> &BrokerAddress {
        &self.local
    }

    /// Register the outbound channel of a link. A newer link to the same
    /// instance replaces the older one.
    pub fn register(&self, peer: BrokerAddress, sender: mpsc::UnboundedSender<WsMessage>) -> Uuid {
        let id = Uuid::new_v4();
        let instance = peer.instance.clone();
        if let Some(old) = self.links.insert(instance, Link { id, peer, sender }) {
            debug!("Replaced link {} to {}", old.id, old.peer);
        }
        id
    }

    /// Remove the link `id` if it is still the registered one.
    pub fn unregister(&self, instance: &str, id: Uuid) -> bool {
        self.links.remove_if(instance, |_, link| link.id == id).is_some()
    }

    /// Drop the link to `instance`. Its connection closes once queued frames
    /// are flushed.
    pub fn disconnect(&self, instance: &str) -> bool {
        self.links.remove(instance).is_some()
    }

    pub fn close_all(&self) {
        self.links.clear();
    }

    pub fn is_connected(&self, instance: &str) -> bool {
        self.links.contains_key(instance)
    }

    pub fn peers(&self) -> Vec<BrokerAddress> {
        self.links.iter().map(|link| link.peer.clone()).collect()
    }

    /// Queue `packet` on the link to `to`. Packets addressed to an earlier
    /// session of the peer are dropped.
    pub fn send(&self, to: &BrokerAddress, packet: &ClusterPacket) -> bool {
        let Some(link) = self.links.get(&to.instance) else {
            warn!("No link to {}: dropping {}", to, packet.kind());
            return false;
        };
        if to.session.is_some() && link.peer.session.is_some() && to.session != link.peer.session {
            debug!("Dropping {} for stale session {} (now {})", packet.kind(), to, link.peer);
            return false;
        }
        match encode(packet) {
            Some(frame) => link.sender.send(frame).is_ok(),
            None => false,
        }
    }

    /// Queue `packet` on every open link. Returns how many accepted it.
    pub fn broadcast(&self, packet: &ClusterPacket) -> usize {
        let Some(frame) = encode(packet) else {
            return 0;
        };
        self.links
            .iter()
            .filter(|link| link.sender.send(frame.clone()).is_ok())
            .count()
    }
}

fn encode(packet: &ClusterPacket) -> Option<WsMessage> {
    match serde_json::to_string(packet) {
        Ok(json) => Some(WsMessage::Text(json.into())),
        Err(e) => {
            warn!("Unable to encode {}: {}", packet.kind(), e);
            None
        }
    }
}

impl Broadcaster for PeerLinks {
    fn send_message(
        &self,
        reference: &Arc<MessageReference>,
        consumers: &[Arc<Consumer>],
        delivered_ack: bool,
    ) {
        let mut by_broker: IndexMap<BrokerAddress, Vec<(ConsumerId, u32)>> = IndexMap::new();
        for consumer in consumers {
            let count = reference.delivery_count(consumer.id(), consumer.stored_id());
            by_broker
                .entry(consumer.broker().clone())
                .or_default()
                .push((consumer.id(), count.saturating_add(1)));
        }
        let mut outbound = reference.packet().clone();
        outbound.redelivered |= reference.is_redelivered();
        for (broker, targets) in by_broker {
            let packet = ClusterPacket::Message {
                packet: outbound.clone(),
                targets,
                delivered_ack,
            };
            if !self.send(&broker, &packet) {
                warn!("Unable to send {} to {}", reference.id(), broker);
            }
        }
    }

    fn acknowledge_to_sender(
        &self,
        sender: &BrokerAddress,
        id: SysMessageId,
        consumer: ConsumerId,
        kind: AckKind,
        props: Option<AckProps>,
        delivered_ack: bool,
    ) {
        self.send(
            sender,
            &ClusterPacket::Ack {
                id,
                consumer,
                kind,
                props,
                delivered_ack,
            },
        );
    }

    fn acknowledge_batch_to_sender(
        &self,
        sender: &BrokerAddress,
        ids: &[SysMessageId],
        consumers: &[ConsumerId],
        kind: AckKind,
        props: Option<AckProps>,
        txn: Option<TransactionId>,
        txn_home: Option<&BrokerAddress>,
    ) {
        self.send(
            sender,
            &ClusterPacket::AckBatch {
                ids: ids.to_vec(),
                consumers: consumers.to_vec(),
                kind,
                props,
                txn,
                txn_home: txn_home.cloned(),
            },
        );
    }

    fn send_transaction_inquiry(&self, broker: &BrokerAddress, txn: TransactionId) {
        self.send(broker, &ClusterPacket::TxnInquiry { txn });
    }

    fn send_prepared_transaction_inquiries(&self, txns: &[TransactionId]) {
        let sent = self.broadcast(&ClusterPacket::PreparedInquiry {
            txns: txns.to_vec(),
        });
        debug!("Prepared transaction inquiry for {} txns sent to {} peers", txns.len(), sent);
    }
}

/// Apply one inbound packet from `sender` to the router.
pub fn dispatch(router: &ClusterRouter, sender: &BrokerAddress, packet: ClusterPacket) -> Result<()> {
    match packet {
        ClusterPacket::Hello { sender: again } => {
            debug!("Repeated hello from {} as {}", sender, again);
        }
        ClusterPacket::Message {
            packet,
            targets,
            delivered_ack,
        } => {
            let targets: IndexMap<ConsumerId, u32> = targets.into_iter().collect();
            router.deliver_inbound_message(&packet, &targets, sender, delivered_ack)?;
        }
        ClusterPacket::Ack {
            id,
            consumer,
            kind,
            props,
            ..
        } => {
            if !router.acknowledge(kind, id, consumer, props)? {
                debug!("{} for {} by {}: no entry", kind, id, consumer);
            }
        }
        ClusterPacket::AckBatch {
            ids,
            consumers,
            kind,
            props,
            txn,
            txn_home,
        } => {
            if ids.len() != consumers.len() {
                return Err(BrokerError::Protocol(format!(
                    "ack batch with {} ids and {} consumers",
                    ids.len(),
                    consumers.len()
                )));
            }
            router.acknowledge_batch(kind, &ids, &consumers, props, txn, txn_home.as_ref())?;
        }
        ClusterPacket::Control {
            kind,
            consumer,
            prefetch,
        } => router.handle_control(&kind, consumer, prefetch)?,
        ClusterPacket::TxnInquiry { txn } => {
            info!("Transaction inquiry for {} from {}: not coordinated here", txn, sender);
        }
        ClusterPacket::PreparedInquiry { txns } => {
            info!("Prepared transaction inquiry from {} for {:?}", sender, txns);
        }
        ClusterPacket::ConsumerAdded { consumer } => {
            if consumer.broker.instance != sender.instance {
                return Err(BrokerError::Protocol(format!(
                    "{} announced consumer {} hosted on {}",
                    sender, consumer.id, consumer.broker
                )));
            }
            router.add_consumer(consumer)?;
        }
        ClusterPacket::ConsumerRemoved {
            consumer,
            pending,
            cleanup,
        } => {
            let pending = decode_pending(pending);
            let pending = (!pending.is_empty()).then_some(&pending);
            router.remove_consumer(consumer, pending, cleanup)?;
        }
        ClusterPacket::ConnectionClosed { connection } => router.remove_consumers(connection)?,
    }
    Ok(())
}

/// Accept links from peers on `addr` until the listener fails.
pub async fn start_cluster_listener(
    addr: String,
    router: Arc<ClusterRouter>,
    links: Arc<PeerLinks>,
) -> Result<()> {
    let listener = TcpListener::bind(&addr).await?;
    info!("Cluster listener on ws://{addr}");
    serve(listener, router, links).await
}

/// Accept links on an already bound listener.
pub async fn serve(
    listener: TcpListener,
    router: Arc<ClusterRouter>,
    links: Arc<PeerLinks>,
) -> Result<()> {
    loop {
        let (stream, remote) = listener.accept().await?;
        let router = router.clone();
        let links = links.clone();

        spawn(async move {
            match accept_async(stream).await {
                Ok(ws_stream) => run_link(ws_stream, router, links).await,
                Err(e) => warn!("WebSocket handshake error from {remote}: {e}"),
            }
        });
    }
}

/// Dial `url` and run the link until it closes.
pub async fn connect_peer(url: &str, router: Arc<ClusterRouter>, links: Arc<PeerLinks>) -> Result<()> {
    let (ws_stream, _) = connect_async(url).await?;
    info!("Connected to peer {url}");
    run_link(ws_stream, router, links).await;
    Ok(())
}

/// Keep a link to `url` open, redialing every `retry` until the router shuts
/// down.
pub async fn start_peer_connector(
    url: String,
    router: Arc<ClusterRouter>,
    links: Arc<PeerLinks>,
    retry: Duration,
) {
    while router.remote().is_valid() {
        match connect_peer(&url, router.clone(), links.clone()).await {
            Ok(()) => info!("Link to {url} closed"),
            Err(e) => debug!("Unable to reach {url}: {e}"),
        }
        tokio::time::sleep(retry).await;
    }
}

async fn run_link<S>(ws_stream: WebSocketStream<S>, router: Arc<ClusterRouter>, links: Arc<PeerLinks>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();

    let Some(hello) = encode(&ClusterPacket::Hello {
        sender: links.local().clone(),
    }) else {
        return;
    };
    let _ = tx.send(hello);
    // handed to `links` on hello, so dropping the link closes the connection
    let mut outbound = Some(tx);

    let cleanup_called = Arc::new(AtomicBool::new(false));
    let registered = Arc::new(Mutex::new(None::<(BrokerAddress, Uuid)>));

    let do_cleanup = {
        let router = router.clone();
        let links = links.clone();
        let cleanup_called = cleanup_called.clone();
        let registered = registered.clone();

        move || {
            if cleanup_called.swap(true, Ordering::SeqCst) {
                return;
            }
            let Some((peer, id)) = registered.lock().take() else {
                return;
            };
            if links.unregister(&peer.instance, id) {
                info!("Link to {} closed", peer);
                if let Err(e) = router.broker_down(&peer) {
                    warn!("Cleanup after {} went down failed: {}", peer, e);
                }
            }
        }
    };

    {
        let do_cleanup = do_cleanup.clone();

        spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = ws_sender.send(msg).await {
                    warn!("Failed to send on cluster link: {e}");
                    break;
                }
            }

            do_cleanup();
            let _ = ws_sender.close().await;
        });
    }

    let mut peer: Option<BrokerAddress> = None;
    while let Some(Ok(msg)) = ws_receiver.next().await {
        if !msg.is_text() {
            continue;
        }
        let packet = match msg.to_text().map(|text| serde_json::from_str::<ClusterPacket>(text)) {
            Ok(Ok(packet)) => packet,
            Ok(Err(e)) => {
                warn!("Invalid cluster packet: {e}");
                continue;
            }
            Err(e) => {
                warn!("Unreadable frame: {e}");
                continue;
            }
        };

        if peer.is_none() {
            match packet {
                ClusterPacket::Hello { sender } => {
                    let Some(tx) = outbound.take() else {
                        break;
                    };
                    let id = links.register(sender.clone(), tx);
                    *registered.lock() = Some((sender.clone(), id));
                    info!("Link established with {}", sender);
                    peer = Some(sender);
                }
                other => {
                    warn!("Expected hello, got {}: closing link", other.kind());
                    break;
                }
            }
            continue;
        }
        let Some(sender) = peer.as_ref() else {
            continue;
        };

        let kind = packet.kind();
        if let Err(e) = dispatch(&router, sender, packet) {
            warn!("Failed to handle {} from {}: {}", kind, sender, e);
        }
    }

    do_cleanup();
}
