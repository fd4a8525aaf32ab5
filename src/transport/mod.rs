//! The `transport` module carries cluster packets between brokers.
//!
//! - `message`: the `ClusterPacket` wire format
//! - `websocket`: peer links over WebSockets and the inbound dispatcher
//!
//! The broadcaster a node uses is picked by name (`cluster.transport`) from a
//! fixed table, see [`create_transport`].

pub mod message;
pub mod websocket;

use std::sync::Arc;

use tracing::{debug, info};

use crate::broker::message::{BrokerAddress, ConsumerId, SysMessageId, TransactionId};
use crate::broker::reference::MessageReference;
use crate::broker::{AckKind, AckProps, Broadcaster};
use crate::consumer::Consumer;
use crate::utils::{BrokerError, Result};
use websocket::PeerLinks;

/// Outbound side of a node's cluster traffic.
#[derive(Debug, Clone)]
pub struct ClusterTransport {
    pub broadcaster: Arc<dyn Broadcaster>,
    /// Present when the transport keeps live peer links the listener and
    /// connectors register with.
    pub links: Option<Arc<PeerLinks>>,
}

type TransportFactory = fn(&BrokerAddress) -> ClusterTransport;

const TRANSPORTS: &[(&str, TransportFactory)] = &[
    ("websocket", websocket_transport),
    ("log", log_transport),
];

fn websocket_transport(local: &BrokerAddress) -> ClusterTransport {
    let links = PeerLinks::new(local.clone());
    ClusterTransport {
        broadcaster: links.clone(),
        links: Some(links),
    }
}

fn log_transport(_local: &BrokerAddress) -> ClusterTransport {
    ClusterTransport {
        broadcaster: Arc::new(LogBroadcaster),
        links: None,
    }
}

/// Build the transport registered under `kind`.
pub fn create_transport(kind: &str, local: &BrokerAddress) -> Result<ClusterTransport> {
    TRANSPORTS
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(kind))
        .map(|(_, factory)| factory(local))
        .ok_or_else(|| BrokerError::UnknownTransport(kind.to_string()))
}

pub fn transport_names() -> Vec<&'static str> {
    TRANSPORTS.iter().map(|(name, _)| *name).collect()
}

/// Broadcaster for a node running without peers: outbound traffic is only
/// logged.
#[derive(Debug, Default)]
pub struct LogBroadcaster;

impl Broadcaster for LogBroadcaster {
    fn send_message(
        &self,
        reference: &Arc<MessageReference>,
        consumers: &[Arc<Consumer>],
        delivered_ack: bool,
    ) {
        let ids: Vec<ConsumerId> = consumers.iter().map(|c| c.id()).collect();
        info!(
            "Message {} for {:?} (delivered_ack: {}) not sent: no peers",
            reference.id(),
            ids,
            delivered_ack
        );
    }

    fn acknowledge_to_sender(
        &self,
        sender: &BrokerAddress,
        id: SysMessageId,
        consumer: ConsumerId,
        kind: AckKind,
        _props: Option<AckProps>,
        _delivered_ack: bool,
    ) {
        debug!("{} for {} by {} to {}", kind, id, consumer, sender);
    }

    fn acknowledge_batch_to_sender(
        &self,
        sender: &BrokerAddress,
        ids: &[SysMessageId],
        _consumers: &[ConsumerId],
        kind: AckKind,
        _props: Option<AckProps>,
        txn: Option<TransactionId>,
        _txn_home: Option<&BrokerAddress>,
    ) {
        debug!("{} batch of {} to {} (txn {:?})", kind, ids.len(), sender, txn);
    }

    fn send_transaction_inquiry(&self, broker: &BrokerAddress, txn: TransactionId) {
        info!("Transaction inquiry for {} to {} not sent: no peers", txn, broker);
    }

    fn send_prepared_transaction_inquiries(&self, txns: &[TransactionId]) {
        info!("Prepared transaction inquiry for {:?} not sent: no peers", txns);
    }
}

#[cfg(test)]
mod tests;
#[cfg(test)]
mod websocket_tests;
