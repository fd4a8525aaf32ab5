//! Outbound broadcaster contract
//!
//! The router and the remote acknowledgment engine never talk to peers
//! directly. They call a `Broadcaster`, which is fire-and-forget: failures
//! are logged by the implementation and never reach the caller.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::broker::message::{BrokerAddress, ConsumerId, SysMessageId, TransactionId};
use crate::broker::reference::MessageReference;
use crate::consumer::Consumer;

/// Acknowledgment kinds exchanged between brokers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckKind {
    Delivered,
    Acknowledged,
    Prepare,
    RolledBack,
    Ignored,
    Undeliverable,
    Dead,
}

impl fmt::Display for AckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Delivered => "DELIVERED",
            Self::Acknowledged => "ACKNOWLEDGED",
            Self::Prepare => "PREPARE",
            Self::RolledBack => "ROLLEDBACK",
            Self::Ignored => "IGNORED",
            Self::Undeliverable => "UNDELIVERABLE",
            Self::Dead => "DEAD",
        };
        f.write_str(s)
    }
}

/// How an `Ignored` acknowledgment releases a delivered entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "txn", rename_all = "snake_case")]
pub enum Release {
    /// Released from an inactive (closed, uncommitted) transaction.
    Inactive(TransactionId),
    /// Released by a transaction whose session went away.
    Orphan(TransactionId),
    /// Released by a still-running transaction: redeliver.
    Active(TransactionId),
    /// Session recover.
    Recover,
}

/// Optional properties attached to an acknowledgment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AckProps {
    /// New prefetch granted with a `Delivered` ack.
    pub prefetch: Option<u32>,
    pub release: Option<Release>,
    /// The receiving broker never handed the message to its consumer.
    pub not_sent_to_remote: bool,
    /// This ack answers a delivered-ack request.
    pub delivered_ack: bool,
    pub delivery_count: Option<u32>,
    pub dead_comment: Option<String>,
    pub dead_reason: Option<String>,
    pub dead_broker: Option<String>,
}

impl AckProps {
    pub fn release(release: Release) -> Self {
        Self {
            release: Some(release),
            ..Default::default()
        }
    }

    pub fn prefetch(prefetch: u32) -> Self {
        Self {
            prefetch: Some(prefetch),
            ..Default::default()
        }
    }
}

/// Sends messages, acknowledgments and inquiries to peer brokers.
pub trait Broadcaster: Send + Sync + fmt::Debug {
    /// Deliver a locally owned message to consumers hosted on peers.
    fn send_message(
        &self,
        reference: &Arc<MessageReference>,
        consumers: &[Arc<Consumer>],
        delivered_ack: bool,
    );

    fn acknowledge_to_sender(
        &self,
        sender: &BrokerAddress,
        id: SysMessageId,
        consumer: ConsumerId,
        kind: AckKind,
        props: Option<AckProps>,
        delivered_ack: bool,
    );

    #[allow(clippy::too_many_arguments)]
    fn acknowledge_batch_to_sender(
        &self,
        sender: &BrokerAddress,
        ids: &[SysMessageId],
        consumers: &[ConsumerId],
        kind: AckKind,
        props: Option<AckProps>,
        txn: Option<TransactionId>,
        txn_home: Option<&BrokerAddress>,
    );

    /// Ask `broker` for the outcome of `txn`, which still holds entries of
    /// closed consumers here.
    fn send_transaction_inquiry(&self, broker: &BrokerAddress, txn: TransactionId);

    /// Ask every peer about transactions prepared here longer than the ack
    /// wait timeout.
    fn send_prepared_transaction_inquiries(&self, txns: &[TransactionId]);
}
