//! Cluster link packets
//!
//! Every frame on a peer link is one JSON text message holding a
//! [`ClusterPacket`], tagged by `"type"`. Maps keyed by ids travel as lists
//! of pairs so the encoding does not depend on how ids render as JSON keys.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::broker::message::{
    BrokerAddress, ConnectionId, ConsumerId, Packet, SysMessageId, TransactionId,
};
use crate::broker::{AckKind, AckProps, PendingTxnMessages};
use crate::consumer::ConsumerSpec;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClusterPacket {
    /// First frame on a link, from both ends.
    Hello { sender: BrokerAddress },
    /// A message owned by the sending broker for consumers hosted here,
    /// with each target's delivery count.
    Message {
        packet: Packet,
        targets: Vec<(ConsumerId, u32)>,
        #[serde(default)]
        delivered_ack: bool,
    },
    Ack {
        id: SysMessageId,
        consumer: ConsumerId,
        kind: AckKind,
        #[serde(default)]
        props: Option<AckProps>,
        #[serde(default)]
        delivered_ack: bool,
    },
    AckBatch {
        ids: Vec<SysMessageId>,
        consumers: Vec<ConsumerId>,
        kind: AckKind,
        #[serde(default)]
        props: Option<AckProps>,
        #[serde(default)]
        txn: Option<TransactionId>,
        #[serde(default)]
        txn_home: Option<BrokerAddress>,
    },
    Control {
        kind: String,
        #[serde(default)]
        consumer: Option<ConsumerId>,
        #[serde(default)]
        prefetch: Option<u32>,
    },
    TxnInquiry {
        txn: TransactionId,
    },
    PreparedInquiry {
        txns: Vec<TransactionId>,
    },
    /// A consumer hosted on the sending broker wants messages owned here.
    ConsumerAdded {
        consumer: ConsumerSpec,
    },
    ConsumerRemoved {
        consumer: ConsumerId,
        #[serde(default)]
        pending: Vec<PendingTxnEntry>,
        #[serde(default)]
        cleanup: bool,
    },
    ConnectionClosed {
        connection: ConnectionId,
    },
}

/// Wire form of one transaction of a [`PendingTxnMessages`] map.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PendingTxnEntry {
    pub txn: TransactionId,
    pub messages: Vec<(SysMessageId, u32)>,
}

impl ClusterPacket {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::Message { .. } => "message",
            Self::Ack { .. } => "ack",
            Self::AckBatch { .. } => "ack_batch",
            Self::Control { .. } => "control",
            Self::TxnInquiry { .. } => "txn_inquiry",
            Self::PreparedInquiry { .. } => "prepared_inquiry",
            Self::ConsumerAdded { .. } => "consumer_added",
            Self::ConsumerRemoved { .. } => "consumer_removed",
            Self::ConnectionClosed { .. } => "connection_closed",
        }
    }
}

pub fn encode_pending(pending: &PendingTxnMessages) -> Vec<PendingTxnEntry> {
    pending
        .iter()
        .map(|(txn, messages)| PendingTxnEntry {
            txn: *txn,
            messages: messages.iter().map(|(id, n)| (*id, *n)).collect(),
        })
        .collect()
}

pub fn decode_pending(entries: Vec<PendingTxnEntry>) -> PendingTxnMessages {
    let mut pending = PendingTxnMessages::new();
    for entry in entries {
        pending
            .entry(entry.txn)
            .or_insert_with(IndexMap::new)
            .extend(entry.messages);
    }
    pending
}
