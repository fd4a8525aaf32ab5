//! The `error` module defines the error type shared by every component of the
//! cluster router.
//!
//! Errors fall in two groups. Resource exhaustion and consistency anomalies are
//! absorbed inside the router and only surface in logs. Protocol and contract
//! violations (bad destination patterns, malformed control or acknowledgment
//! packets, duplicate consumers) propagate to the caller.

use thiserror::Error;

use crate::broker::message::{ConsumerId, DestinationId, SysMessageId, TransactionId};

/// Coarse classification of a [`BrokerError`], mirroring the status codes a
/// peer broker would see on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    ResourceFull,
    EntityTooLarge,
    NotAcceptable,
    Conflict,
    NotFound,
    Error,
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("destination {destination} is full: {reason}")]
    ResourceFull {
        destination: DestinationId,
        reason: String,
    },

    #[error("message {id} of {size} bytes exceeds the {limit} byte limit of {destination}")]
    EntityTooLarge {
        id: SysMessageId,
        destination: DestinationId,
        size: u64,
        limit: u64,
    },

    #[error("invalid destination pattern '{pattern}': {reason}")]
    InvalidPattern {
        pattern: String,
        reason: &'static str,
    },

    #[error("wildcards are not supported for queues: {0}")]
    WildcardQueue(String),

    #[error("consumer {0} already added")]
    ConsumerAlreadyAdded(ConsumerId),

    #[error("unable to attach to destination {0}")]
    DestinationUnavailable(DestinationId),

    #[error("acknowledgement entries not found for transaction {txn}: {pairs:?}")]
    AckEntryNotFound {
        txn: TransactionId,
        pairs: Vec<(SysMessageId, ConsumerId)>,
    },

    #[error("transaction {0} not found")]
    TransactionNotFound(TransactionId),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("no async runtime available: {0}")]
    Runtime(#[from] tokio::runtime::TryCurrentError),

    #[error("transaction log error: {0}")]
    Storage(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("unknown cluster transport '{0}'")]
    UnknownTransport(String),

    #[error("cluster link error: {0}")]
    Link(#[from] tungstenite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BrokerError {
    pub fn status(&self) -> Status {
        match self {
            Self::ResourceFull { .. } => Status::ResourceFull,
            Self::EntityTooLarge { .. } => Status::EntityTooLarge,
            Self::InvalidPattern { .. } | Self::WildcardQueue(_) | Self::Protocol(_) => {
                Status::NotAcceptable
            }
            Self::ConsumerAlreadyAdded(_) => Status::Conflict,
            Self::DestinationUnavailable(_)
            | Self::AckEntryNotFound { .. }
            | Self::TransactionNotFound(_) => Status::NotFound,
            Self::UnknownTransport(_) => Status::NotFound,
            Self::Storage(_)
            | Self::Serialization(_)
            | Self::Runtime(_)
            | Self::Link(_)
            | Self::Io(_) => Status::Error,
        }
    }

    /// True for the capacity failures the router absorbs instead of
    /// propagating.
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(self.status(), Status::ResourceFull | Status::EntityTooLarge)
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
