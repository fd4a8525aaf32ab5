//! Identifiers and the inbound packet
//!
//! Everything in this file is an opaque, hashable value the router keys its
//! maps on. The wire encoding of these values belongs to the transport; here
//! they only need to be comparable and serializable.
//!
//! - `SysMessageId`: globally unique id of a message instance
//! - `ConsumerId` / `ConnectionId`: ids assigned by the broker hosting the
//!   consumer or connection
//! - `TransactionId`: id of a (possibly remote) transaction
//! - `BrokerAddress`: a cluster member, with an optional session id that
//!   changes every time the broker restarts
//! - `DestinationId`: queue or topic name; topic names may be wildcard
//!   patterns
//! - `Packet`: the message payload plus the accessor fields routing needs

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::broker::pattern;
use crate::utils::{BrokerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SysMessageId(Uuid);

impl SysMessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }
}

impl Default for SysMessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SysMessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SysMessageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConsumerId(pub u64);

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "consumer-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connection-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(pub u64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

/// A cluster member.
///
/// Two addresses are equal only if both the instance name and the session
/// match. Broker-down handling uses [`BrokerAddress::matches_down`] instead,
/// which treats an unset session on the failed address as "any session".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BrokerAddress {
    pub instance: String,
    pub session: Option<Uuid>,
}

impl BrokerAddress {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
            session: None,
        }
    }

    pub fn with_session(instance: impl Into<String>, session: Uuid) -> Self {
        Self {
            instance: instance.into(),
            session: Some(session),
        }
    }

    /// Whether a broker-down notice for `down` applies to this address.
    pub fn matches_down(&self, down: &BrokerAddress) -> bool {
        self.instance == down.instance && (down.session.is_none() || down.session == self.session)
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.session {
            Some(session) => write!(f, "{}[{}]", self.instance, session),
            None => write!(f, "{}", self.instance),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationKind {
    Queue,
    Topic,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DestinationId {
    pub name: String,
    pub kind: DestinationKind,
}

impl DestinationId {
    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DestinationKind::Queue,
        }
    }

    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DestinationKind::Topic,
        }
    }

    pub fn is_queue(&self) -> bool {
        self.kind == DestinationKind::Queue
    }

    pub fn is_wildcard(&self) -> bool {
        pattern::is_wildcard(&self.name)
    }

    /// Rejects wildcard queues and malformed wildcard topic patterns.
    pub fn validate(&self) -> Result<()> {
        if !self.is_wildcard() {
            return Ok(());
        }
        if self.is_queue() {
            return Err(BrokerError::WildcardQueue(self.name.clone()));
        }
        pattern::WildcardPattern::parse(&self.name).map(|_| ())
    }
}

impl fmt::Display for DestinationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            DestinationKind::Queue => write!(f, "queue:{}", self.name),
            DestinationKind::Topic => write!(f, "topic:{}", self.name),
        }
    }
}

/// A message as it arrives from a peer broker.
///
/// The body is never inspected by the router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub id: SysMessageId,
    pub destination: DestinationId,
    pub redelivered: bool,
    pub persistent: bool,
    pub timestamp: i64,
    pub body: Bytes,
}

impl Packet {
    pub fn new(destination: DestinationId, body: impl Into<Bytes>) -> Self {
        Self {
            id: SysMessageId::new(),
            destination,
            redelivered: false,
            persistent: true,
            timestamp: chrono::Utc::now().timestamp_millis(),
            body: body.into(),
        }
    }

    pub fn size(&self) -> u64 {
        self.body.len() as u64
    }
}

/// Cluster control messages a peer may send outside the message flow.
///
/// `StartFlow` and `StopFlow` drive a consumer's flow control; `Ping` is a
/// liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlKind {
    StartFlow,
    StopFlow,
    Ping,
}

impl FromStr for ControlKind {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "start_flow" => Ok(Self::StartFlow),
            "stop_flow" => Ok(Self::StopFlow),
            "ping" => Ok(Self::Ping),
            other => Err(BrokerError::Protocol(format!(
                "unknown control message '{other}'"
            ))),
        }
    }
}
