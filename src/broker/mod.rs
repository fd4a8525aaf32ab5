//! The `broker` module is the cluster routing core.
//!
//! - `reference`: one canonical record per message id, with its lock
//! - `destination`: queues and topics with their backlogs and limits
//! - `engine`: the `ClusterRouter`, entry point for peer traffic
//! - `remote`: acknowledgment engine for consumers hosted on peers
//! - `broadcast`: the outbound contract towards peers

pub mod broadcast;
pub mod context;
pub mod destination;
pub mod engine;
pub mod message;
pub mod pattern;
pub mod reference;
pub mod remote;

pub use broadcast::{AckKind, AckProps, Broadcaster, Release};
pub use context::BrokerContext;
pub use engine::ClusterRouter;
pub use remote::{PendingTxnMessages, RemoteConsumers, NO_TRANSACTION};
