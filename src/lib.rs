//! # ClusterMQ
//!
//! `clustermq` is the inter-broker routing layer of a clustered message
//! broker. Brokers in a cluster exchange messages produced on one node with
//! consumers attached to another, and route the acknowledgments back to the
//! broker that owns each message.
//!
//! ## Core Modules
//!
//! - `broker`: message references, destinations, the `ClusterRouter` that
//!   handles traffic from peers, and the acknowledgment engine for consumers
//!   hosted on peers.
//! - `consumer`: consumer handles with flow control, and the registry.
//! - `config`: loads node settings from defaults, files and the environment.
//! - `persistence`: the sled-backed log of prepared remote transactions.
//! - `transport`: WebSocket links between brokers and the cluster packet format.
//! - `utils`: the shared error type and logging setup.

pub mod broker;
pub mod config;
pub mod consumer;
pub mod persistence;
pub mod transport;
pub mod utils;

#[cfg(test)]
mod tests;
