//! The `persistence` module stores the state that must outlive a broker
//! restart.
//!
//! Message payloads are owned by the message store, outside this crate. What
//! lives here is the log of two-phase transactions that peers prepared
//! against messages owned by this broker, kept in an embedded `sled` database.

pub mod sled_store;

pub use sled_store::{RemoteTxnRecord, RemoteTxnState, TxnLog};

#[cfg(test)]
mod tests;
