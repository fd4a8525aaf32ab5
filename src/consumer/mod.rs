//! The `consumer` module defines the consumers messages are routed to.
//!
//! A `Consumer` wraps the channel its deliveries are pushed into together
//! with its validity, flow-control credit and busy state. The
//! `ConsumerRegistry` maps consumer ids to consumers.

pub mod handle;
pub mod registry;

pub use handle::{AckMode, Consumer, ConsumerSpec, Delivery};
pub use registry::ConsumerRegistry;
