use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::debug;

use crate::broker::message::{BrokerAddress, ConnectionId, ConsumerId};
use crate::consumer::handle::{Consumer, ConsumerSpec, Delivery};
use crate::utils::{BrokerError, Result};

/// Concurrent map of every consumer this broker knows about, local or hosted
/// on a peer.
#[derive(Debug, Default)]
pub struct ConsumerRegistry {
    consumers: DashMap<ConsumerId, Arc<Consumer>>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a consumer and return it with the receiving end of its
    /// delivery channel. Registering an id twice is an error.
    pub fn register(
        &self,
        spec: ConsumerSpec,
        credit: Option<u32>,
    ) -> Result<(Arc<Consumer>, UnboundedReceiver<Delivery>)> {
        match self.consumers.entry(spec.id) {
            Entry::Occupied(entry) => Err(BrokerError::ConsumerAlreadyAdded(*entry.key())),
            Entry::Vacant(entry) => {
                let (tx, rx) = mpsc::unbounded_channel();
                debug!("Registered {} on {}", spec.id, spec.destination);
                let consumer = Arc::new(Consumer::new(spec, credit, tx));
                entry.insert(consumer.clone());
                Ok((consumer, rx))
            }
        }
    }

    pub fn get(&self, id: &ConsumerId) -> Option<Arc<Consumer>> {
        self.consumers.get(id).map(|c| c.value().clone())
    }

    /// Remove and invalidate a consumer.
    pub fn remove(&self, id: &ConsumerId) -> Option<Arc<Consumer>> {
        let (_, consumer) = self.consumers.remove(id)?;
        consumer.invalidate();
        Some(consumer)
    }

    /// Remove every consumer of `connection`.
    pub fn remove_connection(&self, connection: ConnectionId) -> Vec<Arc<Consumer>> {
        let ids: Vec<_> = self
            .consumers
            .iter()
            .filter(|c| c.connection() == connection)
            .map(|c| *c.key())
            .collect();
        ids.iter().filter_map(|id| self.remove(id)).collect()
    }

    /// Consumers whose session lives on a broker matching `down`.
    pub fn hosted_on(&self, down: &BrokerAddress) -> Vec<Arc<Consumer>> {
        self.consumers
            .iter()
            .filter(|c| c.broker().matches_down(down))
            .map(|c| c.value().clone())
            .collect()
    }

    pub fn all(&self) -> Vec<Arc<Consumer>> {
        let mut all: Vec<_> = self.consumers.iter().map(|c| c.value().clone()).collect();
        all.sort_by_key(|c| c.id());
        all
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }
}
