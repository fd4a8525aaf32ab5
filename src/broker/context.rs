use std::sync::Arc;

use tracing::warn;

use crate::broker::destination::{Destination, DestinationRegistry, RemoveReason};
use crate::broker::message::BrokerAddress;
use crate::broker::reference::{MessageReference, ReferenceStore};
use crate::config::Settings;
use crate::consumer::ConsumerRegistry;

/// Shared state of one broker node, handed to the router and the remote
/// acknowledgment engine when they are built.
#[derive(Debug)]
pub struct BrokerContext {
    pub settings: Settings,
    pub local: BrokerAddress,
    pub references: ReferenceStore,
    pub destinations: DestinationRegistry,
    pub consumers: ConsumerRegistry,
}

impl BrokerContext {
    pub fn new(settings: Settings, local: BrokerAddress) -> Arc<Self> {
        let destinations = DestinationRegistry::new(settings.destinations.clone());
        Arc::new(Self {
            settings,
            local,
            references: ReferenceStore::new(),
            destinations,
            consumers: ConsumerRegistry::new(),
        })
    }

    /// Destinations a reference may be queued on. Wildcard destinations
    /// resolve to every matching concrete destination.
    pub fn destinations_of(&self, reference: &MessageReference) -> Vec<Arc<Destination>> {
        let id = reference.destination();
        if id.is_wildcard() {
            match self.destinations.resolve_wildcard(id) {
                Ok(matched) => matched,
                Err(e) => {
                    warn!("Unable to resolve {} for {}: {}", id, reference.id(), e);
                    Vec::new()
                }
            }
        } else {
            self.destinations.resolve(id).into_iter().collect()
        }
    }

    /// Remove a reference from its destinations and destroy it.
    pub fn remove_message(&self, reference: &Arc<MessageReference>, reason: RemoveReason) {
        for destination in self.destinations_of(reference) {
            destination.remove(&reference.id(), reason);
        }
        self.references.destroy(reference);
    }
}
