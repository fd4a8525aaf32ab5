//! Destinations and the destination registry
//!
//! A destination owns an ordered backlog of message references. The backlog
//! mutex is the per-destination enqueue lock: the duplicate check and the
//! insert happen under one acquisition, so two copies of the same message
//! racing in can never both be queued.
//!
//! The registry is a concurrent map. Auto-creation on first message is
//! governed by the `destinations` configuration section.

use std::fmt;
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::broker::message::{ConsumerId, DestinationId, DestinationKind, SysMessageId};
use crate::broker::pattern::WildcardPattern;
use crate::broker::reference::{MessageReference, ReferenceStore};
use crate::config::DestinationSettings;
use crate::utils::{BrokerError, Result};

/// Why a reference left a destination backlog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveReason {
    Acknowledged,
    Expired,
    DestinationDeleted,
    Takeover,
    Undeliverable,
    Dead,
}

impl fmt::Display for RemoveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Acknowledged => "acknowledged",
            Self::Expired => "expired",
            Self::DestinationDeleted => "destination deleted",
            Self::Takeover => "takeover",
            Self::Undeliverable => "undeliverable",
            Self::Dead => "dead",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Queued,
    /// A reference with the same id was already in the backlog.
    Duplicate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DestinationLimits {
    pub max_messages: Option<usize>,
    pub max_bytes: Option<u64>,
    pub max_message_bytes: Option<u64>,
}

impl From<&DestinationSettings> for DestinationLimits {
    fn from(settings: &DestinationSettings) -> Self {
        Self {
            max_messages: settings.max_messages,
            max_bytes: settings.max_bytes,
            max_message_bytes: settings.max_message_bytes,
        }
    }
}

#[derive(Debug, Default)]
struct Backlog {
    entries: IndexMap<SysMessageId, Arc<MessageReference>>,
    bytes: u64,
}

#[derive(Debug)]
pub struct Destination {
    id: DestinationId,
    limits: DestinationLimits,
    backlog: Mutex<Backlog>,
    consumers: DashSet<ConsumerId>,
}

impl Destination {
    pub fn new(id: DestinationId, limits: DestinationLimits) -> Self {
        Self {
            id,
            limits,
            backlog: Mutex::new(Backlog::default()),
            consumers: DashSet::new(),
        }
    }

    pub fn id(&self) -> &DestinationId {
        &self.id
    }

    pub fn limits(&self) -> DestinationLimits {
        self.limits
    }

    /// Queue `reference` unless a reference with the same id is already
    /// queued.
    ///
    /// Limits always apply to locally produced messages. Messages arriving
    /// from a peer are only checked when `enforce_limit` is set.
    pub fn enqueue(
        &self,
        reference: &Arc<MessageReference>,
        remote: bool,
        enforce_limit: bool,
    ) -> Result<Enqueued> {
        let mut backlog = self.backlog.lock();
        if backlog.entries.contains_key(&reference.id()) {
            return Ok(Enqueued::Duplicate);
        }

        let size = reference.size();
        if !remote || enforce_limit {
            self.check_limits(&backlog, reference.id(), size)?;
        }

        backlog.entries.insert(reference.id(), reference.clone());
        backlog.bytes += size;
        Ok(Enqueued::Queued)
    }

    fn check_limits(&self, backlog: &Backlog, id: SysMessageId, size: u64) -> Result<()> {
        if let Some(limit) = self.limits.max_message_bytes {
            if size > limit {
                return Err(BrokerError::EntityTooLarge {
                    id,
                    destination: self.id.clone(),
                    size,
                    limit,
                });
            }
        }
        if let Some(max) = self.limits.max_messages {
            if backlog.entries.len() >= max {
                return Err(BrokerError::ResourceFull {
                    destination: self.id.clone(),
                    reason: format!("message limit {max} reached"),
                });
            }
        }
        if let Some(max) = self.limits.max_bytes {
            if backlog.bytes + size > max {
                return Err(BrokerError::ResourceFull {
                    destination: self.id.clone(),
                    reason: format!("byte limit {max} reached"),
                });
            }
        }
        Ok(())
    }

    pub fn remove(&self, id: &SysMessageId, reason: RemoveReason) -> Option<Arc<MessageReference>> {
        let mut backlog = self.backlog.lock();
        let removed = backlog.entries.shift_remove(id)?;
        backlog.bytes = backlog.bytes.saturating_sub(removed.size());
        debug!("Removed {} from {} ({})", id, self.id, reason);
        Some(removed)
    }

    fn drain(&self) -> Vec<Arc<MessageReference>> {
        let mut backlog = self.backlog.lock();
        backlog.bytes = 0;
        backlog.entries.drain(..).map(|(_, r)| r).collect()
    }

    pub fn contains(&self, id: &SysMessageId) -> bool {
        self.backlog.lock().entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.backlog.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> u64 {
        self.backlog.lock().bytes
    }

    pub fn message_ids(&self) -> Vec<SysMessageId> {
        self.backlog.lock().entries.keys().copied().collect()
    }

    pub fn attach_consumer(&self, consumer: ConsumerId) -> bool {
        self.consumers.insert(consumer)
    }

    pub fn detach_consumer(&self, consumer: &ConsumerId) -> bool {
        self.consumers.remove(consumer).is_some()
    }

    pub fn consumers(&self) -> Vec<ConsumerId> {
        let mut ids: Vec<_> = self.consumers.iter().map(|c| *c).collect();
        ids.sort();
        ids
    }
}

#[derive(Debug)]
pub struct DestinationRegistry {
    destinations: DashMap<DestinationId, Arc<Destination>>,
    settings: DestinationSettings,
}

impl DestinationRegistry {
    pub fn new(settings: DestinationSettings) -> Self {
        Self {
            destinations: DashMap::new(),
            settings,
        }
    }

    pub fn resolve(&self, id: &DestinationId) -> Option<Arc<Destination>> {
        self.destinations.get(id).map(|d| d.value().clone())
    }

    /// Every concrete destination of the pattern's kind whose name matches.
    pub fn resolve_wildcard(&self, pattern: &DestinationId) -> Result<Vec<Arc<Destination>>> {
        pattern.validate()?;
        let matcher = WildcardPattern::parse(&pattern.name)?;
        let mut matched: Vec<_> = self
            .destinations
            .iter()
            .filter(|entry| {
                let id = entry.key();
                id.kind == pattern.kind && !id.is_wildcard() && matcher.matches(&id.name)
            })
            .map(|entry| entry.value().clone())
            .collect();
        matched.sort_by(|a, b| a.id().name.cmp(&b.id().name));
        Ok(matched)
    }

    /// Resolve a concrete destination, creating it when auto-creation is
    /// enabled for its kind. `Ok(None)` means it does not exist and may not be
    /// created.
    pub fn get_or_auto_create(&self, id: &DestinationId) -> Result<Option<Arc<Destination>>> {
        id.validate()?;
        if id.is_wildcard() {
            return Err(BrokerError::InvalidPattern {
                pattern: id.name.clone(),
                reason: "wildcard destinations cannot be created",
            });
        }
        if let Some(existing) = self.resolve(id) {
            return Ok(Some(existing));
        }
        let allowed = match id.kind {
            DestinationKind::Queue => self.settings.auto_create_queues,
            DestinationKind::Topic => self.settings.auto_create_topics,
        };
        if !allowed {
            return Ok(None);
        }
        Ok(Some(self.insert(id)))
    }

    /// Administrative create. Returns the existing destination if present.
    pub fn create(&self, id: DestinationId) -> Result<Arc<Destination>> {
        id.validate()?;
        if id.is_wildcard() {
            return Err(BrokerError::InvalidPattern {
                pattern: id.name,
                reason: "wildcard destinations cannot be created",
            });
        }
        Ok(self.insert(&id))
    }

    fn insert(&self, id: &DestinationId) -> Arc<Destination> {
        let limits = DestinationLimits::from(&self.settings);
        self.destinations
            .entry(id.clone())
            .or_insert_with(|| {
                info!("Creating destination {}", id);
                Arc::new(Destination::new(id.clone(), limits))
            })
            .value()
            .clone()
    }

    /// Remove a destination and invalidate every reference still queued on it.
    pub fn delete(&self, id: &DestinationId, references: &ReferenceStore) -> Option<Arc<Destination>> {
        let (_, destination) = self.destinations.remove(id)?;
        let queued = destination.drain();
        for reference in &queued {
            debug!(
                "Removed {} from {} ({})",
                reference.id(),
                id,
                RemoveReason::DestinationDeleted
            );
            references.invalidate(reference);
        }
        info!("Deleted destination {} with {} queued messages", id, queued.len());
        Some(destination)
    }

    pub fn all(&self) -> Vec<Arc<Destination>> {
        let mut all: Vec<_> = self.destinations.iter().map(|d| d.value().clone()).collect();
        all.sort_by(|a, b| a.id().cmp(b.id()));
        all
    }

    pub fn len(&self) -> usize {
        self.destinations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.destinations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::message::Packet;

    fn settings() -> DestinationSettings {
        DestinationSettings {
            auto_create_queues: true,
            auto_create_topics: false,
            max_messages: None,
            max_bytes: None,
            max_message_bytes: None,
        }
    }

    fn reference(dest: &DestinationId, body: &'static [u8]) -> Arc<MessageReference> {
        Arc::new(MessageReference::new(Packet::new(dest.clone(), body), None))
    }

    #[test]
    fn enqueue_detects_duplicates() {
        let id = DestinationId::queue("orders");
        let dest = Destination::new(id.clone(), DestinationLimits::default());
        let r = reference(&id, b"hello");

        assert_eq!(dest.enqueue(&r, true, false).unwrap(), Enqueued::Queued);
        assert_eq!(dest.enqueue(&r, true, false).unwrap(), Enqueued::Duplicate);
        assert_eq!(dest.len(), 1);
        assert_eq!(dest.bytes(), 5);
    }

    #[test]
    fn remote_messages_skip_limits_unless_enforced() {
        let id = DestinationId::queue("orders");
        let limits = DestinationLimits {
            max_messages: Some(1),
            ..Default::default()
        };
        let dest = Destination::new(id.clone(), limits);

        dest.enqueue(&reference(&id, b"a"), true, true).unwrap();
        let err = dest.enqueue(&reference(&id, b"b"), true, true).unwrap_err();
        assert!(err.is_resource_exhaustion());

        // not enforced for peers
        assert_eq!(
            dest.enqueue(&reference(&id, b"c"), true, false).unwrap(),
            Enqueued::Queued
        );
        // always enforced locally
        assert!(dest.enqueue(&reference(&id, b"d"), false, false).is_err());
        assert_eq!(dest.len(), 2);
    }

    #[test]
    fn oversized_message_is_rejected_and_lock_released() {
        let id = DestinationId::queue("orders");
        let limits = DestinationLimits {
            max_message_bytes: Some(2),
            ..Default::default()
        };
        let dest = Destination::new(id.clone(), limits);

        let err = dest.enqueue(&reference(&id, b"too big"), false, false).unwrap_err();
        assert!(matches!(err, BrokerError::EntityTooLarge { size: 7, limit: 2, .. }));
        // backlog lock is free again
        assert_eq!(dest.enqueue(&reference(&id, b"ok"), false, false).unwrap(), Enqueued::Queued);
    }

    #[test]
    fn remove_updates_byte_count() {
        let id = DestinationId::queue("orders");
        let dest = Destination::new(id.clone(), DestinationLimits::default());
        let r = reference(&id, b"abc");
        dest.enqueue(&r, true, false).unwrap();

        assert!(dest.remove(&r.id(), RemoveReason::Acknowledged).is_some());
        assert!(dest.remove(&r.id(), RemoveReason::Acknowledged).is_none());
        assert_eq!(dest.bytes(), 0);
        assert!(dest.is_empty());
    }

    #[test]
    fn auto_create_follows_settings() {
        let registry = DestinationRegistry::new(settings());

        assert!(registry.get_or_auto_create(&DestinationId::queue("q1")).unwrap().is_some());
        assert!(registry.get_or_auto_create(&DestinationId::topic("t1")).unwrap().is_none());
        assert!(matches!(
            registry.get_or_auto_create(&DestinationId::queue("q.*")),
            Err(BrokerError::WildcardQueue(_))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn wildcard_resolves_matching_topics() {
        let registry = DestinationRegistry::new(settings());
        registry.create(DestinationId::topic("orders.eu")).unwrap();
        registry.create(DestinationId::topic("orders.us")).unwrap();
        registry.create(DestinationId::topic("billing.eu")).unwrap();
        registry.create(DestinationId::queue("orders.eu")).unwrap();

        let matched = registry
            .resolve_wildcard(&DestinationId::topic("orders.*"))
            .unwrap();
        let names: Vec<_> = matched.iter().map(|d| d.id().name.clone()).collect();
        assert_eq!(names, vec!["orders.eu", "orders.us"]);

        assert!(registry
            .resolve_wildcard(&DestinationId::topic("nothing.*"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn delete_invalidates_queued_references() {
        let registry = DestinationRegistry::new(settings());
        let store = ReferenceStore::new();
        let id = DestinationId::queue("orders");
        let dest = registry.create(id.clone()).unwrap();

        let packet = Packet::new(id.clone(), &b"x"[..]);
        let (r, _) = store.create_or_get(&packet, None);
        dest.enqueue(&r, false, false).unwrap();

        assert!(registry.delete(&id, &store).is_some());
        assert!(!r.is_active());
        assert!(store.lookup(&packet.id).is_none());
        assert!(registry.resolve(&id).is_none());
    }
}
