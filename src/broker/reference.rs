//! Message reference store
//!
//! A `MessageReference` is the canonical in-memory record of one message
//! instance on this broker. The store guarantees at most one reference per
//! `SysMessageId`: `create_or_get` is an atomic check-and-insert on a
//! concurrent map, so callers racing on the same id all end up with the same
//! `Arc`.
//!
//! Concurrency notes:
//! - Every mutation of the home broker, lifecycle state or interest map goes
//!   through `MessageReference::write`, which returns a scoped guard. The
//!   guard is released on every exit path, including unwinding.
//! - The lock is per reference. Unrelated messages never contend.
//! - Lock order is reference, then destination backlog, then store shard.
//!   Code that walks the store snapshots the `Arc`s before locking any
//!   reference.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use indexmap::IndexMap;
use parking_lot::{Mutex, MutexGuard};

use crate::broker::destination::RemoveReason;
use crate::broker::message::{BrokerAddress, ConsumerId, DestinationId, Packet, SysMessageId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Active,
    Invalid,
    Destroyed,
}

/// Outcome of comparing an inbound packet's sender with the recorded home.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HomeChange {
    Unchanged,
    Reassigned { previous: BrokerAddress },
    /// No home recorded: the message belongs to this broker, so a peer
    /// claiming it holds stale ownership.
    LocallyOwned,
}

/// Mutable part of a reference. Only reachable through the write guard.
#[derive(Debug)]
pub struct RefState {
    lifecycle: Lifecycle,
    home: Option<BrokerAddress>,
    home_epoch: u32,
    never_store: bool,
    redelivered: bool,
    remote_interest: IndexMap<ConsumerId, u32>,
    delivered_acks: HashSet<ConsumerId>,
    in_delivery: HashSet<ConsumerId>,
    dead_reason: Option<RemoveReason>,
}

impl RefState {
    fn new(home: Option<BrokerAddress>) -> Self {
        Self {
            lifecycle: Lifecycle::Active,
            home,
            home_epoch: 0,
            never_store: false,
            redelivered: false,
            remote_interest: IndexMap::new(),
            delivered_acks: HashSet::new(),
            in_delivery: HashSet::new(),
            dead_reason: None,
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn is_active(&self) -> bool {
        self.lifecycle == Lifecycle::Active
    }

    pub fn home(&self) -> Option<&BrokerAddress> {
        self.home.as_ref()
    }

    pub fn home_epoch(&self) -> u32 {
        self.home_epoch
    }

    pub fn set_home(&mut self, home: BrokerAddress) {
        self.home = Some(home);
    }

    /// Reconcile the recorded home with the sender of an inbound packet.
    ///
    /// An established home is only ever replaced here, and replaying the same
    /// sender is a no-op.
    pub fn reconcile_home_change(&mut self, sender: &BrokerAddress) -> HomeChange {
        match &self.home {
            Some(home) if home == sender => HomeChange::Unchanged,
            Some(home) => {
                let previous = home.clone();
                self.set_home(sender.clone());
                self.home_epoch += 1;
                HomeChange::Reassigned { previous }
            }
            None => HomeChange::LocallyOwned,
        }
    }

    pub fn mark_invalid(&mut self) {
        if self.lifecycle == Lifecycle::Active {
            self.lifecycle = Lifecycle::Invalid;
        }
    }

    pub fn mark_destroyed(&mut self) {
        self.lifecycle = Lifecycle::Destroyed;
    }

    pub fn set_never_store(&mut self, never_store: bool) {
        self.never_store = never_store;
    }

    pub fn never_store(&self) -> bool {
        self.never_store
    }

    pub fn override_redeliver(&mut self) {
        self.redelivered = true;
    }

    pub fn is_redelivered(&self) -> bool {
        self.redelivered
    }

    /// Record consumers (with their delivery counts) this message is being
    /// dispatched to.
    pub fn add_remote_interest<I>(&mut self, interests: I)
    where
        I: IntoIterator<Item = (ConsumerId, u32)>,
    {
        for (consumer, count) in interests {
            let entry = self.remote_interest.entry(consumer).or_insert(count);
            *entry = (*entry).max(count);
        }
    }

    /// Add interests without a known delivery count.
    pub fn add_interests<I>(&mut self, consumers: I)
    where
        I: IntoIterator<Item = ConsumerId>,
    {
        for consumer in consumers {
            self.remote_interest.entry(consumer).or_insert(0);
        }
    }

    pub fn remove_remote_interest(&mut self, consumer: &ConsumerId) -> Option<u32> {
        self.remote_interest.shift_remove(consumer)
    }

    pub fn remote_interest(&self) -> &IndexMap<ConsumerId, u32> {
        &self.remote_interest
    }

    pub fn add_delivered_ack(&mut self, consumer: ConsumerId) {
        self.delivered_acks.insert(consumer);
    }

    pub fn has_delivered_ack(&self, consumer: &ConsumerId) -> bool {
        self.delivered_acks.contains(consumer)
    }

    pub fn mark_in_delivery(&mut self, consumer: ConsumerId) {
        self.in_delivery.insert(consumer);
    }

    pub fn is_in_delivery(&self, consumer: &ConsumerId) -> bool {
        self.in_delivery.contains(consumer)
    }
}

#[derive(Debug)]
pub struct MessageReference {
    packet: Packet,
    state: Mutex<RefState>,
}

pub type RefWriteGuard<'a> = MutexGuard<'a, RefState>;

impl MessageReference {
    pub fn new(packet: Packet, home: Option<BrokerAddress>) -> Self {
        Self {
            packet,
            state: Mutex::new(RefState::new(home)),
        }
    }

    pub fn id(&self) -> SysMessageId {
        self.packet.id
    }

    pub fn destination(&self) -> &DestinationId {
        &self.packet.destination
    }

    pub fn packet(&self) -> &Packet {
        &self.packet
    }

    pub fn size(&self) -> u64 {
        self.packet.size()
    }

    /// Acquire the per-reference write lock.
    pub fn write(&self) -> RefWriteGuard<'_> {
        self.state.lock()
    }

    pub fn home(&self) -> Option<BrokerAddress> {
        self.state.lock().home.clone()
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().is_active()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.state.lock().lifecycle
    }

    pub fn interest_snapshot(&self) -> Vec<(ConsumerId, u32)> {
        self.state
            .lock()
            .remote_interest
            .iter()
            .map(|(c, n)| (*c, *n))
            .collect()
    }

    pub fn has_delivered_ack(&self, consumer: &ConsumerId) -> bool {
        self.state.lock().has_delivered_ack(consumer)
    }

    pub fn is_redelivered(&self) -> bool {
        self.state.lock().redelivered
    }

    /// Recorded delivery count for `consumer` or its stored durable id,
    /// whichever is higher.
    pub fn delivery_count(&self, consumer: ConsumerId, stored: Option<ConsumerId>) -> u32 {
        let state = self.state.lock();
        [Some(consumer), stored]
            .into_iter()
            .flatten()
            .filter_map(|c| state.remote_interest.get(&c).copied())
            .max()
            .unwrap_or(0)
    }

    /// Flag the message redelivered and raise the delivery count of every
    /// recorded interest among `consumer` and `stored`, so the next send is
    /// new delivery work for the receiving broker.
    pub fn redeliver(&self, consumer: ConsumerId, stored: Option<ConsumerId>) {
        let mut state = self.state.lock();
        state.redelivered = true;
        for id in [Some(consumer), stored.filter(|s| *s != consumer)].into_iter().flatten() {
            state.in_delivery.remove(&id);
            if let Some(count) = state.remote_interest.get_mut(&id) {
                *count = count.saturating_add(1);
            }
        }
    }

    pub fn is_in_delivery(&self, consumer: &ConsumerId) -> bool {
        self.state.lock().is_in_delivery(consumer)
    }

    /// Acknowledge `consumer`'s interest (and that of its stored durable id).
    ///
    /// Returns true when this removed the last outstanding interest, i.e. the
    /// caller should now remove the message from its destination(s).
    pub fn acknowledged(&self, consumer: ConsumerId, stored: Option<ConsumerId>) -> bool {
        let mut state = self.state.lock();
        if !state.is_active() {
            return false;
        }
        let mut removed = state.remote_interest.shift_remove(&consumer).is_some();
        if let Some(stored) = stored.filter(|s| *s != consumer) {
            removed |= state.remote_interest.shift_remove(&stored).is_some();
            state.in_delivery.remove(&stored);
        }
        state.in_delivery.remove(&consumer);
        state.delivered_acks.remove(&consumer);
        removed && state.remote_interest.is_empty()
    }

    /// Drop every trace of a consumer that disappeared before delivery.
    pub fn remove_remote_consumer(&self, stored: Option<ConsumerId>, consumer: ConsumerId) {
        let mut state = self.state.lock();
        state.remote_interest.shift_remove(&consumer);
        state.in_delivery.remove(&consumer);
        state.delivered_acks.remove(&consumer);
        if let Some(stored) = stored {
            state.remote_interest.shift_remove(&stored);
            state.in_delivery.remove(&stored);
        }
    }

    pub fn mark_in_delivery(&self, consumer: ConsumerId) {
        self.state.lock().mark_in_delivery(consumer);
    }

    pub fn remove_in_delivery(&self, consumer: ConsumerId) {
        self.state.lock().in_delivery.remove(&consumer);
    }

    pub fn update_delivery_count(&self, consumer: ConsumerId, count: u32) {
        let mut state = self.state.lock();
        if let Some(current) = state.remote_interest.get_mut(&consumer) {
            *current = (*current).max(count.max(1));
        }
    }

    /// Mark the message dead for `consumer`, dropping its interest. The
    /// first reason recorded wins. Returns false if the reference is no
    /// longer active.
    pub fn mark_dead(&self, consumer: ConsumerId, reason: RemoveReason) -> bool {
        let mut state = self.state.lock();
        if !state.is_active() {
            return false;
        }
        state.remote_interest.shift_remove(&consumer);
        state.in_delivery.remove(&consumer);
        state.delivered_acks.remove(&consumer);
        state.dead_reason.get_or_insert(reason);
        true
    }

    /// Dead for every consumer it was routed to.
    pub fn is_dead(&self) -> bool {
        let state = self.state.lock();
        state.dead_reason.is_some() && state.remote_interest.is_empty()
    }
}

/// Concurrent map from message id to its unique reference.
#[derive(Debug, Default)]
pub struct ReferenceStore {
    refs: DashMap<SysMessageId, Arc<MessageReference>>,
}

impl ReferenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, id: &SysMessageId) -> Option<Arc<MessageReference>> {
        self.refs.get(id).map(|entry| entry.value().clone())
    }

    /// Return the reference for `packet.id`, creating it with `home` if absent.
    ///
    /// The boolean is true when this call created the reference. An existing
    /// reference is returned unchanged, whatever its state.
    pub fn create_or_get(
        &self,
        packet: &Packet,
        home: Option<BrokerAddress>,
    ) -> (Arc<MessageReference>, bool) {
        match self.refs.entry(packet.id) {
            dashmap::mapref::entry::Entry::Occupied(entry) => (entry.get().clone(), false),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let reference = Arc::new(MessageReference::new(packet.clone(), home));
                entry.insert(reference.clone());
                (reference, true)
            }
        }
    }

    /// Forget `reference` without touching its state. Only removes the entry
    /// if it still maps to this exact instance.
    pub fn discard(&self, reference: &Arc<MessageReference>) -> bool {
        self.refs
            .remove_if(&reference.id(), |_, current| Arc::ptr_eq(current, reference))
            .is_some()
    }

    /// Post-acknowledged removal: the message is done everywhere.
    pub fn destroy(&self, reference: &Arc<MessageReference>) -> bool {
        reference.write().mark_destroyed();
        self.discard(reference)
    }

    /// Invalidate a reference (destination deleted, takeover).
    pub fn invalidate(&self, reference: &Arc<MessageReference>) -> bool {
        reference.write().mark_invalid();
        self.discard(reference)
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    pub fn snapshot(&self) -> Vec<Arc<MessageReference>> {
        self.refs.iter().map(|entry| entry.value().clone()).collect()
    }
}
