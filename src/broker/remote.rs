//! Remote consumer acknowledgment engine
//!
//! Tracks consumers hosted on peer brokers that receive messages owned by
//! this broker, and reconciles the acknowledgments those peers send back.
//!
//! - every message handed to a remote consumer (unless it does not ack)
//!   gets an ack entry keyed by (message, consumer)
//! - `acknowledge` and `acknowledge_batch` consume entries; a replay finds no
//!   entry and is a no-op
//! - a consumer closing inside an uncommitted transaction leaves its entries
//!   behind as pending, until the transaction's outcome is known
//! - prepared two-phase transactions are logged in the `TxnLog` so they
//!   survive a restart
//!
//! Concurrency notes:
//! - one mutex guards the entry tables; it is never held while calling the
//!   broadcaster or removing messages from destinations
//! - lock order is entry tables, then reference

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::broadcast::{AckKind, AckProps, Broadcaster, Release};
use crate::broker::context::BrokerContext;
use crate::broker::destination::{Destination, RemoveReason};
use crate::broker::message::{BrokerAddress, ConnectionId, ConsumerId, SysMessageId, TransactionId};
use crate::broker::reference::MessageReference;
use crate::consumer::{AckMode, Consumer, ConsumerSpec, Delivery};
use crate::persistence::{RemoteTxnState, TxnLog};
use crate::utils::{BrokerError, Result};

/// Transactional acknowledgments a closing consumer still owes, as
/// transaction → message → delivery count.
///
/// Messages listed under [`NO_TRANSACTION`] were consumed outside any
/// transaction; only their delivery count is kept.
pub type PendingTxnMessages = IndexMap<TransactionId, IndexMap<SysMessageId, u32>>;

pub const NO_TRANSACTION: TransactionId = TransactionId(0);

type EntryKey = (SysMessageId, ConsumerId);

#[derive(Debug, Clone)]
struct AckEntry {
    id: SysMessageId,
    consumer: ConsumerId,
    stored: Option<ConsumerId>,
    broker: BrokerAddress,
    reference: Weak<MessageReference>,
    txn: Option<TransactionId>,
    pending_started: Option<Instant>,
    consumed: bool,
}

impl AckEntry {
    fn new(reference: &Arc<MessageReference>, consumer: &Consumer) -> Self {
        Self {
            id: reference.id(),
            consumer: consumer.id(),
            stored: consumer.stored_id(),
            broker: consumer.broker().clone(),
            reference: Arc::downgrade(reference),
            txn: None,
            pending_started: None,
            consumed: false,
        }
    }

    fn key(&self) -> EntryKey {
        (self.id, self.consumer)
    }

    fn stored_or_consumer(&self) -> ConsumerId {
        self.stored.unwrap_or(self.consumer)
    }

    fn is_pending_timeout(&self, timeout: Duration) -> bool {
        self.pending_started
            .is_some_and(|started| started.elapsed() >= timeout)
    }

    fn update_consumed(&mut self, delivery_count: u32) {
        if self.consumed {
            return;
        }
        if let Some(reference) = self.reference.upgrade() {
            reference.update_delivery_count(self.stored_or_consumer(), delivery_count.max(1));
            self.consumed = true;
        }
    }
}

impl fmt::Display for AckEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}", self.id, self.consumer)?;
        if let Some(stored) = self.stored {
            write!(f, ", {stored}")?;
        }
        write!(f, "]")?;
        if let Some(txn) = self.txn {
            write!(f, " {txn}")?;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct PendingConsumer {
    connection: ConnectionId,
    broker: BrokerAddress,
    direct: bool,
    txns: IndexMap<TransactionId, IndexSet<SysMessageId>>,
}

#[derive(Debug, Default)]
struct Tracking {
    delivered: IndexMap<EntryKey, AckEntry>,
    pending: HashMap<ConsumerId, PendingConsumer>,
}

impl Tracking {
    fn cleanup_pending(&mut self, consumer: ConsumerId, id: &SysMessageId) {
        let Some(pending) = self.pending.get_mut(&consumer) else {
            return;
        };
        let emptied = pending
            .txns
            .iter_mut()
            .find_map(|(txn, ids)| ids.shift_remove(id).then_some((*txn, ids.is_empty())));
        if let Some((txn, true)) = emptied {
            pending.txns.shift_remove(&txn);
            if pending.txns.is_empty() {
                self.pending.remove(&consumer);
            }
        }
    }

    fn pending_keys(&self, txn: TransactionId) -> Vec<EntryKey> {
        let mut keys = Vec::new();
        for (consumer, pending) in &self.pending {
            if let Some(ids) = pending.txns.get(&txn) {
                keys.extend(ids.iter().map(|id| (*id, *consumer)));
            }
        }
        keys
    }
}

/// What one pass of the pending-transaction check did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PendingCheck {
    pub transaction_inquiries: usize,
    pub prepared_inquiries: usize,
    pub purged: usize,
}

#[derive(Debug)]
pub struct RemoteConsumers {
    ctx: Arc<BrokerContext>,
    broadcaster: Arc<dyn Broadcaster>,
    txn_log: TxnLog,
    consumers: DashMap<ConsumerId, Arc<Consumer>>,
    tracking: Mutex<Tracking>,
    tasks: DashMap<ConsumerId, JoinHandle<()>>,
    valid: AtomicBool,
    shutdown: watch::Sender<bool>,
}

/// Topic consumers without a durable subscription receive messages directly
/// and acknowledge on close instead of returning messages.
fn receives_directly(consumer: &Consumer) -> bool {
    !consumer.destination().is_queue() && consumer.spec().subscription.is_none()
}

impl RemoteConsumers {
    pub fn new(
        ctx: Arc<BrokerContext>,
        broadcaster: Arc<dyn Broadcaster>,
        txn_log: TxnLog,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            ctx,
            broadcaster,
            txn_log,
            consumers: DashMap::new(),
            tracking: Mutex::new(Tracking::default()),
            tasks: DashMap::new(),
            valid: AtomicBool::new(true),
            shutdown,
        })
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub fn txn_log(&self) -> &TxnLog {
        &self.txn_log
    }

    pub fn get(&self, id: &ConsumerId) -> Option<Arc<Consumer>> {
        self.consumers.get(id).map(|c| c.value().clone())
    }

    /// Number of delivered, not yet acknowledged entries.
    pub fn delivered_count(&self) -> usize {
        self.tracking.lock().delivered.len()
    }

    pub fn has_entry(&self, id: &SysMessageId, consumer: &ConsumerId) -> bool {
        self.tracking.lock().delivered.contains_key(&(*id, *consumer))
    }

    pub fn entry_transaction(&self, id: &SysMessageId, consumer: &ConsumerId) -> Option<TransactionId> {
        self.tracking
            .lock()
            .delivered
            .get(&(*id, *consumer))
            .and_then(|e| e.txn)
    }

    pub fn is_pending(&self, consumer: &ConsumerId) -> bool {
        self.tracking.lock().pending.contains_key(consumer)
    }

    fn consumer_destinations(&self, consumer: &ConsumerSpec) -> Result<Vec<Arc<Destination>>> {
        if consumer.destination.is_wildcard() {
            return self.ctx.destinations.resolve_wildcard(&consumer.destination);
        }
        match self.ctx.destinations.get_or_auto_create(&consumer.destination)? {
            Some(destination) => Ok(vec![destination]),
            None => Err(BrokerError::DestinationUnavailable(
                consumer.destination.clone(),
            )),
        }
    }

    /// Register a consumer hosted on a peer and start its delivery loop.
    pub fn add_consumer(self: &Arc<Self>, spec: ConsumerSpec) -> Result<Arc<Consumer>> {
        if self.consumers.contains_key(&spec.id) {
            return Err(BrokerError::ConsumerAlreadyAdded(spec.id));
        }
        let runtime = tokio::runtime::Handle::try_current()?;
        let destinations = self.consumer_destinations(&spec)?;

        let direct = !spec.destination.is_queue() && spec.subscription.is_none();
        let credit = if direct {
            None
        } else {
            Some(self.ctx.settings.cluster.consumer_flow_limit.max(1))
        };

        let (consumer, deliveries) = self.ctx.consumers.register(spec, credit)?;
        self.consumers.insert(consumer.id(), consumer.clone());
        for destination in &destinations {
            destination.attach_consumer(consumer.id());
        }

        let engine = Arc::clone(self);
        let task = runtime.spawn(engine.delivery_loop(consumer.clone(), deliveries));
        self.tasks.insert(consumer.id(), task);

        info!(
            "Added remote consumer {} on {} from {}",
            consumer.id(),
            consumer.destination(),
            consumer.broker()
        );
        Ok(consumer)
    }

    async fn delivery_loop(
        self: Arc<Self>,
        consumer: Arc<Consumer>,
        mut deliveries: UnboundedReceiver<Delivery>,
    ) {
        let mut shutdown = self.shutdown.subscribe();
        let mut undelivered = Vec::new();
        let stored = consumer.stored_id().unwrap_or(consumer.id());

        loop {
            let delivery = tokio::select! {
                delivery = deliveries.recv() => delivery,
                _ = consumer.flow_changed() => {
                    if consumer.is_valid() && self.is_valid() {
                        continue;
                    }
                    None
                }
            };
            let Some(delivery) = delivery else {
                break;
            };
            delivery.reference.mark_in_delivery(stored);
            if !self.wait_for_credit(&consumer, &mut shutdown).await {
                undelivered.push(delivery);
                break;
            }
            self.send_to_remote(&consumer, &delivery.reference);
            consumer.delivery_done();
        }

        deliveries.close();
        while let Ok(delivery) = deliveries.try_recv() {
            undelivered.push(delivery);
        }
        for delivery in &undelivered {
            delivery.reference.remove_in_delivery(stored);
            consumer.delivery_done();
        }
        debug!(
            "Delivery loop for {} stopped, {} undelivered",
            consumer.id(),
            undelivered.len()
        );
    }

    async fn wait_for_credit(
        &self,
        consumer: &Consumer,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        loop {
            if !consumer.is_valid() || !self.is_valid() {
                return false;
            }
            if consumer.take_credit() {
                return true;
            }
            tokio::select! {
                _ = consumer.flow_changed() => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    fn send_to_remote(&self, consumer: &Arc<Consumer>, reference: &Arc<MessageReference>) -> bool {
        {
            let mut tracking = self.tracking.lock();
            if !self.consumers.contains_key(&consumer.id()) {
                debug!("Ignoring removed consumer {} for {}", consumer.id(), reference.id());
                return false;
            }
            if consumer.ack_mode() != AckMode::NoAck {
                let entry = AckEntry::new(reference, consumer);
                tracking.delivered.insert(entry.key(), entry);
            }
        }
        let delivered_ack = reference.has_delivered_ack(&consumer.id()) || consumer.is_flow_blocked();
        self.broadcaster
            .send_message(reference, std::slice::from_ref(consumer), delivered_ack);
        true
    }

    /// Send a locally owned message straight to `consumers`, recording an ack
    /// entry for each.
    pub fn forward_message(&self, reference: &Arc<MessageReference>, consumers: &[Arc<Consumer>]) {
        for consumer in consumers {
            if consumer.ack_mode() == AckMode::NoAck {
                continue;
            }
            let registered = {
                let mut tracking = self.tracking.lock();
                let registered = self.consumers.contains_key(&consumer.id());
                if registered {
                    let entry = AckEntry::new(reference, consumer);
                    tracking.delivered.insert(entry.key(), entry);
                }
                registered
            };
            if !registered {
                debug!(
                    "Forwarding {}: ignoring removed consumer {}",
                    reference.id(),
                    consumer.id()
                );
                if reference.acknowledged(consumer.id(), consumer.stored_id()) {
                    self.ctx.remove_message(reference, RemoveReason::Acknowledged);
                }
            }
        }
        self.broadcaster.send_message(reference, consumers, false);
    }

    fn acknowledge_entry(&self, entry: &AckEntry) {
        let reference = entry
            .reference
            .upgrade()
            .or_else(|| self.ctx.references.lookup(&entry.id));
        let Some(reference) = reference else {
            return;
        };
        if reference.acknowledged(entry.consumer, entry.stored) {
            self.ctx.remove_message(&reference, RemoveReason::Acknowledged);
        }
    }

    /// Give a message back to its destination so it can be redelivered.
    fn return_to_destination(&self, reference: &Arc<MessageReference>, stored: ConsumerId) {
        reference.redeliver(stored, None);
        if !reference.is_active() {
            return;
        }
        for destination in self.ctx.destinations_of(reference) {
            if let Err(e) = destination.enqueue(reference, false, false) {
                warn!(
                    "Unable to return {} to {}: {}",
                    reference.id(),
                    destination.id(),
                    e
                );
            }
        }
        debug!("Returned {} for redelivery ({})", reference.id(), stored);
    }

    /// Handle a single acknowledgment from the broker hosting `consumer`.
    pub fn acknowledge(
        &self,
        kind: AckKind,
        id: SysMessageId,
        consumer: ConsumerId,
        props: Option<AckProps>,
    ) -> Result<bool> {
        let key = (id, consumer);
        match kind {
            AckKind::Delivered => {
                if let Some(c) = self.ctx.consumers.get(&consumer) {
                    let limit = self.ctx.settings.cluster.consumer_flow_limit.max(1);
                    let prefetch = match props.as_ref().and_then(|p| p.prefetch) {
                        Some(p) if p > 0 && p <= limit => p,
                        _ => limit,
                    };
                    c.resume_flow(Some(prefetch));
                }
                Ok(true)
            }
            AckKind::Ignored => {
                let props = props.unwrap_or_default();
                if let Some(release) = props.release {
                    self.release(release, key);
                } else if props.not_sent_to_remote {
                    let mut tracking = self.tracking.lock();
                    let gone = tracking.delivered.get(&key).map(|e| {
                        e.reference
                            .upgrade()
                            .is_none_or(|r| !r.is_active())
                    });
                    if gone == Some(true) {
                        debug!("Cleaning up message {} not sent to {}", id, consumer);
                        tracking.delivered.shift_remove(&key);
                    }
                } else {
                    debug!("Ignored ack for [{}, {}] left to consumer close", id, consumer);
                }
                Ok(true)
            }
            AckKind::Acknowledged => {
                let entry = {
                    let mut tracking = self.tracking.lock();
                    let entry = tracking.delivered.shift_remove(&key);
                    tracking.cleanup_pending(consumer, &id);
                    entry
                };
                if let Some(entry) = entry {
                    self.acknowledge_entry(&entry);
                }
                Ok(true)
            }
            AckKind::Dead | AckKind::Undeliverable => {
                let entry = {
                    let mut tracking = self.tracking.lock();
                    if let Some(txn) = tracking.delivered.get(&key).and_then(|e| e.txn) {
                        warn!("Ignoring dead notice for {} prepared in {}", id, txn);
                        return Ok(false);
                    }
                    let entry = tracking.delivered.shift_remove(&key);
                    tracking.cleanup_pending(consumer, &id);
                    entry
                };
                let handled = match entry {
                    None => {
                        debug!("Dead message {}: no entry for {}", id, consumer);
                        false
                    }
                    Some(entry) => {
                        let reference = entry
                            .reference
                            .upgrade()
                            .or_else(|| self.ctx.references.lookup(&id));
                        if let Some(reference) = reference {
                            reference.remove_in_delivery(entry.stored_or_consumer());
                            self.remove_dead(kind, &reference, &entry, props.as_ref());
                        }
                        true
                    }
                };
                if props.as_ref().is_some_and(|p| p.delivered_ack) {
                    if let Some(c) = self.ctx.consumers.get(&consumer) {
                        c.resume_flow(Some(1));
                    }
                }
                Ok(handled)
            }
            AckKind::Prepare | AckKind::RolledBack => Err(BrokerError::Protocol(format!(
                "{kind} acknowledgment for [{id}, {consumer}] requires a transaction"
            ))),
        }
    }

    fn release(&self, release: Release, key: EntryKey) {
        let (id, consumer) = key;
        let (entry, active_consumer) = {
            let mut tracking = self.tracking.lock();
            match release {
                Release::Active(txn) => {
                    let active = tracking.delivered.get(&key).and_then(|e| {
                        let registered = self.get(&e.consumer)?;
                        (e.pending_started.is_none() && e.txn == Some(txn)).then_some(registered)
                    });
                    match active {
                        Some(c) => (tracking.delivered.shift_remove(&key), Some(c)),
                        None => (None, None),
                    }
                }
                _ => {
                    let entry = tracking.delivered.shift_remove(&key);
                    tracking.cleanup_pending(consumer, &id);
                    (entry, None)
                }
            }
        };

        let Some(entry) = entry else {
            debug!("Releasing [{}, {}] ({:?}): entry not found", id, consumer, release);
            return;
        };
        let Some(reference) = entry.reference.upgrade() else {
            return;
        };

        if let Some(active) = active_consumer {
            info!("Redelivering {} to active remote consumer {}", id, active.id());
            reference.redeliver(entry.consumer, entry.stored);
            active.route_message(&reference, true);
            return;
        }
        if entry.stored.is_none_or(|s| s == entry.consumer) {
            if reference.acknowledged(entry.consumer, entry.stored) {
                self.ctx.remove_message(&reference, RemoveReason::Acknowledged);
            }
            return;
        }
        self.return_to_destination(&reference, entry.stored_or_consumer());
    }

    fn remove_dead(
        &self,
        kind: AckKind,
        reference: &Arc<MessageReference>,
        entry: &AckEntry,
        props: Option<&AckProps>,
    ) -> bool {
        let reason = if kind == AckKind::Undeliverable {
            RemoveReason::Undeliverable
        } else {
            RemoveReason::Dead
        };
        let deliveries = props
            .and_then(|p| p.delivery_count)
            .unwrap_or_else(|| reference.delivery_count(entry.consumer, entry.stored));
        if !reference.mark_dead(entry.consumer, reason) {
            return false;
        }
        let props = props.cloned().unwrap_or_default();
        debug!(
            "Remote consumer {} gave up on {} after {} deliveries ({} on {})",
            entry.consumer,
            reference.id(),
            deliveries,
            props.dead_reason.as_deref().unwrap_or("no reason"),
            props.dead_broker.as_deref().unwrap_or("unknown broker")
        );
        if reference.is_dead() {
            info!(
                "Removing dead message {} for remote consumer {} ({}): {}",
                reference.id(),
                entry.consumer,
                reason,
                props.dead_comment.as_deref().unwrap_or("none")
            );
            self.ctx.remove_message(reference, reason);
        }
        true
    }

    /// Handle a transactional acknowledgment batch.
    pub fn acknowledge_batch(
        &self,
        kind: AckKind,
        ids: &[SysMessageId],
        consumers: &[ConsumerId],
        props: Option<AckProps>,
        txn: Option<TransactionId>,
        txn_home: Option<&BrokerAddress>,
    ) -> Result<()> {
        let Some(txn) = txn else {
            return Err(BrokerError::Protocol(format!(
                "{kind} batch acknowledgment without a transaction"
            )));
        };
        if ids.len() != consumers.len() {
            return Err(BrokerError::Protocol(format!(
                "{kind} batch for {txn} has {} messages but {} consumers",
                ids.len(),
                consumers.len()
            )));
        }
        let pairs: Vec<EntryKey> = ids.iter().copied().zip(consumers.iter().copied()).collect();

        match kind {
            AckKind::Prepare => self.prepare(txn, txn_home, pairs),
            AckKind::RolledBack => self.rollback(txn, txn_home),
            AckKind::Acknowledged => self.commit(txn, props),
            other => Err(BrokerError::Protocol(format!(
                "unexpected {other} acknowledgment for {txn}"
            ))),
        }
    }

    fn prepare(
        &self,
        txn: TransactionId,
        txn_home: Option<&BrokerAddress>,
        pairs: Vec<EntryKey>,
    ) -> Result<()> {
        let mut tracking = self.tracking.lock();
        let mut missing = Vec::new();
        for key in &pairs {
            let state = tracking
                .delivered
                .get(key)
                .map(|e| (e.txn, e.reference.strong_count() > 0));
            match state {
                None => {
                    warn!("[{}, {}] not found preparing {}, maybe rerouted", key.0, key.1, txn);
                    missing.push(*key);
                }
                Some((Some(other), _)) => {
                    warn!("[{}, {}] preparing {} conflicts with {}", key.0, key.1, txn, other);
                    missing.push(*key);
                }
                Some((None, false)) => {
                    warn!("Unable to prepare [{}, {}] in {}: message removed", key.0, key.1, txn);
                    tracking.delivered.shift_remove(key);
                    missing.push(*key);
                }
                Some((None, true)) => {}
            }
        }
        if !missing.is_empty() {
            return Err(BrokerError::AckEntryNotFound {
                txn,
                pairs: missing,
            });
        }

        self.txn_log.log_prepared(txn, txn_home.cloned(), pairs.clone())?;
        for key in &pairs {
            if let Some(entry) = tracking.delivered.get_mut(key) {
                entry.txn = Some(txn);
            }
        }
        info!("Prepared remote transaction {} with {} acks", txn, pairs.len());
        Ok(())
    }

    fn rollback(&self, txn: TransactionId, txn_home: Option<&BrokerAddress>) -> Result<()> {
        let Some(record) = self.txn_log.get(txn)? else {
            return self.rollback_not_prepared(txn, txn_home);
        };
        if record.state != RemoteTxnState::Prepared {
            debug!("Remote transaction {} already {:?}", txn, record.state);
            return Ok(());
        }
        self.txn_log.update_state(txn, RemoteTxnState::RolledBack)?;

        let mut released = Vec::new();
        {
            let mut tracking = self.tracking.lock();
            for key in &record.entries {
                let Some(entry) = tracking.delivered.get_mut(key) else {
                    debug!("[{}, {}] not found rolling back {}", key.0, key.1, txn);
                    continue;
                };
                if entry.txn != Some(txn) {
                    debug!("[{}, {}] in conflict rolling back {}", key.0, key.1, txn);
                    continue;
                }
                if self.consumers.contains_key(&key.1) {
                    entry.txn = None;
                } else if let Some(entry) = tracking.delivered.shift_remove(key) {
                    tracking.cleanup_pending(key.1, &key.0);
                    released.push(entry);
                }
            }
        }

        for entry in &released {
            if let Some(reference) = self.ctx.references.lookup(&entry.id) {
                self.return_to_destination(&reference, entry.stored_or_consumer());
            }
        }
        info!(
            "Rolled back remote transaction {} from {}, {} messages released",
            txn,
            txn_home.map_or_else(|| "unknown".to_string(), |h| h.to_string()),
            released.len()
        );
        Ok(())
    }

    fn rollback_not_prepared(
        &self,
        txn: TransactionId,
        txn_home: Option<&BrokerAddress>,
    ) -> Result<()> {
        let released: Vec<AckEntry> = {
            let mut tracking = self.tracking.lock();
            let mut released = Vec::new();
            for key in tracking.pending_keys(txn) {
                if self.consumers.contains_key(&key.1) {
                    continue;
                }
                if let Some(entry) = tracking.delivered.shift_remove(&key) {
                    released.push(entry);
                }
                tracking.cleanup_pending(key.1, &key.0);
            }
            released
        };

        if released.is_empty() {
            info!(
                "Remote transaction {} from {} to roll back not found",
                txn,
                txn_home.map_or_else(|| "unknown".to_string(), |h| h.to_string())
            );
            return Ok(());
        }
        for entry in &released {
            match self.ctx.references.lookup(&entry.id) {
                Some(reference) => {
                    self.return_to_destination(&reference, entry.stored_or_consumer())
                }
                None => debug!("{} gone rolling back {}", entry, txn),
            }
        }
        Ok(())
    }

    fn commit(&self, txn: TransactionId, props: Option<AckProps>) -> Result<()> {
        let Some(record) = self.txn_log.get(txn)? else {
            return Err(BrokerError::TransactionNotFound(txn));
        };
        match record.state {
            RemoteTxnState::Committed => {
                debug!("Remote transaction {} already committed", txn);
                return Ok(());
            }
            RemoteTxnState::RolledBack => {
                warn!("Ignoring commit of rolled back remote transaction {}", txn);
                return Ok(());
            }
            RemoteTxnState::Prepared => {}
        }
        self.txn_log.update_state(txn, RemoteTxnState::Committed)?;
        for (id, consumer) in &record.entries {
            self.acknowledge(AckKind::Acknowledged, *id, *consumer, props.clone())?;
        }
        info!("Committed remote transaction {} ({} acks)", txn, record.entries.len());
        Ok(())
    }

    /// Remove a remote consumer.
    ///
    /// Entries named in `pending` stay behind, tagged with their transaction,
    /// until that transaction commits or rolls back. Other entries are
    /// released: directly fed topic consumers acknowledge them, everyone else
    /// returns them to their destination. With `cleanup` nothing is kept.
    pub fn remove_consumer(
        &self,
        id: ConsumerId,
        pending: Option<&PendingTxnMessages>,
        cleanup: bool,
    ) -> Result<()> {
        let consumer = self.consumers.remove(&id).map(|(_, c)| c);
        if consumer.is_none() && !cleanup {
            return Ok(());
        }

        if let Some(c) = &consumer {
            c.pause();
            self.ctx.consumers.remove(&id);
            if let Ok(destinations) = self.consumer_destinations(c.spec()) {
                for destination in destinations {
                    destination.detach_consumer(&id);
                }
            }
            self.tasks.remove(&id);
        }

        let mut to_ack = Vec::new();
        let mut to_return = Vec::new();
        let mut kept = 0;
        {
            let mut tracking = self.tracking.lock();
            let keys: Vec<EntryKey> = tracking
                .delivered
                .keys()
                .filter(|(_, c)| *c == id)
                .copied()
                .collect();
            let mut my_pending: IndexMap<TransactionId, IndexSet<SysMessageId>> = IndexMap::new();
            let direct = match &consumer {
                Some(c) => Some(receives_directly(c)),
                None => tracking.pending.get(&id).map(|p| p.direct),
            };

            for key in keys {
                let Some(entry) = tracking.delivered.get_mut(&key) else {
                    continue;
                };
                if let Some(pending) = pending {
                    let mut found = false;
                    for (txn, counts) in pending {
                        let Some(count) = counts.get(&entry.id) else {
                            continue;
                        };
                        if *txn == NO_TRANSACTION {
                            entry.update_consumed(*count);
                            continue;
                        }
                        entry.update_consumed(*count);
                        if !cleanup && entry.txn.is_none() {
                            my_pending.entry(*txn).or_default().insert(entry.id);
                            found = true;
                        }
                        break;
                    }
                    if found {
                        continue;
                    }
                }
                if entry.txn.is_some() {
                    // prepared: the transaction outcome decides
                    continue;
                }
                let Some(mut entry) = tracking.delivered.shift_remove(&key) else {
                    continue;
                };
                if cleanup {
                    entry.update_consumed(1);
                }
                if direct == Some(false) {
                    to_return.push(entry);
                } else {
                    to_ack.push(entry);
                }
            }

            if cleanup || pending.is_none() {
                tracking.pending.remove(&id);
            } else if let (Some(c), false) = (&consumer, my_pending.is_empty()) {
                let now = Instant::now();
                for (txn, ids) in &my_pending {
                    for msg in ids {
                        if let Some(entry) = tracking.delivered.get_mut(&(*msg, id)) {
                            entry.pending_started = Some(now);
                            debug!("{} pending on {}", entry, txn);
                            kept += 1;
                        }
                    }
                }
                tracking.pending.insert(
                    id,
                    PendingConsumer {
                        connection: c.connection(),
                        broker: c.broker().clone(),
                        direct: direct.unwrap_or(true),
                        txns: my_pending,
                    },
                );
            }
        }

        for entry in &to_ack {
            self.acknowledge_entry(entry);
        }
        for entry in &to_return {
            if let Some(reference) = entry.reference.upgrade() {
                self.return_to_destination(&reference, entry.stored_or_consumer());
            }
        }
        info!(
            "Removed remote consumer {} ({} acknowledged, {} returned, {} pending)",
            id,
            to_ack.len(),
            to_return.len(),
            kept
        );
        Ok(())
    }

    fn remove_matching<F>(&self, matches: F) -> Result<usize>
    where
        F: Fn(ConnectionId, &BrokerAddress) -> bool,
    {
        let mut ids: BTreeSet<ConsumerId> = self
            .consumers
            .iter()
            .filter(|c| matches(c.connection(), c.broker()))
            .map(|c| *c.key())
            .collect();
        {
            let tracking = self.tracking.lock();
            ids.extend(
                tracking
                    .pending
                    .iter()
                    .filter(|(_, p)| matches(p.connection, &p.broker))
                    .map(|(id, _)| *id),
            );
        }
        for id in &ids {
            self.remove_consumer(*id, None, true)?;
        }
        Ok(ids.len())
    }

    /// Remove every remote consumer (open or pending) of `connection`.
    pub fn remove_consumers(&self, connection: ConnectionId) -> Result<usize> {
        self.remove_matching(|c, _| c == connection)
    }

    /// Remove every remote consumer hosted on the failed broker.
    pub fn broker_down(&self, address: &BrokerAddress) -> Result<usize> {
        let removed = self.remove_matching(|_, broker| broker.matches_down(address))?;
        info!("Broker {} down: removed {} remote consumers", address, removed);
        Ok(removed)
    }

    /// Send inquiries for transactions that have kept entries pending longer
    /// than `timeout`, and for prepared transactions older than `timeout`.
    pub fn run_pending_check(&self, timeout: Duration) -> Result<PendingCheck> {
        let inquiries: BTreeSet<(TransactionId, BrokerAddress)> = {
            let tracking = self.tracking.lock();
            let mut inquiries = BTreeSet::new();
            for (consumer, pending) in &tracking.pending {
                for (txn, ids) in &pending.txns {
                    let timed_out = ids.iter().any(|id| {
                        tracking
                            .delivered
                            .get(&(*id, *consumer))
                            .is_some_and(|e| e.is_pending_timeout(timeout))
                    });
                    if timed_out {
                        inquiries.insert((*txn, pending.broker.clone()));
                    }
                }
            }
            inquiries
        };
        for (txn, broker) in &inquiries {
            self.broadcaster.send_transaction_inquiry(broker, *txn);
        }

        let age_ms = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
        let prepared = self.txn_log.prepared_older_than(age_ms)?;
        if !prepared.is_empty() {
            self.broadcaster.send_prepared_transaction_inquiries(&prepared);
        }
        let purged = self.txn_log.purge_finished_older_than(age_ms)?;

        Ok(PendingCheck {
            transaction_inquiries: inquiries.len(),
            prepared_inquiries: prepared.len(),
            purged,
        })
    }

    /// Periodically run the pending-transaction check until destroyed.
    pub async fn start_pending_check_loop(engine: Arc<RemoteConsumers>) {
        let interval = engine.ctx.settings.cluster.pending_check_interval();
        let timeout = Duration::from_secs(engine.ctx.settings.cluster.ack_wait_timeout_secs);
        let mut shutdown = engine.shutdown.subscribe();
        info!("Pending transaction check every {:?}", interval);

        while engine.is_valid() {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {}
            }
            if !engine.is_valid() {
                break;
            }
            match engine.run_pending_check(timeout) {
                Ok(report) => debug!("Pending transaction check: {:?}", report),
                Err(e) => warn!("Pending transaction check failed: {}", e),
            }
        }
        info!("Pending transaction check stopped");
    }

    pub fn debug_state(&self) -> BTreeMap<String, Value> {
        let mut state = BTreeMap::new();
        {
            let tracking = self.tracking.lock();
            state.insert(
                "remote.delivered_count".to_string(),
                json!(tracking.delivered.len()),
            );
            let delivered: Vec<String> = tracking.delivered.values().map(|e| e.to_string()).collect();
            state.insert("remote.delivered".to_string(), json!(delivered));

            let mut pending = serde_json::Map::new();
            for (consumer, p) in &tracking.pending {
                let txns: serde_json::Map<String, Value> = p
                    .txns
                    .iter()
                    .map(|(txn, ids)| {
                        let ids: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
                        (txn.to_string(), json!(ids))
                    })
                    .collect();
                pending.insert(consumer.to_string(), Value::Object(txns));
            }
            state.insert("remote.pending_count".to_string(), json!(tracking.pending.len()));
            state.insert("remote.pending".to_string(), Value::Object(pending));
        }

        let mut consumers: Vec<String> = self
            .consumers
            .iter()
            .map(|c| format!("{} {} from {}", c.id(), c.destination(), c.broker()))
            .collect();
        consumers.sort();
        state.insert("remote.consumers_count".to_string(), json!(consumers.len()));
        state.insert("remote.consumers".to_string(), json!(consumers));
        state.insert("remote.prepared_txns".to_string(), json!(self.txn_log.len()));
        state
    }

    /// Stop the delivery loops and the pending check loop.
    pub fn destroy(&self) {
        self.valid.store(false, Ordering::Release);
        self.shutdown.send_replace(true);
        let ids: Vec<ConsumerId> = self.tasks.iter().map(|t| *t.key()).collect();
        for id in ids {
            if let Some((_, task)) = self.tasks.remove(&id) {
                task.abort();
            }
        }
    }
}
