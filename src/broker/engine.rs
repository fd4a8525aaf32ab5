//! Cluster router
//!
//! Entry point for everything peer brokers send this broker:
//!
//! - `deliver_inbound_message`: route a message produced elsewhere to the
//!   local consumers the sender picked, queueing it on the matching
//!   destination(s) at most once
//! - `acknowledge` / `acknowledge_batch`: acknowledgments for messages this
//!   broker owns, handed to the remote consumer engine
//! - `broker_down`, `remove_consumer`, `remove_consumers`: membership changes
//!
//! The router holds no routing state of its own besides a best-effort set of
//! destinations it already warned about being full.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashSet;
use indexmap::IndexMap;
use serde_json::{Value, json};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

use crate::broker::broadcast::{AckKind, AckProps, Broadcaster};
use crate::broker::context::BrokerContext;
use crate::broker::destination::{Destination, Enqueued, RemoveReason};
use crate::broker::message::{
    BrokerAddress, ConnectionId, ConsumerId, ControlKind, DestinationId, Packet, SysMessageId,
    TransactionId,
};
use crate::broker::reference::{HomeChange, MessageReference, RefWriteGuard};
use crate::broker::remote::{PendingTxnMessages, RemoteConsumers};
use crate::consumer::{Consumer, ConsumerSpec, Delivery};
use crate::utils::{BrokerError, Result};

/// Outcome of the part of routing done under the reference lock.
struct Routed {
    destinations: Vec<Arc<Destination>>,
    deliver: Vec<Arc<Consumer>>,
    recreate: Vec<ConsumerId>,
}

#[derive(Debug)]
pub struct ClusterRouter {
    ctx: Arc<BrokerContext>,
    broadcaster: Arc<dyn Broadcaster>,
    remote: Arc<RemoteConsumers>,
    warned_full: DashSet<DestinationId>,
}

impl ClusterRouter {
    pub fn new(
        ctx: Arc<BrokerContext>,
        broadcaster: Arc<dyn Broadcaster>,
        remote: Arc<RemoteConsumers>,
    ) -> Self {
        Self {
            ctx,
            broadcaster,
            remote,
            warned_full: DashSet::new(),
        }
    }

    pub fn context(&self) -> &Arc<BrokerContext> {
        &self.ctx
    }

    pub fn remote(&self) -> &Arc<RemoteConsumers> {
        &self.remote
    }

    /// Register a consumer whose session is attached to this broker.
    pub fn register_local_consumer(
        &self,
        spec: ConsumerSpec,
    ) -> Result<(Arc<Consumer>, UnboundedReceiver<Delivery>)> {
        let destinations = if spec.destination.is_wildcard() {
            self.ctx.destinations.resolve_wildcard(&spec.destination)?
        } else {
            self.ctx
                .destinations
                .get_or_auto_create(&spec.destination)?
                .into_iter()
                .collect()
        };
        let (consumer, deliveries) = self.ctx.consumers.register(spec, None)?;
        for destination in &destinations {
            destination.attach_consumer(consumer.id());
        }
        Ok((consumer, deliveries))
    }

    /// Register a consumer hosted on a peer broker.
    pub fn add_consumer(&self, spec: ConsumerSpec) -> Result<Arc<Consumer>> {
        self.remote.add_consumer(spec)
    }

    /// Send a locally owned message to consumers hosted on peers.
    pub fn forward_message(&self, reference: &Arc<MessageReference>, consumers: &[Arc<Consumer>]) {
        self.remote.forward_message(reference, consumers);
    }

    /// Route a message arriving from `sender` to the local consumers in
    /// `targets` (consumer id → delivery count).
    ///
    /// Every target that cannot be served gets exactly one `Ignored`
    /// acknowledgment back to `sender`. Only a malformed destination is
    /// reported as an error.
    pub fn deliver_inbound_message(
        &self,
        packet: &Packet,
        targets: &IndexMap<ConsumerId, u32>,
        sender: &BrokerAddress,
        delivered_ack: bool,
    ) -> Result<()> {
        let mut valid = Vec::new();
        let mut ignored = Vec::new();
        for (id, count) in targets {
            match self.ctx.consumers.get(id) {
                Some(consumer) if consumer.is_valid() => valid.push((consumer, *count)),
                _ => ignored.push(*id),
            }
        }
        if valid.is_empty() {
            self.send_ignore_acks(packet.id, sender, &ignored);
            return Ok(());
        }

        let mut routed = None;
        for attempt in 0..2 {
            let (reference, created) = self
                .ctx
                .references
                .create_or_get(packet, Some(sender.clone()));
            let mut state = reference.write();
            if !state.is_active() {
                drop(state);
                self.ctx.references.discard(&reference);
                debug!(
                    "Reference {} went {:?} before routing (attempt {})",
                    packet.id,
                    reference.lifecycle(),
                    attempt + 1
                );
                continue;
            }
            let result = self.route_locked(
                packet,
                &reference,
                &mut state,
                created,
                &mut valid,
                &mut ignored,
                sender,
                delivered_ack,
            );
            drop(state);
            routed = Some((reference, result));
            break;
        }

        let Some((reference, result)) = routed else {
            warn!(
                "Ignoring remote message {} from {}: reference kept changing state",
                packet.id, sender
            );
            ignored.extend(valid.iter().map(|(c, _)| c.id()));
            self.send_ignore_acks(packet.id, sender, &ignored);
            return Ok(());
        };

        let routed = match result {
            Ok(routed) => routed,
            Err(e) => {
                self.send_ignore_acks(packet.id, sender, &ignored);
                return Err(e);
            }
        };

        for id in &routed.recreate {
            if let Some(consumer) = self.ctx.consumers.remove(id) {
                info!(
                    "Closing {} after home change of {}",
                    consumer.id(),
                    reference.id()
                );
            }
        }

        for consumer in &routed.deliver {
            if consumer.route_message(&reference, false) {
                continue;
            }
            debug!(
                "Consumer {} went away while routing {}",
                consumer.id(),
                reference.id()
            );
            if reference.acknowledged(consumer.id(), consumer.stored_id()) {
                for destination in &routed.destinations {
                    destination.remove(&reference.id(), RemoveReason::Acknowledged);
                }
                self.ctx.references.destroy(&reference);
            }
            reference.remove_remote_consumer(consumer.stored_id(), consumer.id());
        }

        self.send_ignore_acks(reference.id(), sender, &ignored);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn route_locked(
        &self,
        packet: &Packet,
        reference: &Arc<MessageReference>,
        state: &mut RefWriteGuard<'_>,
        created: bool,
        valid: &mut Vec<(Arc<Consumer>, u32)>,
        ignored: &mut Vec<ConsumerId>,
        sender: &BrokerAddress,
        delivered_ack: bool,
    ) -> Result<Routed> {
        let mut routed = Routed {
            destinations: Vec::new(),
            deliver: Vec::new(),
            recreate: Vec::new(),
        };

        if !created {
            match state.reconcile_home_change(sender) {
                HomeChange::Unchanged => {}
                HomeChange::Reassigned { previous } => {
                    info!(
                        "Remote message {} home broker {} changed to {}",
                        packet.id, previous, sender
                    );
                    routed.recreate = state
                        .remote_interest()
                        .keys()
                        .filter(|id| {
                            self.ctx
                                .consumers
                                .get(id)
                                .is_some_and(|c| c.spec().recreate_on_home_change)
                        })
                        .copied()
                        .collect();
                }
                HomeChange::LocallyOwned => {
                    warn!(
                        "Ignoring remote message {} sent from {}: no home broker recorded",
                        packet.id, sender
                    );
                    ignored.extend(valid.drain(..).map(|(c, _)| c.id()));
                    return Ok(routed);
                }
            }
        }
        if packet.redelivered {
            state.override_redeliver();
        }
        if delivered_ack {
            for (consumer, _) in valid.iter() {
                state.add_delivered_ack(consumer.id());
            }
        }

        let destinations = match self.resolve_destinations(&packet.destination) {
            Ok(destinations) => destinations,
            Err(e) => {
                warn!("Unable to route remote message {}: {}", packet.id, e);
                ignored.extend(valid.drain(..).map(|(c, _)| c.id()));
                if created {
                    state.mark_destroyed();
                    self.ctx.references.discard(reference);
                }
                return Err(e);
            }
        };
        if destinations.is_empty() {
            debug!("No destination for remote message {}", packet.id);
            ignored.extend(valid.drain(..).map(|(c, _)| c.id()));
            if created {
                state.mark_destroyed();
                self.ctx.references.discard(reference);
            }
            return Ok(routed);
        }

        if created {
            state.set_never_store(true);
            state.add_remote_interest(valid.iter().map(|(c, n)| (c.id(), *n)));
            let enforce = self.ctx.settings.cluster.enforce_remote_destination_limit;
            let mut queued = Vec::new();
            let mut duplicate = false;
            for destination in &destinations {
                match destination.enqueue(reference, true, enforce) {
                    Ok(Enqueued::Queued) => queued.push(destination.clone()),
                    Ok(Enqueued::Duplicate) => {
                        info!(
                            "Remote message {} sent from {} already routed to {}",
                            packet.id,
                            sender,
                            destination.id()
                        );
                        duplicate = true;
                        break;
                    }
                    Err(e) if e.is_resource_exhaustion() => self.log_destination_full(destination, sender, &e),
                    Err(e) => warn!(
                        "Unable to queue remote message {} on {}: {}",
                        packet.id,
                        destination.id(),
                        e
                    ),
                }
            }
            if duplicate || queued.is_empty() {
                for destination in &queued {
                    destination.remove(&reference.id(), RemoveReason::Acknowledged);
                }
                state.mark_destroyed();
                self.ctx.references.discard(reference);
                ignored.extend(valid.drain(..).map(|(c, _)| c.id()));
                return Ok(routed);
            }
            routed.destinations = queued;
        } else {
            let mut fresh = Vec::new();
            for (consumer, count) in valid.drain(..) {
                // a redelivery may repeat the count it was first sent with
                let known = state.remote_interest().get(&consumer.id()).copied();
                let seen = known.is_some_and(|known| {
                    count < known || (count == known && !packet.redelivered)
                });
                if seen {
                    debug!(
                        "Remote message {} already delivered to {}",
                        packet.id,
                        consumer.id()
                    );
                    continue;
                }
                fresh.push((consumer, count));
            }
            state.add_remote_interest(fresh.iter().map(|(c, n)| (c.id(), *n)));
            valid.extend(fresh);
            routed.destinations = destinations;
        }

        routed.deliver = valid.iter().map(|(c, _)| c.clone()).collect();
        Ok(routed)
    }

    fn resolve_destinations(&self, id: &DestinationId) -> Result<Vec<Arc<Destination>>> {
        if id.is_wildcard() {
            return self.ctx.destinations.resolve_wildcard(id);
        }
        Ok(self
            .ctx
            .destinations
            .get_or_auto_create(id)?
            .into_iter()
            .collect())
    }

    fn log_destination_full(&self, destination: &Destination, sender: &BrokerAddress, e: &BrokerError) {
        if self.warned_full.insert(destination.id().clone()) {
            warn!(
                "Unable to route remote message from {}: destination limit reached on {}",
                sender,
                destination.id()
            );
        } else {
            debug!(
                "Unable to route remote message from {}: {}",
                sender, e
            );
        }
    }

    fn send_ignore_acks(&self, id: SysMessageId, sender: &BrokerAddress, ignored: &[ConsumerId]) {
        for consumer in ignored {
            debug!("Ignoring {} for {} from {}", id, consumer, sender);
            self.broadcaster
                .acknowledge_to_sender(sender, id, *consumer, AckKind::Ignored, None, false);
        }
    }

    pub fn acknowledge(
        &self,
        kind: AckKind,
        id: SysMessageId,
        consumer: ConsumerId,
        props: Option<AckProps>,
    ) -> Result<bool> {
        self.remote.acknowledge(kind, id, consumer, props)
    }

    pub fn acknowledge_batch(
        &self,
        kind: AckKind,
        ids: &[SysMessageId],
        consumers: &[ConsumerId],
        props: Option<AckProps>,
        txn: Option<TransactionId>,
        txn_home: Option<&BrokerAddress>,
    ) -> Result<()> {
        self.remote
            .acknowledge_batch(kind, ids, consumers, props, txn, txn_home)
    }

    /// Forget every consumer reachable only through `address`.
    pub fn broker_down(&self, address: &BrokerAddress) -> Result<()> {
        self.remote.broker_down(address)?;
        let stranded = self.ctx.consumers.hosted_on(address);
        for consumer in &stranded {
            self.remove_local_consumer(consumer.id());
        }
        if !stranded.is_empty() {
            self.release_interests(&stranded);
        }
        info!("Broker {} down: {} local consumers dropped", address, stranded.len());
        Ok(())
    }

    /// Remove a consumer. Pending transactional acknowledgments in `pending`
    /// are folded into the delivery bookkeeping.
    pub fn remove_consumer(
        &self,
        id: ConsumerId,
        pending: Option<&PendingTxnMessages>,
        cleanup: bool,
    ) -> Result<()> {
        if self.remote.get(&id).is_some() || self.remote.is_pending(&id) {
            return self.remote.remove_consumer(id, pending, cleanup);
        }
        let Some(consumer) = self.remove_local_consumer(id) else {
            return self.remote.remove_consumer(id, pending, cleanup);
        };
        if let Some(pending) = pending {
            for counts in pending.values() {
                for (msg, count) in counts {
                    if let Some(reference) = self.ctx.references.lookup(msg) {
                        reference.update_delivery_count(consumer.stored_id().unwrap_or(id), *count);
                    }
                }
            }
        }
        Ok(())
    }

    /// Remove every consumer, local or remote, of `connection`.
    pub fn remove_consumers(&self, connection: ConnectionId) -> Result<()> {
        self.remote.remove_consumers(connection)?;
        for consumer in self.ctx.consumers.remove_connection(connection) {
            self.detach(&consumer);
        }
        Ok(())
    }

    fn remove_local_consumer(&self, id: ConsumerId) -> Option<Arc<Consumer>> {
        let consumer = self.ctx.consumers.remove(&id)?;
        self.detach(&consumer);
        debug!("Removed local consumer {}", id);
        Some(consumer)
    }

    fn detach(&self, consumer: &Consumer) {
        if let Ok(destinations) = self.resolve_destinations(consumer.destination()) {
            for destination in destinations {
                destination.detach_consumer(&consumer.id());
            }
        }
    }

    /// Drop the interests of `consumers` on every reference, removing messages
    /// nobody is waiting for any more.
    fn release_interests(&self, consumers: &[Arc<Consumer>]) {
        for reference in self.ctx.references.snapshot() {
            for consumer in consumers {
                if reference.acknowledged(consumer.id(), consumer.stored_id()) {
                    self.ctx.remove_message(&reference, RemoveReason::Acknowledged);
                }
            }
        }
    }

    /// Apply a control message. Unknown kinds are a protocol error.
    pub fn handle_control(
        &self,
        kind: &str,
        consumer: Option<ConsumerId>,
        prefetch: Option<u32>,
    ) -> Result<()> {
        let kind: ControlKind = kind.parse()?;
        if kind == ControlKind::Ping {
            debug!("Ping from peer");
            return Ok(());
        }
        let Some(id) = consumer else {
            return Err(BrokerError::Protocol(format!(
                "{kind:?} control message without a consumer"
            )));
        };
        let Some(target) = self.ctx.consumers.get(&id) else {
            debug!("{:?} for unknown consumer {}", kind, id);
            return Ok(());
        };
        match kind {
            ControlKind::StartFlow => {
                let limit = self.ctx.settings.cluster.consumer_flow_limit.max(1);
                target.resume_flow(Some(prefetch.filter(|p| *p > 0 && *p <= limit).unwrap_or(limit)));
            }
            ControlKind::StopFlow => target.pause(),
            ControlKind::Ping => {}
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        info!("Shutting down cluster router");
        self.remote.destroy();
    }

    pub fn debug_state(&self) -> BTreeMap<String, Value> {
        let mut state = self.remote.debug_state();
        state.insert(
            "router.references".to_string(),
            json!(self.ctx.references.len()),
        );
        state.insert(
            "router.consumers".to_string(),
            json!(self.ctx.consumers.len()),
        );
        let destinations: serde_json::Map<String, Value> = self
            .ctx
            .destinations
            .all()
            .iter()
            .map(|d| (d.id().to_string(), json!(d.len())))
            .collect();
        state.insert("router.destinations".to_string(), Value::Object(destinations));
        let mut warned: Vec<String> = self.warned_full.iter().map(|d| d.to_string()).collect();
        warned.sort();
        state.insert("router.full_destinations_logged".to_string(), json!(warned));
        state
    }
}
