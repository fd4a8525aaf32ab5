use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, mpsc::UnboundedSender, watch};

use crate::broker::message::{BrokerAddress, ConnectionId, ConsumerId, DestinationId};
use crate::broker::reference::MessageReference;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    Auto,
    Client,
    DupsOk,
    NoAck,
}

/// Everything a broker needs to know to host or reach a consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerSpec {
    pub id: ConsumerId,
    /// Durable subscription id used for acknowledgment bookkeeping.
    pub stored_id: Option<ConsumerId>,
    pub connection: ConnectionId,
    /// Broker the consumer's session is connected to.
    pub broker: BrokerAddress,
    pub destination: DestinationId,
    pub subscription: Option<String>,
    pub ack_mode: AckMode,
    /// Close the consumer's connection when a message it holds changes home.
    #[serde(default)]
    pub recreate_on_home_change: bool,
}

impl ConsumerSpec {
    pub fn new(
        id: ConsumerId,
        connection: ConnectionId,
        broker: BrokerAddress,
        destination: DestinationId,
    ) -> Self {
        Self {
            id,
            stored_id: None,
            connection,
            broker,
            destination,
            subscription: None,
            ack_mode: AckMode::Auto,
            recreate_on_home_change: false,
        }
    }
}

/// One message handed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub reference: Arc<MessageReference>,
    pub flow_controlled: bool,
}

#[derive(Debug)]
struct FlowState {
    paused: bool,
    /// `None` means unlimited.
    credit: Option<u32>,
}

/// A consumer known to this broker.
///
/// Messages are handed over through an unbounded channel. Whoever owns the
/// receiving end (a local session, or the remote delivery loop for consumers
/// hosted on a peer) reports back with [`Consumer::delivery_done`] so the busy
/// flag tracks the backlog.
#[derive(Debug)]
pub struct Consumer {
    spec: ConsumerSpec,
    valid: AtomicBool,
    flow: Mutex<FlowState>,
    flow_changed: Notify,
    pending: AtomicUsize,
    busy: watch::Sender<bool>,
    sender: UnboundedSender<Delivery>,
}

impl Consumer {
    pub fn new(spec: ConsumerSpec, credit: Option<u32>, sender: UnboundedSender<Delivery>) -> Self {
        let (busy, _) = watch::channel(false);
        Self {
            spec,
            valid: AtomicBool::new(true),
            flow: Mutex::new(FlowState {
                paused: false,
                credit,
            }),
            flow_changed: Notify::new(),
            pending: AtomicUsize::new(0),
            busy,
            sender,
        }
    }

    pub fn id(&self) -> ConsumerId {
        self.spec.id
    }

    pub fn stored_id(&self) -> Option<ConsumerId> {
        self.spec.stored_id
    }

    pub fn spec(&self) -> &ConsumerSpec {
        &self.spec
    }

    pub fn connection(&self) -> ConnectionId {
        self.spec.connection
    }

    pub fn broker(&self) -> &BrokerAddress {
        &self.spec.broker
    }

    pub fn destination(&self) -> &DestinationId {
        &self.spec.destination
    }

    pub fn ack_mode(&self) -> AckMode {
        self.spec.ack_mode
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Mark the consumer closed. Further deliveries fail.
    pub fn invalidate(&self) -> bool {
        let was_valid = self.valid.swap(false, Ordering::AcqRel);
        self.flow_changed.notify_one();
        was_valid
    }

    /// Hand `reference` to the consumer. Returns false if the consumer was
    /// closed since it was looked up.
    pub fn route_message(&self, reference: &Arc<MessageReference>, flow_controlled: bool) -> bool {
        if !self.is_valid() {
            return false;
        }
        let delivery = Delivery {
            reference: reference.clone(),
            flow_controlled,
        };
        if self.sender.send(delivery).is_err() {
            self.invalidate();
            return false;
        }
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.busy.send_if_modified(|busy| !std::mem::replace(busy, true));
        true
    }

    /// Called by the receiving side once a delivery has been handled.
    pub fn delivery_done(&self) {
        let previous = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        if previous <= 1 {
            self.busy.send_if_modified(|busy| std::mem::replace(busy, false));
        }
    }

    pub fn is_busy(&self) -> bool {
        *self.busy.borrow()
    }

    /// Receive busy-state transitions.
    pub fn subscribe_busy(&self) -> watch::Receiver<bool> {
        self.busy.subscribe()
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Resume delivery with an optional prefetch credit (`None` is unlimited).
    pub fn resume_flow(&self, prefetch: Option<u32>) {
        {
            let mut flow = self.flow.lock();
            flow.paused = false;
            flow.credit = prefetch;
        }
        self.flow_changed.notify_one();
    }

    pub fn pause(&self) {
        self.flow.lock().paused = true;
    }

    pub fn is_paused(&self) -> bool {
        self.flow.lock().paused
    }

    /// Consume one unit of credit if flow allows a delivery right now.
    pub fn take_credit(&self) -> bool {
        let mut flow = self.flow.lock();
        if flow.paused {
            return false;
        }
        match flow.credit.as_mut() {
            None => true,
            Some(0) => false,
            Some(n) => {
                *n -= 1;
                true
            }
        }
    }

    /// Paused, or out of credit.
    pub fn is_flow_blocked(&self) -> bool {
        let flow = self.flow.lock();
        flow.paused || flow.credit == Some(0)
    }

    /// Wait until flow may allow another delivery or the consumer is closed.
    pub async fn flow_changed(&self) {
        self.flow_changed.notified().await
    }
}
