//! Message delivery
//!
//! A published message fans out into one `Delivery` per recipient. Each
//! delivery carries a completion channel so the publisher can learn how the
//! handshake with that recipient ended.

mod outbound;

pub use outbound::{OutboundDelivery, OutboundState, Step};

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::join_all;
use tokio::sync::oneshot;

use crate::protocol::{Publish, QoS};

/// An application message as routed by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Topic name (shared across all recipients)
    pub topic: Arc<str>,
    /// Opaque payload
    pub payload: Bytes,
    /// QoS the publisher used
    pub qos: QoS,
    /// Retain flag (passed through)
    pub retain: bool,
}

impl Message {
    pub fn new(topic: impl Into<Arc<str>>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain: false,
        }
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    /// Build the outgoing PUBLISH for one recipient
    pub fn to_publish(&self, qos: QoS, packet_id: Option<u16>, dup: bool) -> Publish {
        Publish {
            dup,
            qos,
            retain: self.retain,
            topic: self.topic.clone(),
            packet_id,
            payload: self.payload.clone(),
        }
    }
}

impl From<&Publish> for Message {
    fn from(publish: &Publish) -> Self {
        Self {
            topic: publish.topic.clone(),
            payload: publish.payload.clone(),
            qos: publish.qos,
            retain: publish.retain,
        }
    }
}

/// Terminal result of one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryOutcome {
    /// Handshake completed (or QoS 0 transmitted)
    Done,
    /// Retry budget exhausted while the connection stayed open
    Failed,
    /// Connection closed before or during the handshake
    Dropped,
    /// No free packet identifier for this recipient
    PoolExhausted,
}

impl DeliveryOutcome {
    pub fn is_done(self) -> bool {
        self == DeliveryOutcome::Done
    }
}

impl fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryOutcome::Done => write!(f, "done"),
            DeliveryOutcome::Failed => write!(f, "failed"),
            DeliveryOutcome::Dropped => write!(f, "dropped"),
            DeliveryOutcome::PoolExhausted => write!(f, "packet id pool exhausted"),
        }
    }
}

/// Sending half of a delivery's completion channel
///
/// Dropping it without calling `finish` reads as `Dropped` on the receipt.
#[derive(Debug)]
pub struct Completion(oneshot::Sender<DeliveryOutcome>);

impl Completion {
    pub fn finish(self, outcome: DeliveryOutcome) {
        // Publisher may have discarded the receipt
        let _ = self.0.send(outcome);
    }
}

/// One message addressed to one recipient at its effective QoS
#[derive(Debug)]
pub struct Delivery {
    pub message: Message,
    pub qos: QoS,
    pub completion: Completion,
}

impl Delivery {
    pub fn new(message: Message, qos: QoS) -> (Self, oneshot::Receiver<DeliveryOutcome>) {
        let (tx, rx) = oneshot::channel();
        let delivery = Self {
            message,
            qos,
            completion: Completion(tx),
        };
        (delivery, rx)
    }

    pub fn finish(self, outcome: DeliveryOutcome) {
        self.completion.finish(outcome);
    }
}

/// Per-recipient result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub client_id: Arc<str>,
    pub qos: QoS,
    pub outcome: DeliveryOutcome,
}

#[derive(Debug)]
struct PendingReport {
    client_id: Arc<str>,
    qos: QoS,
    outcome: oneshot::Receiver<DeliveryOutcome>,
}

/// Handle returned by a publish; resolves per-recipient outcomes
#[derive(Debug, Default)]
pub struct DeliveryReceipt {
    recipients: Vec<PendingReport>,
}

impl DeliveryReceipt {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(
        &mut self,
        client_id: Arc<str>,
        qos: QoS,
        outcome: oneshot::Receiver<DeliveryOutcome>,
    ) {
        self.recipients.push(PendingReport {
            client_id,
            qos,
            outcome,
        });
    }

    /// Number of recipients the message fanned out to
    pub fn len(&self) -> usize {
        self.recipients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recipients.is_empty()
    }

    /// Wait for every recipient's handshake to finish
    pub async fn outcomes(self) -> Vec<DeliveryReport> {
        join_all(self.recipients.into_iter().map(|pending| async move {
            let outcome = pending.outcome.await.unwrap_or(DeliveryOutcome::Dropped);
            DeliveryReport {
                client_id: pending.client_id,
                qos: pending.qos,
                outcome,
            }
        }))
        .await
    }
}
