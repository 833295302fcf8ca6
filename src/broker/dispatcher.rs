//! Message fan-out
//!
//! Resolves the recipients of a message through the subscription registry and
//! hands one `Delivery` per recipient connection to that connection's
//! mailbox. Never waits on a recipient.

use std::sync::Arc;

use ahash::AHashMap;
use smallvec::SmallVec;
use tracing::{debug, trace};

use super::{BrokerError, BrokerEvent, ConnectionId, Shared};
use crate::delivery::{Delivery, DeliveryOutcome, DeliveryReceipt, Message};
use crate::protocol::QoS;

/// One resolved recipient
struct Target {
    connection: ConnectionId,
    client_id: Arc<str>,
    granted_qos: QoS,
}

impl Shared {
    /// Fan a message out to every matching subscriber
    ///
    /// A connection matched by several filters gets one delivery at the
    /// highest granted QoS among them. Each delivery uses
    /// `min(message.qos, granted)`.
    pub(crate) fn dispatch(&self, source: Option<&Arc<str>>, message: Message) -> DeliveryReceipt {
        let mut targets: SmallVec<[Target; 16]> = SmallVec::new();
        let mut seen: AHashMap<ConnectionId, usize> = AHashMap::new();

        self.subscriptions.for_each_match(&message.topic, |sub| {
            match seen.get(&sub.connection) {
                Some(&idx) => {
                    let target = &mut targets[idx];
                    if sub.granted_qos > target.granted_qos {
                        target.granted_qos = sub.granted_qos;
                    }
                }
                None => {
                    seen.insert(sub.connection, targets.len());
                    targets.push(Target {
                        connection: sub.connection,
                        client_id: sub.client_id.clone(),
                        granted_qos: sub.granted_qos,
                    });
                }
            }
        });

        let mut receipt = DeliveryReceipt::new();
        for target in targets {
            let qos = message.qos.min(target.granted_qos);
            self.enqueue(&mut receipt, target.connection, target.client_id, message.clone(), qos);
        }

        trace!(
            "Published to {} from {}: {} recipients",
            message.topic,
            source.map_or("server", |s| s.as_ref()),
            receipt.len()
        );
        self.emit(BrokerEvent::MessagePublished {
            topic: message.topic.clone(),
            qos: message.qos,
            recipients: receipt.len(),
        });

        receipt
    }

    /// Deliver a message to one client regardless of its subscriptions
    pub(crate) fn dispatch_to(&self, client_id: &str, message: Message) -> Result<DeliveryReceipt, BrokerError> {
        let (connection, client_id) = self
            .clients
            .get(client_id)
            .map(|entry| (*entry.value(), entry.key().clone()))
            .ok_or_else(|| BrokerError::NotConnected(client_id.to_string()))?;

        let qos = message.qos.min(self.config.max_qos);
        let mut receipt = DeliveryReceipt::new();
        self.enqueue(&mut receipt, connection, client_id, message, qos);
        Ok(receipt)
    }

    /// Hand one delivery to a connection's mailbox
    ///
    /// A connection that is already gone completes the delivery as `Dropped`.
    fn enqueue(
        &self,
        receipt: &mut DeliveryReceipt,
        connection: ConnectionId,
        client_id: Arc<str>,
        message: Message,
        qos: QoS,
    ) {
        let (delivery, outcome) = Delivery::new(message, qos);
        receipt.push(client_id.clone(), qos, outcome);

        let sent = match self.connections.get(&connection) {
            Some(handle) => handle.mailbox.send(delivery).map_err(|e| e.0),
            None => Err(delivery),
        };

        if let Err(delivery) = sent {
            debug!("Connection for {} closed before delivery", client_id);
            delivery.finish(DeliveryOutcome::Dropped);
            self.emit(BrokerEvent::DeliveryFinished {
                client_id,
                packet_id: None,
                outcome: DeliveryOutcome::Dropped,
            });
        }
    }
}
