//! PUBLISH handling in both directions
//!
//! Inbound: messages from this client are validated, acknowledged per QoS and
//! handed to the dispatcher. Outbound: deliveries from the mailbox are sent
//! directly (QoS 0) or start a handshake (QoS 1/2), subject to the in-flight
//! window.

use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::{Connection, ConnectionError};
use crate::broker::BrokerEvent;
use crate::delivery::{Delivery, DeliveryOutcome, Message};
use crate::protocol::{Packet, ProtocolError, PubAck, PubRec, Publish, QoS};
use crate::session::{InboundQos2, Session};
use crate::topic::validate_topic_name;

impl Connection {
    /// Handle PUBLISH packet from the client
    pub(crate) async fn handle_publish(
        &mut self,
        session: &mut Session,
        publish: Publish,
    ) -> Result<(), ConnectionError> {
        let packet_id = match (publish.qos, publish.packet_id) {
            (QoS::AtMostOnce, _) => None,
            (_, Some(id)) if id != 0 => Some(id),
            _ => {
                return Err(ProtocolError::ProtocolViolation("PUBLISH with QoS > 0 needs a packet identifier").into())
            }
        };

        if let Err(reason) = validate_topic_name(&publish.topic) {
            warn!("Dropping PUBLISH from {}: {}", session.client_id, reason);
            return Ok(());
        }

        let message = Message::from(&publish);
        match (publish.qos, packet_id) {
            (QoS::AtLeastOnce, Some(id)) => {
                self.route(session, message).await;
                self.send(Packet::PubAck(PubAck::new(id))).await
            }
            (QoS::ExactlyOnce, Some(id)) => match session.receive_qos2(id) {
                InboundQos2::Fresh => {
                    self.route(session, message).await;
                    self.send(Packet::PubRec(PubRec::new(id))).await
                }
                InboundQos2::Duplicate => {
                    trace!("Duplicate QoS 2 PUBLISH {} from {}", id, session.client_id);
                    self.send(Packet::PubRec(PubRec::new(id))).await
                }
                InboundQos2::Full => {
                    warn!(
                        "Too many QoS 2 messages awaiting PUBREL from {}, dropping packet {}",
                        session.client_id, id
                    );
                    Ok(())
                }
            },
            _ => {
                self.route(session, message).await;
                Ok(())
            }
        }
    }

    /// Hand an accepted inbound message to the application and subscribers
    async fn route(&self, session: &Session, message: Message) {
        self.shared
            .hooks
            .on_message_received(&session.client_id, &message)
            .await;
        let receipt = self.shared.dispatch(Some(&session.client_id), message);
        trace!("Routed message from {} to {} recipients", session.client_id, receipt.len());
    }

    /// Process a delivery handed over by the dispatcher
    pub(crate) async fn deliver(&mut self, session: &mut Session, delivery: Delivery) -> Result<(), ConnectionError> {
        if !delivery.qos.is_acknowledged() {
            let packet = Packet::Publish(delivery.message.to_publish(QoS::AtMostOnce, None, false));
            return match self.send(packet).await {
                Ok(()) => {
                    delivery.finish(DeliveryOutcome::Done);
                    self.delivery_finished(session, None, DeliveryOutcome::Done);
                    Ok(())
                }
                Err(e) => {
                    self.delivery_failed(session, None, &delivery.message, DeliveryOutcome::Dropped)
                        .await;
                    delivery.finish(DeliveryOutcome::Dropped);
                    Err(e)
                }
            };
        }

        if !session.has_inflight_capacity() {
            trace!("In-flight window full for {}, queueing", session.client_id);
            if let Some(evicted) = session.enqueue(delivery) {
                warn!("Queue full for {}, dropping oldest message", session.client_id);
                self.delivery_failed(session, None, &evicted.message, DeliveryOutcome::Dropped)
                    .await;
                evicted.finish(DeliveryOutcome::Dropped);
            }
            return Ok(());
        }

        self.start_delivery(session, delivery).await
    }

    /// Allocate an id and send the first PUBLISH of a QoS 1/2 handshake
    async fn start_delivery(&mut self, session: &mut Session, delivery: Delivery) -> Result<(), ConnectionError> {
        match session.start(delivery, Instant::now()) {
            Ok(packet) => self.send(packet).await,
            Err(delivery) => {
                warn!("No free packet identifier for {}", session.client_id);
                self.delivery_failed(session, None, &delivery.message, DeliveryOutcome::PoolExhausted)
                    .await;
                delivery.finish(DeliveryOutcome::PoolExhausted);
                Ok(())
            }
        }
    }

    /// Start queued deliveries while in-flight slots are free
    pub(crate) async fn pump_queue(&mut self, session: &mut Session) -> Result<(), ConnectionError> {
        while let Some(delivery) = session.dequeue() {
            self.start_delivery(session, delivery).await?;
        }
        Ok(())
    }

    pub(crate) fn delivery_finished(&self, session: &Session, packet_id: Option<u16>, outcome: DeliveryOutcome) {
        self.shared.emit(BrokerEvent::DeliveryFinished {
            client_id: session.client_id.clone(),
            packet_id,
            outcome,
        });
    }

    /// Report a delivery that ended without completing
    pub(crate) async fn delivery_failed(
        &self,
        session: &Session,
        packet_id: Option<u16>,
        message: &Message,
        outcome: DeliveryOutcome,
    ) {
        debug!(
            "Delivery of {} to {} ended: {}",
            message.topic, session.client_id, outcome
        );
        self.shared
            .hooks
            .on_delivery_failed(&session.client_id, message, outcome)
            .await;
        self.delivery_finished(session, packet_id, outcome);
    }
}
