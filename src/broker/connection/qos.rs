//! QoS acknowledgment handling (PUBACK, PUBREC, PUBREL, PUBCOMP) and
//! retransmission

use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::{Connection, ConnectionError};
use crate::delivery::Step;
use crate::protocol::{Packet, PubAck, PubComp, PubRec, PubRel};
use crate::session::Session;

impl Connection {
    /// Handle PUBACK packet
    pub(crate) async fn handle_puback(&mut self, session: &mut Session, puback: PubAck) -> Result<(), ConnectionError> {
        let id = puback.packet_id;
        let Some(delivery) = session.inflight_mut(id) else {
            trace!("PUBACK for unknown packet {} from {}", id, session.client_id);
            return Ok(());
        };

        let step = delivery.on_puback();
        if matches!(step, Step::Finished(_)) {
            self.shared.hooks.on_publish_acknowledged(&session.client_id, id).await;
        }
        self.apply_step(session, id, step).await
    }

    /// Handle PUBREC packet
    pub(crate) async fn handle_pubrec(&mut self, session: &mut Session, pubrec: PubRec) -> Result<(), ConnectionError> {
        let id = pubrec.packet_id;
        let Some(delivery) = session.inflight_mut(id) else {
            trace!("PUBREC for unknown packet {} from {}", id, session.client_id);
            return Ok(());
        };

        let step = delivery.on_pubrec(Instant::now());
        if matches!(step, Step::Advanced(_)) {
            self.shared.hooks.on_publish_received(&session.client_id, id).await;
        }
        self.apply_step(session, id, step).await
    }

    /// Handle PUBREL packet (inbound QoS 2)
    pub(crate) async fn handle_pubrel(&mut self, session: &mut Session, pubrel: PubRel) -> Result<(), ConnectionError> {
        let id = pubrel.packet_id;
        let was_pending = session.release_inbound(id);

        self.send(Packet::PubComp(PubComp::new(id))).await?;

        if was_pending {
            self.shared.hooks.on_publish_released(&session.client_id, id).await;
        } else {
            trace!("PUBREL for unknown packet {} from {}", id, session.client_id);
        }
        Ok(())
    }

    /// Handle PUBCOMP packet
    pub(crate) async fn handle_pubcomp(
        &mut self,
        session: &mut Session,
        pubcomp: PubComp,
    ) -> Result<(), ConnectionError> {
        let id = pubcomp.packet_id;
        let Some(delivery) = session.inflight_mut(id) else {
            trace!("PUBCOMP for unknown packet {} from {}", id, session.client_id);
            return Ok(());
        };

        let step = delivery.on_pubcomp();
        if matches!(step, Step::Finished(_)) {
            self.shared.hooks.on_publish_completed(&session.client_id, id).await;
        }
        self.apply_step(session, id, step).await
    }

    /// Retransmit or fail every in-flight message whose timer expired
    pub(crate) async fn retry_due(&mut self, session: &mut Session) -> Result<(), ConnectionError> {
        let now = Instant::now();
        let retry_interval = self.shared.config.retry_interval;
        let max_retries = self.shared.config.max_retries;

        for id in session.due(now, retry_interval) {
            let Some(delivery) = session.inflight_mut(id) else {
                continue;
            };
            let step = delivery.on_retry(now, max_retries);
            let attempt = delivery.retries();
            if let Step::Resend(_) = step {
                debug!("Retrying packet {} to {} (attempt {})", id, session.client_id, attempt);
            }
            self.apply_step(session, id, step).await?;
        }
        Ok(())
    }

    /// Carry out what the state machine asked for
    async fn apply_step(&mut self, session: &mut Session, id: u16, step: Step) -> Result<(), ConnectionError> {
        match step {
            Step::Ignored => {
                trace!("Ignoring out-of-state acknowledgment {} from {}", id, session.client_id);
                Ok(())
            }
            Step::Advanced(packet) | Step::Resend(packet) => self.send(packet).await,
            Step::Finished(outcome) => {
                let Some(delivery) = session.finish(id, outcome) else {
                    return Ok(());
                };
                if outcome.is_done() {
                    self.delivery_finished(session, Some(id), outcome);
                } else {
                    warn!(
                        "Delivery of packet {} to {} {} after {} retries",
                        id,
                        session.client_id,
                        outcome,
                        delivery.retries()
                    );
                    self.delivery_failed(session, Some(id), delivery.message(), outcome)
                        .await;
                }
                self.pump_queue(session).await
            }
        }
    }
}
