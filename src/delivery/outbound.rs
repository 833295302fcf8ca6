//! Outbound QoS 1/2 handshake state machine
//!
//! Pure transition logic: each event returns a `Step` telling the owning
//! connection what to send and whether the delivery reached a terminal state.
//! Timers, id release and completion reporting belong to the caller.
//!
//! ```text
//! QoS 1: WaitAck --PUBACK--> Done
//! QoS 2: WaitRec --PUBREC--> WaitComp --PUBCOMP--> Done
//! ```

use std::time::Duration;

use tokio::time::Instant;

use super::{DeliveryOutcome, Message};
use crate::protocol::{Packet, PubRel, QoS};

/// Handshake state of an in-flight outbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundState {
    /// QoS 1: PUBLISH sent, waiting for PUBACK
    WaitAck,
    /// QoS 2: PUBLISH sent, waiting for PUBREC
    WaitRec,
    /// QoS 2: PUBREL sent, waiting for PUBCOMP
    WaitComp,
}

/// Result of feeding an event to the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Event doesn't apply in the current state
    Ignored,
    /// Moved forward; send the packet
    Advanced(Packet),
    /// State unchanged; send the packet again
    Resend(Packet),
    /// Terminal; release the id and report the outcome
    Finished(DeliveryOutcome),
}

/// One in-flight outbound QoS 1/2 message
#[derive(Debug, Clone)]
pub struct OutboundDelivery {
    packet_id: u16,
    qos: QoS,
    message: Message,
    state: OutboundState,
    retries: u32,
    last_sent: Instant,
}

impl OutboundDelivery {
    /// Enter the initial wait state and produce the first PUBLISH
    ///
    /// `qos` is the effective QoS; QoS 0 never gets a state machine.
    pub fn start(packet_id: u16, message: Message, qos: QoS, now: Instant) -> (Self, Packet) {
        let state = match qos {
            QoS::ExactlyOnce => OutboundState::WaitRec,
            _ => OutboundState::WaitAck,
        };
        let delivery = Self {
            packet_id,
            qos,
            message,
            state,
            retries: 0,
            last_sent: now,
        };
        let packet = delivery.publish_packet(false);
        (delivery, packet)
    }

    pub fn packet_id(&self) -> u16 {
        self.packet_id
    }

    pub fn qos(&self) -> QoS {
        self.qos
    }

    pub fn state(&self) -> OutboundState {
        self.state
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    fn publish_packet(&self, dup: bool) -> Packet {
        Packet::Publish(self.message.to_publish(self.qos, Some(self.packet_id), dup))
    }

    fn pubrel_packet(&self) -> Packet {
        Packet::PubRel(PubRel::new(self.packet_id))
    }

    /// PUBACK received
    pub fn on_puback(&mut self) -> Step {
        match self.state {
            OutboundState::WaitAck => Step::Finished(DeliveryOutcome::Done),
            _ => Step::Ignored,
        }
    }

    /// PUBREC received
    pub fn on_pubrec(&mut self, now: Instant) -> Step {
        match self.state {
            OutboundState::WaitRec => {
                self.state = OutboundState::WaitComp;
                self.retries = 0;
                self.last_sent = now;
                Step::Advanced(self.pubrel_packet())
            }
            // Our PUBREL was probably lost; answer again without regressing
            OutboundState::WaitComp => Step::Resend(self.pubrel_packet()),
            OutboundState::WaitAck => Step::Ignored,
        }
    }

    /// PUBCOMP received
    pub fn on_pubcomp(&mut self) -> Step {
        match self.state {
            OutboundState::WaitComp => Step::Finished(DeliveryOutcome::Done),
            _ => Step::Ignored,
        }
    }

    /// Retransmission timer fired
    ///
    /// PUBLISH is resent with DUP set until PUBREC arrives; afterwards only
    /// PUBREL is resent.
    pub fn on_retry(&mut self, now: Instant, max_retries: u32) -> Step {
        if self.retries >= max_retries {
            return Step::Finished(DeliveryOutcome::Failed);
        }

        self.retries += 1;
        self.last_sent = now;
        match self.state {
            OutboundState::WaitAck | OutboundState::WaitRec => Step::Resend(self.publish_packet(true)),
            OutboundState::WaitComp => Step::Resend(self.pubrel_packet()),
        }
    }

    /// When the retransmission timer fires next
    pub fn deadline(&self, retry_interval: Duration) -> Instant {
        self.last_sent + retry_interval
    }

    pub fn is_due(&self, now: Instant, retry_interval: Duration) -> bool {
        self.deadline(retry_interval) <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Publish;
    use pretty_assertions::assert_eq;

    const INTERVAL: Duration = Duration::from_secs(30);

    fn message(qos: QoS) -> Message {
        Message::new("/my_topic", "Hello", qos)
    }

    fn expect_publish(packet: Packet) -> Publish {
        match packet {
            Packet::Publish(p) => p,
            other => panic!("expected PUBLISH, got {:?}", other),
        }
    }

    #[test]
    fn test_qos1_puback_finishes() {
        let now = Instant::now();
        let (mut d, packet) = OutboundDelivery::start(7, message(QoS::AtLeastOnce), QoS::AtLeastOnce, now);

        let publish = expect_publish(packet);
        assert_eq!(publish.packet_id, Some(7));
        assert!(!publish.dup);
        assert_eq!(d.state(), OutboundState::WaitAck);

        assert_eq!(d.on_pubrec(now), Step::Ignored);
        assert_eq!(d.on_pubcomp(), Step::Ignored);
        assert_eq!(d.on_puback(), Step::Finished(DeliveryOutcome::Done));
    }

    #[test]
    fn test_qos2_full_handshake() {
        let now = Instant::now();
        let (mut d, _) = OutboundDelivery::start(3, message(QoS::ExactlyOnce), QoS::ExactlyOnce, now);
        assert_eq!(d.state(), OutboundState::WaitRec);

        assert_eq!(d.on_puback(), Step::Ignored);
        assert_eq!(d.on_pubcomp(), Step::Ignored);
        assert_eq!(d.on_pubrec(now), Step::Advanced(Packet::PubRel(PubRel::new(3))));
        assert_eq!(d.state(), OutboundState::WaitComp);

        // Duplicate PUBREC doesn't regress
        assert_eq!(d.on_pubrec(now), Step::Resend(Packet::PubRel(PubRel::new(3))));
        assert_eq!(d.state(), OutboundState::WaitComp);

        assert_eq!(d.on_pubcomp(), Step::Finished(DeliveryOutcome::Done));
    }

    #[test]
    fn test_retry_resends_publish_with_dup_then_fails() {
        let start = Instant::now();
        let (mut d, _) = OutboundDelivery::start(1, message(QoS::AtLeastOnce), QoS::AtLeastOnce, start);
        assert!(!d.is_due(start, INTERVAL));
        assert!(d.is_due(start + INTERVAL, INTERVAL));

        for attempt in 1..=2 {
            let now = start + INTERVAL * attempt;
            let publish = match d.on_retry(now, 2) {
                Step::Resend(packet) => expect_publish(packet),
                other => panic!("expected resend, got {:?}", other),
            };
            assert!(publish.dup);
            assert_eq!(publish.packet_id, Some(1));
            assert_eq!(d.retries(), attempt);
            assert_eq!(d.deadline(INTERVAL), now + INTERVAL);
        }

        assert_eq!(d.on_retry(start + INTERVAL * 3, 2), Step::Finished(DeliveryOutcome::Failed));
    }

    #[test]
    fn test_retry_after_pubrec_resends_pubrel_only() {
        let start = Instant::now();
        let (mut d, _) = OutboundDelivery::start(9, message(QoS::ExactlyOnce), QoS::ExactlyOnce, start);

        assert!(matches!(d.on_retry(start + INTERVAL, 1), Step::Resend(Packet::Publish(_))));
        assert_eq!(d.retries(), 1);

        let later = start + INTERVAL * 2;
        assert!(matches!(d.on_pubrec(later), Step::Advanced(_)));
        assert_eq!(d.retries(), 0);
        assert_eq!(d.deadline(INTERVAL), later + INTERVAL);

        assert_eq!(
            d.on_retry(later + INTERVAL, 1),
            Step::Resend(Packet::PubRel(PubRel::new(9)))
        );
        assert_eq!(d.on_retry(later + INTERVAL * 2, 1), Step::Finished(DeliveryOutcome::Failed));
    }

    #[test]
    fn test_zero_retries_fails_on_first_timeout() {
        let now = Instant::now();
        let (mut d, _) = OutboundDelivery::start(1, message(QoS::AtLeastOnce), QoS::AtLeastOnce, now);
        assert_eq!(d.on_retry(now + INTERVAL, 0), Step::Finished(DeliveryOutcome::Failed));
    }

    #[test]
    fn test_effective_qos_is_used_on_the_wire() {
        let now = Instant::now();
        let (d, packet) = OutboundDelivery::start(5, message(QoS::ExactlyOnce), QoS::AtLeastOnce, now);
        assert_eq!(d.state(), OutboundState::WaitAck);
        assert_eq!(expect_publish(packet).qos, QoS::AtLeastOnce);
    }
}
