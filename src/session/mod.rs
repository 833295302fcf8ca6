//! Per-connection session state
//!
//! Owned exclusively by the connection actor: in-flight outbound QoS 1/2
//! deliveries, the queue of deliveries waiting for an in-flight slot, and the
//! packet identifier pools of both directions.

mod packet_id;

pub use packet_id::{PacketIdPool, PoolExhausted, MAX_PACKET_IDS};

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use smallvec::SmallVec;
use tokio::time::Instant;

use crate::delivery::{Completion, Delivery, DeliveryOutcome, Message, OutboundDelivery};
use crate::protocol::Packet;

/// Flow-control limits applied to one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    /// Concurrent outbound QoS 1/2 handshakes (0 = unbounded)
    pub max_inflight: usize,
    /// Deliveries waiting for an in-flight slot
    pub max_queued_messages: usize,
    /// Inbound QoS 2 ids awaiting PUBREL (0 = unbounded)
    pub max_awaiting_rel: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_inflight: 32,
            max_queued_messages: 1000,
            max_awaiting_rel: 100,
        }
    }
}

/// In-flight outbound message with its completion channel
#[derive(Debug)]
pub struct Inflight {
    pub delivery: OutboundDelivery,
    completion: Completion,
}

impl Inflight {
    fn finish(self, outcome: DeliveryOutcome) -> OutboundDelivery {
        self.completion.finish(outcome);
        self.delivery
    }
}

/// What to do with an inbound QoS 2 PUBLISH
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundQos2 {
    /// First sight of this id: dispatch, then PUBREC
    Fresh,
    /// Id still awaiting PUBREL: PUBREC only
    Duplicate,
    /// Too many ids awaiting PUBREL: drop without PUBREC
    Full,
}

/// Client session
pub struct Session {
    /// Client identifier
    pub client_id: Arc<str>,
    /// Keep alive interval in seconds
    pub keep_alive: u16,
    limits: SessionLimits,
    /// Inflight outgoing messages keyed by packet id
    inflight: AHashMap<u16, Inflight>,
    /// Deliveries waiting for an in-flight slot
    queue: VecDeque<Delivery>,
    outbound_ids: PacketIdPool,
    inbound_ids: PacketIdPool,
}

impl Session {
    pub fn new(client_id: Arc<str>, keep_alive: u16, limits: SessionLimits) -> Self {
        Self {
            client_id,
            keep_alive,
            limits,
            inflight: AHashMap::new(),
            queue: VecDeque::new(),
            outbound_ids: PacketIdPool::new(),
            inbound_ids: PacketIdPool::new(),
        }
    }

    /// Whether another outbound handshake may start now
    pub fn has_inflight_capacity(&self) -> bool {
        self.limits.max_inflight == 0 || self.inflight.len() < self.limits.max_inflight
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }

    pub fn queued_count(&self) -> usize {
        self.queue.len()
    }

    pub fn outbound_ids(&self) -> &PacketIdPool {
        &self.outbound_ids
    }

    pub fn inbound_ids(&self) -> &PacketIdPool {
        &self.inbound_ids
    }

    /// Queue a delivery until an in-flight slot frees up
    ///
    /// Returns the evicted oldest delivery when the queue overflows.
    pub fn enqueue(&mut self, delivery: Delivery) -> Option<Delivery> {
        self.queue.push_back(delivery);
        if self.queue.len() > self.limits.max_queued_messages {
            self.queue.pop_front()
        } else {
            None
        }
    }

    /// Next queued delivery, if a slot is available
    pub fn dequeue(&mut self) -> Option<Delivery> {
        if self.has_inflight_capacity() {
            self.queue.pop_front()
        } else {
            None
        }
    }

    /// Allocate an id and start the handshake, returning the PUBLISH to send
    ///
    /// Hands the delivery back if the outbound pool is exhausted.
    pub fn start(&mut self, delivery: Delivery, now: Instant) -> Result<Packet, Delivery> {
        let packet_id = match self.outbound_ids.allocate() {
            Ok(id) => id,
            Err(PoolExhausted) => return Err(delivery),
        };

        let (outbound, packet) = OutboundDelivery::start(packet_id, delivery.message, delivery.qos, now);
        self.inflight.insert(
            packet_id,
            Inflight {
                delivery: outbound,
                completion: delivery.completion,
            },
        );
        Ok(packet)
    }

    pub fn inflight_mut(&mut self, packet_id: u16) -> Option<&mut OutboundDelivery> {
        self.inflight.get_mut(&packet_id).map(|i| &mut i.delivery)
    }

    /// Remove a finished handshake, release its id and report the outcome
    pub fn finish(&mut self, packet_id: u16, outcome: DeliveryOutcome) -> Option<OutboundDelivery> {
        let inflight = self.inflight.remove(&packet_id)?;
        self.outbound_ids.release(packet_id);
        Some(inflight.finish(outcome))
    }

    /// Packet ids whose retransmission timer has expired
    pub fn due(&self, now: Instant, retry_interval: Duration) -> SmallVec<[u16; 8]> {
        let mut ids: SmallVec<[u16; 8]> = self
            .inflight
            .iter()
            .filter(|(_, i)| i.delivery.is_due(now, retry_interval))
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Earliest retransmission deadline among in-flight messages
    pub fn next_deadline(&self, retry_interval: Duration) -> Option<Instant> {
        self.inflight
            .values()
            .map(|i| i.delivery.deadline(retry_interval))
            .min()
    }

    /// Classify an inbound QoS 2 PUBLISH, reserving its id on first sight
    pub fn receive_qos2(&mut self, packet_id: u16) -> InboundQos2 {
        if self.inbound_ids.is_in_use(packet_id) {
            return InboundQos2::Duplicate;
        }
        if self.limits.max_awaiting_rel != 0
            && self.inbound_ids.in_use_count() >= self.limits.max_awaiting_rel
        {
            return InboundQos2::Full;
        }
        self.inbound_ids.reserve(packet_id);
        InboundQos2::Fresh
    }

    /// PUBREL received; returns whether the id was awaiting release
    pub fn release_inbound(&mut self, packet_id: u16) -> bool {
        self.inbound_ids.release(packet_id)
    }

    /// Tear down: every in-flight and queued delivery becomes `Dropped`
    ///
    /// Returns the dropped messages in packet-id then queue order.
    pub fn close(&mut self) -> Vec<Message> {
        let mut dropped = Vec::with_capacity(self.inflight.len() + self.queue.len());

        let mut ids: Vec<u16> = self.inflight.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            if let Some(delivery) = self.finish(id, DeliveryOutcome::Dropped) {
                dropped.push(delivery.message().clone());
            }
        }

        for delivery in self.queue.drain(..) {
            dropped.push(delivery.message.clone());
            delivery.finish(DeliveryOutcome::Dropped);
        }

        self.outbound_ids.clear();
        self.inbound_ids.clear();
        dropped
    }
}
