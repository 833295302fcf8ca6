//! Shared helpers for integration tests
//!
//! `TestClient` drives one in-memory connection at the packet level.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use vibemq_delivery::broker::{Broker, BrokerConfig, BrokerEvent, ClientEnd, Transport};
use vibemq_delivery::delivery::{DeliveryOutcome, Message};
use vibemq_delivery::hooks::Hooks;
use vibemq_delivery::logging;
use vibemq_delivery::protocol::{
    Connect, Packet, PubAck, PubComp, PubRec, PubRel, Publish, QoS, SubAckReturnCode, Subscribe,
    Subscription, Unsubscribe,
};

/// Upper bound for any single expected packet
pub const RECV_TIMEOUT: Duration = Duration::from_secs(10);

/// Window in which an unexpected packet would have shown up
pub const QUIET_PERIOD: Duration = Duration::from_millis(100);

/// Test configuration helper
pub fn test_config() -> BrokerConfig {
    BrokerConfig {
        retry_interval: Duration::from_secs(1),
        max_retries: 2,
        connect_timeout: Duration::from_secs(5),
        ..BrokerConfig::default()
    }
}

pub fn broker_with(config: BrokerConfig, hooks: Arc<dyn Hooks>) -> Broker {
    logging::init_for_tests();
    Broker::with_hooks(config, hooks)
}

pub fn broker() -> Broker {
    logging::init_for_tests();
    Broker::new(test_config())
}

/// Helper struct for MQTT client operations in tests
pub struct TestClient {
    pub client_id: String,
    end: ClientEnd,
    task: JoinHandle<()>,
    next_packet_id: u16,
}

impl TestClient {
    /// Attach a transport without sending anything
    pub fn attach(broker: &Broker, client_id: &str) -> Self {
        Self::attach_with_capacity(broker, client_id, 64)
    }

    /// Attach with a given transport buffer size in packets
    pub fn attach_with_capacity(broker: &Broker, client_id: &str, capacity: usize) -> Self {
        let (transport, end) = Transport::pair(capacity);
        let task = broker.accept(transport);
        Self {
            client_id: client_id.to_string(),
            end,
            task,
            next_packet_id: 1,
        }
    }

    /// Attach and complete CONNECT/CONNACK
    pub async fn connect(broker: &Broker, client_id: &str) -> Self {
        Self::connect_with(broker, Connect::new(client_id)).await
    }

    pub async fn connect_with(broker: &Broker, connect: Connect) -> Self {
        let client = Self::attach(broker, &connect.client_id);
        client.handshake(connect).await
    }

    /// Connect over a transport that buffers only `capacity` packets
    pub async fn connect_with_capacity(broker: &Broker, client_id: &str, capacity: usize) -> Self {
        let client = Self::attach_with_capacity(broker, client_id, capacity);
        client.handshake(Connect::new(client_id)).await
    }

    async fn handshake(mut self, connect: Connect) -> Self {
        self.send(Packet::Connect(connect)).await;
        match self.recv().await {
            Packet::ConnAck(_) => {}
            other => panic!("expected CONNACK, got {:?}", other),
        }
        self
    }

    pub async fn send(&mut self, packet: Packet) {
        assert!(self.end.send(packet).await, "broker side closed");
    }

    /// Next packet from the broker; panics on timeout or close
    pub async fn recv(&mut self) -> Packet {
        match timeout(RECV_TIMEOUT, self.end.recv()).await {
            Ok(Some(packet)) => packet,
            Ok(None) => panic!("connection closed by broker"),
            Err(_) => panic!("timed out waiting for packet"),
        }
    }

    /// Wait for the broker to close the connection
    pub async fn expect_closed(&mut self) {
        match timeout(RECV_TIMEOUT, self.end.recv()).await {
            Ok(None) => {}
            Ok(Some(packet)) => panic!("expected close, got {:?}", packet),
            Err(_) => panic!("timed out waiting for close"),
        }
    }

    /// Assert nothing arrives for a short while
    pub async fn expect_nothing(&mut self) {
        if let Ok(Some(packet)) = timeout(QUIET_PERIOD, self.end.recv()).await {
            panic!("expected no packet, got {:?}", packet);
        }
    }

    pub async fn expect_publish(&mut self) -> Publish {
        match self.recv().await {
            Packet::Publish(publish) => publish,
            other => panic!("expected PUBLISH, got {:?}", other),
        }
    }

    pub async fn subscribe_many(&mut self, filters: &[(&str, QoS)]) -> Vec<SubAckReturnCode> {
        let packet_id = self.packet_id();
        self.send(Packet::Subscribe(Subscribe {
            packet_id,
            subscriptions: filters
                .iter()
                .map(|(filter, qos)| Subscription::new(*filter, *qos))
                .collect(),
        }))
        .await;

        match self.recv().await {
            Packet::SubAck(suback) => {
                assert_eq!(suback.packet_id, packet_id);
                suback.return_codes
            }
            other => panic!("expected SUBACK, got {:?}", other),
        }
    }

    pub async fn subscribe(&mut self, filter: &str, qos: QoS) -> SubAckReturnCode {
        self.subscribe_many(&[(filter, qos)]).await[0]
    }

    pub async fn unsubscribe(&mut self, filter: &str) {
        let packet_id = self.packet_id();
        self.send(Packet::Unsubscribe(Unsubscribe {
            packet_id,
            filters: vec![filter.to_string()],
        }))
        .await;

        match self.recv().await {
            Packet::UnsubAck(unsuback) => assert_eq!(unsuback.packet_id, packet_id),
            other => panic!("expected UNSUBACK, got {:?}", other),
        }
    }

    pub async fn puback(&mut self, packet_id: u16) {
        self.send(Packet::PubAck(PubAck::new(packet_id))).await;
    }

    pub async fn pubrec(&mut self, packet_id: u16) {
        self.send(Packet::PubRec(PubRec::new(packet_id))).await;
    }

    pub async fn pubrel(&mut self, packet_id: u16) {
        self.send(Packet::PubRel(PubRel::new(packet_id))).await;
    }

    pub async fn pubcomp(&mut self, packet_id: u16) {
        self.send(Packet::PubComp(PubComp::new(packet_id))).await;
    }

    /// Round-trip a PINGREQ to prove the connection is alive and every
    /// earlier packet has been processed
    pub async fn ping(&mut self) {
        self.send(Packet::PingReq).await;
        match self.recv().await {
            Packet::PingResp => {}
            other => panic!("expected PINGRESP, got {:?}", other),
        }
    }

    /// Send DISCONNECT and wait for the connection task to finish
    pub async fn disconnect(mut self) {
        self.send(Packet::Disconnect).await;
        self.task.await.expect("connection task panicked");
    }

    /// Drop the transport without DISCONNECT and wait for cleanup
    pub async fn drop_connection(self) {
        let Self { end, task, .. } = self;
        drop(end);
        task.await.expect("connection task panicked");
    }

    pub async fn join(self) {
        self.task.await.expect("connection task panicked");
    }

    /// Whether the broker-side task ends within `limit`, without this end
    /// reading or closing anything
    pub async fn finished_within(&mut self, limit: Duration) -> bool {
        timeout(limit, &mut self.task).await.is_ok()
    }

    fn packet_id(&mut self) -> u16 {
        let id = self.next_packet_id;
        self.next_packet_id = self.next_packet_id.wrapping_add(1).max(1);
        id
    }
}

/// Publish packet as a client would send it
pub fn client_publish(topic: &str, payload: &'static str, qos: QoS, packet_id: Option<u16>) -> Packet {
    Packet::Publish(Publish {
        qos,
        topic: Arc::from(topic),
        packet_id,
        payload: payload.into(),
        ..Publish::default()
    })
}

/// Wait for the first event matching `pred`
pub async fn wait_for_event<F>(events: &mut broadcast::Receiver<BrokerEvent>, mut pred: F) -> BrokerEvent
where
    F: FnMut(&BrokerEvent) -> bool,
{
    timeout(RECV_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Hooks that record every callback as a line of text
#[derive(Default)]
pub struct RecordingHooks {
    pub events: Mutex<Vec<String>>,
}

impl RecordingHooks {
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events.lock().iter().filter(|e| e.starts_with(prefix)).count()
    }

    fn push(&self, event: String) {
        self.events.lock().push(event);
    }
}

#[async_trait]
impl Hooks for RecordingHooks {
    async fn on_client_connected(&self, client_id: &str) {
        self.push(format!("connected {}", client_id));
    }

    async fn on_client_disconnected(&self, client_id: &str, graceful: bool) {
        self.push(format!("disconnected {} graceful={}", client_id, graceful));
    }

    async fn on_subscribed(&self, client_id: &str, filter: &str, granted_qos: QoS) {
        self.push(format!("subscribed {} {} {}", client_id, filter, granted_qos));
    }

    async fn on_unsubscribed(&self, client_id: &str, filter: &str) {
        self.push(format!("unsubscribed {} {}", client_id, filter));
    }

    async fn on_message_received(&self, client_id: &str, message: &Message) {
        self.push(format!("received {} {}", client_id, message.topic));
    }

    async fn on_publish_acknowledged(&self, client_id: &str, packet_id: u16) {
        self.push(format!("puback {} {}", client_id, packet_id));
    }

    async fn on_publish_received(&self, client_id: &str, packet_id: u16) {
        self.push(format!("pubrec {} {}", client_id, packet_id));
    }

    async fn on_publish_released(&self, client_id: &str, packet_id: u16) {
        self.push(format!("pubrel {} {}", client_id, packet_id));
    }

    async fn on_publish_completed(&self, client_id: &str, packet_id: u16) {
        self.push(format!("pubcomp {} {}", client_id, packet_id));
    }

    async fn on_delivery_failed(&self, client_id: &str, _message: &Message, outcome: DeliveryOutcome) {
        self.push(format!("failed {} {}", client_id, outcome));
    }
}
