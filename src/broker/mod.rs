//! MQTT Broker Core
//!
//! The broker context ties the subscription registry, the live connection
//! table and the application hooks together. Each accepted transport runs as
//! its own connection actor; fan-out reaches those actors through their
//! mailboxes, never through shared per-connection state.

mod connection;
mod dispatcher;
mod transport;

pub use connection::ConnectionError;
pub use transport::{ClientEnd, Transport};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::delivery::{Delivery, DeliveryOutcome, DeliveryReceipt, Message};
use crate::hooks::{DefaultHooks, Hooks};
use crate::protocol::QoS;
use crate::session::SessionLimits;
use crate::topic::{validate_topic_name, SubscriptionRegistry};

use connection::Connection;

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Maximum QoS granted to subscriptions
    pub max_qos: QoS,
    /// Concurrent outbound QoS 1/2 handshakes per connection (0 = unbounded)
    pub max_inflight: usize,
    /// Deliveries queued per connection while the in-flight window is full
    pub max_queued_messages: usize,
    /// Inbound QoS 2 messages awaiting PUBREL per connection (0 = unbounded)
    pub max_awaiting_rel: usize,
    /// Retransmission interval for unacknowledged QoS 1/2 messages
    pub retry_interval: Duration,
    /// Retransmissions before a delivery fails
    pub max_retries: u32,
    /// Time allowed between accept and CONNECT
    pub connect_timeout: Duration,
}

impl BrokerConfig {
    pub(crate) fn session_limits(&self) -> SessionLimits {
        SessionLimits {
            max_inflight: self.max_inflight,
            max_queued_messages: self.max_queued_messages,
            max_awaiting_rel: self.max_awaiting_rel,
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_qos: QoS::ExactlyOnce,
            max_inflight: 32,
            max_queued_messages: 1000,
            max_awaiting_rel: 100,
            retry_interval: Duration::from_secs(30),
            max_retries: 3,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Broker-unique identity of one connection attachment
///
/// A client id reconnecting gets a new `ConnectionId`, so state belonging to
/// the replaced attachment can be cleaned up without touching the new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Broker events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    /// Client connected
    ClientConnected { client_id: Arc<str> },
    /// Client disconnected
    ClientDisconnected { client_id: Arc<str>, graceful: bool },
    /// Subscription registered
    SubscriptionAdded {
        client_id: Arc<str>,
        filter: String,
        qos: QoS,
    },
    /// Subscription removed by UNSUBSCRIBE
    SubscriptionRemoved { client_id: Arc<str>, filter: String },
    /// Message fanned out
    MessagePublished {
        topic: Arc<str>,
        qos: QoS,
        recipients: usize,
    },
    /// A delivery reached a terminal state
    DeliveryFinished {
        client_id: Arc<str>,
        packet_id: Option<u16>,
        outcome: DeliveryOutcome,
    },
}

/// Errors returned by the broker API
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Topic name is not publishable
    InvalidTopic(&'static str),
    /// No live connection with that client id
    NotConnected(String),
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerError::InvalidTopic(reason) => write!(f, "invalid topic: {}", reason),
            BrokerError::NotConnected(client_id) => write!(f, "client not connected: {}", client_id),
        }
    }
}

impl std::error::Error for BrokerError {}

/// Why a connection is being closed from the server side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseReason {
    /// Same client id connected again
    TakenOver,
    /// `Broker::disconnect`
    Kicked,
    /// `Broker::shutdown`
    Shutdown,
}

/// Mailbox and close signal of a live connection
///
/// The close signal is separate from the mailbox so a connection blocked on
/// a slow peer still observes it.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionHandle {
    pub mailbox: mpsc::UnboundedSender<Delivery>,
    pub closer: Arc<watch::Sender<Option<CloseReason>>>,
}

impl ConnectionHandle {
    /// Ask the connection to close; the first reason wins
    pub fn close(&self, reason: CloseReason) {
        self.closer.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
    }
}

/// State shared by the broker and all connection actors
pub(crate) struct Shared {
    pub config: BrokerConfig,
    pub subscriptions: SubscriptionRegistry,
    /// client id -> current attachment
    pub clients: DashMap<Arc<str>, ConnectionId>,
    /// Live attachments
    pub connections: DashMap<ConnectionId, ConnectionHandle>,
    pub events: broadcast::Sender<BrokerEvent>,
    pub hooks: Arc<dyn Hooks>,
    next_connection_id: AtomicU64,
}

impl Shared {
    pub fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.next_connection_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn emit(&self, event: BrokerEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }
}

/// The MQTT Broker
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct Broker {
    shared: Arc<Shared>,
}

impl Broker {
    /// Create a new broker with default hooks (allows everything)
    pub fn new(config: BrokerConfig) -> Self {
        Self::with_hooks(config, Arc::new(DefaultHooks))
    }

    /// Create a new broker with custom hooks
    pub fn with_hooks(config: BrokerConfig, hooks: Arc<dyn Hooks>) -> Self {
        let (events, _) = broadcast::channel(1024);

        Self {
            shared: Arc::new(Shared {
                subscriptions: SubscriptionRegistry::new(config.max_qos),
                config,
                clients: DashMap::new(),
                connections: DashMap::new(),
                events,
                hooks,
                next_connection_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.shared.config
    }

    /// Start serving a transport; the task ends when the connection closes
    pub fn accept(&self, transport: Transport) -> JoinHandle<()> {
        let id = self.shared.next_connection_id();
        debug!("Accepting connection {}", id);
        let conn = Connection::new(id, self.shared.clone(), transport);
        tokio::spawn(conn.run())
    }

    /// Publish a message from the server to all matching subscribers
    pub fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<DeliveryReceipt, BrokerError> {
        validate_topic_name(topic).map_err(BrokerError::InvalidTopic)?;
        let message = Message::new(topic, payload, qos).with_retain(retain);
        Ok(self.shared.dispatch(None, message))
    }

    /// Deliver a message to one connected client, bypassing subscriptions
    pub fn publish_to(
        &self,
        client_id: &str,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<DeliveryReceipt, BrokerError> {
        validate_topic_name(topic).map_err(BrokerError::InvalidTopic)?;
        let message = Message::new(topic, payload, qos).with_retain(retain);
        self.shared.dispatch_to(client_id, message)
    }

    /// Close a client's connection from the server side
    pub fn disconnect(&self, client_id: &str) -> bool {
        let Some(id) = self.shared.clients.get(client_id).map(|entry| *entry) else {
            return false;
        };
        match self.shared.connections.get(&id) {
            Some(handle) => {
                handle.close(CloseReason::Kicked);
                true
            }
            None => false,
        }
    }

    /// Close every live connection
    pub fn shutdown(&self) {
        debug!("Shutting down {} connections", self.shared.connections.len());
        for handle in self.shared.connections.iter() {
            handle.close(CloseReason::Shutdown);
        }
    }

    /// Subscribe to broker events
    pub fn subscribe_events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.shared.events.subscribe()
    }

    /// Subscription registry (read access for inspection)
    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.shared.subscriptions
    }

    /// Get connection count
    pub fn connection_count(&self) -> usize {
        self.shared.connections.len()
    }

    /// Whether a client id currently has a live connection
    pub fn is_connected(&self, client_id: &str) -> bool {
        self.shared.clients.contains_key(client_id)
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}
