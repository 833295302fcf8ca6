//! Hooks Module
//!
//! Application-layer callbacks mirroring the subscription and delivery
//! handshakes, so embedding code can observe them without handling packets.

use std::fmt;

use async_trait::async_trait;

use crate::delivery::{DeliveryOutcome, Message};
use crate::protocol::QoS;


/// Hook error types
#[derive(Debug)]
pub enum HookError {
    /// Internal error
    Internal(String),
    /// Authorization denied
    AuthorizationDenied,
}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookError::Internal(msg) => write!(f, "Internal error: {}", msg),
            HookError::AuthorizationDenied => write!(f, "Authorization denied"),
        }
    }
}

impl std::error::Error for HookError {}

/// Hook result type
pub type HookResult<T> = Result<T, HookError>;

/// Broker hooks trait
///
/// All methods have default implementations that allow everything and
/// otherwise do nothing. Hooks run on the connection's own task, so a slow
/// hook only delays that connection.
#[async_trait]
pub trait Hooks: Send + Sync {
    /// Called after CONNACK has been sent
    async fn on_client_connected(&self, _client_id: &str) {}

    /// Called once a connection has been torn down
    ///
    /// # Arguments
    /// * `client_id` - The client identifier
    /// * `graceful` - Whether the client sent DISCONNECT
    async fn on_client_disconnected(&self, _client_id: &str, _graceful: bool) {}

    /// Called for each filter of a SUBSCRIBE before it is registered
    ///
    /// # Returns
    /// * `Ok(true)` - Subscribe allowed
    /// * `Ok(false)` - Subscribe denied (SUBACK failure code)
    /// * `Err(_)` - Internal error occurred (treated as denied)
    async fn on_subscribe_check(&self, _client_id: &str, _filter: &str, _qos: QoS) -> HookResult<bool> {
        Ok(true)
    }

    /// Called after a subscription was registered and acknowledged
    async fn on_subscribed(&self, _client_id: &str, _filter: &str, _granted_qos: QoS) {}

    /// Called after a subscription was removed by UNSUBSCRIBE
    async fn on_unsubscribed(&self, _client_id: &str, _filter: &str) {}

    /// Called exactly once per message accepted from a publishing client
    async fn on_message_received(&self, _client_id: &str, _message: &Message) {}

    /// Subscriber acknowledged a QoS 1 message (PUBACK)
    async fn on_publish_acknowledged(&self, _client_id: &str, _packet_id: u16) {}

    /// Subscriber received a QoS 2 message (PUBREC)
    async fn on_publish_received(&self, _client_id: &str, _packet_id: u16) {}

    /// Publisher released a QoS 2 message (PUBREL)
    async fn on_publish_released(&self, _client_id: &str, _packet_id: u16) {}

    /// Subscriber completed a QoS 2 message (PUBCOMP)
    async fn on_publish_completed(&self, _client_id: &str, _packet_id: u16) {}

    /// A delivery ended as `Failed`, `Dropped` or `PoolExhausted`
    async fn on_delivery_failed(&self, _client_id: &str, _message: &Message, _outcome: DeliveryOutcome) {}
}

/// Default hooks implementation that allows everything
pub struct DefaultHooks;

#[async_trait]
impl Hooks for DefaultHooks {
    // All methods use default implementations (allow all, no-op)
}

impl Default for DefaultHooks {
    fn default() -> Self {
        Self
    }
}

/// Implement Hooks for Arc<T> where T: Hooks
/// This allows Arc-wrapped hook providers to be used directly
#[async_trait]
impl<T: Hooks + ?Sized> Hooks for std::sync::Arc<T> {
    async fn on_client_connected(&self, client_id: &str) {
        (**self).on_client_connected(client_id).await;
    }

    async fn on_client_disconnected(&self, client_id: &str, graceful: bool) {
        (**self).on_client_disconnected(client_id, graceful).await;
    }

    async fn on_subscribe_check(&self, client_id: &str, filter: &str, qos: QoS) -> HookResult<bool> {
        (**self).on_subscribe_check(client_id, filter, qos).await
    }

    async fn on_subscribed(&self, client_id: &str, filter: &str, granted_qos: QoS) {
        (**self).on_subscribed(client_id, filter, granted_qos).await;
    }

    async fn on_unsubscribed(&self, client_id: &str, filter: &str) {
        (**self).on_unsubscribed(client_id, filter).await;
    }

    async fn on_message_received(&self, client_id: &str, message: &Message) {
        (**self).on_message_received(client_id, message).await;
    }

    async fn on_publish_acknowledged(&self, client_id: &str, packet_id: u16) {
        (**self).on_publish_acknowledged(client_id, packet_id).await;
    }

    async fn on_publish_received(&self, client_id: &str, packet_id: u16) {
        (**self).on_publish_received(client_id, packet_id).await;
    }

    async fn on_publish_released(&self, client_id: &str, packet_id: u16) {
        (**self).on_publish_released(client_id, packet_id).await;
    }

    async fn on_publish_completed(&self, client_id: &str, packet_id: u16) {
        (**self).on_publish_completed(client_id, packet_id).await;
    }

    async fn on_delivery_failed(&self, client_id: &str, message: &Message, outcome: DeliveryOutcome) {
        (**self).on_delivery_failed(client_id, message, outcome).await;
    }
}

/// Composite hooks that chains multiple hook implementations
///
/// For authorization: all hooks must return `Ok(true)` for permission
/// For events: all hooks are called in order
pub struct CompositeHooks {
    hooks: Vec<Box<dyn Hooks>>,
}

impl CompositeHooks {
    /// Create a new composite hooks instance
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    /// Add a hooks implementation
    pub fn add<H: Hooks + 'static>(&mut self, hooks: H) {
        self.hooks.push(Box::new(hooks));
    }

    /// Add a hooks implementation and return self for chaining
    pub fn with<H: Hooks + 'static>(mut self, hooks: H) -> Self {
        self.add(hooks);
        self
    }
}

impl Default for CompositeHooks {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Hooks for CompositeHooks {
    async fn on_client_connected(&self, client_id: &str) {
        for hooks in &self.hooks {
            hooks.on_client_connected(client_id).await;
        }
    }

    async fn on_client_disconnected(&self, client_id: &str, graceful: bool) {
        for hooks in &self.hooks {
            hooks.on_client_disconnected(client_id, graceful).await;
        }
    }

    async fn on_subscribe_check(&self, client_id: &str, filter: &str, qos: QoS) -> HookResult<bool> {
        for hooks in &self.hooks {
            if !hooks.on_subscribe_check(client_id, filter, qos).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn on_subscribed(&self, client_id: &str, filter: &str, granted_qos: QoS) {
        for hooks in &self.hooks {
            hooks.on_subscribed(client_id, filter, granted_qos).await;
        }
    }

    async fn on_unsubscribed(&self, client_id: &str, filter: &str) {
        for hooks in &self.hooks {
            hooks.on_unsubscribed(client_id, filter).await;
        }
    }

    async fn on_message_received(&self, client_id: &str, message: &Message) {
        for hooks in &self.hooks {
            hooks.on_message_received(client_id, message).await;
        }
    }

    async fn on_publish_acknowledged(&self, client_id: &str, packet_id: u16) {
        for hooks in &self.hooks {
            hooks.on_publish_acknowledged(client_id, packet_id).await;
        }
    }

    async fn on_publish_received(&self, client_id: &str, packet_id: u16) {
        for hooks in &self.hooks {
            hooks.on_publish_received(client_id, packet_id).await;
        }
    }

    async fn on_publish_released(&self, client_id: &str, packet_id: u16) {
        for hooks in &self.hooks {
            hooks.on_publish_released(client_id, packet_id).await;
        }
    }

    async fn on_publish_completed(&self, client_id: &str, packet_id: u16) {
        for hooks in &self.hooks {
            hooks.on_publish_completed(client_id, packet_id).await;
        }
    }

    async fn on_delivery_failed(&self, client_id: &str, message: &Message, outcome: DeliveryOutcome) {
        for hooks in &self.hooks {
            hooks.on_delivery_failed(client_id, message, outcome).await;
        }
    }
}
