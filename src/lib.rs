//! VibeMQ Delivery - MQTT v3.1.1 message-delivery core
//!
//! Subscriptions, topic matching, packet identifier management and the
//! QoS 0/1/2 handshakes that carry a published message to every matching
//! subscriber. Connections are plugged in through a packet-level
//! [`broker::Transport`]; wire encoding and sockets stay outside.

pub mod broker;
pub mod config;
pub mod delivery;
pub mod hooks;
pub mod logging;
pub mod protocol;
pub mod session;
pub mod topic;

pub use broker::{Broker, BrokerConfig, BrokerError, BrokerEvent, ClientEnd, Transport};
pub use config::Config;
pub use delivery::{DeliveryOutcome, DeliveryReceipt, DeliveryReport, Message};
pub use hooks::{CompositeHooks, DefaultHooks, Hooks};
pub use protocol::{Packet, QoS};
pub use topic::{matches, SubscriptionRegistry};
