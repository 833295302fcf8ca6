//! VibeMQ Delivery - loopback demo
//!
//! Starts a broker in-process, attaches one in-memory subscriber that
//! acknowledges every message according to its QoS, publishes a message and
//! prints how delivery ended for each recipient.
//!
//! Usage:
//!   vibemq-delivery [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>     Configuration file path
//!   -t, --topic <TOPIC>     Topic to subscribe and publish to (default: /my_topic)
//!   -m, --message <TEXT>    Payload (default: Hello)
//!   -q, --qos <QOS>         QoS for both subscription and publish (default: 0)
//!   -l, --log-level         Log level (error, warn, info, debug, trace)
//!   -h, --help              Print help

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::{debug, info};

use vibemq_delivery::broker::{Broker, ClientEnd, Transport};
use vibemq_delivery::config::Config;
use vibemq_delivery::logging;
use vibemq_delivery::protocol::{
    Connect, Packet, PubAck, PubComp, PubRec, QoS, Subscribe, Subscription,
};

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// VibeMQ Delivery - MQTT QoS delivery loopback demo
#[derive(Parser, Debug)]
#[command(name = "vibemq-delivery")]
#[command(author = "VibeMQ Contributors")]
#[command(version)]
#[command(about = "Publish one message through an in-process MQTT delivery core")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Topic to subscribe and publish to
    #[arg(short, long, default_value = "/my_topic")]
    topic: String,

    /// Message payload
    #[arg(short, long, default_value = "Hello")]
    message: String,

    /// QoS level (0, 1, or 2)
    #[arg(short, long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=2))]
    qos: u8,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

/// Acknowledge everything the broker sends, per QoS, until the connection closes
async fn run_subscriber(mut client: ClientEnd) {
    while let Some(packet) = client.recv().await {
        let reply = match packet {
            Packet::Publish(publish) => {
                info!(
                    "Subscriber received {:?} on {} (QoS {})",
                    String::from_utf8_lossy(&publish.payload),
                    publish.topic,
                    publish.qos
                );
                match (publish.qos, publish.packet_id) {
                    (QoS::AtLeastOnce, Some(id)) => Some(Packet::PubAck(PubAck::new(id))),
                    (QoS::ExactlyOnce, Some(id)) => Some(Packet::PubRec(PubRec::new(id))),
                    _ => None,
                }
            }
            Packet::PubRel(pubrel) => Some(Packet::PubComp(PubComp::new(pubrel.packet_id))),
            other => {
                debug!("Subscriber got {:?}", other.packet_type());
                None
            }
        };

        if let Some(reply) = reply {
            if !client.send(reply).await {
                break;
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    // Load configuration file if specified, otherwise defaults plus environment
    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::from_env()?,
    };

    // CLI overrides config
    let level = args
        .log_level
        .map(LogLevel::as_str)
        .unwrap_or(config.log.level.as_str());
    logging::init(level)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    let qos = QoS::from_u8(args.qos).unwrap_or_default();
    let broker = Broker::new(config.broker_config());

    // Attach the subscriber
    let (transport, mut client) = Transport::pair(64);
    let connection = broker.accept(transport);

    client.send(Packet::Connect(Connect::new("subscriber"))).await;
    match client.recv().await {
        Some(Packet::ConnAck(connack)) => debug!("CONNACK: {:?}", connack.return_code),
        other => return Err(format!("expected CONNACK, got {:?}", other).into()),
    }

    client
        .send(Packet::Subscribe(Subscribe {
            packet_id: 1,
            subscriptions: vec![Subscription::new(args.topic.clone(), qos)],
        }))
        .await;
    match client.recv().await {
        Some(Packet::SubAck(suback)) if suback.return_codes.iter().all(|rc| rc.is_success()) => {
            info!("Subscribed to {} ({:?})", args.topic, suback.return_codes);
        }
        other => return Err(format!("subscription refused: {:?}", other).into()),
    }

    let subscriber = tokio::spawn(run_subscriber(client));

    let receipt = broker.publish(&args.topic, args.message.clone().into_bytes(), qos, false)?;
    info!("Published {:?} to {} recipients", args.message, receipt.len());

    for report in receipt.outcomes().await {
        println!(
            "{}: QoS {} delivery {}",
            report.client_id, report.qos, report.outcome
        );
    }

    broker.shutdown();
    connection.await?;
    subscriber.await?;

    Ok(())
}
