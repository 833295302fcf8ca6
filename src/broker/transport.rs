//! Connection transport boundary
//!
//! A transport hands decoded inbound packets to the broker and accepts
//! outbound packets in send order. Byte framing and sockets live on the other
//! side of these channels. The inbound channel closing is the "connection
//! closed" notification.

use tokio::sync::mpsc;

use crate::protocol::Packet;

/// Broker-side end of a connection
#[derive(Debug)]
pub struct Transport {
    pub(crate) inbound: mpsc::Receiver<Packet>,
    pub(crate) outbound: mpsc::Sender<Packet>,
}

impl Transport {
    /// Wrap an existing pair of channels
    pub fn new(inbound: mpsc::Receiver<Packet>, outbound: mpsc::Sender<Packet>) -> Self {
        Self { inbound, outbound }
    }

    /// Create a connected in-memory pair
    pub fn pair(capacity: usize) -> (Transport, ClientEnd) {
        let (to_broker, inbound) = mpsc::channel(capacity);
        let (outbound, from_broker) = mpsc::channel(capacity);
        (
            Transport { inbound, outbound },
            ClientEnd {
                tx: to_broker,
                rx: from_broker,
            },
        )
    }
}

/// Peer-side end of an in-memory transport
#[derive(Debug)]
pub struct ClientEnd {
    tx: mpsc::Sender<Packet>,
    rx: mpsc::Receiver<Packet>,
}

impl ClientEnd {
    /// Send a packet to the broker; false once the broker side is gone
    pub async fn send(&self, packet: Packet) -> bool {
        self.tx.send(packet).await.is_ok()
    }

    /// Next packet from the broker; `None` once the connection is closed
    pub async fn recv(&mut self) -> Option<Packet> {
        self.rx.recv().await
    }
}
