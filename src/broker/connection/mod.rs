//! MQTT Connection Handler
//!
//! One actor per accepted transport. It exclusively owns the connection's
//! session and processes its sources sequentially: inbound packets, mailbox
//! deliveries from fan-out, the server-side close signal and timers
//! (retransmission and keep-alive).

mod connect;
mod disconnect;
mod publish;
mod qos;
mod subscribe;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

use super::{CloseReason, ConnectionId, Shared, Transport};
use crate::delivery::Delivery;
use crate::protocol::{Packet, ProtocolError};
use crate::session::Session;

/// Connection error types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Peer went away (inbound closed or outbound send failed)
    Closed,
    Protocol(ProtocolError),
    /// No CONNECT within the connect timeout
    Timeout,
    /// Peer stopped reading; a write did not complete within the retry interval
    Stalled,
    /// Another connection took over the client id
    TakenOver,
    /// Closed by `Broker::disconnect`
    Kicked,
    Shutdown,
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Closed => write!(f, "Connection closed"),
            ConnectionError::Protocol(e) => write!(f, "Protocol error: {}", e),
            ConnectionError::Timeout => write!(f, "Connection timeout"),
            ConnectionError::Stalled => write!(f, "Peer stopped reading"),
            ConnectionError::TakenOver => write!(f, "Session taken over"),
            ConnectionError::Kicked => write!(f, "Disconnected by server"),
            ConnectionError::Shutdown => write!(f, "Shutdown"),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<ProtocolError> for ConnectionError {
    fn from(e: ProtocolError) -> Self {
        ConnectionError::Protocol(e)
    }
}

impl From<CloseReason> for ConnectionError {
    fn from(reason: CloseReason) -> Self {
        match reason {
            CloseReason::TakenOver => ConnectionError::TakenOver,
            CloseReason::Kicked => ConnectionError::Kicked,
            CloseReason::Shutdown => ConnectionError::Shutdown,
        }
    }
}

/// Connection actor
pub(crate) struct Connection {
    pub(crate) id: ConnectionId,
    pub(crate) shared: Arc<Shared>,
    pub(crate) inbound: mpsc::Receiver<Packet>,
    pub(crate) outbound: mpsc::Sender<Packet>,
    /// Cloned into the connection table once CONNECT is accepted
    pub(crate) mailbox_tx: mpsc::UnboundedSender<Delivery>,
    pub(crate) mailbox: mpsc::UnboundedReceiver<Delivery>,
    pub(crate) closer: Arc<watch::Sender<Option<CloseReason>>>,
    pub(crate) closed: watch::Receiver<Option<CloseReason>>,
}

impl Connection {
    pub fn new(id: ConnectionId, shared: Arc<Shared>, transport: Transport) -> Self {
        let (mailbox_tx, mailbox) = mpsc::unbounded_channel();
        let (closer, closed) = watch::channel(None);
        Self {
            id,
            shared,
            inbound: transport.inbound,
            outbound: transport.outbound,
            mailbox_tx,
            mailbox,
            closer: Arc::new(closer),
            closed,
        }
    }

    /// Run the connection to completion
    pub async fn run(mut self) {
        let connect_timeout = self.shared.config.connect_timeout;
        let connected = timeout(connect_timeout, self.read_connect())
            .await
            .unwrap_or(Err(ConnectionError::Timeout));
        let mut session = match connected {
            Ok(session) => session,
            Err(e) => {
                debug!("Connection {} closed before CONNECT completed: {}", self.id, e);
                return;
            }
        };

        let result = self.run_connected(&mut session).await;
        let graceful = match &result {
            Ok(()) => true,
            Err(e @ ConnectionError::Protocol(_)) => {
                warn!("Closing {}: {}", session.client_id, e);
                false
            }
            Err(e) => {
                debug!("Closing {}: {}", session.client_id, e);
                false
            }
        };

        self.handle_disconnect(&mut session, graceful).await;
    }

    /// Main loop; `Ok` means the client sent DISCONNECT
    async fn run_connected(&mut self, session: &mut Session) -> Result<(), ConnectionError> {
        // 1.5x keep_alive, 0 disables
        let keep_alive = (session.keep_alive > 0)
            .then(|| Duration::from_millis(session.keep_alive as u64 * 1500));
        let mut keep_alive_deadline = keep_alive.map(|ka| Instant::now() + ka);
        let retry_interval = self.shared.config.retry_interval;

        loop {
            let retry_deadline = session.next_deadline(retry_interval);

            tokio::select! {
                packet = self.inbound.recv() => {
                    let packet = packet.ok_or(ConnectionError::Closed)?;
                    if let Some(ka) = keep_alive {
                        keep_alive_deadline = Some(Instant::now() + ka);
                    }

                    if let Packet::Disconnect = packet {
                        debug!("DISCONNECT from {}", session.client_id);
                        return Ok(());
                    }
                    self.handle_packet(session, packet).await?;
                }

                reason = close_requested(&mut self.closed) => {
                    return Err(reason.into());
                }

                delivery = self.mailbox.recv() => {
                    match delivery {
                        Some(delivery) => self.deliver(session, delivery).await?,
                        None => return Err(ConnectionError::Shutdown),
                    }
                }

                _ = sleep_until_opt(retry_deadline) => {
                    self.retry_due(session).await?;
                }

                _ = sleep_until_opt(keep_alive_deadline) => {
                    info!("Keep alive timeout for {} - disconnecting", session.client_id);
                    return Err(ProtocolError::KeepAliveTimeout.into());
                }
            }
        }
    }

    /// Handle an incoming packet
    async fn handle_packet(&mut self, session: &mut Session, packet: Packet) -> Result<(), ConnectionError> {
        match packet {
            Packet::Connect(_) => Err(ProtocolError::ProtocolViolation("duplicate CONNECT").into()),
            Packet::Publish(publish) => self.handle_publish(session, publish).await,
            Packet::PubAck(puback) => self.handle_puback(session, puback).await,
            Packet::PubRec(pubrec) => self.handle_pubrec(session, pubrec).await,
            Packet::PubRel(pubrel) => self.handle_pubrel(session, pubrel).await,
            Packet::PubComp(pubcomp) => self.handle_pubcomp(session, pubcomp).await,
            Packet::Subscribe(subscribe) => self.handle_subscribe(session, subscribe).await,
            Packet::Unsubscribe(unsubscribe) => self.handle_unsubscribe(session, unsubscribe).await,
            Packet::PingReq => self.send(Packet::PingResp).await,
            _ => {
                // Server-to-client packet types
                warn!(
                    "Unexpected packet type from {}: {:?}",
                    session.client_id,
                    packet.packet_type()
                );
                Ok(())
            }
        }
    }

    /// Write a packet to the transport, preserving order
    ///
    /// A server-side close interrupts a write blocked on a full transport,
    /// and a write still blocked after one retry interval fails as `Stalled`.
    pub(crate) async fn send(&mut self, packet: Packet) -> Result<(), ConnectionError> {
        let stall_limit = self.shared.config.retry_interval;
        tokio::select! {
            biased;
            reason = close_requested(&mut self.closed) => Err(reason.into()),
            sent = self.outbound.send(packet) => sent.map_err(|_| ConnectionError::Closed),
            _ = sleep(stall_limit) => Err(ConnectionError::Stalled),
        }
    }
}

/// Resolves once `Broker::disconnect`, `Broker::shutdown` or a takeover
/// asked this connection to close
async fn close_requested(closed: &mut watch::Receiver<Option<CloseReason>>) -> CloseReason {
    loop {
        if let Some(reason) = *closed.borrow_and_update() {
            return reason;
        }
        if closed.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

/// Generate a random ID
pub(crate) fn rand_id() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let hasher = RandomState::new().build_hasher();
    hasher.finish()
}
