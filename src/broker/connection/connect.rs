//! CONNECT handling and client registration

use std::sync::Arc;

use tracing::debug;

use super::{Connection, ConnectionError};
use crate::broker::{BrokerEvent, CloseReason, ConnectionHandle};
use crate::protocol::{ConnAck, Connect, ConnectReturnCode, Packet, ProtocolError};
use crate::session::Session;

impl Connection {
    /// Wait for CONNECT, acknowledge it and register the connection
    pub(crate) async fn read_connect(&mut self) -> Result<Session, ConnectionError> {
        let packet = self.inbound.recv().await.ok_or(ConnectionError::Closed)?;
        let Packet::Connect(connect) = packet else {
            debug!("First packet on connection {} was not CONNECT", self.id);
            return Err(ProtocolError::ProtocolViolation("first packet must be CONNECT").into());
        };

        let Connect {
            client_id,
            keep_alive,
            ..
        } = connect;

        // Empty client id: assign one
        let client_id: Arc<str> = if client_id.is_empty() {
            format!("vibemq-{:x}", super::rand_id()).into()
        } else {
            client_id.into()
        };

        debug!("CONNECT on {} (client_id: {})", self.id, client_id);

        self.send(Packet::ConnAck(ConnAck {
            session_present: false,
            return_code: ConnectReturnCode::Accepted,
        }))
        .await?;

        self.register(&client_id);

        self.shared.emit(BrokerEvent::ClientConnected {
            client_id: client_id.clone(),
        });
        self.shared.hooks.on_client_connected(&client_id).await;

        Ok(Session::new(
            client_id,
            keep_alive,
            self.shared.config.session_limits(),
        ))
    }

    /// Publish this connection in the connection table, closing any older
    /// connection with the same client id
    fn register(&self, client_id: &Arc<str>) {
        self.shared.connections.insert(
            self.id,
            ConnectionHandle {
                mailbox: self.mailbox_tx.clone(),
                closer: self.closer.clone(),
            },
        );

        let previous = self.shared.clients.insert(client_id.clone(), self.id);
        if let Some(previous) = previous.filter(|prev| *prev != self.id) {
            debug!("Client {} taking over from connection {}", client_id, previous);
            if let Some(handle) = self.shared.connections.get(&previous) {
                handle.close(CloseReason::TakenOver);
            }
        }
    }
}
