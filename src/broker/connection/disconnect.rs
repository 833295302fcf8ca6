//! Connection teardown

use tracing::debug;

use super::Connection;
use crate::broker::BrokerEvent;
use crate::delivery::{DeliveryOutcome, Message};
use crate::session::Session;

impl Connection {
    /// Handle disconnection
    ///
    /// Runs for every close cause. Once it returns, nothing addressed to this
    /// connection is left pending: in-flight, queued and not-yet-processed
    /// deliveries are all completed as `Dropped` and every id is released.
    pub(crate) async fn handle_disconnect(&mut self, session: &mut Session, graceful: bool) {
        // Deregister first so the dispatcher stops routing here
        self.shared.connections.remove(&self.id);
        self.shared
            .clients
            .remove_if(&session.client_id, |_, id| *id == self.id);
        self.shared.subscriptions.remove_all(self.id);
        self.mailbox.close();

        let mut dropped: Vec<Message> = session.close();
        while let Ok(delivery) = self.mailbox.try_recv() {
            dropped.push(delivery.message.clone());
            delivery.finish(DeliveryOutcome::Dropped);
        }

        if !dropped.is_empty() {
            debug!(
                "Dropped {} pending deliveries for {}",
                dropped.len(),
                session.client_id
            );
        }
        for message in &dropped {
            self.delivery_failed(session, None, message, DeliveryOutcome::Dropped)
                .await;
        }

        self.shared.emit(BrokerEvent::ClientDisconnected {
            client_id: session.client_id.clone(),
            graceful,
        });
        self.shared
            .hooks
            .on_client_disconnected(&session.client_id, graceful)
            .await;

        debug!("Connection {} for {} closed", self.id, session.client_id);
    }
}
