//! SUBSCRIBE and UNSUBSCRIBE packet handling

use smallvec::SmallVec;
use tracing::{debug, error};

use super::{Connection, ConnectionError};
use crate::broker::BrokerEvent;
use crate::protocol::{Packet, ProtocolError, QoS, SubAck, SubAckReturnCode, Subscribe, UnsubAck, Unsubscribe};
use crate::session::Session;
use crate::topic::validate_topic_filter;

impl Connection {
    /// Handle SUBSCRIBE packet
    ///
    /// A refused filter gets a failure return code; the connection stays up.
    pub(crate) async fn handle_subscribe(
        &mut self,
        session: &mut Session,
        subscribe: Subscribe,
    ) -> Result<(), ConnectionError> {
        if subscribe.subscriptions.is_empty() {
            return Err(ProtocolError::ProtocolViolation("SUBSCRIBE without topic filters").into());
        }

        let client_id = session.client_id.clone();
        let mut return_codes = Vec::with_capacity(subscribe.subscriptions.len());
        let mut granted: SmallVec<[(&str, QoS); 4]> = SmallVec::new();

        for sub in &subscribe.subscriptions {
            if let Err(reason) = validate_topic_filter(&sub.filter) {
                debug!("Invalid filter {:?} from {}: {}", sub.filter, client_id, reason);
                return_codes.push(SubAckReturnCode::Failure);
                continue;
            }

            match self
                .shared
                .hooks
                .on_subscribe_check(&client_id, &sub.filter, sub.qos)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    debug!("SUBSCRIBE denied for {} to filter {}", client_id, sub.filter);
                    return_codes.push(SubAckReturnCode::Failure);
                    continue;
                }
                Err(e) => {
                    error!("Subscribe check error for {}: {}", client_id, e);
                    return_codes.push(SubAckReturnCode::Failure);
                    continue;
                }
            }

            match self
                .shared
                .subscriptions
                .subscribe(self.id, &client_id, &sub.filter, sub.qos)
            {
                Ok(qos) => {
                    debug!("{} subscribed to {} (QoS {})", client_id, sub.filter, qos);
                    return_codes.push(SubAckReturnCode::Success(qos));
                    granted.push((sub.filter.as_str(), qos));
                }
                Err(e) => {
                    debug!("SUBSCRIBE from {} rejected: {}", client_id, e);
                    return_codes.push(SubAckReturnCode::Failure);
                }
            }
        }

        self.send(Packet::SubAck(SubAck {
            packet_id: subscribe.packet_id,
            return_codes,
        }))
        .await?;

        for (filter, qos) in granted {
            self.shared.emit(BrokerEvent::SubscriptionAdded {
                client_id: client_id.clone(),
                filter: filter.to_string(),
                qos,
            });
            self.shared.hooks.on_subscribed(&client_id, filter, qos).await;
        }

        Ok(())
    }

    /// Handle UNSUBSCRIBE packet
    pub(crate) async fn handle_unsubscribe(
        &mut self,
        session: &mut Session,
        unsubscribe: Unsubscribe,
    ) -> Result<(), ConnectionError> {
        let client_id = session.client_id.clone();
        let mut removed: SmallVec<[&str; 4]> = SmallVec::new();

        for filter in &unsubscribe.filters {
            if self.shared.subscriptions.unsubscribe(self.id, filter) {
                removed.push(filter.as_str());
            } else {
                debug!("{} unsubscribed from unknown filter {}", client_id, filter);
            }
        }

        // UNSUBACK is sent whether or not anything matched
        self.send(Packet::UnsubAck(UnsubAck {
            packet_id: unsubscribe.packet_id,
        }))
        .await?;

        for filter in removed {
            self.shared.emit(BrokerEvent::SubscriptionRemoved {
                client_id: client_id.clone(),
                filter: filter.to_string(),
            });
            self.shared.hooks.on_unsubscribed(&client_id, filter).await;
        }

        Ok(())
    }
}
