//! Inbound dispatch and the send-side message lifecycle.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::delivery::{DeliveryOutcome, DeliveryTracker};
use crate::identity::{EndpointId, IdentityWatch, PeerId};
use crate::protocol::{DeliveryState, WireMessage, NO_RECEIVED_TIME};
use crate::registry::ConnectionRegistry;
use crate::store::{Contact, ContactStore, MessageStore, StoreError, StoredMessage};
use crate::transport::{Payload, Transport};
use crate::wire;

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub struct MessageRouter {
    transport: Arc<dyn Transport>,
    registry: Arc<ConnectionRegistry>,
    delivery: Arc<DeliveryTracker>,
    contacts: Arc<dyn ContactStore>,
    messages: Arc<dyn MessageStore>,
    identity: IdentityWatch,
}

impl MessageRouter {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<ConnectionRegistry>,
        delivery: Arc<DeliveryTracker>,
        contacts: Arc<dyn ContactStore>,
        messages: Arc<dyn MessageStore>,
        identity: IdentityWatch,
    ) -> Self {
        Self {
            transport,
            registry,
            delivery,
            contacts,
            messages,
            identity,
        }
    }

    /// Drain the inbound buffer until every sender is gone.
    pub async fn run(self: Arc<Self>, mut inbound: broadcast::Receiver<Vec<u8>>) {
        loop {
            let bytes = match inbound.recv().await {
                Ok(bytes) => bytes,
                Err(broadcast::error::RecvError::Lagged(dropped)) => {
                    warn!(dropped, "inbound buffer overflowed, oldest payloads dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            // A panicking handler must not take the loop down with it.
            let router = Arc::clone(&self);
            let handled = tokio::spawn(async move { router.handle_payload(&bytes).await }).await;
            match handled {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "failed to handle inbound payload"),
                Err(e) => error!(error = %e, "inbound handler panicked"),
            }
        }
        debug!("inbound loop finished");
    }

    /// Decode one inbound payload and apply it to the stores.
    pub async fn handle_payload(self: &Arc<Self>, bytes: &[u8]) -> Result<(), StoreError> {
        match wire::decode(bytes) {
            WireMessage::Announce {
                origin_peer_id,
                display_name,
            } => {
                debug!(peer_id = %origin_peer_id, "announce received");
                self.on_announce(origin_peer_id, display_name).await
            }
            WireMessage::Chat {
                message_id,
                origin_peer_id,
                body,
                sent_at,
                ..
            } => {
                debug!(%message_id, peer_id = %origin_peer_id, "chat received");
                self.on_chat(message_id, origin_peer_id, body, sent_at).await
            }
            WireMessage::Unrecognized { raw_bytes } => {
                error!(bytes = %hex::encode(&raw_bytes), "unrecognized payload");
                Ok(())
            }
        }
    }

    async fn on_announce(
        self: &Arc<Self>,
        peer_id: PeerId,
        display_name: String,
    ) -> Result<(), StoreError> {
        let last_seen_at = now_millis();
        match self.contacts.contact_by_peer_id(&peer_id).await? {
            Some(mut contact) => {
                contact.display_name = display_name;
                contact.last_seen_at = last_seen_at;
                self.contacts.update_contact(&contact).await?;
            }
            None => {
                self.contacts
                    .insert_contact(Contact {
                        id: 0,
                        peer_id: peer_id.clone(),
                        display_name,
                        last_seen_at,
                    })
                    .await?;
            }
        }
        // An announce means the link is fully up; the only replay trigger.
        self.replay_unsent(&peer_id);
        Ok(())
    }

    async fn on_chat(
        &self,
        message_id: Uuid,
        origin_peer_id: PeerId,
        body: String,
        sent_at: i64,
    ) -> Result<(), StoreError> {
        let target_peer_id = self.identity.borrow().peer_id.clone();
        self.messages
            .insert_message(StoredMessage {
                id: 0,
                uuid: message_id,
                origin_peer_id: origin_peer_id.clone(),
                target_peer_id,
                body,
                sent_at,
                received_at: now_millis(),
                delivery_state: DeliveryState::None,
            })
            .await?;

        if let Some(mut contact) = self.contacts.contact_by_peer_id(&origin_peer_id).await? {
            contact.last_seen_at = now_millis();
            self.contacts.update_contact(&contact).await?;
        }
        Ok(())
    }

    /// Persist a new outgoing message and start delivering it.
    ///
    /// The receiver yields `NoEndpoint` alone when the peer is not connected,
    /// otherwise `Sending` followed by `Success` or `Error`. Each state is
    /// stored before it is yielded. Dropping the receiver does not stop the
    /// send.
    pub async fn send_message(
        self: &Arc<Self>,
        target_peer_id: PeerId,
        body: String,
        message_id: Uuid,
    ) -> Result<mpsc::Receiver<DeliveryState>, StoreError> {
        let endpoint = self.registry.get(&target_peer_id);
        let initial = if endpoint.is_some() {
            DeliveryState::Sending
        } else {
            DeliveryState::NoEndpoint
        };
        let origin_peer_id = self.identity.borrow().peer_id.clone();
        let stored = self
            .messages
            .insert_message(StoredMessage {
                id: 0,
                uuid: message_id,
                origin_peer_id,
                target_peer_id,
                body,
                sent_at: now_millis(),
                received_at: NO_RECEIVED_TIME,
                delivery_state: initial,
            })
            .await?;

        let (tx, rx) = mpsc::channel(2);
        let _ = tx.try_send(initial);
        let Some(endpoint) = endpoint else {
            debug!(%message_id, peer_id = %stored.target_peer_id, "no endpoint for peer");
            return Ok(rx);
        };

        let router = Arc::clone(self);
        tokio::spawn(async move {
            let state = router.deliver_stored(stored, &endpoint).await;
            let _ = tx.send(state).await;
        });
        Ok(rx)
    }

    /// Resend everything addressed to `peer_id` that has not succeeded yet.
    /// Each message goes out on its own task.
    pub fn replay_unsent(self: &Arc<Self>, peer_id: &PeerId) {
        let Some(endpoint) = self.registry.get(peer_id) else {
            warn!(%peer_id, "cannot replay, peer has no endpoint");
            return;
        };
        let router = Arc::clone(self);
        let peer_id = peer_id.clone();
        tokio::spawn(async move {
            let unsent = match router.messages.unsent_for_peer(&peer_id).await {
                Ok(unsent) => unsent,
                Err(e) => {
                    warn!(%peer_id, error = %e, "failed to load unsent messages");
                    return;
                }
            };
            debug!(%peer_id, count = unsent.len(), "replaying unsent messages");
            for message in unsent {
                let router = Arc::clone(&router);
                let endpoint = endpoint.clone();
                tokio::spawn(async move {
                    router.deliver_stored(message, &endpoint).await;
                });
            }
        });
    }

    /// Encode, send and wait for one stored message, then persist the result.
    async fn deliver_stored(&self, mut message: StoredMessage, endpoint: &EndpointId) -> DeliveryState {
        let frame = wire::encode(&WireMessage::Chat {
            message_id: message.uuid,
            origin_peer_id: message.origin_peer_id.clone(),
            body: message.body.clone(),
            sent_at: message.sent_at,
            received_at: NO_RECEIVED_TIME,
        });
        let outcome = match frame {
            Ok(frame) => self.deliver(endpoint, frame).await,
            Err(e) => {
                warn!(message_id = %message.uuid, error = %e, "failed to encode chat");
                DeliveryOutcome::Failed
            }
        };

        if outcome.is_success() {
            message.delivery_state = DeliveryState::Success;
            message.received_at = now_millis();
        } else {
            message.delivery_state = DeliveryState::Error;
        }
        if let Err(e) = self.messages.update_message(&message).await {
            warn!(message_id = %message.uuid, error = %e, "failed to persist delivery state");
        }
        message.delivery_state
    }

    /// Hand `bytes` to the transport and wait for its transfer result.
    pub(crate) async fn deliver(&self, endpoint: &EndpointId, bytes: Vec<u8>) -> DeliveryOutcome {
        self.delivery
            .await_delivery_result(Payload::from_bytes(bytes), endpoint, |endpoint, payload| {
                self.transport.send_payload(endpoint, payload)
            })
            .await
    }
}
