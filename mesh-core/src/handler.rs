//! Facade over the orchestrator and router: what a host application drives.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::MeshConfig;
use crate::delivery::DeliveryTracker;
use crate::identity::{IdentityWatch, PeerId};
use crate::orchestrator::ConnectionOrchestrator;
use crate::protocol::DeliveryState;
use crate::registry::{ConnectionRegistry, PeerSet};
use crate::router::MessageRouter;
use crate::store::{ContactStore, MessageStore, StoreError};
use crate::transport::{Transport, TransportEvents};

/// One row of the conversation list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    pub peer_id: PeerId,
    pub display_name: String,
    pub last_seen_at: i64,
    /// Body of the latest message the peer sent us, if any.
    pub last_message: Option<String>,
    pub connected: bool,
}

pub struct MeshHandler {
    orchestrator: Arc<ConnectionOrchestrator>,
    router: Arc<MessageRouter>,
    registry: Arc<ConnectionRegistry>,
    contacts: Arc<dyn ContactStore>,
    messages: Arc<dyn MessageStore>,
    tasks: Vec<JoinHandle<()>>,
}

impl MeshHandler {
    /// Wire up the engine and spawn its two long-lived loops.
    /// Must be called from within a Tokio runtime.
    pub fn new(
        transport: Arc<dyn Transport>,
        contacts: Arc<dyn ContactStore>,
        messages: Arc<dyn MessageStore>,
        identity: IdentityWatch,
        config: MeshConfig,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let delivery = Arc::new(DeliveryTracker::new(config.delivery_wait()));
        let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = broadcast::channel(config.inbound_buffer.max(1));
        let events = TransportEvents::new(lifecycle_tx, inbound_tx, delivery.clone());

        let orchestrator = Arc::new(ConnectionOrchestrator::new(
            transport.clone(),
            registry.clone(),
            identity.clone(),
            events,
            config,
        ));
        let router = Arc::new(MessageRouter::new(
            transport,
            registry.clone(),
            delivery,
            contacts.clone(),
            messages.clone(),
            identity,
        ));
        let tasks = vec![
            tokio::spawn(orchestrator.clone().run(lifecycle_rx)),
            tokio::spawn(router.clone().run(inbound_rx)),
        ];
        Self {
            orchestrator,
            router,
            registry,
            contacts,
            messages,
            tasks,
        }
    }

    pub async fn start(&self) {
        self.orchestrator.start().await;
    }

    pub fn stop(&self) {
        self.orchestrator.stop();
    }

    /// See [`MessageRouter::send_message`].
    pub async fn send_message(
        &self,
        peer_id: PeerId,
        body: impl Into<String>,
        message_id: Uuid,
    ) -> Result<mpsc::Receiver<DeliveryState>, StoreError> {
        self.router
            .send_message(peer_id, body.into(), message_id)
            .await
    }

    pub fn connected_peers(&self) -> watch::Receiver<PeerSet> {
        self.registry.subscribe()
    }

    /// Every contact with its latest inbound message, most recently seen first.
    pub async fn conversations(&self) -> Result<Vec<ConversationSummary>, StoreError> {
        let connected = self.registry.snapshot();
        let mut out = Vec::new();
        for contact in self.contacts.all_contacts().await? {
            let last_message = self
                .messages
                .last_message_body_for_peer(&contact.peer_id)
                .await?;
            out.push(ConversationSummary {
                connected: connected.contains(&contact.peer_id),
                peer_id: contact.peer_id,
                display_name: contact.display_name,
                last_seen_at: contact.last_seen_at,
                last_message,
            });
        }
        out.sort_by(|a, b| b.last_seen_at.cmp(&a.last_seen_at));
        Ok(out)
    }
}

impl Drop for MeshHandler {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
