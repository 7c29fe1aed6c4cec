//! Persistence surface for contacts and messages, plus an in-memory store.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use crate::identity::PeerId;
use crate::protocol::{DeliveryState, NO_RECEIVED_TIME};

/// A message as persisted, sent or received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Row id assigned by the store on insert.
    pub id: i64,
    pub uuid: Uuid,
    pub origin_peer_id: PeerId,
    pub target_peer_id: PeerId,
    pub body: String,
    pub sent_at: i64,
    /// Epoch ms, or [`NO_RECEIVED_TIME`].
    pub received_at: i64,
    pub delivery_state: DeliveryState,
}

impl StoredMessage {
    pub fn is_received(&self) -> bool {
        self.received_at != NO_RECEIVED_TIME
    }
}

/// A peer we have heard announce itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: i64,
    pub peer_id: PeerId,
    pub display_name: String,
    pub last_seen_at: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("contact for {0} already exists")]
    DuplicateContact(PeerId),
    #[error("no contact for {0}")]
    ContactNotFound(PeerId),
    #[error("no message {0}")]
    MessageNotFound(Uuid),
    #[error("storage backend: {0}")]
    Backend(String),
}

#[async_trait]
pub trait ContactStore: Send + Sync {
    async fn all_contacts(&self) -> Result<Vec<Contact>, StoreError>;

    /// Full contact list, republished on every change.
    fn watch_contacts(&self) -> watch::Receiver<Vec<Contact>>;

    async fn contact_by_peer_id(&self, peer_id: &PeerId) -> Result<Option<Contact>, StoreError>;

    /// Insert a new contact; `peer_id` must be unique. Returns the row with its id.
    async fn insert_contact(&self, contact: Contact) -> Result<Contact, StoreError>;

    async fn update_contact(&self, contact: &Contact) -> Result<(), StoreError>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn all_messages(&self) -> Result<Vec<StoredMessage>, StoreError>;

    /// Full message list, republished on every change.
    fn watch_messages(&self) -> watch::Receiver<Vec<StoredMessage>>;

    /// Insert, replacing any row with the same uuid. Returns the row with its id.
    async fn insert_message(&self, message: StoredMessage) -> Result<StoredMessage, StoreError>;

    /// Overwrite the row with `message.uuid`.
    async fn update_message(&self, message: &StoredMessage) -> Result<(), StoreError>;

    async fn message_by_uuid(&self, uuid: &Uuid) -> Result<Option<StoredMessage>, StoreError>;

    /// Messages addressed to `peer_id` that have not reached `Success`.
    async fn unsent_for_peer(&self, peer_id: &PeerId) -> Result<Vec<StoredMessage>, StoreError>;

    /// Body of the most recent message (by `sent_at`) that `peer_id` sent us.
    async fn last_message_body_for_peer(
        &self,
        peer_id: &PeerId,
    ) -> Result<Option<String>, StoreError>;
}

#[derive(Default)]
struct Tables {
    contacts: Vec<Contact>,
    messages: Vec<StoredMessage>,
    next_contact_id: i64,
    next_message_id: i64,
}

/// Thread-safe in-memory store. Nothing survives a restart.
pub struct MemoryStore {
    tables: Mutex<Tables>,
    contacts_tx: watch::Sender<Vec<Contact>>,
    messages_tx: watch::Sender<Vec<StoredMessage>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (contacts_tx, _) = watch::channel(Vec::new());
        let (messages_tx, _) = watch::channel(Vec::new());
        Self {
            tables: Mutex::new(Tables {
                next_contact_id: 1,
                next_message_id: 1,
                ..Tables::default()
            }),
            contacts_tx,
            messages_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContactStore for MemoryStore {
    async fn all_contacts(&self) -> Result<Vec<Contact>, StoreError> {
        Ok(self.lock().contacts.clone())
    }

    fn watch_contacts(&self) -> watch::Receiver<Vec<Contact>> {
        self.contacts_tx.subscribe()
    }

    async fn contact_by_peer_id(&self, peer_id: &PeerId) -> Result<Option<Contact>, StoreError> {
        Ok(self
            .lock()
            .contacts
            .iter()
            .find(|c| &c.peer_id == peer_id)
            .cloned())
    }

    async fn insert_contact(&self, mut contact: Contact) -> Result<Contact, StoreError> {
        let mut t = self.lock();
        if t.contacts.iter().any(|c| c.peer_id == contact.peer_id) {
            return Err(StoreError::DuplicateContact(contact.peer_id));
        }
        contact.id = t.next_contact_id;
        t.next_contact_id += 1;
        t.contacts.push(contact.clone());
        self.contacts_tx.send_replace(t.contacts.clone());
        Ok(contact)
    }

    async fn update_contact(&self, contact: &Contact) -> Result<(), StoreError> {
        let mut t = self.lock();
        let row = t
            .contacts
            .iter_mut()
            .find(|c| c.peer_id == contact.peer_id)
            .ok_or_else(|| StoreError::ContactNotFound(contact.peer_id.clone()))?;
        *row = contact.clone();
        self.contacts_tx.send_replace(t.contacts.clone());
        Ok(())
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn all_messages(&self) -> Result<Vec<StoredMessage>, StoreError> {
        Ok(self.lock().messages.clone())
    }

    fn watch_messages(&self) -> watch::Receiver<Vec<StoredMessage>> {
        self.messages_tx.subscribe()
    }

    async fn insert_message(&self, mut message: StoredMessage) -> Result<StoredMessage, StoreError> {
        let mut t = self.lock();
        message.id = t.next_message_id;
        t.next_message_id += 1;
        t.messages.retain(|m| m.uuid != message.uuid);
        t.messages.push(message.clone());
        self.messages_tx.send_replace(t.messages.clone());
        Ok(message)
    }

    async fn update_message(&self, message: &StoredMessage) -> Result<(), StoreError> {
        let mut t = self.lock();
        let row = t
            .messages
            .iter_mut()
            .find(|m| m.uuid == message.uuid)
            .ok_or(StoreError::MessageNotFound(message.uuid))?;
        *row = message.clone();
        self.messages_tx.send_replace(t.messages.clone());
        Ok(())
    }

    async fn message_by_uuid(&self, uuid: &Uuid) -> Result<Option<StoredMessage>, StoreError> {
        Ok(self.lock().messages.iter().find(|m| &m.uuid == uuid).cloned())
    }

    async fn unsent_for_peer(&self, peer_id: &PeerId) -> Result<Vec<StoredMessage>, StoreError> {
        Ok(self
            .lock()
            .messages
            .iter()
            .filter(|m| &m.target_peer_id == peer_id && m.delivery_state != DeliveryState::Success)
            .cloned()
            .collect())
    }

    async fn last_message_body_for_peer(
        &self,
        peer_id: &PeerId,
    ) -> Result<Option<String>, StoreError> {
        Ok(self
            .lock()
            .messages
            .iter()
            .filter(|m| &m.origin_peer_id == peer_id)
            .max_by_key(|m| m.sent_at)
            .map(|m| m.body.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(target: &str, state: DeliveryState, sent_at: i64) -> StoredMessage {
        StoredMessage {
            id: 0,
            uuid: Uuid::new_v4(),
            origin_peer_id: PeerId::from("me"),
            target_peer_id: PeerId::from(target),
            body: format!("body {sent_at}"),
            sent_at,
            received_at: NO_RECEIVED_TIME,
            delivery_state: state,
        }
    }

    #[tokio::test]
    async fn insert_assigns_ids_and_replaces_by_uuid() {
        let store = MemoryStore::new();
        let m = store
            .insert_message(message("b", DeliveryState::Sending, 1))
            .await
            .unwrap();
        assert_eq!(m.id, 1);

        let mut again = m.clone();
        again.body = "edited".to_owned();
        let replaced = store.insert_message(again).await.unwrap();
        assert_eq!(replaced.id, 2);

        let all = store.all_messages().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].body, "edited");
    }

    #[tokio::test]
    async fn unsent_excludes_success_and_other_peers() {
        let store = MemoryStore::new();
        let keep_a = store
            .insert_message(message("b", DeliveryState::NoEndpoint, 1))
            .await
            .unwrap();
        let keep_b = store
            .insert_message(message("b", DeliveryState::Error, 2))
            .await
            .unwrap();
        store
            .insert_message(message("b", DeliveryState::Success, 3))
            .await
            .unwrap();
        store
            .insert_message(message("c", DeliveryState::Error, 4))
            .await
            .unwrap();

        let unsent = store.unsent_for_peer(&PeerId::from("b")).await.unwrap();
        let ids: Vec<_> = unsent.iter().map(|m| m.uuid).collect();
        assert_eq!(ids, vec![keep_a.uuid, keep_b.uuid]);
    }

    #[tokio::test]
    async fn update_unknown_message_fails() {
        let store = MemoryStore::new();
        let err = store
            .update_message(&message("b", DeliveryState::Error, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::MessageNotFound(_)));
    }

    #[tokio::test]
    async fn contacts_are_unique_and_watchable() {
        let store = MemoryStore::new();
        let mut rx = store.watch_contacts();
        let contact = Contact {
            id: 0,
            peer_id: PeerId::from("b"),
            display_name: "Bob".to_owned(),
            last_seen_at: 10,
        };
        let saved = store.insert_contact(contact.clone()).await.unwrap();
        assert_eq!(saved.id, 1);
        assert!(matches!(
            store.insert_contact(contact).await,
            Err(StoreError::DuplicateContact(_))
        ));

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().len(), 1);

        let mut renamed = saved.clone();
        renamed.display_name = "Robert".to_owned();
        store.update_contact(&renamed).await.unwrap();
        let fetched = store
            .contact_by_peer_id(&PeerId::from("b"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.display_name, "Robert");
    }

    #[tokio::test]
    async fn last_message_body_is_latest_from_peer() {
        let store = MemoryStore::new();
        for (sent_at, body) in [(5, "middle"), (9, "latest"), (1, "oldest")] {
            let mut m = message("me", DeliveryState::None, sent_at);
            m.origin_peer_id = PeerId::from("b");
            m.body = body.to_owned();
            store.insert_message(m).await.unwrap();
        }
        let body = store
            .last_message_body_for_peer(&PeerId::from("b"))
            .await
            .unwrap();
        assert_eq!(body.as_deref(), Some("latest"));
        assert_eq!(
            store
                .last_message_body_for_peer(&PeerId::from("nobody"))
                .await
                .unwrap(),
            None
        );
    }
}
