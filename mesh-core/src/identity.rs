//! Peer and endpoint identities, and the local identity source of truth.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Identity a peer asserts for itself. Stable across reconnects; the
/// application-level addressing key.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Fresh random id (UUID v4), for hosts that have no persisted identity yet.
    pub fn generate() -> Self {
        PeerId(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId(s.to_owned())
    }
}

/// Transport-assigned address for one active connection. Invalidated on disconnect.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct EndpointId(String);

impl EndpointId {
    pub fn new(id: impl Into<String>) -> Self {
        EndpointId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointId {
    fn from(s: &str) -> Self {
        EndpointId(s.to_owned())
    }
}

/// Who this device is: the id it advertises and the name it announces.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct LocalIdentity {
    pub peer_id: PeerId,
    pub display_name: String,
}

impl LocalIdentity {
    pub fn new(peer_id: PeerId, display_name: impl Into<String>) -> Self {
        Self {
            peer_id,
            display_name: display_name.into(),
        }
    }
}

/// Read-only view of the local identity. The host owns the sender and may
/// update it at any time; the engine reads the latest value at use.
pub type IdentityWatch = watch::Receiver<LocalIdentity>;

/// Convenience for hosts and tests with a fixed identity.
pub fn fixed_identity(identity: LocalIdentity) -> (watch::Sender<LocalIdentity>, IdentityWatch) {
    watch::channel(identity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_peer_ids_are_distinct() {
        let a = PeerId::generate();
        let b = PeerId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }

    #[test]
    fn identity_watch_sees_rename() {
        let (tx, rx) = fixed_identity(LocalIdentity::new("me".into(), "Alice"));
        assert_eq!(rx.borrow().display_name, "Alice");
        tx.send_modify(|id| id.display_name = "Alicia".to_owned());
        assert_eq!(rx.borrow().display_name, "Alicia");
        assert_eq!(rx.borrow().peer_id, PeerId::from("me"));
    }
}
