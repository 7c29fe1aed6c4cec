//! Connection registry: which peer is reachable through which endpoint.
//!
//! Single owner of the `PeerId -> EndpointId` map. Every mutation republishes
//! the full peer set on a watch channel while the lock is still held, so a
//! subscriber never observes a snapshot older than a mutation it raced with.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::watch;

use crate::identity::{EndpointId, PeerId};

/// Snapshot of connected peer ids.
pub type PeerSet = BTreeSet<PeerId>;

pub struct ConnectionRegistry {
    connections: Mutex<HashMap<PeerId, EndpointId>>,
    snapshot: watch::Sender<PeerSet>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        let (snapshot, _) = watch::channel(PeerSet::new());
        Self {
            connections: Mutex::new(HashMap::new()),
            snapshot,
        }
    }

    /// Map `peer_id` to `endpoint_id`, replacing any earlier endpoint.
    /// Returns true if the peer had no mapping before.
    pub fn add(&self, peer_id: PeerId, endpoint_id: EndpointId) -> bool {
        tracing::debug!(%peer_id, %endpoint_id, "adding connection");
        let mut map = self.lock();
        let is_new = map.insert(peer_id, endpoint_id).is_none();
        self.publish(&map);
        is_new
    }

    /// Remove whichever peer is mapped to `endpoint_id`, if any.
    pub fn remove_by_endpoint(&self, endpoint_id: &EndpointId) -> Option<PeerId> {
        tracing::debug!(%endpoint_id, "removing connection");
        let mut map = self.lock();
        let peer_id = map
            .iter()
            .find(|(_, e)| *e == endpoint_id)
            .map(|(p, _)| p.clone());
        if let Some(p) = &peer_id {
            map.remove(p);
        }
        self.publish(&map);
        peer_id
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<EndpointId> {
        self.lock().get(peer_id).cloned()
    }

    pub fn is_connected_to_endpoint(&self, endpoint_id: &EndpointId) -> bool {
        self.lock().values().any(|e| e == endpoint_id)
    }

    pub fn clear(&self) {
        let mut map = self.lock();
        map.clear();
        self.publish(&map);
    }

    /// Current set of connected peers.
    pub fn snapshot(&self) -> PeerSet {
        self.snapshot.borrow().clone()
    }

    /// Live view of the connected peer set. Starts at the current value.
    pub fn subscribe(&self) -> watch::Receiver<PeerSet> {
        self.snapshot.subscribe()
    }

    fn publish(&self, map: &HashMap<PeerId, EndpointId>) {
        self.snapshot.send_replace(map.keys().cloned().collect());
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PeerId, EndpointId>> {
        // A panic while holding the lock cannot leave the map half-written.
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
