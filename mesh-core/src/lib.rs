//! Mesh messaging engine.
//! Transport and storage are supplied by the host; the engine owns connection
//! orchestration, the wire codec, delivery tracking and message replay.

pub mod config;
pub mod delivery;
pub mod handler;
pub mod identity;
pub mod orchestrator;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod store;
pub mod transport;
pub mod wire;

#[cfg(test)]
pub(crate) mod testing;

pub use config::MeshConfig;
pub use delivery::{DeliveryOutcome, DeliveryTracker};
pub use handler::{ConversationSummary, MeshHandler};
pub use identity::{fixed_identity, EndpointId, IdentityWatch, LocalIdentity, PeerId};
pub use orchestrator::{ConnectOutcome, ConnectionOrchestrator};
pub use protocol::{DeliveryState, WireMessage, NO_RECEIVED_TIME};
pub use registry::{ConnectionRegistry, PeerSet};
pub use router::MessageRouter;
pub use store::{Contact, ContactStore, MemoryStore, MessageStore, StoreError, StoredMessage};
pub use transport::{
    ConnectionStatus, Payload, PayloadId, TransferStatus, Transport, TransportError,
    TransportEvent, TransportEvents,
};
pub use wire::{decode, encode, EncodeError};
