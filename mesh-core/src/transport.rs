//! Transport capability surface consumed by the engine.
//!
//! A transport owns discovery, advertising and the byte links themselves. It
//! reports everything that happens asynchronously through a
//! [`TransportEvents`] sink handed to it by the engine; the sink never blocks,
//! so it is safe to call from any transport-internal thread or task.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use crate::delivery::DeliveryTracker;
use crate::identity::EndpointId;

/// Transport-assigned identifier of one payload, echoed back in transfer updates.
pub type PayloadId = i64;

/// Bytes handed to the transport for a single send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    id: PayloadId,
    bytes: Vec<u8>,
}

impl Payload {
    /// Wrap `bytes` under a fresh random payload id.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            id: rand::random(),
            bytes,
        }
    }

    pub fn id(&self) -> PayloadId {
        self.id
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Outcome of a connection handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Success,
    Rejected,
    Error(String),
}

/// Progress of a single payload transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Success,
    InProgress,
    Canceled,
    Failure,
}

/// Everything a transport can report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A handshake started; `remote_name` is the identity the remote asserted.
    ConnectionInitiated {
        endpoint_id: EndpointId,
        remote_name: String,
    },
    ConnectionResult {
        endpoint_id: EndpointId,
        status: ConnectionStatus,
    },
    Disconnected {
        endpoint_id: EndpointId,
    },
    EndpointFound {
        endpoint_id: EndpointId,
        remote_name: String,
    },
    EndpointLost {
        endpoint_id: EndpointId,
    },
    PayloadReceived {
        endpoint_id: EndpointId,
        bytes: Vec<u8>,
    },
    PayloadTransferUpdate {
        endpoint_id: EndpointId,
        payload_id: PayloadId,
        status: TransferStatus,
    },
}

/// Non-blocking sink for transport events. Cheap to clone.
///
/// Lifecycle events are queued for the orchestrator, payload bytes go into
/// the bounded drop-oldest inbound buffer, transfer updates resolve
/// delivery waits directly.
#[derive(Clone)]
pub struct TransportEvents {
    lifecycle: mpsc::UnboundedSender<TransportEvent>,
    inbound: broadcast::Sender<Vec<u8>>,
    delivery: Arc<DeliveryTracker>,
}

impl TransportEvents {
    /// Engines build this for their transport; standalone transport tests may too.
    pub fn new(
        lifecycle: mpsc::UnboundedSender<TransportEvent>,
        inbound: broadcast::Sender<Vec<u8>>,
        delivery: Arc<DeliveryTracker>,
    ) -> Self {
        Self {
            lifecycle,
            inbound,
            delivery,
        }
    }

    pub fn emit(&self, event: TransportEvent) {
        match event {
            TransportEvent::PayloadReceived { endpoint_id, bytes } => {
                tracing::trace!(%endpoint_id, len = bytes.len(), "payload received");
                if self.inbound.send(bytes).is_err() {
                    tracing::debug!("inbound buffer has no reader, payload dropped");
                }
            }
            TransportEvent::PayloadTransferUpdate {
                payload_id, status, ..
            } => self.delivery.on_transfer_update(payload_id, status),
            other => {
                if self.lifecycle.send(other).is_err() {
                    tracing::debug!("lifecycle queue closed, event dropped");
                }
            }
        }
    }
}

/// Errors a transport may report for a request.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection rejected by {0}")]
    Rejected(EndpointId),
    #[error("unknown endpoint {0}")]
    UnknownEndpoint(EndpointId),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

/// Proximity transport: advertising, discovery, connections and byte payloads.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Advertise `local_name` under `service_id`. Inbound handshakes are reported to `events`.
    async fn start_advertising(
        &self,
        local_name: &str,
        service_id: &str,
        events: TransportEvents,
    ) -> Result<(), TransportError>;

    /// Look for other advertisers of `service_id`.
    async fn start_discovery(
        &self,
        service_id: &str,
        events: TransportEvents,
    ) -> Result<(), TransportError>;

    fn stop_advertising(&self);

    fn stop_discovery(&self);

    /// Drop every link, pending or established.
    fn stop_all_endpoints(&self);

    /// Ask `endpoint_id` for a connection. Resolves once the request was delivered.
    async fn request_connection(
        &self,
        local_name: &str,
        endpoint_id: &EndpointId,
        events: TransportEvents,
    ) -> Result<(), TransportError>;

    async fn accept_connection(
        &self,
        endpoint_id: &EndpointId,
        events: TransportEvents,
    ) -> Result<(), TransportError>;

    async fn reject_connection(&self, endpoint_id: &EndpointId) -> Result<(), TransportError>;

    fn disconnect_from_endpoint(&self, endpoint_id: &EndpointId);

    /// Fire and forget; the outcome arrives as a `PayloadTransferUpdate`.
    fn send_payload(&self, endpoint_id: &EndpointId, payload: Payload);
}
