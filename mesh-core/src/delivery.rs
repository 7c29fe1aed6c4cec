//! Delivery tracking: turns asynchronous transfer updates into a bounded
//! per-send wait.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;

use crate::identity::EndpointId;
use crate::transport::{Payload, PayloadId, TransferStatus};

/// Default time to wait for a transfer to resolve.
pub const DEFAULT_DELIVERY_WAIT: Duration = Duration::from_secs(5);

/// State of one in-flight send. Terminal once it leaves `Created`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AwaitState {
    Created,
    Success,
    Failed,
}

/// What the caller of [`DeliveryTracker::await_delivery_result`] observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Success,
    Failed,
    Timeout,
}

impl DeliveryOutcome {
    pub fn is_success(self) -> bool {
        self == DeliveryOutcome::Success
    }
}

pub struct DeliveryTracker {
    pending: Mutex<HashMap<PayloadId, watch::Sender<AwaitState>>>,
    wait: Duration,
}

impl DeliveryTracker {
    pub fn new(wait: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            wait,
        }
    }

    /// Register `payload`, hand it to `send`, and wait for the transport to
    /// report a terminal status or for the wait to elapse.
    pub async fn await_delivery_result<F>(
        &self,
        payload: Payload,
        endpoint_id: &EndpointId,
        send: F,
    ) -> DeliveryOutcome
    where
        F: FnOnce(&EndpointId, Payload) + Send,
    {
        let payload_id = payload.id();
        let (tx, mut rx) = watch::channel(AwaitState::Created);
        self.lock().insert(payload_id, tx);
        // Removes the cell on every exit path, including cancellation.
        let _guard = PendingGuard {
            tracker: self,
            payload_id,
        };

        send(endpoint_id, payload);

        let waited = tokio::time::timeout(
            self.wait,
            rx.wait_for(|state| *state != AwaitState::Created),
        )
        .await;
        let outcome = match waited {
            Ok(Ok(state)) if *state == AwaitState::Success => DeliveryOutcome::Success,
            Ok(_) => DeliveryOutcome::Failed,
            Err(_) => DeliveryOutcome::Timeout,
        };
        tracing::debug!(payload_id, %endpoint_id, ?outcome, "delivery resolved");
        outcome
    }

    /// Transport callback. The only writer of a cell's terminal value.
    pub fn on_transfer_update(&self, payload_id: PayloadId, status: TransferStatus) {
        let pending = self.lock();
        let Some(cell) = pending.get(&payload_id) else {
            tracing::trace!(payload_id, ?status, "update for untracked payload");
            return;
        };
        let next = match status {
            TransferStatus::Success => AwaitState::Success,
            TransferStatus::InProgress => AwaitState::Created,
            TransferStatus::Canceled | TransferStatus::Failure => AwaitState::Failed,
        };
        cell.send_if_modified(|state| {
            if *state != AwaitState::Created || next == AwaitState::Created {
                return false;
            }
            *state = next;
            true
        });
    }

    /// Number of sends still waiting on the transport.
    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PayloadId, watch::Sender<AwaitState>>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for DeliveryTracker {
    fn default() -> Self {
        Self::new(DEFAULT_DELIVERY_WAIT)
    }
}

struct PendingGuard<'a> {
    tracker: &'a DeliveryTracker,
    payload_id: PayloadId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.tracker.lock().remove(&self.payload_id);
    }
}
