//! Scripted in-process transport for engine tests.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::identity::EndpointId;
use crate::transport::{
    ConnectionStatus, Payload, Transport, TransportError, TransportEvent, TransportEvents,
    TransferStatus,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    StartAdvertising { local_name: String, service_id: String },
    StartDiscovery { service_id: String },
    StopAdvertising,
    StopDiscovery,
    StopAllEndpoints,
    RequestConnection { local_name: String, endpoint_id: EndpointId },
    Accept(EndpointId),
    Reject(EndpointId),
    Disconnect(EndpointId),
    Send(EndpointId),
}

#[derive(Default)]
struct Script {
    calls: Vec<Call>,
    sent: Vec<(EndpointId, Payload)>,
    request_results: VecDeque<Result<(), String>>,
    request_delay: Option<Duration>,
    fail_advertising: bool,
    auto_ack: Option<TransferStatus>,
    accept_error: Option<String>,
    events: Option<TransportEvents>,
    remote: Option<TransportEvents>,
}

/// Records every call. `send_payload` can acknowledge itself and forward the
/// bytes to a linked peer's event sink; `accept_connection` reports success
/// unless scripted to fail.
pub(crate) struct FakeTransport {
    script: Mutex<Script>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(Script::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn sent(&self) -> Vec<(EndpointId, Payload)> {
        self.lock().sent.clone()
    }

    pub fn request_count(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| matches!(c, Call::RequestConnection { .. }))
            .count()
    }

    /// Queue results for the next `request_connection` calls; `Ok` once drained.
    pub fn script_requests(&self, results: impl IntoIterator<Item = Result<(), String>>) {
        self.lock().request_results.extend(results);
    }

    pub fn set_request_delay(&self, delay: Duration) {
        self.lock().request_delay = Some(delay);
    }

    pub fn fail_advertising(&self) {
        self.lock().fail_advertising = true;
    }

    /// Report `status` for every payload right after it is sent.
    pub fn auto_ack(&self, status: TransferStatus) {
        self.lock().auto_ack = Some(status);
    }

    /// Make every `accept_connection` fail with `reason`.
    pub fn fail_accept(&self, reason: &str) {
        self.lock().accept_error = Some(reason.to_owned());
    }

    /// Deliver every sent payload to `remote` as `PayloadReceived`.
    pub fn link_to(&self, remote: TransportEvents) {
        self.lock().remote = Some(remote);
    }

    /// Use `events` until a transport call hands over another sink.
    pub fn capture(&self, events: TransportEvents) {
        self.lock().events = Some(events);
    }

    /// Sink captured from the last call that was handed one.
    pub fn events(&self) -> Option<TransportEvents> {
        self.lock().events.clone()
    }

    pub fn emit(&self, event: TransportEvent) {
        if let Some(events) = self.events() {
            events.emit(event);
        }
    }

    fn record(&self, call: Call, events: Option<TransportEvents>) {
        let mut s = self.lock();
        s.calls.push(call);
        if events.is_some() {
            s.events = events;
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn start_advertising(
        &self,
        local_name: &str,
        service_id: &str,
        events: TransportEvents,
    ) -> Result<(), TransportError> {
        self.record(
            Call::StartAdvertising {
                local_name: local_name.to_owned(),
                service_id: service_id.to_owned(),
            },
            Some(events),
        );
        if self.lock().fail_advertising {
            return Err(TransportError::Other("advertising unavailable".to_owned()));
        }
        Ok(())
    }

    async fn start_discovery(
        &self,
        service_id: &str,
        events: TransportEvents,
    ) -> Result<(), TransportError> {
        self.record(
            Call::StartDiscovery {
                service_id: service_id.to_owned(),
            },
            Some(events),
        );
        Ok(())
    }

    fn stop_advertising(&self) {
        self.record(Call::StopAdvertising, None);
    }

    fn stop_discovery(&self) {
        self.record(Call::StopDiscovery, None);
    }

    fn stop_all_endpoints(&self) {
        self.record(Call::StopAllEndpoints, None);
    }

    async fn request_connection(
        &self,
        local_name: &str,
        endpoint_id: &EndpointId,
        events: TransportEvents,
    ) -> Result<(), TransportError> {
        self.record(
            Call::RequestConnection {
                local_name: local_name.to_owned(),
                endpoint_id: endpoint_id.clone(),
            },
            Some(events),
        );
        let (delay, result) = {
            let mut s = self.lock();
            (s.request_delay, s.request_results.pop_front())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match result {
            Some(Err(reason)) => Err(TransportError::Other(reason)),
            _ => Ok(()),
        }
    }

    async fn accept_connection(
        &self,
        endpoint_id: &EndpointId,
        events: TransportEvents,
    ) -> Result<(), TransportError> {
        self.record(Call::Accept(endpoint_id.clone()), Some(events.clone()));
        if let Some(reason) = self.lock().accept_error.clone() {
            return Err(TransportError::Other(reason));
        }
        events.emit(TransportEvent::ConnectionResult {
            endpoint_id: endpoint_id.clone(),
            status: ConnectionStatus::Success,
        });
        Ok(())
    }

    async fn reject_connection(&self, endpoint_id: &EndpointId) -> Result<(), TransportError> {
        self.record(Call::Reject(endpoint_id.clone()), None);
        Ok(())
    }

    fn disconnect_from_endpoint(&self, endpoint_id: &EndpointId) {
        self.record(Call::Disconnect(endpoint_id.clone()), None);
    }

    fn send_payload(&self, endpoint_id: &EndpointId, payload: Payload) {
        let (ack, events, remote) = {
            let mut s = self.lock();
            s.calls.push(Call::Send(endpoint_id.clone()));
            s.sent.push((endpoint_id.clone(), payload.clone()));
            (s.auto_ack, s.events.clone(), s.remote.clone())
        };
        if let Some(remote) = remote {
            remote.emit(TransportEvent::PayloadReceived {
                endpoint_id: endpoint_id.clone(),
                bytes: payload.bytes().to_vec(),
            });
        }
        if let (Some(status), Some(events)) = (ack, events) {
            events.emit(TransportEvent::PayloadTransferUpdate {
                endpoint_id: endpoint_id.clone(),
                payload_id: payload.id(),
                status,
            });
        }
    }
}

/// Poll `check` until it holds, advancing (possibly paused) time between polls.
pub(crate) async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}
