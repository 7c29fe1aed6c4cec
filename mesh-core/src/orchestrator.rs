//! Advertise/discover lifecycle, handshake handling and outbound connects.

use std::sync::Arc;

use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::MeshConfig;
use crate::identity::{EndpointId, IdentityWatch, PeerId};
use crate::protocol::WireMessage;
use crate::registry::ConnectionRegistry;
use crate::transport::{ConnectionStatus, Payload, Transport, TransportEvent, TransportEvents};
use crate::wire;

/// How an outbound connect procedure ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// A request succeeded and the peer was registered.
    Connected,
    /// Someone else (usually the inbound handshake) connected us first.
    AlreadyConnected,
    /// Every attempt failed.
    Exhausted,
    /// The overall window elapsed.
    TimedOut,
}

pub struct ConnectionOrchestrator {
    transport: Arc<dyn Transport>,
    registry: Arc<ConnectionRegistry>,
    identity: IdentityWatch,
    events: TransportEvents,
    config: MeshConfig,
}

impl ConnectionOrchestrator {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<ConnectionRegistry>,
        identity: IdentityWatch,
        events: TransportEvents,
        config: MeshConfig,
    ) -> Self {
        Self {
            transport,
            registry,
            identity,
            events,
            config,
        }
    }

    /// Restart advertising and discovery from a clean slate.
    pub async fn start(&self) {
        self.stop();
        let local_name = self.local_peer_id();
        let service_id = self.config.service_id.as_str();
        let (advertising, discovery) = tokio::join!(
            self.transport
                .start_advertising(local_name.as_str(), service_id, self.events.clone()),
            self.transport.start_discovery(service_id, self.events.clone()),
        );
        match advertising {
            Ok(()) => debug!(%local_name, service_id, "advertising started"),
            Err(e) => warn!(error = %e, "advertising failed"),
        }
        match discovery {
            Ok(()) => debug!(service_id, "discovery started"),
            Err(e) => warn!(error = %e, "discovery failed"),
        }
        info!(%local_name, "mesh started");
    }

    pub fn stop(&self) {
        self.transport.stop_advertising();
        self.transport.stop_discovery();
        self.transport.stop_all_endpoints();
        self.registry.clear();
        debug!("mesh stopped");
    }

    /// Consume lifecycle events until the transport side goes away.
    pub async fn run(self: Arc<Self>, mut lifecycle: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = lifecycle.recv().await {
            let orchestrator = Arc::clone(&self);
            let handled = tokio::spawn(async move { orchestrator.handle_event(event).await }).await;
            if let Err(e) = handled {
                warn!(error = %e, "lifecycle handler panicked");
            }
        }
        debug!("lifecycle loop finished");
    }

    /// React to one lifecycle event. An initiated connection is registered
    /// only once the transport has accepted it, so a failed accept leaves no
    /// stale mapping behind.
    pub async fn handle_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::ConnectionInitiated {
                endpoint_id,
                remote_name,
            } => {
                debug!(%endpoint_id, %remote_name, "connection initiated");
                // No authentication: every handshake is accepted.
                if let Err(e) = self
                    .transport
                    .accept_connection(&endpoint_id, self.events.clone())
                    .await
                {
                    warn!(%endpoint_id, error = %e, "accept failed");
                    return;
                }
                self.registry.add(PeerId::new(remote_name), endpoint_id);
            }
            TransportEvent::ConnectionResult {
                endpoint_id,
                status,
            } => match status {
                ConnectionStatus::Success => {
                    info!(%endpoint_id, "connected");
                    self.send_announce(&endpoint_id);
                }
                ConnectionStatus::Rejected => {
                    debug!(%endpoint_id, "connection rejected");
                    self.registry.remove_by_endpoint(&endpoint_id);
                }
                ConnectionStatus::Error(reason) => {
                    warn!(%endpoint_id, %reason, "connection failed");
                }
            },
            TransportEvent::Disconnected { endpoint_id } => {
                info!(%endpoint_id, "disconnected");
                self.registry.remove_by_endpoint(&endpoint_id);
            }
            TransportEvent::EndpointLost { endpoint_id } => {
                debug!(%endpoint_id, "endpoint lost");
                self.registry.remove_by_endpoint(&endpoint_id);
            }
            TransportEvent::EndpointFound {
                endpoint_id,
                remote_name,
            } => {
                debug!(%endpoint_id, %remote_name, "endpoint found");
                let orchestrator = Arc::clone(self);
                tokio::spawn(async move {
                    orchestrator
                        .connect_to_endpoint(endpoint_id, PeerId::new(remote_name))
                        .await
                });
            }
            // Routed elsewhere by TransportEvents; never queued here.
            TransportEvent::PayloadReceived { .. } | TransportEvent::PayloadTransferUpdate { .. } => {}
        }
    }

    /// Bounded attempts to connect to a discovered endpoint.
    pub async fn connect_to_endpoint(&self, endpoint_id: EndpointId, remote_peer: PeerId) -> ConnectOutcome {
        let attempts = tokio::time::timeout(
            self.config.connect_timeout(),
            self.connect_attempts(&endpoint_id, &remote_peer),
        )
        .await;
        let outcome = attempts.unwrap_or(ConnectOutcome::TimedOut);
        match outcome {
            ConnectOutcome::Connected | ConnectOutcome::AlreadyConnected => {
                debug!(%endpoint_id, ?outcome, "connect finished")
            }
            ConnectOutcome::Exhausted | ConnectOutcome::TimedOut => {
                warn!(%endpoint_id, peer_id = %remote_peer, ?outcome, "could not connect")
            }
        }
        outcome
    }

    async fn connect_attempts(&self, endpoint_id: &EndpointId, remote_peer: &PeerId) -> ConnectOutcome {
        let attempts = self.config.connect_attempts;
        for attempt in 1..=attempts {
            if self.registry.is_connected_to_endpoint(endpoint_id) {
                return ConnectOutcome::AlreadyConnected;
            }
            let local_name = self.local_peer_id();
            match self
                .transport
                .request_connection(local_name.as_str(), endpoint_id, self.events.clone())
                .await
            {
                Ok(()) => {
                    debug!(%endpoint_id, attempt, "connection requested");
                    self.registry.add(remote_peer.clone(), endpoint_id.clone());
                    return ConnectOutcome::Connected;
                }
                Err(e) => {
                    warn!(%endpoint_id, attempt, error = %e, "connection request failed");
                    if !self.registry.is_connected_to_endpoint(endpoint_id) {
                        self.transport.disconnect_from_endpoint(endpoint_id);
                    }
                }
            }
            if attempt < attempts {
                let backoff = rand::thread_rng().gen_range(self.config.backoff_range());
                tokio::time::sleep(std::time::Duration::from_millis(backoff)).await;
            }
        }
        ConnectOutcome::Exhausted
    }

    fn send_announce(&self, endpoint_id: &EndpointId) {
        let (origin_peer_id, display_name) = {
            let identity = self.identity.borrow();
            (identity.peer_id.clone(), identity.display_name.clone())
        };
        match wire::encode(&WireMessage::Announce {
            origin_peer_id,
            display_name,
        }) {
            Ok(frame) => self
                .transport
                .send_payload(endpoint_id, Payload::from_bytes(frame)),
            Err(e) => warn!(%endpoint_id, error = %e, "failed to encode announce"),
        }
    }

    fn local_peer_id(&self) -> PeerId {
        self.identity.borrow().peer_id.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::broadcast;

    use super::*;
    use crate::delivery::DeliveryTracker;
    use crate::identity::{fixed_identity, LocalIdentity};
    use crate::testing::{Call, FakeTransport};

    struct Harness {
        orchestrator: Arc<ConnectionOrchestrator>,
        transport: Arc<FakeTransport>,
        registry: Arc<ConnectionRegistry>,
        identity: tokio::sync::watch::Sender<LocalIdentity>,
        _lifecycle: mpsc::UnboundedReceiver<TransportEvent>,
    }

    fn harness() -> Harness {
        let transport = Arc::new(FakeTransport::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let (identity, identity_rx) = fixed_identity(LocalIdentity::new("me".into(), "Me"));
        let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();
        let (inbound, _) = broadcast::channel(4);
        let events = TransportEvents::new(lifecycle_tx, inbound, Arc::new(DeliveryTracker::default()));
        let orchestrator = Arc::new(ConnectionOrchestrator::new(
            transport.clone(),
            registry.clone(),
            identity_rx,
            events,
            MeshConfig::default(),
        ));
        Harness {
            orchestrator,
            transport,
            registry,
            identity,
            _lifecycle: lifecycle_rx,
        }
    }

    fn ep(s: &str) -> EndpointId {
        EndpointId::from(s)
    }

    #[tokio::test]
    async fn start_stops_then_advertises_local_id() {
        let h = harness();
        h.registry.add("stale".into(), ep("old"));
        h.orchestrator.start().await;

        let calls = h.transport.calls();
        assert_eq!(
            &calls[..3],
            &[Call::StopAdvertising, Call::StopDiscovery, Call::StopAllEndpoints]
        );
        assert!(calls.contains(&Call::StartAdvertising {
            local_name: "me".to_owned(),
            service_id: crate::config::DEFAULT_SERVICE_ID.to_owned(),
        }));
        assert!(calls.contains(&Call::StartDiscovery {
            service_id: crate::config::DEFAULT_SERVICE_ID.to_owned(),
        }));
        assert!(h.registry.snapshot().is_empty());
    }

    #[tokio::test]
    async fn advertising_failure_is_not_fatal() {
        let h = harness();
        h.transport.fail_advertising();
        h.orchestrator.start().await;
        assert!(h
            .transport
            .calls()
            .iter()
            .any(|c| matches!(c, Call::StartDiscovery { .. })));
    }

    #[tokio::test]
    async fn initiated_connection_is_accepted_and_registered() {
        let h = harness();
        h.orchestrator
            .handle_event(TransportEvent::ConnectionInitiated {
                endpoint_id: ep("e1"),
                remote_name: "bob".to_owned(),
            })
            .await;
        let calls = h.transport.calls();
        assert!(calls.contains(&Call::Accept(ep("e1"))));
        assert!(!calls.contains(&Call::Reject(ep("e1"))));
        assert_eq!(h.registry.get(&"bob".into()), Some(ep("e1")));
    }

    #[tokio::test]
    async fn failed_accept_leaves_peer_unregistered() {
        let h = harness();
        h.transport.fail_accept("radio off");
        h.orchestrator
            .handle_event(TransportEvent::ConnectionInitiated {
                endpoint_id: ep("e1"),
                remote_name: "bob".to_owned(),
            })
            .await;
        assert!(h.transport.calls().contains(&Call::Accept(ep("e1"))));
        assert_eq!(h.registry.get(&"bob".into()), None);
        assert!(h.registry.snapshot().is_empty());
    }

    #[tokio::test]
    async fn success_result_sends_current_identity() {
        let h = harness();
        h.identity
            .send_modify(|id| id.display_name = "Renamed".to_owned());
        h.orchestrator
            .handle_event(TransportEvent::ConnectionResult {
                endpoint_id: ep("e1"),
                status: ConnectionStatus::Success,
            })
            .await;
        let sent = h.transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, ep("e1"));
        assert_eq!(
            wire::decode(sent[0].1.bytes()),
            WireMessage::Announce {
                origin_peer_id: "me".into(),
                display_name: "Renamed".to_owned(),
            }
        );
    }

    #[tokio::test]
    async fn rejection_disconnect_and_loss_unregister() {
        let h = harness();
        for (i, event) in [
            TransportEvent::ConnectionResult {
                endpoint_id: ep("e1"),
                status: ConnectionStatus::Rejected,
            },
            TransportEvent::Disconnected {
                endpoint_id: ep("e1"),
            },
            TransportEvent::EndpointLost {
                endpoint_id: ep("e1"),
            },
        ]
        .into_iter()
        .enumerate()
        {
            h.registry.add("bob".into(), ep("e1"));
            h.orchestrator.handle_event(event).await;
            assert!(!h.registry.is_connected_to_endpoint(&ep("e1")), "case {i}");
        }
    }

    #[tokio::test]
    async fn error_result_keeps_registration() {
        let h = harness();
        h.registry.add("bob".into(), ep("e1"));
        h.orchestrator
            .handle_event(TransportEvent::ConnectionResult {
                endpoint_id: ep("e1"),
                status: ConnectionStatus::Error("radio off".to_owned()),
            })
            .await;
        assert!(h.registry.is_connected_to_endpoint(&ep("e1")));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_registers_on_first_success() {
        let h = harness();
        let outcome = h
            .orchestrator
            .connect_to_endpoint(ep("e1"), "bob".into())
            .await;
        assert_eq!(outcome, ConnectOutcome::Connected);
        assert_eq!(h.transport.request_count(), 1);
        assert_eq!(h.registry.get(&"bob".into()), Some(ep("e1")));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_retries_up_to_limit() {
        let h = harness();
        h.transport
            .script_requests((0..5).map(|_| Err("busy".to_owned())));
        let started = tokio::time::Instant::now();
        let outcome = h
            .orchestrator
            .connect_to_endpoint(ep("e1"), "bob".into())
            .await;
        assert_eq!(outcome, ConnectOutcome::Exhausted);
        assert_eq!(h.transport.request_count(), 3);
        // Two backoffs between three attempts.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(1000) && elapsed < Duration::from_millis(2000));
        let disconnects = h
            .transport
            .calls()
            .iter()
            .filter(|c| **c == Call::Disconnect(ep("e1")))
            .count();
        assert_eq!(disconnects, 3);
        assert!(h.registry.snapshot().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn connect_stops_once_connected_elsewhere() {
        let h = harness();
        h.transport.script_requests([Err("busy".to_owned())]);
        let registry = h.registry.clone();
        let orchestrator = h.orchestrator.clone();
        let task = tokio::spawn(async move {
            orchestrator
                .connect_to_endpoint(ep("e1"), "bob".into())
                .await
        });
        // Lands during the first backoff.
        tokio::time::sleep(Duration::from_millis(100)).await;
        registry.add("bob".into(), ep("e1"));

        assert_eq!(task.await.unwrap(), ConnectOutcome::AlreadyConnected);
        assert_eq!(h.transport.request_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_gives_up_after_window() {
        let h = harness();
        h.transport.set_request_delay(Duration::from_secs(4));
        h.transport
            .script_requests((0..5).map(|_| Err("slow".to_owned())));
        let outcome = h
            .orchestrator
            .connect_to_endpoint(ep("e1"), "bob".into())
            .await;
        assert_eq!(outcome, ConnectOutcome::TimedOut);
        assert!(h.transport.request_count() <= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn endpoint_found_spawns_connect() {
        let h = harness();
        h.orchestrator
            .handle_event(TransportEvent::EndpointFound {
                endpoint_id: ep("e9"),
                remote_name: "carol".to_owned(),
            })
            .await;
        let registry = h.registry.clone();
        crate::testing::eventually(|| registry.get(&"carol".into()).is_some()).await;
        assert!(h.transport.calls().contains(&Call::RequestConnection {
            local_name: "me".to_owned(),
            endpoint_id: ep("e9"),
        }));
    }
}
