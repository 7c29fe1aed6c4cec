//! LAN discovery: UDP multicast beacon, parse beacons, maintain the seen-endpoint list.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use mesh_core::{EndpointId, TransportEvent, TransportEvents};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;

pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 61);
const BEACON_INTERVAL: Duration = Duration::from_secs(4);
const PEER_TIMEOUT: Duration = Duration::from_secs(16);
const MAX_DATAGRAM: usize = 2048;

/// Advertisement sent to the multicast group while advertising.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Beacon {
    pub service_id: String,
    /// The advertiser's local name (its peer id).
    pub endpoint_name: String,
    /// TCP port the advertiser accepts links on.
    pub listen_port: u16,
}

struct Seen {
    name: String,
    last_seen: Instant,
}

type SeenMap = HashMap<EndpointId, Seen>;

/// Endpoint id for a peer reachable at `ip:listen_port`.
pub fn endpoint_id(ip: IpAddr, listen_port: u16) -> EndpointId {
    EndpointId::new(SocketAddr::new(ip, listen_port).to_string())
}

/// Multicast `beacon` every few seconds. Send errors are logged and retried.
pub async fn run_beacon(beacon: Beacon, discovery_port: u16) -> std::io::Result<()> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.set_multicast_ttl_v4(1)?;
    let frame = bincode::serialize(&beacon)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let dest = SocketAddr::new(IpAddr::V4(MULTICAST_GROUP), discovery_port);
    loop {
        if let Err(e) = socket.send_to(&frame, dest).await {
            tracing::debug!(error = %e, "beacon send failed");
        }
        tokio::time::sleep(BEACON_INTERVAL).await;
    }
}

/// Listen for beacons of `service_id`, reporting `EndpointFound` on first
/// sighting and `EndpointLost` once an endpoint goes quiet. Beacons carrying
/// `local_name` are our own and ignored.
pub async fn run_discovery(
    socket: Arc<UdpSocket>,
    service_id: String,
    local_name: watch::Receiver<Option<String>>,
    events: TransportEvents,
) -> std::io::Result<()> {
    let seen: Arc<Mutex<SeenMap>> = Arc::new(Mutex::new(HashMap::new()));
    // Same task, so aborting discovery stops both loops.
    tokio::select! {
        result = recv_loop(socket, service_id, local_name, seen.clone(), events.clone()) => result,
        () = timeout_loop(seen, events) => Ok(()),
    }
}

/// Bind the discovery port and join the multicast group. Needs a runtime.
pub fn bind_multicast(discovery_port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, discovery_port))?;
    std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    service_id: String,
    local_name: watch::Receiver<Option<String>>,
    seen: Arc<Mutex<SeenMap>>,
    events: TransportEvents,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (n, from) = socket.recv_from(&mut buf).await?;
        let Ok(beacon) = bincode::deserialize::<Beacon>(&buf[..n]) else {
            tracing::trace!(%from, "ignoring malformed beacon");
            continue;
        };
        let own_name = local_name.borrow().clone();
        let found = {
            let mut seen = seen.lock().await;
            observe(
                &mut seen,
                &beacon,
                from.ip(),
                &service_id,
                own_name.as_deref(),
                Instant::now(),
            )
        };
        if let Some(event) = found {
            events.emit(event);
        }
    }
}

async fn timeout_loop(seen: Arc<Mutex<SeenMap>>, events: TransportEvents) {
    loop {
        tokio::time::sleep(BEACON_INTERVAL).await;
        let lost = {
            let mut seen = seen.lock().await;
            expire(&mut seen, Instant::now())
        };
        for endpoint_id in lost {
            events.emit(TransportEvent::EndpointLost { endpoint_id });
        }
    }
}

/// Record a beacon. Returns `EndpointFound` the first time an endpoint is seen.
fn observe(
    seen: &mut SeenMap,
    beacon: &Beacon,
    from: IpAddr,
    service_id: &str,
    own_name: Option<&str>,
    now: Instant,
) -> Option<TransportEvent> {
    if beacon.service_id != service_id || own_name == Some(beacon.endpoint_name.as_str()) {
        return None;
    }
    let id = endpoint_id(from, beacon.listen_port);
    let is_new = seen
        .insert(
            id.clone(),
            Seen {
                name: beacon.endpoint_name.clone(),
                last_seen: now,
            },
        )
        .is_none();
    is_new.then(|| TransportEvent::EndpointFound {
        endpoint_id: id,
        remote_name: beacon.endpoint_name.clone(),
    })
}

/// Drop endpoints not heard from within the timeout and return them.
fn expire(seen: &mut SeenMap, now: Instant) -> Vec<EndpointId> {
    let lost: Vec<EndpointId> = seen
        .iter()
        .filter(|(_, s)| now.duration_since(s.last_seen) >= PEER_TIMEOUT)
        .map(|(id, _)| id.clone())
        .collect();
    for id in &lost {
        if let Some(s) = seen.remove(id) {
            tracing::debug!(endpoint_id = %id, name = %s.name, "endpoint went quiet");
        }
    }
    lost
}
