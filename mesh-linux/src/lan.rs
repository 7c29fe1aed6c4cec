//! LAN transport: TCP links to peers found by multicast discovery.
//!
//! Frames on a link are a 4-byte LE length followed by a bincode [`LinkFrame`].
//! Both sides open with `Hello`; the link stays pending until the engine
//! accepts it, after which reader and writer tasks carry `Data` and `Ack`.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use mesh_core::{
    ConnectionStatus, EndpointId, Payload, PayloadId, TransferStatus, Transport, TransportError,
    TransportEvent, TransportEvents,
};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::discovery::{self, Beacon};

const LEN_SIZE: usize = 4;
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;
const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkFrame {
    /// First frame in each direction. `listen_port` lets the acceptor derive
    /// the same endpoint id discovery would.
    Hello { name: String, listen_port: u16 },
    Data { payload_id: PayloadId, bytes: Vec<u8> },
    Ack { payload_id: PayloadId },
}

pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &LinkFrame) -> std::io::Result<()> {
    let body = bincode::serialize(frame)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    if body.len() > MAX_FRAME_LEN as usize {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "frame too large",
        ));
    }
    w.write_all(&(body.len() as u32).to_le_bytes()).await?;
    w.write_all(&body).await?;
    w.flush().await
}

pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> std::io::Result<LinkFrame> {
    let mut len_buf = [0u8; LEN_SIZE];
    r.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame too large",
        ));
    }
    let mut body = vec![0u8; len as usize];
    r.read_exact(&mut body).await?;
    bincode::deserialize(&body).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Reader and writer tasks of an accepted link. Dropping it closes the link.
struct ActiveLink {
    tx: mpsc::UnboundedSender<LinkFrame>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Drop for ActiveLink {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

enum LinkState {
    Pending(TcpStream),
    Active(ActiveLink),
}

struct Link {
    generation: u64,
    /// Name of the side that dialled. Decides which of two crossing links survives.
    initiator: String,
    state: LinkState,
}

struct Shared {
    links: Mutex<HashMap<EndpointId, Link>>,
    next_generation: AtomicU64,
    listen_port: AtomicU16,
    local_name: watch::Sender<Option<String>>,
    events: Mutex<Option<TransportEvents>>,
    /// Bound once and kept across stop/start; aborted tasks release their
    /// sockets late, so rebinding a fixed port would race them.
    listener: Mutex<Option<Arc<TcpListener>>>,
    discovery_socket: Mutex<Option<Arc<UdpSocket>>>,
    advertising: Mutex<Vec<JoinHandle<()>>>,
    discovery: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn remember_events(&self, events: &TransportEvents) {
        *lock(&self.events) = Some(events.clone());
    }

    fn emit(&self, event: TransportEvent) {
        if let Some(events) = lock(&self.events).as_ref() {
            events.emit(event);
        }
    }

    fn local_hello(&self) -> LinkFrame {
        LinkFrame::Hello {
            name: self.local_name.borrow().clone().unwrap_or_default(),
            listen_port: self.listen_port.load(Ordering::Relaxed),
        }
    }

    /// Park a freshly handshaken stream. Returns false if an existing link to
    /// the same endpoint wins and the new stream should be dropped.
    fn insert_pending(&self, endpoint_id: &EndpointId, initiator: String, stream: TcpStream) -> bool {
        let mut links = lock(&self.links);
        if let Some(existing) = links.get(endpoint_id) {
            if existing.initiator <= initiator {
                return false;
            }
        }
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        links.insert(
            endpoint_id.clone(),
            Link {
                generation,
                initiator,
                state: LinkState::Pending(stream),
            },
        );
        true
    }

    /// Forget the link if it is still the one identified by `generation`.
    fn close_if_current(&self, endpoint_id: &EndpointId, generation: u64) -> bool {
        let removed = {
            let mut links = lock(&self.links);
            match links.get(endpoint_id) {
                Some(link) if link.generation == generation => links.remove(endpoint_id),
                _ => None,
            }
        };
        removed.is_some()
    }
}

pub struct LanTransport {
    discovery_port: u16,
    transport_port: u16,
    shared: Arc<Shared>,
}

impl LanTransport {
    /// `transport_port` 0 picks a free port (see [`listen_port`](Self::listen_port)).
    pub fn new(discovery_port: u16, transport_port: u16) -> Self {
        let (local_name, _) = watch::channel(None);
        Self {
            discovery_port,
            transport_port,
            shared: Arc::new(Shared {
                links: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
                listen_port: AtomicU16::new(transport_port),
                local_name,
                events: Mutex::new(None),
                listener: Mutex::new(None),
                discovery_socket: Mutex::new(None),
                advertising: Mutex::new(Vec::new()),
                discovery: Mutex::new(None),
            }),
        }
    }

    /// Port the link listener is bound to, once advertising.
    pub fn listen_port(&self) -> u16 {
        self.shared.listen_port.load(Ordering::Relaxed)
    }

    /// Number of links, pending or active.
    pub fn link_count(&self) -> usize {
        lock(&self.shared.links).len()
    }
}

impl Drop for LanTransport {
    fn drop(&mut self) {
        self.stop_advertising();
        self.stop_discovery();
        self.stop_all_endpoints();
    }
}

#[async_trait]
impl Transport for LanTransport {
    async fn start_advertising(
        &self,
        local_name: &str,
        service_id: &str,
        events: TransportEvents,
    ) -> Result<(), TransportError> {
        self.stop_advertising();
        self.shared.remember_events(&events);
        self.shared.local_name.send_replace(Some(local_name.to_owned()));

        let bound = lock(&self.shared.listener).clone();
        let listener = match bound {
            Some(listener) => listener,
            None => {
                let listener =
                    Arc::new(TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.transport_port)).await?);
                *lock(&self.shared.listener) = Some(listener.clone());
                listener
            }
        };
        let listen_port = listener.local_addr()?.port();
        self.shared.listen_port.store(listen_port, Ordering::Relaxed);
        tracing::info!(listen_port, "accepting links");

        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::downgrade(&self.shared),
            events,
        ));
        let beacon = Beacon {
            service_id: service_id.to_owned(),
            endpoint_name: local_name.to_owned(),
            listen_port,
        };
        let discovery_port = self.discovery_port;
        let beacon_task = tokio::spawn(async move {
            if let Err(e) = discovery::run_beacon(beacon, discovery_port).await {
                tracing::warn!(error = %e, "beacon stopped");
            }
        });
        lock(&self.shared.advertising).extend([accept_task, beacon_task]);
        Ok(())
    }

    async fn start_discovery(
        &self,
        service_id: &str,
        events: TransportEvents,
    ) -> Result<(), TransportError> {
        self.stop_discovery();
        self.shared.remember_events(&events);
        let bound = lock(&self.shared.discovery_socket).clone();
        let socket = match bound {
            Some(socket) => socket,
            None => {
                let socket = Arc::new(discovery::bind_multicast(self.discovery_port)?);
                *lock(&self.shared.discovery_socket) = Some(socket.clone());
                socket
            }
        };
        let service_id = service_id.to_owned();
        let local_name = self.shared.local_name.subscribe();
        let task = tokio::spawn(async move {
            if let Err(e) = discovery::run_discovery(socket, service_id, local_name, events).await {
                tracing::warn!(error = %e, "discovery stopped");
            }
        });
        *lock(&self.shared.discovery) = Some(task);
        Ok(())
    }

    fn stop_advertising(&self) {
        for task in lock(&self.shared.advertising).drain(..) {
            task.abort();
        }
    }

    fn stop_discovery(&self) {
        if let Some(task) = lock(&self.shared.discovery).take() {
            task.abort();
        }
    }

    fn stop_all_endpoints(&self) {
        lock(&self.shared.links).clear();
    }

    async fn request_connection(
        &self,
        local_name: &str,
        endpoint_id: &EndpointId,
        events: TransportEvents,
    ) -> Result<(), TransportError> {
        self.shared.remember_events(&events);
        if lock(&self.shared.links).contains_key(endpoint_id) {
            return Ok(());
        }
        let addr: SocketAddr = endpoint_id
            .as_str()
            .parse()
            .map_err(|_| TransportError::UnknownEndpoint(endpoint_id.clone()))?;

        let mut stream = tokio::time::timeout(HELLO_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Other(format!("connect to {addr} timed out")))??;
        let hello = LinkFrame::Hello {
            name: local_name.to_owned(),
            listen_port: self.shared.listen_port.load(Ordering::Relaxed),
        };
        write_frame(&mut stream, &hello).await?;
        let remote_name = read_hello(&mut stream).await?;

        if self
            .shared
            .insert_pending(endpoint_id, local_name.to_owned(), stream)
        {
            events.emit(TransportEvent::ConnectionInitiated {
                endpoint_id: endpoint_id.clone(),
                remote_name,
            });
        }
        Ok(())
    }

    async fn accept_connection(
        &self,
        endpoint_id: &EndpointId,
        events: TransportEvents,
    ) -> Result<(), TransportError> {
        self.shared.remember_events(&events);
        {
            let mut links = lock(&self.shared.links);
            let mut link = links
                .remove(endpoint_id)
                .ok_or_else(|| TransportError::UnknownEndpoint(endpoint_id.clone()))?;
            let stream = match link.state {
                LinkState::Pending(stream) => stream,
                active @ LinkState::Active(_) => {
                    link.state = active;
                    links.insert(endpoint_id.clone(), link);
                    return Ok(());
                }
            };
            let (read_half, write_half) = stream.into_split();
            let (tx, rx) = mpsc::unbounded_channel();
            let reader = tokio::spawn(read_loop(
                read_half,
                tx.clone(),
                events.clone(),
                Arc::downgrade(&self.shared),
                endpoint_id.clone(),
                link.generation,
            ));
            let writer = tokio::spawn(write_loop(write_half, rx, events.clone(), endpoint_id.clone()));
            link.state = LinkState::Active(ActiveLink { tx, reader, writer });
            links.insert(endpoint_id.clone(), link);
        }
        events.emit(TransportEvent::ConnectionResult {
            endpoint_id: endpoint_id.clone(),
            status: ConnectionStatus::Success,
        });
        Ok(())
    }

    async fn reject_connection(&self, endpoint_id: &EndpointId) -> Result<(), TransportError> {
        let removed = lock(&self.shared.links).remove(endpoint_id);
        if removed.is_none() {
            return Err(TransportError::UnknownEndpoint(endpoint_id.clone()));
        }
        self.shared.emit(TransportEvent::ConnectionResult {
            endpoint_id: endpoint_id.clone(),
            status: ConnectionStatus::Rejected,
        });
        Ok(())
    }

    fn disconnect_from_endpoint(&self, endpoint_id: &EndpointId) {
        if lock(&self.shared.links).remove(endpoint_id).is_some() {
            tracing::debug!(%endpoint_id, "link dropped");
        }
    }

    fn send_payload(&self, endpoint_id: &EndpointId, payload: Payload) {
        let payload_id = payload.id();
        let queued = match lock(&self.shared.links).get(endpoint_id) {
            Some(Link {
                state: LinkState::Active(link),
                ..
            }) => link
                .tx
                .send(LinkFrame::Data {
                    payload_id,
                    bytes: payload.into_bytes(),
                })
                .is_ok(),
            _ => false,
        };
        if !queued {
            tracing::debug!(%endpoint_id, payload_id, "no active link for payload");
            self.shared.emit(TransportEvent::PayloadTransferUpdate {
                endpoint_id: endpoint_id.clone(),
                payload_id,
                status: TransferStatus::Failure,
            });
        }
    }
}

async fn read_hello(stream: &mut TcpStream) -> Result<String, TransportError> {
    let frame = tokio::time::timeout(HELLO_TIMEOUT, read_frame(stream))
        .await
        .map_err(|_| TransportError::Other("hello timed out".to_owned()))??;
    match frame {
        LinkFrame::Hello { name, .. } => Ok(name),
        other => Err(TransportError::Other(format!("expected hello, got {other:?}"))),
    }
}

async fn accept_loop(listener: Arc<TcpListener>, shared: Weak<Shared>, events: TransportEvents) {
    loop {
        match listener.accept().await {
            Ok((stream, from)) => {
                let shared = shared.clone();
                let events = events.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_inbound(stream, from, shared, events).await {
                        tracing::debug!(%from, error = %e, "inbound handshake failed");
                    }
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept error");
                break;
            }
        }
    }
}

async fn handle_inbound(
    mut stream: TcpStream,
    from: SocketAddr,
    shared: Weak<Shared>,
    events: TransportEvents,
) -> Result<(), TransportError> {
    let frame = tokio::time::timeout(HELLO_TIMEOUT, read_frame(&mut stream))
        .await
        .map_err(|_| TransportError::Other("hello timed out".to_owned()))??;
    let LinkFrame::Hello { name, listen_port } = frame else {
        return Err(TransportError::Other("expected hello".to_owned()));
    };
    let Some(shared) = shared.upgrade() else {
        return Ok(());
    };
    write_frame(&mut stream, &shared.local_hello()).await?;

    let endpoint_id = discovery::endpoint_id(from.ip(), listen_port);
    if shared.insert_pending(&endpoint_id, name.clone(), stream) {
        events.emit(TransportEvent::ConnectionInitiated {
            endpoint_id,
            remote_name: name,
        });
    }
    Ok(())
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    tx: mpsc::UnboundedSender<LinkFrame>,
    events: TransportEvents,
    shared: Weak<Shared>,
    endpoint_id: EndpointId,
    generation: u64,
) {
    loop {
        match read_frame(&mut reader).await {
            Ok(LinkFrame::Data { payload_id, bytes }) => {
                events.emit(TransportEvent::PayloadReceived {
                    endpoint_id: endpoint_id.clone(),
                    bytes,
                });
                let _ = tx.send(LinkFrame::Ack { payload_id });
            }
            Ok(LinkFrame::Ack { payload_id }) => {
                events.emit(TransportEvent::PayloadTransferUpdate {
                    endpoint_id: endpoint_id.clone(),
                    payload_id,
                    status: TransferStatus::Success,
                });
            }
            Ok(LinkFrame::Hello { .. }) => {}
            Err(e) => {
                tracing::debug!(%endpoint_id, error = %e, "link closed");
                break;
            }
        }
    }
    let current = shared
        .upgrade()
        .map(|s| s.close_if_current(&endpoint_id, generation))
        .unwrap_or(false);
    if current {
        events.emit(TransportEvent::Disconnected { endpoint_id });
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<LinkFrame>,
    events: TransportEvents,
    endpoint_id: EndpointId,
) {
    while let Some(frame) = rx.recv().await {
        let payload_id = match &frame {
            LinkFrame::Data { payload_id, .. } => Some(*payload_id),
            _ => None,
        };
        let written = write_frame(&mut writer, &frame).await;
        if let Some(payload_id) = payload_id {
            let status = if written.is_ok() {
                TransferStatus::InProgress
            } else {
                TransferStatus::Failure
            };
            events.emit(TransportEvent::PayloadTransferUpdate {
                endpoint_id: endpoint_id.clone(),
                payload_id,
                status,
            });
        }
        if let Err(e) = written {
            tracing::debug!(%endpoint_id, error = %e, "link write failed");
            break;
        }
    }
}
