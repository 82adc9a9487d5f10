//! Direct transport: clients connect straight to a TCP listener.
//!
//! # Tasks (for beginners)
//!
//! ```text
//!  accept loop ──Attach──►┐
//!  reader (per client) ───┤ WriterCommand queue ──► writer task ──► sockets
//!  Transport::send ───────┘
//! ```
//!
//! - The **accept loop** numbers each connection, hands its write half to the
//!   writer, reports `Opened`, and spawns a reader.  It wakes every 200 ms to
//!   check the running flag, so `stop` never waits on a blocked `accept()`.
//! - Each **reader** reads one header, validates the declared length, reads
//!   the payload and reports a `Frame` event.  EOF, a read error or an
//!   oversized header queue a disconnect.
//! - The single **writer** owns every write half.  Because sends, disconnects
//!   and shutdown all go through its FIFO queue, a close frame queued before
//!   a disconnect is always flushed first, and frames never interleave.
//!
//! `Closed` is reported by the writer when it drops a connection, exactly
//! once per connection.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use airlink_core::domain::ids::ConnectionIdAllocator;
use airlink_core::protocol::codec::parse_header;
use airlink_core::protocol::messages::FRAME_HEADER_SIZE;
use airlink_core::{encode_frame, Frame, MessageType, SessionId, StopReason};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::application::session::Session;
use crate::application::transport::{Outbound, Transport, TransportError, TransportEvent};

/// Port the host listens on by default.
pub const DEFAULT_PORT: u16 = 1359;

/// How often the accept loop re-checks the running flag.
const ACCEPT_POLL: Duration = Duration::from_millis(200);

/// A peer that stops reading is dropped after this long.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Payload bytes reserved up front; the rest grows as bytes arrive.
const INITIAL_PAYLOAD_CAPACITY: usize = 64 * 1024;

/// Where the direct transport listens.
#[derive(Debug, Clone)]
pub struct DirectConfig {
    pub bind_address: IpAddr,
    pub port: u16,
}

impl Default for DirectConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
        }
    }
}

enum WriterCommand {
    Attach {
        session: Arc<Session>,
        half: OwnedWriteHalf,
    },
    Send(Outbound),
    Disconnect(SessionId),
    Shutdown,
}

/// Reader bookkeeping, shared between the accept loop and the writer.
type Registry = Arc<Mutex<HashMap<SessionId, AbortHandle>>>;

/// TCP listener transport.
pub struct DirectTransport {
    config: DirectConfig,
    ids: Arc<ConnectionIdAllocator>,
    registry: Registry,
    commands: mpsc::UnboundedSender<WriterCommand>,
    commands_rx: Mutex<Option<mpsc::UnboundedReceiver<WriterCommand>>>,
    running: Arc<AtomicBool>,
    local_addr: Mutex<Option<SocketAddr>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
}

impl DirectTransport {
    pub fn new(config: DirectConfig) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        Self {
            config,
            ids: Arc::new(ConnectionIdAllocator::new()),
            registry: Arc::new(Mutex::new(HashMap::new())),
            commands,
            commands_rx: Mutex::new(Some(commands_rx)),
            running: Arc::new(AtomicBool::new(false)),
            local_addr: Mutex::new(None),
            accept_task: Mutex::new(None),
            writer_task: Mutex::new(None),
        }
    }

    /// The bound address, once started. Useful when configured with port 0.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    async fn bind(&self) -> Result<TcpListener, TransportError> {
        let addr = SocketAddr::new(self.config.bind_address, self.config.port);
        let listener = TcpListener::bind(addr).await.map_err(|source| {
            if source.kind() == std::io::ErrorKind::AddrInUse {
                TransportError::PortInUse {
                    port: self.config.port,
                    source,
                }
            } else {
                TransportError::Bind { addr, source }
            }
        })?;
        let local = listener
            .local_addr()
            .map_err(|e| TransportError::Internal(format!("failed to read local address: {e}")))?;
        *self.local_addr.lock().await = Some(local);
        Ok(listener)
    }
}

#[async_trait]
impl Transport for DirectTransport {
    async fn start(&self, events: mpsc::UnboundedSender<TransportEvent>) -> Result<(), TransportError> {
        let Some(commands_rx) = self.commands_rx.lock().await.take() else {
            return Err(TransportError::AlreadyStarted);
        };

        let listener = match self.bind().await {
            Ok(listener) => listener,
            Err(e) => {
                error!("direct transport failed to start: {e}");
                let _ = events.send(TransportEvent::Stopped(e.stop_reason()));
                return Err(e);
            }
        };
        self.running.store(true, Ordering::Release);

        let writer = tokio::spawn(run_writer(commands_rx, Arc::clone(&self.registry), events.clone()));
        *self.writer_task.lock().await = Some(writer);

        if let Some(addr) = self.local_addr().await {
            info!("direct transport listening on {addr}");
        }
        let _ = events.send(TransportEvent::Started);

        let accept = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.running),
            Arc::clone(&self.ids),
            Arc::clone(&self.registry),
            self.commands.clone(),
            events,
        ));
        *self.accept_task.lock().await = Some(accept);
        Ok(())
    }

    async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(accept) = self.accept_task.lock().await.take() {
            let _ = accept.await;
        }
        let _ = self.commands.send(WriterCommand::Shutdown);
        if let Some(writer) = self.writer_task.lock().await.take() {
            let _ = writer.await;
        }
        info!("direct transport stopped");
    }

    fn send(&self, outbound: Outbound) {
        let _ = self.commands.send(WriterCommand::Send(outbound));
    }

    fn disconnect(&self, session: SessionId) {
        let _ = self.commands.send(WriterCommand::Disconnect(session));
    }

    async fn connections(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.registry.lock().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn encrypts_in_transit(&self) -> bool {
        false
    }
}

// ── Accept loop ───────────────────────────────────────────────────────────────

async fn accept_loop(
    listener: TcpListener,
    running: Arc<AtomicBool>,
    ids: Arc<ConnectionIdAllocator>,
    registry: Registry,
    commands: mpsc::UnboundedSender<WriterCommand>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    while running.load(Ordering::Acquire) {
        match timeout(ACCEPT_POLL, listener.accept()).await {
            Ok(Ok((stream, peer))) => {
                let id = ids.next();
                debug!("connection {id}: accepted from {peer}");
                attach(id, stream, &registry, &commands, &events).await;
            }
            Ok(Err(e)) => {
                // Transient accept error (e.g., too many open file descriptors).
                error!("accept error: {e}");
            }
            Err(_elapsed) => {}
        }
    }
    debug!("accept loop finished");
}

/// Registers a new connection with the writer, reports it, and starts its
/// reader.  The registry lock is held throughout so a disconnect for this id
/// cannot be processed before the reader's handle is recorded.
async fn attach(
    id: SessionId,
    stream: TcpStream,
    registry: &Registry,
    commands: &mpsc::UnboundedSender<WriterCommand>,
    events: &mpsc::UnboundedSender<TransportEvent>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("connection {id}: set_nodelay failed: {e}");
    }
    let (read_half, write_half) = stream.into_split();
    let session = Session::new(id);

    let mut registry = registry.lock().await;
    if commands
        .send(WriterCommand::Attach {
            session: Arc::clone(&session),
            half: write_half,
        })
        .is_err()
    {
        return;
    }
    let _ = events.send(TransportEvent::Opened(session));
    let reader = tokio::spawn(read_loop(id, read_half, events.clone(), commands.clone()));
    registry.insert(id, reader.abort_handle());
}

// ── Reader ────────────────────────────────────────────────────────────────────

async fn read_loop(
    id: SessionId,
    mut reader: OwnedReadHalf,
    events: mpsc::UnboundedSender<TransportEvent>,
    commands: mpsc::UnboundedSender<WriterCommand>,
) {
    let mut header_buf = [0u8; FRAME_HEADER_SIZE];
    loop {
        if let Err(e) = reader.read_exact(&mut header_buf).await {
            if e.kind() != std::io::ErrorKind::UnexpectedEof {
                debug!("connection {id}: read error: {e}");
            }
            break;
        }

        let header = match parse_header(&header_buf) {
            Ok(header) => header,
            Err(e) => {
                warn!("connection {id}: {e}; dropping connection");
                break;
            }
        };

        let payload = match read_payload(&mut reader, header.length).await {
            Ok(payload) => payload,
            Err(e) => {
                debug!("connection {id}: stream ended mid-frame: {e}");
                break;
            }
        };

        let event = TransportEvent::Frame {
            session: id,
            frame: Frame::new(header.message_type, payload),
            encrypted_in_transit: false,
        };
        if events.send(event).is_err() {
            break;
        }
    }
    let _ = commands.send(WriterCommand::Disconnect(id));
}

/// Reads exactly `length` payload bytes.
///
/// Memory follows the bytes actually received, so a header alone cannot make
/// the server reserve the full declared length.
async fn read_payload<R: AsyncRead + Unpin>(reader: &mut R, length: usize) -> std::io::Result<Vec<u8>> {
    let mut payload = Vec::with_capacity(length.min(INITIAL_PAYLOAD_CAPACITY));
    let received = reader.take(length as u64).read_to_end(&mut payload).await?;
    if received < length {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("expected {length} payload bytes, got {received}"),
        ));
    }
    Ok(payload)
}

// ── Writer ────────────────────────────────────────────────────────────────────

struct Peer {
    session: Arc<Session>,
    half: OwnedWriteHalf,
}

async fn run_writer(
    mut commands: mpsc::UnboundedReceiver<WriterCommand>,
    registry: Registry,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let mut peers: HashMap<SessionId, Peer> = HashMap::new();

    while let Some(command) = commands.recv().await {
        match command {
            WriterCommand::Attach { session, half } => {
                peers.insert(session.id(), Peer { session, half });
            }
            WriterCommand::Send(mut outbound) => {
                match encode_frame(&outbound.frame) {
                    Ok(bytes) => {
                        let targets: Vec<SessionId> = peers
                            .values()
                            .filter(|peer| outbound.delivers_to(&peer.session))
                            .map(|peer| peer.session.id())
                            .collect();
                        for id in targets {
                            if !write_to(&mut peers, id, &bytes).await {
                                drop_peer(&mut peers, &registry, &events, id).await;
                            }
                        }
                    }
                    Err(e) => warn!("dropping outbound frame: {e}"),
                }
                outbound.complete();
            }
            WriterCommand::Disconnect(id) => drop_peer(&mut peers, &registry, &events, id).await,
            WriterCommand::Shutdown => break,
        }
    }

    // Graceful teardown: every remaining peer gets a close frame first.
    let ids: Vec<SessionId> = peers.keys().copied().collect();
    if let Ok(close) = encode_frame(&Frame::empty(MessageType::Close)) {
        for &id in &ids {
            let _ = write_to(&mut peers, id, &close).await;
        }
    }
    for id in ids {
        drop_peer(&mut peers, &registry, &events, id).await;
    }
    let _ = events.send(TransportEvent::Stopped(StopReason::Requested));
}

/// Writes `bytes` to one peer. Returns `false` if the peer must be dropped.
async fn write_to(peers: &mut HashMap<SessionId, Peer>, id: SessionId, bytes: &[u8]) -> bool {
    let Some(peer) = peers.get_mut(&id) else {
        return true;
    };
    match timeout(WRITE_TIMEOUT, peer.half.write_all(bytes)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!("connection {id}: write failed: {e}");
            false
        }
        Err(_) => {
            warn!("connection {id}: write timed out");
            false
        }
    }
}

async fn drop_peer(
    peers: &mut HashMap<SessionId, Peer>,
    registry: &Registry,
    events: &mpsc::UnboundedSender<TransportEvent>,
    id: SessionId,
) {
    let Some(mut peer) = peers.remove(&id) else {
        return;
    };
    let _ = peer.half.shutdown().await;
    if let Some(reader) = registry.lock().await.remove(&id) {
        reader.abort();
    }
    debug!("connection {id}: closed");
    let _ = events.send(TransportEvent::Closed(id));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::transport::Target;
    use airlink_core::decode_frame;

    fn local_config() -> DirectConfig {
        DirectConfig {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event within 5 s")
            .expect("channel open")
    }

    async fn read_frame(stream: &mut TcpStream) -> Frame {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        stream.read_exact(&mut header).await.unwrap();
        let len = parse_header(&header).unwrap().length;
        let mut bytes = header.to_vec();
        bytes.resize(FRAME_HEADER_SIZE + len, 0);
        stream.read_exact(&mut bytes[FRAME_HEADER_SIZE..]).await.unwrap();
        decode_frame(&bytes).unwrap().0
    }

    async fn started() -> (DirectTransport, mpsc::UnboundedReceiver<TransportEvent>, SocketAddr) {
        let transport = DirectTransport::new(local_config());
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.start(tx).await.unwrap();
        assert!(matches!(next_event(&mut rx).await, TransportEvent::Started));
        let addr = transport.local_addr().await.unwrap();
        (transport, rx, addr)
    }

    #[tokio::test]
    async fn test_port_in_use_reports_stopped_once() {
        // Arrange: occupy a port
        let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = blocker.local_addr().unwrap().port();
        let transport = DirectTransport::new(DirectConfig {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
        });
        let (tx, mut rx) = mpsc::unbounded_channel();

        // Act
        let result = transport.start(tx).await;

        // Assert
        assert!(matches!(result, Err(TransportError::PortInUse { port: p, .. }) if p == port));
        match rx.recv().await {
            Some(TransportEvent::Stopped(reason)) => {
                assert_eq!(reason, StopReason::PortUnavailable { port })
            }
            other => panic!("expected Stopped, got {other:?}"),
        }
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let (transport, _rx, _) = started().await;
        let (tx, _rx2) = mpsc::unbounded_channel();
        assert!(matches!(
            transport.start(tx).await,
            Err(TransportError::AlreadyStarted)
        ));
        transport.stop().await;
    }

    #[tokio::test]
    async fn test_inbound_frame_is_reported_after_open() {
        // Arrange
        let (transport, mut rx, addr) = started().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        // Act
        let bytes = encode_frame(&Frame::new(1, b"secret".to_vec())).unwrap();
        client.write_all(&bytes).await.unwrap();

        // Assert
        let id = match next_event(&mut rx).await {
            TransportEvent::Opened(session) => session.id(),
            other => panic!("expected Opened, got {other:?}"),
        };
        match next_event(&mut rx).await {
            TransportEvent::Frame {
                session,
                frame,
                encrypted_in_transit,
            } => {
                assert_eq!(session, id);
                assert_eq!(frame, Frame::new(1, b"secret".to_vec()));
                assert!(!encrypted_in_transit);
            }
            other => panic!("expected Frame, got {other:?}"),
        }
        assert_eq!(transport.connections().await, vec![id]);
        transport.stop().await;
    }

    #[tokio::test]
    async fn test_read_payload_grows_with_received_bytes() {
        // Arrange: the peer declares 50 MiB but sends ten bytes and hangs up
        let declared = 50 * 1024 * 1024;
        let (mut near, mut far) = tokio::io::duplex(1024);
        far.write_all(&[7u8; 10]).await.unwrap();
        drop(far);

        // Act
        let err = read_payload(&mut near, declared).await.unwrap_err();

        // Assert
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
        assert!(err.to_string().contains("got 10"), "{err}");
    }

    #[tokio::test]
    async fn test_read_payload_stops_at_declared_length() {
        let (mut near, mut far) = tokio::io::duplex(1024);
        far.write_all(b"helloNEXT").await.unwrap();

        let payload = read_payload(&mut near, 5).await.unwrap();
        let mut rest = [0u8; 4];
        near.read_exact(&mut rest).await.unwrap();

        assert_eq!(payload, b"hello");
        assert_eq!(&rest, b"NEXT");
    }

    #[tokio::test]
    async fn test_oversized_header_drops_connection_without_reply() {
        let (transport, mut rx, addr) = started().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        let mut header = Vec::new();
        header.extend_from_slice(&5i32.to_be_bytes());
        header.extend_from_slice(&u32::MAX.to_be_bytes());
        client.write_all(&header).await.unwrap();

        let id = match next_event(&mut rx).await {
            TransportEvent::Opened(session) => session.id(),
            other => panic!("expected Opened, got {other:?}"),
        };
        assert!(matches!(next_event(&mut rx).await, TransportEvent::Closed(c) if c == id));

        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        transport.stop().await;
    }

    #[tokio::test]
    async fn test_send_then_disconnect_flushes_frame_first() {
        // Arrange
        let (transport, mut rx, addr) = started().await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        let id = match next_event(&mut rx).await {
            TransportEvent::Opened(session) => session.id(),
            other => panic!("expected Opened, got {other:?}"),
        };

        // Act
        transport.send(Outbound::new(
            Target::Session(id),
            Frame::empty(MessageType::Close),
            false,
        ));
        transport.disconnect(id);

        // Assert
        assert_eq!(read_frame(&mut client).await, Frame::empty(MessageType::Close));
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        assert!(matches!(next_event(&mut rx).await, TransportEvent::Closed(c) if c == id));
        transport.stop().await;
    }

    #[tokio::test]
    async fn test_sensitive_broadcast_skips_unregistered_connection() {
        let (transport, mut rx, addr) = started().await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        let id = match next_event(&mut rx).await {
            TransportEvent::Opened(session) => session.id(),
            other => panic!("expected Opened, got {other:?}"),
        };

        transport.send(Outbound::new(Target::Broadcast, Frame::new(9, vec![1]), true));
        transport.send(Outbound::new(Target::Session(id), Frame::new(10, vec![2]), false));

        // Only the targeted frame arrives
        assert_eq!(read_frame(&mut client).await, Frame::new(10, vec![2]));
        transport.stop().await;
    }

    #[tokio::test]
    async fn test_stop_sends_close_to_every_connection() {
        let (transport, mut rx, addr) = started().await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        let id = match next_event(&mut rx).await {
            TransportEvent::Opened(session) => session.id(),
            other => panic!("expected Opened, got {other:?}"),
        };

        transport.stop().await;

        assert_eq!(read_frame(&mut client).await, Frame::empty(MessageType::Close));
        assert!(matches!(next_event(&mut rx).await, TransportEvent::Closed(c) if c == id));
        assert!(matches!(
            next_event(&mut rx).await,
            TransportEvent::Stopped(StopReason::Requested)
        ));
        assert!(transport.connections().await.is_empty());
    }
}
