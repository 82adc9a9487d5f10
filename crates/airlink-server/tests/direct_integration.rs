//! Integration tests for the session manager over the direct TCP transport.
//!
//! # Purpose
//!
//! Each test starts a real [`DirectTransport`] on an ephemeral loopback port,
//! drives it with a raw TCP client speaking the frame protocol and observes
//! the host side through [`common::ChannelHost`].  They verify:
//!
//! - The handshake: information frame, sealed secret, status reply.
//! - Registered traffic: ping/pong, sealed business messages, uploads.
//! - Teardown: peer disconnects, handshake timeout, graceful stop.
//!
//! # Handshake on a plain link
//!
//! ```text
//! Server                                Client
//! ──────                                ──────
//! accept ──► Information(4, 6)
//!                                       Authentication(seal(secret))
//! open + compare ──► Authentication(0)
//! on_session_open
//! ```

mod common;

use std::io::Write;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use airlink_core::protocol::envelope;
use airlink_core::protocol::messages::{AuthStatus, SendResultCode, ServerInfo};
use airlink_core::protocol::upload::{decode_send_result, encode_fragment, Destination, FileFragment};
use airlink_core::{Frame, MessageType, SessionId, StopReason};
use airlink_server::application::session_manager::{SessionConfig, SessionManager};
use airlink_server::application::transport::{Target, TransportError};
use airlink_server::application::upload::{UploadConfig, UploadReassembler};
use airlink_server::infrastructure::network::direct::{DirectConfig, DirectTransport};
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use common::{expect_event, next_event, read_frame, write_frame, ChannelHost, HostEvent};

const PASSWORD: &str = "correct horse";

struct Server {
    manager: Arc<SessionManager>,
    events: mpsc::UnboundedReceiver<HostEvent>,
    addr: SocketAddr,
    event_loop: tokio::task::JoinHandle<()>,
    _uploads: Option<tempfile::TempDir>,
}

impl Server {
    async fn connect(&self) -> TcpStream {
        TcpStream::connect(self.addr).await.expect("connect to server")
    }

    async fn shutdown(mut self) {
        self.manager.stop().await;
        expect_event(&mut self.events, |e| matches!(e, HostEvent::Stopped(_))).await;
        let _ = tokio::time::timeout(common::STEP, self.event_loop).await;
    }
}

async fn start_server(config: SessionConfig, with_uploads: bool) -> Server {
    let transport = Arc::new(DirectTransport::new(DirectConfig {
        bind_address: Ipv4Addr::LOCALHOST.into(),
        port: 0,
    }));
    let (host, mut events) = ChannelHost::new();
    let host = Arc::new(host);

    let mut manager = SessionManager::new(config, transport.clone(), host.clone(), host.clone());
    let mut upload_dir = None;
    if with_uploads {
        let dir = tempfile::tempdir().unwrap();
        let (uploads, outcomes) = UploadReassembler::new(UploadConfig::new(dir.path()), host);
        manager = manager.with_uploads(Arc::new(uploads), outcomes);
        upload_dir = Some(dir);
    }
    let manager = Arc::new(manager);

    let event_loop = manager.start().await.expect("transport starts");
    assert_eq!(next_event(&mut events).await, HostEvent::Started);
    let addr = transport.local_addr().await.expect("bound address");

    Server {
        manager,
        events,
        addr,
        event_loop,
        _uploads: upload_dir,
    }
}

fn with_password() -> SessionConfig {
    SessionConfig {
        password: Some(PASSWORD.to_string()),
        ..SessionConfig::default()
    }
}

/// Connects, consumes the information frame and authenticates.
async fn registered_client(server: &mut Server) -> (TcpStream, SessionId) {
    let mut stream = server.connect().await;
    let info = read_frame(&mut stream).await.expect("information frame");
    assert_eq!(info.message_type, MessageType::Information.code());

    let secret = envelope::seal(PASSWORD.as_bytes(), PASSWORD).unwrap();
    write_frame(&mut stream, &Frame::of(MessageType::Authentication, secret)).await;

    let reply = read_frame(&mut stream).await.expect("authentication reply");
    assert_eq!(reply.payload, AuthStatus::Ok.to_payload());

    let HostEvent::Opened(id) =
        expect_event(&mut server.events, |e| matches!(e, HostEvent::Opened(_))).await
    else {
        unreachable!()
    };
    (stream, id)
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

// ── Handshake ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_new_connection_receives_server_information() {
    // Arrange
    let server = start_server(SessionConfig::default(), false).await;

    // Act
    let mut stream = server.connect().await;
    let info = read_frame(&mut stream).await.expect("information frame");

    // Assert
    assert_eq!(info.message_type, MessageType::Information.code());
    assert_eq!(ServerInfo::from_payload(&info.payload), Some(ServerInfo::default()));

    drop(stream);
    server.shutdown().await;
}

#[tokio::test]
async fn test_correct_password_registers_session() {
    // Arrange
    let mut server = start_server(with_password(), false).await;

    // Act
    let (_stream, id) = registered_client(&mut server).await;

    // Assert
    assert!(matches!(id, SessionId::Direct(_)));
    assert_eq!(server.manager.active_sessions().await, vec![id]);

    server.shutdown().await;
}

#[tokio::test]
async fn test_wrong_password_is_rejected_then_disconnected() {
    // Arrange
    let mut server = start_server(with_password(), false).await;
    let mut stream = server.connect().await;
    read_frame(&mut stream).await.expect("information frame");

    // Act
    let secret = envelope::seal(b"guess", PASSWORD).unwrap();
    write_frame(&mut stream, &Frame::of(MessageType::Authentication, secret)).await;

    // Assert
    let reply = read_frame(&mut stream).await.expect("authentication reply");
    assert_eq!(reply.message_type, MessageType::Authentication.code());
    assert_eq!(reply.payload, AuthStatus::Unauthorized.to_payload());
    assert_eq!(read_frame(&mut stream).await, None, "server must hang up");

    // A session that never registered is not announced on close.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(server.events.try_recv().is_err());

    server.shutdown().await;
}

#[tokio::test]
async fn test_garbage_secret_is_bad_request() {
    let server = start_server(with_password(), false).await;
    let mut stream = server.connect().await;
    read_frame(&mut stream).await.expect("information frame");

    // Shorter than salt + IV: cannot be an envelope at all.
    write_frame(&mut stream, &Frame::of(MessageType::Authentication, vec![1, 2, 3])).await;

    let reply = read_frame(&mut stream).await.expect("authentication reply");
    assert_eq!(reply.payload, AuthStatus::BadRequest.to_payload());

    server.shutdown().await;
}

#[tokio::test]
async fn test_silent_client_is_dropped_after_handshake_timeout() {
    // Arrange
    let config = SessionConfig {
        handshake_timeout: Duration::from_millis(200),
        ..with_password()
    };
    let server = start_server(config, false).await;
    let mut stream = server.connect().await;
    read_frame(&mut stream).await.expect("information frame");

    // Act / Assert: say nothing; the server hangs up without a reply.
    assert_eq!(read_frame(&mut stream).await, None);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(server.manager.active_sessions().await.is_empty());

    server.shutdown().await;
}

// ── Registered traffic ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_ping_is_answered_with_pong() {
    let mut server = start_server(with_password(), false).await;
    let (mut stream, _) = registered_client(&mut server).await;

    write_frame(&mut stream, &Frame::empty(MessageType::Ping)).await;

    let reply = read_frame(&mut stream).await.expect("pong");
    assert_eq!(reply.message_type, MessageType::Pong.code());
    assert!(reply.payload.is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn test_sealed_business_message_reaches_handler_unsealed() {
    // Arrange
    let mut server = start_server(with_password(), false).await;
    let (mut stream, id) = registered_client(&mut server).await;

    // Act: one frame that cannot be opened, then one that can
    write_frame(&mut stream, &Frame::new(4, b"plaintext".to_vec())).await;
    let sealed = envelope::seal(b"since 1700000000", PASSWORD).unwrap();
    write_frame(&mut stream, &Frame::new(4, sealed)).await;

    // Assert: only the sealed frame is delivered
    let event = next_event(&mut server.events).await;
    assert_eq!(
        event,
        HostEvent::Message {
            session: id,
            message_type: 4,
            payload: b"since 1700000000".to_vec(),
            encrypted: true,
        }
    );

    server.shutdown().await;
}

#[tokio::test]
async fn test_sensitive_send_is_sealed_on_plain_link() {
    let mut server = start_server(with_password(), false).await;
    let (mut stream, id) = registered_client(&mut server).await;

    server
        .manager
        .send(Target::Session(id), 2, b"new message".to_vec(), true, None)
        .expect("send");

    let frame = read_frame(&mut stream).await.expect("business frame");
    assert_eq!(frame.message_type, 2);
    assert_ne!(frame.payload, b"new message".to_vec());
    assert_eq!(envelope::open(&frame.payload, PASSWORD).unwrap(), b"new message".to_vec());

    server.shutdown().await;
}

#[tokio::test]
async fn test_upload_is_reassembled_and_result_reported() {
    // Arrange
    let mut server = start_server(with_password(), true).await;
    let (mut stream, _) = registered_client(&mut server).await;
    let destination = Destination::ExistingChat {
        chat_guid: "iMessage;-;+15550100".into(),
    };
    let parts: [&[u8]; 2] = [b"hello, ", b"world"];

    // Act
    for (index, part) in parts.iter().enumerate() {
        let fragment = FileFragment {
            request_id: 7,
            index: index as i32,
            is_last: index == parts.len() - 1,
            destination: destination.clone(),
            data: gzip(part),
            file_name: (index == 0).then(|| "greeting.txt".to_string()),
        };
        let sealed = envelope::seal(&encode_fragment(&fragment).unwrap(), PASSWORD).unwrap();
        write_frame(&mut stream, &Frame::of(MessageType::SendFileExisting, sealed)).await;
    }

    // Assert: the host got the whole file
    let event = expect_event(&mut server.events, |e| matches!(e, HostEvent::File { .. })).await;
    assert_eq!(
        event,
        HostEvent::File {
            destination,
            contents: b"hello, world".to_vec(),
        }
    );

    // Assert: the client got a sealed send result
    let frame = read_frame(&mut stream).await.expect("send result");
    assert_eq!(frame.message_type, MessageType::SendResult.code());
    let result = decode_send_result(&envelope::open(&frame.payload, PASSWORD).unwrap()).unwrap();
    assert_eq!(result.request_id, 7);
    assert_eq!(result.code, SendResultCode::Ok);

    server.shutdown().await;
}

// ── Teardown ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_peer_disconnect_notifies_handler() {
    let mut server = start_server(with_password(), false).await;
    let (stream, id) = registered_client(&mut server).await;

    drop(stream);

    let event = expect_event(&mut server.events, |e| matches!(e, HostEvent::Closed(_))).await;
    assert_eq!(event, HostEvent::Closed(id));
    assert!(server.manager.active_sessions().await.is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn test_close_request_is_acknowledged_and_disconnected() {
    let mut server = start_server(with_password(), false).await;
    let (mut stream, id) = registered_client(&mut server).await;

    write_frame(&mut stream, &Frame::empty(MessageType::Close)).await;

    let reply = read_frame(&mut stream).await.expect("close frame");
    assert_eq!(reply.message_type, MessageType::Close.code());
    assert_eq!(read_frame(&mut stream).await, None);
    let event = expect_event(&mut server.events, |e| matches!(e, HostEvent::Closed(_))).await;
    assert_eq!(event, HostEvent::Closed(id));

    server.shutdown().await;
}

#[tokio::test]
async fn test_stop_sends_close_frame_to_every_client() {
    // Arrange
    let mut server = start_server(with_password(), false).await;
    let (mut stream, id) = registered_client(&mut server).await;

    // Act
    server.manager.stop().await;

    // Assert
    let frame = read_frame(&mut stream).await.expect("close frame");
    assert_eq!(frame.message_type, MessageType::Close.code());
    assert_eq!(read_frame(&mut stream).await, None);

    let mut saw_close = false;
    loop {
        match next_event(&mut server.events).await {
            HostEvent::Closed(closed) => {
                assert_eq!(closed, id);
                saw_close = true;
            }
            HostEvent::Stopped(reason) => {
                assert_eq!(reason, StopReason::Requested);
                break;
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert!(saw_close);
}

#[tokio::test]
async fn test_port_in_use_fails_start() {
    // Arrange: occupy a port
    let server = start_server(SessionConfig::default(), false).await;
    let port = server.addr.port();

    let transport = Arc::new(DirectTransport::new(DirectConfig {
        bind_address: Ipv4Addr::LOCALHOST.into(),
        port,
    }));
    let (host, mut events) = ChannelHost::new();
    let host = Arc::new(host);
    let manager = Arc::new(SessionManager::new(
        SessionConfig::default(),
        transport,
        host.clone(),
        host,
    ));

    // Act
    let result = manager.start().await;

    // Assert
    assert!(matches!(result, Err(TransportError::PortInUse { .. })));
    assert_eq!(
        next_event(&mut events).await,
        HostEvent::Stopped(StopReason::PortUnavailable { port })
    );

    server.shutdown().await;
}
