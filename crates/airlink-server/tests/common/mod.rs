//! Helpers shared by the integration tests.
//!
//! [`ChannelHost`] stands in for the host's business logic: every callback
//! from the session manager is forwarded as a [`HostEvent`] on an unbounded
//! channel so tests can `await` it with a timeout instead of polling.

#![allow(dead_code)]

use std::path::Path;
use std::time::Duration;

use airlink_core::protocol::codec::parse_header;
use airlink_core::protocol::messages::{SendResultCode, FRAME_HEADER_SIZE};
use airlink_core::protocol::upload::Destination;
use airlink_core::{encode_frame, Frame, SessionId, StopReason};
use airlink_server::application::session_manager::{MessageHandler, StateReporter};
use airlink_server::application::upload::FileSender;
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// How long any single expected event may take.
pub const STEP: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    Started,
    Paused(StopReason),
    Stopped(StopReason),
    Opened(SessionId),
    Closed(SessionId),
    Message {
        session: SessionId,
        message_type: i32,
        payload: Vec<u8>,
        encrypted: bool,
    },
    File {
        destination: Destination,
        contents: Vec<u8>,
    },
}

/// Forwards every collaborator callback to a channel.
pub struct ChannelHost {
    events: mpsc::UnboundedSender<HostEvent>,
}

impl ChannelHost {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<HostEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Self { events }, rx)
    }

    fn emit(&self, event: HostEvent) {
        let _ = self.events.send(event);
    }
}

impl MessageHandler for ChannelHost {
    fn on_session_open(&self, session: SessionId) {
        self.emit(HostEvent::Opened(session));
    }

    fn on_session_close(&self, session: SessionId) {
        self.emit(HostEvent::Closed(session));
    }

    fn on_message(&self, session: SessionId, message_type: i32, payload: Vec<u8>, encrypted: bool) {
        self.emit(HostEvent::Message {
            session,
            message_type,
            payload,
            encrypted,
        });
    }
}

impl StateReporter for ChannelHost {
    fn on_transport_started(&self) {
        self.emit(HostEvent::Started);
    }

    fn on_transport_paused(&self, reason: &StopReason) {
        self.emit(HostEvent::Paused(reason.clone()));
    }

    fn on_transport_stopped(&self, reason: &StopReason) {
        self.emit(HostEvent::Stopped(reason.clone()));
    }
}

#[async_trait]
impl FileSender for ChannelHost {
    async fn send_file(&self, destination: &Destination, path: &Path) -> (SendResultCode, Option<String>) {
        match tokio::fs::read(path).await {
            Ok(contents) => {
                self.emit(HostEvent::File {
                    destination: destination.clone(),
                    contents,
                });
                (SendResultCode::Ok, None)
            }
            Err(e) => (SendResultCode::ScriptError, Some(e.to_string())),
        }
    }
}

/// Waits for the next host event, failing the test after [`STEP`].
pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<HostEvent>) -> HostEvent {
    tokio::time::timeout(STEP, rx.recv())
        .await
        .expect("timed out waiting for a host event")
        .expect("host event channel closed")
}

/// Skips events until `want` matches one, failing after [`STEP`] per event.
pub async fn expect_event<F>(rx: &mut mpsc::UnboundedReceiver<HostEvent>, mut want: F) -> HostEvent
where
    F: FnMut(&HostEvent) -> bool,
{
    loop {
        let event = next_event(rx).await;
        if want(&event) {
            return event;
        }
    }
}

// ── Raw TCP client ────────────────────────────────────────────────────────────

pub async fn write_frame(stream: &mut TcpStream, frame: &Frame) {
    let bytes = encode_frame(frame).expect("encode frame");
    stream.write_all(&bytes).await.expect("write frame");
}

/// Reads one frame, or `None` once the server has closed the connection.
pub async fn read_frame(stream: &mut TcpStream) -> Option<Frame> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    let read = tokio::time::timeout(STEP, stream.read_exact(&mut header))
        .await
        .expect("timed out waiting for a frame");
    if read.is_err() {
        return None;
    }
    let header = parse_header(&header).expect("valid header");
    let mut payload = vec![0u8; header.length];
    stream.read_exact(&mut payload).await.ok()?;
    Some(Frame::new(header.message_type, payload))
}
