//! Relay transport: one outbound WebSocket multiplexing many clients.
//!
//! The host dials the relay; clients dial the relay too, and the relay
//! forwards their traffic to us tagged with a connection id it assigns.
//! Every WebSocket binary message is one outer relay message (see
//! [`airlink_core::protocol::relay`]).
//!
//! # Link lifecycle (for beginners)
//!
//! ```text
//!          connect ──► awaiting connection-ok ──► live
//!             ▲          │ (8 s deadline)          │
//!             │          ▼                         ▼
//!   backoff ◄─┴── transient close ◄────────────────┤
//!                                                  ▼
//!                                   terminal close ──► Stopped(reason)
//! ```
//!
//! A single supervisor task owns the socket, the session table writes and
//! the reconnect policy.  It is also the transport's only writer: sends,
//! disconnects and shutdown reach it through one FIFO command queue, so
//! outbound order is total for the whole link.
//!
//! Reconnect delay is `2^min(attempt, 8)` seconds plus up to one second of
//! jitter.  The attempt counter only resets when the relay confirms the link
//! with connection-ok, not when the socket merely opens.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use airlink_core::protocol::codec::decode_exact_frame;
use airlink_core::protocol::relay::{
    close_reason, decode_relay_message, encode_relay_message, RelayMessage,
};
use airlink_core::{encode_frame, ReconnectBackoff, SessionId, StopReason};
use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::ORIGIN;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::application::session::Session;
use crate::application::transport::{Outbound, Target, Transport, TransportError, TransportEvent};

/// Relay protocol revision sent in the `communications` query parameter.
pub const COMMUNICATIONS_VERSION: u32 = 1;

/// Default time the relay has to confirm the link.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(8);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type SessionTable = Arc<Mutex<HashMap<SessionId, Arc<Session>>>>;

/// How this installation identifies itself to the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayCredential {
    /// First registration, with an account identity token.
    IdToken(String),
    /// Returning installation, by account user id.
    UserId(String),
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// `ws://` or `wss://` address of the relay.
    pub url: String,
    pub installation_id: String,
    pub credential: RelayCredential,
    pub handshake_timeout: Duration,
}

/// Why the relay address could not be turned into a connect request.
#[derive(Debug, Error)]
enum RequestError {
    #[error("{0}")]
    Url(#[from] url::ParseError),

    #[error("{0}")]
    WebSocket(#[from] WsError),
}

enum RelayCommand {
    Send(Outbound),
    Disconnect(SessionId),
    Shutdown,
}

/// Why one link attempt ended.
enum LinkEnd {
    Shutdown,
    Lost(StopReason),
}

/// WebSocket client transport.
pub struct RelayTransport {
    config: RelayConfig,
    sessions: SessionTable,
    commands: mpsc::UnboundedSender<RelayCommand>,
    commands_rx: Mutex<Option<mpsc::UnboundedReceiver<RelayCommand>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl RelayTransport {
    pub fn new(config: RelayConfig) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        Self {
            config,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            commands,
            commands_rx: Mutex::new(Some(commands_rx)),
            supervisor: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Transport for RelayTransport {
    async fn start(&self, events: mpsc::UnboundedSender<TransportEvent>) -> Result<(), TransportError> {
        let Some(commands) = self.commands_rx.lock().await.take() else {
            return Err(TransportError::AlreadyStarted);
        };
        // Already installed by an earlier transport in this process is fine.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let task = tokio::spawn(supervise(
            self.config.clone(),
            commands,
            Arc::clone(&self.sessions),
            events,
        ));
        *self.supervisor.lock().await = Some(task);
        info!("relay transport connecting to {}", self.config.url);
        Ok(())
    }

    async fn stop(&self) {
        let _ = self.commands.send(RelayCommand::Shutdown);
        if let Some(task) = self.supervisor.lock().await.take() {
            let _ = task.await;
        }
    }

    fn send(&self, outbound: Outbound) {
        let _ = self.commands.send(RelayCommand::Send(outbound));
    }

    fn disconnect(&self, session: SessionId) {
        let _ = self.commands.send(RelayCommand::Disconnect(session));
    }

    async fn connections(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.lock().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn encrypts_in_transit(&self) -> bool {
        true
    }
}

// ── Supervisor ────────────────────────────────────────────────────────────────

async fn supervise(
    config: RelayConfig,
    mut commands: mpsc::UnboundedReceiver<RelayCommand>,
    sessions: SessionTable,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let mut backoff = ReconnectBackoff::new();

    let reason = loop {
        let end = run_link(&config, &mut commands, &sessions, &events, &mut backoff).await;
        close_all(&sessions, &events).await;

        match end {
            LinkEnd::Shutdown => break StopReason::Requested,
            LinkEnd::Lost(reason) if reason.is_transient() => {
                let jitter: f64 = rand::thread_rng().gen();
                let delay = backoff.next_delay(jitter);
                warn!(
                    "relay link lost ({reason}); reconnect attempt {} in {delay:?}",
                    backoff.attempt()
                );
                let _ = events.send(TransportEvent::Paused(reason));
                let shutdown = tokio::select! {
                    _ = tokio::time::sleep(delay) => false,
                    _ = until_shutdown(&mut commands) => true,
                };
                if shutdown {
                    break StopReason::Requested;
                }
            }
            LinkEnd::Lost(reason) => {
                error!("relay refused this server: {reason}");
                break reason;
            }
        }
    };

    info!("relay transport stopped: {reason}");
    let _ = events.send(TransportEvent::Stopped(reason));
}

/// Drops queued work until shutdown is requested or the queue closes.
///
/// Nothing is live while the link is down, so a dropped send never runs its
/// sent callback.
async fn until_shutdown(commands: &mut mpsc::UnboundedReceiver<RelayCommand>) {
    while let Some(command) = commands.recv().await {
        match command {
            RelayCommand::Shutdown => return,
            RelayCommand::Send(outbound) => {
                debug!("relay link is down; dropping {outbound:?}");
            }
            RelayCommand::Disconnect(id) => {
                debug!("relay link is down; connection {id} is already gone");
            }
        }
    }
}

async fn run_link(
    config: &RelayConfig,
    commands: &mut mpsc::UnboundedReceiver<RelayCommand>,
    sessions: &SessionTable,
    events: &mpsc::UnboundedSender<TransportEvent>,
    backoff: &mut ReconnectBackoff,
) -> LinkEnd {
    let request = match build_request(config) {
        Ok(request) => request,
        Err(e) => return LinkEnd::Lost(StopReason::Internal(format!("invalid relay address: {e}"))),
    };

    let ws = tokio::select! {
        result = timeout(config.handshake_timeout, connect_async(request)) => match result {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(e)) => {
                warn!("relay connect failed: {e}");
                return LinkEnd::Lost(connect_failure(&e));
            }
            Err(_) => {
                warn!("relay connect timed out");
                return LinkEnd::Lost(StopReason::Connectivity);
            }
        },
        _ = until_shutdown(commands) => return LinkEnd::Shutdown,
    };
    // The relay's confirmation window starts once the socket is open.
    let deadline = Instant::now() + config.handshake_timeout;
    debug!("relay socket open; awaiting connection-ok");

    let (mut sink, mut stream) = ws.split();
    let mut live = false;

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(RelayCommand::Send(outbound)) => {
                    if let Err(e) = send_outbound(&mut sink, sessions, outbound).await {
                        warn!("relay write failed: {e}");
                        return LinkEnd::Lost(StopReason::Connectivity);
                    }
                }
                Some(RelayCommand::Disconnect(id)) => {
                    if let Err(e) = disconnect(&mut sink, sessions, events, id).await {
                        warn!("relay write failed: {e}");
                        return LinkEnd::Lost(StopReason::Connectivity);
                    }
                }
                Some(RelayCommand::Shutdown) | None => {
                    let _ = sink.close().await;
                    return LinkEnd::Shutdown;
                }
            },

            _ = tokio::time::sleep_until(deadline), if !live => {
                warn!("relay did not confirm the link within {:?}", config.handshake_timeout);
                let _ = sink.close().await;
                return LinkEnd::Lost(StopReason::Connectivity);
            }

            message = stream.next() => match message {
                Some(Ok(Message::Binary(bytes))) => {
                    let confirmed = handle_message(&bytes, &mut sink, sessions, events).await;
                    match confirmed {
                        Ok(true) => {
                            live = true;
                            backoff.reset();
                            info!("relay link confirmed");
                            let _ = events.send(TransportEvent::Started);
                        }
                        Ok(false) => {}
                        Err(e) => {
                            warn!("relay write failed: {e}");
                            return LinkEnd::Lost(StopReason::Connectivity);
                        }
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let code = frame.map(|f| u16::from(f.code));
                    debug!("relay closed the link with code {code:?}");
                    return LinkEnd::Lost(close_reason(code));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("relay read failed: {e}");
                    return LinkEnd::Lost(StopReason::Connectivity);
                }
                None => return LinkEnd::Lost(close_reason(None)),
            },
        }
    }
}

/// Applies one inbound outer message.  Returns `Ok(true)` for connection-ok.
async fn handle_message(
    bytes: &[u8],
    sink: &mut WsSink,
    sessions: &SessionTable,
    events: &mpsc::UnboundedSender<TransportEvent>,
) -> Result<bool, WsError> {
    let message = match decode_relay_message(bytes) {
        Ok(message) => message,
        Err(e) => {
            warn!("ignoring relay message: {e}");
            return Ok(false);
        }
    };

    match message {
        RelayMessage::ConnectionOk => return Ok(true),
        RelayMessage::ServerOpen { connection_id } => {
            let id = SessionId::Relay(connection_id);
            let mut table = sessions.lock().await;
            if table.contains_key(&id) {
                debug!("connection {id}: duplicate open ignored");
            } else {
                let session = Session::new(id);
                table.insert(id, Arc::clone(&session));
                debug!("connection {id}: opened by relay");
                let _ = events.send(TransportEvent::Opened(session));
            }
        }
        RelayMessage::ServerClose { connection_id } => {
            let id = SessionId::Relay(connection_id);
            if sessions.lock().await.remove(&id).is_some() {
                debug!("connection {id}: closed by relay");
                let _ = events.send(TransportEvent::Closed(id));
            }
        }
        RelayMessage::ServerProxy {
            connection_id,
            payload,
        } => {
            let id = SessionId::Relay(connection_id);
            let known = sessions.lock().await.contains_key(&id);
            if !known {
                debug!("connection {id}: traffic for unknown connection, closing it at the relay");
                write(sink, &RelayMessage::ServerClose { connection_id }).await?;
                return Ok(false);
            }
            match decode_exact_frame(&payload) {
                Ok(frame) => {
                    let _ = events.send(TransportEvent::Frame {
                        session: id,
                        frame,
                        encrypted_in_transit: true,
                    });
                }
                Err(e) => {
                    warn!("connection {id}: {e}; dropping connection");
                    disconnect(sink, sessions, events, id).await?;
                }
            }
        }
        RelayMessage::ServerProxyBroadcast { .. } => {
            debug!("ignoring broadcast sent to a server");
        }
    }
    Ok(false)
}

// ── Outbound ──────────────────────────────────────────────────────────────────

async fn send_outbound(
    sink: &mut WsSink,
    sessions: &SessionTable,
    mut outbound: Outbound,
) -> Result<(), WsError> {
    let inner = match encode_frame(&outbound.frame) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("dropping outbound frame: {e}");
            outbound.complete();
            return Ok(());
        }
    };

    let messages: Vec<RelayMessage> = match outbound.target {
        Target::Session(id) => {
            let known = sessions.lock().await.contains_key(&id);
            match id {
                SessionId::Relay(connection_id) if known => vec![RelayMessage::ServerProxy {
                    connection_id,
                    payload: inner,
                }],
                _ => Vec::new(),
            }
        }
        Target::Broadcast if !outbound.sensitive => {
            vec![RelayMessage::ServerProxyBroadcast { payload: inner }]
        }
        Target::Broadcast => {
            let table = sessions.lock().await;
            table
                .values()
                .filter(|session| outbound.delivers_to(session))
                .filter_map(|session| match session.id() {
                    SessionId::Relay(connection_id) => Some(RelayMessage::ServerProxy {
                        connection_id,
                        payload: inner.clone(),
                    }),
                    SessionId::Direct(_) => None,
                })
                .collect()
        }
    };

    for message in &messages {
        write(sink, message).await?;
    }
    outbound.complete();
    Ok(())
}

/// Forgets a connection locally and tells the relay to drop it.
async fn disconnect(
    sink: &mut WsSink,
    sessions: &SessionTable,
    events: &mpsc::UnboundedSender<TransportEvent>,
    id: SessionId,
) -> Result<(), WsError> {
    let SessionId::Relay(connection_id) = id else {
        return Ok(());
    };
    if sessions.lock().await.remove(&id).is_none() {
        return Ok(());
    }
    let _ = events.send(TransportEvent::Closed(id));
    write(sink, &RelayMessage::ServerClose { connection_id }).await
}

async fn write(sink: &mut WsSink, message: &RelayMessage) -> Result<(), WsError> {
    sink.send(Message::Binary(encode_relay_message(message))).await
}

/// Reports every multiplexed connection closed after the link dropped.
async fn close_all(sessions: &SessionTable, events: &mpsc::UnboundedSender<TransportEvent>) {
    let mut table = sessions.lock().await;
    let mut ids: Vec<SessionId> = table.drain().map(|(id, _)| id).collect();
    ids.sort_unstable();
    for id in ids {
        let _ = events.send(TransportEvent::Closed(id));
    }
}

// ── Connection request ────────────────────────────────────────────────────────

/// Builds the upgrade request: the configured endpoint plus the
/// registration query, sent with `Origin: app`.
///
/// Any query already on the endpoint is kept; a fragment is dropped.
fn build_request(config: &RelayConfig) -> Result<Request, RequestError> {
    let (credential_key, credential) = match &config.credential {
        RelayCredential::IdToken(token) => ("id_token", token),
        RelayCredential::UserId(user) => ("user_id", user),
    };

    let mut url = Url::parse(&config.url)?;
    url.set_fragment(None);
    url.query_pairs_mut()
        .append_pair("communications", &COMMUNICATIONS_VERSION.to_string())
        .append_pair("is_server", "true")
        .append_pair("installation_id", &config.installation_id)
        .append_pair(credential_key, credential);

    let mut request = url.as_str().into_client_request()?;
    request.headers_mut().insert(ORIGIN, HeaderValue::from_static("app"));
    Ok(request)
}

/// Maps a failed connection attempt to a stop reason.
///
/// A malformed URL can never succeed, so it stops the transport; everything
/// else is treated as connectivity loss and retried.
fn connect_failure(error: &WsError) -> StopReason {
    match error {
        WsError::Url(e) => StopReason::Internal(format!("invalid relay address: {e}")),
        _ => StopReason::Connectivity,
    }
}
