//! SessionManager: owns every session and drives its lifecycle.
//!
//! The manager sits between one [`Transport`] and the host's business logic.
//! It consumes [`TransportEvent`]s, runs the handshake, answers pings, keeps
//! the keepalive sweep going, routes file fragments to the
//! [`UploadReassembler`] and hands every other frame to the
//! [`MessageHandler`].
//!
//! # Session lifecycle (for beginners)
//!
//! ```text
//! Opened ──► AwaitingHandshake ──auth ok──► Registered ──► Closing ──► Closed
//!                 │    │                         │
//!                 │    └── 10 s timeout ─────────┤ (ping unanswered 30 s)
//!                 └── auth failed ───────────────┘
//! ```
//!
//! On entering `AwaitingHandshake` the server pushes an Information frame and
//! arms the handshake timer.  Only a session that reached `Registered` is
//! announced to business logic, and only such a session is announced again
//! when it closes.
//!
//! # Timers
//!
//! Every timer is a spawned task whose `AbortHandle` is stored under the
//! session's lock.  See [`crate::application::session`] for the race rules.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use airlink_core::protocol::envelope::{self, EnvelopeError};
use airlink_core::protocol::messages::{
    AuthStatus, HandshakeMessage, MessageType, ServerInfo, SessionMessage, MAX_PAYLOAD_SIZE,
};
use airlink_core::protocol::upload::{decode_fragment, encode_send_result, SendResult};
use airlink_core::{Frame, ProtocolError, SessionId, SessionState, StopReason};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::application::session::Session;
use crate::application::transport::{
    OnSent, Outbound, Target, Transport, TransportError, TransportEvent,
};
use crate::application::upload::{UploadOutcome, UploadReassembler};

/// Default time a fresh session has to authenticate.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time a registered session has to answer a keepalive ping.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(30);

/// Default period of the keepalive sweep.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30 * 60);

// ── Collaborator traits ───────────────────────────────────────────────────────

/// Business logic fed by the session manager.
///
/// Infrastructure implementations talk to the messaging system; test
/// implementations record calls.
pub trait MessageHandler: Send + Sync {
    /// A session finished its handshake.
    fn on_session_open(&self, session: SessionId);

    /// A previously opened session is gone.
    fn on_session_close(&self, session: SessionId);

    /// A business frame arrived from a registered session.
    ///
    /// `was_encrypted_in_transit` is true when the payload was either carried
    /// over an encrypted link or unwrapped from an envelope.
    fn on_message(&self, session: SessionId, message_type: i32, payload: Vec<u8>, was_encrypted_in_transit: bool);
}

/// Receives operator-visible transport state changes.
pub trait StateReporter: Send + Sync {
    fn on_transport_started(&self);
    fn on_transport_paused(&self, reason: &StopReason);
    fn on_transport_stopped(&self, reason: &StopReason);
}

// ── Configuration and errors ──────────────────────────────────────────────────

/// Settings for the session manager.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Shared secret clients must present. `None` accepts every client.
    pub password: Option<String>,
    pub handshake_timeout: Duration,
    pub ping_timeout: Duration,
    pub keepalive_interval: Duration,
    pub server_info: ServerInfo,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            password: None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            server_info: ServerInfo::default(),
        }
    }
}

/// Errors from [`SessionManager::send`].
#[derive(Debug, Error)]
pub enum SendError {
    #[error("frame rejected: {0}")]
    Frame(#[from] ProtocolError),

    #[error("failed to seal payload: {0}")]
    Seal(#[from] EnvelopeError),
}

// ── SessionManager ────────────────────────────────────────────────────────────

/// Owns the session table and reacts to transport events.
pub struct SessionManager {
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    handler: Arc<dyn MessageHandler>,
    reporter: Arc<dyn StateReporter>,
    uploads: Option<Arc<UploadReassembler>>,
    upload_outcomes: Mutex<Option<mpsc::UnboundedReceiver<UploadOutcome>>>,
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    pub fn new(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        handler: Arc<dyn MessageHandler>,
        reporter: Arc<dyn StateReporter>,
    ) -> Self {
        Self {
            config,
            transport,
            handler,
            reporter,
            uploads: None,
            upload_outcomes: Mutex::new(None),
            sessions: Mutex::new(HashMap::new()),
            keepalive: Mutex::new(None),
        }
    }

    /// Routes upload fragments to `uploads` and reports its outcomes.
    ///
    /// Without this, upload frames are answered with nothing and dropped.
    pub fn with_uploads(
        mut self,
        uploads: Arc<UploadReassembler>,
        outcomes: mpsc::UnboundedReceiver<UploadOutcome>,
    ) -> Self {
        self.uploads = Some(uploads);
        self.upload_outcomes = Mutex::new(Some(outcomes));
        self
    }

    /// Starts the event loop and then the transport.
    ///
    /// The returned handle completes once the transport has dropped its event
    /// sender, which happens after it stopped.
    pub async fn start(self: &Arc<Self>) -> Result<JoinHandle<()>, TransportError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let this = Arc::clone(self);
        let event_loop = tokio::spawn(async move { this.run(events_rx).await });

        if let Err(e) = self.transport.start(events_tx).await {
            error!("transport failed to start: {e}");
            return Err(e);
        }
        Ok(event_loop)
    }

    /// Stops the transport; sessions close gracefully.
    pub async fn stop(&self) {
        self.transport.stop().await;
    }

    /// Consumes transport events until the transport drops its sender.
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        let mut outcomes = self.upload_outcomes.lock().await.take();
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                Some(outcome) = next_outcome(&mut outcomes) => self.report_upload(outcome),
            }
        }
        self.stop_keepalive().await;
        debug!("session manager event loop finished");
    }

    /// Applies one transport event.
    pub async fn handle_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Started => {
                info!("transport started");
                self.start_keepalive().await;
                self.reporter.on_transport_started();
            }
            TransportEvent::Paused(reason) => {
                warn!("transport paused: {reason}");
                self.stop_keepalive().await;
                self.reporter.on_transport_paused(&reason);
            }
            TransportEvent::Stopped(reason) => {
                info!("transport stopped: {reason}");
                self.stop_keepalive().await;
                self.reporter.on_transport_stopped(&reason);
            }
            TransportEvent::Opened(session) => self.on_opened(session).await,
            TransportEvent::Closed(id) => self.on_closed(id).await,
            TransportEvent::Frame {
                session,
                frame,
                encrypted_in_transit,
            } => self.on_frame(session, frame, encrypted_in_transit).await,
        }
    }

    // ── Public API ────────────────────────────────────────────────────────────

    /// Sends a business frame.
    ///
    /// A `sensitive` payload is sealed in an envelope when the transport does
    /// not encrypt in transit and a password is configured.  A sensitive
    /// broadcast only reaches registered sessions.
    pub fn send(
        &self,
        target: Target,
        message_type: i32,
        payload: Vec<u8>,
        sensitive: bool,
        on_sent: Option<OnSent>,
    ) -> Result<(), SendError> {
        let payload = match (&self.config.password, sensitive && !self.transport.encrypts_in_transit()) {
            (Some(password), true) => envelope::seal(&payload, password)?,
            _ => payload,
        };
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(SendError::Frame(ProtocolError::Oversized {
                declared: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            }));
        }
        self.transmit(target, Frame::new(message_type, payload), sensitive, on_sent);
        Ok(())
    }

    /// Gracefully closes one session: a close frame, then a disconnect.
    ///
    /// Does nothing if the session is unknown or already closing.
    pub async fn close(&self, id: SessionId) {
        let Some(session) = self.session(id).await else {
            return;
        };
        {
            let mut inner = session.lock().await;
            if !session.begin_close(&mut inner) {
                return;
            }
        }
        info!("session {id}: closing");
        let transport = Arc::clone(&self.transport);
        self.transmit(
            Target::Session(id),
            Frame::empty(MessageType::Close),
            false,
            Some(Box::new(move || transport.disconnect(id))),
        );
    }

    /// Ids of every session the manager knows about, sorted.
    pub async fn active_sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.lock().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub async fn session_state(&self, id: SessionId) -> Option<SessionState> {
        let session = self.session(id).await?;
        let state = session.state().await;
        Some(state)
    }

    /// Pings every registered session and arms its ping timer.
    ///
    /// Called by the keepalive task; exposed so a host can force a sweep.
    pub async fn sweep_keepalive(self: &Arc<Self>) {
        let snapshot: Vec<Arc<Session>> = self.sessions.lock().await.values().cloned().collect();
        for session in snapshot {
            let id = session.id();
            {
                let mut inner = session.lock().await;
                if !inner.lifecycle.is_registered() {
                    continue;
                }
                if let Some(previous) = inner.ping_timer.take() {
                    previous.abort();
                }
                let this = Arc::clone(self);
                let target = Arc::clone(&session);
                let timeout = self.config.ping_timeout;
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    this.expire_ping(target).await;
                });
                inner.ping_timer = Some(timer.abort_handle());
            }
            trace!("session {id}: ping");
            self.transmit(Target::Session(id), Frame::empty(MessageType::Ping), false, None);
        }
    }

    // ── Session events ────────────────────────────────────────────────────────

    async fn on_opened(self: &Arc<Self>, session: Arc<Session>) {
        let id = session.id();
        {
            let mut inner = session.lock().await;
            if inner.lifecycle.state() != SessionState::AwaitingHandshake {
                return;
            }
            let this = Arc::clone(self);
            let target = Arc::clone(&session);
            let timeout = self.config.handshake_timeout;
            let timer = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                this.expire_handshake(target).await;
            });
            inner.handshake_timer = Some(timer.abort_handle());
        }
        self.sessions.lock().await.insert(id, session);

        debug!("session {id}: opened, awaiting handshake");
        self.transmit(
            Target::Session(id),
            Frame::of(MessageType::Information, self.config.server_info.to_payload()),
            false,
            None,
        );
    }

    async fn on_closed(&self, id: SessionId) {
        let Some(session) = self.sessions.lock().await.remove(&id) else {
            debug!("session {id}: close for unknown session");
            return;
        };
        let was_open = {
            let mut inner = session.lock().await;
            session.finish(&mut inner) && inner.lifecycle.was_registered()
        };
        if let Some(uploads) = &self.uploads {
            uploads.cancel_session(id).await;
        }
        info!("session {id}: closed");
        if was_open {
            self.handler.on_session_close(id);
        }
    }

    async fn on_frame(self: &Arc<Self>, id: SessionId, frame: Frame, encrypted_in_transit: bool) {
        let Some(session) = self.session(id).await else {
            debug!("session {id}: frame for unknown session dropped");
            return;
        };
        let state = {
            let mut inner = session.lock().await;
            if inner.lifecycle.is_registered() {
                // Any traffic proves the peer is alive.
                if let Some(timer) = inner.ping_timer.take() {
                    timer.abort();
                }
            }
            inner.lifecycle.state()
        };

        match state {
            SessionState::AwaitingHandshake => match HandshakeMessage::classify(frame.message_type) {
                HandshakeMessage::Authenticate => self.authenticate(&session, frame.payload).await,
                HandshakeMessage::Close => {
                    debug!("session {id}: closed by peer during handshake");
                    self.force_close(&session).await;
                }
                HandshakeMessage::Ignored(code) => {
                    debug!("session {id}: ignoring type {code} before authentication");
                }
            },
            SessionState::Registered => self.dispatch(&session, frame, encrypted_in_transit).await,
            SessionState::Closing | SessionState::Closed => {
                trace!("session {id}: frame after close dropped");
            }
        }
    }

    // ── Handshake ─────────────────────────────────────────────────────────────

    async fn authenticate(&self, session: &Arc<Session>, payload: Vec<u8>) {
        let id = session.id();
        let status = match &self.config.password {
            None => AuthStatus::Ok,
            Some(password) => {
                let expected = password.clone();
                match open_blocking(payload, password.clone()).await {
                    Ok(secret) if secret == expected.as_bytes() => AuthStatus::Ok,
                    Ok(_) | Err(EnvelopeError::Auth) | Err(EnvelopeError::Internal(_)) => {
                        AuthStatus::Unauthorized
                    }
                    Err(EnvelopeError::Malformed(_)) => AuthStatus::BadRequest,
                }
            }
        };

        if status == AuthStatus::Ok {
            {
                let mut inner = session.lock().await;
                if session.register(&mut inner).is_err() {
                    debug!("session {id}: authenticated after it began closing");
                    return;
                }
            }
            info!("session {id}: authenticated");
            self.transmit(
                Target::Session(id),
                Frame::of(MessageType::Authentication, status.to_payload()),
                false,
                None,
            );
            self.handler.on_session_open(id);
        } else {
            {
                let mut inner = session.lock().await;
                if !session.begin_close(&mut inner) {
                    return;
                }
            }
            warn!("session {id}: authentication rejected ({status:?})");
            let transport = Arc::clone(&self.transport);
            self.transmit(
                Target::Session(id),
                Frame::of(MessageType::Authentication, status.to_payload()),
                false,
                Some(Box::new(move || transport.disconnect(id))),
            );
        }
    }

    // ── Registered traffic ────────────────────────────────────────────────────

    async fn dispatch(&self, session: &Arc<Session>, frame: Frame, encrypted_in_transit: bool) {
        let id = session.id();
        match SessionMessage::classify(frame.message_type) {
            SessionMessage::Close => {
                debug!("session {id}: peer requested close");
                self.close(id).await;
            }
            SessionMessage::Ping => {
                self.transmit(Target::Session(id), Frame::empty(MessageType::Pong), false, None);
            }
            SessionMessage::Pong => trace!("session {id}: pong"),
            SessionMessage::Upload(kind) => {
                let Some(uploads) = &self.uploads else {
                    debug!("session {id}: uploads disabled, fragment dropped");
                    return;
                };
                let Some((payload, _)) = self.unwrap_payload(id, frame.payload, encrypted_in_transit).await else {
                    return;
                };
                match decode_fragment(kind, &payload) {
                    Ok(fragment) => uploads.submit(id, fragment).await,
                    Err(e) => warn!("session {id}: bad file fragment: {e}"),
                }
            }
            SessionMessage::Business(code) => {
                if let Some((payload, secure)) =
                    self.unwrap_payload(id, frame.payload, encrypted_in_transit).await
                {
                    self.handler.on_message(id, code, payload, secure);
                }
            }
        }
    }

    /// Opens the envelope of an inbound payload when the link is plain and a
    /// password is configured.  `None` means the frame must be dropped.
    async fn unwrap_payload(
        &self,
        id: SessionId,
        payload: Vec<u8>,
        encrypted_in_transit: bool,
    ) -> Option<(Vec<u8>, bool)> {
        if encrypted_in_transit {
            return Some((payload, true));
        }
        let Some(password) = &self.config.password else {
            return Some((payload, false));
        };
        match open_blocking(payload, password.clone()).await {
            Ok(plain) => Some((plain, true)),
            Err(e) => {
                warn!("session {id}: dropping frame that failed to decrypt: {e}");
                None
            }
        }
    }

    fn report_upload(&self, outcome: UploadOutcome) {
        let mut result = SendResult {
            request_id: outcome.request_id,
            code: outcome.code,
            details: outcome.details,
        };
        let payload = match encode_send_result(&result) {
            Ok(payload) => payload,
            Err(e) => {
                // The code still matters to the client; the details do not.
                warn!("session {}: dropping upload result details: {e}", outcome.session);
                result.details = None;
                match encode_send_result(&result) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("session {}: failed to encode upload result: {e}", outcome.session);
                        return;
                    }
                }
            }
        };
        if let Err(e) = self.send(
            Target::Session(outcome.session),
            MessageType::SendResult.code(),
            payload,
            true,
            None,
        ) {
            warn!("session {}: failed to report upload result: {e}", outcome.session);
        }
    }

    // ── Timers and teardown ───────────────────────────────────────────────────

    async fn expire_handshake(self: Arc<Self>, session: Arc<Session>) {
        {
            let mut inner = session.lock().await;
            if inner.handshake_timer.take().is_none() || !session.begin_close(&mut inner) {
                return;
            }
        }
        info!("session {}: handshake timed out", session.id());
        self.transport.disconnect(session.id());
    }

    async fn expire_ping(self: Arc<Self>, session: Arc<Session>) {
        {
            let mut inner = session.lock().await;
            if inner.ping_timer.take().is_none() || !session.begin_close(&mut inner) {
                return;
            }
        }
        warn!("session {}: ping unanswered, dropping", session.id());
        self.transport.disconnect(session.id());
    }

    /// Closes without a close frame.
    async fn force_close(&self, session: &Arc<Session>) {
        {
            let mut inner = session.lock().await;
            if !session.begin_close(&mut inner) {
                return;
            }
        }
        self.transport.disconnect(session.id());
    }

    async fn start_keepalive(self: &Arc<Self>) {
        let mut slot = self.keepalive.lock().await;
        if let Some(previous) = slot.take() {
            previous.abort();
        }
        let this = Arc::clone(self);
        let period = self.config.keepalive_interval;
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                this.sweep_keepalive().await;
            }
        }));
    }

    async fn stop_keepalive(&self) {
        if let Some(task) = self.keepalive.lock().await.take() {
            task.abort();
        }
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    async fn session(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.lock().await.get(&id).cloned()
    }

    fn transmit(&self, target: Target, frame: Frame, sensitive: bool, on_sent: Option<OnSent>) {
        let mut outbound = Outbound::new(target, frame, sensitive);
        outbound.on_sent = on_sent;
        self.transport.send(outbound);
    }
}

/// Receives the next upload outcome, or waits forever once there are none.
async fn next_outcome(
    outcomes: &mut Option<mpsc::UnboundedReceiver<UploadOutcome>>,
) -> Option<UploadOutcome> {
    match outcomes {
        Some(rx) => {
            let outcome = rx.recv().await;
            if outcome.is_none() {
                *outcomes = None;
            }
            outcome
        }
        None => std::future::pending().await,
    }
}

/// Opens an envelope on the blocking pool; PBKDF2 is CPU-bound.
async fn open_blocking(payload: Vec<u8>, password: String) -> Result<Vec<u8>, EnvelopeError> {
    tokio::task::spawn_blocking(move || envelope::open(&payload, &password))
        .await
        .unwrap_or(Err(EnvelopeError::Internal("decryption task failed")))
}
