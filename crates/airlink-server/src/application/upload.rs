//! UploadReassembler: rebuilds chunked file uploads and hands them off.
//!
//! Clients send a file as a run of `send-file-*` frames.  Each fragment
//! carries a request id, a zero-based index, a last flag and a gzip slice of
//! the file.  An upload is identified by `(session, request id, destination)`.
//!
//! # How an upload flows
//!
//! 1. Fragment 0 creates a fresh directory `<uploads>/<uuid>/` and spawns a
//!    dedicated writer task for this upload.
//! 2. Every accepted fragment is queued to that task, which streams it
//!    through the gzip decoder into the file on the blocking pool, one
//!    buffer at a time.  Dispatch never touches the disk.
//! 3. The last fragment makes the writer flush the file and call the
//!    [`FileSender`].  Its result is reported as an [`UploadOutcome`].
//!
//! A fragment that arrives out of order, ten seconds without a fragment, a
//! file growing past [`UploadConfig::max_file_size`], a write error, or the
//! session closing all abort the upload.  An aborted
//! upload always deletes its directory before the failure is reported, so no
//! partial file outlives its upload.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use airlink_core::protocol::messages::SendResultCode;
use airlink_core::protocol::upload::{Destination, DestinationKey, FileFragment};
use airlink_core::SessionId;
use async_trait::async_trait;
use flate2::read::GzDecoder;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default inactivity timeout between two fragments of one upload.
pub const DEFAULT_FRAGMENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default cap on the inflated size of one uploaded file (1 GiB).
pub const DEFAULT_MAX_FILE_SIZE: u64 = 1024 * 1024 * 1024;

/// Output buffer used while inflating a fragment.
const INFLATE_BUFFER_SIZE: usize = 64 * 1024;

/// Hands a completed file to the messaging system.
///
/// Infrastructure implementations drive the platform's messaging automation;
/// tests use the generated `MockFileSender`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FileSender: Send + Sync {
    /// Sends the file at `path` to `destination`.
    async fn send_file(&self, destination: &Destination, path: &Path) -> (SendResultCode, Option<String>);
}

/// Where uploads are staged, how long a fragment may take and how large a
/// file may grow once inflated.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub directory: PathBuf,
    pub fragment_timeout: Duration,
    pub max_file_size: u64,
}

impl UploadConfig {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            fragment_timeout: DEFAULT_FRAGMENT_TIMEOUT,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

/// Final result of one upload, to be reported to the requesting session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub session: SessionId,
    pub request_id: i16,
    pub code: SendResultCode,
    pub details: Option<String>,
}

/// Why an upload was abandoned.
#[derive(Debug, Error)]
enum UploadFailure {
    #[error("fragment {got} arrived while fragment {expected} was expected")]
    OutOfOrder { expected: i32, got: i32 },

    #[error("no fragment received within {0:?}")]
    Timeout(Duration),

    #[error("file exceeds {limit} bytes once inflated")]
    TooLarge { limit: u64 },

    #[error("failed to write upload: {0}")]
    Io(#[from] std::io::Error),

    #[error("session closed before the upload finished")]
    Cancelled,
}

impl UploadFailure {
    /// The result code reported for this failure, or `None` if nobody is
    /// left to receive it.
    fn code(&self) -> Option<SendResultCode> {
        match self {
            UploadFailure::OutOfOrder { .. } => Some(SendResultCode::BadRequest),
            UploadFailure::Timeout(_) => Some(SendResultCode::RequestTimeout),
            UploadFailure::TooLarge { .. } | UploadFailure::Io(_) => Some(SendResultCode::ScriptError),
            UploadFailure::Cancelled => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct UploadKey {
    session: SessionId,
    request_id: i16,
    destination: DestinationKey,
}

/// Work queued to an upload's writer task.
enum WriterCommand {
    Chunk { data: Vec<u8>, is_last: bool },
    Abort(UploadFailure),
}

/// Dispatch-side bookkeeping for one in-flight upload.
struct UploadHandle {
    upload_id: Uuid,
    next_index: i32,
    commands: mpsc::UnboundedSender<WriterCommand>,
}

type UploadStore = Arc<Mutex<HashMap<UploadKey, UploadHandle>>>;

// ── UploadReassembler ─────────────────────────────────────────────────────────

/// Tracks every in-flight upload.
pub struct UploadReassembler {
    config: UploadConfig,
    sender: Arc<dyn FileSender>,
    store: UploadStore,
    outcomes: mpsc::UnboundedSender<UploadOutcome>,
}

impl UploadReassembler {
    /// Creates a reassembler and the receiver on which upload outcomes are
    /// reported.
    pub fn new(
        config: UploadConfig,
        sender: Arc<dyn FileSender>,
    ) -> (Self, mpsc::UnboundedReceiver<UploadOutcome>) {
        let (outcomes, rx) = mpsc::unbounded_channel();
        (
            Self {
                config,
                sender,
                store: Arc::new(Mutex::new(HashMap::new())),
                outcomes,
            },
            rx,
        )
    }

    /// Accepts one decoded fragment from `session`.
    ///
    /// A fragment with a non-zero index that matches no upload is dropped.
    pub async fn submit(&self, session: SessionId, fragment: FileFragment) {
        let key = UploadKey {
            session,
            request_id: fragment.request_id,
            destination: fragment.destination.key(),
        };
        let mut store = self.store.lock().await;

        if let Some(handle) = store.get_mut(&key) {
            if fragment.index != handle.next_index {
                let expected = handle.next_index;
                warn!(
                    "session {session}: upload {} expected fragment {expected}, got {}",
                    fragment.request_id, fragment.index
                );
                if let Some(handle) = store.remove(&key) {
                    let _ = handle.commands.send(WriterCommand::Abort(UploadFailure::OutOfOrder {
                        expected,
                        got: fragment.index,
                    }));
                }
                return;
            }

            let accepted = handle
                .commands
                .send(WriterCommand::Chunk {
                    data: fragment.data,
                    is_last: fragment.is_last,
                })
                .is_ok();
            handle.next_index += 1;
            if fragment.is_last || !accepted {
                store.remove(&key);
            }
            return;
        }

        if fragment.index != 0 {
            debug!(
                "session {session}: dropping fragment {} of unknown upload {}",
                fragment.index, fragment.request_id
            );
            return;
        }

        let Some(file_name) = fragment.file_name.as_deref().and_then(sanitize_file_name) else {
            warn!("session {session}: upload {} has no usable file name", fragment.request_id);
            let _ = self.outcomes.send(UploadOutcome {
                session,
                request_id: fragment.request_id,
                code: SendResultCode::BadRequest,
                details: Some("first fragment carries no file name".to_string()),
            });
            return;
        };

        let upload_id = Uuid::new_v4();
        let (commands, rx) = mpsc::unbounded_channel();
        let _ = commands.send(WriterCommand::Chunk {
            data: fragment.data,
            is_last: fragment.is_last,
        });

        let writer = UploadWriter {
            upload_id,
            key: key.clone(),
            directory: self.config.directory.join(upload_id.to_string()),
            file_name,
            destination: fragment.destination,
            timeout: self.config.fragment_timeout,
            max_file_size: self.config.max_file_size,
            sender: Arc::clone(&self.sender),
            store: Arc::clone(&self.store),
            outcomes: self.outcomes.clone(),
        };
        info!(
            "session {session}: upload {} started as {upload_id}",
            fragment.request_id
        );
        tokio::spawn(writer.run(rx));

        if !fragment.is_last {
            store.insert(
                key,
                UploadHandle {
                    upload_id,
                    next_index: 1,
                    commands,
                },
            );
        }
    }

    /// Aborts every upload owned by `session` without reporting a result.
    pub async fn cancel_session(&self, session: SessionId) {
        let mut store = self.store.lock().await;
        let keys: Vec<UploadKey> = store.keys().filter(|k| k.session == session).cloned().collect();
        for key in keys {
            if let Some(handle) = store.remove(&key) {
                debug!("session {session}: cancelling upload {}", key.request_id);
                let _ = handle.commands.send(WriterCommand::Abort(UploadFailure::Cancelled));
            }
        }
    }

    /// Number of uploads still waiting for fragments.
    pub async fn in_flight(&self) -> usize {
        self.store.lock().await.len()
    }
}

/// Reduces a client-supplied name to a single safe path component.
fn sanitize_file_name(raw: &str) -> Option<String> {
    let name = Path::new(raw).file_name()?.to_str()?.trim();
    if name.is_empty() || name == "." || name == ".." {
        return None;
    }
    Some(name.to_string())
}

/// Inflates one gzip slice into `file`, one buffer at a time.
///
/// `written` is the file size so far.  Returns the new size, or fails as
/// soon as it would pass `limit`, so a small slice that inflates to gigabytes
/// never sits in memory or on disk.
fn inflate_into(data: &[u8], file: &mut std::fs::File, written: u64, limit: u64) -> Result<u64, UploadFailure> {
    let mut decoder = GzDecoder::new(data);
    let mut buffer = vec![0u8; INFLATE_BUFFER_SIZE];
    let mut total = written;
    loop {
        let read = decoder.read(&mut buffer)?;
        if read == 0 {
            return Ok(total);
        }
        total += read as u64;
        if total > limit {
            return Err(UploadFailure::TooLarge { limit });
        }
        file.write_all(&buffer[..read])?;
    }
}

// ── Writer task ───────────────────────────────────────────────────────────────

/// Owns the on-disk side of one upload.
struct UploadWriter {
    upload_id: Uuid,
    key: UploadKey,
    directory: PathBuf,
    file_name: String,
    destination: Destination,
    timeout: Duration,
    max_file_size: u64,
    sender: Arc<dyn FileSender>,
    store: UploadStore,
    outcomes: mpsc::UnboundedSender<UploadOutcome>,
}

impl UploadWriter {
    async fn run(self, mut commands: mpsc::UnboundedReceiver<WriterCommand>) {
        let path = self.directory.join(&self.file_name);
        match self.receive(&path, &mut commands).await {
            Ok(()) => self.deliver(&path).await,
            Err(failure) => self.fail(failure).await,
        }
    }

    async fn receive(
        &self,
        path: &Path,
        commands: &mut mpsc::UnboundedReceiver<WriterCommand>,
    ) -> Result<(), UploadFailure> {
        tokio::fs::create_dir_all(&self.directory).await?;
        let mut file = tokio::fs::File::create(path).await?.into_std().await;
        let mut written = 0u64;
        let mut deadline = Instant::now() + self.timeout;

        loop {
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(WriterCommand::Chunk { data, is_last }) => {
                        let limit = self.max_file_size;
                        let (returned, inflated) = tokio::task::spawn_blocking(move || {
                            let inflated = inflate_into(&data, &mut file, written, limit);
                            (file, inflated)
                        })
                        .await
                        .map_err(|e| UploadFailure::Io(std::io::Error::other(e)))?;
                        file = returned;
                        written = inflated?;
                        if is_last {
                            return Ok(());
                        }
                        deadline = Instant::now() + self.timeout;
                    }
                    Some(WriterCommand::Abort(failure)) => return Err(failure),
                    None => return Err(UploadFailure::Cancelled),
                },

                _ = tokio::time::sleep_until(deadline) => {
                    return Err(UploadFailure::Timeout(self.timeout));
                }
            }
        }
    }

    async fn deliver(&self, path: &Path) {
        let (code, details) = self.sender.send_file(&self.destination, path).await;
        if code == SendResultCode::Ok {
            info!("upload {}: delivered {}", self.upload_id, self.file_name);
        } else {
            warn!("upload {}: send failed with {code:?}", self.upload_id);
            self.remove_directory().await;
        }
        self.report(code, details);
    }

    async fn fail(&self, failure: UploadFailure) {
        self.forget().await;
        self.remove_directory().await;
        warn!(
            "session {}: upload {} aborted: {failure}",
            self.key.session, self.key.request_id
        );
        if let Some(code) = failure.code() {
            self.report(code, Some(failure.to_string()));
        }
    }

    /// Removes this upload from the store if it is still registered there.
    async fn forget(&self) {
        let mut store = self.store.lock().await;
        if store.get(&self.key).map(|h| h.upload_id) == Some(self.upload_id) {
            store.remove(&self.key);
        }
    }

    async fn remove_directory(&self) {
        match tokio::fs::remove_dir_all(&self.directory).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("upload {}: failed to remove {}: {e}", self.upload_id, self.directory.display()),
        }
    }

    fn report(&self, code: SendResultCode, details: Option<String>) {
        let _ = self.outcomes.send(UploadOutcome {
            session: self.key.session,
            request_id: self.key.request_id,
            code,
            details,
        });
    }
}
