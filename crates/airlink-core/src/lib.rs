//! # airlink-core
//!
//! Shared library for the Airlink host server containing the wire protocol,
//! the password-based encrypted envelope, and the pure domain types that the
//! server's session manager and transports are built on.
//!
//! It has no dependencies on sockets, async runtimes, or the file system, so
//! every piece here can be unit-tested in isolation.
//!
//! # Architecture overview (for beginners)
//!
//! Airlink lets one host process exchange authenticated messages with many
//! remote client devices.  Clients reach the host either directly over TCP or
//! through a cloud relay that multiplexes many clients over one WebSocket.
//!
//! - **`protocol`** – How bytes travel.  Host frames are
//!   `int32 type | uint32 length | payload`; relay messages wrap those frames
//!   with an outer type and a connection id; handshake secrets and sensitive
//!   payloads travel inside an encrypted envelope.
//!
//! - **`domain`** – Rules with no I/O: the per-session lifecycle state
//!   machine, the relay reconnection backoff, and the taxonomy of reasons a
//!   transport can stop.

pub mod domain;
pub mod protocol;

// Re-export the most-used types at the crate root.
pub use domain::backoff::ReconnectBackoff;
pub use domain::session::{SessionId, SessionLifecycle, SessionState};
pub use domain::status::{AccountIssue, ErrorKind, StopReason};
pub use protocol::codec::{decode_frame, encode_frame, Frame, ProtocolError};
pub use protocol::envelope::{decrypt_envelope, encrypt_envelope, Envelope, EnvelopeError};
pub use protocol::messages::MessageType;
