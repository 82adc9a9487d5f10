//! Application layer of the host server.
//!
//! Everything here depends on traits, never on sockets or the file system
//! directly (the upload writer's staging directory aside), so each piece can
//! be driven from tests with recording doubles.
//!
//! # Sub-modules
//!
//! - **`transport`** – The [`transport::Transport`] trait both transports
//!   implement, plus the events and outbound entries that cross it.
//!
//! - **`session`** – The shared per-client handle: lifecycle state and timer
//!   handles behind one lock.
//!
//! - **`session_manager`** – Consumes transport events, runs the handshake and
//!   keepalive, and routes registered traffic to business logic.
//!
//! - **`upload`** – Reassembles chunked file uploads on disk and hands them to
//!   a [`upload::FileSender`].

pub mod session;
pub mod session_manager;
pub mod transport;
pub mod upload;
