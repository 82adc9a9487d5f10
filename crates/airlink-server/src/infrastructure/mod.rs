//! Infrastructure layer of the host server.
//!
//! Contains the OS-facing adapters: the two network transports and the
//! configuration file store.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `airlink_core`, but MUST NOT be imported by the `application` layer.

pub mod network;
pub mod storage;
