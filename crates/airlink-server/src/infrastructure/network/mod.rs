//! Network transports.
//!
//! # Sub-modules
//!
//! - **`direct`** – Plain TCP listener; one socket per client, framed with the
//!   8-byte header.  Payloads are protected by the envelope when a password
//!   is set.
//!
//! - **`relay`** – One outbound WebSocket to the cloud relay, multiplexing
//!   many clients by connection id.  Reconnects with exponential backoff.

pub mod direct;
pub mod relay;
