//! Wire protocol: host frames, encrypted envelope, relay outer messages, and
//! upload payloads.

pub mod codec;
pub mod envelope;
pub mod messages;
pub mod relay;
pub mod upload;

pub use codec::{decode_frame, encode_frame, Frame, ProtocolError};
pub use messages::*;
