//! Domain rules for the Airlink host.
//!
//! Nothing in this module performs I/O.  The server crate wraps these types
//! in locks, timers, and sockets; keeping the rules here means the tricky
//! parts (which transitions are legal, how long to wait before reconnecting)
//! are tested without any network setup.

/// Reconnection delay calculation for the relay link.
pub mod backoff;

/// Session id allocation for direct connections.
pub mod ids;

/// Per-session lifecycle state machine.
pub mod session;

/// Reasons a transport pauses or stops.
pub mod status;
