//! heartline-daemon library: the networked hub and member.
//!
//! Thin layer over `heartline-core` that owns sockets, timers and tasks,
//! exposed as a library so integration tests can drive both sides.

pub mod connection;
pub mod hub;
pub mod member;

// Re-export key types for convenience
pub use connection::{CloseInfo, ConnectionHandle, Outbound, NORMAL_CLOSE};
pub use hub::{Hub, HubBuilder};
pub use member::{build_url, Member};
