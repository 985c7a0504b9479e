//! WebSocket transport for replication.
//!
//! Each socket becomes one engine connection. Frames received from a socket
//! are forwarded to the game loop as [`HostEvent`]s; bytes the engine sends
//! to a connection are pushed back out through the [`ConnectionManager`].

mod events;
mod manager;

pub use events::*;
pub use manager::ConnectionManager;
