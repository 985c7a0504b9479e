//! Messages between socket tasks, HTTP handlers and the game loop.

use arbor_engine::ConnectionId;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

/// Sender half used to feed the game loop.
pub type EventSender = mpsc::UnboundedSender<HostEvent>;

/// Receiver half owned by the game loop.
pub type EventReceiver = mpsc::UnboundedReceiver<HostEvent>;

/// Everything the game loop reacts to besides its own timer.
#[derive(Debug)]
pub enum HostEvent {
    /// A socket finished its upgrade and is ready for replication.
    Connected {
        connection: ConnectionId,
        profile: Option<u32>,
    },

    /// A frame arrived from a socket.
    Message {
        connection: ConnectionId,
        bytes: Vec<u8>,
    },

    /// A socket closed.
    Disconnected { connection: ConnectionId },

    /// Debug request for one store's structure.
    Inspect {
        store_id: String,
        reply: oneshot::Sender<Option<StoreInspection>>,
    },
}

/// Query parameters accepted on the WebSocket upgrade.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectQuery {
    /// Replication profile used to filter profile-scoped values
    #[serde(default)]
    pub profile: Option<u32>,
}

/// Structural summary of a store, for out-of-band divergence checks.
#[derive(Debug, Clone, Serialize)]
pub struct StoreInspection {
    pub store_id: String,
    pub objects: usize,
    pub hash: u64,
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub dump: String,
}
