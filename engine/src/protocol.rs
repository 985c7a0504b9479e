//! Wire messages and the transport boundary.
//!
//! Every message is a tagged JSON object. The engine never touches sockets:
//! it hands encoded bytes to a [`Transport`] and is fed received bytes by the
//! host.

use crate::command::Command;
use crate::delta::{ComponentStructOp, ComponentValueOp, DeltaPayload, StructuralOp};
use crate::{error::Result, ConnectionId, Error, SnapshotId, StoreId};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Serialize a value to its wire bytes.
pub fn to_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| Error::Serialization(e.to_string()))
}

/// Deserialize a value from wire bytes.
pub fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| Error::Deserialization(e.to_string()))
}

/// Whether a sync carries a whole store or a baseline-relative delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Full,
    Delta,
}

/// Replication payload for one store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSync {
    pub store_id: StoreId,
    pub snapshot_id: SnapshotId,
    pub mode: SyncMode,
    /// Snapshot a delta was computed against; absent on full syncs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_snapshot_id: Option<SnapshotId>,
    #[serde(default)]
    pub structural: Vec<StructuralOp>,
    #[serde(default)]
    pub component_struct: Vec<ComponentStructOp>,
    #[serde(default)]
    pub component_values: Vec<ComponentValueOp>,
}

impl StoreSync {
    /// A full sync made of spawn ops.
    pub fn full(store_id: impl Into<StoreId>, snapshot_id: SnapshotId, spawns: Vec<StructuralOp>) -> Self {
        Self {
            store_id: store_id.into(),
            snapshot_id,
            mode: SyncMode::Full,
            baseline_snapshot_id: None,
            structural: spawns,
            component_struct: Vec::new(),
            component_values: Vec::new(),
        }
    }

    /// A delta sync leading from the payload's baseline to `snapshot_id`.
    pub fn delta(store_id: impl Into<StoreId>, snapshot_id: SnapshotId, payload: DeltaPayload) -> Self {
        Self {
            store_id: store_id.into(),
            snapshot_id,
            mode: SyncMode::Delta,
            baseline_snapshot_id: Some(payload.baseline_id),
            structural: payload.structural,
            component_struct: payload.component_struct,
            component_values: payload.component_values,
        }
    }

    /// Take the ops as a delta payload.
    pub fn into_payload(self) -> DeltaPayload {
        DeltaPayload {
            baseline_id: self.baseline_snapshot_id.unwrap_or_default(),
            snapshot_id: self.snapshot_id,
            structural: self.structural,
            component_struct: self.component_struct,
            component_values: self.component_values,
        }
    }

    pub fn op_count(&self) -> usize {
        self.structural.len() + self.component_struct.len() + self.component_values.len()
    }
}

/// Every message exchanged between replication endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// Server to client: replication payload
    StoreSync(StoreSync),

    /// Client to server: snapshot applied
    #[serde(rename_all = "camelCase")]
    StoreAck {
        store_id: StoreId,
        snapshot_id: SnapshotId,
    },

    /// Client to server: replica diverged, send a full snapshot
    #[serde(rename_all = "camelCase")]
    StoreResyncRequest {
        store_id: StoreId,
        have_snapshot_id: SnapshotId,
    },

    /// Either direction: one-shot command
    Command(Command),

    /// Client to server: ask for the server's structure hash
    #[serde(rename_all = "camelCase")]
    DebugHashRequest { store_id: StoreId },

    /// Server to client: structure hash of the authoritative store
    #[serde(rename_all = "camelCase")]
    DebugHash {
        store_id: StoreId,
        hash: u64,
        valid: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl WireMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        to_bytes(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::InvalidMessage(e.to_string()))
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::StoreSync(_) => "store_sync",
            WireMessage::StoreAck { .. } => "store_ack",
            WireMessage::StoreResyncRequest { .. } => "store_resync_request",
            WireMessage::Command(_) => "command",
            WireMessage::DebugHashRequest { .. } => "debug_hash_request",
            WireMessage::DebugHash { .. } => "debug_hash",
        }
    }
}

/// Delivery guarantee requested for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reliability {
    Reliable,
    Unreliable,
}

/// Outbound half of the transport. Sends are fire-and-forget.
pub trait Transport {
    fn send(&mut self, connection: ConnectionId, bytes: Vec<u8>, reliability: Reliability);
}

/// A message waiting in an [`Outbox`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub connection: ConnectionId,
    pub bytes: Vec<u8>,
    pub reliability: Reliability,
}

impl Envelope {
    /// Decode the carried message.
    pub fn message(&self) -> Result<WireMessage> {
        WireMessage::decode(&self.bytes)
    }
}

/// Transport that buffers messages for the host to drain.
#[derive(Debug, Default)]
pub struct Outbox {
    queue: Vec<Envelope>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Take every buffered message in send order.
    pub fn drain(&mut self) -> Vec<Envelope> {
        std::mem::take(&mut self.queue)
    }
}

impl Transport for Outbox {
    fn send(&mut self, connection: ConnectionId, bytes: Vec<u8>, reliability: Reliability) {
        self.queue.push(Envelope {
            connection,
            bytes,
            reliability,
        });
    }
}

/// Encode and send a message.
pub(crate) fn send_message(
    transport: &mut dyn Transport,
    connection: ConnectionId,
    message: &WireMessage,
    reliability: Reliability,
) -> Result<()> {
    let bytes = message.encode()?;
    transport.send(connection, bytes, reliability);
    Ok(())
}
