//! # Arbor Engine
//!
//! A replicated runtime object store for authoritative game servers.
//!
//! The server owns a forest of runtime objects and keeps every client's copy
//! of it consistent, sending each client only what changed since the state it
//! last acknowledged.
//!
//! ## Design Principles
//!
//! - **No IO**: The engine never touches sockets, files or clocks
//! - **Deterministic**: Snapshots and deltas are built in a fixed order
//! - **Explicit context**: Registries are constructed and passed in, never global
//! - **Driven**: Nothing runs unless the host calls `tick` or hands over a message
//!
//! ## Core Concepts
//!
//! ### Stores
//!
//! A [`RuntimeStore`] holds [`RuntimeObject`]s arranged as a forest. Objects
//! carry typed components registered in a [`ComponentRegistry`]. Mutations
//! are recorded and aggregated into one [`StoreChanges`] batch per tick.
//!
//! ### Snapshots and Deltas
//!
//! [`build_snapshot`] captures a store as seen by one viewer.
//! [`build_full_payload`] and [`build_delta_payload`] turn snapshots into
//! wire ops; [`apply_full`] and [`apply_delta`] replay them onto a replica.
//!
//! ### Replication
//!
//! [`ReplicationServer`] tracks an acknowledged baseline per connection and
//! store, and chooses between full and delta payloads. [`ReplicationClient`]
//! applies payloads, acks them, and requests a resync when a payload cannot
//! be applied. Both speak [`WireMessage`] through a [`Transport`].
//!
//! ### Commands
//!
//! One-shot [`Command`]s travel beside replication through a [`CommandBus`],
//! deduplicated per sender by sequence number.
//!
//! ## Quick Start
//!
//! ```rust
//! use arbor_engine::{
//!     Component, ComponentManifest, ComponentRegistry, ComponentType, Outbox,
//!     ReplicationClient, ReplicationConfig, ReplicationServer, RuntimeStore,
//! };
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct Position {
//!     x: i32,
//!     y: i32,
//! }
//!
//! impl Component for Position {}
//! impl ComponentType for Position {
//!     const ALIAS: &'static str = "position";
//! }
//!
//! // 1. Build the registry both sides share
//! let manifest = ComponentManifest::from_names(["position"]);
//! let registry = Arc::new(
//!     ComponentRegistry::from_manifest(&manifest)?.with::<Position>()?,
//! );
//!
//! // 2. Populate the authoritative store
//! let mut server_store = RuntimeStore::new("world", Arc::clone(&registry));
//! let root = server_store.create();
//! if let Some(object) = server_store.try_take_rw(root) {
//!     object.add_or_replace(Position { x: 1, y: 2 })?;
//! }
//!
//! // 3. Replicate one tick to a client
//! let mut server = ReplicationServer::new(ReplicationConfig::default());
//! server.register_store("world");
//! server.add_connection(1, None);
//! server.set_ready(1);
//!
//! let mut to_client = Outbox::new();
//! server.tick(&mut server_store, &mut to_client)?;
//!
//! let mut client = ReplicationClient::new(ReplicationConfig::default());
//! let mut replica = RuntimeStore::new("world", registry);
//! let mut to_server = Outbox::new();
//! for envelope in to_client.drain() {
//!     client.handle_message(&envelope.bytes, &mut replica, &mut to_server)?;
//! }
//!
//! assert!(replica.contains(root));
//! assert_eq!(client.applied_snapshot("world"), 1);
//! # Ok::<(), arbor_engine::Error>(())
//! ```
//!
//! ## Logging
//!
//! The engine emits [`tracing`] events under the `arbor::store`,
//! `arbor::snap` and `arbor::cmd` targets and never installs a subscriber.

pub mod changes;
pub mod client;
pub mod command;
pub mod component;
pub mod config;
pub mod debug;
pub mod delta;
pub mod error;
pub mod history;
pub mod object;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod snapshot;
pub mod store;

// Re-export main types at crate root
pub use changes::{
    CompStructKind, ObjectComponentDirty, ObjectStructDirty, RemoveMode, StoreChanges,
    StructureOp, StructureOpKind,
};
pub use client::{ClientEvent, ReplicationClient};
pub use command::{Command, CommandBus, CommandContext, CommandHandler, CommandObserver, SequenceGuard};
pub use component::{
    downcast_mut, downcast_ref, Component, ComponentType, ReplicationMask, ReplicationPolicy,
    SnapshotFilter,
};
pub use config::{CommandDispatch, ReplicationConfig};
pub use delta::{
    apply_delta, apply_full, build_delta_payload, build_full_payload, ComponentBlob,
    ComponentStructOp, ComponentValueOp, DeltaPayload, NodePayload, StructuralOp,
};
pub use error::Error;
pub use history::SnapshotHistory;
pub use object::{AssetKey, NodeHeader, RuntimeObject};
pub use protocol::{
    Envelope, Outbox, Reliability, StoreSync, SyncMode, Transport, WireMessage,
};
pub use registry::{ComponentDescriptor, ComponentManifest, ComponentRegistry, ManifestEntry};
pub use server::{ReplicationServer, Session, SyncState};
pub use snapshot::{build_snapshot, NodeSignature, Snapshot, SnapshotNode};
pub use store::{EntityLink, Removal, RuntimeStore, StoreProvider};

/// Type aliases for clarity
pub type InstanceId = i64;
pub type ComponentTypeId = u32;
pub type SnapshotId = u32;
pub type StoreId = String;
pub type ConnectionId = u32;
pub type Sequence = u32;

/// Parent id of a root, and of a node with no parent.
pub const NO_PARENT: InstanceId = -1;

/// Connection id a client uses to address the server, and the sender id the
/// server stamps on its own commands.
pub const SERVER_CONNECTION: ConnectionId = 0;
