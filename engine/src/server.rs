//! Authoritative side of the replication protocol.
//!
//! The server tracks one [`Session`] per (connection, store). On every tick
//! where a store changed it assigns the store's next snapshot id and sends
//! each ready connection either a full payload or a delta against exactly the
//! snapshot that connection last acknowledged. Views sent are kept in a
//! bounded [`SnapshotHistory`]; an acknowledged baseline that has aged out
//! of it forces a full payload.

use crate::changes::StoreChanges;
use crate::command::{Command, CommandBus, SequenceGuard};
use crate::component::SnapshotFilter;
use crate::config::{CommandDispatch, ReplicationConfig};
use crate::debug::{structure_hash, validate};
use crate::delta::{build_delta_payload, build_full_payload};
use crate::history::SnapshotHistory;
use crate::protocol::{send_message, Reliability, StoreSync, SyncMode, Transport, WireMessage};
use crate::snapshot::build_snapshot;
use crate::store::{RuntimeStore, StoreProvider};
use crate::{
    error::Result, ConnectionId, Error, Sequence, SnapshotId, StoreId, SERVER_CONNECTION,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Replication state of one (connection, store) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Nothing sent yet
    NoBaseline,
    /// Full payload sent, no ack received
    AwaitingFirstAck,
    /// Acked baseline available for deltas
    Synced,
    /// Client reported divergence; full payload pending or unacked
    Resyncing,
}

/// Per (connection, store) bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    /// Highest snapshot id the client acknowledged; 0 for none
    pub last_ack: SnapshotId,
    /// Snapshot id of the last payload sent
    pub last_sent: SnapshotId,
    pub state: SyncState,
    force_full: bool,
}

impl Session {
    fn new() -> Self {
        Self {
            last_ack: 0,
            last_sent: 0,
            state: SyncState::NoBaseline,
            force_full: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ConnectionState {
    ready: bool,
    profile: Option<u32>,
}

#[derive(Debug)]
struct StoreReplication {
    last_snapshot_id: SnapshotId,
    dirty: bool,
    history: SnapshotHistory,
    sessions: BTreeMap<ConnectionId, Session>,
}

/// Server endpoint of the replication protocol.
#[derive(Debug)]
pub struct ReplicationServer {
    config: ReplicationConfig,
    tick: u64,
    connections: BTreeMap<ConnectionId, ConnectionState>,
    stores: BTreeMap<StoreId, StoreReplication>,
    commands: CommandBus,
    inbound: SequenceGuard,
    outbound_seq: Sequence,
}

impl ReplicationServer {
    pub fn new(config: ReplicationConfig) -> Self {
        Self {
            config,
            tick: 0,
            connections: BTreeMap::new(),
            stores: BTreeMap::new(),
            commands: CommandBus::new(),
            inbound: SequenceGuard::new(),
            outbound_seq: 0,
        }
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// Current server tick.
    pub fn current_tick(&self) -> u64 {
        self.tick
    }

    /// Bus that executes commands received from clients.
    pub fn commands(&mut self) -> &mut CommandBus {
        &mut self.commands
    }

    /// Start replicating a store.
    pub fn register_store(&mut self, store_id: impl Into<StoreId>) {
        let store_id = store_id.into();
        let sessions = self
            .connections
            .iter()
            .filter(|(_, c)| c.ready)
            .map(|(id, _)| (*id, Session::new()))
            .collect();

        self.stores.insert(
            store_id,
            StoreReplication {
                last_snapshot_id: 0,
                dirty: true,
                history: SnapshotHistory::new(self.config.history_capacity),
                sessions,
            },
        );
    }

    pub fn has_store(&self, store_id: &str) -> bool {
        self.stores.contains_key(store_id)
    }

    /// Track a new connection. It receives nothing until [`set_ready`](Self::set_ready).
    pub fn add_connection(&mut self, connection: ConnectionId, profile: Option<u32>) {
        tracing::info!(target: "arbor::snap", conn = connection, ?profile, "connection added");
        self.connections.insert(
            connection,
            ConnectionState {
                ready: false,
                profile,
            },
        );
    }

    /// Mark a connection ready. Every store owes it a full payload.
    pub fn set_ready(&mut self, connection: ConnectionId) -> bool {
        let Some(state) = self.connections.get_mut(&connection) else {
            return false;
        };
        if state.ready {
            return true;
        }
        state.ready = true;

        for replication in self.stores.values_mut() {
            replication.sessions.insert(connection, Session::new());
            replication.dirty = true;
        }

        tracing::info!(target: "arbor::snap", conn = connection, "connection ready");
        true
    }

    /// Forget a connection and everything held for it.
    pub fn remove_connection(&mut self, connection: ConnectionId) {
        if self.connections.remove(&connection).is_none() {
            return;
        }

        for replication in self.stores.values_mut() {
            replication.sessions.remove(&connection);
            replication.history.forget(connection);
        }
        self.inbound.forget(connection);

        tracing::info!(target: "arbor::snap", conn = connection, "connection removed");
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn session(&self, connection: ConnectionId, store_id: &str) -> Option<Session> {
        self.stores
            .get(store_id)
            .and_then(|r| r.sessions.get(&connection))
            .copied()
    }

    /// Feed a flushed change batch; non-empty batches mark the store dirty.
    pub fn observe(&mut self, store_id: &str, changes: &StoreChanges) {
        if !changes.is_empty() {
            self.mark_dirty(store_id);
        }
    }

    /// Force a sync of `store_id` on the next tick.
    pub fn mark_dirty(&mut self, store_id: &str) {
        if let Some(replication) = self.stores.get_mut(store_id) {
            replication.dirty = true;
        }
    }

    /// Handle bytes received from `connection`.
    pub fn handle_message(
        &mut self,
        connection: ConnectionId,
        bytes: &[u8],
        stores: &mut dyn StoreProvider,
        transport: &mut dyn Transport,
    ) -> Result<()> {
        let message = WireMessage::decode(bytes)?;
        tracing::debug!(
            target: "arbor::snap",
            conn = connection,
            kind = message.kind(),
            bytes = bytes.len(),
            "recv"
        );

        match message {
            WireMessage::StoreAck {
                store_id,
                snapshot_id,
            } => self.on_ack(connection, &store_id, snapshot_id),
            WireMessage::StoreResyncRequest {
                store_id,
                have_snapshot_id,
            } => self.on_resync(connection, &store_id, have_snapshot_id),
            WireMessage::Command(command) => {
                self.on_command(connection, command, stores);
                Ok(())
            }
            WireMessage::DebugHashRequest { store_id } => {
                self.send_debug_hash(connection, &store_id, stores, transport)
            }
            other => {
                tracing::debug!(
                    target: "arbor::snap",
                    conn = connection,
                    kind = other.kind(),
                    "ignoring client-bound message"
                );
                Ok(())
            }
        }
    }

    fn on_ack(&mut self, connection: ConnectionId, store_id: &str, snapshot_id: SnapshotId) -> Result<()> {
        let replication = self
            .stores
            .get_mut(store_id)
            .ok_or_else(|| Error::UnknownStore(store_id.to_string()))?;
        let Some(session) = replication.sessions.get_mut(&connection) else {
            return Ok(());
        };

        if snapshot_id <= session.last_ack {
            tracing::debug!(
                target: "arbor::snap",
                store = %store_id,
                conn = connection,
                snap = snapshot_id,
                last_ack = session.last_ack,
                "ignoring old ack"
            );
            return Ok(());
        }

        if snapshot_id > session.last_sent {
            tracing::warn!(
                target: "arbor::snap",
                store = %store_id,
                conn = connection,
                snap = snapshot_id,
                last_sent = session.last_sent,
                "ignoring ack for unsent snapshot"
            );
            return Ok(());
        }

        session.last_ack = snapshot_id;
        if !session.force_full {
            session.state = SyncState::Synced;
        }

        // Syncs sent since were diffed against an older baseline and the
        // client drops them, so rebuild against this one.
        let lagging = snapshot_id < session.last_sent;
        if lagging {
            replication.dirty = true;
        }

        tracing::debug!(
            target: "arbor::snap",
            store = %store_id,
            conn = connection,
            snap = snapshot_id,
            "ack"
        );
        Ok(())
    }

    fn on_resync(&mut self, connection: ConnectionId, store_id: &str, have: SnapshotId) -> Result<()> {
        let replication = self
            .stores
            .get_mut(store_id)
            .ok_or_else(|| Error::UnknownStore(store_id.to_string()))?;
        let Some(session) = replication.sessions.get_mut(&connection) else {
            return Ok(());
        };

        session.force_full = true;
        session.state = SyncState::Resyncing;
        replication.dirty = true;

        tracing::warn!(
            target: "arbor::snap",
            store = %store_id,
            conn = connection,
            have,
            "resync requested"
        );
        Ok(())
    }

    fn on_command(&mut self, connection: ConnectionId, mut command: Command, stores: &mut dyn StoreProvider) {
        if !self.inbound.accept(connection, command.seq) {
            tracing::debug!(
                target: "arbor::cmd",
                conn = connection,
                seq = command.seq,
                "drop duplicate command"
            );
            return;
        }

        command.sender = connection;
        match self.config.command_dispatch {
            CommandDispatch::Immediate => {
                self.commands.execute_now(command, stores);
            }
            CommandDispatch::Deferred => self.commands.enqueue(command),
        }
    }

    fn send_debug_hash(
        &mut self,
        connection: ConnectionId,
        store_id: &str,
        stores: &mut dyn StoreProvider,
        transport: &mut dyn Transport,
    ) -> Result<()> {
        let store = stores
            .store(store_id)
            .ok_or_else(|| Error::UnknownStore(store_id.to_string()))?;

        send_message(
            transport,
            connection,
            &debug_hash_message(store),
            Reliability::Reliable,
        )
    }

    /// Send a command to one client.
    pub fn send_command(
        &mut self,
        connection: ConnectionId,
        store_id: impl Into<StoreId>,
        payload: Vec<u8>,
        transport: &mut dyn Transport,
    ) -> Result<()> {
        let command = self.next_command(store_id.into(), payload);
        tracing::debug!(
            target: "arbor::cmd",
            conn = connection,
            store = %command.store_id,
            seq = command.seq,
            "send command"
        );
        send_message(
            transport,
            connection,
            &WireMessage::Command(command),
            Reliability::Reliable,
        )
    }

    /// Send a command to every ready client.
    pub fn broadcast_command(
        &mut self,
        store_id: impl Into<StoreId>,
        payload: Vec<u8>,
        transport: &mut dyn Transport,
    ) -> Result<()> {
        let message = WireMessage::Command(self.next_command(store_id.into(), payload));
        for (connection, state) in &self.connections {
            if state.ready {
                send_message(transport, *connection, &message, Reliability::Reliable)?;
            }
        }
        Ok(())
    }

    fn next_command(&mut self, store_id: StoreId, payload: Vec<u8>) -> Command {
        self.outbound_seq += 1;
        Command {
            store_id,
            tick: self.tick,
            seq: self.outbound_seq,
            sender: SERVER_CONNECTION,
            payload,
        }
    }

    /// Advance one tick: run deferred commands, flush every replicated
    /// store, then send syncs for stores that changed.
    pub fn tick(&mut self, stores: &mut dyn StoreProvider, transport: &mut dyn Transport) -> Result<()> {
        self.tick += 1;
        self.commands.flush(stores);

        let ids: Vec<StoreId> = self.stores.keys().cloned().collect();
        for id in &ids {
            let Some(store) = stores.store_mut(id) else {
                continue;
            };
            for changes in store.tick() {
                self.observe(id, &changes);
            }
        }

        for id in &ids {
            if !self.stores.get(id).is_some_and(|r| r.dirty) {
                continue;
            }
            match stores.store(id) {
                Some(store) => self.send_store(id, store, transport)?,
                None => tracing::warn!(target: "arbor::snap", store = %id, "replicated store missing"),
            }
        }

        Ok(())
    }

    fn send_store(&mut self, store_id: &str, store: &RuntimeStore, transport: &mut dyn Transport) -> Result<()> {
        let ready: Vec<(ConnectionId, Option<u32>)> = self
            .connections
            .iter()
            .filter(|(_, c)| c.ready)
            .map(|(id, c)| (*id, c.profile))
            .collect();
        let hash_message = self.config.debug_hash_checks.then(|| debug_hash_message(store));

        let Some(replication) = self.stores.get_mut(store_id) else {
            return Ok(());
        };
        replication.dirty = false;
        if ready.is_empty() {
            return Ok(());
        }

        replication.last_snapshot_id += 1;
        let snapshot_id = replication.last_snapshot_id;
        let mut views = HashMap::with_capacity(ready.len());

        for (connection, profile) in ready {
            let filter = SnapshotFilter::delta()
                .for_connection(connection)
                .with_profile(profile);
            let view = Arc::new(build_snapshot(store, &filter)?.with_id(snapshot_id));

            let session = replication
                .sessions
                .entry(connection)
                .or_insert_with(Session::new);
            let baseline = if session.force_full || session.last_ack == 0 {
                None
            } else {
                replication.history.get(session.last_ack, connection)
            };

            let sync = match baseline {
                Some(baseline) => {
                    StoreSync::delta(store_id, snapshot_id, build_delta_payload(&baseline, &view))
                }
                None => {
                    if session.last_ack != 0 && !session.force_full {
                        tracing::debug!(
                            target: "arbor::snap",
                            store = %store_id,
                            conn = connection,
                            last_ack = session.last_ack,
                            "baseline aged out of history"
                        );
                    }
                    let full_filter = SnapshotFilter::full()
                        .for_connection(connection)
                        .with_profile(profile);
                    let full = build_snapshot(store, &full_filter)?;
                    StoreSync::full(store_id, snapshot_id, build_full_payload(&full))
                }
            };

            if sync.mode == SyncMode::Full {
                session.force_full = false;
                if session.state == SyncState::NoBaseline {
                    session.state = SyncState::AwaitingFirstAck;
                }
            }
            session.last_sent = snapshot_id;

            tracing::debug!(
                target: "arbor::snap",
                store = %store_id,
                conn = connection,
                snap = snapshot_id,
                mode = ?sync.mode,
                ops = sync.op_count(),
                "send store-sync"
            );
            send_message(
                transport,
                connection,
                &WireMessage::StoreSync(sync),
                Reliability::Reliable,
            )?;
            if let Some(message) = &hash_message {
                send_message(transport, connection, message, Reliability::Reliable)?;
            }

            views.insert(connection, view);
        }

        replication.history.push(snapshot_id, views);
        Ok(())
    }
}

fn debug_hash_message(store: &RuntimeStore) -> WireMessage {
    let validation = validate(store);
    WireMessage::DebugHash {
        store_id: store.id().to_string(),
        hash: structure_hash(store),
        valid: validation.is_ok(),
        error: validation.err().map(|e| e.to_string()),
    }
}
