//! Receiving side of the replication protocol.
//!
//! The client applies [`StoreSync`] payloads to its replica stores and
//! answers each with either an ack or, when the payload cannot be trusted, a
//! resync request carrying the last snapshot id it applied. At most one
//! resync request per store is in flight; an unanswered one is re-sent after
//! `resync_timeout_ticks`.

use crate::command::{Command, CommandBus, SequenceGuard};
use crate::config::{CommandDispatch, ReplicationConfig};
use crate::debug::structure_hash;
use crate::delta::{apply_delta, apply_full};
use crate::protocol::{send_message, Reliability, StoreSync, SyncMode, Transport, WireMessage};
use crate::store::StoreProvider;
use crate::{error::Result, Error, Sequence, SnapshotId, StoreId, SERVER_CONNECTION};
use std::collections::{HashMap, VecDeque};

/// Outcome of a handled message, for the host's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Payload applied and acked
    Applied {
        store_id: StoreId,
        snapshot_id: SnapshotId,
        mode: SyncMode,
    },
    /// Payload neither applied nor acked: a resync is in flight, or the
    /// delta was computed against a snapshot other than the applied one
    Dropped {
        store_id: StoreId,
        snapshot_id: SnapshotId,
    },
    /// Payload rejected and a resync requested
    ResyncRequested {
        store_id: StoreId,
        have_snapshot_id: SnapshotId,
    },
    /// Server hash compared with the local replica
    HashChecked { store_id: StoreId, matches: bool },
}

/// Client endpoint of the replication protocol.
#[derive(Debug)]
pub struct ReplicationClient {
    config: ReplicationConfig,
    connected: bool,
    tick: u64,
    applied: HashMap<StoreId, SnapshotId>,
    resync_in_flight: HashMap<StoreId, u64>,
    outgoing: VecDeque<Command>,
    seq: Sequence,
    inbound: SequenceGuard,
    commands: CommandBus,
}

impl ReplicationClient {
    pub fn new(config: ReplicationConfig) -> Self {
        Self {
            config,
            connected: true,
            tick: 0,
            applied: HashMap::new(),
            resync_in_flight: HashMap::new(),
            outgoing: VecDeque::new(),
            seq: 0,
            inbound: SequenceGuard::new(),
            commands: CommandBus::new(),
        }
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// Bus that executes commands received from the server.
    pub fn commands(&mut self) -> &mut CommandBus {
        &mut self.commands
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Track the transport's connection state. A reconnect starts from no
    /// baseline; queued commands survive and go out once reconnected.
    pub fn set_connected(&mut self, connected: bool) {
        if self.connected == connected {
            return;
        }
        self.connected = connected;

        if !connected {
            self.applied.clear();
            self.resync_in_flight.clear();
            self.inbound.clear();
        }
        tracing::info!(target: "arbor::snap", connected, "client connection changed");
    }

    /// Last snapshot id applied for `store_id`; 0 for none.
    pub fn applied_snapshot(&self, store_id: &str) -> SnapshotId {
        self.applied.get(store_id).copied().unwrap_or(0)
    }

    pub fn is_resyncing(&self, store_id: &str) -> bool {
        self.resync_in_flight.contains_key(store_id)
    }

    /// Queue a command for the server. It is sequenced and sent on the next
    /// tick while connected.
    pub fn send_command(&mut self, command: Command) {
        self.outgoing.push_back(command);
    }

    pub fn pending_commands(&self) -> usize {
        self.outgoing.len()
    }

    /// Ask the server for its structure hash of `store_id`.
    pub fn request_debug_hash(&mut self, store_id: impl Into<StoreId>, transport: &mut dyn Transport) -> Result<()> {
        send_message(
            transport,
            SERVER_CONNECTION,
            &WireMessage::DebugHashRequest {
                store_id: store_id.into(),
            },
            Reliability::Reliable,
        )
    }

    /// Handle bytes received from the server.
    pub fn handle_message(
        &mut self,
        bytes: &[u8],
        stores: &mut dyn StoreProvider,
        transport: &mut dyn Transport,
    ) -> Result<Option<ClientEvent>> {
        let message = WireMessage::decode(bytes)?;
        tracing::debug!(target: "arbor::snap", kind = message.kind(), bytes = bytes.len(), "recv");

        match message {
            WireMessage::StoreSync(sync) => self.on_sync(sync, stores, transport).map(Some),
            WireMessage::Command(command) => {
                self.on_command(command, stores);
                Ok(None)
            }
            WireMessage::DebugHash {
                store_id,
                hash,
                valid,
                error,
            } => {
                let store = stores
                    .store(&store_id)
                    .ok_or_else(|| Error::UnknownStore(store_id.clone()))?;
                let local = structure_hash(store);
                let matches = local == hash;

                if !matches || !valid {
                    tracing::warn!(
                        target: "arbor::snap",
                        store = %store_id,
                        server = hash,
                        local,
                        valid,
                        error = error.as_deref().unwrap_or(""),
                        "structure hash mismatch"
                    );
                }
                Ok(Some(ClientEvent::HashChecked { store_id, matches }))
            }
            other => {
                tracing::debug!(target: "arbor::snap", kind = other.kind(), "ignoring server-bound message");
                Ok(None)
            }
        }
    }

    fn on_sync(
        &mut self,
        sync: StoreSync,
        stores: &mut dyn StoreProvider,
        transport: &mut dyn Transport,
    ) -> Result<ClientEvent> {
        let store_id = sync.store_id.clone();
        let snapshot_id = sync.snapshot_id;
        let mode = sync.mode;
        let last_applied = self.applied_snapshot(&store_id);

        let store = stores
            .store_mut(&store_id)
            .ok_or_else(|| Error::UnknownStore(store_id.clone()))?;

        // The server rebuilds against the acked snapshot once our ack lands
        if mode == SyncMode::Delta
            && last_applied != 0
            && snapshot_id > last_applied
            && sync.baseline_snapshot_id != Some(last_applied)
        {
            tracing::debug!(
                target: "arbor::snap",
                store = %store_id,
                snap = snapshot_id,
                baseline = ?sync.baseline_snapshot_id,
                last_applied,
                "delta against another baseline, dropping"
            );
            return Ok(ClientEvent::Dropped {
                store_id,
                snapshot_id,
            });
        }

        let applied = if snapshot_id <= last_applied {
            tracing::debug!(
                target: "arbor::snap",
                store = %store_id,
                snap = snapshot_id,
                last_applied,
                "stale store-sync"
            );
            false
        } else {
            match mode {
                SyncMode::Full => {
                    apply_full(store, snapshot_id, &sync.structural, self.config.max_apply_passes)
                }
                SyncMode::Delta => apply_delta(store, &sync.into_payload()),
            }
        };

        if !applied {
            return self.request_resync(store_id, snapshot_id, last_applied, transport);
        }

        self.applied.insert(store_id.clone(), snapshot_id);
        self.resync_in_flight.remove(&store_id);

        tracing::debug!(
            target: "arbor::snap",
            store = %store_id,
            snap = snapshot_id,
            mode = ?mode,
            "applied store-sync"
        );
        send_message(
            transport,
            SERVER_CONNECTION,
            &WireMessage::StoreAck {
                store_id: store_id.clone(),
                snapshot_id,
            },
            Reliability::Reliable,
        )?;

        Ok(ClientEvent::Applied {
            store_id,
            snapshot_id,
            mode,
        })
    }

    fn request_resync(
        &mut self,
        store_id: StoreId,
        snapshot_id: SnapshotId,
        have: SnapshotId,
        transport: &mut dyn Transport,
    ) -> Result<ClientEvent> {
        if self.resync_in_flight.contains_key(&store_id) {
            tracing::debug!(
                target: "arbor::snap",
                store = %store_id,
                snap = snapshot_id,
                "resync in flight, dropping store-sync"
            );
            return Ok(ClientEvent::Dropped {
                store_id,
                snapshot_id,
            });
        }

        tracing::warn!(
            target: "arbor::snap",
            store = %store_id,
            snap = snapshot_id,
            have,
            "store-sync rejected, requesting resync"
        );
        self.send_resync(&store_id, have, transport)?;
        self.resync_in_flight.insert(store_id.clone(), self.tick);

        Ok(ClientEvent::ResyncRequested {
            store_id,
            have_snapshot_id: have,
        })
    }

    fn send_resync(&self, store_id: &str, have: SnapshotId, transport: &mut dyn Transport) -> Result<()> {
        send_message(
            transport,
            SERVER_CONNECTION,
            &WireMessage::StoreResyncRequest {
                store_id: store_id.to_string(),
                have_snapshot_id: have,
            },
            Reliability::Reliable,
        )
    }

    fn on_command(&mut self, command: Command, stores: &mut dyn StoreProvider) {
        if !self.inbound.accept(command.sender, command.seq) {
            tracing::debug!(
                target: "arbor::cmd",
                sender = command.sender,
                seq = command.seq,
                "drop duplicate command"
            );
            return;
        }

        match self.config.command_dispatch {
            CommandDispatch::Immediate => {
                self.commands.execute_now(command, stores);
            }
            CommandDispatch::Deferred => self.commands.enqueue(command),
        }
    }

    /// Advance one tick: run deferred commands, flush replica stores, re-send
    /// timed out resync requests and send queued commands.
    pub fn tick(&mut self, stores: &mut dyn StoreProvider, transport: &mut dyn Transport) -> Result<()> {
        self.tick += 1;
        self.commands.flush(stores);

        for id in stores.store_ids() {
            if let Some(store) = stores.store_mut(&id) {
                store.tick();
            }
        }

        if !self.connected {
            return Ok(());
        }

        let timeout = self.config.resync_timeout_ticks;
        let expired: Vec<StoreId> = self
            .resync_in_flight
            .iter()
            .filter(|(_, sent)| self.tick.saturating_sub(**sent) >= timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for store_id in expired {
            let have = self.applied_snapshot(&store_id);
            tracing::warn!(target: "arbor::snap", store = %store_id, have, "resync timed out, re-sending");
            self.send_resync(&store_id, have, transport)?;
            self.resync_in_flight.insert(store_id, self.tick);
        }

        while let Some(mut command) = self.outgoing.pop_front() {
            self.seq += 1;
            command.seq = self.seq;
            command.tick = self.tick;
            tracing::debug!(
                target: "arbor::cmd",
                store = %command.store_id,
                seq = command.seq,
                "send command"
            );
            send_message(
                transport,
                SERVER_CONNECTION,
                &WireMessage::Command(command),
                Reliability::Reliable,
            )?;
        }

        Ok(())
    }
}
