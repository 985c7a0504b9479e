//! The game loop.
//!
//! One task owns the replication server and every hosted store. It wakes on
//! its tick timer or on a [`HostEvent`], and after each wake-up routes
//! whatever the engine queued to the sockets.

mod commands;
mod components;

use commands::WorldHandler;
use components::{Inventory, Name, Transform};

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use arbor_engine::debug::{dump, structure_hash, validate};
use arbor_engine::{
    AssetKey, ComponentRegistry, Envelope, NodeHeader, Outbox, ReplicationServer, RuntimeStore,
    StoreId,
};
use tokio::time::MissedTickBehavior;

use crate::config::Config;
use crate::error::Result;
use crate::websocket::{ConnectionManager, EventReceiver, HostEvent, StoreInspection};

/// Component manifest used when no `MANIFEST_PATH` is configured.
const DEFAULT_MANIFEST: &str = include_str!("manifest.json");

/// Depth limit for dumps served over HTTP.
const INSPECT_DUMP_DEPTH: usize = 32;

/// Build the component registry from the configured or embedded manifest.
pub fn load_registry(manifest_path: Option<&Path>) -> Result<Arc<ComponentRegistry>> {
    let manifest = match manifest_path {
        Some(path) => {
            tracing::info!("Loading component manifest from {}", path.display());
            std::fs::read_to_string(path)?
        }
        None => DEFAULT_MANIFEST.to_string(),
    };

    let registry = ComponentRegistry::from_json(&manifest)?
        .with::<Transform>()?
        .with::<Name>()?
        .with::<Inventory>()?;

    tracing::info!(
        version = registry.manifest_version(),
        types = registry.len(),
        "Component registry ready"
    );
    Ok(Arc::new(registry))
}

/// Authoritative world state plus its replication server.
pub struct Game {
    replication: ReplicationServer,
    stores: BTreeMap<StoreId, RuntimeStore>,
    outbox: Outbox,
}

impl Game {
    /// Create the world with one seeded store.
    pub fn new(config: &Config, registry: Arc<ComponentRegistry>) -> Self {
        let store_id = config.store_id.clone();

        let mut replication = ReplicationServer::new(config.replication.clone());
        replication.register_store(store_id.clone());
        replication.commands().register(store_id.clone(), WorldHandler);

        let mut store = RuntimeStore::new(store_id.clone(), registry);
        seed(&mut store);

        let mut stores = BTreeMap::new();
        stores.insert(store_id, store);

        Self {
            replication,
            stores,
            outbox: Outbox::new(),
        }
    }

    /// React to a socket or HTTP event.
    pub fn handle(&mut self, event: HostEvent) {
        match event {
            HostEvent::Connected {
                connection,
                profile,
            } => {
                self.replication.add_connection(connection, profile);
                self.replication.set_ready(connection);
            }
            HostEvent::Message { connection, bytes } => {
                if let Err(e) = self.replication.handle_message(
                    connection,
                    &bytes,
                    &mut self.stores,
                    &mut self.outbox,
                ) {
                    tracing::warn!(conn_id = connection, "Rejected client message: {}", e);
                }
            }
            HostEvent::Disconnected { connection } => {
                self.replication.remove_connection(connection);
            }
            HostEvent::Inspect { store_id, reply } => {
                let _ = reply.send(self.inspect(&store_id));
            }
        }
    }

    /// Advance the world one tick.
    pub fn tick(&mut self) -> Result<()> {
        self.replication.tick(&mut self.stores, &mut self.outbox)?;
        Ok(())
    }

    /// Take the messages queued for sockets.
    pub fn drain(&mut self) -> Vec<Envelope> {
        self.outbox.drain()
    }

    /// Structural summary of a store.
    pub fn inspect(&self, store_id: &str) -> Option<StoreInspection> {
        let store = self.stores.get(store_id)?;
        let validation = validate(store);

        Some(StoreInspection {
            store_id: store_id.to_string(),
            objects: store.len(),
            hash: structure_hash(store),
            valid: validation.is_ok(),
            error: validation.err().map(|e| e.to_string()),
            dump: dump(store, INSPECT_DUMP_DEPTH),
        })
    }

    /// Run until every event sender is dropped.
    pub async fn run(
        mut self,
        mut events: EventReceiver,
        conn_manager: Arc<ConnectionManager>,
        tick_interval: Duration,
    ) {
        let mut interval = tokio::time::interval(tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(interval_ms = tick_interval.as_millis() as u64, "Game loop started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick() {
                        tracing::error!("Tick failed: {}", e);
                    }
                }
                event = events.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
            }

            let envelopes = self.drain();
            if !envelopes.is_empty() {
                conn_manager.deliver(envelopes);
            }
        }

        tracing::info!("Game loop stopped");
    }
}

/// Create the initial objects of a fresh world.
fn seed(store: &mut RuntimeStore) {
    let root = store.create();
    if let Some(object) = store.try_take_rw(root) {
        object.set_header(NodeHeader::new(AssetKey::new("arbor", "zone", "spawn", "1.0.0")));
        if let Err(e) = object.add_or_replace(Name {
            value: "spawn".to_string(),
        }) {
            tracing::warn!("Failed to seed world: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::commands::WorldCommand;
    use super::*;
    use arbor_engine::{Command, ConnectionId, StructuralOp, SyncMode, WireMessage};

    fn test_config() -> Config {
        Config::from_lookup(|_| None).unwrap()
    }

    fn test_game() -> Game {
        Game::new(&test_config(), load_registry(None).unwrap())
    }

    fn messages_for(game: &mut Game, connection: ConnectionId) -> Vec<WireMessage> {
        game.drain()
            .into_iter()
            .filter(|e| e.connection == connection)
            .map(|e| e.message().unwrap())
            .collect()
    }

    fn send_command(game: &mut Game, connection: ConnectionId, seq: u32, action: &WorldCommand) {
        let mut command = Command::with_payload("world", action).unwrap();
        command.seq = seq;
        let bytes = WireMessage::Command(command).encode().unwrap();
        game.handle(HostEvent::Message { connection, bytes });
    }

    #[test]
    fn test_embedded_manifest_registers_every_component() {
        let registry = load_registry(None).unwrap();
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.id_of_alias("transform"), Some(0));
        assert_eq!(registry.id_of_alias("inventory"), Some(2));
    }

    #[test]
    fn test_connection_gets_full_sync_of_seeded_world() {
        let mut game = test_game();
        game.handle(HostEvent::Connected {
            connection: 1,
            profile: None,
        });
        game.tick().unwrap();

        let messages = messages_for(&mut game, 1);
        assert_eq!(messages.len(), 1);
        match &messages[0] {
            WireMessage::StoreSync(sync) => {
                assert_eq!(sync.mode, SyncMode::Full);
                assert_eq!(sync.structural.len(), 1);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_spawn_command_gives_sender_private_inventory() {
        let mut game = test_game();
        for connection in [1, 2] {
            game.handle(HostEvent::Connected {
                connection,
                profile: None,
            });
        }
        game.tick().unwrap();
        game.drain();

        send_command(
            &mut game,
            1,
            1,
            &WorldCommand::Spawn {
                name: "scout".into(),
                cell: (3, 4),
                parent: None,
            },
        );
        game.tick().unwrap();

        let spawned_components = |messages: Vec<WireMessage>| match &messages[0] {
            WireMessage::StoreSync(sync) => match sync.structural.last() {
                Some(StructuralOp::Spawn { data, .. }) => data.components.len(),
                other => panic!("unexpected op {:?}", other),
            },
            other => panic!("unexpected message {:?}", other),
        };

        let envelopes = game.drain();
        let for_conn = |conn: ConnectionId| {
            envelopes
                .iter()
                .filter(|e| e.connection == conn)
                .map(|e| e.message().unwrap())
                .collect::<Vec<_>>()
        };
        // Neither client acked, so both get full payloads
        assert_eq!(spawned_components(for_conn(1)), 3);
        assert_eq!(spawned_components(for_conn(2)), 2);
    }

    #[test]
    fn test_move_command_updates_authority() {
        let mut game = test_game();
        game.handle(HostEvent::Connected {
            connection: 1,
            profile: None,
        });

        send_command(&mut game, 1, 1, &WorldCommand::MoveTo { id: 1, cell: (9, 9) });
        game.tick().unwrap();

        let store = game.stores.get("world").unwrap();
        let transform = store.try_take_ro(1).unwrap().take_ro::<Transform>();
        assert_eq!(transform, Some(&Transform { cell: (9, 9) }));
    }

    #[test]
    fn test_inspect_reports_structure() {
        let game = test_game();
        let inspection = game.inspect("world").unwrap();
        assert_eq!(inspection.objects, 1);
        assert!(inspection.valid);
        assert!(inspection.dump.contains("arbor.zone.spawn.1.0.0"));
        assert!(game.inspect("lobby").is_none());
    }
}
