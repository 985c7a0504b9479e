//! Commands clients may send to the demo world.

use arbor_engine::error::Result;
use arbor_engine::{
    AssetKey, Command, CommandContext, CommandHandler, Error, InstanceId, NodeHeader,
    RemoveMode, RuntimeStore, SERVER_CONNECTION,
};
use serde::{Deserialize, Serialize};

use super::components::{Inventory, Name, Transform};

/// Payload of a world command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum WorldCommand {
    /// Create an object, optionally under a parent.
    Spawn {
        name: String,
        cell: (i32, i32),
        #[serde(default)]
        parent: Option<InstanceId>,
    },

    /// Set an object's position.
    MoveTo { id: InstanceId, cell: (i32, i32) },

    /// Put an object under another one, or make it a root.
    Reparent {
        id: InstanceId,
        parent: Option<InstanceId>,
        #[serde(default = "append")]
        index: i32,
    },

    /// Remove an object and everything under it.
    Despawn { id: InstanceId },
}

fn append() -> i32 {
    -1
}

/// Executes [`WorldCommand`]s against the store they address.
#[derive(Debug, Default)]
pub struct WorldHandler;

impl CommandHandler for WorldHandler {
    fn execute(&mut self, command: &Command, ctx: &mut CommandContext<'_>) -> Result<()> {
        let action: WorldCommand = command.decode()?;
        let store = ctx
            .stores
            .store_mut(&command.store_id)
            .ok_or_else(|| Error::UnknownStore(command.store_id.clone()))?;

        tracing::debug!(sender = command.sender, seq = command.seq, ?action, "World command");

        match action {
            WorldCommand::Spawn { name, cell, parent } => {
                let id = match parent {
                    Some(parent) => {
                        require(store, parent)?;
                        store.create_child(parent, -1)
                    }
                    None => store.create(),
                };
                let object = require(store, id)?;
                object.set_header(NodeHeader::new(AssetKey::new("arbor", "actor", &name, "1.0.0")));
                object.add_or_replace(Transform { cell })?;
                object.add_or_replace(Name { value: name })?;
                if command.sender != SERVER_CONNECTION {
                    object.add_or_replace(Inventory {
                        owner: command.sender,
                        items: Vec::new(),
                    })?;
                }
                Ok(())
            }

            WorldCommand::MoveTo { id, cell } => {
                let object = require(store, id)?;
                if let Some(transform) = object.take_rw::<Transform>() {
                    transform.cell = cell;
                } else {
                    object.add_or_replace(Transform { cell })?;
                }
                Ok(())
            }

            WorldCommand::Reparent { id, parent, index } => {
                let placed = match parent {
                    Some(parent) => store.attach_child(parent, id, index),
                    None => store.detach_child(id) || store.is_root(id),
                };
                if placed {
                    Ok(())
                } else {
                    Err(Error::InvalidMessage(format!("cannot place object {}", id)))
                }
            }

            WorldCommand::Despawn { id } => {
                if store.remove(id, RemoveMode::Subtree) {
                    Ok(())
                } else {
                    Err(Error::InvalidMessage(format!("no object {}", id)))
                }
            }
        }
    }
}

fn require(store: &mut RuntimeStore, id: InstanceId) -> Result<&mut arbor_engine::RuntimeObject> {
    store
        .try_take_rw(id)
        .ok_or_else(|| Error::InvalidMessage(format!("no object {}", id)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_json_shape() {
        let json = r#"{"action":"move_to","id":4,"cell":[2,3]}"#;
        let command: WorldCommand = serde_json::from_str(json).unwrap();
        assert_eq!(command, WorldCommand::MoveTo { id: 4, cell: (2, 3) });

        let json = r#"{"action":"reparent","id":4,"parent":null}"#;
        let command: WorldCommand = serde_json::from_str(json).unwrap();
        assert_eq!(
            command,
            WorldCommand::Reparent {
                id: 4,
                parent: None,
                index: -1
            }
        );
    }
}
