//! Components of the demo world.

use arbor_engine::{Component, ComponentType, ConnectionId, ReplicationPolicy};
use serde::{Deserialize, Serialize};

/// Grid position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transform {
    pub cell: (i32, i32),
}

impl Component for Transform {}
impl ComponentType for Transform {
    const ALIAS: &'static str = "transform";
}

/// Display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Name {
    pub value: String,
}

impl Component for Name {}
impl ComponentType for Name {
    const ALIAS: &'static str = "name";
}

/// Items carried by a player's object. Only the owning connection sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    pub owner: ConnectionId,
    pub items: Vec<String>,
}

impl Component for Inventory {
    fn policy(&self) -> ReplicationPolicy {
        ReplicationPolicy::owned_by(self.owner)
    }
}

impl ComponentType for Inventory {
    const ALIAS: &'static str = "inventory";
}
