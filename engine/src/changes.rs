//! Change records emitted by a store flush.

use crate::{ComponentTypeId, InstanceId};
use serde::{Deserialize, Serialize};

/// How [`RuntimeStore::remove`](crate::RuntimeStore::remove) treats the
/// children of the removed node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoveMode {
    /// Remove the node and every descendant.
    Subtree,
    /// Remove only the node; its children become roots.
    NodeOnlyDetachChildrenToRoot,
    /// Remove only the node; its children move to the node's former parent,
    /// or become roots if it had none.
    NodeOnlyReparentChildrenToParent,
}

/// Kind of a recorded structural change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StructureOpKind {
    Spawn,
    Reparent,
    Move,
    Remove(RemoveMode),
}

/// A structural change recorded by the store.
///
/// `order` is strictly increasing across the life of a store; consumers replay
/// ops sorted by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructureOp {
    pub order: u64,
    pub kind: StructureOpKind,
    pub id: InstanceId,
    /// [`NO_PARENT`](crate::NO_PARENT) for roots
    pub parent_id: InstanceId,
    /// Position in the parent's child list, -1 for roots and removals
    pub index: i32,
}

/// Add or remove of a component on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompStructKind {
    Add,
    Remove,
}

/// A component was added to or removed from a node this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectStructDirty {
    pub id: InstanceId,
    pub type_id: ComponentTypeId,
    pub kind: CompStructKind,
}

/// A component's value was mutated this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectComponentDirty {
    pub id: InstanceId,
    pub type_id: ComponentTypeId,
}

/// Everything that changed in a store during one flush.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreChanges {
    /// Sorted by `order`
    pub structure: Vec<StructureOp>,
    /// Sorted by `(id, type_id)`
    pub component_structure: Vec<ObjectStructDirty>,
    /// Sorted by `(id, type_id)`; never contains a component removed this tick
    pub components: Vec<ObjectComponentDirty>,
    /// Nodes whose own replication policy changed
    pub visibility: Vec<InstanceId>,
}

impl StoreChanges {
    pub fn is_empty(&self) -> bool {
        self.structure.is_empty()
            && self.component_structure.is_empty()
            && self.components.is_empty()
            && self.visibility.is_empty()
    }
}
