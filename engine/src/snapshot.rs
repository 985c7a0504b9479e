//! Snapshot - a point-in-time projection of a store.
//!
//! A snapshot maps every visible published node to its parent, its index
//! among visible siblings, its serialized header and its serialized
//! components. Unpublished nodes never appear. Maps are `BTreeMap`s so that
//! everything derived from a snapshot is deterministic.

use crate::component::{ReplicationMask, SnapshotFilter};
use crate::object::RuntimeObject;
use crate::protocol::to_bytes;
use crate::store::RuntimeStore;
use crate::{error::Result, ComponentTypeId, Error, InstanceId, SnapshotId, StoreId, NO_PARENT};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Deepest nesting a snapshot will descend into.
pub const MAX_SNAPSHOT_DEPTH: u32 = 2048;

/// One node of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotNode {
    pub parent_id: InstanceId,
    /// Position among visible siblings
    pub index: i32,
    /// Distance from the root; roots are 0
    pub depth: u32,
    /// Serialized [`NodeHeader`](crate::NodeHeader)
    pub data: Vec<u8>,
    /// Serialized components by type id
    pub components: BTreeMap<ComponentTypeId, Vec<u8>>,
}

/// A point-in-time projection of a store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub store_id: StoreId,
    /// Id assigned by the replication server; 0 until stamped
    #[serde(default)]
    pub snapshot_id: SnapshotId,
    pub nodes: BTreeMap<InstanceId, SnapshotNode>,
    /// Node ids in depth-first preorder
    pub order: Vec<InstanceId>,
}

/// Structural signature of one node, used to compare replicas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSignature {
    pub id: InstanceId,
    pub parent_id: InstanceId,
    pub index: i32,
    pub data: Vec<u8>,
    pub components: BTreeMap<ComponentTypeId, Vec<u8>>,
}

impl Snapshot {
    pub fn new(store_id: impl Into<StoreId>) -> Self {
        Self {
            store_id: store_id.into(),
            snapshot_id: 0,
            nodes: BTreeMap::new(),
            order: Vec::new(),
        }
    }

    /// Stamp the snapshot with the id it is sent under.
    pub fn with_id(mut self, snapshot_id: SnapshotId) -> Self {
        self.snapshot_id = snapshot_id;
        self
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: InstanceId) -> Option<&SnapshotNode> {
        self.nodes.get(&id)
    }

    pub fn contains(&self, id: InstanceId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Children of `parent_id` (or roots, for [`NO_PARENT`]) sorted by
    /// `(index, id)`.
    pub fn children_of(&self, parent_id: InstanceId) -> Vec<InstanceId> {
        let mut children: Vec<_> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.parent_id == parent_id)
            .map(|(id, node)| (node.index, *id))
            .collect();
        children.sort_unstable();
        children.into_iter().map(|(_, id)| id).collect()
    }

    /// Per-node signatures sorted by id.
    pub fn signature(&self) -> Vec<NodeSignature> {
        self.nodes
            .iter()
            .map(|(id, node)| NodeSignature {
                id: *id,
                parent_id: node.parent_id,
                index: node.index,
                data: node.data.clone(),
                components: node.components.clone(),
            })
            .collect()
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Deserialization(e.to_string()))
    }
}

/// Build a snapshot of `store` as seen through `filter`.
///
/// Roots are visited in ascending id order and children in stored order. A
/// node whose own policy is not admitted hides its whole subtree. Node
/// visibility considers only the owner and profile of the filter; the
/// snapshot/delta mask splits components, not nodes.
pub fn build_snapshot(store: &RuntimeStore, filter: &SnapshotFilter) -> Result<Snapshot> {
    let node_filter = SnapshotFilter {
        mask: ReplicationMask::all(),
        ..*filter
    };
    let visible = |id: InstanceId| {
        store
            .try_take_ro(id)
            .is_some_and(|o| o.policy().admits(&node_filter))
    };

    let mut snapshot = Snapshot::new(store.id());
    let roots: Vec<_> = store.roots().filter(|id| visible(*id)).collect();
    let mut stack: Vec<(InstanceId, InstanceId, i32, u32)> = roots
        .iter()
        .enumerate()
        .rev()
        .map(|(i, id)| (*id, NO_PARENT, i as i32, 0))
        .collect();

    while let Some((id, parent_id, index, depth)) = stack.pop() {
        let Some(object) = store.try_take_ro(id) else {
            continue;
        };

        if depth > MAX_SNAPSHOT_DEPTH {
            tracing::warn!(
                target: "arbor::snap",
                store = %store.id(),
                id,
                "snapshot depth limit reached, subtree skipped"
            );
            continue;
        }

        let node = encode_node(store, object, parent_id, index, depth, filter)?;
        snapshot.order.push(id);
        snapshot.nodes.insert(id, node);

        let children: Vec<_> = store
            .children(id)
            .iter()
            .copied()
            .filter(|c| visible(*c))
            .collect();
        for (i, child) in children.iter().enumerate().rev() {
            stack.push((*child, id, i as i32, depth + 1));
        }
    }

    Ok(snapshot)
}

fn encode_node(
    store: &RuntimeStore,
    object: &RuntimeObject,
    parent_id: InstanceId,
    index: i32,
    depth: u32,
    filter: &SnapshotFilter,
) -> Result<SnapshotNode> {
    let mut components = BTreeMap::new();
    for (type_id, component) in object.components() {
        if component.policy().admits(filter) {
            components.insert(type_id, store.registry().encode(type_id, component)?);
        }
    }

    Ok(SnapshotNode {
        parent_id,
        index,
        depth,
        data: to_bytes(object.header())?,
        components,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ReplicationPolicy;
    use crate::registry::tests::{test_registry, Health, Secret, Transform};

    fn test_store() -> RuntimeStore {
        RuntimeStore::new("world", test_registry())
    }

    #[test]
    fn preorder_with_stored_child_order() {
        let mut store = test_store();
        let a = store.create();
        let b = store.create_child(a, -1);
        let c = store.create_child(a, 0);
        let d = store.create_child(b, -1);
        let e = store.create();

        let snapshot = build_snapshot(&store, &SnapshotFilter::full()).unwrap();
        assert_eq!(snapshot.order, vec![a, c, b, d, e]);
        assert_eq!(snapshot.get(c).unwrap().index, 0);
        assert_eq!(snapshot.get(b).unwrap().index, 1);
        assert_eq!(snapshot.get(d).unwrap().depth, 2);
        assert_eq!(snapshot.get(e).unwrap().parent_id, NO_PARENT);
        assert_eq!(snapshot.children_of(a), vec![c, b]);
    }

    #[test]
    fn unpublished_nodes_are_skipped() {
        let mut store = test_store();
        store.create_detached();
        let a = store.create();

        let snapshot = build_snapshot(&store, &SnapshotFilter::full()).unwrap();
        assert_eq!(snapshot.order, vec![a]);
    }

    #[test]
    fn hidden_node_hides_subtree_and_shifts_indices() {
        let mut store = test_store();
        let a = store.create();
        let hidden = store.create_child(a, -1);
        store.create_child(hidden, -1);
        let shown = store.create_child(a, -1);

        store
            .try_take_rw(hidden)
            .unwrap()
            .set_policy(ReplicationPolicy::owned_by(9));

        let snapshot = build_snapshot(&store, &SnapshotFilter::delta().for_connection(1)).unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.get(shown).unwrap().index, 0);

        let owner = build_snapshot(&store, &SnapshotFilter::delta().for_connection(9)).unwrap();
        assert_eq!(owner.len(), 4);
        assert_eq!(owner.get(shown).unwrap().index, 1);
    }

    #[test]
    fn component_filters_apply() {
        let mut store = test_store();
        let a = store.create();
        let object = store.try_take_rw(a).unwrap();
        object.add_or_replace(Transform { cell: (1, 2) }).unwrap();
        object
            .add_or_replace(Secret {
                owner: 3,
                code: "x".into(),
            })
            .unwrap();

        let registry = test_registry();
        let secret = registry.id_of::<Secret>().unwrap();

        let others = build_snapshot(&store, &SnapshotFilter::full().for_connection(2)).unwrap();
        assert_eq!(others.get(a).unwrap().components.len(), 1);

        let owner = build_snapshot(&store, &SnapshotFilter::full().for_connection(3)).unwrap();
        assert!(owner.get(a).unwrap().components.contains_key(&secret));
    }

    #[test]
    fn deterministic_and_json_stable() {
        let mut store = test_store();
        for _ in 0..4 {
            let root = store.create();
            let child = store.create_child(root, -1);
            store
                .try_take_rw(child)
                .unwrap()
                .add_or_replace(Health { hp: child as u32 })
                .unwrap();
        }

        let first = build_snapshot(&store, &SnapshotFilter::delta()).unwrap();
        let second = build_snapshot(&store, &SnapshotFilter::delta()).unwrap();
        assert_eq!(first.to_json().unwrap(), second.to_json().unwrap());
        assert_eq!(Snapshot::from_json(&first.to_json().unwrap()).unwrap(), first);
        assert_eq!(first.signature(), second.signature());
    }
}
