//! Delta codec: payload construction and application.
//!
//! A full payload is one `Spawn` per node in parent-before-child order. A
//! delta payload transforms a baseline snapshot into a current one in three
//! ordered groups: structural ops, then component add/remove ops, then
//! component value ops. Both sides keep that order.
//!
//! Structural ops in a delta are emitted as:
//!
//! 1. `Remove` for vanished nodes, deepest first. A node whose entire
//!    baseline subtree vanished is removed as a subtree and its descendants
//!    are not listed; otherwise its surviving children are detached to root.
//! 2. `Spawn` for new nodes, shallowest first.
//! 3. `Reparent` to root for surviving nodes that became roots.
//! 4. For every parent whose child list changed, shallowest parent first,
//!    in ascending index, a `Reparent` for each child that arrives from
//!    elsewhere and a `Move` for each child the receiver would otherwise
//!    hold at a different index. The encoder replays ops 1-4 against the
//!    baseline's child lists to know which ones are needed.
//!
//! A delta names the snapshot it was computed against. It applies only to a
//! replica holding exactly that snapshot.

use crate::changes::RemoveMode;
use crate::object::NodeHeader;
use crate::protocol::from_bytes;
use crate::snapshot::Snapshot;
use crate::store::RuntimeStore;
use crate::{ComponentTypeId, InstanceId, SnapshotId, NO_PARENT};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One serialized component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentBlob {
    pub type_id: ComponentTypeId,
    pub data: Vec<u8>,
}

/// Everything needed to create a node on the receiving side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePayload {
    /// Serialized [`NodeHeader`]
    pub header: Vec<u8>,
    pub components: Vec<ComponentBlob>,
}

/// A change to the shape of the tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StructuralOp {
    #[serde(rename_all = "camelCase")]
    Spawn {
        id: InstanceId,
        parent_id: InstanceId,
        index: i32,
        data: NodePayload,
    },
    #[serde(rename_all = "camelCase")]
    Reparent {
        id: InstanceId,
        parent_id: InstanceId,
        index: i32,
    },
    #[serde(rename_all = "camelCase")]
    Move {
        id: InstanceId,
        parent_id: InstanceId,
        index: i32,
    },
    Remove { id: InstanceId, mode: RemoveMode },
}

impl StructuralOp {
    pub fn id(&self) -> InstanceId {
        match self {
            StructuralOp::Spawn { id, .. }
            | StructuralOp::Reparent { id, .. }
            | StructuralOp::Move { id, .. }
            | StructuralOp::Remove { id, .. } => *id,
        }
    }
}

/// Add or remove of a component on an existing node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ComponentStructOp {
    #[serde(rename_all = "camelCase")]
    Add {
        id: InstanceId,
        type_id: ComponentTypeId,
        data: Vec<u8>,
    },
    #[serde(rename_all = "camelCase")]
    Remove {
        id: InstanceId,
        type_id: ComponentTypeId,
    },
}

/// New value of a component on an existing node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentValueOp {
    pub id: InstanceId,
    pub type_id: ComponentTypeId,
    pub data: Vec<u8>,
}

/// The three ordered op groups of a delta.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaPayload {
    /// Snapshot the ops were computed against
    #[serde(default)]
    pub baseline_id: SnapshotId,
    /// Snapshot the ops lead to
    #[serde(default)]
    pub snapshot_id: SnapshotId,
    pub structural: Vec<StructuralOp>,
    pub component_struct: Vec<ComponentStructOp>,
    pub component_values: Vec<ComponentValueOp>,
}

impl DeltaPayload {
    pub fn is_empty(&self) -> bool {
        self.structural.is_empty()
            && self.component_struct.is_empty()
            && self.component_values.is_empty()
    }
}

// ============================================================================
// Encoding
// ============================================================================

fn node_payload(snapshot: &Snapshot, id: InstanceId) -> NodePayload {
    snapshot
        .get(id)
        .map(|node| NodePayload {
            header: node.data.clone(),
            components: node
                .components
                .iter()
                .map(|(type_id, data)| ComponentBlob {
                    type_id: *type_id,
                    data: data.clone(),
                })
                .collect(),
        })
        .unwrap_or_default()
}

fn children_map(snapshot: &Snapshot) -> HashMap<InstanceId, Vec<InstanceId>> {
    let mut map: HashMap<InstanceId, Vec<(i32, InstanceId)>> = HashMap::new();
    for (id, node) in &snapshot.nodes {
        map.entry(node.parent_id).or_default().push((node.index, *id));
    }

    map.into_iter()
        .map(|(parent, mut children)| {
            children.sort_unstable();
            (parent, children.into_iter().map(|(_, id)| id).collect())
        })
        .collect()
}

/// Child lists as the receiver holds them while it works through a delta.
struct ReplicaLists {
    parent_of: HashMap<InstanceId, InstanceId>,
    children: HashMap<InstanceId, Vec<InstanceId>>,
}

impl ReplicaLists {
    fn new(baseline: &Snapshot, children: &HashMap<InstanceId, Vec<InstanceId>>) -> Self {
        Self {
            parent_of: baseline
                .nodes
                .iter()
                .map(|(id, node)| (*id, node.parent_id))
                .collect(),
            children: children.clone(),
        }
    }

    fn parent(&self, id: InstanceId) -> InstanceId {
        self.parent_of.get(&id).copied().unwrap_or(NO_PARENT)
    }

    fn position(&self, parent: InstanceId, id: InstanceId) -> Option<usize> {
        self.children
            .get(&parent)
            .and_then(|kids| kids.iter().position(|k| *k == id))
    }

    fn unlink(&mut self, id: InstanceId) {
        let parent = self.parent(id);
        if parent != NO_PARENT {
            if let Some(kids) = self.children.get_mut(&parent) {
                kids.retain(|k| *k != id);
            }
        }
        self.parent_of.insert(id, NO_PARENT);
    }

    /// Same index rule as [`RuntimeStore::attach_child`].
    fn place(&mut self, parent: InstanceId, id: InstanceId, index: i32) {
        self.unlink(id);
        if parent == NO_PARENT {
            return;
        }

        let kids = self.children.entry(parent).or_default();
        let index = match usize::try_from(index) {
            Ok(i) if i <= kids.len() => i,
            _ => kids.len(),
        };
        kids.insert(index, id);
        self.parent_of.insert(id, parent);
    }

    fn remove(&mut self, id: InstanceId, mode: RemoveMode) {
        let former_parent = self.parent(id);
        self.unlink(id);
        self.parent_of.remove(&id);
        let kids = self.children.remove(&id).unwrap_or_default();

        match mode {
            RemoveMode::Subtree => {
                let mut stack = kids;
                while let Some(node) = stack.pop() {
                    self.parent_of.remove(&node);
                    stack.extend(self.children.remove(&node).unwrap_or_default());
                }
            }
            RemoveMode::NodeOnlyDetachChildrenToRoot => {
                for kid in kids {
                    self.parent_of.insert(kid, NO_PARENT);
                }
            }
            RemoveMode::NodeOnlyReparentChildrenToParent => {
                for kid in kids {
                    self.parent_of.insert(kid, NO_PARENT);
                    self.place(former_parent, kid, -1);
                }
            }
        }
    }
}

/// One `Spawn` per node: roots first, depth-first, each level sorted by
/// `(index, id)`.
pub fn build_full_payload(snapshot: &Snapshot) -> Vec<StructuralOp> {
    let children = children_map(snapshot);
    let mut ops = Vec::with_capacity(snapshot.len());

    let mut stack: Vec<InstanceId> = children
        .get(&NO_PARENT)
        .map(|roots| roots.iter().rev().copied().collect())
        .unwrap_or_default();

    while let Some(id) = stack.pop() {
        let Some(node) = snapshot.get(id) else {
            continue;
        };

        ops.push(StructuralOp::Spawn {
            id,
            parent_id: node.parent_id,
            index: node.index,
            data: node_payload(snapshot, id),
        });

        if let Some(kids) = children.get(&id) {
            stack.extend(kids.iter().rev().copied());
        }
    }

    ops
}

/// Compute the ops that turn `baseline` into `current`. The output depends
/// only on the two snapshots.
pub fn build_delta_payload(baseline: &Snapshot, current: &Snapshot) -> DeltaPayload {
    let mut payload = DeltaPayload {
        baseline_id: baseline.snapshot_id,
        snapshot_id: current.snapshot_id,
        ..DeltaPayload::default()
    };

    let base_children = children_map(baseline);
    let curr_children = children_map(current);
    let mut lists = ReplicaLists::new(baseline, &base_children);

    // Removals
    let mut fully_removed: HashMap<InstanceId, bool> = HashMap::new();
    for id in baseline.order.iter().rev() {
        let gone = !current.contains(*id)
            && base_children
                .get(id)
                .map(|kids| kids.iter().all(|k| fully_removed.get(k).copied().unwrap_or(false)))
                .unwrap_or(true);
        fully_removed.insert(*id, gone);
    }

    let mut removes: Vec<(u32, InstanceId, RemoveMode)> = Vec::new();
    for (id, node) in &baseline.nodes {
        if current.contains(*id) {
            continue;
        }

        let mut ancestor = node.parent_id;
        let mut covered = false;
        while let Some(ancestor_node) = baseline.get(ancestor) {
            if fully_removed.get(&ancestor).copied().unwrap_or(false) {
                covered = true;
                break;
            }
            ancestor = ancestor_node.parent_id;
        }
        if covered {
            continue;
        }

        let mode = if fully_removed.get(id).copied().unwrap_or(false) {
            RemoveMode::Subtree
        } else {
            RemoveMode::NodeOnlyDetachChildrenToRoot
        };
        removes.push((node.depth, *id, mode));
    }
    removes.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    for (_, id, mode) in removes {
        lists.remove(id, mode);
        payload.structural.push(StructuralOp::Remove { id, mode });
    }

    // Spawns
    let mut spawns: Vec<(u32, InstanceId)> = current
        .nodes
        .iter()
        .filter(|(id, _)| !baseline.contains(**id))
        .map(|(id, node)| (node.depth, *id))
        .collect();
    spawns.sort_unstable();
    for (_, id) in &spawns {
        if let Some(node) = current.get(*id) {
            lists.place(node.parent_id, *id, node.index);
            payload.structural.push(StructuralOp::Spawn {
                id: *id,
                parent_id: node.parent_id,
                index: node.index,
                data: node_payload(current, *id),
            });
        }
    }

    // Survivors that became roots
    for (id, node) in &current.nodes {
        if node.parent_id != NO_PARENT {
            continue;
        }
        if baseline.contains(*id) && lists.parent(*id) != NO_PARENT {
            lists.unlink(*id);
            payload.structural.push(StructuralOp::Reparent {
                id: *id,
                parent_id: NO_PARENT,
                index: node.index,
            });
        }
    }

    // Restate changed child lists, shallowest parent first
    let empty = Vec::new();
    let mut changed_parents: Vec<(u32, InstanceId)> = curr_children
        .iter()
        .filter(|(parent, _)| **parent != NO_PARENT)
        .filter(|(parent, kids)| base_children.get(*parent).unwrap_or(&empty) != *kids)
        .filter_map(|(parent, _)| current.get(*parent).map(|p| (p.depth, *parent)))
        .collect();
    changed_parents.sort_unstable();

    for (_, parent) in changed_parents {
        let Some(kids) = curr_children.get(&parent) else {
            continue;
        };
        for (index, child) in kids.iter().enumerate() {
            let op = if lists.parent(*child) != parent {
                StructuralOp::Reparent {
                    id: *child,
                    parent_id: parent,
                    index: index as i32,
                }
            } else if lists.position(parent, *child) != Some(index) {
                StructuralOp::Move {
                    id: *child,
                    parent_id: parent,
                    index: index as i32,
                }
            } else {
                continue;
            };
            lists.place(parent, *child, index as i32);
            payload.structural.push(op);
        }
    }

    // Components of surviving nodes
    for (id, node) in &current.nodes {
        let Some(old) = baseline.get(*id) else {
            continue;
        };

        for (type_id, data) in &node.components {
            match old.components.get(type_id) {
                None => payload.component_struct.push(ComponentStructOp::Add {
                    id: *id,
                    type_id: *type_id,
                    data: data.clone(),
                }),
                Some(previous) if previous != data => {
                    payload.component_values.push(ComponentValueOp {
                        id: *id,
                        type_id: *type_id,
                        data: data.clone(),
                    })
                }
                Some(_) => {}
            }
        }

        for type_id in old.components.keys() {
            if !node.components.contains_key(type_id) {
                payload.component_struct.push(ComponentStructOp::Remove {
                    id: *id,
                    type_id: *type_id,
                });
            }
        }
    }
    payload.component_struct.sort_by_key(|op| match op {
        ComponentStructOp::Add { id, type_id, .. } | ComponentStructOp::Remove { id, type_id } => {
            (*id, *type_id)
        }
    });

    payload
}

// ============================================================================
// Application
// ============================================================================

/// Replace the contents of `store` with the full payload of `snapshot_id`.
///
/// Spawns whose parent has not arrived yet are retried in further passes,
/// up to `max_passes`. Returns false if any spawn could not be applied, in
/// which case the store holds no snapshot and only another full payload
/// can bring it back.
pub fn apply_full(
    store: &mut RuntimeStore,
    snapshot_id: SnapshotId,
    spawns: &[StructuralOp],
    max_passes: usize,
) -> bool {
    store.clear();

    let mut pending: Vec<&StructuralOp> = spawns.iter().collect();
    let mut passes = 0;
    while !pending.is_empty() && passes < max_passes.max(1) {
        passes += 1;
        let before = pending.len();
        let mut deferred = Vec::new();

        for op in pending {
            let StructuralOp::Spawn {
                id,
                parent_id,
                index,
                data,
            } = op
            else {
                tracing::warn!(
                    target: "arbor::snap",
                    store = %store.id(),
                    id = op.id(),
                    "full payload contains a non-spawn op"
                );
                return false;
            };

            if *parent_id != NO_PARENT && !store.contains(*parent_id) {
                deferred.push(op);
                continue;
            }

            if !apply_spawn(store, *id, *parent_id, *index, data) {
                return false;
            }
        }

        pending = deferred;
        if pending.len() == before {
            break;
        }
    }

    if !pending.is_empty() {
        tracing::warn!(
            target: "arbor::snap",
            store = %store.id(),
            unresolved = pending.len(),
            passes,
            "full payload left spawns without a parent"
        );
        return false;
    }

    store.set_replica_snapshot(Some(snapshot_id));
    true
}

/// Apply a delta to `store`.
///
/// The store must hold the delta's baseline snapshot; anything else is
/// rejected untouched. A store already at the delta's target snapshot
/// accepts it as a no-op. Otherwise ops run in order and stop at the first
/// one that cannot be applied. Ops before it stay applied, and the store
/// is marked as holding no snapshot, so only a full payload is accepted
/// afterwards.
pub fn apply_delta(store: &mut RuntimeStore, payload: &DeltaPayload) -> bool {
    let held = store.replica_snapshot();
    if held != Some(payload.baseline_id) {
        if held == Some(payload.snapshot_id) {
            return true;
        }
        tracing::warn!(
            target: "arbor::snap",
            store = %store.id(),
            held = ?held,
            baseline = payload.baseline_id,
            "delta baseline mismatch"
        );
        return false;
    }

    let applied = apply_ops(store, payload);
    store.set_replica_snapshot(applied.then_some(payload.snapshot_id));
    applied
}

fn apply_ops(store: &mut RuntimeStore, payload: &DeltaPayload) -> bool {
    for op in &payload.structural {
        if !apply_structural(store, op) {
            tracing::warn!(
                target: "arbor::snap",
                store = %store.id(),
                op = op_name(op),
                id = op.id(),
                "structural op failed"
            );
            return false;
        }
    }

    for op in &payload.component_struct {
        let ok = match op {
            ComponentStructOp::Add { id, type_id, data } => {
                apply_component(store, *id, *type_id, data)
            }
            ComponentStructOp::Remove { id, type_id } => match store.try_take_rw(*id) {
                Some(object) => {
                    object.remove_by_type_id(*type_id);
                    true
                }
                None => false,
            },
        };
        if !ok {
            tracing::warn!(
                target: "arbor::snap",
                store = %store.id(),
                ?op,
                "component struct op failed"
            );
            return false;
        }
    }

    for op in &payload.component_values {
        if !apply_component(store, op.id, op.type_id, &op.data) {
            tracing::warn!(
                target: "arbor::snap",
                store = %store.id(),
                id = op.id,
                type_id = op.type_id,
                "component value op failed"
            );
            return false;
        }
    }

    true
}

fn op_name(op: &StructuralOp) -> &'static str {
    match op {
        StructuralOp::Spawn { .. } => "spawn",
        StructuralOp::Reparent { .. } => "reparent",
        StructuralOp::Move { .. } => "move",
        StructuralOp::Remove { .. } => "remove",
    }
}

fn apply_structural(store: &mut RuntimeStore, op: &StructuralOp) -> bool {
    match op {
        StructuralOp::Spawn {
            id,
            parent_id,
            index,
            data,
        } => {
            if *parent_id != NO_PARENT && !store.contains(*parent_id) {
                return false;
            }
            apply_spawn(store, *id, *parent_id, *index, data)
        }
        StructuralOp::Reparent {
            id,
            parent_id,
            index,
        } => {
            if !store.contains(*id) || (*parent_id != NO_PARENT && !store.contains(*parent_id)) {
                return false;
            }
            place(store, *id, *parent_id, *index)
        }
        StructuralOp::Move {
            id,
            parent_id,
            index,
        } => {
            if *parent_id == NO_PARENT {
                return store.is_root(*id);
            }
            store.move_child(*parent_id, *id, *index)
        }
        StructuralOp::Remove { id, mode } => !store.contains(*id) || store.remove(*id, *mode),
    }
}

/// Create or reset `id` from a node payload and put it in place.
fn apply_spawn(
    store: &mut RuntimeStore,
    id: InstanceId,
    parent_id: InstanceId,
    index: i32,
    data: &NodePayload,
) -> bool {
    let header: NodeHeader = match from_bytes(&data.header) {
        Ok(header) => header,
        Err(e) => {
            tracing::warn!(target: "arbor::snap", store = %store.id(), id, "bad node header: {}", e);
            return false;
        }
    };

    store.upsert_replica(id, header);
    for blob in &data.components {
        if !apply_component(store, id, blob.type_id, &blob.data) {
            return false;
        }
    }

    place(store, id, parent_id, index)
}

/// Decode and set one component. Unknown type ids are skipped.
fn apply_component(
    store: &mut RuntimeStore,
    id: InstanceId,
    type_id: ComponentTypeId,
    data: &[u8],
) -> bool {
    if !store.contains(id) {
        return false;
    }

    let value = match store.registry().decode(type_id, data) {
        Ok(Some(value)) => value,
        Ok(None) => {
            tracing::debug!(
                target: "arbor::snap",
                store = %store.id(),
                id,
                type_id,
                "skipping unknown component type"
            );
            return true;
        }
        Err(e) => {
            tracing::warn!(
                target: "arbor::snap",
                store = %store.id(),
                id,
                type_id,
                "component decode failed: {}",
                e
            );
            return false;
        }
    };

    match store.try_take_rw(id) {
        Some(object) => object.add_or_replace_by_id(type_id, value).is_ok(),
        None => false,
    }
}

/// Put `id` under `parent_id` at `index`, or make it a root.
fn place(store: &mut RuntimeStore, id: InstanceId, parent_id: InstanceId, index: i32) -> bool {
    if parent_id == NO_PARENT {
        return match store.parent_of(id) {
            Some(_) => store.detach_child(id),
            None => store.publish_root_existing(id),
        };
    }

    if store.parent_of(id) == Some(parent_id) {
        store.move_child(parent_id, id, index)
    } else {
        store.attach_child(parent_id, id, index)
    }
}
