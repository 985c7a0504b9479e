//! Store - the forest of runtime objects.
//!
//! The store owns every [`RuntimeObject`] it creates, the parent/child
//! indices that shape them into a forest, and the entity-link table. All
//! structural mutations return `bool` and never partially apply.
//!
//! Mutations are recorded as they happen and handed out once per tick by
//! [`RuntimeStore::tick`], sorted and de-duplicated, to the host and to any
//! registered change listeners.

use crate::changes::{
    ObjectComponentDirty, ObjectStructDirty, RemoveMode, StoreChanges, StructureOp,
    StructureOpKind,
};
use crate::object::{NodeHeader, RuntimeObject};
use crate::registry::ComponentRegistry;
use crate::{InstanceId, SnapshotId, StoreId, NO_PARENT};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Upper bound on parent-link hops before a chain is treated as corrupt.
const MAX_ANCESTOR_HOPS: usize = 1024;

/// Callback invoked with each flushed batch of changes.
pub type ChangeListener = Box<dyn FnMut(&mut RuntimeStore, &StoreChanges) + Send>;

/// Handle of the host-side entity a node is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityLink {
    pub index: u32,
    pub generation: u32,
}

impl EntityLink {
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }
}

/// Outcome of a successful [`RuntimeStore::remove_linked`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removal {
    /// The removed node followed by any removed descendants
    pub removed: Vec<InstanceId>,
    /// Entity that was linked to the removed node
    pub entity: Option<EntityLink>,
}

#[derive(Debug, Default, Clone, Copy)]
struct FlushState {
    scheduled: bool,
    in_progress: bool,
    reschedule_requested: bool,
}

/// A forest of runtime objects.
pub struct RuntimeStore {
    id: StoreId,
    registry: Arc<ComponentRegistry>,
    /// Every live node, published or not
    all: HashMap<InstanceId, RuntimeObject>,
    /// Published roots
    roots: BTreeSet<InstanceId>,
    parent_by_child: HashMap<InstanceId, InstanceId>,
    children_by_parent: HashMap<InstanceId, Vec<InstanceId>>,
    entities: HashMap<InstanceId, EntityLink>,
    last_id: InstanceId,
    /// Snapshot this replica was last brought to by a payload
    replica_snapshot: Option<SnapshotId>,
    last_order: u64,
    pending: Vec<StructureOp>,
    touched: BTreeSet<InstanceId>,
    flush: FlushState,
    listeners: Vec<ChangeListener>,
}

impl fmt::Debug for RuntimeStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeStore")
            .field("id", &self.id)
            .field("objects", &self.all.len())
            .field("roots", &self.roots)
            .field("last_id", &self.last_id)
            .field("replica_snapshot", &self.replica_snapshot)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl RuntimeStore {
    /// Create an empty store.
    pub fn new(id: impl Into<StoreId>, registry: Arc<ComponentRegistry>) -> Self {
        Self {
            id: id.into(),
            registry,
            all: HashMap::new(),
            roots: BTreeSet::new(),
            parent_by_child: HashMap::new(),
            children_by_parent: HashMap::new(),
            entities: HashMap::new(),
            last_id: 0,
            replica_snapshot: None,
            last_order: 0,
            pending: Vec::new(),
            touched: BTreeSet::new(),
            flush: FlushState::default(),
            listeners: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.registry
    }

    /// Number of live nodes, published or not.
    pub fn len(&self) -> usize {
        self.all.len()
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }

    pub fn contains(&self, id: InstanceId) -> bool {
        self.all.contains_key(&id)
    }

    /// A node is published once it is a root or has a parent.
    pub fn is_published(&self, id: InstanceId) -> bool {
        self.roots.contains(&id) || self.parent_by_child.contains_key(&id)
    }

    pub fn is_root(&self, id: InstanceId) -> bool {
        self.roots.contains(&id)
    }

    /// Snapshot id whose state this replica holds, if a payload put it
    /// there. Cleared by [`clear`](Self::clear) and by a failed apply.
    pub fn replica_snapshot(&self) -> Option<SnapshotId> {
        self.replica_snapshot
    }

    pub(crate) fn set_replica_snapshot(&mut self, snapshot_id: Option<SnapshotId>) {
        self.replica_snapshot = snapshot_id;
    }

    /// Highest id handed out or adopted so far.
    pub fn last_id(&self) -> InstanceId {
        self.last_id
    }

    // ========================================================================
    // Creation
    // ========================================================================

    /// Create a node and publish it as a root.
    pub fn create(&mut self) -> InstanceId {
        let id = self.create_detached();
        self.roots.insert(id);
        self.record(StructureOpKind::Spawn, id, NO_PARENT, -1);
        self.touch(id);
        id
    }

    /// Create a node under `parent_id`. `insert_index` of -1 (or out of
    /// range) appends. If the parent does not exist the node is left detached.
    pub fn create_child(&mut self, parent_id: InstanceId, insert_index: i32) -> InstanceId {
        let id = self.create_detached();
        if !self.attach_child(parent_id, id, insert_index) {
            tracing::debug!(
                target: "arbor::store",
                store = %self.id,
                parent = parent_id,
                child = id,
                "create_child left node detached"
            );
        }
        id
    }

    /// Create a node that is neither a root nor attached.
    pub fn create_detached(&mut self) -> InstanceId {
        self.last_id += 1;
        let id = self.last_id;
        self.all.insert(
            id,
            RuntimeObject::new(id, self.id.clone(), Arc::clone(&self.registry)),
        );
        id
    }

    /// Publish a detached node as a root.
    pub fn publish_root_existing(&mut self, id: InstanceId) -> bool {
        if !self.all.contains_key(&id) || self.parent_by_child.contains_key(&id) {
            return false;
        }

        if self.roots.insert(id) {
            self.record(StructureOpKind::Spawn, id, NO_PARENT, -1);
            self.touch(id);
        }
        true
    }

    /// Create or reset a node under a server-assigned id. The id is adopted
    /// verbatim and `last_id` moves past it. An existing node keeps its place
    /// in the tree but loses its components.
    pub fn upsert_replica(&mut self, id: InstanceId, header: NodeHeader) -> &mut RuntimeObject {
        if id > self.last_id {
            self.last_id = id;
        }
        self.touch(id);

        let registry = Arc::clone(&self.registry);
        let store_id = self.id.clone();
        let object = self
            .all
            .entry(id)
            .or_insert_with(|| RuntimeObject::new(id, store_id, registry));
        object.reset(header);
        object
    }

    // ========================================================================
    // Structure
    // ========================================================================

    /// Attach `child_id` under `parent_id` at `insert_index` (-1 appends).
    ///
    /// Fails on self-parenting, unknown ids, or when `child_id` is an
    /// ancestor of `parent_id`. The child leaves its previous position first.
    pub fn attach_child(
        &mut self,
        parent_id: InstanceId,
        child_id: InstanceId,
        insert_index: i32,
    ) -> bool {
        if parent_id == child_id
            || !self.all.contains_key(&parent_id)
            || !self.all.contains_key(&child_id)
        {
            return false;
        }

        if self.is_ancestor_or_corrupt(child_id, parent_id) {
            tracing::debug!(
                target: "arbor::store",
                store = %self.id,
                parent = parent_id,
                child = child_id,
                "attach rejected: would create cycle"
            );
            return false;
        }

        let was_published = self.is_published(child_id);
        self.unlink(child_id);

        let children = self.children_by_parent.entry(parent_id).or_default();
        let index = match usize::try_from(insert_index) {
            Ok(i) if i <= children.len() => i,
            _ => children.len(),
        };
        children.insert(index, child_id);
        self.parent_by_child.insert(child_id, parent_id);

        let kind = if was_published {
            StructureOpKind::Reparent
        } else {
            StructureOpKind::Spawn
        };
        self.record(kind, child_id, parent_id, index as i32);
        self.touch(child_id);
        true
    }

    /// Move a child within its parent's list. `new_index` is clamped; moving
    /// to the current index succeeds without recording anything.
    pub fn move_child(&mut self, parent_id: InstanceId, child_id: InstanceId, new_index: i32) -> bool {
        if self.parent_by_child.get(&child_id) != Some(&parent_id) {
            return false;
        }

        let Some(children) = self.children_by_parent.get_mut(&parent_id) else {
            return false;
        };
        let Some(current) = children.iter().position(|c| *c == child_id) else {
            return false;
        };

        let target = new_index.clamp(0, children.len() as i32 - 1) as usize;
        if target == current {
            return true;
        }

        children.remove(current);
        children.insert(target, child_id);
        self.record(StructureOpKind::Move, child_id, parent_id, target as i32);
        self.touch(child_id);
        true
    }

    /// Detach a child from its parent and publish it as a root.
    pub fn detach_child(&mut self, child_id: InstanceId) -> bool {
        let Some(parent_id) = self.parent_by_child.get(&child_id).copied() else {
            return false;
        };

        self.unlink(child_id);
        self.roots.insert(child_id);
        self.record(StructureOpKind::Reparent, child_id, NO_PARENT, -1);
        self.touch(child_id);
        self.touch(parent_id);
        true
    }

    /// Remove a node. See [`RemoveMode`] for what happens to its children.
    pub fn remove(&mut self, id: InstanceId, mode: RemoveMode) -> bool {
        self.remove_linked(id, mode).is_some()
    }

    /// Remove a node, returning what was removed and the entity it was
    /// linked to. Records exactly one `Remove` op, for `id` only.
    pub fn remove_linked(&mut self, id: InstanceId, mode: RemoveMode) -> Option<Removal> {
        if !self.all.contains_key(&id) {
            return None;
        }

        let former_parent = self.parent_by_child.get(&id).copied();
        self.unlink(id);

        let children = self.children_by_parent.remove(&id).unwrap_or_default();
        for child in &children {
            self.parent_by_child.remove(child);
        }

        let mut removed = vec![id];
        match mode {
            RemoveMode::Subtree => {
                let mut stack = children;
                while let Some(node) = stack.pop() {
                    if let Some(grandchildren) = self.children_by_parent.remove(&node) {
                        for g in &grandchildren {
                            self.parent_by_child.remove(g);
                        }
                        stack.extend(grandchildren);
                    }
                    self.destroy(node);
                    removed.push(node);
                }
            }
            RemoveMode::NodeOnlyDetachChildrenToRoot => {
                for child in children {
                    self.roots.insert(child);
                    self.touch(child);
                }
            }
            RemoveMode::NodeOnlyReparentChildrenToParent => match former_parent {
                Some(parent) => {
                    for child in children {
                        self.children_by_parent.entry(parent).or_default().push(child);
                        self.parent_by_child.insert(child, parent);
                        self.touch(child);
                    }
                }
                None => {
                    for child in children {
                        self.roots.insert(child);
                        self.touch(child);
                    }
                }
            },
        }

        let entity = self.entities.get(&id).copied();
        self.destroy(id);
        self.record(
            StructureOpKind::Remove(mode),
            id,
            former_parent.unwrap_or(NO_PARENT),
            -1,
        );
        if let Some(parent) = former_parent {
            self.touch(parent);
        }

        Some(Removal { removed, entity })
    }

    /// Remove every node.
    pub fn clear(&mut self) {
        self.replica_snapshot = None;
        let roots: Vec<_> = self.roots.iter().copied().collect();
        for root in roots {
            self.remove(root, RemoveMode::Subtree);
        }

        let mut rest: Vec<_> = self.all.keys().copied().collect();
        rest.sort_unstable();
        for id in rest {
            if self.all.contains_key(&id) {
                self.remove(id, RemoveMode::Subtree);
            }
        }
    }

    // ========================================================================
    // Access
    // ========================================================================

    /// Look up a node without side effects.
    pub fn try_take_ro(&self, id: InstanceId) -> Option<&RuntimeObject> {
        self.all.get(&id)
    }

    /// Look up a node for mutation. Marks the node and its root touched so
    /// its dirty state is collected on the next flush.
    pub fn try_take_rw(&mut self, id: InstanceId) -> Option<&mut RuntimeObject> {
        if !self.all.contains_key(&id) {
            return None;
        }
        self.touch(id);
        self.all.get_mut(&id)
    }

    pub fn take_parent_ro(&self, id: InstanceId) -> Option<&RuntimeObject> {
        self.parent_of(id).and_then(|p| self.all.get(&p))
    }

    pub fn take_parent_rw(&mut self, id: InstanceId) -> Option<&mut RuntimeObject> {
        let parent = self.parent_of(id)?;
        self.try_take_rw(parent)
    }

    pub fn parent_of(&self, id: InstanceId) -> Option<InstanceId> {
        self.parent_by_child.get(&id).copied()
    }

    /// Children of `id` in stored order.
    pub fn children(&self, id: InstanceId) -> &[InstanceId] {
        self.children_by_parent
            .get(&id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Published roots in ascending id order.
    pub fn roots(&self) -> impl Iterator<Item = InstanceId> + '_ {
        self.roots.iter().copied()
    }

    /// Ids of every live node, in no particular order.
    pub fn ids(&self) -> impl Iterator<Item = InstanceId> + '_ {
        self.all.keys().copied()
    }

    /// Topmost ancestor of `id`, walking at most 1024 parent links.
    pub fn root_of(&self, id: InstanceId) -> InstanceId {
        let mut current = id;
        for _ in 0..MAX_ANCESTOR_HOPS {
            match self.parent_by_child.get(&current) {
                Some(parent) => current = *parent,
                None => break,
            }
        }
        current
    }

    // ========================================================================
    // Entity links
    // ========================================================================

    /// Bind a node to a host entity. Fails for unknown nodes.
    pub fn link_entity(&mut self, id: InstanceId, entity: EntityLink) -> bool {
        if !self.all.contains_key(&id) {
            return false;
        }
        self.entities.insert(id, entity);
        true
    }

    pub fn unlink_entity(&mut self, id: InstanceId) -> Option<EntityLink> {
        self.entities.remove(&id)
    }

    pub fn entity(&self, id: InstanceId) -> Option<EntityLink> {
        self.entities.get(&id).copied()
    }

    // ========================================================================
    // Flush
    // ========================================================================

    /// Register a listener called with every flushed batch. The listener may
    /// mutate the store; such mutations are flushed once more in the same
    /// tick.
    pub fn on_changes<F>(&mut self, listener: F)
    where
        F: FnMut(&mut RuntimeStore, &StoreChanges) + Send + 'static,
    {
        self.listeners.push(Box::new(listener));
    }

    /// Whether a flush is pending.
    pub fn is_flush_scheduled(&self) -> bool {
        self.flush.scheduled || self.flush.reschedule_requested
    }

    /// Run the scheduled flush, if any. Mutations made by listeners during the
    /// flush trigger exactly one more flush; anything after that waits for
    /// the next tick.
    pub fn tick(&mut self) -> Vec<StoreChanges> {
        let mut batches = Vec::new();
        if !self.is_flush_scheduled() {
            return batches;
        }

        batches.extend(self.run_flush());
        if std::mem::take(&mut self.flush.reschedule_requested) {
            batches.extend(self.run_flush());
            if std::mem::take(&mut self.flush.reschedule_requested) {
                self.flush.scheduled = true;
            }
        }

        batches
    }

    /// Flush now regardless of scheduling.
    pub fn flush(&mut self) -> Option<StoreChanges> {
        let changes = self.run_flush();
        if std::mem::take(&mut self.flush.reschedule_requested) {
            self.flush.scheduled = true;
        }
        changes
    }

    fn run_flush(&mut self) -> Option<StoreChanges> {
        self.flush.scheduled = false;
        self.flush.in_progress = true;

        let changes = self.collect_changes();
        let result = if changes.is_empty() {
            None
        } else {
            tracing::trace!(
                target: "arbor::store",
                store = %self.id,
                structure = changes.structure.len(),
                comp_struct = changes.component_structure.len(),
                comp_values = changes.components.len(),
                "flush"
            );

            let mut listeners = std::mem::take(&mut self.listeners);
            for listener in listeners.iter_mut() {
                listener(self, &changes);
            }
            listeners.append(&mut self.listeners);
            self.listeners = listeners;
            Some(changes)
        };

        self.flush.in_progress = false;
        result
    }

    fn collect_changes(&mut self) -> StoreChanges {
        let mut structure = std::mem::take(&mut self.pending);
        structure.sort_by_key(|op| op.order);

        let mut changes = StoreChanges {
            structure,
            ..StoreChanges::default()
        };

        for id in std::mem::take(&mut self.touched) {
            let Some(object) = self.all.get_mut(&id) else {
                continue;
            };

            let dirt = object.drain_dirty();
            changes.component_structure.extend(
                dirt.structure
                    .into_iter()
                    .map(|(type_id, kind)| ObjectStructDirty { id, type_id, kind }),
            );
            changes.components.extend(
                dirt.values
                    .into_iter()
                    .map(|type_id| ObjectComponentDirty { id, type_id }),
            );
            if dirt.visibility {
                changes.visibility.push(id);
            }
        }

        changes.component_structure.sort_by_key(|c| (c.id, c.type_id));
        changes.components.sort_by_key(|c| (c.id, c.type_id));
        changes
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn schedule(&mut self) {
        if self.flush.in_progress {
            self.flush.reschedule_requested = true;
        } else {
            self.flush.scheduled = true;
        }
    }

    fn touch(&mut self, id: InstanceId) {
        let root = self.root_of(id);
        self.touched.insert(id);
        self.touched.insert(root);
        self.schedule();
    }

    fn record(&mut self, kind: StructureOpKind, id: InstanceId, parent_id: InstanceId, index: i32) {
        self.last_order += 1;
        self.pending.push(StructureOp {
            order: self.last_order,
            kind,
            id,
            parent_id,
            index,
        });
        self.schedule();
    }

    /// Take `id` out of its parent's child list or the root set.
    fn unlink(&mut self, id: InstanceId) {
        self.roots.remove(&id);
        let Some(parent) = self.parent_by_child.remove(&id) else {
            return;
        };

        if let Some(children) = self.children_by_parent.get_mut(&parent) {
            children.retain(|c| *c != id);
            if children.is_empty() {
                self.children_by_parent.remove(&parent);
            }
        }
    }

    /// Whether `candidate` is `node` or one of its ancestors. A parent chain
    /// that loops or exceeds the hop limit counts as a match.
    fn is_ancestor_or_corrupt(&self, candidate: InstanceId, node: InstanceId) -> bool {
        let mut visited = HashSet::new();
        let mut current = node;
        loop {
            if current == candidate {
                return true;
            }
            match self.parent_by_child.get(&current) {
                None => return false,
                Some(parent) => {
                    if !visited.insert(*parent) || visited.len() > MAX_ANCESTOR_HOPS {
                        return true;
                    }
                    current = *parent;
                }
            }
        }
    }

    fn destroy(&mut self, id: InstanceId) {
        if let Some(mut object) = self.all.remove(&id) {
            object.destroy();
        }
        self.entities.remove(&id);
        self.touched.remove(&id);
    }
}

/// Lookup of stores by id, implemented by whatever container the host keeps
/// its stores in.
pub trait StoreProvider {
    fn store(&self, id: &str) -> Option<&RuntimeStore>;
    fn store_mut(&mut self, id: &str) -> Option<&mut RuntimeStore>;
    /// Ids of every provided store, sorted.
    fn store_ids(&self) -> Vec<StoreId>;
}

impl StoreProvider for HashMap<StoreId, RuntimeStore> {
    fn store(&self, id: &str) -> Option<&RuntimeStore> {
        self.get(id)
    }

    fn store_mut(&mut self, id: &str) -> Option<&mut RuntimeStore> {
        self.get_mut(id)
    }

    fn store_ids(&self) -> Vec<StoreId> {
        let mut ids: Vec<_> = self.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl StoreProvider for BTreeMap<StoreId, RuntimeStore> {
    fn store(&self, id: &str) -> Option<&RuntimeStore> {
        self.get(id)
    }

    fn store_mut(&mut self, id: &str) -> Option<&mut RuntimeStore> {
        self.get_mut(id)
    }

    fn store_ids(&self) -> Vec<StoreId> {
        self.keys().cloned().collect()
    }
}

impl StoreProvider for RuntimeStore {
    fn store(&self, id: &str) -> Option<&RuntimeStore> {
        (self.id == id).then_some(self)
    }

    fn store_mut(&mut self, id: &str) -> Option<&mut RuntimeStore> {
        if self.id == id {
            Some(self)
        } else {
            None
        }
    }

    fn store_ids(&self) -> Vec<StoreId> {
        vec![self.id.clone()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changes::CompStructKind;
    use crate::registry::tests::{test_registry, Health, Transform};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_store() -> RuntimeStore {
        RuntimeStore::new("world", test_registry())
    }

    #[test]
    fn create_publishes_root() {
        let mut store = test_store();
        let a = store.create();
        let b = store.create();

        assert!(b > a);
        assert!(store.is_root(a));
        assert_eq!(store.roots().collect::<Vec<_>>(), vec![a, b]);
    }

    #[test]
    fn child_ordering_scenario() {
        let mut store = test_store();
        let a = store.create();
        let b = store.create_child(a, 0);
        let c = store.create_child(a, 0);
        assert_eq!(store.children(a), &[c, b]);

        assert!(store.move_child(a, c, 1));
        assert_eq!(store.children(a), &[b, c]);

        assert!(store.remove(a, RemoveMode::Subtree));
        assert!(store.try_take_ro(a).is_none());
        assert!(store.try_take_ro(b).is_none());
        assert!(store.try_take_ro(c).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn create_child_of_missing_parent_stays_detached() {
        let mut store = test_store();
        let id = store.create_child(42, -1);

        assert!(store.contains(id));
        assert!(!store.is_published(id));
        assert!(store.publish_root_existing(id));
        assert!(store.is_root(id));
    }

    #[test]
    fn attach_rejects_cycles() {
        let mut store = test_store();
        let a = store.create();
        let b = store.create_child(a, -1);
        let c = store.create_child(b, -1);

        assert!(!store.attach_child(a, a, 0));
        assert!(!store.attach_child(c, a, 0));
        assert!(!store.attach_child(b, a, 0));
        assert!(!store.attach_child(a, 99, 0));
        assert_eq!(store.parent_of(b), Some(a));
        assert!(store.is_root(a));
    }

    #[test]
    fn attach_moves_between_parents() {
        let mut store = test_store();
        let a = store.create();
        let b = store.create();
        let c = store.create_child(a, -1);

        assert!(store.attach_child(b, c, 5));
        assert!(store.children(a).is_empty());
        assert_eq!(store.children(b), &[c]);
        assert_eq!(store.parent_of(c), Some(b));

        assert!(store.attach_child(c, a, -1));
        assert!(!store.is_root(a));
        assert_eq!(store.root_of(a), b);
    }

    #[test]
    fn move_clamps_and_skips_noop() {
        let mut store = test_store();
        let a = store.create();
        let b = store.create_child(a, -1);
        let c = store.create_child(a, -1);
        store.flush();

        assert!(store.move_child(a, b, 10));
        assert_eq!(store.children(a), &[c, b]);

        assert!(store.move_child(a, b, 1));
        let changes = store.flush().unwrap();
        assert_eq!(changes.structure.len(), 1);
        assert_eq!(changes.structure[0].kind, StructureOpKind::Move);

        assert!(!store.move_child(b, c, 0));
    }

    #[test]
    fn detach_republishes_as_root() {
        let mut store = test_store();
        let a = store.create();
        let b = store.create_child(a, -1);

        assert!(store.detach_child(b));
        assert!(store.is_root(b));
        assert_eq!(store.parent_of(b), None);
        assert!(!store.detach_child(b));
    }

    #[test]
    fn remove_modes() {
        let mut store = test_store();
        let a = store.create();
        let b = store.create_child(a, -1);
        let c = store.create_child(b, -1);
        let d = store.create_child(b, -1);

        assert!(store.remove(b, RemoveMode::NodeOnlyReparentChildrenToParent));
        assert_eq!(store.children(a), &[c, d]);
        assert_eq!(store.parent_of(c), Some(a));

        assert!(store.remove(a, RemoveMode::NodeOnlyDetachChildrenToRoot));
        assert!(store.is_root(c));
        assert!(store.is_root(d));

        assert!(store.remove(c, RemoveMode::NodeOnlyReparentChildrenToParent));
        assert_eq!(store.roots().collect::<Vec<_>>(), vec![d]);
        assert!(!store.remove(c, RemoveMode::Subtree));
    }

    #[test]
    fn subtree_remove_records_single_op() {
        let mut store = test_store();
        let a = store.create();
        let b = store.create_child(a, -1);
        store.create_child(b, -1);
        store.flush();

        let removal = store.remove_linked(a, RemoveMode::Subtree).unwrap();
        assert_eq!(removal.removed.len(), 3);

        let changes = store.flush().unwrap();
        assert_eq!(changes.structure.len(), 1);
        assert_eq!(changes.structure[0].id, a);
        assert_eq!(
            changes.structure[0].kind,
            StructureOpKind::Remove(RemoveMode::Subtree)
        );
    }

    #[test]
    fn remove_returns_linked_entity() {
        let mut store = test_store();
        let a = store.create();
        let link = EntityLink::new(3, 1);

        assert!(store.link_entity(a, link));
        assert!(!store.link_entity(77, link));
        assert_eq!(store.entity(a), Some(link));

        let removal = store.remove_linked(a, RemoveMode::Subtree).unwrap();
        assert_eq!(removal.entity, Some(link));
        assert_eq!(store.entity(a), None);
    }

    #[test]
    fn flush_orders_structure_and_components() {
        let mut store = test_store();
        let a = store.create();
        let b = store.create_child(a, -1);
        store.move_child(a, b, 0);

        store
            .try_take_rw(b)
            .unwrap()
            .add_or_replace(Health { hp: 3 })
            .unwrap();
        store
            .try_take_rw(a)
            .unwrap()
            .add_or_replace(Transform { cell: (1, 2) })
            .unwrap();

        let batches = store.tick();
        assert_eq!(batches.len(), 1);
        let changes = &batches[0];

        let orders: Vec<_> = changes.structure.iter().map(|op| op.order).collect();
        let mut sorted = orders.clone();
        sorted.sort();
        assert_eq!(orders, sorted);
        assert_eq!(changes.structure[0].kind, StructureOpKind::Spawn);

        let ids: Vec<_> = changes.component_structure.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![a, b]);
        assert!(changes
            .component_structure
            .iter()
            .all(|c| c.kind == CompStructKind::Add));

        assert!(store.tick().is_empty());
    }

    #[test]
    fn value_changes_are_drained_once() {
        let mut store = test_store();
        let a = store.create();
        store
            .try_take_rw(a)
            .unwrap()
            .add_or_replace(Transform { cell: (0, 0) })
            .unwrap();
        store.tick();

        store
            .try_take_rw(a)
            .unwrap()
            .take_rw::<Transform>()
            .unwrap()
            .cell = (5, 7);
        let changes = store.tick().remove(0);
        assert!(changes.structure.is_empty());
        assert_eq!(changes.components.len(), 1);
        assert_eq!(changes.components[0].id, a);

        store.try_take_rw(a);
        assert!(store.tick().is_empty());
    }

    #[test]
    fn listener_mutation_flushes_once_more() {
        let mut store = test_store();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);

        let mut fired = false;
        store.on_changes(move |store, _| {
            seen.fetch_add(1, Ordering::SeqCst);
            if !fired {
                fired = true;
                store.create();
            }
        });

        store.create();
        let batches = store.tick();
        assert_eq!(batches.len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!store.is_flush_scheduled());
    }

    #[test]
    fn runaway_listener_waits_for_next_tick() {
        let mut store = test_store();
        store.on_changes(|store, _| {
            store.create();
        });

        store.create();
        assert_eq!(store.tick().len(), 2);
        assert!(store.is_flush_scheduled());
        assert_eq!(store.tick().len(), 2);
    }

    #[test]
    fn upsert_replica_adopts_id() {
        let mut store = test_store();
        let object = store.upsert_replica(40, NodeHeader::default());
        object.add_or_replace(Health { hp: 1 }).unwrap();

        assert_eq!(store.last_id(), 40);
        assert!(store.publish_root_existing(40));
        assert!(store.create() > 40);

        store.upsert_replica(40, NodeHeader::default());
        assert_eq!(store.try_take_ro(40).unwrap().component_count(), 0);
        assert!(store.is_root(40));
    }

    #[test]
    fn clear_removes_everything() {
        let mut store = test_store();
        let a = store.create();
        store.create_child(a, -1);
        store.create_detached();

        store.clear();
        assert!(store.is_empty());
        assert_eq!(store.roots().count(), 0);
    }

    #[test]
    fn single_store_provider() {
        let mut store = test_store();
        assert!(store.store("world").is_some());
        assert!(store.store_mut("other").is_none());
        assert_eq!(store.store_ids(), vec!["world".to_string()]);
    }
}
