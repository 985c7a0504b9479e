//! Structure hashing, dumps and validation for comparing replicas.

use crate::store::RuntimeStore;
use crate::InstanceId;
use std::collections::HashSet;
use std::fmt::Write;
use thiserror::Error;

const FNV_OFFSET: u64 = 1469598103934665603;
const FNV_PRIME: u64 = 1099511628211;

/// Deepest nesting [`validate`] will walk.
pub const MAX_VALIDATE_DEPTH: usize = 2048;

fn mix(hash: u64, value: i64) -> u64 {
    value
        .to_le_bytes()
        .iter()
        .fold(hash, |h, b| (h ^ u64::from(*b)).wrapping_mul(FNV_PRIME))
}

/// FNV-1a over the published forest: roots in ascending id order, each node
/// mixing its id and then its child count, children in stored order.
pub fn structure_hash(store: &RuntimeStore) -> u64 {
    let mut hash = FNV_OFFSET;
    let mut stack: Vec<InstanceId> = store.roots().collect();
    stack.reverse();

    let mut seen = HashSet::new();
    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }

        let children = store.children(id);
        hash = mix(hash, id);
        hash = mix(hash, children.len() as i64);
        stack.extend(children.iter().rev().copied());
    }

    hash
}

/// Indented text dump of the published forest. Nodes deeper than
/// `max_depth` are replaced by `...`.
pub fn dump(store: &RuntimeStore, max_depth: usize) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "store {} ({} objects)", store.id(), store.len());

    let mut stack: Vec<(InstanceId, usize)> = store.roots().map(|id| (id, 0)).collect();
    stack.reverse();

    while let Some((id, depth)) = stack.pop() {
        let indent = "  ".repeat(depth + 1);
        if depth > max_depth {
            let _ = writeln!(out, "{}...", indent);
            continue;
        }

        match store.try_take_ro(id) {
            Some(object) => {
                let _ = writeln!(
                    out,
                    "{}#{} {} [{} components]",
                    indent,
                    id,
                    object.key(),
                    object.component_count()
                );
            }
            None => {
                let _ = writeln!(out, "{}#{} <missing>", indent, id);
            }
        }

        let children = store.children(id);
        if depth == max_depth && !children.is_empty() {
            let _ = writeln!(out, "{}  ...", indent);
            continue;
        }
        stack.extend(children.iter().rev().map(|c| (*c, depth + 1)));
    }

    out
}

/// A structural defect found by [`validate`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StructureError {
    #[error("node {0} is indexed but has no object")]
    MissingObject(InstanceId),

    #[error("node {0} is reachable twice")]
    Cycle(InstanceId),

    #[error("node {child} is listed under {listed} but its parent link says {actual:?}")]
    ParentMismatch {
        child: InstanceId,
        listed: InstanceId,
        actual: Option<InstanceId>,
    },

    #[error("root {0} has a parent link")]
    RootWithParent(InstanceId),

    #[error("depth limit exceeded at node {0}")]
    TooDeep(InstanceId),
}

/// Walk every root depth-first and check the forest invariants.
pub fn validate(store: &RuntimeStore) -> Result<(), StructureError> {
    let mut seen = HashSet::new();

    for root in store.roots() {
        if store.parent_of(root).is_some() {
            return Err(StructureError::RootWithParent(root));
        }

        let mut stack = vec![(root, 0usize)];
        while let Some((id, depth)) = stack.pop() {
            if depth > MAX_VALIDATE_DEPTH {
                return Err(StructureError::TooDeep(id));
            }
            if !store.contains(id) {
                return Err(StructureError::MissingObject(id));
            }
            if !seen.insert(id) {
                return Err(StructureError::Cycle(id));
            }

            for child in store.children(id) {
                let actual = store.parent_of(*child);
                if actual != Some(id) {
                    return Err(StructureError::ParentMismatch {
                        child: *child,
                        listed: id,
                        actual,
                    });
                }
                stack.push((*child, depth + 1));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::test_registry;

    fn test_store() -> RuntimeStore {
        RuntimeStore::new("world", test_registry())
    }

    #[test]
    fn empty_store_hash_is_offset() {
        assert_eq!(structure_hash(&test_store()), FNV_OFFSET);
    }

    #[test]
    fn hash_tracks_shape() {
        let mut store = test_store();
        let a = store.create();
        let b = store.create_child(a, -1);
        let before = structure_hash(&store);

        let c = store.create_child(a, -1);
        assert_ne!(structure_hash(&store), before);

        store.move_child(a, c, 0);
        let reordered = structure_hash(&store);
        store.move_child(a, b, 0);
        assert_ne!(structure_hash(&store), reordered);
    }

    #[test]
    fn dump_marks_depth_limit() {
        let mut store = test_store();
        let a = store.create();
        let b = store.create_child(a, -1);
        store.create_child(b, -1);

        let text = dump(&store, 1);
        assert!(text.contains(&format!("#{} _undefined._none._none.0.0.0", a)));
        assert!(text.contains(&format!("#{}", b)));
        assert!(text.contains("..."));
    }

    #[test]
    fn valid_forest_passes() {
        let mut store = test_store();
        let a = store.create();
        let b = store.create_child(a, -1);
        store.create_child(b, -1);
        store.create();

        assert_eq!(validate(&store), Ok(()));
    }
}
