//! Runtime objects: the nodes of a store.

use crate::changes::CompStructKind;
use crate::component::{downcast_mut, downcast_ref, Component, ComponentType, ReplicationPolicy};
use crate::registry::ComponentRegistry;
use crate::{error::Result, ComponentTypeId, Error, InstanceId, StoreId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

const UNDEFINED_MOD: &str = "_undefined";
const NONE_PART: &str = "_none";
const DEFAULT_VERSION: &str = "0.0.0";

/// Four-part semantic key naming the authored template an object derives
/// from. Informational only; the engine never resolves it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssetKey {
    #[serde(rename = "mod")]
    pub module: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub key: String,
    pub version: String,
}

impl AssetKey {
    /// Build a key, replacing blank parts with their defaults.
    pub fn new(
        module: impl Into<String>,
        kind: impl Into<String>,
        key: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            module: or_default(module.into(), UNDEFINED_MOD),
            kind: or_default(kind.into(), NONE_PART),
            key: or_default(key.into(), NONE_PART),
            version: or_default(version.into(), DEFAULT_VERSION),
        }
    }
}

fn or_default(part: String, default: &str) -> String {
    if part.trim().is_empty() {
        default.to_string()
    } else {
        part
    }
}

impl Default for AssetKey {
    fn default() -> Self {
        Self::new("", "", "", "")
    }
}

impl fmt::Display for AssetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", self.module, self.kind, self.key, self.version)
    }
}

/// Per-node data serialized as the node bytes of a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeHeader {
    pub key: AssetKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_guid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_asset_guid: Option<String>,
}

impl NodeHeader {
    pub fn new(key: AssetKey) -> Self {
        Self {
            key,
            asset_guid: None,
            source_asset_guid: None,
        }
    }
}

struct ComponentSlot {
    type_id: ComponentTypeId,
    value: Box<dyn Component>,
}

/// A node in a [`RuntimeStore`](crate::RuntimeStore).
///
/// Holds an ordered set of components, one per type, and the dirty
/// bookkeeping the store drains on flush.
pub struct RuntimeObject {
    instance_id: InstanceId,
    store_id: StoreId,
    header: NodeHeader,
    policy: ReplicationPolicy,
    components: Vec<ComponentSlot>,
    registry: Arc<ComponentRegistry>,
    structure_changes: BTreeMap<ComponentTypeId, CompStructKind>,
    component_changes: BTreeSet<ComponentTypeId>,
    visibility_changed: bool,
}

impl fmt::Debug for RuntimeObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeObject")
            .field("instance_id", &self.instance_id)
            .field("store_id", &self.store_id)
            .field("key", &self.header.key)
            .field(
                "components",
                &self.components.iter().map(|s| s.type_id).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Dirty state drained from one object.
#[derive(Debug, Default)]
pub(crate) struct ObjectDirt {
    pub structure: Vec<(ComponentTypeId, CompStructKind)>,
    pub values: Vec<ComponentTypeId>,
    pub visibility: bool,
}

impl RuntimeObject {
    pub(crate) fn new(
        instance_id: InstanceId,
        store_id: StoreId,
        registry: Arc<ComponentRegistry>,
    ) -> Self {
        Self {
            instance_id,
            store_id,
            header: NodeHeader::default(),
            policy: ReplicationPolicy::default(),
            components: Vec::new(),
            registry,
            structure_changes: BTreeMap::new(),
            component_changes: BTreeSet::new(),
            visibility_changed: false,
        }
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub fn store_id(&self) -> &str {
        &self.store_id
    }

    pub fn header(&self) -> &NodeHeader {
        &self.header
    }

    pub fn key(&self) -> &AssetKey {
        &self.header.key
    }

    pub fn set_header(&mut self, header: NodeHeader) {
        self.header = header;
    }

    /// Replication policy of the node itself. A node that is not admitted
    /// hides its whole subtree.
    pub fn policy(&self) -> ReplicationPolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: ReplicationPolicy) {
        if self.policy != policy {
            self.policy = policy;
            self.visibility_changed = true;
        }
    }

    /// Add a component, replacing any existing one of the same type.
    pub fn add_or_replace<T: ComponentType>(&mut self, value: T) -> Result<ComponentTypeId> {
        let type_id = self
            .registry
            .id_of::<T>()
            .ok_or_else(|| Error::UnknownComponentAlias(T::ALIAS.to_string()))?;

        self.insert_slot(type_id, Box::new(value));
        Ok(type_id)
    }

    /// Add a dynamically typed component under a registered id.
    pub fn add_or_replace_by_id(
        &mut self,
        type_id: ComponentTypeId,
        value: Box<dyn Component>,
    ) -> Result<()> {
        let descriptor = self
            .registry
            .descriptor(type_id)
            .ok_or(Error::UnregisteredComponent(type_id))?;

        if self.registry.id_of_value(value.as_ref()) != Some(type_id) {
            return Err(Error::ComponentTypeMismatch {
                type_id,
                alias: descriptor.alias.to_string(),
            });
        }

        self.insert_slot(type_id, value);
        Ok(())
    }

    fn insert_slot(&mut self, type_id: ComponentTypeId, value: Box<dyn Component>) {
        let (struct_dirty, data_dirty) = self.dirty_traits(type_id);

        match self.components.iter().position(|s| s.type_id == type_id) {
            Some(pos) => {
                let mut old = std::mem::replace(&mut self.components[pos].value, value);
                old.dispose();
                if data_dirty {
                    self.component_changes.insert(type_id);
                }
            }
            None => {
                self.components.push(ComponentSlot { type_id, value });
                if struct_dirty {
                    self.structure_changes.insert(type_id, CompStructKind::Add);
                }
            }
        }
    }

    /// Remove a component by type. Returns false if it was absent.
    pub fn remove<T: ComponentType>(&mut self) -> bool {
        match self.registry.id_of::<T>() {
            Some(type_id) => self.remove_by_type_id(type_id),
            None => false,
        }
    }

    /// Remove and dispose a component. An add recorded earlier in the same
    /// tick cancels out with this removal.
    pub fn remove_by_type_id(&mut self, type_id: ComponentTypeId) -> bool {
        let Some(pos) = self.components.iter().position(|s| s.type_id == type_id) else {
            return false;
        };

        let mut slot = self.components.remove(pos);
        slot.value.dispose();

        let (struct_dirty, _) = self.dirty_traits(type_id);
        self.component_changes.remove(&type_id);
        if struct_dirty {
            match self.structure_changes.get(&type_id) {
                Some(CompStructKind::Add) => {
                    self.structure_changes.remove(&type_id);
                }
                _ => {
                    self.structure_changes.insert(type_id, CompStructKind::Remove);
                }
            }
        }

        true
    }

    pub fn has<T: ComponentType>(&self) -> bool {
        self.take_ro::<T>().is_some()
    }

    /// Read a component.
    pub fn take_ro<T: ComponentType>(&self) -> Option<&T> {
        let type_id = self.registry.id_of::<T>()?;
        self.get_by_id(type_id).and_then(downcast_ref::<T>)
    }

    /// Borrow a component for mutation, marking its value dirty.
    pub fn take_rw<T: ComponentType>(&mut self) -> Option<&mut T> {
        let type_id = self.registry.id_of::<T>()?;
        let (_, data_dirty) = self.dirty_traits(type_id);

        let slot = self.components.iter_mut().find(|s| s.type_id == type_id)?;
        if data_dirty {
            self.component_changes.insert(type_id);
        }
        downcast_mut::<T>(slot.value.as_mut())
    }

    pub fn get_by_id(&self, type_id: ComponentTypeId) -> Option<&dyn Component> {
        self.components
            .iter()
            .find(|s| s.type_id == type_id)
            .map(|s| s.value.as_ref())
    }

    /// Components in insertion order.
    pub fn components(&self) -> impl Iterator<Item = (ComponentTypeId, &dyn Component)> {
        self.components.iter().map(|s| (s.type_id, s.value.as_ref()))
    }

    pub fn component_count(&self) -> usize {
        self.components.len()
    }

    /// Whether any dirty state is pending.
    pub fn is_dirty(&self) -> bool {
        !self.structure_changes.is_empty()
            || !self.component_changes.is_empty()
            || self.visibility_changed
    }

    /// Drop pending dirty state without reporting it.
    pub fn clear_dirty(&mut self) {
        self.structure_changes.clear();
        self.component_changes.clear();
        self.visibility_changed = false;
    }

    pub(crate) fn drain_dirty(&mut self) -> ObjectDirt {
        let structure: Vec<_> = std::mem::take(&mut self.structure_changes)
            .into_iter()
            .collect();
        let values = std::mem::take(&mut self.component_changes)
            .into_iter()
            .filter(|type_id| {
                !structure
                    .iter()
                    .any(|(t, kind)| t == type_id && *kind == CompStructKind::Remove)
            })
            .collect();

        ObjectDirt {
            structure,
            values,
            visibility: std::mem::take(&mut self.visibility_changed),
        }
    }

    /// Dispose and drop every component, resetting the object for reuse by a
    /// replica upsert.
    pub(crate) fn reset(&mut self, header: NodeHeader) {
        self.destroy();
        self.header = header;
    }

    /// Dispose every component.
    pub(crate) fn destroy(&mut self) {
        for slot in &mut self.components {
            slot.value.dispose();
        }
        self.components.clear();
        self.clear_dirty();
    }

    fn dirty_traits(&self, type_id: ComponentTypeId) -> (bool, bool) {
        self.registry
            .descriptor(type_id)
            .map(|d| (d.struct_dirty, d.data_dirty))
            .unwrap_or((true, true))
    }
}
