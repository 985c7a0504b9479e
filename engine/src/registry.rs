//! Component type registry.
//!
//! Maps concrete component types to stable small-integer ids taken from an
//! ordered, append-only manifest. The registry is an explicit value shared as
//! `Arc<ComponentRegistry>` by stores, codecs and protocol endpoints, so one
//! process can host several independent registries.

use crate::component::{downcast_ref, Component, ComponentType};
use crate::{error::Result, ComponentTypeId, Error};
use serde::{Deserialize, Serialize};
use std::any::TypeId;
use std::collections::{HashMap, HashSet};

/// A single manifest entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    /// Alias the component type is registered under
    pub name: String,
    /// When the entry was appended (informational)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    /// Explicit ordering; ids follow ascending order
    pub order: i32,
}

impl ManifestEntry {
    pub fn new(name: impl Into<String>, order: i32) -> Self {
        Self {
            name: name.into(),
            created_at: None,
            order,
        }
    }
}

/// Ordered list of component type names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentManifest {
    pub version: u32,
    pub types: Vec<ManifestEntry>,
}

impl ComponentManifest {
    /// Build a manifest from names, ordered as given.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let types = names
            .into_iter()
            .enumerate()
            .map(|(i, name)| ManifestEntry::new(name, i as i32))
            .collect();

        Self { version: 1, types }
    }

    /// Parse a manifest from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        if json.trim().is_empty() {
            return Err(Error::InvalidManifest("manifest json is empty".into()));
        }

        serde_json::from_str(json).map_err(|e| Error::InvalidManifest(e.to_string()))
    }

    /// Resolve the manifest into alias order. Entries are sorted by `order`
    /// (stable), repeated names keep their first position.
    fn resolve(&self) -> Result<Vec<String>> {
        let mut ordered: Vec<&ManifestEntry> = self.types.iter().collect();
        ordered.sort_by_key(|e| e.order);

        let mut seen = HashSet::new();
        let mut names = Vec::with_capacity(ordered.len());
        for entry in ordered {
            if entry.name.trim().is_empty() {
                return Err(Error::InvalidManifest("manifest entry has empty name".into()));
            }

            if seen.insert(entry.name.as_str()) {
                names.push(entry.name.clone());
            }
        }

        Ok(names)
    }
}

type EncodeFn = fn(&dyn Component) -> Result<Vec<u8>>;
type DecodeFn = fn(&[u8]) -> Result<Box<dyn Component>>;

/// Everything the engine knows about one registered component type.
#[derive(Clone, Copy)]
pub struct ComponentDescriptor {
    pub id: ComponentTypeId,
    pub alias: &'static str,
    pub struct_dirty: bool,
    pub data_dirty: bool,
    encode: EncodeFn,
    decode: DecodeFn,
}

impl std::fmt::Debug for ComponentDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentDescriptor")
            .field("id", &self.id)
            .field("alias", &self.alias)
            .field("struct_dirty", &self.struct_dirty)
            .field("data_dirty", &self.data_dirty)
            .finish()
    }
}

fn encode_erased<T: ComponentType>(component: &dyn Component) -> Result<Vec<u8>> {
    let value = downcast_ref::<T>(component).ok_or_else(|| Error::ComponentTypeMismatch {
        type_id: ComponentTypeId::MAX,
        alias: T::ALIAS.to_string(),
    })?;

    crate::protocol::to_bytes(value)
}

fn decode_erased<T: ComponentType>(bytes: &[u8]) -> Result<Box<dyn Component>> {
    let value: T = crate::protocol::from_bytes(bytes)?;
    Ok(Box::new(value))
}

/// Registry of component types, keyed by manifest id.
#[derive(Debug, Default)]
pub struct ComponentRegistry {
    manifest_version: u32,
    names: Vec<String>,
    id_by_name: HashMap<String, ComponentTypeId>,
    id_by_type: HashMap<TypeId, ComponentTypeId>,
    descriptors: HashMap<ComponentTypeId, ComponentDescriptor>,
}

impl ComponentRegistry {
    /// Create a registry from a manifest. Ids are assigned densely from 0 in
    /// manifest order; concrete types are bound later with [`register`](Self::register).
    pub fn from_manifest(manifest: &ComponentManifest) -> Result<Self> {
        let names = manifest.resolve()?;
        let id_by_name = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i as ComponentTypeId))
            .collect();

        Ok(Self {
            manifest_version: manifest.version,
            names,
            id_by_name,
            id_by_type: HashMap::new(),
            descriptors: HashMap::new(),
        })
    }

    /// Create a registry from manifest JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Self::from_manifest(&ComponentManifest::from_json(json)?)
    }

    /// Bind a concrete type to its manifest alias.
    pub fn register<T: ComponentType>(&mut self) -> Result<ComponentTypeId> {
        let id = *self
            .id_by_name
            .get(T::ALIAS)
            .ok_or_else(|| Error::UnknownComponentAlias(T::ALIAS.to_string()))?;

        if self.descriptors.contains_key(&id) {
            return Err(Error::DuplicateComponent(T::ALIAS.to_string()));
        }

        self.id_by_type.insert(TypeId::of::<T>(), id);
        self.descriptors.insert(
            id,
            ComponentDescriptor {
                id,
                alias: T::ALIAS,
                struct_dirty: T::STRUCT_DIRTY,
                data_dirty: T::DATA_DIRTY,
                encode: encode_erased::<T>,
                decode: decode_erased::<T>,
            },
        );

        Ok(id)
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<T: ComponentType>(mut self) -> Result<Self> {
        self.register::<T>()?;
        Ok(self)
    }

    pub fn manifest_version(&self) -> u32 {
        self.manifest_version
    }

    /// Number of manifest entries (registered or not).
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Id of a registered concrete type.
    pub fn id_of<T: ComponentType>(&self) -> Option<ComponentTypeId> {
        self.id_by_type.get(&TypeId::of::<T>()).copied()
    }

    /// Id of a dynamically typed component.
    pub fn id_of_value(&self, component: &dyn Component) -> Option<ComponentTypeId> {
        self.id_by_type.get(&component.as_any().type_id()).copied()
    }

    /// Id assigned to a manifest alias.
    pub fn id_of_alias(&self, alias: &str) -> Option<ComponentTypeId> {
        self.id_by_name.get(alias).copied()
    }

    /// Manifest alias for an id.
    pub fn alias(&self, id: ComponentTypeId) -> Option<&str> {
        self.names.get(id as usize).map(String::as_str)
    }

    pub fn descriptor(&self, id: ComponentTypeId) -> Option<&ComponentDescriptor> {
        self.descriptors.get(&id)
    }

    /// Serialize a component registered under `id`.
    pub fn encode(&self, id: ComponentTypeId, component: &dyn Component) -> Result<Vec<u8>> {
        let descriptor = self
            .descriptors
            .get(&id)
            .ok_or(Error::UnregisteredComponent(id))?;

        (descriptor.encode)(component).map_err(|e| match e {
            Error::ComponentTypeMismatch { alias, .. } => {
                Error::ComponentTypeMismatch { type_id: id, alias }
            }
            other => other,
        })
    }

    /// Deserialize a component. Returns `Ok(None)` for ids this registry has
    /// no type for, so newer peers can add component types without breaking
    /// older ones.
    pub fn decode(&self, id: ComponentTypeId, bytes: &[u8]) -> Result<Option<Box<dyn Component>>> {
        match self.descriptors.get(&id) {
            Some(descriptor) => (descriptor.decode)(bytes).map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::component::{ReplicationMask, ReplicationPolicy};
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Transform {
        pub cell: (i32, i32),
    }

    impl Component for Transform {}
    impl ComponentType for Transform {
        const ALIAS: &'static str = "transform";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Health {
        pub hp: u32,
    }

    impl Component for Health {}
    impl ComponentType for Health {
        const ALIAS: &'static str = "health";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Secret {
        pub owner: u32,
        pub code: String,
    }

    impl Component for Secret {
        fn policy(&self) -> ReplicationPolicy {
            ReplicationPolicy::owned_by(self.owner)
        }
    }
    impl ComponentType for Secret {
        const ALIAS: &'static str = "secret";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Highlight {
        pub on: bool,
    }

    impl Component for Highlight {}
    impl ComponentType for Highlight {
        const ALIAS: &'static str = "highlight";
        const STRUCT_DIRTY: bool = false;
        const DATA_DIRTY: bool = false;
    }

    /// Rides deltas only.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Tracer {
        pub step: u32,
    }

    impl Component for Tracer {
        fn policy(&self) -> ReplicationPolicy {
            ReplicationPolicy::replicated().with_mask(ReplicationMask::DELTA)
        }
    }
    impl ComponentType for Tracer {
        const ALIAS: &'static str = "tracer";
    }

    pub fn test_registry() -> Arc<ComponentRegistry> {
        let manifest =
            ComponentManifest::from_names(["transform", "health", "secret", "highlight", "tracer"]);
        let registry = ComponentRegistry::from_manifest(&manifest)
            .and_then(|r| r.with::<Transform>())
            .and_then(|r| r.with::<Health>())
            .and_then(|r| r.with::<Secret>())
            .and_then(|r| r.with::<Highlight>())
            .and_then(|r| r.with::<Tracer>())
            .unwrap();
        Arc::new(registry)
    }

    #[test]
    fn ids_follow_manifest_order() {
        let json = r#"{
            "version": 2,
            "types": [
                {"name": "health", "order": 5},
                {"name": "transform", "order": 1, "createdAt": "2024-01-01"},
                {"name": "transform", "order": 9}
            ]
        }"#;

        let registry = ComponentRegistry::from_json(json).unwrap();
        assert_eq!(registry.manifest_version(), 2);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.id_of_alias("transform"), Some(0));
        assert_eq!(registry.id_of_alias("health"), Some(1));
        assert_eq!(registry.alias(1), Some("health"));
    }

    #[test]
    fn rejects_empty_and_blank_manifests() {
        assert!(matches!(
            ComponentRegistry::from_json("  "),
            Err(Error::InvalidManifest(_))
        ));

        let manifest = ComponentManifest {
            version: 1,
            types: vec![ManifestEntry::new(" ", 0)],
        };
        assert!(matches!(
            ComponentRegistry::from_manifest(&manifest),
            Err(Error::InvalidManifest(_))
        ));
    }

    #[test]
    fn register_requires_manifest_alias() {
        let manifest = ComponentManifest::from_names(["health"]);
        let mut registry = ComponentRegistry::from_manifest(&manifest).unwrap();

        assert!(matches!(
            registry.register::<Transform>(),
            Err(Error::UnknownComponentAlias(_))
        ));
        assert_eq!(registry.register::<Health>(), Ok(0));
        assert!(matches!(
            registry.register::<Health>(),
            Err(Error::DuplicateComponent(_))
        ));
    }

    #[test]
    fn encode_decode_through_descriptor() {
        let registry = test_registry();
        let id = registry.id_of::<Transform>().unwrap();

        let bytes = registry.encode(id, &Transform { cell: (1, 2) }).unwrap();
        let decoded = registry.decode(id, &bytes).unwrap().unwrap();
        let value = downcast_ref::<Transform>(decoded.as_ref()).unwrap();
        assert_eq!(value.cell, (1, 2));
    }

    #[test]
    fn encode_with_wrong_type_is_mismatch() {
        let registry = test_registry();
        let id = registry.id_of::<Transform>().unwrap();

        let result = registry.encode(id, &Health { hp: 3 });
        assert_eq!(
            result,
            Err(Error::ComponentTypeMismatch {
                type_id: id,
                alias: "transform".into()
            })
        );
    }

    #[test]
    fn unknown_ids_decode_to_none() {
        let registry = test_registry();
        assert_eq!(registry.decode(99, b"{}").map(|c| c.is_none()), Ok(true));
    }

    #[test]
    fn traits_are_recorded() {
        let registry = test_registry();
        let id = registry.id_of::<Highlight>().unwrap();
        let descriptor = registry.descriptor(id).unwrap();
        assert!(!descriptor.struct_dirty);
        assert!(!descriptor.data_dirty);
    }
}
