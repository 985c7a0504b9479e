//! Component traits and replication capabilities.
//!
//! A component is a typed value attached to a [`RuntimeObject`](crate::RuntimeObject).
//! Objects hold components as `Box<dyn Component>`; the concrete type is
//! recovered through the registry's stable small-integer id and the
//! [`ComponentType`] trait, never through reflection.

use crate::ConnectionId;
use bitflags::bitflags;
use serde::{de::DeserializeOwned, Serialize};
use std::any::Any;
use std::fmt;

bitflags! {
    /// Which kinds of replication payload a node or component may appear in.
    ///
    /// Full syncs are built with `SNAPSHOT`; the per-connection views kept in
    /// history, and so every delta, with `DELTA`. A `DELTA`-only value is
    /// therefore missing from a fresh replica until it next changes, and a
    /// `SNAPSHOT`-only value arrives once with the full sync and is never
    /// updated or removed by a delta.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ReplicationMask: u8 {
        /// Included in full snapshots.
        const SNAPSHOT = 0b01;
        /// Included in baseline-relative deltas.
        const DELTA = 0b10;
    }
}

impl Default for ReplicationMask {
    fn default() -> Self {
        Self::all()
    }
}

/// Replication capabilities of a node or component.
///
/// The default policy replicates to everyone in both full and delta payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicationPolicy {
    pub mask: ReplicationMask,
    /// Only this connection may see the value.
    pub owner: Option<ConnectionId>,
    /// Only connections with this profile may see the value.
    pub profile: Option<u32>,
}

impl Default for ReplicationPolicy {
    fn default() -> Self {
        Self::replicated()
    }
}

impl ReplicationPolicy {
    /// Replicate everywhere.
    pub const fn replicated() -> Self {
        Self {
            mask: ReplicationMask::all(),
            owner: None,
            profile: None,
        }
    }

    /// Never leaves the process.
    pub const fn local_only() -> Self {
        Self {
            mask: ReplicationMask::empty(),
            owner: None,
            profile: None,
        }
    }

    /// Visible only to `owner`.
    pub const fn owned_by(owner: ConnectionId) -> Self {
        Self {
            mask: ReplicationMask::all(),
            owner: Some(owner),
            profile: None,
        }
    }

    pub const fn with_mask(mut self, mask: ReplicationMask) -> Self {
        self.mask = mask;
        self
    }

    pub const fn with_profile(mut self, profile: u32) -> Self {
        self.profile = Some(profile);
        self
    }

    /// Check whether a value with this policy belongs in a snapshot built
    /// with `filter`.
    pub fn admits(&self, filter: &SnapshotFilter) -> bool {
        if !self.mask.intersects(filter.mask) {
            return false;
        }

        if let Some(owner) = self.owner {
            if filter.connection != Some(owner) {
                return false;
            }
        }

        match self.profile {
            Some(profile) => filter.profile == Some(profile),
            None => true,
        }
    }
}

/// The viewer a snapshot is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotFilter {
    pub mask: ReplicationMask,
    pub connection: Option<ConnectionId>,
    pub profile: Option<u32>,
}

impl SnapshotFilter {
    /// Filter for a full payload.
    pub const fn full() -> Self {
        Self {
            mask: ReplicationMask::SNAPSHOT,
            connection: None,
            profile: None,
        }
    }

    /// Filter for history entries and delta computation.
    pub const fn delta() -> Self {
        Self {
            mask: ReplicationMask::DELTA,
            connection: None,
            profile: None,
        }
    }

    pub const fn for_connection(mut self, connection: ConnectionId) -> Self {
        self.connection = Some(connection);
        self
    }

    pub const fn with_profile(mut self, profile: Option<u32>) -> Self {
        self.profile = profile;
        self
    }
}

impl Default for SnapshotFilter {
    fn default() -> Self {
        Self::full()
    }
}

/// Upcast helper so `dyn Component` can be downcast to its concrete type.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Object-safe view of a component stored on a runtime object.
pub trait Component: AsAny + fmt::Debug + Send {
    /// Replication capabilities of this value.
    fn policy(&self) -> ReplicationPolicy {
        ReplicationPolicy::default()
    }

    /// Release resources held by the component. Called when the component is
    /// removed or its object is destroyed.
    fn dispose(&mut self) {}
}

/// A concrete component type that can be registered and put on the wire.
pub trait ComponentType: Component + Serialize + DeserializeOwned + Sized {
    /// Short alias naming this type in the component manifest.
    const ALIAS: &'static str;

    /// Track adds and removes of this component for replication.
    const STRUCT_DIRTY: bool = true;

    /// Track value mutations of this component for replication.
    const DATA_DIRTY: bool = true;
}

/// Downcast a stored component to its concrete type.
pub fn downcast_ref<T: ComponentType>(component: &dyn Component) -> Option<&T> {
    component.as_any().downcast_ref::<T>()
}

/// Mutable counterpart of [`downcast_ref`].
pub fn downcast_mut<T: ComponentType>(component: &mut dyn Component) -> Option<&mut T> {
    component.as_any_mut().downcast_mut::<T>()
}
