//! Error types for the Arbor engine.
//!
//! Structural store mutations never produce these: they report rejection with
//! a `bool`. Errors are reserved for registry setup, encoding and malformed
//! wire data.

use crate::{ComponentTypeId, StoreId};
use thiserror::Error;

/// All possible errors from the Arbor engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Registry errors
    #[error("invalid component manifest: {0}")]
    InvalidManifest(String),

    #[error("component alias not present in manifest: {0}")]
    UnknownComponentAlias(String),

    #[error("component alias registered twice: {0}")]
    DuplicateComponent(String),

    #[error("component type id {0} is not registered")]
    UnregisteredComponent(ComponentTypeId),

    #[error("component value does not match registered type '{alias}' (id {type_id})")]
    ComponentTypeMismatch {
        type_id: ComponentTypeId,
        alias: String,
    },

    // Encoding errors
    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("deserialization failed: {0}")]
    Deserialization(String),

    // Protocol errors
    #[error("unknown store: {0}")]
    UnknownStore(StoreId),

    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::UnknownComponentAlias("transform".into());
        assert_eq!(
            err.to_string(),
            "component alias not present in manifest: transform"
        );

        let err = Error::ComponentTypeMismatch {
            type_id: 3,
            alias: "health".into(),
        };
        assert_eq!(
            err.to_string(),
            "component value does not match registered type 'health' (id 3)"
        );

        let err = Error::UnknownStore("world".into());
        assert_eq!(err.to_string(), "unknown store: world");
    }
}
