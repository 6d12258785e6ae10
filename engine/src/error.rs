//! Error types for the Groundwork engine.

use crate::schema::Violation;
use crate::{CollectionName, RecordId, SchemaVersion, Version};
use thiserror::Error;

/// All errors surfaced by the engine.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    // Validation errors
    #[error("validation failed for '{collection}': {}", format_violations(.violations))]
    Validation {
        collection: CollectionName,
        violations: Vec<Violation>,
    },

    #[error("stale write on {collection}/{id}: expected version {expected}, stored {actual}")]
    OptimisticLock {
        collection: CollectionName,
        id: RecordId,
        expected: Version,
        actual: Version,
    },

    #[error("record not found: {collection}/{id}")]
    NotFound {
        collection: CollectionName,
        id: RecordId,
    },

    #[error("record already exists: {collection}/{id}")]
    RecordAlreadyExists {
        collection: CollectionName,
        id: RecordId,
    },

    #[error("record is not deleted: {collection}/{id}")]
    NotDeleted {
        collection: CollectionName,
        id: RecordId,
    },

    #[error("{collection}/{id} is still referenced by {referenced_by}")]
    RelationRestricted {
        collection: CollectionName,
        id: RecordId,
        referenced_by: CollectionName,
    },

    // Schema errors
    #[error("collection '{collection}' declares no relation '{relation}'")]
    UnknownRelation {
        collection: CollectionName,
        relation: String,
    },

    #[error("no schema registered for collection: {0}")]
    SchemaNotFound(CollectionName),

    #[error("collection '{collection}' is owned by '{existing_owner}', cannot register for '{owner}'")]
    DuplicateSchema {
        collection: CollectionName,
        owner: String,
        existing_owner: String,
    },

    #[error("migration of {collection}/{id} from v{from} to v{to} failed: {reason}")]
    Migration {
        collection: CollectionName,
        id: RecordId,
        from: SchemaVersion,
        to: SchemaVersion,
        reason: String,
    },

    // Persistence errors
    #[error("persistence degraded on {backend}: {reason}")]
    PersistenceDegraded { backend: String, reason: String },

    #[error("remote error (retryable: {retryable}): {message}")]
    Remote { retryable: bool, message: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid backup: {0}")]
    InvalidBackup(String),

    // Command errors
    #[error("nothing to undo")]
    NothingToUndo,

    #[error("nothing to redo")]
    NothingToRedo,

    #[error("vetoed by hook {hook}: {reason}")]
    HookVeto { hook: String, reason: String },

    #[error("relation cycle detected at record {0}")]
    CycleDetected(RecordId),
}

impl Error {
    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Remote { retryable: true, .. })
    }

    pub(crate) fn not_found(collection: &str, id: &str) -> Self {
        Error::NotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<crate::kv::KvError> for Error {
    fn from(err: crate::kv::KvError) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

fn format_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| format!("{}: {}", v.field, v.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ViolationKind;

    #[test]
    fn error_display() {
        let err = Error::SchemaNotFound("clients".into());
        assert_eq!(err.to_string(), "no schema registered for collection: clients");

        let err = Error::OptimisticLock {
            collection: "clients".into(),
            id: "c-1".into(),
            expected: 1,
            actual: 2,
        };
        assert_eq!(
            err.to_string(),
            "stale write on clients/c-1: expected version 1, stored 2"
        );

        let err = Error::Validation {
            collection: "clients".into(),
            violations: vec![Violation::new("name", ViolationKind::Missing, "is required")],
        };
        assert_eq!(
            err.to_string(),
            "validation failed for 'clients': name: is required"
        );
    }

    #[test]
    fn retryable_only_for_transient_remote_failures() {
        let transient = Error::Remote {
            retryable: true,
            message: "timeout".into(),
        };
        let rejected = Error::Remote {
            retryable: false,
            message: "bad request".into(),
        };
        assert!(transient.is_retryable());
        assert!(!rejected.is_retryable());
        assert!(!Error::NothingToUndo.is_retryable());
    }
}
