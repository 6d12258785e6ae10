//! Persistence adapters.
//!
//! Every backend implements the same [`Adapter`] contract, scoped by
//! collection name. The engine computes settled records (metadata included)
//! and hands them to the adapter whole, so adapters never interpret patches.
//!
//! Backends:
//!
//! - [`KeyValueAdapter`] - small-quota tier over a [`KeyValueStore`](crate::kv::KeyValueStore)
//! - [`IndexedAdapter`] - SQLite-backed on-device tier for large datasets
//! - [`RemoteAdapter`] - HTTP client for the remote record API
//! - [`CompositeAdapter`] - local reads, write-through to local and remote
//!
//! Which one a store uses is decided once, at startup, by [`select_adapter`].

mod composite;
mod indexed;
mod key_value;
pub mod remote;

pub use composite::{CompositeAdapter, FlushReport, PendingSync, SyncOp};
pub use indexed::IndexedAdapter;
pub use key_value::KeyValueAdapter;
pub use remote::RemoteAdapter;

use crate::error::Result;
use crate::query::Predicate;
use crate::record::Record;
use crate::RecordId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Identifies a backend in logs and errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AdapterKind {
    KeyValue,
    Indexed,
    Remote,
    Composite,
}

impl std::fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AdapterKind::KeyValue => "key-value",
            AdapterKind::Indexed => "indexed",
            AdapterKind::Remote => "remote",
            AdapterKind::Composite => "composite",
        };
        f.write_str(name)
    }
}

/// Uniform interface over one persistence backend.
///
/// `get_all` returns records in insertion order, soft-deleted ones included.
#[async_trait]
pub trait Adapter: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> AdapterKind;

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Record>>;

    async fn get_all(&self, collection: &str) -> Result<Vec<Record>>;

    /// Store a new record. Fails with `RecordAlreadyExists` on id collision.
    async fn insert(&self, collection: &str, record: &Record) -> Result<()>;

    /// Replace a stored record. Fails with `NotFound` if absent.
    async fn update(&self, collection: &str, record: &Record) -> Result<()>;

    /// Physically remove a record. Returns whether it existed.
    async fn remove(&self, collection: &str, id: &str) -> Result<bool>;

    async fn bulk_insert(&self, collection: &str, records: &[Record]) -> Result<()> {
        for record in records {
            self.insert(collection, record).await?;
        }
        Ok(())
    }

    async fn bulk_update(&self, collection: &str, records: &[Record]) -> Result<()> {
        for record in records {
            self.update(collection, record).await?;
        }
        Ok(())
    }

    async fn bulk_remove(&self, collection: &str, ids: &[RecordId]) -> Result<usize> {
        let mut removed = 0;
        for id in ids {
            if self.remove(collection, id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Count records matching every predicate. Deleted records are not
    /// filtered implicitly.
    async fn count(&self, collection: &str, predicates: &[Predicate]) -> Result<usize> {
        let records = self.get_all(collection).await?;
        Ok(records
            .iter()
            .filter(|r| predicates.iter().all(|p| p.matches(r)))
            .count())
    }
}

/// Declared data-size class of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeClass {
    /// Fits in a few megabytes
    #[default]
    Small,
    /// Needs the on-device database
    Large,
    /// Large and mirrored to the remote API
    Shared,
}

/// Which backends the host can offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Availability {
    pub indexed: bool,
    pub remote: bool,
}

/// Outcome of adapter selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterChoice {
    KeyValue,
    Indexed,
    Composite,
}

/// Pick a backend from the size class and what is available.
///
/// Pure: the same inputs always give the same choice.
pub fn select_adapter(size: SizeClass, available: Availability) -> AdapterChoice {
    match size {
        SizeClass::Small => AdapterChoice::KeyValue,
        SizeClass::Large if available.indexed => AdapterChoice::Indexed,
        SizeClass::Large => AdapterChoice::KeyValue,
        SizeClass::Shared if available.indexed && available.remote => AdapterChoice::Composite,
        SizeClass::Shared if available.indexed => AdapterChoice::Indexed,
        SizeClass::Shared => AdapterChoice::KeyValue,
    }
}
