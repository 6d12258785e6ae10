//! # Groundwork Engine
//!
//! A schema-validated record store for applications that keep their data
//! on the device first and optionally share it through a remote API.
//!
//! The engine owns the rules around data: every write is validated against
//! a registered schema, version-checked, audited and made undoable. Where
//! the bytes live is decided by a pluggable [`Adapter`]:
//!
//! - [`KeyValueAdapter`] - one JSON document per collection in a quota-bound
//!   key-value store, for small data sets
//! - [`IndexedAdapter`] - SQLite, for large data sets
//! - [`RemoteAdapter`] - the HTTP record API served by `groundwork-server`
//! - [`CompositeAdapter`] - local first with write-through to remote, queuing
//!   what the remote rejects
//!
//! ## Core Concepts
//!
//! ### Records
//!
//! A [`Record`] carries an immutable `id`, millisecond timestamps, an
//! optional `deletedAt` soft-delete marker, a `version` that rises by one per
//! mutation, and the collection's own fields flattened next to them.
//!
//! ### Writes
//!
//! Mutations go through a [`Collection`]: `insert`, `update` (with an
//! optional expected version), `upsert`, `remove` (soft delete, honouring
//! cascade policies) and `restore`, plus bulk forms that share a batch id.
//! A [`Transaction`] applies several writes atomically.
//!
//! ### Side effects
//!
//! Each committed change runs hooks, notifies observers, appends to the
//! [`AuditLog`] and pushes an undo [`Command`], in commit order.
//!
//! ## Quick Start
//!
//! ```rust
//! use groundwork_engine::{CollectionSchema, FieldDef, FieldType, Store};
//! use serde_json::json;
//!
//! # async fn demo() -> groundwork_engine::Result<()> {
//! let store = Store::builder()
//!     .schema(CollectionSchema::new(
//!         "clients",
//!         vec![FieldDef::required("name", FieldType::String)],
//!     ))
//!     .build()
//!     .await?;
//!
//! let clients = store.collection("clients");
//! let acme = clients.insert(json!({"name": "Acme"})).await?;
//! let renamed = clients
//!     .update(&acme.id, json!({"name": "Acme Corp"}), Some(acme.version))
//!     .await?;
//! assert_eq!(renamed.version, 2);
//!
//! store.undo().await?;
//! let reverted = clients.get(&acme.id).await?;
//! assert_eq!(reverted.and_then(|r| r.get("name").cloned()), Some(json!("Acme")));
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod audit;
pub mod backup;
pub mod clock;
pub mod config;
pub mod error;
pub mod graph;
pub mod hooks;
pub mod kv;
pub mod query;
pub mod record;
pub mod registry;
pub mod schema;
pub mod store;
pub mod transaction;
pub mod undo;

// Re-export main types at crate root
pub use adapter::{
    select_adapter, Adapter, AdapterChoice, AdapterKind, Availability, CompositeAdapter, FlushReport,
    IndexedAdapter, KeyValueAdapter, PendingSync, RemoteAdapter, SizeClass, SyncOp,
};
pub use audit::{AuditContext, AuditEntry, AuditFilter, AuditLog, AuditOperation, FieldChange};
pub use backup::{Backup, BACKUP_FORMAT_VERSION};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AuditConfig, ConfigError, EngineConfig, RemoteConfig, UndoConfig};
pub use error::{Error, Result};
pub use graph::RecordArena;
pub use hooks::{ChangeEvent, HookContext, HookId, HookPhase, HookPoint, HookRegistry, MutationKind, Subscription};
pub use kv::{FileKv, KeyValueStore, KvError, MemoryKv};
pub use query::{
    AggregateFn, AggregateResult, AggregateSpec, Direction, Operator, Predicate, QueryBuilder, QueryDescriptor,
    SortKey,
};
pub use record::{Fields, Record};
pub use registry::{MigrationPlan, SchemaRegistry};
pub use schema::{
    CascadePolicy, CollectionSchema, Constraints, FieldDef, FieldType, Relation, RelationKind, Validator,
    Violation, ViolationKind,
};
pub use store::{
    BulkOptions, BulkReport, BulkUpdate, Collection, ImportOptions, ImportResult, Store, StoreBuilder,
};
pub use transaction::Transaction;
pub use undo::{BatchUndoReport, Command, CommandOp, UndoManager, UndoState};

/// Type aliases for clarity
pub type RecordId = String;
pub type CollectionName = String;
pub type Version = u64;
pub type Timestamp = u64;
pub type SchemaVersion = u32;
