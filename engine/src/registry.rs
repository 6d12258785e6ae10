//! Schema registry and record migrations.

use crate::error::Result;
use crate::record::{Fields, Record};
use crate::schema::{CollectionSchema, Relation, RelationKind};
use crate::{CollectionName, Error, SchemaVersion};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

type MigrationFn = Arc<dyn Fn(Fields) -> std::result::Result<Fields, String> + Send + Sync>;

/// An ordered chain of migration steps for one collection.
#[derive(Clone)]
pub struct MigrationPlan {
    collection: CollectionName,
    from: SchemaVersion,
    to: SchemaVersion,
    steps: Vec<MigrationFn>,
}

impl fmt::Debug for MigrationPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationPlan")
            .field("collection", &self.collection)
            .field("from", &self.from)
            .field("to", &self.to)
            .field("steps", &self.steps.len())
            .finish()
    }
}

impl MigrationPlan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn target(&self) -> SchemaVersion {
        self.to
    }

    /// Run every step over a copy of the record.
    ///
    /// The input is never modified; on failure nothing is returned to write
    /// back.
    pub fn apply(&self, record: &Record) -> Result<Record> {
        let mut fields = record.fields.clone();
        for step in &self.steps {
            fields = step(fields).map_err(|reason| Error::Migration {
                collection: self.collection.clone(),
                id: record.id.clone(),
                from: self.from,
                to: self.to,
                reason,
            })?;
        }
        let mut migrated = record.clone();
        migrated.fields = fields;
        migrated.schema_version = Some(self.to);
        Ok(migrated)
    }
}

/// Holds every registered collection schema.
#[derive(Default)]
pub struct SchemaRegistry {
    schemas: DashMap<CollectionName, Arc<CollectionSchema>>,
    migrations: DashMap<(CollectionName, SchemaVersion), MigrationFn>,
}

impl fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaRegistry")
            .field("collections", &self.names())
            .finish()
    }
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a schema to its collection name.
    ///
    /// Re-registering from the same owner replaces the schema, which is how
    /// modules bump versions.
    pub fn register(&self, schema: CollectionSchema) -> Result<()> {
        if let Some(existing) = self.schemas.get(&schema.name) {
            if existing.owner != schema.owner {
                return Err(Error::DuplicateSchema {
                    collection: schema.name.clone(),
                    owner: schema.owner.clone(),
                    existing_owner: existing.owner.clone(),
                });
            }
        }
        tracing::debug!(collection = %schema.name, version = schema.version, "schema registered");
        self.schemas.insert(schema.name.clone(), Arc::new(schema));
        Ok(())
    }

    /// Get a schema by collection name.
    pub fn get(&self, collection: &str) -> Result<Arc<CollectionSchema>> {
        self.schemas
            .get(collection)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| Error::SchemaNotFound(collection.to_string()))
    }

    pub fn contains(&self, collection: &str) -> bool {
        self.schemas.contains_key(collection)
    }

    /// Registered collection names, sorted.
    pub fn names(&self) -> Vec<CollectionName> {
        let mut names: Vec<_> = self.schemas.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Register the step that upgrades records from `from_version` to
    /// `from_version + 1`.
    pub fn register_migration<F>(&self, collection: impl Into<CollectionName>, from_version: SchemaVersion, step: F)
    where
        F: Fn(Fields) -> std::result::Result<Fields, String> + Send + Sync + 'static,
    {
        self.migrations
            .insert((collection.into(), from_version), Arc::new(step));
    }

    /// Build the chain of steps from `from` up to `to`.
    pub fn migrate(&self, collection: &str, from: SchemaVersion, to: SchemaVersion) -> Result<MigrationPlan> {
        let mut steps = Vec::new();
        for version in from..to {
            let step = self
                .migrations
                .get(&(collection.to_string(), version))
                .ok_or_else(|| Error::Migration {
                    collection: collection.to_string(),
                    id: "*".to_string(),
                    from,
                    to,
                    reason: format!("no migration registered from v{version}"),
                })?;
            steps.push(Arc::clone(step.value()));
        }
        Ok(MigrationPlan {
            collection: collection.to_string(),
            from,
            to,
            steps,
        })
    }

    /// Migrate a record to the current schema version if it is behind.
    ///
    /// Returns `None` when the record is already current.
    pub fn upgrade(&self, collection: &str, record: &Record) -> Result<Option<Record>> {
        let schema = self.get(collection)?;
        let stored = record.schema_version.unwrap_or(1);
        if stored >= schema.version {
            return Ok(None);
        }
        let plan = self.migrate(collection, stored, schema.version).map_err(|err| match err {
            Error::Migration { collection, from, to, reason, .. } => Error::Migration {
                collection,
                id: record.id.clone(),
                from,
                to,
                reason,
            },
            other => other,
        })?;
        plan.apply(record).map(Some)
    }

    /// Schema version per collection.
    pub fn manifest(&self) -> BTreeMap<CollectionName, SchemaVersion> {
        self.schemas
            .iter()
            .map(|e| (e.key().clone(), e.value().version))
            .collect()
    }

    /// Relations whose records point at `target`, resolved to the collection
    /// holding the foreign key.
    ///
    /// Each entry is `(referencing collection, relation)`. A link declared on
    /// both sides is reported once, preferring the `BelongsTo` declaration.
    pub fn references_to(&self, target: &str) -> Vec<(CollectionName, Relation)> {
        let mut refs: Vec<(CollectionName, Relation)> = Vec::new();
        for entry in self.schemas.iter() {
            for relation in &entry.value().relations {
                let holder = match relation.kind {
                    RelationKind::BelongsTo if relation.target == target => entry.key().clone(),
                    RelationKind::HasMany if entry.key() == target => relation.target.clone(),
                    _ => continue,
                };
                refs.push((holder, relation.clone()));
            }
        }
        refs.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then_with(|| a.1.foreign_key.cmp(&b.1.foreign_key))
                .then_with(|| kind_rank(a.1.kind).cmp(&kind_rank(b.1.kind)))
        });
        refs.dedup_by(|next, kept| next.0 == kept.0 && next.1.foreign_key == kept.1.foreign_key);
        refs
    }
}

fn kind_rank(kind: RelationKind) -> u8 {
    match kind {
        RelationKind::BelongsTo => 0,
        RelationKind::HasMany => 1,
    }
}
