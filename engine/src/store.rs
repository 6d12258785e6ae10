//! Store - the engine handle - and per-collection views.
//!
//! A [`Store`] is cheap to clone and owns everything the engine needs: the
//! schema registry, the selected persistence adapter, hooks, observers, the
//! audit log and the undo stacks. Every mutation goes through one write gate
//! (a tokio mutex around the audit and undo state), so mutations never
//! interleave and side effects follow commit order.
//!
//! Each mutation is planned first (settled records computed, validated and
//! version-checked against current state), then committed: before hooks,
//! adapter writes, then change events, after hooks, audit entries and undo
//! commands.

use crate::adapter::{
    select_adapter, Adapter, AdapterChoice, AdapterKind, CompositeAdapter, FlushReport,
    IndexedAdapter, KeyValueAdapter, PendingSync, RemoteAdapter,
};
use crate::audit::{AuditContext, AuditDraft, AuditEntry, AuditFilter, AuditLog, AuditOperation};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::hooks::{ChangeEvent, HookContext, HookRegistry, MutationKind, Observers, Subscription};
use crate::kv::{FileKv, KeyValueStore, MemoryKv};
use crate::query::{
    loose_eq, resolve_includes, AggregateResult, Operator, Predicate, QueryBuilder, QueryDescriptor,
};
use crate::record::{Fields, Record};
use crate::registry::SchemaRegistry;
use crate::schema::{CascadePolicy, CollectionSchema, Violation, ViolationKind};
use crate::undo::{BatchUndoReport, Command, CommandOp, UndoManager, UndoState};
use crate::{CollectionName, Error, RecordId, SchemaVersion, Version};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub(crate) fn new_batch_id() -> String {
    Uuid::new_v4().to_string()
}

/// State guarded by the write gate.
#[derive(Debug)]
pub(crate) struct Journal {
    pub(crate) audit: Option<AuditLog>,
    pub(crate) undo: UndoManager,
    pub(crate) context: AuditContext,
}

/// One planned record transition.
#[derive(Debug, Clone)]
pub(crate) struct Change {
    pub(crate) collection: CollectionName,
    pub(crate) id: RecordId,
    pub(crate) op: MutationKind,
    pub(crate) before: Option<Record>,
    pub(crate) after: Option<Record>,
}

impl Change {
    fn hook_context(&self, replay: bool) -> HookContext<'_> {
        HookContext {
            collection: &self.collection,
            record_id: &self.id,
            op: self.op,
            before: self.before.as_ref(),
            after: self.after.as_ref(),
            replay,
        }
    }

    fn audit_operation(&self) -> Option<AuditOperation> {
        match self.op {
            MutationKind::Insert => Some(AuditOperation::Insert),
            MutationKind::Update => Some(AuditOperation::Update),
            MutationKind::Delete => Some(AuditOperation::Delete),
            MutationKind::Restore => Some(AuditOperation::Restore),
            MutationKind::Purge => None,
        }
    }

    fn command_op(&self) -> Option<CommandOp> {
        let before = self.before.clone();
        let after = self.after.clone();
        match (self.op, before, after) {
            (MutationKind::Insert, _, Some(after)) => Some(CommandOp::Insert { after }),
            (MutationKind::Update, Some(before), Some(after)) => Some(CommandOp::Update { before, after }),
            (MutationKind::Delete, Some(before), Some(after)) => Some(CommandOp::Remove { before, after }),
            (MutationKind::Restore, Some(before), Some(after)) => Some(CommandOp::Restore { before, after }),
            (MutationKind::Purge, Some(before), _) => Some(CommandOp::Purge { before }),
            _ => None,
        }
    }

    /// The record as it stands after the change.
    pub(crate) fn settled(&self) -> Result<Record> {
        self.after
            .clone()
            .or_else(|| self.before.clone())
            .ok_or_else(|| Error::not_found(&self.collection, &self.id))
    }
}

/// Staged changes plus the state they imply.
#[derive(Debug, Default)]
pub(crate) struct Plan {
    overlay: BTreeMap<(CollectionName, RecordId), Option<Record>>,
    pub(crate) changes: Vec<Change>,
}

impl Plan {
    pub(crate) fn stage(&mut self, change: Change) {
        self.overlay.insert(
            (change.collection.clone(), change.id.clone()),
            change.after.clone(),
        );
        self.changes.push(change);
    }

    pub(crate) fn len(&self) -> usize {
        self.changes.len()
    }
}

/// How a commit is recorded.
#[derive(Debug, Clone)]
pub(crate) struct WriteMode {
    /// Write audit entries and undo commands
    pub(crate) record: bool,
    /// Undo or redo replay
    pub(crate) replay: bool,
    pub(crate) batch_id: Option<String>,
}

impl WriteMode {
    pub(crate) fn recorded(batch_id: Option<String>) -> Self {
        Self {
            record: true,
            replay: false,
            batch_id,
        }
    }

    fn replay() -> Self {
        Self {
            record: false,
            replay: true,
            batch_id: None,
        }
    }

    pub(crate) fn silent() -> Self {
        Self {
            record: false,
            replay: false,
            batch_id: None,
        }
    }
}

/// Whether a write took effect, durably or not.
pub(crate) fn took_effect<T>(result: &Result<T>) -> bool {
    matches!(result, Ok(_) | Err(Error::PersistenceDegraded { .. }))
}

#[derive(Debug)]
pub(crate) struct StoreInner {
    pub(crate) config: EngineConfig,
    pub(crate) registry: SchemaRegistry,
    pub(crate) adapter: Arc<dyn Adapter>,
    composite: Option<Arc<CompositeAdapter>>,
    pub(crate) clock: Arc<dyn Clock>,
    hooks: HookRegistry,
    observers: Arc<Observers>,
    pub(crate) gate: Mutex<Journal>,
    /// Schema version each collection was last migrated to
    opened: DashMap<CollectionName, SchemaVersion>,
    quarantine: DashMap<(CollectionName, RecordId), Error>,
}

/// The engine handle. Clones share state.
#[derive(Debug, Clone)]
pub struct Store {
    pub(crate) inner: Arc<StoreInner>,
}

/// Builder for [`Store`].
#[derive(Default)]
pub struct StoreBuilder {
    config: EngineConfig,
    adapter: Option<Arc<dyn Adapter>>,
    composite: Option<Arc<CompositeAdapter>>,
    kv: Option<Arc<dyn KeyValueStore>>,
    clock: Option<Arc<dyn Clock>>,
    schemas: Vec<CollectionSchema>,
}

impl fmt::Debug for StoreBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreBuilder")
            .field("config", &self.config)
            .field("adapter", &self.adapter.as_ref().map(|a| a.kind()))
            .field("schemas", &self.schemas.len())
            .finish()
    }
}

impl StoreBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Use this adapter instead of selecting one from the configuration.
    pub fn adapter(mut self, adapter: Arc<dyn Adapter>) -> Self {
        self.adapter = Some(adapter);
        self.composite = None;
        self
    }

    /// Use a composite adapter, keeping access to its pending queue.
    pub fn composite(mut self, adapter: Arc<CompositeAdapter>) -> Self {
        self.adapter = Some(adapter.clone());
        self.composite = Some(adapter);
        self
    }

    /// Key-value store for the audit log and the key-value tier.
    pub fn key_value(mut self, kv: Arc<dyn KeyValueStore>) -> Self {
        self.kv = Some(kv);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn schema(mut self, schema: CollectionSchema) -> Self {
        self.schemas.push(schema);
        self
    }

    pub async fn build(self) -> Result<Store> {
        let StoreBuilder {
            config,
            adapter,
            composite,
            kv,
            clock,
            schemas,
        } = self;

        let kv: Arc<dyn KeyValueStore> = match kv {
            Some(kv) => kv,
            None => match &config.data_dir {
                Some(dir) => Arc::new(FileKv::open(dir, config.kv_quota_bytes)?),
                None => Arc::new(MemoryKv::new(config.kv_quota_bytes)),
            },
        };

        let (adapter, composite) = match adapter {
            Some(adapter) => (adapter, composite),
            None => connect(&config, kv.clone()).await?,
        };

        let registry = SchemaRegistry::new();
        for schema in schemas {
            registry.register(schema)?;
        }

        let audit = config
            .audit
            .enabled
            .then(|| AuditLog::load(kv.clone(), &config.namespace, config.audit.max_entries));

        tracing::info!(
            namespace = %config.namespace,
            adapter = %adapter.kind(),
            audit = config.audit.enabled,
            undo = config.undo.enabled,
            "store opened"
        );

        Ok(Store {
            inner: Arc::new(StoreInner {
                gate: Mutex::new(Journal {
                    audit,
                    undo: UndoManager::new(config.undo.max_depth),
                    context: AuditContext::default(),
                }),
                config,
                registry,
                adapter,
                composite,
                clock: clock.unwrap_or_else(|| Arc::new(SystemClock)),
                hooks: HookRegistry::new(),
                observers: Arc::new(Observers::default()),
                opened: DashMap::new(),
                quarantine: DashMap::new(),
            }),
        })
    }
}

/// Build the adapter the configuration selects.
async fn connect(
    config: &EngineConfig,
    kv: Arc<dyn KeyValueStore>,
) -> Result<(Arc<dyn Adapter>, Option<Arc<CompositeAdapter>>)> {
    let choice = select_adapter(config.size_class, config.availability());
    tracing::info!(?choice, size_class = ?config.size_class, "adapter selected");

    let indexed_url = || {
        config
            .indexed_url
            .as_deref()
            .ok_or_else(|| Error::Storage("indexed tier selected without indexed_url".into()))
    };

    match choice {
        AdapterChoice::KeyValue => Ok((Arc::new(KeyValueAdapter::new(kv, config.namespace.clone())), None)),
        AdapterChoice::Indexed => {
            let adapter = IndexedAdapter::connect(indexed_url()?).await?;
            Ok((Arc::new(adapter), None))
        }
        AdapterChoice::Composite => {
            let remote_config = config
                .remote
                .as_ref()
                .ok_or_else(|| Error::Storage("composite tier selected without remote config".into()))?;
            let local = Arc::new(IndexedAdapter::connect(indexed_url()?).await?);
            let remote = Arc::new(RemoteAdapter::new(remote_config)?);
            let composite = Arc::new(CompositeAdapter::new(local, remote));
            let adapter: Arc<dyn Adapter> = composite.clone();
            Ok((adapter, Some(composite)))
        }
    }
}

impl Store {
    pub fn builder() -> StoreBuilder {
        StoreBuilder::default()
    }

    /// Open a store from configuration alone.
    pub async fn open(config: EngineConfig) -> Result<Self> {
        Self::builder().config(config).build().await
    }

    /// A handle on one collection. The schema need not exist yet; operations
    /// fail with `SchemaNotFound` until it does.
    pub fn collection(&self, name: impl Into<CollectionName>) -> Collection {
        Collection {
            store: self.clone(),
            name: name.into(),
        }
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.inner.registry
    }

    /// Register a schema. A version bump triggers migration on next use.
    pub fn register(&self, schema: CollectionSchema) -> Result<()> {
        self.inner.registry.register(schema)
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.inner.hooks
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn adapter_kind(&self) -> AdapterKind {
        self.inner.adapter.kind()
    }

    /// Observe every committed mutation in every collection.
    pub fn on_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.inner.observers.subscribe(None, handler)
    }

    /// Identity attached to subsequent audit entries.
    pub async fn set_audit_context(&self, context: AuditContext) {
        self.inner.gate.lock().await.context = context;
    }

    /// Audit entries matching a filter, in append order. Empty when auditing
    /// is disabled.
    pub async fn audit(&self, filter: &AuditFilter) -> Vec<AuditEntry> {
        let journal = self.inner.gate.lock().await;
        journal
            .audit
            .as_ref()
            .map(|log| log.query(filter))
            .unwrap_or_default()
    }

    pub async fn audit_len(&self) -> usize {
        let journal = self.inner.gate.lock().await;
        journal.audit.as_ref().map_or(0, AuditLog::len)
    }

    /// Ids of records whose migration failed.
    pub fn quarantined(&self, collection: &str) -> Vec<RecordId> {
        let mut ids: Vec<RecordId> = self
            .inner
            .quarantine
            .iter()
            .filter(|e| e.key().0 == collection)
            .map(|e| e.key().1.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Retry queued remote writes. `None` without a composite adapter.
    pub async fn flush_pending(&self) -> Option<FlushReport> {
        match &self.inner.composite {
            Some(composite) => Some(composite.flush_pending().await),
            None => None,
        }
    }

    /// Remote writes not yet accepted.
    pub async fn pending_sync(&self) -> Vec<PendingSync> {
        match &self.inner.composite {
            Some(composite) => composite.pending().await,
            None => Vec::new(),
        }
    }

    pub async fn undo_state(&self) -> UndoState {
        self.inner.gate.lock().await.undo.state()
    }

    pub async fn can_undo(&self) -> bool {
        self.inner.gate.lock().await.undo.can_undo()
    }

    pub async fn can_redo(&self) -> bool {
        self.inner.gate.lock().await.undo.can_redo()
    }

    /// Revert the most recent step.
    ///
    /// Every command of the step is reverted in one commit: either all of
    /// them take effect or none do.
    pub async fn undo(&self) -> Result<()> {
        let mut journal = self.inner.gate.lock().await;
        let step = journal.undo.pop_undo().ok_or(Error::NothingToUndo)?;

        let inverses: Vec<_> = step
            .iter()
            .rev()
            .map(|c| (c.collection.clone(), c.op.inverse()))
            .collect();
        let result = self.inner.replay(&mut journal, &inverses).await;
        if took_effect(&result) {
            journal.undo.push_undone(step);
        } else {
            journal.undo.restore_undo(step);
        }
        result
    }

    /// Re-apply the most recently reverted step, all or nothing.
    pub async fn redo(&self) -> Result<()> {
        let mut journal = self.inner.gate.lock().await;
        let step = journal.undo.pop_redo().ok_or(Error::NothingToRedo)?;

        let forward: Vec<_> = step.iter().map(|c| (c.collection.clone(), c.op.clone())).collect();
        let result = self.inner.replay(&mut journal, &forward).await;
        if took_effect(&result) {
            journal.undo.push_redone(step);
        } else {
            journal.undo.restore_redo(step);
        }
        result
    }

    /// Revert every command of a batch, newest first.
    ///
    /// Commands that cannot be reverted stay on the undo stack and are
    /// listed in the report; the reverted ones become one redo step.
    pub async fn undo_batch(&self, batch_id: &str) -> Result<BatchUndoReport> {
        let mut journal = self.inner.gate.lock().await;
        let commands = journal.undo.batch(batch_id);
        if commands.is_empty() {
            return Err(Error::NothingToUndo);
        }

        let mut report = BatchUndoReport {
            batch_id: batch_id.to_string(),
            reverted: Vec::new(),
            failed: Vec::new(),
        };
        let mut reverted = Vec::new();
        for command in commands {
            let inverse = [(command.collection.clone(), command.op.inverse())];
            let result = self.inner.replay(&mut journal, &inverse).await;
            match result {
                Ok(()) | Err(Error::PersistenceDegraded { .. }) => {
                    report.reverted.push(command.record_id().to_string());
                    reverted.push(command);
                }
                Err(err) => report.failed.push((command.record_id().to_string(), err)),
            }
        }

        let ids: Vec<String> = reverted.iter().map(|c| c.id.clone()).collect();
        journal.undo.remove(&ids);
        reverted.reverse();
        journal.undo.push_undone(reverted);

        tracing::debug!(
            batch_id,
            reverted = report.reverted.len(),
            failed = report.failed.len(),
            "batch undone"
        );
        Ok(report)
    }
}

impl StoreInner {
    /// Migrate a collection to its current schema version if needed.
    ///
    /// Must be called with the write gate held.
    pub(crate) async fn ensure_migrated(&self, collection: &str) -> Result<Arc<CollectionSchema>> {
        let schema = self.registry.get(collection)?;
        if self.opened.get(collection).map(|v| *v) == Some(schema.version) {
            return Ok(schema);
        }

        let records = self.adapter.get_all(collection).await?;
        let mut migrated = Vec::new();
        for record in &records {
            let key = (collection.to_string(), record.id.clone());
            match self.registry.upgrade(collection, record) {
                Ok(Some(upgraded)) => {
                    self.quarantine.remove(&key);
                    migrated.push(upgraded);
                }
                Ok(None) => {
                    self.quarantine.remove(&key);
                }
                Err(err) => {
                    tracing::warn!(collection, id = %record.id, error = %err, "record quarantined");
                    self.quarantine.insert(key, err);
                }
            }
        }

        if !migrated.is_empty() {
            match self.adapter.bulk_update(collection, &migrated).await {
                Ok(()) => {}
                Err(err @ Error::PersistenceDegraded { .. }) => {
                    tracing::warn!(collection, error = %err, "migrated records not durable");
                }
                Err(err) => return Err(err),
            }
            tracing::info!(
                collection,
                count = migrated.len(),
                to = schema.version,
                "records migrated"
            );
        }

        self.opened.insert(collection.to_string(), schema.version);
        Ok(schema)
    }

    /// Migrate outside the gate, taking it only when there is work to do.
    async fn open(&self, collection: &str) -> Result<Arc<CollectionSchema>> {
        let schema = self.registry.get(collection)?;
        if self.opened.get(collection).map(|v| *v) == Some(schema.version) {
            return Ok(schema);
        }
        let _journal = self.gate.lock().await;
        self.ensure_migrated(collection).await
    }

    fn check_quarantine(&self, collection: &str, id: &str) -> Result<()> {
        match self.quarantine.get(&(collection.to_string(), id.to_string())) {
            Some(err) => Err(err.value().clone()),
            None => Ok(()),
        }
    }

    fn has_quarantine(&self, collection: &str) -> bool {
        self.quarantine.iter().any(|e| e.key().0 == collection)
    }

    fn without_quarantined(&self, collection: &str, records: Vec<Record>) -> Vec<Record> {
        if !self.has_quarantine(collection) {
            return records;
        }
        let before = records.len();
        let visible: Vec<Record> = records
            .into_iter()
            .filter(|r| self.check_quarantine(collection, &r.id).is_ok())
            .collect();
        tracing::warn!(collection, skipped = before - visible.len(), "skipping quarantined records");
        visible
    }

    /// Every readable record, soft-deleted ones included.
    async fn load_all(&self, collection: &str) -> Result<Vec<Record>> {
        self.open(collection).await?;
        let records = self.adapter.get_all(collection).await?;
        Ok(self.without_quarantined(collection, records))
    }

    /// The record as the plan would leave it.
    async fn current(&self, plan: &Plan, collection: &str, id: &str) -> Result<Option<Record>> {
        if let Some(staged) = plan.overlay.get(&(collection.to_string(), id.to_string())) {
            return Ok(staged.clone());
        }
        self.check_quarantine(collection, id)?;
        self.adapter.get(collection, id).await
    }

    /// Every record of a collection as the plan would leave it.
    async fn current_all(&self, plan: &Plan, collection: &str) -> Result<Vec<Record>> {
        self.ensure_migrated(collection).await?;
        let stored = self.without_quarantined(collection, self.adapter.get_all(collection).await?);

        let mut out = Vec::with_capacity(stored.len());
        for record in stored {
            match plan.overlay.get(&(collection.to_string(), record.id.clone())) {
                Some(Some(staged)) => out.push(staged.clone()),
                Some(None) => {}
                None => out.push(record),
            }
        }
        for ((c, id), staged) in &plan.overlay {
            if let Some(staged) = staged {
                if c == collection && !out.iter().any(|r| r.id == *id) {
                    out.push(staged.clone());
                }
            }
        }
        Ok(out)
    }

    fn validate(&self, schema: &CollectionSchema, record: &Record) -> Result<()> {
        let violations = schema.validate(&record.fields);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation {
                collection: schema.name.clone(),
                violations,
            })
        }
    }

    pub(crate) async fn plan_insert(&self, plan: &mut Plan, collection: &str, data: Fields) -> Result<()> {
        let schema = self.ensure_migrated(collection).await?;

        let id = supplied_id(&data).unwrap_or_else(|| Uuid::new_v4().to_string());
        if self.current(plan, collection, &id).await?.is_some() {
            return Err(Error::RecordAlreadyExists {
                collection: collection.to_string(),
                id,
            });
        }

        let mut record = Record::new(id.clone(), data, self.clock.now());
        record.schema_version = Some(schema.version);
        self.validate(&schema, &record)?;

        plan.stage(Change {
            collection: collection.to_string(),
            id,
            op: MutationKind::Insert,
            before: None,
            after: Some(record),
        });
        Ok(())
    }

    pub(crate) async fn plan_update(
        &self,
        plan: &mut Plan,
        collection: &str,
        id: &str,
        patch: &Fields,
        expected_version: Option<Version>,
    ) -> Result<()> {
        let schema = self.ensure_migrated(collection).await?;
        let stored = self
            .current(plan, collection, id)
            .await?
            .filter(Record::is_active)
            .ok_or_else(|| Error::not_found(collection, id))?;

        if let Some(expected) = expected_version {
            if expected != stored.version {
                return Err(Error::OptimisticLock {
                    collection: collection.to_string(),
                    id: id.to_string(),
                    expected,
                    actual: stored.version,
                });
            }
        }

        let mut next = stored.clone();
        next.apply_patch(patch, self.clock.now());
        next.schema_version = Some(schema.version);
        self.validate(&schema, &next)?;

        plan.stage(Change {
            collection: collection.to_string(),
            id: id.to_string(),
            op: MutationKind::Update,
            before: Some(stored),
            after: Some(next),
        });
        Ok(())
    }

    /// Stage a soft delete plus whatever the cascade policies of referencing
    /// collections require. Nullified references are staged first; deletes
    /// follow deepest first, so the requested record is staged last.
    pub(crate) async fn plan_remove(&self, plan: &mut Plan, collection: &str, id: &str) -> Result<()> {
        self.ensure_migrated(collection).await?;
        let root = self
            .current(plan, collection, id)
            .await?
            .filter(Record::is_active)
            .ok_or_else(|| Error::not_found(collection, id))?;

        let mut visited: HashSet<(CollectionName, RecordId)> = HashSet::new();
        visited.insert((collection.to_string(), root.id.clone()));
        let mut doomed: Vec<(CollectionName, Record)> = vec![(collection.to_string(), root)];
        let mut nullified: BTreeMap<(CollectionName, RecordId), Record> = BTreeMap::new();

        let mut cursor = 0;
        while cursor < doomed.len() {
            let (parent_collection, parent) = doomed[cursor].clone();
            cursor += 1;

            for (holder, relation) in self.registry.references_to(&parent_collection) {
                let parent_id = Value::String(parent.id.clone());
                let referencing: Vec<Record> = self
                    .current_all(plan, &holder)
                    .await?
                    .into_iter()
                    .filter(|r| r.is_active())
                    .filter(|r| r.get(&relation.foreign_key).is_some_and(|v| loose_eq(v, &parent_id)))
                    .filter(|r| !visited.contains(&(holder.clone(), r.id.clone())))
                    .collect();
                if referencing.is_empty() {
                    continue;
                }

                match relation.on_delete {
                    CascadePolicy::Restrict => {
                        return Err(Error::RelationRestricted {
                            collection: parent_collection.clone(),
                            id: parent.id.clone(),
                            referenced_by: holder,
                        });
                    }
                    CascadePolicy::Cascade => {
                        for child in referencing {
                            visited.insert((holder.clone(), child.id.clone()));
                            doomed.push((holder.clone(), child));
                        }
                    }
                    CascadePolicy::Nullify => {
                        for child in referencing {
                            nullified
                                .entry((holder.clone(), child.id.clone()))
                                .or_insert(child)
                                .fields
                                .insert(relation.foreign_key.clone(), Value::Null);
                        }
                    }
                }
            }
        }

        let now = self.clock.now();
        for ((holder, child_id), patched) in nullified {
            if visited.contains(&(holder.clone(), child_id.clone())) {
                continue;
            }
            let schema = self.registry.get(&holder)?;
            let before = self
                .current(plan, &holder, &child_id)
                .await?
                .ok_or_else(|| Error::not_found(&holder, &child_id))?;
            let mut next = before.clone();
            next.replace_fields(patched.fields, now);
            self.validate(&schema, &next)?;
            plan.stage(Change {
                collection: holder,
                id: child_id,
                op: MutationKind::Update,
                before: Some(before),
                after: Some(next),
            });
        }

        for (holder, record) in doomed.into_iter().rev() {
            let mut next = record.clone();
            next.mark_deleted(now);
            plan.stage(Change {
                collection: holder,
                id: record.id.clone(),
                op: MutationKind::Delete,
                before: Some(record),
                after: Some(next),
            });
        }
        Ok(())
    }

    pub(crate) async fn plan_restore(&self, plan: &mut Plan, collection: &str, id: &str) -> Result<()> {
        self.ensure_migrated(collection).await?;
        let stored = self
            .current(plan, collection, id)
            .await?
            .ok_or_else(|| Error::not_found(collection, id))?;
        if stored.is_active() {
            return Err(Error::NotDeleted {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        }

        let mut next = stored.clone();
        next.mark_restored(self.clock.now());
        plan.stage(Change {
            collection: collection.to_string(),
            id: id.to_string(),
            op: MutationKind::Restore,
            before: Some(stored),
            after: Some(next),
        });
        Ok(())
    }

    /// Stage one command operation exactly, without cascades.
    async fn plan_command(&self, plan: &mut Plan, collection: &str, op: &CommandOp) -> Result<()> {
        self.ensure_migrated(collection).await?;
        let id = op.record_id().to_string();
        let stored = self.current(plan, collection, &id).await?;
        let now = self.clock.now();

        let (kind, before, after) = match (op, stored) {
            (CommandOp::Insert { after }, None) => (MutationKind::Insert, None, Some(after.clone())),
            (CommandOp::Insert { .. }, Some(_)) => {
                return Err(Error::RecordAlreadyExists {
                    collection: collection.to_string(),
                    id,
                })
            }
            (CommandOp::Purge { .. }, Some(stored)) => (MutationKind::Purge, Some(stored), None),
            (CommandOp::Update { after, .. }, Some(stored)) => {
                let mut next = stored.clone();
                next.replace_fields(after.fields.clone(), now);
                (MutationKind::Update, Some(stored), Some(next))
            }
            (CommandOp::Remove { .. }, Some(stored)) if stored.is_active() => {
                let mut next = stored.clone();
                next.mark_deleted(now);
                (MutationKind::Delete, Some(stored), Some(next))
            }
            (CommandOp::Restore { .. }, Some(stored)) => {
                if stored.is_active() {
                    return Err(Error::NotDeleted {
                        collection: collection.to_string(),
                        id,
                    });
                }
                let mut next = stored.clone();
                next.mark_restored(now);
                (MutationKind::Restore, Some(stored), Some(next))
            }
            _ => return Err(Error::not_found(collection, &id)),
        };

        plan.stage(Change {
            collection: collection.to_string(),
            id,
            op: kind,
            before,
            after,
        });
        Ok(())
    }

    /// Apply command operations in order as one unaudited commit.
    async fn replay(&self, journal: &mut Journal, ops: &[(CollectionName, CommandOp)]) -> Result<()> {
        let mut plan = Plan::default();
        for (collection, op) in ops {
            self.plan_command(&mut plan, collection, op).await?;
        }
        self.commit(journal, plan, &WriteMode::replay()).await.map(|_| ())
    }

    async fn apply_change(&self, change: &Change) -> Result<()> {
        let collection = change.collection.as_str();
        match (change.op, &change.after) {
            (MutationKind::Purge, _) => self.adapter.remove(collection, &change.id).await.map(|_| ()),
            (MutationKind::Insert, Some(record)) => self.adapter.insert(collection, record).await,
            (_, Some(record)) => self.adapter.update(collection, record).await,
            (_, None) => Err(Error::not_found(collection, &change.id)),
        }
    }

    /// Put already written changes back, newest first.
    async fn rollback(&self, applied: &[Change]) {
        for change in applied.iter().rev() {
            let collection = change.collection.as_str();
            let result = match (change.op, &change.before) {
                (MutationKind::Insert, _) => self.adapter.remove(collection, &change.id).await.map(|_| ()),
                (MutationKind::Purge, Some(before)) => self.adapter.insert(collection, before).await,
                (_, Some(before)) => self.adapter.update(collection, before).await,
                (_, None) => Ok(()),
            };
            if !took_effect(&result) {
                if let Err(err) = result {
                    tracing::warn!(collection, id = %change.id, error = %err, "rollback failed");
                }
            }
        }
    }

    /// Run before hooks, write every change, then emit side effects.
    ///
    /// A mid-way adapter failure rolls back what was already written. A
    /// `PersistenceDegraded` write counts as applied: side effects still
    /// run and the error is returned afterwards.
    pub(crate) async fn commit(&self, journal: &mut Journal, plan: Plan, mode: &WriteMode) -> Result<Vec<Change>> {
        let changes = plan.changes;

        for change in &changes {
            self.hooks
                .run_before(&change.hook_context(mode.replay))
                .map_err(|(point, reason)| Error::HookVeto {
                    hook: point.to_string(),
                    reason,
                })?;
        }

        let mut degraded = None;
        for (applied, change) in changes.iter().enumerate() {
            match self.apply_change(change).await {
                Ok(()) => {}
                Err(err @ Error::PersistenceDegraded { .. }) => {
                    tracing::warn!(collection = %change.collection, id = %change.id, error = %err, "write not durable");
                    degraded.get_or_insert(err);
                }
                Err(err) => {
                    self.rollback(&changes[..applied]).await;
                    return Err(err);
                }
            }
        }

        let batch_id = mode
            .batch_id
            .clone()
            .or_else(|| (mode.record && changes.len() > 1).then(new_batch_id));
        for change in &changes {
            self.finish(journal, change, mode, batch_id.as_deref());
        }

        match degraded {
            Some(err) => Err(err),
            None => Ok(changes),
        }
    }

    fn finish(&self, journal: &mut Journal, change: &Change, mode: &WriteMode, batch_id: Option<&str>) {
        tracing::debug!(
            collection = %change.collection,
            id = %change.id,
            op = %change.op,
            version = change.after.as_ref().map(|r| r.version),
            replay = mode.replay,
            "mutation committed"
        );

        self.observers.emit(&ChangeEvent {
            collection: change.collection.clone(),
            record_id: change.id.clone(),
            operation: change.op,
            before: change.before.clone(),
            after: change.after.clone(),
            batch_id: batch_id.map(str::to_string),
        });
        self.hooks.run_after(&change.hook_context(mode.replay));

        if !mode.record {
            return;
        }
        if let (Some(audit), Some(operation)) = (journal.audit.as_mut(), change.audit_operation()) {
            audit.record(
                AuditDraft {
                    collection: change.collection.clone(),
                    record_id: change.id.clone(),
                    operation,
                    before: change.before.clone(),
                    after: change.after.clone(),
                    batch_id: batch_id.map(str::to_string),
                },
                &journal.context,
                self.clock.now(),
            );
        }
        if self.config.undo.enabled {
            if let Some(op) = change.command_op() {
                journal
                    .undo
                    .push(Command::new(change.collection.clone(), op, batch_id.map(str::to_string)));
            }
        }
    }
}

/// Caller-chosen id: a non-empty string, or a number in its decimal form.
fn supplied_id(data: &Fields) -> Option<RecordId> {
    match data.get("id") {
        Some(Value::String(id)) if !id.is_empty() => Some(id.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

/// Turn caller data into a field map.
pub(crate) fn into_fields(collection: &str, data: Value) -> Result<Fields> {
    match data {
        Value::Object(map) => Ok(map),
        other => Err(Error::Validation {
            collection: collection.to_string(),
            violations: vec![Violation::new(
                "$",
                ViolationKind::TypeMismatch,
                format!("expected Object, got {other}"),
            )],
        }),
    }
}

type ProgressFn = dyn Fn(usize, usize) + Send + Sync;

/// Options for bulk operations.
#[derive(Clone, Default)]
pub struct BulkOptions {
    on_progress: Option<Arc<ProgressFn>>,
    cancel: Option<CancellationToken>,
    batch_id: Option<String>,
}

impl fmt::Debug for BulkOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkOptions")
            .field("on_progress", &self.on_progress.is_some())
            .field("cancel", &self.cancel)
            .field("batch_id", &self.batch_id)
            .finish()
    }
}

impl BulkOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called with `(done, total)` after every item.
    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(usize, usize) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(callback));
        self
    }

    /// Checked between items.
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn batch_id(mut self, batch_id: impl Into<String>) -> Self {
        self.batch_id = Some(batch_id.into());
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }
}

/// One item of a bulk update.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkUpdate {
    pub id: RecordId,
    pub patch: Value,
    pub expected_version: Option<Version>,
}

impl BulkUpdate {
    pub fn new(id: impl Into<RecordId>, patch: Value) -> Self {
        Self {
            id: id.into(),
            patch,
            expected_version: None,
        }
    }

    pub fn expecting(mut self, version: Version) -> Self {
        self.expected_version = Some(version);
        self
    }
}

/// Outcome of a bulk operation.
#[derive(Debug)]
pub struct BulkReport {
    /// One result per processed item, in input order
    pub results: Vec<Result<Record>>,
    /// Items that committed
    pub completed: usize,
    /// Stopped early by the cancellation token
    pub cancelled: bool,
    /// Shared by every audit entry and undo command of the operation
    pub batch_id: String,
}

enum BulkItem {
    Insert(Value),
    Update(BulkUpdate),
    Remove(RecordId),
}

/// Options for [`Collection::import_json`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportOptions {
    /// Keep existing records instead of replacing the collection
    pub merge: bool,
}

impl ImportOptions {
    pub fn merge() -> Self {
        Self { merge: true }
    }

    pub fn replace() -> Self {
        Self { merge: false }
    }
}

/// Outcome of an import.
#[derive(Debug, Default)]
pub struct ImportResult {
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: Vec<(RecordId, Error)>,
}

impl ImportResult {
    pub(crate) fn absorb(&mut self, other: ImportResult) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.failed.extend(other.failed);
    }
}

/// A handle on one collection of a [`Store`].
#[derive(Debug, Clone)]
pub struct Collection {
    store: Store,
    name: CollectionName,
}

impl Collection {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    fn inner(&self) -> &StoreInner {
        &self.store.inner
    }

    /// A live record by id. Soft-deleted records read as `None`.
    pub async fn get(&self, id: &str) -> Result<Option<Record>> {
        let inner = self.inner();
        inner.open(&self.name).await?;
        inner.check_quarantine(&self.name, id)?;
        Ok(inner.adapter.get(&self.name, id).await?.filter(Record::is_active))
    }

    /// Every live record, in insertion order.
    pub async fn get_all(&self) -> Result<Vec<Record>> {
        let records = self.inner().load_all(&self.name).await?;
        Ok(records.into_iter().filter(Record::is_active).collect())
    }

    pub fn query(&self) -> QueryBuilder {
        QueryBuilder::new(self.clone())
    }

    /// Number of live records.
    pub async fn count(&self) -> Result<usize> {
        self.query().count().await
    }

    pub(crate) async fn load_all(&self) -> Result<Vec<Record>> {
        self.inner().load_all(&self.name).await
    }

    pub(crate) async fn run_query(&self, descriptor: &QueryDescriptor) -> Result<Vec<Record>> {
        let inner = self.inner();
        let mut records = descriptor.apply(self.load_all().await?);
        if !descriptor.include.is_empty() {
            for target in self.include_targets(&descriptor.include)? {
                inner.open(&target).await?;
            }
            resolve_includes(
                &mut records,
                &self.name,
                &descriptor.include,
                &inner.registry,
                inner.adapter.as_ref(),
            )
            .await?;
        }
        Ok(records)
    }

    /// Collections reached by include paths.
    fn include_targets(&self, paths: &[String]) -> Result<Vec<CollectionName>> {
        let mut targets = Vec::new();
        for path in paths {
            let mut current = self.name.clone();
            for segment in path.split('.') {
                let schema = self.inner().registry.get(&current)?;
                let relation = schema.relation(segment).ok_or_else(|| Error::UnknownRelation {
                    collection: current.clone(),
                    relation: segment.to_string(),
                })?;
                current = relation.target.clone();
                if !targets.contains(&current) {
                    targets.push(current.clone());
                }
            }
        }
        Ok(targets)
    }

    pub(crate) async fn run_count(&self, descriptor: &QueryDescriptor) -> Result<usize> {
        let inner = self.inner();
        inner.open(&self.name).await?;
        if inner.has_quarantine(&self.name) {
            return Ok(descriptor.count(&self.load_all().await?));
        }

        let mut predicates = descriptor.predicates.clone();
        if !descriptor.include_deleted {
            predicates.push(Predicate::new("deletedAt", Operator::IsNull, Value::Null));
        }
        inner.adapter.count(&self.name, &predicates).await
    }

    pub(crate) async fn run_aggregate(&self, descriptor: &QueryDescriptor) -> Result<Option<AggregateResult>> {
        Ok(descriptor.aggregate(&self.load_all().await?))
    }

    /// Insert a new record. `data["id"]` is used as the id when present.
    pub async fn insert(&self, data: Value) -> Result<Record> {
        let fields = into_fields(&self.name, data)?;
        let inner = self.inner();
        let mut journal = inner.gate.lock().await;
        let mut plan = Plan::default();
        inner.plan_insert(&mut plan, &self.name, fields).await?;
        settled_first(inner.commit(&mut journal, plan, &WriteMode::recorded(None)).await?)
    }

    /// Shallow-merge `patch` into a live record.
    ///
    /// With `expected_version`, fails with `OptimisticLock` unless the
    /// stored version matches.
    pub async fn update(&self, id: &str, patch: Value, expected_version: Option<Version>) -> Result<Record> {
        let patch = into_fields(&self.name, patch)?;
        let inner = self.inner();
        let mut journal = inner.gate.lock().await;
        let mut plan = Plan::default();
        inner
            .plan_update(&mut plan, &self.name, id, &patch, expected_version)
            .await?;
        settled_first(inner.commit(&mut journal, plan, &WriteMode::recorded(None)).await?)
    }

    /// Update when `data["id"]` names a live record, insert otherwise.
    pub async fn upsert(&self, data: Value) -> Result<Record> {
        let fields = into_fields(&self.name, data)?;
        let inner = self.inner();
        let mut journal = inner.gate.lock().await;
        let mut plan = Plan::default();

        let existing = match supplied_id(&fields) {
            Some(id) => {
                inner.ensure_migrated(&self.name).await?;
                inner
                    .current(&plan, &self.name, &id)
                    .await?
                    .filter(Record::is_active)
                    .map(|r| r.id)
            }
            None => None,
        };
        match existing {
            Some(id) => inner.plan_update(&mut plan, &self.name, &id, &fields, None).await?,
            None => inner.plan_insert(&mut plan, &self.name, fields).await?,
        }
        settled_first(inner.commit(&mut journal, plan, &WriteMode::recorded(None)).await?)
    }

    /// Soft delete, applying cascade policies of referencing collections.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let inner = self.inner();
        let mut journal = inner.gate.lock().await;
        let mut plan = Plan::default();
        inner.plan_remove(&mut plan, &self.name, id).await?;
        inner
            .commit(&mut journal, plan, &WriteMode::recorded(None))
            .await
            .map(|_| ())
    }

    /// Clear the deletion marker of a soft-deleted record.
    pub async fn restore(&self, id: &str) -> Result<Record> {
        let inner = self.inner();
        let mut journal = inner.gate.lock().await;
        let mut plan = Plan::default();
        inner.plan_restore(&mut plan, &self.name, id).await?;
        settled_first(inner.commit(&mut journal, plan, &WriteMode::recorded(None)).await?)
    }

    pub async fn bulk_insert(&self, items: Vec<Value>, options: BulkOptions) -> BulkReport {
        self.run_bulk(items.into_iter().map(BulkItem::Insert).collect(), options)
            .await
    }

    pub async fn bulk_update(&self, items: Vec<BulkUpdate>, options: BulkOptions) -> BulkReport {
        self.run_bulk(items.into_iter().map(BulkItem::Update).collect(), options)
            .await
    }

    /// Soft-delete many records. Each result holds the deleted record.
    pub async fn bulk_remove(&self, ids: Vec<RecordId>, options: BulkOptions) -> BulkReport {
        self.run_bulk(ids.into_iter().map(BulkItem::Remove).collect(), options)
            .await
    }

    /// Apply items one by one under a single hold of the write gate.
    async fn run_bulk(&self, items: Vec<BulkItem>, options: BulkOptions) -> BulkReport {
        let inner = self.inner();
        let batch_id = options.batch_id.clone().unwrap_or_else(new_batch_id);
        let mode = WriteMode::recorded(Some(batch_id.clone()));
        let total = items.len();

        let mut journal = inner.gate.lock().await;
        let mut results = Vec::with_capacity(total);
        let mut cancelled = false;

        for item in items {
            if options.is_cancelled() {
                cancelled = true;
                break;
            }
            let result = self.apply_item(&mut journal, item, &mode).await;
            results.push(result);
            if let Some(progress) = &options.on_progress {
                progress(results.len(), total);
            }
        }
        drop(journal);

        let completed = results.iter().filter(|r| took_effect(r)).count();
        tracing::debug!(
            collection = %self.name,
            %batch_id,
            total,
            completed,
            cancelled,
            "bulk operation finished"
        );
        BulkReport {
            results,
            completed,
            cancelled,
            batch_id,
        }
    }

    async fn apply_item(&self, journal: &mut Journal, item: BulkItem, mode: &WriteMode) -> Result<Record> {
        let inner = self.inner();
        let mut plan = Plan::default();
        match item {
            BulkItem::Insert(data) => {
                let fields = into_fields(&self.name, data)?;
                inner.plan_insert(&mut plan, &self.name, fields).await?;
                settled_first(inner.commit(journal, plan, mode).await?)
            }
            BulkItem::Update(update) => {
                let patch = into_fields(&self.name, update.patch)?;
                inner
                    .plan_update(&mut plan, &self.name, &update.id, &patch, update.expected_version)
                    .await?;
                settled_first(inner.commit(journal, plan, mode).await?)
            }
            BulkItem::Remove(id) => {
                inner.plan_remove(&mut plan, &self.name, &id).await?;
                settled_last(inner.commit(journal, plan, mode).await?)
            }
        }
    }

    /// Observe committed mutations of this collection.
    pub fn on_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.inner().observers.subscribe(Some(self.name.clone()), handler)
    }

    /// Every readable record, soft-deleted ones included, metadata intact.
    pub async fn export_json(&self) -> Result<Vec<Record>> {
        self.load_all().await
    }

    /// Load records verbatim.
    ///
    /// Without `merge` the collection is emptied first. With `merge` an
    /// existing record is replaced only by a copy with a higher version, or
    /// the same version and a later `updatedAt`. Every written record is
    /// validated; failures are reported per record. Writes share one batch
    /// id, so an import can be reverted with `undo_batch`.
    pub async fn import_json(&self, records: Vec<Record>, options: ImportOptions) -> Result<ImportResult> {
        let inner = self.inner();
        let mut journal = inner.gate.lock().await;
        self.import_locked(&mut journal, records, options, None).await
    }

    pub(crate) async fn import_locked(
        &self,
        journal: &mut Journal,
        records: Vec<Record>,
        options: ImportOptions,
        batch_id: Option<String>,
    ) -> Result<ImportResult> {
        let inner = self.inner();
        let schema = inner.ensure_migrated(&self.name).await?;
        let mut result = ImportResult::default();

        if !options.merge {
            let mut clear = Plan::default();
            for existing in inner.adapter.get_all(&self.name).await? {
                clear.stage(Change {
                    collection: self.name.clone(),
                    id: existing.id.clone(),
                    op: MutationKind::Purge,
                    before: Some(existing),
                    after: None,
                });
            }
            match inner.commit(journal, clear, &WriteMode::silent()).await {
                Ok(_) | Err(Error::PersistenceDegraded { .. }) => {}
                Err(err) => return Err(err),
            }
            inner.quarantine.retain(|key, _| key.0 != self.name);
        }

        let mode = WriteMode::recorded(Some(batch_id.unwrap_or_else(new_batch_id)));
        for incoming in records {
            let id = incoming.id.clone();
            match self.import_one(journal, &schema, incoming, &mode).await {
                Ok(Some(MutationKind::Insert)) => result.inserted += 1,
                Ok(Some(_)) => result.updated += 1,
                Ok(None) => result.skipped += 1,
                Err(err) => result.failed.push((id, err)),
            }
        }

        tracing::debug!(
            collection = %self.name,
            inserted = result.inserted,
            updated = result.updated,
            skipped = result.skipped,
            failed = result.failed.len(),
            "import finished"
        );
        Ok(result)
    }

    async fn import_one(
        &self,
        journal: &mut Journal,
        schema: &CollectionSchema,
        incoming: Record,
        mode: &WriteMode,
    ) -> Result<Option<MutationKind>> {
        let inner = self.inner();
        let incoming = match inner.registry.upgrade(&self.name, &incoming)? {
            Some(migrated) => migrated,
            None => incoming,
        };
        inner.validate(schema, &incoming)?;

        let mut plan = Plan::default();
        let existing = inner.current(&plan, &self.name, &incoming.id).await?;
        let op = match &existing {
            None => MutationKind::Insert,
            Some(current) => {
                let newer = incoming.version > current.version
                    || (incoming.version == current.version && incoming.updated_at > current.updated_at);
                if !newer {
                    return Ok(None);
                }
                MutationKind::Update
            }
        };

        plan.stage(Change {
            collection: self.name.clone(),
            id: incoming.id.clone(),
            op,
            before: existing,
            after: Some(incoming),
        });
        inner.commit(journal, plan, mode).await?;
        Ok(Some(op))
    }
}

fn settled_first(changes: Vec<Change>) -> Result<Record> {
    match changes.first() {
        Some(change) => change.settled(),
        None => Err(Error::Storage("mutation produced no change".into())),
    }
}

fn settled_last(changes: Vec<Change>) -> Result<Record> {
    match changes.last() {
        Some(change) => change.settled(),
        None => Err(Error::Storage("mutation produced no change".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::hooks::HookPoint;
    use crate::schema::{FieldDef, FieldType, Relation};
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    fn clients() -> CollectionSchema {
        CollectionSchema::new(
            "clients",
            vec![
                FieldDef::required("name", FieldType::String),
                FieldDef::optional("city", FieldType::String),
            ],
        )
    }

    fn projects(policy: CascadePolicy) -> CollectionSchema {
        CollectionSchema::new(
            "projects",
            vec![
                FieldDef::required("title", FieldType::String),
                FieldDef::optional("clientId", FieldType::String),
            ],
        )
        .with_relation(Relation::belongs_to("client", "clients", "clientId").on_delete(policy))
    }

    async fn store_with(schemas: Vec<CollectionSchema>) -> Store {
        let mut builder = Store::builder().clock(Arc::new(ManualClock::new(1_000)));
        for schema in schemas {
            builder = builder.schema(schema);
        }
        builder.build().await.unwrap()
    }

    #[tokio::test]
    async fn insert_assigns_metadata() {
        let store = store_with(vec![clients()]).await;
        let record = store
            .collection("clients")
            .insert(json!({"name": "Acme", "version": 9, "createdAt": 1}))
            .await
            .unwrap();

        assert_eq!(record.version, 1);
        assert_eq!(record.created_at, record.updated_at);
        assert!(record.created_at >= 1_000);
        assert_eq!(record.schema_version, Some(1));
        assert!(Uuid::parse_str(&record.id).is_ok());
        assert_eq!(store.collection("clients").get(&record.id).await.unwrap(), Some(record));
    }

    #[tokio::test]
    async fn insert_validates_and_rejects_duplicates() {
        let store = store_with(vec![clients()]).await;
        let clients = store.collection("clients");

        let err = clients.insert(json!({"city": 4})).await.unwrap_err();
        match err {
            Error::Validation { violations, .. } => assert_eq!(violations.len(), 2),
            other => panic!("unexpected {other:?}"),
        }

        clients.insert(json!({"id": "c-1", "name": "Acme"})).await.unwrap();
        assert!(matches!(
            clients.insert(json!({"id": "c-1", "name": "Again"})).await,
            Err(Error::RecordAlreadyExists { .. })
        ));
        assert!(matches!(
            clients.insert(json!(["not", "an", "object"])).await,
            Err(Error::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_collection_is_schema_error() {
        let store = store_with(vec![]).await;
        assert!(matches!(
            store.collection("ghosts").insert(json!({})).await,
            Err(Error::SchemaNotFound(_))
        ));
        assert!(matches!(
            store.collection("ghosts").get("x").await,
            Err(Error::SchemaNotFound(_))
        ));
    }

    #[tokio::test]
    async fn update_merges_and_checks_version() {
        let store = store_with(vec![clients()]).await;
        let clients = store.collection("clients");
        clients
            .insert(json!({"id": "c-1", "name": "Acme", "city": "Oslo"}))
            .await
            .unwrap();

        let v2 = clients
            .update("c-1", json!({"name": "Acme Corp"}), Some(1))
            .await
            .unwrap();
        assert_eq!(v2.version, 2);
        assert_eq!(v2.get("city"), Some(&json!("Oslo")));

        let err = clients
            .update("c-1", json!({"name": "Late"}), Some(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OptimisticLock { expected: 1, actual: 2, .. }));

        // Explicit null is stored.
        let v3 = clients.update("c-1", json!({"city": null}), None).await.unwrap();
        assert_eq!(v3.get("city"), Some(&Value::Null));
    }

    #[tokio::test]
    async fn upsert_switches_on_existing_id() {
        let store = store_with(vec![clients()]).await;
        let clients = store.collection("clients");

        let created = clients.upsert(json!({"id": "c-1", "name": "Acme"})).await.unwrap();
        assert_eq!(created.version, 1);
        let updated = clients.upsert(json!({"id": "c-1", "city": "Bergen"})).await.unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.get("name"), Some(&json!("Acme")));
    }

    #[tokio::test]
    async fn soft_delete_and_restore() {
        let store = store_with(vec![clients()]).await;
        let clients = store.collection("clients");
        clients.insert(json!({"id": "c-1", "name": "Acme"})).await.unwrap();

        clients.remove("c-1").await.unwrap();
        assert_eq!(clients.get("c-1").await.unwrap(), None);
        assert!(matches!(clients.remove("c-1").await, Err(Error::NotFound { .. })));
        assert!(matches!(
            clients.update("c-1", json!({"name": "x"}), None).await,
            Err(Error::NotFound { .. })
        ));

        let restored = clients.restore("c-1").await.unwrap();
        assert_eq!(restored.deleted_at, None);
        assert_eq!(restored.version, 3);
        assert!(matches!(clients.restore("c-1").await, Err(Error::NotDeleted { .. })));
    }

    #[tokio::test]
    async fn restrict_blocks_removal() {
        let store = store_with(vec![clients(), projects(CascadePolicy::Restrict)]).await;
        store.collection("clients").insert(json!({"id": "c-1", "name": "Acme"})).await.unwrap();
        store
            .collection("projects")
            .insert(json!({"id": "p-1", "title": "Bridge", "clientId": "c-1"}))
            .await
            .unwrap();

        let err = store.collection("clients").remove("c-1").await.unwrap_err();
        assert!(matches!(err, Error::RelationRestricted { ref referenced_by, .. } if referenced_by == "projects"));
        assert!(store.collection("clients").get("c-1").await.unwrap().is_some());

        // A deleted reference no longer blocks.
        store.collection("projects").remove("p-1").await.unwrap();
        store.collection("clients").remove("c-1").await.unwrap();
    }

    #[tokio::test]
    async fn cascade_and_nullify() {
        let store = store_with(vec![clients(), projects(CascadePolicy::Cascade)]).await;
        store.collection("clients").insert(json!({"id": "c-1", "name": "Acme"})).await.unwrap();
        for id in ["p-1", "p-2"] {
            store
                .collection("projects")
                .insert(json!({"id": id, "title": "Job", "clientId": "c-1"}))
                .await
                .unwrap();
        }
        store.collection("clients").remove("c-1").await.unwrap();
        assert_eq!(store.collection("projects").count().await.unwrap(), 0);

        let store = store_with(vec![clients(), projects(CascadePolicy::Nullify)]).await;
        store.collection("clients").insert(json!({"id": "c-1", "name": "Acme"})).await.unwrap();
        store
            .collection("projects")
            .insert(json!({"id": "p-1", "title": "Job", "clientId": "c-1"}))
            .await
            .unwrap();
        store.collection("clients").remove("c-1").await.unwrap();
        let project = store.collection("projects").get("p-1").await.unwrap().unwrap();
        assert_eq!(project.get("clientId"), Some(&Value::Null));
        assert_eq!(project.version, 2);
    }

    #[tokio::test]
    async fn before_hook_veto_prevents_write() {
        let store = store_with(vec![clients()]).await;
        store.hooks().register(HookPoint::before(MutationKind::Insert, "clients"), |ctx| {
            match ctx.after.and_then(|r| r.get("name")).and_then(Value::as_str) {
                Some("Blocked Ltd") => Err("client is on the blocklist".into()),
                _ => Ok(()),
            }
        });

        let err = store
            .collection("clients")
            .insert(json!({"name": "Blocked Ltd"}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::HookVeto { ref hook, .. } if hook == "before.insert.clients"));
        assert_eq!(store.collection("clients").count().await.unwrap(), 0);
        assert_eq!(store.audit_len().await, 0);
    }

    #[tokio::test]
    async fn change_events_in_commit_order() {
        let store = store_with(vec![clients()]).await;
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let _sub = {
            let seen = seen.clone();
            store
                .collection("clients")
                .on_change(move |e| seen.lock().unwrap().push((e.operation, e.after.as_ref().map(|r| r.version))))
        };

        let clients = store.collection("clients");
        clients.insert(json!({"id": "c-1", "name": "Acme"})).await.unwrap();
        clients.update("c-1", json!({"name": "B"}), None).await.unwrap();
        clients.remove("c-1").await.unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            [
                (MutationKind::Insert, Some(1)),
                (MutationKind::Update, Some(2)),
                (MutationKind::Delete, Some(3)),
            ]
        );
    }

    #[tokio::test]
    async fn undo_and_redo_single_commands() {
        let store = store_with(vec![clients()]).await;
        let clients = store.collection("clients");
        clients.insert(json!({"id": "c-1", "name": "Acme"})).await.unwrap();
        clients.update("c-1", json!({"name": "Beta", "city": "Oslo"}), None).await.unwrap();

        store.undo().await.unwrap();
        let reverted = clients.get("c-1").await.unwrap().unwrap();
        assert_eq!(reverted.get("name"), Some(&json!("Acme")));
        assert_eq!(reverted.get("city"), None);
        assert_eq!(reverted.version, 3);
        assert_eq!(store.undo_state().await, UndoState::Undone);

        store.undo().await.unwrap();
        assert_eq!(clients.get("c-1").await.unwrap(), None);
        assert!(clients.export_json().await.unwrap().is_empty());
        assert!(matches!(store.undo().await, Err(Error::NothingToUndo)));

        store.redo().await.unwrap();
        store.redo().await.unwrap();
        let redone = clients.get("c-1").await.unwrap().unwrap();
        assert_eq!(redone.get("name"), Some(&json!("Beta")));
        assert!(matches!(store.redo().await, Err(Error::NothingToRedo)));
        assert_eq!(store.undo_state().await, UndoState::Redone);

        // Replays are not audited.
        assert_eq!(store.audit_len().await, 2);
    }

    #[tokio::test]
    async fn audit_records_context() {
        let store = store_with(vec![clients()]).await;
        store.set_audit_context(AuditContext::user("u-1", "ui")).await;
        store
            .collection("clients")
            .insert(json!({"id": "c-1", "name": "Acme"}))
            .await
            .unwrap();

        let entries = store.audit(&AuditFilter::new().record("c-1")).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].operation, AuditOperation::Insert);
        assert_eq!(entries[0].user_id.as_deref(), Some("u-1"));
        assert_eq!(entries[0].source, "ui");
        assert!(entries[0].before.is_none());
    }

    #[tokio::test]
    async fn migration_runs_once_and_quarantines_failures() {
        let kv_adapter = Arc::new(KeyValueAdapter::new(Arc::new(MemoryKv::unbounded()), "t"));
        for (id, legacy) in [("c-1", json!({"title": "Acme"})), ("c-2", json!({"title": 7}))] {
            let mut record = Record::new(id, legacy.as_object().cloned().unwrap(), 10);
            record.schema_version = Some(1);
            kv_adapter.insert("clients", &record).await.unwrap();
        }

        let store = Store::builder()
            .adapter(kv_adapter.clone())
            .schema(clients().at_version(2))
            .build()
            .await
            .unwrap();
        store.registry().register_migration("clients", 1, |mut f| {
            match f.remove("title") {
                Some(Value::String(name)) => {
                    f.insert("name".into(), Value::String(name));
                    Ok(f)
                }
                _ => Err("title is not a string".into()),
            }
        });

        let clients = store.collection("clients");
        let migrated = clients.get("c-1").await.unwrap().unwrap();
        assert_eq!(migrated.get("name"), Some(&json!("Acme")));
        assert_eq!(migrated.schema_version, Some(2));
        assert_eq!(migrated.version, 1);

        assert!(matches!(clients.get("c-2").await, Err(Error::Migration { .. })));
        assert_eq!(clients.get_all().await.unwrap().len(), 1);
        assert_eq!(store.quarantined("clients"), ["c-2"]);

        // The failing record is untouched in storage.
        let raw = kv_adapter.get("clients", "c-2").await.unwrap().unwrap();
        assert_eq!(raw.get("title"), Some(&json!(7)));
    }

    #[tokio::test]
    async fn import_replace_and_merge() {
        let store = store_with(vec![clients()]).await;
        let clients = store.collection("clients");
        clients.insert(json!({"id": "old", "name": "Gone"})).await.unwrap();

        let mut a = Record::new("a", json!({"name": "A"}).as_object().cloned().unwrap(), 5);
        a.version = 4;
        let b = Record::new("b", json!({"name": "B"}).as_object().cloned().unwrap(), 5);
        let bad = Record::new("bad", json!({"city": "Nowhere"}).as_object().cloned().unwrap(), 5);

        let result = clients
            .import_json(vec![a.clone(), b.clone(), bad], ImportOptions::replace())
            .await
            .unwrap();
        assert_eq!(result.inserted, 2);
        assert_eq!(result.failed.len(), 1);
        assert_eq!(clients.get("old").await.unwrap(), None);
        assert_eq!(clients.get("a").await.unwrap(), Some(a.clone()));

        let mut newer_b = b.clone();
        newer_b.version = 2;
        newer_b.fields.insert("name".into(), json!("B2"));
        let mut stale_a = a.clone();
        stale_a.version = 3;
        let c = Record::new("c", json!({"name": "C"}).as_object().cloned().unwrap(), 5);

        let result = clients
            .import_json(vec![newer_b.clone(), stale_a, c], ImportOptions::merge())
            .await
            .unwrap();
        assert_eq!((result.inserted, result.updated, result.skipped), (1, 1, 1));
        assert_eq!(clients.get("b").await.unwrap(), Some(newer_b));
        assert_eq!(clients.get("a").await.unwrap().unwrap().version, 4);
    }
}
