//! Append-only audit trail.
//!
//! Every non-replay mutation produces one [`AuditEntry`]. Entries are never
//! modified; the only removal is oldest-first pruning once the log grows past
//! `max_entries`. The log lives in memory and is persisted as one JSON array
//! under `<namespace>:__audit__` after every append.
//!
//! Audit persistence never fails a mutation. On a write error the oldest half
//! of the resident entries is discarded and the write retried once; if that
//! fails too the remaining entries stay in memory for the session.

use crate::kv::KeyValueStore;
use crate::query::canonical_string;
use crate::record::{Fields, Record};
use crate::{CollectionName, RecordId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use uuid::Uuid;

/// Audited operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOperation {
    Insert,
    Update,
    Delete,
    Restore,
}

/// Who is acting, attached to every entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditContext {
    pub user_id: Option<String>,
    /// Free-form origin tag, e.g. `"ui"` or `"import"`
    pub source: String,
}

impl Default for AuditContext {
    fn default() -> Self {
        Self {
            user_id: None,
            source: "engine".to_string(),
        }
    }
}

impl AuditContext {
    pub fn user(user_id: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            source: source.into(),
        }
    }
}

/// An immutable fact about one mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: String,
    pub timestamp: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub collection: CollectionName,
    pub record_id: RecordId,
    pub operation: AuditOperation,
    pub before: Option<Record>,
    pub after: Option<Record>,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
}

impl AuditEntry {
    /// Field-level changes between the two snapshots.
    pub fn changes(&self) -> BTreeMap<String, FieldChange> {
        let empty = Fields::new();
        diff(
            self.before.as_ref().map_or(&empty, |r| &r.fields),
            self.after.as_ref().map_or(&empty, |r| &r.fields),
        )
    }
}

/// The parts of an entry the caller supplies.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditDraft {
    pub collection: CollectionName,
    pub record_id: RecordId,
    pub operation: AuditOperation,
    pub before: Option<Record>,
    pub after: Option<Record>,
    pub batch_id: Option<String>,
}

/// One field's values on either side of a change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub before: Option<Value>,
    pub after: Option<Value>,
}

/// Compare two field maps by canonical serialized form.
///
/// Equal fields are omitted. A field present on only one side has `None` on
/// the other.
pub fn diff(before: &Fields, after: &Fields) -> BTreeMap<String, FieldChange> {
    let keys: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
    keys.into_iter()
        .filter_map(|key| {
            let old = before.get(key);
            let new = after.get(key);
            let same = match (old, new) {
                (Some(a), Some(b)) => canonical_string(a) == canonical_string(b),
                (None, None) => true,
                _ => false,
            };
            (!same).then(|| {
                (
                    key.clone(),
                    FieldChange {
                        before: old.cloned(),
                        after: new.cloned(),
                    },
                )
            })
        })
        .collect()
}

/// Exact-match filter over entries. Unset criteria match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuditFilter {
    pub collection: Option<CollectionName>,
    pub record_id: Option<RecordId>,
    pub operation: Option<AuditOperation>,
    pub user_id: Option<String>,
    pub batch_id: Option<String>,
    /// Inclusive lower bound on `timestamp`
    pub since: Option<Timestamp>,
}

impl AuditFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collection(mut self, collection: impl Into<CollectionName>) -> Self {
        self.collection = Some(collection.into());
        self
    }

    pub fn record(mut self, record_id: impl Into<RecordId>) -> Self {
        self.record_id = Some(record_id.into());
        self
    }

    pub fn operation(mut self, operation: AuditOperation) -> Self {
        self.operation = Some(operation);
        self
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn batch(mut self, batch_id: impl Into<String>) -> Self {
        self.batch_id = Some(batch_id.into());
        self
    }

    pub fn since(mut self, timestamp: Timestamp) -> Self {
        self.since = Some(timestamp);
        self
    }

    pub fn matches(&self, entry: &AuditEntry) -> bool {
        self.collection.as_ref().map_or(true, |c| *c == entry.collection)
            && self.record_id.as_ref().map_or(true, |id| *id == entry.record_id)
            && self.operation.map_or(true, |op| op == entry.operation)
            && self
                .user_id
                .as_ref()
                .map_or(true, |u| entry.user_id.as_ref() == Some(u))
            && self
                .batch_id
                .as_ref()
                .map_or(true, |b| entry.batch_id.as_ref() == Some(b))
            && self.since.map_or(true, |t| entry.timestamp >= t)
    }
}

/// Bounded audit trail persisted to a key-value store.
#[derive(Debug)]
pub struct AuditLog {
    kv: Arc<dyn KeyValueStore>,
    key: String,
    max_entries: usize,
    entries: Vec<AuditEntry>,
}

impl AuditLog {
    /// Load the persisted log. Missing, unreadable or corrupt data yields an
    /// empty history.
    pub fn load(kv: Arc<dyn KeyValueStore>, namespace: &str, max_entries: usize) -> Self {
        let key = format!("{namespace}:__audit__");
        let entries = match kv.get(&key) {
            Ok(Some(raw)) => serde_json::from_str::<Vec<AuditEntry>>(&raw).unwrap_or_else(|err| {
                tracing::warn!(%key, error = %err, "corrupt audit log, starting empty");
                Vec::new()
            }),
            Ok(None) => Vec::new(),
            Err(err) => {
                tracing::warn!(%key, error = %err, "audit log unreadable, starting empty");
                Vec::new()
            }
        };

        let mut log = Self {
            kv,
            key,
            max_entries,
            entries,
        };
        log.prune();
        log
    }

    /// Stamp, append and persist one entry.
    pub fn record(&mut self, draft: AuditDraft, context: &AuditContext, timestamp: Timestamp) -> &AuditEntry {
        self.entries.push(AuditEntry {
            id: Uuid::new_v4().to_string(),
            timestamp,
            user_id: context.user_id.clone(),
            collection: draft.collection,
            record_id: draft.record_id,
            operation: draft.operation,
            before: draft.before,
            after: draft.after,
            source: context.source.clone(),
            batch_id: draft.batch_id,
        });
        self.prune();
        self.persist();
        // Non-empty: an entry was just pushed and max_entries keeps at least it.
        &self.entries[self.entries.len() - 1]
    }

    /// Drop the oldest entries beyond `max_entries`. Returns how many went.
    pub fn prune(&mut self) -> usize {
        let keep = self.max_entries.max(1);
        let excess = self.entries.len().saturating_sub(keep);
        if excess > 0 {
            self.entries.drain(..excess);
        }
        excess
    }

    /// Entries matching `filter`, in append order.
    pub fn query(&self, filter: &AuditFilter) -> Vec<AuditEntry> {
        self.entries.iter().filter(|e| filter.matches(e)).cloned().collect()
    }

    pub fn entries(&self) -> &[AuditEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn write(&self) -> Result<(), String> {
        let body = serde_json::to_string(&self.entries).map_err(|e| e.to_string())?;
        self.kv.set(&self.key, &body).map_err(|e| e.to_string())
    }

    fn persist(&mut self) {
        let Err(first) = self.write() else {
            return;
        };

        let drop = self.entries.len() / 2;
        tracing::warn!(error = %first, dropping = drop, "audit write failed, discarding oldest half");
        self.entries.drain(..drop);

        if let Err(second) = self.write() {
            tracing::warn!(
                error = %second,
                resident = self.entries.len(),
                "audit log kept in memory only"
            );
        }
    }
}
