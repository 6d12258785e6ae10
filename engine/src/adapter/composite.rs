//! Local-first composite tier.
//!
//! Reads are served by the local tier. Writes go to the local tier first and
//! then to the remote tier. A remote failure never undoes the local write:
//! the change is queued as [`PendingSync`] and the record is reported as
//! pending until [`CompositeAdapter::flush_pending`] delivers it.
//!
//! Queued changes are replayed in the order they were made. While a record
//! has queued changes, newer changes to it are queued behind them instead of
//! being sent directly, so the remote never sees them out of order.

use super::{Adapter, AdapterKind};
use crate::error::Result;
use crate::query::Predicate;
use crate::record::Record;
use crate::{CollectionName, Error, RecordId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

/// A change waiting for the remote tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncOp {
    Insert { record: Record },
    Update { record: Record },
    Remove { id: RecordId },
}

/// A queued remote write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingSync {
    pub collection: CollectionName,
    pub op: SyncOp,
    pub attempts: u32,
    pub last_error: String,
}

impl PendingSync {
    fn record_id(&self) -> &str {
        match &self.op {
            SyncOp::Insert { record } | SyncOp::Update { record } => &record.id,
            SyncOp::Remove { id } => id,
        }
    }
}

/// Outcome of a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushReport {
    pub synced: usize,
    pub remaining: usize,
}

#[derive(Debug)]
pub struct CompositeAdapter {
    local: Arc<dyn Adapter>,
    remote: Arc<dyn Adapter>,
    pending: Mutex<VecDeque<PendingSync>>,
}

impl CompositeAdapter {
    pub fn new(local: Arc<dyn Adapter>, remote: Arc<dyn Adapter>) -> Self {
        Self {
            local,
            remote,
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// Snapshot of the queue, oldest first.
    pub async fn pending(&self) -> Vec<PendingSync> {
        self.pending.lock().await.iter().cloned().collect()
    }

    /// Whether a record has changes the remote has not accepted yet.
    pub async fn is_pending(&self, collection: &str, id: &str) -> bool {
        self.pending
            .lock()
            .await
            .iter()
            .any(|p| p.collection == collection && p.record_id() == id)
    }

    /// Replay queued changes in order, stopping at the first one that still
    /// fails.
    pub async fn flush_pending(&self) -> FlushReport {
        let mut queue = self.pending.lock().await;
        let mut synced = 0;

        while let Some(front) = queue.front_mut() {
            match self.deliver(&front.collection, &front.op).await {
                Ok(()) => {
                    queue.pop_front();
                    synced += 1;
                }
                Err(err) => {
                    front.attempts += 1;
                    front.last_error = err.to_string();
                    tracing::warn!(
                        collection = %front.collection,
                        id = front.record_id(),
                        attempts = front.attempts,
                        error = %err,
                        "pending sync still failing"
                    );
                    break;
                }
            }
        }

        FlushReport {
            synced,
            remaining: queue.len(),
        }
    }

    /// Send one change, reconciling the obvious divergences: an insert the
    /// remote already has becomes an update, an update the remote lacks
    /// becomes an insert, and removing an absent record is a success.
    async fn deliver(&self, collection: &str, op: &SyncOp) -> Result<()> {
        match op {
            SyncOp::Insert { record } => match self.remote.insert(collection, record).await {
                Err(Error::RecordAlreadyExists { .. }) => self.remote.update(collection, record).await,
                other => other,
            },
            SyncOp::Update { record } => match self.remote.update(collection, record).await {
                Err(Error::NotFound { .. }) => self.remote.insert(collection, record).await,
                other => other,
            },
            SyncOp::Remove { id } => self.remote.remove(collection, id).await.map(|_| ()),
        }
    }

    /// Forward a change to the remote tier or queue it.
    async fn write_through(&self, collection: &str, op: SyncOp) {
        let mut queue = self.pending.lock().await;
        let id = match &op {
            SyncOp::Insert { record } | SyncOp::Update { record } => record.id.as_str(),
            SyncOp::Remove { id } => id.as_str(),
        };
        let blocked = queue
            .iter()
            .any(|p| p.collection == collection && p.record_id() == id);

        let error = if blocked {
            "queued behind earlier pending change".to_string()
        } else {
            match self.deliver(collection, &op).await {
                Ok(()) => return,
                Err(err) => {
                    tracing::warn!(collection, id, error = %err, "remote write failed, pending sync");
                    err.to_string()
                }
            }
        };

        queue.push_back(PendingSync {
            collection: collection.to_string(),
            op,
            attempts: u32::from(!blocked),
            last_error: error,
        });
    }
}

/// Split a local result into "stop now" and "forward, then report".
///
/// A degraded local write still holds the change in memory, so it is sent
/// on and the degradation is returned afterwards.
fn settled_locally(result: Result<()>) -> Result<Result<()>> {
    match result {
        Ok(()) => Ok(Ok(())),
        Err(err @ Error::PersistenceDegraded { .. }) => Ok(Err(err)),
        Err(err) => Err(err),
    }
}

#[async_trait]
impl Adapter for CompositeAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Composite
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Record>> {
        self.local.get(collection, id).await
    }

    async fn get_all(&self, collection: &str) -> Result<Vec<Record>> {
        self.local.get_all(collection).await
    }

    async fn insert(&self, collection: &str, record: &Record) -> Result<()> {
        let local = settled_locally(self.local.insert(collection, record).await)?;
        self.write_through(collection, SyncOp::Insert { record: record.clone() })
            .await;
        local
    }

    async fn update(&self, collection: &str, record: &Record) -> Result<()> {
        let local = settled_locally(self.local.update(collection, record).await)?;
        self.write_through(collection, SyncOp::Update { record: record.clone() })
            .await;
        local
    }

    async fn remove(&self, collection: &str, id: &str) -> Result<bool> {
        let (removed, local) = match self.local.remove(collection, id).await {
            Ok(removed) => (removed, Ok(())),
            Err(err @ Error::PersistenceDegraded { .. }) => (true, Err(err)),
            Err(err) => return Err(err),
        };
        if removed {
            self.write_through(collection, SyncOp::Remove { id: id.to_string() })
                .await;
        }
        local.map(|()| removed)
    }

    async fn count(&self, collection: &str, predicates: &[Predicate]) -> Result<usize> {
        self.local.count(collection, predicates).await
    }
}
