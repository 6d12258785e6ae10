//! Multi-record atomic writes.
//!
//! A [`Transaction`] stages operations across collections and commits them
//! as one unit: every operation is planned against the state the earlier
//! ones leave behind, and nothing is written unless all of them plan
//! cleanly. The whole transaction shares one batch id.

use crate::error::Result;
use crate::store::{into_fields, new_batch_id, Plan, Store, WriteMode};
use crate::{CollectionName, RecordId, Record, Version};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
enum StagedOp {
    Insert {
        collection: CollectionName,
        data: Value,
    },
    Update {
        collection: CollectionName,
        id: RecordId,
        patch: Value,
        expected_version: Option<Version>,
    },
    Remove {
        collection: CollectionName,
        id: RecordId,
    },
}

/// Staged operations awaiting [`Transaction::commit`].
#[derive(Debug, Clone)]
pub struct Transaction {
    store: Store,
    ops: Vec<StagedOp>,
}

impl Store {
    /// Start an empty transaction.
    pub fn transaction(&self) -> Transaction {
        Transaction {
            store: self.clone(),
            ops: Vec::new(),
        }
    }
}

impl Transaction {
    pub fn insert(&mut self, collection: impl Into<CollectionName>, data: Value) -> &mut Self {
        self.ops.push(StagedOp::Insert {
            collection: collection.into(),
            data,
        });
        self
    }

    pub fn update(
        &mut self,
        collection: impl Into<CollectionName>,
        id: impl Into<RecordId>,
        patch: Value,
        expected_version: Option<Version>,
    ) -> &mut Self {
        self.ops.push(StagedOp::Update {
            collection: collection.into(),
            id: id.into(),
            patch,
            expected_version,
        });
        self
    }

    pub fn remove(&mut self, collection: impl Into<CollectionName>, id: impl Into<RecordId>) -> &mut Self {
        self.ops.push(StagedOp::Remove {
            collection: collection.into(),
            id: id.into(),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Apply every staged operation or none.
    ///
    /// Returns the settled record of each operation in staging order. A
    /// removal yields the soft-deleted record.
    pub async fn commit(self) -> Result<Vec<Record>> {
        let inner = &self.store.inner;
        let mut journal = inner.gate.lock().await;
        let mut plan = Plan::default();
        // Index of each operation's own change inside the plan.
        let mut primary = Vec::with_capacity(self.ops.len());

        for op in self.ops {
            match op {
                StagedOp::Insert { collection, data } => {
                    let fields = into_fields(&collection, data)?;
                    inner.plan_insert(&mut plan, &collection, fields).await?;
                    primary.push(plan.len() - 1);
                }
                StagedOp::Update {
                    collection,
                    id,
                    patch,
                    expected_version,
                } => {
                    let patch = into_fields(&collection, patch)?;
                    inner
                        .plan_update(&mut plan, &collection, &id, &patch, expected_version)
                        .await?;
                    primary.push(plan.len() - 1);
                }
                StagedOp::Remove { collection, id } => {
                    inner.plan_remove(&mut plan, &collection, &id).await?;
                    primary.push(plan.len() - 1);
                }
            }
        }

        let operations = primary.len();
        let changes = inner
            .commit(&mut journal, plan, &WriteMode::recorded(Some(new_batch_id())))
            .await?;
        tracing::debug!(operations, changes = changes.len(), "transaction committed");

        primary.into_iter().map(|index| changes[index].settled()).collect()
    }
}

#[cfg(test)]
mod tests {
    use crate::schema::{CollectionSchema, FieldDef, FieldType};
    use crate::{Error, Store};
    use serde_json::json;

    async fn store() -> Store {
        Store::builder()
            .schema(CollectionSchema::new(
                "accounts",
                vec![FieldDef::required("balance", FieldType::Float)],
            ))
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn later_operations_see_earlier_ones() {
        let store = store().await;
        let mut tx = store.transaction();
        tx.insert("accounts", json!({"id": "a", "balance": 10}))
            .update("accounts", "a", json!({"balance": 5}), Some(1));
        assert_eq!(tx.len(), 2);

        let records = tx.commit().await.unwrap();
        assert_eq!(records[1].version, 2);

        let stored = store.collection("accounts").get("a").await.unwrap().unwrap();
        assert_eq!(stored.get("balance"), Some(&json!(5)));

        let entries = store.audit(&Default::default()).await;
        assert_eq!(entries.len(), 2);
        assert!(entries[0].batch_id.is_some());
        assert_eq!(entries[0].batch_id, entries[1].batch_id);
    }

    #[tokio::test]
    async fn failure_leaves_nothing_behind() {
        let store = store().await;
        store
            .collection("accounts")
            .insert(json!({"id": "a", "balance": 10}))
            .await
            .unwrap();

        let mut tx = store.transaction();
        tx.update("accounts", "a", json!({"balance": 0}), None)
            .insert("accounts", json!({"id": "b", "balance": "lots"}));
        assert!(matches!(tx.commit().await, Err(Error::Validation { .. })));

        let a = store.collection("accounts").get("a").await.unwrap().unwrap();
        assert_eq!(a.get("balance"), Some(&json!(10)));
        assert_eq!(store.collection("accounts").get("b").await.unwrap(), None);
        assert_eq!(store.audit_len().await, 1);
    }
}
