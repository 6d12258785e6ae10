//! Small-quota tier over a key-value store.
//!
//! Each collection is one JSON array under `<namespace>:<collection>`, in
//! insertion order. The in-memory copy is authoritative: when the backing
//! store refuses a write for quota reasons, the adapter persists only the
//! newest half of the collection and, if even that fails, reports
//! `PersistenceDegraded` while keeping every record in memory.

use super::{Adapter, AdapterKind};
use crate::error::Result;
use crate::kv::{KeyValueStore, KvError};
use crate::record::Record;
use crate::{CollectionName, Error};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Debug)]
pub struct KeyValueAdapter {
    kv: Arc<dyn KeyValueStore>,
    namespace: String,
    collections: DashMap<CollectionName, Vec<Record>>,
}

impl KeyValueAdapter {
    pub fn new(kv: Arc<dyn KeyValueStore>, namespace: impl Into<String>) -> Self {
        Self {
            kv,
            namespace: namespace.into(),
            collections: DashMap::new(),
        }
    }

    fn key(&self, collection: &str) -> String {
        format!("{}:{}", self.namespace, collection)
    }

    /// Load a collection into memory on first touch.
    fn ensure_loaded(&self, collection: &str) -> Result<()> {
        if self.collections.contains_key(collection) {
            return Ok(());
        }
        let raw = self
            .kv
            .get(&self.key(collection))
            .map_err(|e| Error::Storage(e.to_string()))?;
        let records: Vec<Record> = match raw {
            Some(json) => serde_json::from_str(&json)?,
            None => Vec::new(),
        };
        self.collections
            .entry(collection.to_string())
            .or_insert(records);
        Ok(())
    }

    fn with_records<T>(&self, collection: &str, f: impl FnOnce(&mut Vec<Record>) -> Result<T>) -> Result<T> {
        self.ensure_loaded(collection)?;
        let mut entry = self
            .collections
            .get_mut(collection)
            .ok_or_else(|| Error::Storage(format!("collection {collection} not loaded")))?;
        f(entry.value_mut())
    }

    /// Write the collection, halving on quota failure.
    fn persist(&self, collection: &str) -> Result<()> {
        let snapshot = match self.collections.get(collection) {
            Some(records) => records.value().clone(),
            None => return Ok(()),
        };
        let key = self.key(collection);

        match self.kv.set(&key, &serde_json::to_string(&snapshot)?) {
            Ok(()) => Ok(()),
            Err(KvError::QuotaExceeded { needed, quota }) => {
                let keep_from = snapshot.len() / 2;
                tracing::warn!(
                    collection,
                    needed,
                    quota,
                    dropping = keep_from,
                    "key-value quota exceeded, persisting newest half"
                );
                let newest = &snapshot[keep_from..];
                self.kv
                    .set(&key, &serde_json::to_string(newest)?)
                    .map_err(|err| {
                        tracing::warn!(collection, error = %err, "persistence degraded, memory only");
                        Error::PersistenceDegraded {
                            backend: AdapterKind::KeyValue.to_string(),
                            reason: err.to_string(),
                        }
                    })
            }
            Err(err) => Err(Error::PersistenceDegraded {
                backend: AdapterKind::KeyValue.to_string(),
                reason: err.to_string(),
            }),
        }
    }
}

#[async_trait]
impl Adapter for KeyValueAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::KeyValue
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Record>> {
        self.with_records(collection, |records| {
            Ok(records.iter().find(|r| r.id == id).cloned())
        })
    }

    async fn get_all(&self, collection: &str) -> Result<Vec<Record>> {
        self.with_records(collection, |records| Ok(records.clone()))
    }

    async fn insert(&self, collection: &str, record: &Record) -> Result<()> {
        self.with_records(collection, |records| {
            if records.iter().any(|r| r.id == record.id) {
                return Err(Error::RecordAlreadyExists {
                    collection: collection.to_string(),
                    id: record.id.clone(),
                });
            }
            records.push(record.clone());
            Ok(())
        })?;
        self.persist(collection)
    }

    async fn update(&self, collection: &str, record: &Record) -> Result<()> {
        self.with_records(collection, |records| {
            let slot = records
                .iter_mut()
                .find(|r| r.id == record.id)
                .ok_or_else(|| Error::not_found(collection, &record.id))?;
            *slot = record.clone();
            Ok(())
        })?;
        self.persist(collection)
    }

    async fn remove(&self, collection: &str, id: &str) -> Result<bool> {
        let removed = self.with_records(collection, |records| {
            let before = records.len();
            records.retain(|r| r.id != id);
            Ok(records.len() != before)
        })?;
        if removed {
            self.persist(collection)?;
        }
        Ok(removed)
    }

    async fn bulk_insert(&self, collection: &str, incoming: &[Record]) -> Result<()> {
        self.with_records(collection, |records| {
            for record in incoming {
                if records.iter().any(|r| r.id == record.id) {
                    return Err(Error::RecordAlreadyExists {
                        collection: collection.to_string(),
                        id: record.id.clone(),
                    });
                }
            }
            records.extend(incoming.iter().cloned());
            Ok(())
        })?;
        self.persist(collection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use crate::query::Predicate;
    use serde_json::json;

    fn rec(id: &str, name: &str) -> Record {
        Record::new(id, json!({"name": name}).as_object().cloned().unwrap(), 1000)
    }

    #[tokio::test]
    async fn crud_roundtrip() {
        let adapter = KeyValueAdapter::new(Arc::new(MemoryKv::unbounded()), "app");

        adapter.insert("clients", &rec("c-1", "Acme")).await.unwrap();
        assert!(matches!(
            adapter.insert("clients", &rec("c-1", "Dup")).await,
            Err(Error::RecordAlreadyExists { .. })
        ));

        let mut updated = rec("c-1", "Acme Corp");
        updated.version = 2;
        adapter.update("clients", &updated).await.unwrap();
        assert_eq!(adapter.get("clients", "c-1").await.unwrap(), Some(updated));

        assert!(matches!(
            adapter.update("clients", &rec("nope", "x")).await,
            Err(Error::NotFound { .. })
        ));

        assert!(adapter.remove("clients", "c-1").await.unwrap());
        assert!(!adapter.remove("clients", "c-1").await.unwrap());
        assert!(adapter.get_all("clients").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn persists_one_array_per_collection() {
        let kv = Arc::new(MemoryKv::unbounded());
        let adapter = KeyValueAdapter::new(kv.clone(), "app");
        adapter.insert("clients", &rec("c-1", "Acme")).await.unwrap();
        adapter.insert("clients", &rec("c-2", "Beta")).await.unwrap();

        let raw = kv.get("app:clients").unwrap().unwrap();
        let stored: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(stored.as_array().unwrap().len(), 2);
        assert_eq!(stored[0]["id"], "c-1");

        // A fresh adapter over the same store sees the data.
        let reopened = KeyValueAdapter::new(kv, "app");
        assert_eq!(reopened.get_all("clients").await.unwrap().len(), 2);
        assert_eq!(
            reopened.count("clients", &[Predicate::eq("name", "Beta")]).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn quota_failure_halves_persisted_set() {
        let one = serde_json::to_string(&vec![rec("c-0", "x")]).unwrap().len();
        // Room for roughly two records, never four.
        let kv = Arc::new(MemoryKv::new(one * 2 + 8));
        let adapter = KeyValueAdapter::new(kv.clone(), "app");

        adapter.insert("clients", &rec("c-1", "x")).await.unwrap();
        adapter.insert("clients", &rec("c-2", "x")).await.unwrap();
        adapter.insert("clients", &rec("c-3", "x")).await.unwrap();

        // Memory keeps everything.
        assert_eq!(adapter.get_all("clients").await.unwrap().len(), 3);

        // Only the newest half made it to the store.
        let raw = kv.get("app:clients").unwrap().unwrap();
        let stored: Vec<Record> = serde_json::from_str(&raw).unwrap();
        let ids: Vec<_> = stored.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["c-2", "c-3"]);
    }

    #[tokio::test]
    async fn degraded_when_even_half_does_not_fit() {
        let adapter = KeyValueAdapter::new(Arc::new(MemoryKv::new(4)), "app");

        let err = adapter.insert("clients", &rec("c-1", "Acme")).await.unwrap_err();
        assert!(matches!(err, Error::PersistenceDegraded { .. }));

        // The write is still visible in memory.
        assert!(adapter.get("clients", "c-1").await.unwrap().is_some());
    }
}
