//! Full-store backup documents.
//!
//! A [`Backup`] holds every record of every registered collection, soft
//! deleted ones included, plus the schema version each collection was at.
//! Maps are `BTreeMap`s so the same store state always serializes to the
//! same JSON.

use crate::error::Result;
use crate::store::{new_batch_id, ImportOptions, ImportResult, Store};
use crate::{CollectionName, Error, Record, SchemaVersion, Timestamp};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version of the backup document format.
pub const BACKUP_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backup {
    pub format_version: u32,
    pub exported_at: Timestamp,
    /// Schema version per collection at export time
    pub manifest: BTreeMap<CollectionName, SchemaVersion>,
    pub collections: BTreeMap<CollectionName, Vec<Record>>,
}

impl Backup {
    pub fn record_count(&self) -> usize {
        self.collections.values().map(Vec::len).sum()
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidBackup(e.to_string()))
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidBackup(e.to_string()))
    }

    /// Parse a backup, rejecting format versions newer than this build
    /// understands.
    pub fn from_json(json: &str) -> Result<Self> {
        let backup: Self = serde_json::from_str(json).map_err(|e| Error::InvalidBackup(e.to_string()))?;
        if backup.format_version > BACKUP_FORMAT_VERSION {
            return Err(Error::InvalidBackup(format!(
                "unsupported backup format version: {} (max supported: {})",
                backup.format_version, BACKUP_FORMAT_VERSION
            )));
        }
        Ok(backup)
    }
}

impl Store {
    /// Snapshot every registered collection.
    pub async fn export_backup(&self) -> Result<Backup> {
        let names = self.registry().names();
        let loaded = try_join_all(names.iter().map(|name| {
            let collection = self.collection(name.clone());
            async move { collection.export_json().await }
        }))
        .await?;
        let collections: BTreeMap<_, _> = names.into_iter().zip(loaded).collect();

        let backup = Backup {
            format_version: BACKUP_FORMAT_VERSION,
            exported_at: self.inner.clock.now(),
            manifest: self.registry().manifest(),
            collections,
        };
        tracing::info!(
            collections = backup.collections.len(),
            records = backup.record_count(),
            "backup exported"
        );
        Ok(backup)
    }

    /// Load a backup collection by collection under one batch id.
    ///
    /// Records without a `schemaVersion` are taken to be at the manifest
    /// version and migrated forward. Collections with no registered schema
    /// are reported per record as failures.
    pub async fn import_backup(&self, backup: Backup, options: ImportOptions) -> Result<ImportResult> {
        if backup.format_version > BACKUP_FORMAT_VERSION {
            return Err(Error::InvalidBackup(format!(
                "unsupported backup format version: {}",
                backup.format_version
            )));
        }

        let batch_id = new_batch_id();
        let mut result = ImportResult::default();
        let mut journal = self.inner.gate.lock().await;

        for (name, records) in backup.collections {
            if !self.registry().contains(&name) {
                tracing::warn!(collection = %name, records = records.len(), "backup collection has no schema");
                result.failed.extend(
                    records
                        .into_iter()
                        .map(|r| (r.id, Error::SchemaNotFound(name.clone()))),
                );
                continue;
            }

            let exported_version = backup.manifest.get(&name).copied().unwrap_or(1);
            let records = records
                .into_iter()
                .map(|mut record| {
                    record.schema_version.get_or_insert(exported_version);
                    record
                })
                .collect();

            let imported = self
                .collection(name)
                .import_locked(&mut journal, records, options, Some(batch_id.clone()))
                .await?;
            result.absorb(imported);
        }

        tracing::info!(
            %batch_id,
            inserted = result.inserted,
            updated = result.updated,
            skipped = result.skipped,
            failed = result.failed.len(),
            "backup imported"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::schema::{CollectionSchema, FieldDef, FieldType};
    use serde_json::{json, Value};
    use std::sync::Arc;

    fn schema() -> CollectionSchema {
        CollectionSchema::new("notes", vec![FieldDef::required("text", FieldType::String)])
    }

    async fn store() -> Store {
        Store::builder()
            .clock(Arc::new(ManualClock::with_step(500, 0)))
            .schema(schema())
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn export_includes_deleted_records() {
        let store = store().await;
        let notes = store.collection("notes");
        notes.insert(json!({"id": "n-1", "text": "keep"})).await.unwrap();
        notes.insert(json!({"id": "n-2", "text": "drop"})).await.unwrap();
        notes.remove("n-2").await.unwrap();

        let backup = store.export_backup().await.unwrap();
        assert_eq!(backup.format_version, BACKUP_FORMAT_VERSION);
        assert_eq!(backup.exported_at, 500);
        assert_eq!(backup.manifest.get("notes"), Some(&1));
        assert_eq!(backup.record_count(), 2);
        assert!(backup.collections["notes"].iter().any(|r| r.deleted_at.is_some()));
    }

    #[tokio::test]
    async fn deterministic_json() {
        let store = store().await;
        store
            .collection("notes")
            .insert(json!({"id": "n-1", "text": "a"}))
            .await
            .unwrap();
        let first = store.export_backup().await.unwrap().to_json().unwrap();
        let second = store.export_backup().await.unwrap().to_json().unwrap();
        assert_eq!(first, second);

        let parsed = Backup::from_json(&first).unwrap();
        assert_eq!(parsed.to_json().unwrap(), first);
    }

    #[test]
    fn reject_future_format_version() {
        let json = r#"{"formatVersion": 99, "exportedAt": 0, "manifest": {}, "collections": {}}"#;
        assert!(matches!(Backup::from_json(json), Err(Error::InvalidBackup(_))));
        assert!(matches!(Backup::from_json("{"), Err(Error::InvalidBackup(_))));
    }

    #[tokio::test]
    async fn import_migrates_old_records_and_reports_unknown_collections() {
        let store = Store::builder()
            .schema(
                CollectionSchema::new("notes", vec![FieldDef::required("body", FieldType::String)])
                    .at_version(2),
            )
            .build()
            .await
            .unwrap();
        store.registry().register_migration("notes", 1, |mut f| {
            let text = f.remove("text").unwrap_or(Value::Null);
            f.insert("body".into(), text);
            Ok(f)
        });

        let old = Record::new("n-1", json!({"text": "hello"}).as_object().cloned().unwrap(), 10);
        let stray = Record::new("x-1", json!({"a": 1}).as_object().cloned().unwrap(), 10);
        let backup = Backup {
            format_version: 1,
            exported_at: 10,
            manifest: BTreeMap::from([("notes".to_string(), 1)]),
            collections: BTreeMap::from([
                ("notes".to_string(), vec![old]),
                ("ghosts".to_string(), vec![stray]),
            ]),
        };

        let result = store.import_backup(backup, ImportOptions::replace()).await.unwrap();
        assert_eq!(result.inserted, 1);
        assert_eq!(result.failed.len(), 1);
        assert!(matches!(result.failed[0].1, Error::SchemaNotFound(ref c) if c == "ghosts"));

        let note = store.collection("notes").get("n-1").await.unwrap().unwrap();
        assert_eq!(note.get("body"), Some(&json!("hello")));
        assert_eq!(note.schema_version, Some(2));
    }
}
