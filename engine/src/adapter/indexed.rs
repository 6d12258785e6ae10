//! On-device indexed tier backed by SQLite.
//!
//! Rows are keyed by `(collection, id)` and carry an insertion sequence so
//! listings come back in insertion order. The full record body is stored as
//! JSON, so unknown fields survive untouched.

use super::{Adapter, AdapterKind};
use crate::error::Result;
use crate::query::Predicate;
use crate::record::Record;
use crate::{Error, RecordId};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;

const CREATE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS records (
        collection TEXT NOT NULL,
        id TEXT NOT NULL,
        seq INTEGER NOT NULL,
        deleted INTEGER NOT NULL DEFAULT 0,
        body TEXT NOT NULL,
        PRIMARY KEY (collection, id)
    )
"#;

const CREATE_SEQ_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS records_collection_seq ON records (collection, seq)";

const INSERT_RECORD: &str = r#"
    INSERT INTO records (collection, id, seq, deleted, body)
    VALUES ($1, $2, (SELECT COALESCE(MAX(seq), 0) + 1 FROM records WHERE collection = $1), $3, $4)
"#;

const UPDATE_RECORD: &str =
    "UPDATE records SET deleted = $3, body = $4 WHERE collection = $1 AND id = $2";

#[derive(Debug, Clone)]
pub struct IndexedAdapter {
    pool: SqlitePool,
}

impl IndexedAdapter {
    /// Open (creating if needed) a database at `url`, e.g.
    /// `sqlite://data/records.db` or `sqlite::memory:`.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);

        // An in-memory database lives and dies with its connection.
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(4)
        };

        let pool = pool_options.connect_with(options).await?;
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool, creating tables if missing.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::query(CREATE_TABLE).execute(&pool).await?;
        sqlx::query(CREATE_SEQ_INDEX).execute(&pool).await?;
        Ok(Self { pool })
    }

    fn decode(body: &str) -> Result<Record> {
        Ok(serde_json::from_str(body)?)
    }
}

fn map_insert_error(err: sqlx::Error, collection: &str, id: &str) -> Error {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => Error::RecordAlreadyExists {
            collection: collection.to_string(),
            id: id.to_string(),
        },
        _ => err.into(),
    }
}

#[async_trait]
impl Adapter for IndexedAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Indexed
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Record>> {
        let row = sqlx::query("SELECT body FROM records WHERE collection = $1 AND id = $2")
            .bind(collection)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(Self::decode(&row.try_get::<String, _>("body")?)?)),
            None => Ok(None),
        }
    }

    async fn get_all(&self, collection: &str) -> Result<Vec<Record>> {
        let rows = sqlx::query("SELECT body FROM records WHERE collection = $1 ORDER BY seq")
            .bind(collection)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| Self::decode(&row.try_get::<String, _>("body")?))
            .collect()
    }

    async fn insert(&self, collection: &str, record: &Record) -> Result<()> {
        sqlx::query(INSERT_RECORD)
            .bind(collection)
            .bind(&record.id)
            .bind(!record.is_active())
            .bind(serde_json::to_string(record)?)
            .execute(&self.pool)
            .await
            .map_err(|e| map_insert_error(e, collection, &record.id))?;
        Ok(())
    }

    async fn update(&self, collection: &str, record: &Record) -> Result<()> {
        let result = sqlx::query(UPDATE_RECORD)
            .bind(collection)
            .bind(&record.id)
            .bind(!record.is_active())
            .bind(serde_json::to_string(record)?)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found(collection, &record.id));
        }
        Ok(())
    }

    async fn remove(&self, collection: &str, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM records WHERE collection = $1 AND id = $2")
            .bind(collection)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn bulk_insert(&self, collection: &str, records: &[Record]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            sqlx::query(INSERT_RECORD)
                .bind(collection)
                .bind(&record.id)
                .bind(!record.is_active())
                .bind(serde_json::to_string(record)?)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_insert_error(e, collection, &record.id))?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn bulk_update(&self, collection: &str, records: &[Record]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            let result = sqlx::query(UPDATE_RECORD)
                .bind(collection)
                .bind(&record.id)
                .bind(!record.is_active())
                .bind(serde_json::to_string(record)?)
                .execute(&mut *tx)
                .await?;
            if result.rows_affected() == 0 {
                return Err(Error::not_found(collection, &record.id));
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn bulk_remove(&self, collection: &str, ids: &[RecordId]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0;
        for id in ids {
            let result = sqlx::query("DELETE FROM records WHERE collection = $1 AND id = $2")
                .bind(collection)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            removed += result.rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(removed)
    }

    async fn count(&self, collection: &str, predicates: &[Predicate]) -> Result<usize> {
        if predicates.is_empty() {
            let row = sqlx::query("SELECT COUNT(*) AS n FROM records WHERE collection = $1")
                .bind(collection)
                .fetch_one(&self.pool)
                .await?;
            return Ok(row.try_get::<i64, _>("n")? as usize);
        }

        let records = self.get_all(collection).await?;
        Ok(records
            .iter()
            .filter(|r| predicates.iter().all(|p| p.matches(r)))
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Operator;
    use serde_json::json;

    fn rec(id: &str, fields: serde_json::Value) -> Record {
        Record::new(id, fields.as_object().cloned().unwrap(), 1000)
    }

    async fn adapter() -> IndexedAdapter {
        IndexedAdapter::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn insert_get_update_remove() {
        let db = adapter().await;
        let record = rec("p-1", json!({"title": "Bridge", "extra": {"k": [1, 2]}}));
        db.insert("projects", &record).await.unwrap();
        assert_eq!(db.get("projects", "p-1").await.unwrap(), Some(record.clone()));

        assert!(matches!(
            db.insert("projects", &record).await,
            Err(Error::RecordAlreadyExists { .. })
        ));

        let mut changed = record.clone();
        changed.apply_patch(&json!({"title": "Tunnel"}).as_object().cloned().unwrap(), 2000);
        db.update("projects", &changed).await.unwrap();
        let stored = db.get("projects", "p-1").await.unwrap().unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.get("extra"), Some(&json!({"k": [1, 2]})));

        assert!(db.remove("projects", "p-1").await.unwrap());
        assert!(db.get("projects", "p-1").await.unwrap().is_none());
        assert!(matches!(
            db.update("projects", &changed).await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn listing_keeps_insertion_order_per_collection() {
        let db = adapter().await;
        for id in ["z", "a", "m"] {
            db.insert("projects", &rec(id, json!({}))).await.unwrap();
        }
        db.insert("clients", &rec("a", json!({}))).await.unwrap();

        let ids: Vec<_> = db
            .get_all("projects")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, ["z", "a", "m"]);
        assert_eq!(db.count("clients", &[]).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn bulk_operations_and_predicate_count() {
        let db = adapter().await;
        let records: Vec<_> = (0..20)
            .map(|i| rec(&format!("r-{i}"), json!({"amount": i})))
            .collect();
        db.bulk_insert("lines", &records).await.unwrap();

        let big = [Predicate::new("amount", Operator::Gte, json!(15))];
        assert_eq!(db.count("lines", &big).await.unwrap(), 5);

        let ids: Vec<RecordId> = records.iter().take(5).map(|r| r.id.clone()).collect();
        assert_eq!(db.bulk_remove("lines", &ids).await.unwrap(), 5);
        assert_eq!(db.count("lines", &[]).await.unwrap(), 15);
    }

    #[tokio::test]
    async fn bulk_insert_is_all_or_nothing() {
        let db = adapter().await;
        db.insert("lines", &rec("r-2", json!({}))).await.unwrap();

        let batch = vec![rec("r-1", json!({})), rec("r-2", json!({}))];
        assert!(db.bulk_insert("lines", &batch).await.is_err());
        assert_eq!(db.count("lines", &[]).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn file_database_survives_reconnect() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("records.db").display());
        {
            let db = IndexedAdapter::connect(&url).await.unwrap();
            db.insert("clients", &rec("c-1", json!({"name": "Acme"}))).await.unwrap();
        }
        let db = IndexedAdapter::connect(&url).await.unwrap();
        assert!(db.get("clients", "c-1").await.unwrap().is_some());
    }
}
