//! Queries against the records table.
//!
//! The whole record, metadata included, lives in `body`. The `version`,
//! `deleted` and `updated_at` columns mirror it for inspection from SQL.

use groundwork_engine::Record;
use sqlx::types::Json;
use sqlx::{PgPool, Row};

/// List a collection in insertion order.
pub async fn list_records(pool: &PgPool, collection: &str) -> Result<Vec<Record>, sqlx::Error> {
    let rows = sqlx::query("SELECT body FROM records WHERE collection = $1 ORDER BY seq")
        .bind(collection)
        .fetch_all(pool)
        .await?;

    rows.iter()
        .map(|row| Ok::<_, sqlx::Error>(row.try_get::<Json<Record>, _>("body")?.0))
        .collect()
}

/// Get a record by collection and ID.
pub async fn get_record(
    pool: &PgPool,
    collection: &str,
    record_id: &str,
) -> Result<Option<Record>, sqlx::Error> {
    let row = sqlx::query("SELECT body FROM records WHERE collection = $1 AND record_id = $2")
        .bind(collection)
        .bind(record_id)
        .fetch_optional(pool)
        .await?;

    row.map(|row| Ok::<_, sqlx::Error>(row.try_get::<Json<Record>, _>("body")?.0))
        .transpose()
}

/// Insert a new record. Returns `false` if the id is already taken.
pub async fn insert_record(
    pool: &PgPool,
    collection: &str,
    record: &Record,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO records (collection, record_id, version, deleted, body, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (collection, record_id) DO NOTHING
        "#,
    )
    .bind(collection)
    .bind(&record.id)
    .bind(record.version as i64)
    .bind(record.deleted_at.is_some())
    .bind(Json(record))
    .bind(record.updated_at as i64)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Replace a stored record wholesale. Returns `false` if it does not exist.
pub async fn replace_record(
    pool: &PgPool,
    collection: &str,
    record: &Record,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE records
        SET version = $3, deleted = $4, body = $5, updated_at = $6
        WHERE collection = $1 AND record_id = $2
        "#,
    )
    .bind(collection)
    .bind(&record.id)
    .bind(record.version as i64)
    .bind(record.deleted_at.is_some())
    .bind(Json(record))
    .bind(record.updated_at as i64)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Physically delete a record. Returns whether a row was removed.
pub async fn delete_record(
    pool: &PgPool,
    collection: &str,
    record_id: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM records WHERE collection = $1 AND record_id = $2")
        .bind(collection)
        .bind(record_id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() == 1)
}

/// Number of rows in a collection, deleted ones included.
pub async fn count_records(pool: &PgPool, collection: &str) -> Result<usize, sqlx::Error> {
    let row = sqlx::query("SELECT COUNT(*) AS n FROM records WHERE collection = $1")
        .bind(collection)
        .fetch_one(pool)
        .await?;

    Ok(row.try_get::<i64, _>("n")? as usize)
}
