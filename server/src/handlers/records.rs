//! Record handlers - one per adapter call of the remote tier.

use crate::db;
use crate::error::{AppError, Result};
use groundwork_engine::adapter::remote::{CountRequest, CountResponse, RemoveResponse};
use groundwork_engine::{Error, Record};
use sqlx::PgPool;

pub async fn handle_list(pool: &PgPool, collection: &str) -> Result<Vec<Record>> {
    Ok(db::list_records(pool, collection).await?)
}

pub async fn handle_get(pool: &PgPool, collection: &str, id: &str) -> Result<Record> {
    db::get_record(pool, collection, id)
        .await?
        .ok_or_else(|| not_found(collection, id))
}

pub async fn handle_create(pool: &PgPool, collection: &str, record: Record) -> Result<Record> {
    if record.id.is_empty() {
        return Err(AppError::BadRequest("record id must not be empty".into()));
    }
    if !db::insert_record(pool, collection, &record).await? {
        return Err(Error::RecordAlreadyExists {
            collection: collection.to_string(),
            id: record.id,
        }
        .into());
    }
    tracing::debug!(collection, id = %record.id, version = record.version, "record created");
    Ok(record)
}

pub async fn handle_replace(
    pool: &PgPool,
    collection: &str,
    id: &str,
    record: Record,
) -> Result<Record> {
    if record.id != id {
        return Err(AppError::BadRequest(format!(
            "body id '{}' does not match path id '{}'",
            record.id, id
        )));
    }
    if !db::replace_record(pool, collection, &record).await? {
        return Err(not_found(collection, id));
    }
    tracing::debug!(collection, id, version = record.version, "record replaced");
    Ok(record)
}

pub async fn handle_remove(pool: &PgPool, collection: &str, id: &str) -> Result<RemoveResponse> {
    if !db::delete_record(pool, collection, id).await? {
        return Err(not_found(collection, id));
    }
    tracing::debug!(collection, id, "record removed");
    Ok(RemoveResponse { removed: true })
}

/// Count matching records. Without predicates the count runs in SQL;
/// otherwise predicates are evaluated with the engine's matcher.
pub async fn handle_count(
    pool: &PgPool,
    collection: &str,
    request: CountRequest,
) -> Result<CountResponse> {
    let count = if request.predicates.is_empty() {
        db::count_records(pool, collection).await?
    } else {
        let records = db::list_records(pool, collection).await?;
        count_matching(&records, &request)
    };
    Ok(CountResponse { count })
}

fn count_matching(records: &[Record], request: &CountRequest) -> usize {
    records
        .iter()
        .filter(|r| request.predicates.iter().all(|p| p.matches(r)))
        .count()
}

fn not_found(collection: &str, id: &str) -> AppError {
    Error::NotFound {
        collection: collection.to_string(),
        id: id.to_string(),
    }
    .into()
}
