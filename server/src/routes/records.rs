//! Collection record routes.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};

use crate::error::Result;
use crate::handlers::{
    handle_count, handle_create, handle_get, handle_list, handle_remove, handle_replace,
};
use crate::AppState;
use groundwork_engine::adapter::remote::{CountRequest, CountResponse, RemoveResponse};
use groundwork_engine::Record;

/// Create record routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/collections/{collection}/records",
            get(list_handler).post(create_handler),
        )
        .route(
            "/collections/{collection}/records/{id}",
            get(get_handler).put(replace_handler).delete(remove_handler),
        )
        .route("/collections/{collection}/count", post(count_handler))
}

/// GET /collections/{collection}/records
async fn list_handler(
    State(state): State<AppState>,
    Path(collection): Path<String>,
) -> Result<Json<Vec<Record>>> {
    Ok(Json(handle_list(&state.pool, &collection).await?))
}

/// POST /collections/{collection}/records
async fn create_handler(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    Json(record): Json<Record>,
) -> Result<(StatusCode, Json<Record>)> {
    let record = handle_create(&state.pool, &collection, record).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// GET /collections/{collection}/records/{id}
async fn get_handler(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
) -> Result<Json<Record>> {
    Ok(Json(handle_get(&state.pool, &collection, &id).await?))
}

/// PUT /collections/{collection}/records/{id}
async fn replace_handler(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
    Json(record): Json<Record>,
) -> Result<Json<Record>> {
    Ok(Json(handle_replace(&state.pool, &collection, &id, record).await?))
}

/// DELETE /collections/{collection}/records/{id}
async fn remove_handler(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
) -> Result<Json<RemoveResponse>> {
    Ok(Json(handle_remove(&state.pool, &collection, &id).await?))
}

/// POST /collections/{collection}/count
async fn count_handler(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    Json(request): Json<CountRequest>,
) -> Result<Json<CountResponse>> {
    Ok(Json(handle_count(&state.pool, &collection, request).await?))
}
