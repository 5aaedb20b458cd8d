//! Credential management endpoints.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};

use super::routes::AppState;
use super::types::{
    ApiMessage, BatchDeleteRequest, BatchResponse, BatchUpdateRequest, ImportResponse,
    RevealRequest, RevealResponse,
};
use crate::keys::{CredentialPatch, ImportRequest, KeyError, NewCredential};
use crate::storage::ConfigDocument;

type ApiError = (StatusCode, Json<ApiMessage>);

fn key_error(err: KeyError) -> ApiError {
    let status = match err {
        KeyError::Validation(_) => StatusCode::BAD_REQUEST,
        KeyError::Conflict => StatusCode::CONFLICT,
        KeyError::NotFound => StatusCode::NOT_FOUND,
        KeyError::Forbidden => StatusCode::FORBIDDEN,
        KeyError::Persist => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ApiMessage::error(err.to_string())))
}

/// GET /api/config - configuration with masked keys.
pub async fn get_config(State(state): State<Arc<AppState>>) -> Json<ConfigDocument> {
    Json(state.store.list_masked().await)
}

/// POST /api/config - replace the whole configuration.
pub async fn replace_config(
    State(state): State<Arc<AppState>>,
    Json(config): Json<ConfigDocument>,
) -> Result<Json<ApiMessage>, ApiError> {
    state.store.replace_config(config).await.map_err(key_error)?;
    Ok(Json(ApiMessage::ok("Config saved")))
}

/// POST /api/keys
pub async fn add_key(
    State(state): State<Arc<AppState>>,
    Json(new): Json<NewCredential>,
) -> Result<(StatusCode, Json<ApiMessage>), ApiError> {
    state.store.add(new).await.map_err(key_error)?;
    Ok((
        StatusCode::CREATED,
        Json(ApiMessage::ok("Key added successfully")),
    ))
}

/// PUT /api/keys/:id
pub async fn update_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(patch): Json<CredentialPatch>,
) -> Result<Json<ApiMessage>, ApiError> {
    state.store.update(&id, patch).await.map_err(key_error)?;
    Ok(Json(ApiMessage::ok("Key updated successfully")))
}

/// DELETE /api/keys/:id
pub async fn delete_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ApiMessage>, ApiError> {
    state.store.delete(&id).await.map_err(key_error)?;
    Ok(Json(ApiMessage::ok("Key deleted successfully")))
}

/// POST /api/keys/batch-update
pub async fn batch_update(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BatchUpdateRequest>,
) -> Result<Json<BatchResponse>, ApiError> {
    let outcome = state
        .store
        .batch_update(&req.ids, req.updates)
        .await
        .map_err(key_error)?;
    Ok(Json(BatchResponse {
        success: !outcome.succeeded.is_empty(),
        message: format!("Updated {} key(s)", outcome.succeeded.len()),
        outcome,
    }))
}

/// POST /api/keys/batch-delete
pub async fn batch_delete(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BatchDeleteRequest>,
) -> Result<Json<BatchResponse>, ApiError> {
    let outcome = state.store.batch_delete(&req.ids).await.map_err(key_error)?;
    Ok(Json(BatchResponse {
        success: !outcome.succeeded.is_empty(),
        message: format!("Deleted {} key(s)", outcome.succeeded.len()),
        outcome,
    }))
}

/// POST /api/keys/import
pub async fn import_keys(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ImportRequest>,
) -> Result<Json<ImportResponse>, ApiError> {
    let report = state.store.import(req).await.map_err(key_error)?;
    Ok(Json(report.into()))
}

/// POST /api/keys/:id/reveal - guarded by the key's own view password.
pub async fn reveal_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<RevealRequest>,
) -> Result<Json<RevealResponse>, ApiError> {
    let key = state
        .store
        .reveal(&id, &req.view_password)
        .await
        .map_err(key_error)?;
    Ok(Json(RevealResponse { success: true, key }))
}
