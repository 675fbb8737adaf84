//! Entry registration, update, removal and query handlers.

use axum::extract::{Path, State};
use axum::Json;

use psc_core::RegistryId;

use crate::error::ApiError;
use crate::schema::entries::{AckResponse, QueryResponse, RegisterResponse};
use crate::state::RegistryState;
use crate::store::{EntryData, EntryFilter};

/// `POST /entries`
pub async fn register_entry(
    State(state): State<RegistryState>,
    Json(data): Json<EntryData>,
) -> Result<Json<RegisterResponse>, ApiError> {
    if data.comp.is_empty() {
        return Err(ApiError::BadRequest("entry needs a component name".to_string()));
    }
    let id = state.store.register(data);
    tracing::debug!(%id, "entry registered");
    Ok(Json(RegisterResponse { id }))
}

/// `PUT /entries/{id}`
pub async fn change_entry(
    State(state): State<RegistryState>,
    Path(id): Path<u32>,
    Json(data): Json<EntryData>,
) -> Result<Json<AckResponse>, ApiError> {
    if !state.store.change(RegistryId(id), data) {
        return Err(ApiError::NotFound(format!("entry {} not found", id)));
    }
    Ok(Json(AckResponse { success: true }))
}

/// `DELETE /entries/{id}`
pub async fn delete_entry(
    State(state): State<RegistryState>,
    Path(id): Path<u32>,
) -> Result<Json<AckResponse>, ApiError> {
    if !state.store.delete(RegistryId(id)) {
        return Err(ApiError::NotFound(format!("entry {} not found", id)));
    }
    tracing::debug!(id, "entry deleted");
    Ok(Json(AckResponse { success: true }))
}

/// `POST /entries/query`
pub async fn query_entries(
    State(state): State<RegistryState>,
    Json(filter): Json<EntryFilter>,
) -> Result<Json<QueryResponse>, ApiError> {
    Ok(Json(QueryResponse {
        entries: state.store.query(&filter),
    }))
}

/// `GET /health`
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
