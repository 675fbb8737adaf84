//! Router assembly for the registry HTTP API.

use axum::routing::{get, post, put};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::RegistryState;

/// Builds the registry router with tracing and permissive CORS.
pub fn build_router(state: RegistryState) -> Router {
    Router::new()
        .route("/entries", post(handlers::entries::register_entry))
        .route("/entries/query", post(handlers::entries::query_entries))
        .route(
            "/entries/{id}",
            put(handlers::entries::change_entry).delete(handlers::entries::delete_entry),
        )
        .route("/health", get(handlers::entries::health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
