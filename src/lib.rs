pub mod config;
pub mod conversation;
pub mod embeddings;
pub mod error;
pub mod inference;
pub mod state;

use axum::{
    extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router,
};
use serde_json::json;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

pub use error::{ApiError, ErrorResponse};
pub use state::AppState;

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .merge(embeddings::router())
        .merge(conversation::router())
        .route("/health", get(health))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let embed = state.embedder.as_ref().map(|e| {
        json!({
            "model": e.model_id(),
            "dims": e.dimensions(),
        })
    });
    Json(json!({
        "status": "ok",
        "embed": embed,
        "chat": state.chat.is_some(),
    }))
}

async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: "Not found".to_string(),
        }),
    )
}
