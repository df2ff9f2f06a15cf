pub mod auth;
pub mod breaker;
pub mod client;
pub mod config;
pub mod db;
pub mod errors;
pub mod http;
pub mod hub;
pub mod idempotency;
pub mod metrics;
pub mod presence;
pub mod processor;
pub mod repo;
pub mod router;
pub mod sharded;
pub mod state;
pub mod transfer;
pub mod validator;
pub mod ws;

pub use state::{AppState, Collaborators};

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws/v1/chat", get(ws::ws_chat_handler))
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .route(
            "/api/v1/users/{user_id}/public-key",
            get(http::identity::get_public_key),
        )
        .route(
            "/api/v1/users/{user_id}/fingerprint",
            get(http::identity::get_fingerprint),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

mod health {
    use axum::response::IntoResponse;
    pub async fn healthz() -> impl IntoResponse {
        "ok"
    }
    pub async fn readyz() -> impl IntoResponse {
        "ok"
    }
}
