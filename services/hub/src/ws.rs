use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::warn;

use crate::client;
use crate::state::AppState;

/// Upgrade handler for `/ws/v1/chat`.  Authentication happens in-band (the
/// first envelope must be `auth`), so the upgrade itself only enforces the
/// connection cap and the frame-size limit.
pub async fn ws_chat_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    if state.metrics.active_connections() >= state.config.max_connections {
        warn!(
            limit = state.config.max_connections,
            "connection limit reached, refusing upgrade"
        );
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    ws.max_message_size(state.config.ws_max_msg_size)
        .on_upgrade(move |socket| client::serve(socket, state))
        .into_response()
}
