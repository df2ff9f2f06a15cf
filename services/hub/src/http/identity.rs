use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chat_protocol::{error_codes, ErrorBody};

use crate::repo::RepoError;
use crate::state::AppState;

pub async fn get_public_key(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    match state.identity.get_public_key(&user_id).await {
        Ok(key) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "user_id": user_id,
                "public_key": BASE64.encode(key),
            })),
        )
            .into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

pub async fn get_fingerprint(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    match state.identity.get_fingerprint(&user_id).await {
        Ok(fingerprint) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "user_id": user_id,
                "fingerprint": fingerprint,
            })),
        )
            .into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

fn error_response(error: &RepoError) -> (StatusCode, Json<ErrorBody>) {
    if error.is_not_found() {
        (
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                code: error_codes::USER_NOT_FOUND.to_owned(),
                message: "no identity key for this user".to_owned(),
            }),
        )
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorBody {
                code: error_codes::INTERNAL_ERROR.to_owned(),
                message: error.to_string(),
            }),
        )
    }
}
