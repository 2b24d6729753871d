pub mod connections;
pub mod health;
pub mod logs;
pub mod metrics;

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

/// JSON error body shared by the introspection routes.
pub(crate) fn bad_request(code: &str, message: impl Into<String>) -> axum::response::Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "code": code, "message": message.into() })),
    )
        .into_response()
}
