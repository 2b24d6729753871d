use axum::{
    extract::{Query, State},
    response::{IntoResponse, Response},
    Json,
};
use forge_core::Channel;
use serde::Deserialize;
use std::sync::Arc;

use crate::app::AppState;
use crate::http::bad_request;

const DEFAULT_ACTIVITY_LIMIT: usize = 50;

#[derive(Debug, Default, Deserialize)]
pub struct ConnectionsQuery {
    pub channel: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ActivityQuery {
    pub limit: Option<usize>,
}

/// GET /api/connections?channel=metrics: open connections, oldest first.
pub async fn active_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ConnectionsQuery>,
) -> Response {
    let channel = match query.channel.as_deref().map(str::parse::<Channel>) {
        None => None,
        Some(Ok(channel)) => Some(channel),
        Some(Err(e)) => return bad_request(e.code(), e.to_string()),
    };
    let mut records = state.gateway.registry().list_active(channel);
    records.sort_by_key(|r| r.connected_at);
    Json(records).into_response()
}

/// GET /api/connections/history: retained closed connections.
pub async fn history_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.gateway.registry().history()).into_response()
}

/// GET /api/connections/activity?limit=20: newest first.
pub async fn activity_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ActivityQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_ACTIVITY_LIMIT);
    Json(state.gateway.registry().activity(limit)).into_response()
}
