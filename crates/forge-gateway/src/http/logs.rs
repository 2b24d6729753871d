use axum::{
    extract::{Query, State},
    Json,
};
use forge_core::DomainEvent;
use forge_pipeline::LogQuery;
use std::sync::Arc;

use crate::app::AppState;

/// GET /api/logs?level=warn&source=api&search=board&limit=50: newest first.
pub async fn logs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogQuery>,
) -> Json<Vec<DomainEvent>> {
    Json(state.store.query(&query))
}
