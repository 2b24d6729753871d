use axum::{
    extract::{Query, State},
    Json,
};
use forge_core::Channel;
use forge_protocol::IntervalAck;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

use crate::app::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct IntervalQuery {
    pub interval: Option<String>,
}

/// GET /api/metrics: registry counters, pipeline and poller statistics.
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let (polls_run, polls_skipped) = state.gateway.poll_stats();
    Json(json!({
        "connections": state.gateway.registry().metrics(),
        "pipeline": state.pipeline.stats(),
        "polls": { "run": polls_run, "skipped": polls_skipped },
        "interval": state.gateway.channel_cadence(Channel::Metrics).as_millis() as u64,
    }))
}

/// GET /api/metrics/set-interval?interval=500: channel-wide metrics cadence.
/// A rejected value leaves the current cadence in place.
pub async fn set_interval_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<IntervalQuery>,
) -> Json<IntervalAck> {
    let requested = query
        .interval
        .as_deref()
        .and_then(|v| v.trim().parse::<i64>().ok())
        .unwrap_or(-1);
    match state.gateway.set_channel_cadence(Channel::Metrics, requested) {
        Ok(cadence) => Json(IntervalAck::accepted(cadence.as_millis() as u64)),
        Err(e) => {
            debug!(error = %e, "metrics interval rejected");
            Json(IntervalAck::rejected())
        }
    }
}
