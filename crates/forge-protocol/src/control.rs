use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use forge_core::config::{MAX_CADENCE_MS, MIN_CADENCE_MS};

use crate::events;

/// Client → Server frame.
/// Wire: `{ "event": "set-interval", "data": 500 }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ClientMessage {
    pub fn new(event: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Interpret the frame as one of the known control requests.
    pub fn request(&self) -> ClientRequest {
        match self.event.as_str() {
            events::SET_INTERVAL => ClientRequest::SetInterval(interval_from(self.data.as_ref())),
            events::REQUEST_SNAPSHOT => ClientRequest::RequestSnapshot,
            events::PING => ClientRequest::Ping,
            other => ClientRequest::Unknown(other.to_string()),
        }
    }
}

/// Accepts a bare integer or `{ "interval": <int> }`. Anything else is `None`,
/// which the gateway treats as an out-of-range request.
fn interval_from(data: Option<&Value>) -> Option<i64> {
    match data? {
        Value::Number(n) => n.as_i64(),
        Value::Object(map) => map.get("interval").and_then(Value::as_i64),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    /// Per-connection poll cadence override in milliseconds.
    SetInterval(Option<i64>),
    /// Ask for the channel's current value outside the normal cadence.
    RequestSnapshot,
    Ping,
    Unknown(String),
}

/// Payload of the `interval-set` reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntervalAck {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl IntervalAck {
    pub fn accepted(interval_ms: u64) -> Self {
        Self {
            success: true,
            interval: Some(interval_ms),
            message: None,
        }
    }

    pub fn rejected() -> Self {
        Self {
            success: false,
            interval: None,
            message: Some(events::INVALID_INTERVAL_MESSAGE.to_string()),
        }
    }
}

/// Inclusive range of cadences a client may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CadenceBounds {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl CadenceBounds {
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }
    }

    /// `Some(duration)` when `requested` lies inside the bounds.
    pub fn validate(&self, requested: i64) -> Option<Duration> {
        let ms = u64::try_from(requested).ok()?;
        (self.min_ms..=self.max_ms)
            .contains(&ms)
            .then(|| Duration::from_millis(ms))
    }
}

impl Default for CadenceBounds {
    fn default() -> Self {
        Self::new(MIN_CADENCE_MS, MAX_CADENCE_MS)
    }
}
