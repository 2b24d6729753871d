use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome marker carried by every envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

/// Server → Client frame, identical for event-driven and poll-driven pushes.
/// Wire: `{ "status": "success", "event": "system-metrics", "data": {...}, "timestamp": "2024-…Z" }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub status: Status,
    pub event: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    pub fn success(event: impl Into<String>, data: impl Serialize) -> Self {
        Self::with_status(Status::Success, event, data)
    }

    pub fn error(event: impl Into<String>, data: impl Serialize) -> Self {
        Self::with_status(Status::Error, event, data)
    }

    fn with_status(status: Status, event: impl Into<String>, data: impl Serialize) -> Self {
        Self {
            status,
            event: event.into(),
            data: serde_json::to_value(data).unwrap_or(Value::Null),
            timestamp: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    /// Serialize for the wire. Envelopes hold only JSON values, so this
    /// cannot fail in practice; an empty string is returned if it ever does.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
