use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::ForgeError;

/// Opaque identifier of one physical duplex connection.
///
/// A closed connection's id is never handed to a new connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Logical real-time topic with its own subscriber set and cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Metrics,
    Health,
    Logs,
    Board,
    Diagnostics,
}

impl Channel {
    pub const ALL: [Channel; 5] = [
        Channel::Metrics,
        Channel::Health,
        Channel::Logs,
        Channel::Board,
        Channel::Diagnostics,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Metrics => "metrics",
            Self::Health => "health",
            Self::Logs => "logs",
            Self::Board => "board",
            Self::Diagnostics => "diagnostics",
        }
    }

    /// Event name carried in the envelope of every broadcast on this channel.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Metrics => "system-metrics",
            Self::Health => "health-update",
            Self::Logs => "log-batch",
            Self::Board => "board-update",
            Self::Diagnostics => "socket-status",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = ForgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "metrics" => Ok(Self::Metrics),
            "health" => Ok(Self::Health),
            "logs" => Ok(Self::Logs),
            "board" => Ok(Self::Board),
            "diagnostics" => Ok(Self::Diagnostics),
            other => Err(ForgeError::UnknownChannel(other.to_string())),
        }
    }
}

/// Severity of a domain event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl EventLevel {
    /// Lenient parse: accepts `warning` for `warn`, falls back to `info`.
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "warn" | "warning" => Self::Warn,
            "error" => Self::Error,
            "fatal" => Self::Fatal,
            _ => Self::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Fatal => "fatal",
        }
    }
}

impl fmt::Display for EventLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single unit of telemetry, e.g. one log line.
///
/// Never mutated after construction; batches share events behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub id: String,
    pub level: EventLevel,
    pub message: String,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub details: Map<String, Value>,
}

impl DomainEvent {
    pub fn new(level: EventLevel, source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            level,
            message: message.into(),
            source: source.into(),
            timestamp: Utc::now(),
            details: Map::new(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_round_trips_through_str() {
        for ch in Channel::ALL {
            assert_eq!(ch.as_str().parse::<Channel>().unwrap(), ch);
        }
        assert!("kanban".parse::<Channel>().is_err());
    }

    #[test]
    fn channel_serializes_lowercase() {
        let json = serde_json::to_string(&Channel::Diagnostics).unwrap();
        assert_eq!(json, r#""diagnostics""#);
    }

    #[test]
    fn level_parse_is_lenient() {
        assert_eq!(EventLevel::parse_lenient("WARNING"), EventLevel::Warn);
        assert_eq!(EventLevel::parse_lenient("bogus"), EventLevel::Info);
        assert!(EventLevel::Error > EventLevel::Warn);
    }

    #[test]
    fn domain_event_ids_are_unique() {
        let a = DomainEvent::new(EventLevel::Info, "api", "one");
        let b = DomainEvent::new(EventLevel::Info, "api", "one");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn empty_details_omitted_on_wire() {
        let ev = DomainEvent::new(EventLevel::Info, "api", "hello");
        let json = serde_json::to_string(&ev).unwrap();
        assert!(!json.contains("details"));

        let ev = ev.with_detail("user", "u-1");
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains(r#""details":{"user":"u-1"}"#));
    }
}
