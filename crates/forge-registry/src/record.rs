use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use forge_core::{Channel, ConnectionId};

/// One entry of a connection's own event log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Lifecycle and traffic of one physical connection.
///
/// `disconnected_at` is set exactly once; a record with it set is closed and
/// lives only in the registry's history.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionRecord {
    pub id: ConnectionId,
    pub channel: Channel,
    pub remote_address: String,
    pub user_agent: String,
    pub connected_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub close_reason: Option<String>,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub event_log: VecDeque<ConnectionEvent>,
}

impl ConnectionRecord {
    pub(crate) fn open(
        id: ConnectionId,
        channel: Channel,
        remote_address: String,
        user_agent: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            channel,
            remote_address,
            user_agent,
            connected_at: now,
            last_activity_at: now,
            disconnected_at: None,
            close_reason: None,
            messages_sent: 0,
            messages_received: 0,
            event_log: VecDeque::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.disconnected_at.is_none()
    }

    /// Append to the bounded event log, dropping the oldest entry when full.
    pub(crate) fn push_event(&mut self, event: ConnectionEvent, cap: usize) {
        self.last_activity_at = event.timestamp;
        if cap == 0 {
            return;
        }
        while self.event_log.len() >= cap {
            self.event_log.pop_front();
        }
        self.event_log.push_back(event);
    }
}

/// Process-wide counters. Everything except `active_connections` only grows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggregateMetrics {
    pub total_connections: u64,
    pub active_connections: u64,
    pub disconnections: u64,
    pub errors: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityKind {
    Connect,
    Disconnect,
    Error,
    Message,
}

/// Registry-wide activity feed entry, newest first when queried.
#[derive(Debug, Clone, Serialize)]
pub struct ActivityEntry {
    pub timestamp: DateTime<Utc>,
    pub kind: ActivityKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conn_id: Option<ConnectionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<Channel>,
    pub message: String,
}
