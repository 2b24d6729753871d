//! The registry proper.
//!
//! All mutation goes through one `Mutex`, so open/close/activity callbacks
//! arriving from different sockets are serialized and the aggregate counters
//! always agree with the set of active records.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use forge_core::config::RegistryConfig;
use forge_core::{Channel, ConnectionId};

use crate::error::RegistryError;
use crate::record::{
    ActivityEntry, ActivityKind, AggregateMetrics, ConnectionEvent, ConnectionRecord,
};

struct Inner {
    active: HashMap<ConnectionId, ConnectionRecord>,
    /// Closed records in close order; the front is the oldest close.
    closed: VecDeque<ConnectionRecord>,
    metrics: AggregateMetrics,
    /// Newest entry at the front.
    activity: VecDeque<ActivityEntry>,
}

pub struct ConnectionRegistry {
    config: RegistryConfig,
    inner: Mutex<Inner>,
}

impl ConnectionRegistry {
    pub fn new(config: RegistryConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            inner: Mutex::new(Inner {
                active: HashMap::new(),
                closed: VecDeque::new(),
                metrics: AggregateMetrics::default(),
                activity: VecDeque::new(),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("registry lock poisoned")
    }

    /// Open a record for a new physical connection.
    ///
    /// An id that only appears in history gets a fresh record; the closed
    /// one stays in history untouched.
    pub fn register(
        &self,
        id: ConnectionId,
        channel: Channel,
        remote_address: impl Into<String>,
        user_agent: impl Into<String>,
    ) -> Result<ConnectionRecord, RegistryError> {
        let mut inner = self.lock();
        if inner.active.contains_key(&id) {
            return Err(RegistryError::DuplicateId { id });
        }

        let now = Utc::now();
        let mut record =
            ConnectionRecord::open(id.clone(), channel, remote_address.into(), user_agent.into(), now);
        record.push_event(
            ConnectionEvent {
                event_type: "connect".to_string(),
                timestamp: now,
                data: None,
            },
            self.config.event_log_cap,
        );

        inner.metrics.total_connections += 1;
        inner.metrics.active_connections += 1;
        let message = format!("connected from {}", record.remote_address);
        self.push_activity(
            &mut inner,
            ActivityKind::Connect,
            Some(&id),
            Some(channel),
            message,
        );
        inner.active.insert(id.clone(), record.clone());

        info!(conn_id = %id, channel = %channel, "connection registered");
        Ok(record)
    }

    /// Append an entry to the connection's event log.
    pub fn record_activity(
        &self,
        id: &ConnectionId,
        event_type: &str,
        data: Option<Value>,
    ) -> Result<(), RegistryError> {
        let mut inner = self.lock();
        self.touch(&mut inner, id, event_type, data)
    }

    /// Count one outbound message on the connection.
    pub fn record_sent(&self, id: &ConnectionId, event_type: &str) -> Result<(), RegistryError> {
        let mut inner = self.lock();
        self.touch(&mut inner, id, event_type, None)?;
        if let Some(record) = inner.active.get_mut(id) {
            record.messages_sent += 1;
        }
        inner.metrics.messages_sent += 1;
        Ok(())
    }

    /// Count one inbound message on the connection.
    pub fn record_received(
        &self,
        id: &ConnectionId,
        event_type: &str,
        data: Option<Value>,
    ) -> Result<(), RegistryError> {
        let mut inner = self.lock();
        self.touch(&mut inner, id, event_type, data)?;
        if let Some(record) = inner.active.get_mut(id) {
            record.messages_received += 1;
        }
        inner.metrics.messages_received += 1;
        let channel = inner.active.get(id).map(|r| r.channel);
        self.push_activity(
            &mut inner,
            ActivityKind::Message,
            Some(id),
            channel,
            format!("received {event_type}"),
        );
        Ok(())
    }

    /// Count an error, optionally attributed to a connection.
    pub fn record_error(&self, id: Option<&ConnectionId>, message: impl Into<String>) {
        let message = message.into();
        let mut inner = self.lock();
        inner.metrics.errors += 1;
        inner.metrics.last_error = Some(message.clone());

        let mut channel = None;
        if let Some(id) = id {
            if let Some(record) = inner.active.get_mut(id) {
                channel = Some(record.channel);
                record.push_event(
                    ConnectionEvent {
                        event_type: "error".to_string(),
                        timestamp: Utc::now(),
                        data: Some(Value::String(message.clone())),
                    },
                    self.config.event_log_cap,
                );
            }
        }
        self.push_activity(&mut inner, ActivityKind::Error, id, channel, message);
    }

    /// Close a connection. Returns `true` only for the call that actually
    /// closed it; later calls are no-ops.
    pub fn close(&self, id: &ConnectionId, reason: &str) -> bool {
        let mut inner = self.lock();
        let Some(mut record) = inner.active.remove(id) else {
            debug!(conn_id = %id, reason, "close ignored: not active");
            return false;
        };

        let now = Utc::now();
        record.push_event(
            ConnectionEvent {
                event_type: "disconnect".to_string(),
                timestamp: now,
                data: Some(Value::String(reason.to_string())),
            },
            self.config.event_log_cap,
        );
        record.disconnected_at = Some(now);
        record.close_reason = Some(reason.to_string());

        inner.metrics.active_connections -= 1;
        inner.metrics.disconnections += 1;
        let channel = record.channel;
        self.push_activity(
            &mut inner,
            ActivityKind::Disconnect,
            Some(id),
            Some(channel),
            format!("disconnected: {reason}"),
        );

        inner.closed.push_back(record);
        while inner.closed.len() > self.config.retention_cap {
            inner.closed.pop_front();
        }

        info!(conn_id = %id, channel = %channel, reason, "connection closed");
        true
    }

    /// Snapshots of open records, optionally restricted to one channel.
    /// Order is unspecified; sort by `connected_at` if it matters.
    pub fn list_active(&self, channel: Option<Channel>) -> Vec<ConnectionRecord> {
        self.lock()
            .active
            .values()
            .filter(|r| channel.map_or(true, |c| r.channel == c))
            .cloned()
            .collect()
    }

    /// Ids of open connections on a channel.
    pub fn active_ids(&self, channel: Channel) -> Vec<ConnectionId> {
        self.lock()
            .active
            .values()
            .filter(|r| r.channel == channel)
            .map(|r| r.id.clone())
            .collect()
    }

    pub fn active_count(&self, channel: Channel) -> usize {
        self.lock()
            .active
            .values()
            .filter(|r| r.channel == channel)
            .count()
    }

    pub fn is_active(&self, id: &ConnectionId) -> bool {
        self.lock().active.contains_key(id)
    }

    /// Look up a record, preferring the open one over history.
    pub fn get(&self, id: &ConnectionId) -> Option<ConnectionRecord> {
        let inner = self.lock();
        if let Some(record) = inner.active.get(id) {
            return Some(record.clone());
        }
        inner.closed.iter().rev().find(|r| &r.id == id).cloned()
    }

    /// Retained closed records, oldest close first.
    pub fn history(&self) -> Vec<ConnectionRecord> {
        self.lock().closed.iter().cloned().collect()
    }

    /// Most recent activity entries, newest first.
    pub fn activity(&self, limit: usize) -> Vec<ActivityEntry> {
        self.lock().activity.iter().take(limit).cloned().collect()
    }

    /// Point-in-time copy of the aggregate counters.
    pub fn metrics(&self) -> AggregateMetrics {
        self.lock().metrics.clone()
    }

    fn touch(
        &self,
        inner: &mut Inner,
        id: &ConnectionId,
        event_type: &str,
        data: Option<Value>,
    ) -> Result<(), RegistryError> {
        let Some(record) = inner.active.get_mut(id) else {
            warn!(conn_id = %id, event_type, "activity for inactive connection ignored");
            return Err(RegistryError::UnknownConnection { id: id.clone() });
        };
        record.push_event(
            ConnectionEvent {
                event_type: event_type.to_string(),
                timestamp: Utc::now(),
                data,
            },
            self.config.event_log_cap,
        );
        Ok(())
    }

    fn push_activity(
        &self,
        inner: &mut Inner,
        kind: ActivityKind,
        id: Option<&ConnectionId>,
        channel: Option<Channel>,
        message: String,
    ) {
        inner.activity.push_front(ActivityEntry {
            timestamp: Utc::now(),
            kind,
            conn_id: id.cloned(),
            channel,
            message,
        });
        inner.activity.truncate(self.config.activity_feed_cap);
    }
}
