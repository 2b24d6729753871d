use std::collections::VecDeque;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Deserialize;

use forge_core::{DomainEvent, EventLevel};

use crate::batch::Batch;
use crate::pipeline::BatchConsumer;

/// Durable (or not) sink for domain events. The pipeline never persists on
/// its own; stores are attached as batch consumers through [`PersistBatches`].
pub trait EventStore: Send + Sync {
    fn append(&self, event: &DomainEvent);
}

/// Filter for [`MemoryEventStore::query`]. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogQuery {
    /// Minimum severity.
    pub level: Option<EventLevel>,
    pub source: Option<String>,
    /// Case-insensitive substring of the message.
    pub search: Option<String>,
    pub after: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl LogQuery {
    fn matches(&self, event: &DomainEvent, needle: Option<&str>) -> bool {
        if self.level.is_some_and(|min| event.level < min) {
            return false;
        }
        if self.source.as_deref().is_some_and(|s| event.source != s) {
            return false;
        }
        if self.after.is_some_and(|t| event.timestamp <= t) {
            return false;
        }
        if self.before.is_some_and(|t| event.timestamp >= t) {
            return false;
        }
        if let Some(needle) = needle {
            if !event.message.to_lowercase().contains(needle) {
                return false;
            }
        }
        true
    }
}

const DEFAULT_QUERY_LIMIT: usize = 100;

/// Bounded in-memory ring of recent events.
pub struct MemoryEventStore {
    capacity: usize,
    events: RwLock<VecDeque<DomainEvent>>,
}

impl MemoryEventStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            events: RwLock::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn len(&self) -> usize {
        self.events.read().expect("event store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<DomainEvent> {
        self.events
            .read()
            .expect("event store lock poisoned")
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Newest first, filtered.
    pub fn query(&self, query: &LogQuery) -> Vec<DomainEvent> {
        let needle = query.search.as_ref().map(|s| s.to_lowercase());
        let limit = query.limit.unwrap_or(DEFAULT_QUERY_LIMIT);
        self.events
            .read()
            .expect("event store lock poisoned")
            .iter()
            .rev()
            .filter(|e| query.matches(e, needle.as_deref()))
            .take(limit)
            .cloned()
            .collect()
    }
}

impl EventStore for MemoryEventStore {
    fn append(&self, event: &DomainEvent) {
        if self.capacity == 0 {
            return;
        }
        let mut events = self.events.write().expect("event store lock poisoned");
        while events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(event.clone());
    }
}

/// Adapts any [`EventStore`] into a batch consumer.
pub struct PersistBatches<S: ?Sized> {
    store: Arc<S>,
}

impl<S: EventStore + ?Sized> PersistBatches<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

impl<S: EventStore + ?Sized> BatchConsumer for PersistBatches<S> {
    fn on_batch(&self, batch: &Arc<Batch>) {
        for event in batch.events() {
            self.store.append(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn store_with(events: &[(EventLevel, &str, &str)]) -> MemoryEventStore {
        let store = MemoryEventStore::new(10);
        for (level, source, msg) in events {
            store.append(&DomainEvent::new(*level, *source, *msg));
        }
        store
    }

    #[test]
    fn capacity_drops_oldest() {
        let store = MemoryEventStore::new(2);
        for i in 0..3 {
            store.append(&DomainEvent::new(EventLevel::Info, "api", format!("m{i}")));
        }
        let msgs: Vec<_> = store.recent(10).into_iter().map(|e| e.message).collect();
        assert_eq!(msgs, vec!["m2", "m1"]);
    }

    #[test]
    fn query_by_level_source_and_text() {
        let store = store_with(&[
            (EventLevel::Debug, "api", "Cache warmed"),
            (EventLevel::Warn, "api", "Slow query on boards"),
            (EventLevel::Error, "db", "Connection refused"),
            (EventLevel::Error, "api", "Board save failed"),
        ]);

        let warn_plus = store.query(&LogQuery {
            level: Some(EventLevel::Warn),
            ..Default::default()
        });
        assert_eq!(warn_plus.len(), 3);

        let api_boards = store.query(&LogQuery {
            source: Some("api".into()),
            search: Some("BOARD".into()),
            ..Default::default()
        });
        let msgs: Vec<_> = api_boards.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(msgs, vec!["Board save failed", "Slow query on boards"]);
    }

    #[test]
    fn query_time_bounds_and_limit() {
        let store = store_with(&[
            (EventLevel::Info, "api", "a"),
            (EventLevel::Info, "api", "b"),
            (EventLevel::Info, "api", "c"),
        ]);
        let past = Utc::now() - Duration::hours(1);
        assert_eq!(
            store
                .query(&LogQuery {
                    after: Some(past),
                    limit: Some(2),
                    ..Default::default()
                })
                .len(),
            2
        );
        assert!(store
            .query(&LogQuery {
                before: Some(past),
                ..Default::default()
            })
            .is_empty());
    }
}
