use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use forge_core::config::BatchConfig;
use forge_core::DomainEvent;

/// What caused a batch to be emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushReason {
    /// The window since the first buffered event elapsed.
    Window,
    /// The buffer reached its size limit.
    Size,
    /// An explicit flush request.
    Manual,
    /// Final flush during shutdown.
    Drain,
}

/// An ordered, non-empty group of events emitted together.
///
/// Only [`BatchBuffer`] builds batches, and it never builds an empty one.
#[derive(Debug, Clone, Serialize)]
pub struct Batch {
    pub seq: u64,
    pub reason: FlushReason,
    pub flushed_at: DateTime<Utc>,
    events: Vec<DomainEvent>,
}

impl Batch {
    pub fn events(&self) -> &[DomainEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Always `false`; kept for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Synchronous buffering core of the pipeline.
///
/// The window opens when the first event lands in an empty buffer and is
/// only reset by a flush, so a steady trickle cannot postpone emission.
#[derive(Debug)]
pub struct BatchBuffer {
    max_size: usize,
    window: Duration,
    events: Vec<DomainEvent>,
    opened_at: Option<Instant>,
    next_seq: u64,
}

impl BatchBuffer {
    pub fn new(max_size: usize, window: Duration) -> Self {
        Self {
            max_size: max_size.max(1),
            window,
            events: Vec::with_capacity(max_size.max(1)),
            opened_at: None,
            next_seq: 0,
        }
    }

    pub fn from_config(config: &BatchConfig) -> Self {
        Self::new(config.max_batch_size, config.flush_window())
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Buffer one event. Returns a batch when this event filled the buffer.
    pub fn push(&mut self, event: DomainEvent, now: Instant) -> Option<Batch> {
        if self.events.is_empty() {
            self.opened_at = Some(now);
        }
        self.events.push(event);
        if self.events.len() >= self.max_size {
            return self.take(FlushReason::Size);
        }
        None
    }

    /// When the current window closes, if anything is buffered.
    pub fn deadline(&self) -> Option<Instant> {
        self.opened_at.map(|t| t + self.window)
    }

    /// Flush if the window has elapsed at `now`.
    pub fn take_if_due(&mut self, now: Instant) -> Option<Batch> {
        match self.deadline() {
            Some(deadline) if deadline <= now => self.take(FlushReason::Window),
            _ => None,
        }
    }

    /// Flush whatever is buffered. `None` when empty.
    pub fn take(&mut self, reason: FlushReason) -> Option<Batch> {
        if self.events.is_empty() {
            return None;
        }
        self.opened_at = None;
        let seq = self.next_seq;
        self.next_seq += 1;
        Some(Batch {
            seq,
            reason,
            flushed_at: Utc::now(),
            events: std::mem::replace(&mut self.events, Vec::with_capacity(self.max_size)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_core::EventLevel;

    fn ev(n: usize) -> DomainEvent {
        DomainEvent::new(EventLevel::Info, "test", format!("event {n}"))
    }

    #[test]
    fn size_limit_flushes_immediately() {
        let mut buf = BatchBuffer::new(3, Duration::from_secs(1));
        let t0 = Instant::now();
        assert!(buf.push(ev(0), t0).is_none());
        assert!(buf.push(ev(1), t0).is_none());
        let batch = buf.push(ev(2), t0).unwrap();

        assert_eq!(batch.len(), 3);
        assert_eq!(batch.reason, FlushReason::Size);
        assert!(buf.is_empty());
        assert!(buf.deadline().is_none());
    }

    #[test]
    fn window_measured_from_first_event() {
        let mut buf = BatchBuffer::new(100, Duration::from_millis(1000));
        let t0 = Instant::now();
        buf.push(ev(0), t0);
        // Later submissions do not push the deadline out.
        buf.push(ev(1), t0 + Duration::from_millis(900));
        assert_eq!(buf.deadline(), Some(t0 + Duration::from_millis(1000)));

        assert!(buf.take_if_due(t0 + Duration::from_millis(999)).is_none());
        let batch = buf.take_if_due(t0 + Duration::from_millis(1000)).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.reason, FlushReason::Window);
    }

    #[test]
    fn empty_buffer_never_emits() {
        let mut buf = BatchBuffer::new(10, Duration::from_millis(10));
        assert!(buf.take(FlushReason::Drain).is_none());
        assert!(buf.take_if_due(Instant::now() + Duration::from_secs(5)).is_none());
    }

    #[test]
    fn next_window_starts_fresh_after_size_flush() {
        let mut buf = BatchBuffer::new(2, Duration::from_millis(1000));
        let t0 = Instant::now();
        buf.push(ev(0), t0);
        buf.push(ev(1), t0).unwrap();

        let t1 = t0 + Duration::from_millis(600);
        buf.push(ev(2), t1);
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.deadline(), Some(t1 + Duration::from_millis(1000)));
    }

    #[test]
    fn sequence_numbers_increase() {
        let mut buf = BatchBuffer::new(1, Duration::from_millis(1000));
        let t0 = Instant::now();
        let a = buf.push(ev(0), t0).unwrap();
        let b = buf.push(ev(1), t0).unwrap();
        assert_eq!((a.seq, b.seq), (0, 1));
    }
}
