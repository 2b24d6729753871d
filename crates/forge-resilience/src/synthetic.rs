//! Stand-in payloads emitted while a channel's transport is down.
//!
//! Every generator produces the same shape the gateway broadcasts for its
//! channel, so consumers render synthetic and authentic data alike; the
//! [`Provenance`](crate::state::Provenance) on each sample tells them apart.

use chrono::{DateTime, Utc};
use forge_core::{Channel, DomainEvent, EventLevel};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};

pub trait SyntheticGenerator: Send {
    fn channel(&self) -> Channel;

    /// Next payload, stamped with `at`.
    fn generate(&mut self, at: DateTime<Utc>) -> Value;
}

/// Default generator for a channel, seeded for reproducible output.
pub fn generator_for(channel: Channel, seed: u64) -> Box<dyn SyntheticGenerator> {
    match channel {
        Channel::Metrics => Box::new(MetricsGenerator::new(seed)),
        Channel::Health => Box::new(HealthGenerator::new()),
        Channel::Logs => Box::new(LogGenerator::new(seed)),
        Channel::Diagnostics => Box::new(DiagnosticsGenerator),
        Channel::Board => Box::new(BoardGenerator),
    }
}

/// One bounded random-walk series.
#[derive(Debug, Clone, Copy)]
struct Walk {
    value: f64,
    min: f64,
    max: f64,
    down: f64,
    up: f64,
}

impl Walk {
    fn step(&mut self, rng: &mut StdRng) -> f64 {
        let delta = rng.random_range(-self.down..=self.up);
        self.value = (self.value + delta).clamp(self.min, self.max);
        (self.value * 10.0).round() / 10.0
    }
}

/// `system-metrics` payloads as a random walk: cpu 5–95, memory 20–90,
/// disk 30–95 (slowly filling), network 5–80.
pub struct MetricsGenerator {
    rng: StdRng,
    cpu: Walk,
    memory: Walk,
    disk: Walk,
    network: Walk,
}

impl MetricsGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            cpu: Walk { value: 35.0, min: 5.0, max: 95.0, down: 3.0, up: 3.0 },
            memory: Walk { value: 55.0, min: 20.0, max: 90.0, down: 2.0, up: 2.0 },
            disk: Walk { value: 60.0, min: 30.0, max: 95.0, down: 0.5, up: 1.5 },
            network: Walk { value: 20.0, min: 5.0, max: 80.0, down: 4.0, up: 4.0 },
        }
    }
}

impl SyntheticGenerator for MetricsGenerator {
    fn channel(&self) -> Channel {
        Channel::Metrics
    }

    fn generate(&mut self, at: DateTime<Utc>) -> Value {
        json!({
            "cpu": self.cpu.step(&mut self.rng),
            "memory": self.memory.step(&mut self.rng),
            "disk": self.disk.step(&mut self.rng),
            "network": self.network.step(&mut self.rng),
            "time": at.to_rfc3339(),
        })
    }
}

/// `health-update` payloads reporting `healthy` with an uptime counted from
/// the first generated sample.
pub struct HealthGenerator {
    since: Option<DateTime<Utc>>,
}

impl HealthGenerator {
    pub fn new() -> Self {
        Self { since: None }
    }
}

impl Default for HealthGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticGenerator for HealthGenerator {
    fn channel(&self) -> Channel {
        Channel::Health
    }

    fn generate(&mut self, at: DateTime<Utc>) -> Value {
        let since = *self.since.get_or_insert(at);
        let uptime = (at - since).num_seconds().max(0);
        json!({
            "status": "healthy",
            "uptime": uptime,
            "version": env!("CARGO_PKG_VERSION"),
            "timestamp": at.to_rfc3339(),
        })
    }
}

const LOG_SOURCES: [&str; 5] = ["api", "auth", "board", "scheduler", "storage"];

const LOG_MESSAGES: [(EventLevel, &str); 8] = [
    (EventLevel::Info, "request completed"),
    (EventLevel::Info, "board loaded"),
    (EventLevel::Info, "card moved"),
    (EventLevel::Debug, "cache refreshed"),
    (EventLevel::Debug, "session renewed"),
    (EventLevel::Warn, "slow query detected"),
    (EventLevel::Warn, "token close to expiry"),
    (EventLevel::Error, "upstream request failed"),
];

/// `log-batch` payloads of one to three plausible events.
pub struct LogGenerator {
    rng: StdRng,
    seq: u64,
}

impl LogGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            seq: 0,
        }
    }
}

impl SyntheticGenerator for LogGenerator {
    fn channel(&self) -> Channel {
        Channel::Logs
    }

    fn generate(&mut self, at: DateTime<Utc>) -> Value {
        self.seq += 1;
        let count = self.rng.random_range(1..=3);
        let events: Vec<DomainEvent> = (0..count)
            .map(|_| {
                let (level, message) = LOG_MESSAGES[self.rng.random_range(0..LOG_MESSAGES.len())];
                let source = LOG_SOURCES[self.rng.random_range(0..LOG_SOURCES.len())];
                let mut event = DomainEvent::new(level, source, message);
                event.timestamp = at;
                event
            })
            .collect();
        json!({
            "seq": self.seq,
            "reason": "window",
            "events": events,
        })
    }
}

/// `socket-status` payloads describing a gateway with nobody connected.
pub struct DiagnosticsGenerator;

impl SyntheticGenerator for DiagnosticsGenerator {
    fn channel(&self) -> Channel {
        Channel::Diagnostics
    }

    fn generate(&mut self, at: DateTime<Utc>) -> Value {
        json!({
            "metrics": {
                "total_connections": 0,
                "active_connections": 0,
                "disconnections": 0,
                "errors": 0,
                "messages_sent": 0,
                "messages_received": 0,
                "last_error": null,
            },
            "connections": [],
            "timestamp": at.to_rfc3339(),
        })
    }
}

/// Empty `board-update` payloads.
pub struct BoardGenerator;

impl SyntheticGenerator for BoardGenerator {
    fn channel(&self) -> Channel {
        Channel::Board
    }

    fn generate(&mut self, at: DateTime<Utc>) -> Value {
        json!({
            "columns": [],
            "cards": [],
            "timestamp": at.to_rfc3339(),
        })
    }
}
