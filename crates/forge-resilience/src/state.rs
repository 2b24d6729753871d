//! Observable state of a resilience controller.

use std::fmt;

use chrono::{DateTime, Utc};
use forge_core::Channel;
use serde::Serialize;
use serde_json::Value;

/// Lifecycle phase of one channel's client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Connecting,
    Live,
    Degraded,
    Reconciling,
    Closed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Live => "live",
            Self::Degraded => "degraded",
            Self::Reconciling => "reconciling",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a sample came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Authentic,
    Synthetic,
}

/// One observed payload, authentic or generated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    pub channel: Channel,
    /// Per-controller sequence number, starting at 1.
    pub seq: u64,
    pub provenance: Provenance,
    /// Strictly increasing across every sample of one controller.
    pub observed_at: DateTime<Utc>,
    pub data: Value,
}

impl Sample {
    pub fn is_synthetic(&self) -> bool {
        self.provenance == Provenance::Synthetic
    }
}

/// Phase and latest sample, published together so readers never see one
/// without the other.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelState {
    pub channel: Channel,
    pub phase: Phase,
    /// Reconnect attempts since the last time the channel was live.
    pub retry_count: u32,
    pub last_transition: DateTime<Utc>,
    pub synthetic_active: bool,
    /// Set while synthetic mode was requested by the user.
    pub held: bool,
    pub latest: Option<Sample>,
}

impl ChannelState {
    pub(crate) fn initial(channel: Channel) -> Self {
        Self {
            channel,
            phase: Phase::Connecting,
            retry_count: 0,
            last_transition: Utc::now(),
            synthetic_active: false,
            held: false,
            latest: None,
        }
    }
}

/// Everything a controller emits, in order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ControllerEvent {
    Transition {
        channel: Channel,
        from: Phase,
        to: Phase,
        at: DateTime<Utc>,
        retry_count: u32,
    },
    Sample(Sample),
}

impl ControllerEvent {
    pub fn channel(&self) -> Channel {
        match self {
            Self::Transition { channel, .. } => *channel,
            Self::Sample(sample) => sample.channel,
        }
    }
}
