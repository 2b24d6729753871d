//! Fan-in of every channel's phase into one summary.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use forge_core::Channel;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::controller::ControllerHandle;
use crate::state::{ChannelState, Phase};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelStatus {
    pub channel: Channel,
    pub phase: Phase,
    pub synthetic: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatusSummary {
    /// Sorted by channel.
    pub channels: Vec<ChannelStatus>,
    pub all_live: bool,
    pub any_synthetic: bool,
}

impl StatusSummary {
    fn compute(states: &BTreeMap<Channel, ChannelStatus>) -> Self {
        let channels: Vec<ChannelStatus> = states.values().cloned().collect();
        let all_live = !channels.is_empty() && channels.iter().all(|c| c.phase == Phase::Live);
        let any_synthetic = channels.iter().any(|c| c.synthetic);
        Self {
            channels,
            all_live,
            any_synthetic,
        }
    }
}

struct Inner {
    /// Generation of the tracker currently following each channel.
    /// Lock order: `owners` before `states`.
    owners: Mutex<HashMap<Channel, u64>>,
    states: Mutex<BTreeMap<Channel, ChannelStatus>>,
    summary: watch::Sender<StatusSummary>,
}

impl Inner {
    fn record_tracked(&self, state: &ChannelState, generation: u64) {
        let owners = self.owners.lock().expect("status board lock poisoned");
        if owners.get(&state.channel) != Some(&generation) {
            return;
        }
        self.record(state);
    }

    fn record(&self, state: &ChannelState) {
        let mut states = self.states.lock().expect("status board lock poisoned");
        states.insert(
            state.channel,
            ChannelStatus {
                channel: state.channel,
                phase: state.phase,
                synthetic: state.synthetic_active,
            },
        );
        self.summary.send_replace(StatusSummary::compute(&states));
    }
}

/// Tracks the phase of several controllers and republishes a
/// [`StatusSummary`] whenever one of them changes.
pub struct StatusBoard {
    inner: Arc<Inner>,
    trackers: HashMap<Channel, JoinHandle<()>>,
    next_generation: u64,
}

impl StatusBoard {
    pub fn new() -> Self {
        let (summary, _) = watch::channel(StatusSummary::default());
        Self {
            inner: Arc::new(Inner {
                owners: Mutex::new(HashMap::new()),
                states: Mutex::new(BTreeMap::new()),
                summary,
            }),
            trackers: HashMap::new(),
            next_generation: 0,
        }
    }

    /// Follow a controller until it stops, starting from its current state.
    ///
    /// Tracking a second controller on the same channel drops the first;
    /// nothing the old controller publishes afterwards reaches the board.
    pub fn track(&mut self, handle: &ControllerHandle) {
        let channel = handle.channel();
        self.next_generation += 1;
        let generation = self.next_generation;
        self.inner
            .owners
            .lock()
            .expect("status board lock poisoned")
            .insert(channel, generation);
        if let Some(previous) = self.trackers.remove(&channel) {
            previous.abort();
        }

        let mut rx = handle.subscribe();
        let current = rx.borrow_and_update().clone();
        self.inner.record_tracked(&current, generation);

        let inner = Arc::clone(&self.inner);
        let tracker = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let state = rx.borrow_and_update().clone();
                inner.record_tracked(&state, generation);
            }
        });
        self.trackers.insert(channel, tracker);
    }

    pub fn record(&self, state: &ChannelState) {
        self.inner.record(state);
    }

    pub fn summary(&self) -> StatusSummary {
        self.inner.summary.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSummary> {
        self.inner.summary.subscribe()
    }

    /// Stop following controllers.
    pub fn stop(&mut self) {
        self.inner
            .owners
            .lock()
            .expect("status board lock poisoned")
            .clear();
        for (_, tracker) in self.trackers.drain() {
            tracker.abort();
        }
    }
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for StatusBoard {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(channel: Channel, phase: Phase, synthetic: bool) -> ChannelState {
        let mut s = ChannelState::initial(channel);
        s.phase = phase;
        s.synthetic_active = synthetic;
        s
    }

    #[test]
    fn empty_board_is_not_all_live() {
        let board = StatusBoard::new();
        let summary = board.summary();
        assert!(!summary.all_live);
        assert!(!summary.any_synthetic);
    }

    #[test]
    fn summary_follows_every_record() {
        let board = StatusBoard::new();
        board.record(&state(Channel::Metrics, Phase::Live, false));
        board.record(&state(Channel::Health, Phase::Live, false));
        assert!(board.summary().all_live);

        board.record(&state(Channel::Health, Phase::Degraded, true));
        let summary = board.summary();
        assert!(!summary.all_live);
        assert!(summary.any_synthetic);
        assert_eq!(summary.channels.len(), 2);
        assert_eq!(summary.channels[0].channel, Channel::Metrics);
        assert_eq!(summary.channels[1].phase, Phase::Degraded);
    }
}
