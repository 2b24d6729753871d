//! Poll-driven broadcasting and per-connection cadence overrides.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use forge_core::{Channel, ConnectionId};
use forge_protocol::Envelope;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{BroadcastGateway, CadenceOverride, ChannelPoller, FanOut};
use crate::error::GatewayError;
use crate::producer::SnapshotProducer;

impl BroadcastGateway {
    /// Make `channel` poll-driven with `producer` as its snapshot source.
    pub fn register_poller(&self, channel: Channel, producer: impl SnapshotProducer + 'static) {
        self.producers.insert(channel, Arc::new(producer));
        debug!(channel = %channel, "poller registered");
    }

    /// Start one timer per poll-driven channel at its channel-wide cadence.
    /// The timers stop on [`BroadcastGateway::shutdown`].
    pub fn spawn_pollers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let channels: Vec<Channel> = self.producers.iter().map(|e| *e.key()).collect();
        channels
            .into_iter()
            .map(|channel| self.start_poller(channel, self.channel_cadence(channel)))
            .collect()
    }

    /// Change how often `channel` is polled for connections without an
    /// override.
    ///
    /// Out-of-range requests are rejected and the channel keeps its cadence.
    /// An accepted request restarts the channel's timer.
    pub fn set_channel_cadence(
        self: &Arc<Self>,
        channel: Channel,
        requested: i64,
    ) -> Result<Duration, GatewayError> {
        let Some(cadence) = self.options.cadence.validate(requested) else {
            warn!(channel = %channel, requested, "channel cadence out of range");
            return Err(GatewayError::InvalidCadence { requested });
        };
        if !self.producers.contains_key(&channel) {
            return Err(GatewayError::NotPollDriven { channel });
        }
        drop(self.start_poller(channel, cadence));
        Ok(cadence)
    }

    /// The channel-wide cadence of `channel`.
    pub fn channel_cadence(&self, channel: Channel) -> Duration {
        self.lock_pollers()
            .get(&channel)
            .map(|p| p.cadence)
            .unwrap_or(self.options.default_cadence)
    }

    fn start_poller(self: &Arc<Self>, channel: Channel, period: Duration) -> JoinHandle<()> {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let stop = self.shutdown.child_token();
        let previous = self.lock_pollers().insert(
            channel,
            ChannelPoller {
                cadence: period,
                generation,
                cancel: stop.clone(),
            },
        );
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }

        let gateway = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = interval_at(Instant::now() + period, period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(channel = %channel, period_ms = period.as_millis() as u64, "poller started");
            loop {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    _ = tick.tick() => {
                        if !gateway.is_current_poller(channel, generation) {
                            break;
                        }
                        gateway.poll_once(channel);
                    }
                }
            }
            debug!(channel = %channel, generation, "poller stopped");
        })
    }

    fn is_current_poller(&self, channel: Channel, generation: u64) -> bool {
        self.lock_pollers()
            .get(&channel)
            .is_some_and(|p| p.generation == generation)
    }

    /// One channel-wide poll tick.
    ///
    /// Returns `None` without calling the producer when no connection on the
    /// channel is waiting for the channel-wide cadence.
    pub fn poll_once(&self, channel: Channel) -> Option<FanOut> {
        let producer = self.producer(channel)?;
        let overridden: HashSet<ConnectionId> = self.lock_overrides().keys().cloned().collect();
        let waiting = self
            .registry
            .active_ids(channel)
            .iter()
            .any(|id| !overridden.contains(id));
        if !waiting {
            self.polls_skipped.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        self.polls_run.fetch_add(1, Ordering::Relaxed);
        let envelope = Envelope::success(channel.event_name(), producer.snapshot());
        let targets: Vec<ConnectionId> = self
            .stage(channel, &envelope)
            .into_iter()
            .filter(|id| !overridden.contains(id))
            .collect();
        Some(self.deliver_all(&targets, &envelope))
    }

    /// `(run, skipped)` channel-wide poll ticks so far.
    pub fn poll_stats(&self) -> (u64, u64) {
        (
            self.polls_run.load(Ordering::Relaxed),
            self.polls_skipped.load(Ordering::Relaxed),
        )
    }

    /// Give one connection its own poll cadence.
    ///
    /// Out-of-range requests are rejected and whatever cadence the connection
    /// had stays in effect. An accepted request replaces any earlier override
    /// and restarts the connection's timer.
    pub fn set_cadence(
        self: &Arc<Self>,
        id: &ConnectionId,
        requested: i64,
    ) -> Result<Duration, GatewayError> {
        let channel = self.channel_of(id)?;
        let Some(cadence) = self.options.cadence.validate(requested) else {
            warn!(conn_id = %id, requested, "cadence out of range");
            return Err(GatewayError::InvalidCadence { requested });
        };
        if !self.producers.contains_key(&channel) {
            return Err(GatewayError::NotPollDriven { channel });
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = self.shutdown.child_token();
        {
            let mut overrides = self.lock_overrides();
            // Re-check under the lock so a concurrent release cannot leave a
            // timer running for a closed connection.
            if !self.registry.is_active(id) {
                return Err(GatewayError::UnknownConnection { id: id.clone() });
            }
            let previous = overrides.insert(
                id.clone(),
                CadenceOverride {
                    channel,
                    cadence,
                    generation,
                    cancel: cancel.clone(),
                },
            );
            if let Some(previous) = previous {
                previous.cancel.cancel();
            }
        }

        info!(conn_id = %id, cadence_ms = cadence.as_millis() as u64, "cadence override set");
        let gateway = Arc::clone(self);
        let id = id.clone();
        tokio::spawn(async move {
            let mut tick = interval_at(Instant::now() + cadence, cadence);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        if !gateway.poll_override(&id, generation) {
                            break;
                        }
                    }
                }
            }
            debug!(conn_id = %id, generation, "cadence override stopped");
        });

        Ok(cadence)
    }

    /// The cadence currently in effect for a connection.
    pub fn cadence_of(&self, id: &ConnectionId) -> Option<Duration> {
        let channel = self.channel_of(id).ok()?;
        let overridden = self.lock_overrides().get(id).map(|o| o.cadence);
        Some(overridden.unwrap_or_else(|| self.channel_cadence(channel)))
    }

    /// One tick of an override timer. Returns `false` once the timer is stale.
    fn poll_override(&self, id: &ConnectionId, generation: u64) -> bool {
        let result = {
            let overrides = self.lock_overrides();
            let Some(current) = overrides.get(id) else {
                return false;
            };
            if current.generation != generation {
                return false;
            }
            let Some(producer) = self.producer(current.channel) else {
                return false;
            };
            let envelope = Envelope::success(current.channel.event_name(), producer.snapshot());
            // Delivered under the lock: a cancelled override can never send.
            self.deliver(id, &envelope.to_json(), &envelope.event)
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                self.fail(id, &e);
                false
            }
        }
    }

    /// Token cancelled when the gateway shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}
