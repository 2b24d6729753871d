//! Channel fan-out.
//!
//! Membership always comes from the registry. The gateway only keeps the
//! per-connection outbox handles it needs to reach a socket, and a connection
//! without an open registry record is never sent to.

mod poll;

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::json;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use forge_core::config::CadenceConfig;
use forge_core::{Channel, ConnectionId};
use forge_pipeline::{Batch, BatchPipeline};
use forge_protocol::{events, CadenceBounds, ClientMessage, ClientRequest, Envelope, IntervalAck};
use forge_registry::{ConnectionRecord, ConnectionRegistry};

use crate::error::GatewayError;
use crate::policy::{AllowAll, SubscribePolicy};
use crate::producer::SnapshotProducer;

/// Bounded queue of serialized frames for one connection. A full or closed
/// outbox counts as a send failure.
pub type Outbox = mpsc::Sender<String>;

/// Result of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOut {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct GatewayOptions {
    pub cadence: CadenceBounds,
    /// Channel-wide poll period.
    pub default_cadence: Duration,
    pub policy: Arc<dyn SubscribePolicy>,
}

impl GatewayOptions {
    pub fn from_config(config: &CadenceConfig) -> Self {
        Self {
            cadence: CadenceBounds::new(config.min_ms, config.max_ms),
            default_cadence: Duration::from_millis(config.default_ms),
            policy: Arc::new(AllowAll),
        }
    }

    pub fn with_policy(mut self, policy: impl SubscribePolicy + 'static) -> Self {
        self.policy = Arc::new(policy);
        self
    }
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self::from_config(&CadenceConfig::default())
    }
}

/// A per-connection poll timer. Only the task started with `generation` may
/// deliver; replacing or cancelling the override bumps it out.
struct CadenceOverride {
    channel: Channel,
    cadence: Duration,
    generation: u64,
    cancel: CancellationToken,
}

/// The channel-wide timer of a poll-driven channel, guarded the same way.
struct ChannelPoller {
    cadence: Duration,
    generation: u64,
    cancel: CancellationToken,
}

pub struct BroadcastGateway {
    registry: Arc<ConnectionRegistry>,
    options: GatewayOptions,
    outboxes: DashMap<ConnectionId, Outbox>,
    /// Last envelope broadcast per channel, replayed to late subscribers.
    last_values: DashMap<Channel, Envelope>,
    producers: DashMap<Channel, Arc<dyn SnapshotProducer>>,
    /// Held while a fan-out picks its targets and while a connection is
    /// admitted. Lock order: `admission`, then `overrides`, then the
    /// registry's own lock.
    admission: Mutex<()>,
    overrides: Mutex<HashMap<ConnectionId, CadenceOverride>>,
    pollers: Mutex<HashMap<Channel, ChannelPoller>>,
    next_generation: AtomicU64,
    polls_run: AtomicU64,
    polls_skipped: AtomicU64,
    shutdown: CancellationToken,
}

impl BroadcastGateway {
    pub fn new(registry: Arc<ConnectionRegistry>, options: GatewayOptions) -> Arc<Self> {
        Arc::new(Self {
            registry,
            options,
            outboxes: DashMap::new(),
            last_values: DashMap::new(),
            producers: DashMap::new(),
            admission: Mutex::new(()),
            overrides: Mutex::new(HashMap::new()),
            pollers: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
            polls_run: AtomicU64::new(0),
            polls_skipped: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn options(&self) -> &GatewayOptions {
        &self.options
    }

    fn lock_overrides(&self) -> MutexGuard<'_, HashMap<ConnectionId, CadenceOverride>> {
        self.overrides.lock().expect("cadence override lock poisoned")
    }

    fn lock_pollers(&self) -> MutexGuard<'_, HashMap<Channel, ChannelPoller>> {
        self.pollers.lock().expect("poller lock poisoned")
    }

    fn lock_admission(&self) -> MutexGuard<'_, ()> {
        self.admission.lock().expect("admission lock poisoned")
    }

    /// Admit a connection to a channel's broadcast set.
    ///
    /// The channel's last envelope, if any, is queued on the outbox before the
    /// connection becomes visible to fan-out, so it always arrives first. Every
    /// later envelope reaches the connection through fan-out.
    pub fn admit(
        &self,
        id: ConnectionId,
        channel: Channel,
        remote_address: impl Into<String>,
        user_agent: impl Into<String>,
        outbox: Outbox,
    ) -> Result<ConnectionRecord, GatewayError> {
        if !self.options.policy.can_subscribe(&id, channel) {
            warn!(conn_id = %id, channel = %channel, "subscription refused by policy");
            return Err(GatewayError::Unauthorized { id, channel });
        }
        if self.registry.is_active(&id) {
            return Err(forge_registry::RegistryError::DuplicateId { id }.into());
        }

        let (replay, replayed, record) = {
            let _admission = self.lock_admission();
            let replay = self.last_values.get(&channel).map(|e| e.value().clone());
            let replayed = match &replay {
                Some(envelope) => outbox.try_send(envelope.to_json()).is_ok(),
                None => false,
            };

            self.outboxes.insert(id.clone(), outbox);
            match self
                .registry
                .register(id.clone(), channel, remote_address, user_agent)
            {
                Ok(record) => (replay, replayed, record),
                Err(e) => {
                    self.outboxes.remove(&id);
                    return Err(e.into());
                }
            }
        };

        if let (true, Some(envelope)) = (replayed, replay) {
            let _ = self.registry.record_sent(&id, &envelope.event);
            debug!(conn_id = %id, channel = %channel, "replayed last value");
        }
        Ok(record)
    }

    /// Remove a connection: cancel its cadence override, drop its outbox and
    /// close the registry record. Returns `true` if this call closed it.
    pub fn release(&self, id: &ConnectionId, reason: &str) -> bool {
        let closed = {
            let mut overrides = self.lock_overrides();
            if let Some(o) = overrides.remove(id) {
                o.cancel.cancel();
            }
            self.registry.close(id, reason)
        };
        self.outboxes.remove(id);
        closed
    }

    /// Best-effort fan-out to every open connection on `channel`.
    pub fn publish(&self, channel: Channel, envelope: Envelope) -> FanOut {
        let targets = self.stage(channel, &envelope);
        self.deliver_all(&targets, &envelope)
    }

    /// Make `envelope` the channel's last value and take the open connections
    /// it must be fanned out to. A concurrent admission either lands in the
    /// targets or replays `envelope`, never neither.
    fn stage(&self, channel: Channel, envelope: &Envelope) -> Vec<ConnectionId> {
        let _admission = self.lock_admission();
        let targets = self.registry.active_ids(channel);
        self.last_values.insert(channel, envelope.clone());
        targets
    }

    /// Send one envelope to one connection.
    pub fn send_to(&self, id: &ConnectionId, envelope: &Envelope) -> Result<(), GatewayError> {
        self.deliver(id, &envelope.to_json(), &envelope.event)
            .inspect_err(|e| self.fail(id, e))
    }

    fn deliver_all(&self, targets: &[ConnectionId], envelope: &Envelope) -> FanOut {
        let mut fan_out = FanOut::default();
        if targets.is_empty() {
            return fan_out;
        }
        let text = envelope.to_json();
        for id in targets {
            match self.deliver(id, &text, &envelope.event) {
                Ok(()) => fan_out.delivered += 1,
                Err(e) => {
                    fan_out.failed += 1;
                    self.fail(id, &e);
                }
            }
        }
        debug!(
            event = %envelope.event,
            delivered = fan_out.delivered,
            failed = fan_out.failed,
            "fan-out complete"
        );
        fan_out
    }

    fn deliver(&self, id: &ConnectionId, text: &str, event: &str) -> Result<(), GatewayError> {
        let Some(outbox) = self.outboxes.get(id).map(|e| e.value().clone()) else {
            return Err(GatewayError::SendFailure {
                id: id.clone(),
                reason: "no outbox".to_string(),
            });
        };
        outbox.try_send(text.to_string()).map_err(|e| {
            let reason = match e {
                TrySendError::Full(_) => "outbox full",
                TrySendError::Closed(_) => "outbox closed",
            };
            GatewayError::SendFailure {
                id: id.clone(),
                reason: reason.to_string(),
            }
        })?;
        // A close racing this send is not a send failure.
        let _ = self.registry.record_sent(id, event);
        Ok(())
    }

    fn fail(&self, id: &ConnectionId, error: &GatewayError) {
        if !matches!(error, GatewayError::SendFailure { .. }) {
            return;
        }
        // Already released by a concurrent close.
        if !self.registry.is_active(id) {
            debug!(conn_id = %id, "send to released connection dropped");
            return;
        }
        warn!(conn_id = %id, error = %error, "send failed, closing connection");
        self.registry.record_error(Some(id), error.to_string());
        self.release(id, "send-failure");
    }

    /// Event-driven mode: publish every batch from `pipeline` on `channel`.
    pub fn attach_pipeline(self: &Arc<Self>, pipeline: &BatchPipeline, channel: Channel) {
        let gateway: Weak<Self> = Arc::downgrade(self);
        pipeline.on_batch(move |batch: &Arc<Batch>| {
            if let Some(gateway) = gateway.upgrade() {
                gateway.publish_batch(channel, batch);
            }
        });
        info!(channel = %channel, "pipeline attached");
    }

    pub fn publish_batch(&self, channel: Channel, batch: &Batch) -> FanOut {
        let envelope = Envelope::success(
            channel.event_name(),
            json!({
                "seq": batch.seq,
                "reason": batch.reason,
                "events": batch.events(),
            }),
        );
        self.publish(channel, envelope)
    }

    /// Parse and answer one inbound text frame from `id`.
    ///
    /// Only an inactive connection is an error; malformed or unknown frames
    /// are answered with an error envelope.
    pub fn handle_client_message(
        self: &Arc<Self>,
        id: &ConnectionId,
        text: &str,
    ) -> Result<(), GatewayError> {
        let msg = match ClientMessage::parse(text) {
            Ok(msg) => msg,
            Err(e) => {
                if !self.registry.is_active(id) {
                    return Err(GatewayError::UnknownConnection { id: id.clone() });
                }
                self.registry
                    .record_error(Some(id), format!("malformed frame: {e}"));
                let reply = Envelope::error(
                    events::ERROR,
                    json!({ "code": "BAD_FRAME", "message": e.to_string() }),
                );
                return self.send_to(id, &reply);
            }
        };

        self.registry
            .record_received(id, &msg.event, msg.data.clone())
            .map_err(|_| GatewayError::UnknownConnection { id: id.clone() })?;

        let reply = match msg.request() {
            ClientRequest::SetInterval(requested) => {
                let outcome = match requested {
                    Some(ms) => self.set_cadence(id, ms),
                    None => Err(GatewayError::InvalidCadence { requested: -1 }),
                };
                match outcome {
                    Ok(cadence) => Envelope::success(
                        events::INTERVAL_SET,
                        IntervalAck::accepted(cadence.as_millis() as u64),
                    ),
                    Err(
                        e @ (GatewayError::InvalidCadence { .. }
                        | GatewayError::NotPollDriven { .. }),
                    ) => {
                        debug!(conn_id = %id, error = %e, "cadence request rejected");
                        Envelope::error(events::INTERVAL_SET, IntervalAck::rejected())
                    }
                    Err(e) => return Err(e),
                }
            }
            ClientRequest::RequestSnapshot => self.snapshot_for(id)?,
            ClientRequest::Ping => Envelope::success(
                events::PONG,
                json!({ "timestamp": chrono::Utc::now().to_rfc3339() }),
            ),
            ClientRequest::Unknown(event) => Envelope::error(
                events::ERROR,
                json!({ "code": "UNKNOWN_EVENT", "event": event }),
            ),
        };
        self.send_to(id, &reply)
    }

    /// Current value of the connection's channel: a fresh snapshot for
    /// poll-driven channels, otherwise the last broadcast.
    fn snapshot_for(&self, id: &ConnectionId) -> Result<Envelope, GatewayError> {
        let channel = self.channel_of(id)?;
        if let Some(producer) = self.producer(channel) {
            return Ok(Envelope::success(channel.event_name(), producer.snapshot()));
        }
        Ok(match self.last_values.get(&channel) {
            Some(last) => last.value().clone(),
            None => Envelope::error(
                channel.event_name(),
                json!({ "code": "NO_SNAPSHOT", "message": "Nothing broadcast yet" }),
            ),
        })
    }

    fn channel_of(&self, id: &ConnectionId) -> Result<Channel, GatewayError> {
        self.registry
            .get(id)
            .filter(|r| r.is_active())
            .map(|r| r.channel)
            .ok_or_else(|| GatewayError::UnknownConnection { id: id.clone() })
    }

    fn producer(&self, channel: Channel) -> Option<Arc<dyn SnapshotProducer>> {
        self.producers.get(&channel).map(|p| Arc::clone(p.value()))
    }

    /// Stop every poller and override timer. Open connections are left to
    /// their socket tasks.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        for (_, o) in self.lock_overrides().drain() {
            o.cancel.cancel();
        }
        for (_, p) in self.lock_pollers().drain() {
            p.cancel.cancel();
        }
        info!("broadcast gateway stopped");
    }

    /// Release every open connection with `reason`.
    pub fn release_all(&self, reason: &str) -> usize {
        self.registry
            .list_active(None)
            .iter()
            .filter(|r| self.release(&r.id, reason))
            .count()
    }
}
