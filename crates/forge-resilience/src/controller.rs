//! Per-channel connection state machine.
//!
//! ```text
//! Connecting ──ok──▶ Live ──lost──▶ Degraded ──retry──▶ Connecting ──ok──▶ Reconciling ──payload──▶ Live
//!      │                                ▲                    │
//!      └────────────fail────────────────┴────────fail────────┘
//! ```
//!
//! Everything runs on one task, so a phase change and the sample that goes
//! with it are always published as a single state update.

use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use forge_core::config::ResilienceConfig;
use forge_core::Channel;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::retry::RetryPolicy;
use crate::state::{ChannelState, ControllerEvent, Phase, Provenance, Sample};
use crate::synthetic::SyntheticGenerator;
use crate::transport::Transport;

/// Room for events not yet read by a slow subscriber.
const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub retry: RetryPolicy,
    pub connect_timeout: Duration,
    /// Period of synthetic samples while the channel is not live.
    pub synthetic_interval: Duration,
    pub event_capacity: usize,
    /// Seed for backoff jitter.
    pub seed: u64,
}

impl ControllerOptions {
    pub fn from_config(config: &ResilienceConfig) -> Self {
        Self {
            retry: RetryPolicy::from_config(config),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            synthetic_interval: Duration::from_millis(config.synthetic_interval_ms),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            seed: rand::random(),
        }
    }
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self::from_config(&ResilienceConfig::default())
    }
}

enum Command {
    ConnectivityRestored,
    Hold(bool),
}

/// What the current phase asks the run loop to do next.
enum Next {
    Stay,
    /// Start a reconnect attempt.
    Connect,
    /// The transport is up.
    Up,
    Down(TransportError),
    Hold,
    Close,
}

/// A not-yet-started controller for one channel.
pub struct ResilienceController {
    channel: Channel,
    transport: Box<dyn Transport>,
    generator: Box<dyn SyntheticGenerator>,
    options: ControllerOptions,
    events: broadcast::Sender<ControllerEvent>,
    state: watch::Sender<ChannelState>,
}

impl ResilienceController {
    pub fn new(
        channel: Channel,
        transport: impl Transport + 'static,
        generator: Box<dyn SyntheticGenerator>,
        options: ControllerOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(options.event_capacity.max(1));
        let (state, _) = watch::channel(ChannelState::initial(channel));
        Self {
            channel,
            transport: Box::new(transport),
            generator,
            options,
            events,
            state,
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Every transition and sample, in emission order. Subscribe before
    /// [`spawn`](Self::spawn) to see the first transition.
    pub fn events(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    pub fn spawn(self) -> ControllerHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let handle_state = self.state.subscribe();
        let handle_events = self.events.clone();
        let channel = self.channel;

        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let ResilienceController {
                channel,
                transport,
                generator,
                options,
                events,
                state,
            } = self;
            let core = Core::new(channel, generator, options, events, state);
            core.run(transport, commands_rx, token).await;
        });

        ControllerHandle {
            channel,
            state: handle_state,
            events: handle_events,
            commands: commands_tx,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }
}

/// Control surface of a running controller.
pub struct ControllerHandle {
    channel: Channel,
    state: watch::Receiver<ChannelState>,
    events: broadcast::Sender<ControllerEvent>,
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ControllerHandle {
    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn state(&self) -> ChannelState {
        self.state.borrow().clone()
    }

    pub fn phase(&self) -> Phase {
        self.state.borrow().phase
    }

    /// A state receiver whose first `changed()` resolves immediately with the
    /// current state.
    pub fn subscribe(&self) -> watch::Receiver<ChannelState> {
        let mut rx = self.state.clone();
        rx.mark_changed();
        rx
    }

    /// Events emitted from now on.
    pub fn events(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    /// External hint that the network is back. Starts a reconnect attempt
    /// right away when the channel is degraded, including after the retry
    /// budget ran out.
    pub fn connectivity_restored(&self) {
        let _ = self.commands.send(Command::ConnectivityRestored);
    }

    /// Force synthetic data on or off. While held the transport stays down
    /// and no reconnect is attempted.
    pub fn hold_synthetic(&self, hold: bool) {
        let _ = self.commands.send(Command::Hold(hold));
    }

    /// Stop the controller. Returns once the task has exited; nothing is
    /// emitted after the final `Closed` transition.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().expect("controller task lock poisoned").take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(channel = %self.channel, error = %e, "controller task failed");
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled() && self.phase() == Phase::Closed
    }
}

struct Core {
    channel: Channel,
    phase: Phase,
    /// Reconnect attempts since the channel was last live.
    retry_count: u32,
    synthetic_active: bool,
    held: bool,
    /// A reconnect started from Degraded is pending.
    recovering: bool,
    retry_at: Option<Instant>,
    seq: u64,
    last_observed: Option<DateTime<Utc>>,
    generator: Box<dyn SyntheticGenerator>,
    retry: RetryPolicy,
    connect_timeout: Duration,
    rng: StdRng,
    ticker: Interval,
    events: broadcast::Sender<ControllerEvent>,
    state: watch::Sender<ChannelState>,
}

impl Core {
    fn new(
        channel: Channel,
        generator: Box<dyn SyntheticGenerator>,
        options: ControllerOptions,
        events: broadcast::Sender<ControllerEvent>,
        state: watch::Sender<ChannelState>,
    ) -> Self {
        let mut ticker = interval(options.synthetic_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self {
            channel,
            phase: Phase::Connecting,
            retry_count: 0,
            synthetic_active: false,
            held: false,
            recovering: false,
            retry_at: None,
            seq: 0,
            last_observed: None,
            generator,
            retry: options.retry,
            connect_timeout: options.connect_timeout,
            rng: StdRng::seed_from_u64(options.seed),
            ticker,
            events,
            state,
        }
    }

    async fn run(
        mut self,
        mut transport: Box<dyn Transport>,
        mut commands: mpsc::UnboundedReceiver<Command>,
        cancel: CancellationToken,
    ) {
        info!(channel = %self.channel, "controller started");
        loop {
            let next = match self.phase {
                Phase::Connecting => {
                    self.connecting(transport.as_mut(), &mut commands, &cancel)
                        .await
                }
                Phase::Live | Phase::Reconciling => {
                    self.streaming(transport.as_mut(), &mut commands, &cancel)
                        .await
                }
                Phase::Degraded => self.degraded(&mut commands, &cancel).await,
                Phase::Closed => break,
            };

            match next {
                Next::Stay => {}
                Next::Connect => {
                    self.retry_count += 1;
                    self.recovering = true;
                    self.retry_at = None;
                    self.transition(Phase::Connecting, None);
                }
                Next::Up if self.recovering => self.transition(Phase::Reconciling, None),
                Next::Up => {
                    self.retry_count = 0;
                    self.transition(Phase::Live, None);
                }
                Next::Down(e) => {
                    transport.disconnect().await;
                    self.enter_degraded(&e);
                }
                Next::Hold => {
                    transport.disconnect().await;
                    self.enter_degraded(&"synthetic hold");
                }
                Next::Close => {
                    transport.disconnect().await;
                    self.transition(Phase::Closed, None);
                }
            }
        }
        info!(channel = %self.channel, samples = self.seq, "controller stopped");
    }

    async fn connecting(
        &mut self,
        transport: &mut dyn Transport,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        cancel: &CancellationToken,
    ) -> Next {
        let timeout_ms = self.connect_timeout.as_millis() as u64;
        let connect = tokio::time::timeout(self.connect_timeout, transport.connect());
        tokio::pin!(connect);

        // Synthetic output keeps ticking while a reconnect is in flight.
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Next::Close,
                Some(cmd) = commands.recv() => {
                    if let Some(next) = self.command(cmd) {
                        return next;
                    }
                }
                _ = self.ticker.tick(), if self.synthetic_active => self.emit_synthetic(),
                result = &mut connect => {
                    return match result {
                        Ok(Ok(())) => Next::Up,
                        Ok(Err(e)) => Next::Down(e),
                        Err(_) => Next::Down(TransportError::Timeout { ms: timeout_ms }),
                    };
                }
            }
        }
    }

    async fn streaming(
        &mut self,
        transport: &mut dyn Transport,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        cancel: &CancellationToken,
    ) -> Next {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Next::Close,
            Some(cmd) = commands.recv() => self.command(cmd).unwrap_or(Next::Stay),
            _ = self.ticker.tick(), if self.synthetic_active => {
                self.emit_synthetic();
                Next::Stay
            }
            result = transport.recv() => match result {
                Ok(data) => {
                    if self.phase == Phase::Reconciling {
                        self.go_live(data);
                    } else {
                        let sample = self.sample(Provenance::Authentic, data);
                        self.publish(sample);
                    }
                    Next::Stay
                }
                Err(e) => Next::Down(e),
            },
        }
    }

    async fn degraded(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        cancel: &CancellationToken,
    ) -> Next {
        let retry_at = self.retry_at;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Next::Close,
            Some(cmd) = commands.recv() => self.command(cmd).unwrap_or(Next::Stay),
            _ = self.ticker.tick() => {
                self.emit_synthetic();
                Next::Stay
            }
            _ = sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => Next::Connect,
        }
    }

    fn command(&mut self, cmd: Command) -> Option<Next> {
        match cmd {
            Command::ConnectivityRestored => {
                if self.phase == Phase::Degraded && !self.held {
                    info!(channel = %self.channel, attempts = self.retry_count, "connectivity restored, reconnecting");
                    return Some(Next::Connect);
                }
                debug!(channel = %self.channel, phase = %self.phase, "connectivity signal ignored");
                None
            }
            Command::Hold(true) if !self.held => {
                self.held = true;
                self.retry_at = None;
                self.state.send_modify(|s| s.held = true);
                info!(channel = %self.channel, "synthetic hold on");
                match self.phase {
                    Phase::Degraded | Phase::Closed => None,
                    _ => Some(Next::Hold),
                }
            }
            Command::Hold(false) if self.held => {
                self.held = false;
                self.state.send_modify(|s| s.held = false);
                info!(channel = %self.channel, "synthetic hold off");
                if self.phase == Phase::Degraded {
                    self.retry_count = 0;
                    return Some(Next::Connect);
                }
                None
            }
            Command::Hold(_) => None,
        }
    }

    fn enter_degraded(&mut self, cause: &dyn fmt::Display) {
        warn!(channel = %self.channel, cause = %cause, attempts = self.retry_count, "channel degraded, serving synthetic data");
        let first = !self.synthetic_active;
        self.synthetic_active = true;
        let sample = if first {
            self.ticker.reset();
            Some(self.synthetic_sample())
        } else {
            None
        };
        self.transition(Phase::Degraded, sample);
        self.schedule_retry();
    }

    fn schedule_retry(&mut self) {
        if self.held {
            self.retry_at = None;
        } else if self.retry.exhausted(self.retry_count) {
            self.retry_at = None;
            warn!(
                channel = %self.channel,
                attempts = self.retry_count,
                "retry budget exhausted, waiting for connectivity signal"
            );
        } else {
            let delay = self.retry.delay(self.retry_count, &mut self.rng);
            debug!(channel = %self.channel, attempt = self.retry_count + 1, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
            self.retry_at = Some(Instant::now() + delay);
        }
    }

    /// Reconciling → Live together with the first authentic payload.
    fn go_live(&mut self, data: Value) {
        self.synthetic_active = false;
        self.recovering = false;
        self.retry_count = 0;
        let sample = self.sample(Provenance::Authentic, data);
        self.transition(Phase::Live, Some(sample));
    }

    fn transition(&mut self, to: Phase, sample: Option<Sample>) {
        let from = self.phase;
        self.phase = to;
        let at = Utc::now();
        let (retry_count, synthetic_active, held) =
            (self.retry_count, self.synthetic_active, self.held);
        self.state.send_modify(|s| {
            s.phase = to;
            s.retry_count = retry_count;
            s.last_transition = at;
            s.synthetic_active = synthetic_active;
            s.held = held;
            if let Some(sample) = &sample {
                s.latest = Some(sample.clone());
            }
        });

        info!(channel = %self.channel, %from, %to, retry_count, "phase transition");
        let _ = self.events.send(ControllerEvent::Transition {
            channel: self.channel,
            from,
            to,
            at,
            retry_count,
        });
        if let Some(sample) = sample {
            let _ = self.events.send(ControllerEvent::Sample(sample));
        }
    }

    fn emit_synthetic(&mut self) {
        let sample = self.synthetic_sample();
        self.publish(sample);
    }

    fn publish(&mut self, sample: Sample) {
        self.state.send_modify(|s| s.latest = Some(sample.clone()));
        let _ = self.events.send(ControllerEvent::Sample(sample));
    }

    fn synthetic_sample(&mut self) -> Sample {
        let at = self.stamp();
        let data = self.generator.generate(at);
        self.build(Provenance::Synthetic, at, data)
    }

    fn sample(&mut self, provenance: Provenance, data: Value) -> Sample {
        let at = self.stamp();
        self.build(provenance, at, data)
    }

    fn build(&mut self, provenance: Provenance, observed_at: DateTime<Utc>, data: Value) -> Sample {
        self.seq += 1;
        Sample {
            channel: self.channel,
            seq: self.seq,
            provenance,
            observed_at,
            data,
        }
    }

    /// Wall-clock time, bumped past the previous sample when the clock has
    /// not moved or went backwards.
    fn stamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let at = match self.last_observed {
            Some(last) if now <= last => last + chrono::Duration::milliseconds(1),
            _ => now,
        };
        self.last_observed = Some(at);
        at
    }
}
