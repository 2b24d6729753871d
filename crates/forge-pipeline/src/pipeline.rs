use std::future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

use forge_core::config::BatchConfig;
use forge_core::DomainEvent;

use crate::batch::{Batch, BatchBuffer, FlushReason};
use crate::error::PipelineError;
use crate::filter::EventFilter;

/// Receives every flushed batch, in flush order.
///
/// Called on the pipeline task; implementations must not block.
pub trait BatchConsumer: Send + Sync {
    fn on_batch(&self, batch: &Arc<Batch>);
}

impl<F> BatchConsumer for F
where
    F: Fn(&Arc<Batch>) + Send + Sync,
{
    fn on_batch(&self, batch: &Arc<Batch>) {
        self(batch)
    }
}

/// Outcome of a successful `submit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    /// Dropped by the event filter.
    Filtered,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub submitted: u64,
    pub filtered: u64,
    pub rejected: u64,
    pub batches: u64,
    pub events_flushed: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    filtered: AtomicU64,
    rejected: AtomicU64,
    batches: AtomicU64,
    events_flushed: AtomicU64,
}

enum Command {
    Submit(DomainEvent),
    Flush,
    Shutdown,
}

struct Shared {
    tx: mpsc::UnboundedSender<Command>,
    filter: Arc<dyn EventFilter>,
    consumers: RwLock<Vec<Arc<dyn BatchConsumer>>>,
    closed: AtomicBool,
    counters: Counters,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a running batching pipeline. Cheap to clone.
#[derive(Clone)]
pub struct BatchPipeline {
    shared: Arc<Shared>,
}

impl BatchPipeline {
    /// Start the pipeline task on the current tokio runtime.
    pub fn spawn(config: BatchConfig, filter: Arc<dyn EventFilter>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            tx,
            filter,
            consumers: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
            counters: Counters::default(),
            worker: Mutex::new(None),
        });

        let buffer = BatchBuffer::from_config(&config);
        let handle = tokio::spawn(run(Arc::clone(&shared), buffer, rx));
        *shared.worker.lock().expect("pipeline worker lock poisoned") = Some(handle);

        info!(
            flush_window_ms = config.flush_window_ms,
            max_batch_size = config.max_batch_size,
            "batch pipeline started"
        );
        Self { shared }
    }

    /// Queue an event. Never blocks.
    pub fn submit(&self, event: DomainEvent) -> Result<Admission, PipelineError> {
        let counters = &self.shared.counters;
        if self.shared.closed.load(Ordering::Acquire) {
            counters.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(PipelineError::ShutDown);
        }
        if !self.shared.filter.accept(&event) {
            counters.filtered.fetch_add(1, Ordering::Relaxed);
            return Ok(Admission::Filtered);
        }
        if self.shared.tx.send(Command::Submit(event)).is_err() {
            counters.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(PipelineError::ShutDown);
        }
        counters.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(Admission::Accepted)
    }

    /// Register a consumer for every batch flushed from now on.
    pub fn on_batch(&self, consumer: impl BatchConsumer + 'static) {
        self.shared
            .consumers
            .write()
            .expect("pipeline consumers lock poisoned")
            .push(Arc::new(consumer));
    }

    /// Emit whatever is buffered without waiting for the window.
    pub fn flush(&self) {
        let _ = self.shared.tx.send(Command::Flush);
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Stop accepting events, emit the remaining buffer as a final batch and
    /// wait for the task to finish. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.shared.closed.store(true, Ordering::Release);
        let _ = self.shared.tx.send(Command::Shutdown);

        let handle = self
            .shared
            .worker
            .lock()
            .expect("pipeline worker lock poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
            info!("batch pipeline stopped");
        }
    }

    pub fn stats(&self) -> PipelineStats {
        let c = &self.shared.counters;
        PipelineStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            filtered: c.filtered.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            batches: c.batches.load(Ordering::Relaxed),
            events_flushed: c.events_flushed.load(Ordering::Relaxed),
        }
    }
}

async fn run(shared: Arc<Shared>, mut buffer: BatchBuffer, mut rx: mpsc::UnboundedReceiver<Command>) {
    loop {
        let deadline = buffer.deadline();
        let window = async {
            match deadline {
                Some(at) => sleep_until(at).await,
                None => future::pending::<()>().await,
            }
        };

        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(Command::Submit(event)) => {
                    if let Some(batch) = buffer.push(event, Instant::now()) {
                        emit(&shared, batch);
                    }
                }
                Some(Command::Flush) => {
                    if let Some(batch) = buffer.take(FlushReason::Manual) {
                        emit(&shared, batch);
                    }
                }
                Some(Command::Shutdown) | None => {
                    // Late submits now fail with `ShutDown`; everything already
                    // queued belongs in the drain.
                    rx.close();
                    while let Ok(cmd) = rx.try_recv() {
                        if let Command::Submit(event) = cmd {
                            if let Some(batch) = buffer.push(event, Instant::now()) {
                                emit(&shared, batch);
                            }
                        }
                    }
                    if let Some(batch) = buffer.take(FlushReason::Drain) {
                        emit(&shared, batch);
                    }
                    break;
                }
            },
            _ = window => {
                if let Some(batch) = buffer.take_if_due(Instant::now()) {
                    emit(&shared, batch);
                }
            }
        }
    }
}

fn emit(shared: &Shared, batch: Batch) {
    let batch = Arc::new(batch);
    shared.counters.batches.fetch_add(1, Ordering::Relaxed);
    shared
        .counters
        .events_flushed
        .fetch_add(batch.len() as u64, Ordering::Relaxed);
    debug!(seq = batch.seq, size = batch.len(), reason = ?batch.reason, "batch flushed");

    // Snapshot the list so a consumer registering another consumer cannot deadlock.
    let consumers: Vec<_> = shared
        .consumers
        .read()
        .expect("pipeline consumers lock poisoned")
        .clone();
    for consumer in consumers {
        consumer.on_batch(&batch);
    }
}
