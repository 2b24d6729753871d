//! Event Batching Pipeline.
//!
//! Domain events are coalesced into [`Batch`]es that flush when either the
//! time window since the first buffered event elapses or the buffer reaches
//! its size limit, whichever comes first. Consumers registered with
//! [`BatchPipeline::on_batch`] all see the same immutable batch.

pub mod batch;
pub mod error;
pub mod filter;
pub mod layer;
pub mod pipeline;
pub mod store;

pub use batch::{Batch, BatchBuffer, FlushReason};
pub use error::PipelineError;
pub use filter::{EventFilter, SourceFilter};
pub use layer::PipelineLayer;
pub use pipeline::{Admission, BatchConsumer, BatchPipeline, PipelineStats};
pub use store::{EventStore, LogQuery, MemoryEventStore, PersistBatches};
