//! Connection Registry: the single source of truth for which duplex
//! connections are open, what they have done, and the process-wide counters.

pub mod error;
pub mod record;
pub mod registry;

pub use error::RegistryError;
pub use record::{ActivityEntry, ActivityKind, AggregateMetrics, ConnectionEvent, ConnectionRecord};
pub use registry::ConnectionRegistry;
