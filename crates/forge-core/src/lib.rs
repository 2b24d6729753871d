pub mod config;
pub mod error;
pub mod types;

pub use config::ForgeConfig;
pub use error::{ForgeError, Result};
pub use types::{Channel, ConnectionId, DomainEvent, EventLevel};
