//! Broadcast Gateway and the axum server around it.
//!
//! [`BroadcastGateway`] fans envelopes out to the connections the registry
//! lists for a channel, either when the batching pipeline emits a batch or
//! when a channel's poll timer fires. The `app`, `http` and `ws` modules wire
//! it to a WebSocket endpoint and a handful of introspection routes.

pub mod app;
pub mod broadcast;
pub mod error;
pub mod http;
pub mod policy;
pub mod producer;
pub mod ws;

pub use broadcast::{BroadcastGateway, FanOut, GatewayOptions, Outbox};
pub use error::GatewayError;
pub use policy::{AllowAll, SubscribePolicy};
pub use producer::{HealthProducer, RegistryStatusProducer, SnapshotProducer, SystemMetricsProducer};
