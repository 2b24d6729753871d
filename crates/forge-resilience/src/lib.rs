//! Client-side resilience for ForgeBoard real-time channels.
//!
//! One [`ResilienceController`] per channel drives a transport through
//! `Connecting → Live → Degraded → Connecting → Reconciling → Live`, filling
//! outages with synthetic data that is always labelled as such.

pub mod board;
pub mod controller;
pub mod error;
pub mod retry;
pub mod state;
pub mod supervisor;
pub mod synthetic;
pub mod transport;

pub use board::{StatusBoard, StatusSummary};
pub use controller::{ControllerHandle, ControllerOptions, ResilienceController};
pub use error::TransportError;
pub use retry::RetryPolicy;
pub use state::{ChannelState, ControllerEvent, Phase, Provenance, Sample};
pub use supervisor::ResilienceSupervisor;
pub use synthetic::{generator_for, SyntheticGenerator};
pub use transport::{Transport, WsTransport};
