use forge_core::{Channel, ConnectionId};
use forge_registry::RegistryError;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Delivery to one connection failed; only that connection is closed.
    #[error("send to {id} failed: {reason}")]
    SendFailure { id: ConnectionId, reason: String },

    /// Cadence outside the allowed range; the previous cadence stays.
    #[error("invalid cadence request: {requested}")]
    InvalidCadence { requested: i64 },

    #[error("connection {id} may not subscribe to {channel}")]
    Unauthorized { id: ConnectionId, channel: Channel },

    #[error("channel {channel} has no poll timer")]
    NotPollDriven { channel: Channel },

    #[error("connection {id} is not active")]
    UnknownConnection { id: ConnectionId },
}

impl GatewayError {
    /// Short error code string sent to clients in error envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Registry(e) => e.code(),
            GatewayError::SendFailure { .. } => "SEND_FAILURE",
            GatewayError::InvalidCadence { .. } => "INVALID_CADENCE",
            GatewayError::Unauthorized { .. } => "UNAUTHORIZED",
            GatewayError::NotPollDriven { .. } => "NOT_POLL_DRIVEN",
            GatewayError::UnknownConnection { .. } => "UNKNOWN_CONNECTION",
        }
    }
}
