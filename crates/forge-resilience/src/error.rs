use thiserror::Error;

/// Failures reported by a [`Transport`](crate::transport::Transport).
///
/// Any error out of `recv` is treated as the transport being lost.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("transport lost: {0}")]
    Lost(String),

    #[error("timed out after {ms} ms")]
    Timeout { ms: u64 },

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConnectFailed(_) => "CONNECT_FAILED",
            Self::Lost(_) => "TRANSPORT_LOST",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Protocol(_) => "PROTOCOL_ERROR",
        }
    }
}
