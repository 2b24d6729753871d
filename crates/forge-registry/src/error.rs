use forge_core::ConnectionId;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Registering an id that is still active. A caller bug, never retried.
    #[error("connection {id} is already registered")]
    DuplicateId { id: ConnectionId },

    /// Activity for an id that is unknown or already closed. Usually a race
    /// between close and a late callback.
    #[error("connection {id} is not active")]
    UnknownConnection { id: ConnectionId },
}

impl RegistryError {
    pub fn code(&self) -> &'static str {
        match self {
            RegistryError::DuplicateId { .. } => "DUPLICATE_ID",
            RegistryError::UnknownConnection { .. } => "UNKNOWN_CONNECTION",
        }
    }
}
