use thiserror::Error;

#[derive(Debug, Error)]
pub enum ForgeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ForgeError {
    /// Short error code string sent to clients in error envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            ForgeError::Config(_) => "CONFIG_ERROR",
            ForgeError::UnknownChannel(_) => "UNKNOWN_CHANNEL",
            ForgeError::Serialization(_) => "SERIALIZATION_ERROR",
            ForgeError::Io(_) => "IO_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, ForgeError>;
