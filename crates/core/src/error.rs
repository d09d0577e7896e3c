use thiserror::Error;

/// The universal error type for the Waddle room discovery layer.
#[derive(Error, Debug)]
pub enum WaddleError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Account error: {0}")]
    Account(String),

    #[error("Event bus error: {0}")]
    EventBus(#[from] EventBusError),

    #[error("Logging setup failed: {0}")]
    Logging(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A specialized Result type for Waddle operations.
pub type Result<T> = std::result::Result<T, WaddleError>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EventBusError {
    #[error("Invalid channel: {0}")]
    InvalidChannel(String),

    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Subscriber lagged: {0} events missed")]
    Lagged(u64),
}
