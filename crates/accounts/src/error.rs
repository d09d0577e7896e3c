use thiserror::Error;
use waddle_core::WaddleError;
use waddle_xmpp::{ChatError, ConnectionError};

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("no connected account for {0}")]
    AccountNotConnected(String),

    #[error("invalid JID: {0}")]
    InvalidJid(String),

    #[error("connection failed: {0}")]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Chat(#[from] ChatError),
}

impl From<AccountError> for WaddleError {
    fn from(error: AccountError) -> Self {
        WaddleError::Account(error.to_string())
    }
}
