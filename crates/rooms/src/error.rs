use thiserror::Error;

#[derive(Debug, Error)]
pub enum RoomsError {
    #[error("failed to subscribe to events: {0}")]
    SubscriptionFailed(String),
}
