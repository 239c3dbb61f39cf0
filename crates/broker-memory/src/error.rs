use conduit_broker::BrokerError;
use thiserror::Error;

/// Errors that can occur in the in-memory broker.
#[derive(Debug, Error)]
pub enum Error {
    /// No queue or subscription with this path.
    #[error("messaging entity not found: {0}")]
    EntityNotFound(String),

    /// The lock on the delivery expired or the delivery was already settled.
    #[error("the lock supplied is invalid: it has expired or the message was already settled")]
    LockLost,

    /// No topic with this name.
    #[error("topic not found: {0}")]
    TopicNotFound(String),
}

impl BrokerError for Error {
    fn is_lock_lost(&self) -> bool {
        matches!(self, Self::LockLost)
    }
}
