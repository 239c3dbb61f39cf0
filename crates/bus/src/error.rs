//! Error types for the bus.

use crate::fault::RemoteFault;

use std::error::Error as StdError;

use conduit_broker::BrokerError;
use thiserror::Error;
use uuid::Uuid;

/// Result type alias for bus operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for bus operations.
#[derive(Debug, Error)]
pub enum Error {
    /// No response arrived before the request timeout.
    #[error("Request timed out. CorrelationId: {correlation_id}")]
    Timeout {
        /// Correlation id of the request.
        correlation_id: Uuid,
    },

    /// The pending request was dropped without an outcome.
    #[error("Request cancelled before a response arrived. CorrelationId: {correlation_id}")]
    Cancelled {
        /// Correlation id of the request.
        correlation_id: Uuid,
    },

    /// The responder's handler failed.
    #[error("Responder fault: {message}")]
    ResponderFault {
        /// Message reported by the responder.
        message: String,
        /// Structured description of the failure, when the responder sent one.
        remote: Option<RemoteFault>,
    },

    /// A message body could not be serialized or deserialized.
    #[error(transparent)]
    Serialization(#[from] SerializationError),

    /// The broker rejected an operation.
    #[error("Transport error: {0}")]
    Transport(#[source] Box<dyn StdError + Send + Sync>),

    /// A type name is too long to be used as an entity name.
    #[error("The serialized name of type '{type_name}' is {length} characters long; the maximum is 255")]
    TypeName {
        /// The offending name.
        type_name: String,
        /// Its length.
        length: usize,
    },

    /// Two handlers were registered for the same message type.
    #[error("There is already a handler for message type '{0}'")]
    DuplicateHandler(String),

    /// A connection string could not be parsed or failed validation.
    #[error("Invalid connection string: {0}")]
    InvalidConnectionString(String),
}

impl Error {
    pub(crate) fn transport<E: BrokerError>(error: E) -> Self {
        Self::Transport(Box::new(error))
    }
}

/// Serialization failures.
#[derive(Debug, Error)]
pub enum SerializationError {
    /// A value could not be encoded.
    #[error("Failed to serialize {type_name}: {source}")]
    Serialize {
        /// Type being serialized.
        type_name: &'static str,
        /// The underlying error.
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    /// A payload could not be decoded.
    #[error("Failed to deserialize {type_name}: {source}")]
    Deserialize {
        /// Type being deserialized.
        type_name: &'static str,
        /// The underlying error.
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
}
