use serde::Serialize;
use serde::de::DeserializeOwned;

/// Anything that can travel over the bus.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Message for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Message property keys.
pub mod headers {
    /// Queue the responder should send the response to.
    pub const REPLY_TO: &str = "ReplyTo";

    /// Set on responses whose handler failed.
    pub const IS_FAULTED: &str = "IsFaulted";

    /// Human-readable failure message on faulted responses.
    pub const EXCEPTION_MESSAGE: &str = "ExceptionMessage";

    /// JSON encoded [`RemoteFault`](crate::RemoteFault) on faulted responses.
    pub const SERIALIZED_EXCEPTION: &str = "SerializedException";

    /// Integer partition tag on requests.
    pub const AFFINITY: &str = "Affinity";

    /// How many times a request has been requeued for affinity.
    pub const AFFINITY_CYCLE: &str = "AffinityCycle";

    /// Type name of a message sent through send/receive.
    pub const MESSAGE_TYPE: &str = "Type";
}

/// Used when a faulted response carries no message.
pub const DEFAULT_FAULT_MESSAGE: &str = "The exception message has not been specified.";
