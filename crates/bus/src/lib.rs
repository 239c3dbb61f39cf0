//! Typed message bus over a brokered messaging service.
//!
//! Provides request/response with correlation and timeouts, responders with
//! affinity-based partitioning and lock renewal, topic publish/subscribe and
//! direct queue send/receive. Everything is generic over a
//! [`conduit_broker::Broker`].
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod bus;
mod declared;
mod error;
mod fault;
mod handler;

/// Connection, request, responder, subscription and publish options.
pub mod config;

/// Naming rules mapping message types to broker entities.
pub mod conventions;

/// Keeps peek locks alive while handlers run.
pub mod lock_renewal;

/// Message marker trait and property keys.
pub mod message;

/// Topic publishing and subscription consumers.
pub mod pubsub;

/// Request handlers and the affinity dispatcher.
pub mod responder;

/// Request/response correlation over per-type return queues.
pub mod rpc;

/// Direct queue sends with receivers dispatching by message type.
pub mod send_receive;

/// Body serialization and type naming.
pub mod serializer;

pub use bus::{Bus, BusBuilder};
pub use config::{
    AffinityResolver, ConnectionConfiguration, MAX_TIMEOUT, PublishConfiguration,
    RequestConfiguration, RespondConfiguration, SubscriptionConfiguration,
};
pub use conventions::Conventions;
pub use error::{Error, Result, SerializationError};
pub use fault::RemoteFault;
pub use handler::{Handler, HandlerFn, handler_fn};
pub use lock_renewal::{LockRenewal, RenewalSummary};
pub use message::{DEFAULT_FAULT_MESSAGE, Message, headers};
pub use pubsub::PubSub;
pub use responder::{
    AffinityDispatcher, AffinityTracker, Disposition, Responder, ResponderFn, responder_fn,
};
pub use rpc::{RETURN_QUEUE_AUTO_DELETE_ON_IDLE, Rpc};
pub use send_receive::{HandlerCollection, SendReceive};
pub use serializer::{JsonSerializer, MAX_TYPE_NAME_LENGTH, Serializer, TypeNameSerializer};
