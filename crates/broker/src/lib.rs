//! Abstract interface for brokered messaging: queues, topics, subscriptions
//! and peek-locked deliveries.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Brokers own queues, topics and subscriptions and dispatch deliveries.
pub mod broker;

/// Consumers are running message pumps attached to a queue or subscription.
pub mod consumer;

/// Deliveries are received messages which must be settled.
pub mod delivery;

/// Options used when declaring entities.
pub mod entity;

/// The message model shared by every broker.
pub mod message;

pub use broker::{Broker, BrokerError, MessageCallback};
pub use consumer::Consumer;
pub use delivery::Delivery;
pub use entity::{
    OnMessageOptions, QueueOptions, ReceiveMode, Source, SubscriptionOptions, TOPIC_PROPERTY,
    TopicOptions,
};
pub use message::{BrokeredMessage, PropertyValue};
