use crate::consumer::Consumer;
use crate::delivery::Delivery;
use crate::entity::{OnMessageOptions, QueueOptions, Source, SubscriptionOptions, TopicOptions};
use crate::message::BrokeredMessage;

use std::error::Error;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

/// Marker trait for broker errors.
pub trait BrokerError: Error + Send + Sync + 'static {
    /// Whether the error means the peek lock on a delivery is gone.
    fn is_lock_lost(&self) -> bool {
        false
    }
}

/// Callback invoked once per delivery by a message pump.
pub type MessageCallback<D> = Arc<dyn Fn(D) -> BoxFuture<'static, ()> + Send + Sync>;

/// A brokered-messaging namespace.
#[async_trait]
pub trait Broker
where
    Self: Clone + Debug + Send + Sync + 'static,
{
    /// The error type for the broker.
    type Error: BrokerError;

    /// The delivery type handed to callbacks.
    type Delivery: Delivery<Error = Self::Error>;

    /// The consumer handle returned by [`on_message`](Self::on_message).
    type Consumer: Consumer;

    /// Creates a queue if it does not exist.
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), Self::Error>;

    /// Deletes a queue and everything in it.
    async fn delete_queue(&self, name: &str) -> Result<(), Self::Error>;

    /// Creates a topic if it does not exist.
    async fn declare_topic(&self, name: &str, options: TopicOptions) -> Result<(), Self::Error>;

    /// Whether a topic exists.
    async fn topic_exists(&self, name: &str) -> Result<bool, Self::Error>;

    /// Creates a subscription on an existing topic if it does not exist.
    async fn declare_subscription(
        &self,
        topic: &str,
        name: &str,
        options: SubscriptionOptions,
    ) -> Result<(), Self::Error>;

    /// Sends a message to a queue or topic.
    async fn send(&self, destination: &str, message: BrokeredMessage) -> Result<(), Self::Error>;

    /// Starts a message pump which invokes `callback` for each delivery.
    async fn on_message(
        &self,
        source: Source,
        options: OnMessageOptions,
        callback: MessageCallback<Self::Delivery>,
    ) -> Result<Self::Consumer, Self::Error>;
}
