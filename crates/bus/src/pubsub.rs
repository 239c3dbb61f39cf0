use crate::config::{ConnectionConfiguration, PublishConfiguration, SubscriptionConfiguration};
use crate::conventions::Conventions;
use crate::error::{Error, Result};
use crate::handler::Handler;
use crate::lock_renewal::LockRenewal;
use crate::message::Message;
use crate::serializer::{JsonSerializer, Serializer};

use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use conduit_broker::{
    Broker, BrokeredMessage, Delivery, MessageCallback, OnMessageOptions, Source,
    SubscriptionOptions, TOPIC_PROPERTY, TopicOptions,
};
use futures::FutureExt;
use tracing::{debug, error, info, warn};

/// Publishes messages to topics and runs subscriptions.
///
/// The topic entity for a message type is its queue name; the `topic`
/// property on each message carries the filter value subscriptions match on.
#[derive(Clone, Debug)]
pub struct PubSub<B, S = JsonSerializer>
where
    B: Broker,
    S: Serializer,
{
    broker: B,
    configuration: Arc<ConnectionConfiguration>,
    conventions: Conventions,
    serializer: S,
}

impl<B, S> PubSub<B, S>
where
    B: Broker,
    S: Serializer,
{
    /// Creates the publish/subscribe layer.
    pub const fn new(
        broker: B,
        serializer: S,
        conventions: Conventions,
        configuration: Arc<ConnectionConfiguration>,
    ) -> Self {
        Self {
            broker,
            configuration,
            conventions,
            serializer,
        }
    }

    /// Publishes `message` to the topic for `T`.
    ///
    /// Nothing is sent when no subscriber has declared the topic yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be serialized or the broker rejects it.
    pub async fn publish<T: Message>(
        &self,
        message: &T,
        configuration: PublishConfiguration,
    ) -> Result<()> {
        let topic = self.conventions.queue_name::<T>()?;

        if !self
            .broker
            .topic_exists(&topic)
            .await
            .map_err(Error::transport)?
        {
            debug!(%topic, "topic has not been declared, message not published");
            return Ok(());
        }

        let filter = match configuration.topic {
            Some(filter) => filter,
            None => self.conventions.topic_name::<T>()?,
        };

        let mut brokered = BrokeredMessage::new(self.serializer.to_bytes(message)?)
            .with_property(TOPIC_PROPERTY, filter);

        if let Some(message_id) = configuration.message_id {
            brokered = brokered.with_message_id(message_id);
        }

        if let Some(at) = configuration.scheduled_enqueue_time {
            brokered = brokered.with_scheduled_enqueue_time(at);
        }

        info!(%topic, message_id = %brokered.message_id, "publishing message");
        self.broker
            .send(&topic, brokered)
            .await
            .map_err(Error::transport)
    }

    /// Subscribes `handler` to messages of type `T`.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic or subscription cannot be declared or consumed.
    pub async fn subscribe<T, H>(
        &self,
        handler: H,
        configuration: SubscriptionConfiguration,
    ) -> Result<B::Consumer>
    where
        T: Message,
        H: Handler<T>,
    {
        let topic = self.conventions.queue_name::<T>()?;

        self.broker
            .declare_topic(
                &topic,
                TopicOptions {
                    requires_duplicate_detection: configuration.requires_duplicate_detection,
                },
            )
            .await
            .map_err(Error::transport)?;

        self.broker
            .declare_subscription(
                &topic,
                &configuration.subscription,
                SubscriptionOptions {
                    topics: configuration.topics.clone(),
                    receive_mode: configuration.receive_mode,
                    max_delivery_count: configuration.max_delivery_count,
                },
            )
            .await
            .map_err(Error::transport)?;

        let source = Source::Subscription {
            topic,
            name: configuration.subscription.clone(),
        };

        let subscriber = Arc::new(Subscriber {
            entity: source.path(),
            handler,
            lock_renewal_interval: configuration.lock_renewal_interval,
            serializer: self.serializer.clone(),
            _message: PhantomData,
        });

        let callback: MessageCallback<B::Delivery> = Arc::new(move |delivery: B::Delivery| {
            let subscriber = Arc::clone(&subscriber);
            async move {
                subscriber.deliver(delivery).await;
            }
            .boxed()
        });

        info!(subscription = %source, topics = ?configuration.topics, "subscribing");
        self.broker
            .on_message(
                source,
                OnMessageOptions {
                    auto_complete: false,
                    max_concurrent_calls: self.configuration.max_concurrent_calls,
                },
                callback,
            )
            .await
            .map_err(Error::transport)
    }
}

struct Subscriber<S, T, H> {
    entity: String,
    handler: H,
    lock_renewal_interval: Duration,
    serializer: S,
    _message: PhantomData<fn(T)>,
}

impl<S, T, H> Subscriber<S, T, H>
where
    S: Serializer,
    T: Message,
    H: Handler<T>,
{
    async fn deliver<D: Delivery>(&self, delivery: D) {
        let message_id = delivery.message().message_id.clone();

        let message: T = match self.serializer.from_bytes(&delivery.message().body) {
            Ok(message) => message,
            Err(error) => {
                error!(entity = %self.entity, %message_id, %error, "failed to deserialize message");
                if let Err(error) = delivery.dead_letter(&error.to_string()).await {
                    warn!(entity = %self.entity, %message_id, %error, "failed to dead-letter message");
                }
                return;
            }
        };

        let renewal = LockRenewal::start(delivery.clone(), self.lock_renewal_interval);
        let outcome = AssertUnwindSafe(self.handler.handle(message))
            .catch_unwind()
            .await;
        renewal.stop().await;

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(error)) => Some(error.to_string()),
            Err(panic) => Some(crate::fault::RemoteFault::from_panic(panic.as_ref()).message),
        };

        let settlement = match failure {
            None => {
                debug!(entity = %self.entity, %message_id, "handled message");
                delivery.complete().await
            }
            Some(failure) => {
                error!(
                    entity = %self.entity,
                    %message_id,
                    delivery_count = delivery.delivery_count(),
                    %failure,
                    "failed to handle message"
                );
                delivery.abandon().await
            }
        };

        if let Err(error) = settlement {
            warn!(entity = %self.entity, %message_id, %error, "failed to settle message");
        }
    }
}
