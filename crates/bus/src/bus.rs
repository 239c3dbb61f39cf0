use crate::config::{
    ConnectionConfiguration, PublishConfiguration, RequestConfiguration, RespondConfiguration,
    SubscriptionConfiguration,
};
use crate::conventions::Conventions;
use crate::declared::DeclaredQueues;
use crate::error::Result;
use crate::handler::Handler;
use crate::message::Message;
use crate::pubsub::PubSub;
use crate::responder::Responder;
use crate::rpc::Rpc;
use crate::send_receive::{HandlerCollection, SendReceive};
use crate::serializer::{JsonSerializer, Serializer};

use std::sync::Arc;

use conduit_broker::Broker;
use tracing::info;

/// Builds a [`Bus`].
#[derive(Debug)]
pub struct BusBuilder<B, S = JsonSerializer> {
    broker: B,
    configuration: ConnectionConfiguration,
    conventions: Conventions,
    serializer: S,
}

impl<B: Broker> BusBuilder<B> {
    /// Starts from the default configuration, conventions and JSON bodies.
    pub fn new(broker: B) -> Self {
        Self {
            broker,
            configuration: ConnectionConfiguration::default(),
            conventions: Conventions::default(),
            serializer: JsonSerializer,
        }
    }
}

impl<B: Broker, S: Serializer> BusBuilder<B, S> {
    /// Replaces the connection configuration.
    #[must_use]
    pub fn with_configuration(mut self, configuration: ConnectionConfiguration) -> Self {
        self.configuration = configuration;
        self
    }

    /// Replaces the naming conventions.
    #[must_use]
    pub fn with_conventions(mut self, conventions: Conventions) -> Self {
        self.conventions = conventions;
        self
    }

    /// Replaces the body serializer.
    pub fn with_serializer<S2: Serializer>(self, serializer: S2) -> BusBuilder<B, S2> {
        BusBuilder {
            broker: self.broker,
            configuration: self.configuration,
            conventions: self.conventions,
            serializer,
        }
    }

    /// Builds the bus.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConnectionString`](crate::Error::InvalidConnectionString)
    /// if the configuration is unusable.
    pub fn build(self) -> Result<Bus<B, S>> {
        self.configuration.validate()?;

        info!(
            timeout = ?self.configuration.timeout,
            max_concurrent_calls = self.configuration.max_concurrent_calls,
            "bus created"
        );

        Ok(Bus::assemble(
            self.broker,
            self.serializer,
            self.conventions,
            self.configuration,
        ))
    }
}

/// Publish/subscribe, request/response and send/receive over one broker.
///
/// Cloning is cheap; clones share pending requests, return queues and the
/// set of declared queues.
#[derive(Clone, Debug)]
pub struct Bus<B, S = JsonSerializer>
where
    B: Broker,
    S: Serializer,
{
    pubsub: PubSub<B, S>,
    rpc: Rpc<B, S>,
    send_receive: SendReceive<B, S>,
}

impl<B: Broker> Bus<B> {
    /// A bus with default settings.
    pub fn new(broker: B) -> Self {
        Self::assemble(
            broker,
            JsonSerializer,
            Conventions::default(),
            ConnectionConfiguration::default(),
        )
    }

    /// Starts building a customised bus.
    pub fn builder(broker: B) -> BusBuilder<B> {
        BusBuilder::new(broker)
    }
}

impl<B, S> Bus<B, S>
where
    B: Broker,
    S: Serializer,
{
    fn assemble(
        broker: B,
        serializer: S,
        conventions: Conventions,
        configuration: ConnectionConfiguration,
    ) -> Self {
        let configuration = Arc::new(configuration);
        let declared_queues = DeclaredQueues::default();

        Self {
            pubsub: PubSub::new(
                broker.clone(),
                serializer.clone(),
                conventions.clone(),
                Arc::clone(&configuration),
            ),
            rpc: Rpc::new(
                broker.clone(),
                serializer.clone(),
                conventions,
                Arc::clone(&configuration),
                declared_queues.clone(),
            ),
            send_receive: SendReceive::new(broker, serializer, configuration, declared_queues),
        }
    }

    /// Publishes `message` with default options.
    ///
    /// # Errors
    ///
    /// See [`PubSub::publish`].
    pub async fn publish<T: Message>(&self, message: &T) -> Result<()> {
        self.pubsub
            .publish(message, PublishConfiguration::default())
            .await
    }

    /// Publishes `message`.
    ///
    /// # Errors
    ///
    /// See [`PubSub::publish`].
    pub async fn publish_with<T: Message>(
        &self,
        message: &T,
        configuration: PublishConfiguration,
    ) -> Result<()> {
        self.pubsub.publish(message, configuration).await
    }

    /// Subscribes to `T` on the default subscription.
    ///
    /// # Errors
    ///
    /// See [`PubSub::subscribe`].
    pub async fn subscribe<T, H>(&self, handler: H) -> Result<B::Consumer>
    where
        T: Message,
        H: Handler<T>,
    {
        self.pubsub
            .subscribe(handler, SubscriptionConfiguration::default())
            .await
    }

    /// Subscribes to `T`.
    ///
    /// # Errors
    ///
    /// See [`PubSub::subscribe`].
    pub async fn subscribe_with<T, H>(
        &self,
        handler: H,
        configuration: SubscriptionConfiguration,
    ) -> Result<B::Consumer>
    where
        T: Message,
        H: Handler<T>,
    {
        self.pubsub.subscribe(handler, configuration).await
    }

    /// Sends a request and waits for the response.
    ///
    /// # Errors
    ///
    /// See [`Rpc::request`].
    pub async fn request<TReq, TRes>(&self, request: &TReq) -> Result<TRes>
    where
        TReq: Message,
        TRes: Message,
    {
        self.rpc
            .request(request, RequestConfiguration::default())
            .await
    }

    /// Sends a request with per-request options and waits for the response.
    ///
    /// # Errors
    ///
    /// See [`Rpc::request`].
    pub async fn request_with<TReq, TRes>(
        &self,
        request: &TReq,
        configuration: RequestConfiguration,
    ) -> Result<TRes>
    where
        TReq: Message,
        TRes: Message,
    {
        self.rpc.request(request, configuration).await
    }

    /// Serves requests of type `TReq`.
    ///
    /// # Errors
    ///
    /// See [`Rpc::respond`].
    pub async fn respond<TReq, R>(&self, responder: R) -> Result<B::Consumer>
    where
        TReq: Message,
        R: Responder<TReq>,
    {
        self.rpc
            .respond(responder, RespondConfiguration::default())
            .await
    }

    /// Serves requests of type `TReq` with affinity and renewal options.
    ///
    /// # Errors
    ///
    /// See [`Rpc::respond`].
    pub async fn respond_with<TReq, R>(
        &self,
        responder: R,
        configuration: RespondConfiguration,
    ) -> Result<B::Consumer>
    where
        TReq: Message,
        R: Responder<TReq>,
    {
        self.rpc.respond(responder, configuration).await
    }

    /// Sends `message` to `queue`.
    ///
    /// # Errors
    ///
    /// See [`SendReceive::send`].
    pub async fn send<T: Message>(&self, queue: &str, message: &T) -> Result<()> {
        self.send_receive.send(queue, message).await
    }

    /// Consumes messages of type `T` from `queue`.
    ///
    /// # Errors
    ///
    /// See [`SendReceive::receive`].
    pub async fn receive<T, H>(&self, queue: &str, handler: H) -> Result<B::Consumer>
    where
        T: Message,
        H: Handler<T>,
    {
        self.send_receive.receive(queue, handler).await
    }

    /// Consumes messages of several types from `queue`.
    ///
    /// # Errors
    ///
    /// See [`SendReceive::receive_with`].
    pub async fn receive_with<F>(&self, queue: &str, register: F) -> Result<B::Consumer>
    where
        F: FnOnce(&mut HandlerCollection<S>) -> Result<()>,
    {
        self.send_receive.receive_with(queue, register).await
    }

    /// The request/response engine.
    pub const fn rpc(&self) -> &Rpc<B, S> {
        &self.rpc
    }

    /// Stops the return queue consumers. Consumers returned to the caller are
    /// theirs to shut down.
    pub async fn shutdown(&self) {
        self.rpc.shutdown().await;
    }
}
