//! Requests go to a queue named after the request type. Each distinct
//! (request, response) type pair gets one auto-deleting return queue per
//! [`Rpc`], shared by every request of that pair; responses are matched to
//! waiting callers by correlation id.

mod pending;

use crate::config::{ConnectionConfiguration, RequestConfiguration, RespondConfiguration};
use crate::conventions::Conventions;
use crate::declared::DeclaredQueues;
use crate::error::{Error, Result};
use crate::fault::RemoteFault;
use crate::message::{DEFAULT_FAULT_MESSAGE, Message, headers};
use crate::responder::{AffinityDispatcher, Responder};
use crate::serializer::{JsonSerializer, Serializer};
use pending::{Outcome, PendingRequests};

use std::any::{TypeId, type_name};
use std::sync::Arc;
use std::time::Duration;

use conduit_broker::{
    Broker, BrokeredMessage, Consumer, Delivery, MessageCallback, OnMessageOptions, QueueOptions,
    Source,
};
use dashmap::DashMap;
use futures::FutureExt;
use tokio::sync::{OnceCell, oneshot};
use tracing::{debug, instrument};
use uuid::Uuid;

/// Return queues are deleted after this long without a consumer.
pub const RETURN_QUEUE_AUTO_DELETE_ON_IDLE: Duration = Duration::from_secs(5 * 60);

type ReturnQueueKey = (TypeId, TypeId);

/// The RPC correlation engine.
#[derive(Clone, Debug)]
pub struct Rpc<B, S = JsonSerializer>
where
    B: Broker,
    S: Serializer,
{
    broker: B,
    configuration: Arc<ConnectionConfiguration>,
    conventions: Conventions,
    declared_queues: DeclaredQueues,
    pending_requests: PendingRequests,
    return_consumers: Arc<DashMap<String, B::Consumer>>,
    return_queues: Arc<DashMap<ReturnQueueKey, Arc<OnceCell<String>>>>,
    serializer: S,
}

impl<B, S> Rpc<B, S>
where
    B: Broker,
    S: Serializer,
{
    /// Creates an engine with no return queues yet.
    pub fn new(
        broker: B,
        serializer: S,
        conventions: Conventions,
        configuration: Arc<ConnectionConfiguration>,
        declared_queues: DeclaredQueues,
    ) -> Self {
        Self {
            broker,
            configuration,
            conventions,
            declared_queues,
            pending_requests: PendingRequests::default(),
            return_consumers: Arc::new(DashMap::new()),
            return_queues: Arc::new(DashMap::new()),
            serializer,
        }
    }

    /// Sends `request` and waits for the matching response.
    ///
    /// # Errors
    ///
    /// - [`Error::Timeout`] if no response arrives in time.
    /// - [`Error::ResponderFault`] if the responder's handler failed.
    /// - [`Error::Serialization`] if the request or response body is invalid.
    /// - [`Error::Transport`] if the broker rejects a declaration or send.
    #[instrument(skip(self, request, configuration), fields(request_type = type_name::<TReq>()))]
    pub async fn request<TReq, TRes>(
        &self,
        request: &TReq,
        configuration: RequestConfiguration,
    ) -> Result<TRes>
    where
        TReq: Message,
        TRes: Message,
    {
        let correlation_id = Uuid::new_v4();
        let timeout = configuration.timeout.unwrap_or(self.configuration.timeout);

        let (response_tx, response_rx) = oneshot::channel();
        let serializer = self.serializer.clone();
        self.pending_requests.register(
            correlation_id,
            type_name::<TRes>(),
            Box::new(move |outcome| {
                let _ = response_tx.send(decode_outcome::<TRes, S>(&serializer, outcome, correlation_id));
            }),
            timeout,
        );

        if let Err(error) = self
            .publish_request::<TReq, TRes>(correlation_id, request, configuration, timeout)
            .await
        {
            self.pending_requests.cancel(correlation_id);
            return Err(error);
        }

        response_rx
            .await
            .unwrap_or(Err(Error::Cancelled { correlation_id }))
    }

    async fn publish_request<TReq, TRes>(
        &self,
        correlation_id: Uuid,
        request: &TReq,
        configuration: RequestConfiguration,
        timeout: Duration,
    ) -> Result<()>
    where
        TReq: Message,
        TRes: Message,
    {
        let return_queue = self.return_queue::<TReq, TRes>().await?;
        let routing_key = self.conventions.rpc_routing_key::<TReq>()?;
        self.declared_queues
            .ensure(&self.broker, &routing_key)
            .await?;

        let mut message = BrokeredMessage::new(self.serializer.to_bytes(request)?)
            .with_correlation_id(correlation_id.to_string())
            .with_property(headers::REPLY_TO, return_queue)
            .with_time_to_live(timeout);

        if let Some(affinity) = configuration.affinity {
            message = message.with_property(headers::AFFINITY, affinity);
        }

        self.broker
            .send(&routing_key, message)
            .await
            .map_err(Error::transport)?;

        debug!(%correlation_id, queue = %routing_key, "published request");
        Ok(())
    }

    async fn return_queue<TReq, TRes>(&self) -> Result<String>
    where
        TReq: 'static,
        TRes: 'static,
    {
        let cell = {
            let entry = self
                .return_queues
                .entry((TypeId::of::<TReq>(), TypeId::of::<TRes>()))
                .or_default();
            Arc::clone(entry.value())
        };

        cell.get_or_try_init(|| self.open_return_queue())
            .await
            .cloned()
    }

    async fn open_return_queue(&self) -> Result<String> {
        let queue = self.conventions.rpc_return_queue_name();

        self.broker
            .declare_queue(
                &queue,
                QueueOptions::default().with_auto_delete_on_idle(RETURN_QUEUE_AUTO_DELETE_ON_IDLE),
            )
            .await
            .map_err(Error::transport)?;

        let pending_requests = self.pending_requests.clone();
        let callback: MessageCallback<B::Delivery> = Arc::new(move |delivery: B::Delivery| {
            let pending_requests = pending_requests.clone();
            async move {
                pending_requests.resolve(delivery.message().clone());
            }
            .boxed()
        });

        let consumer = self
            .broker
            .on_message(
                Source::Queue(queue.clone()),
                OnMessageOptions {
                    auto_complete: true,
                    max_concurrent_calls: self.configuration.max_concurrent_calls,
                },
                callback,
            )
            .await
            .map_err(Error::transport)?;

        self.return_consumers.insert(queue.clone(), consumer);
        debug!(%queue, "subscribed to return queue");

        Ok(queue)
    }

    /// Serves requests of type `TReq` with `responder`.
    ///
    /// Returns the consumer so the caller can stop serving.
    ///
    /// # Errors
    ///
    /// Returns an error if the request queue cannot be named, declared or consumed.
    pub async fn respond<TReq, R>(
        &self,
        responder: R,
        configuration: RespondConfiguration,
    ) -> Result<B::Consumer>
    where
        TReq: Message,
        R: Responder<TReq>,
    {
        let queue = self.conventions.rpc_routing_key::<TReq>()?;
        self.declared_queues.ensure(&self.broker, &queue).await?;

        let dispatcher = Arc::new(AffinityDispatcher::<B, S, TReq, R>::new(
            self.broker.clone(),
            self.serializer.clone(),
            queue.clone(),
            responder,
            configuration,
        ));

        let callback: MessageCallback<B::Delivery> = Arc::new(move |delivery: B::Delivery| {
            let dispatcher = Arc::clone(&dispatcher);
            async move {
                dispatcher.dispatch(delivery).await;
            }
            .boxed()
        });

        debug!(%queue, "responding to requests");
        self.broker
            .on_message(
                Source::Queue(queue),
                OnMessageOptions {
                    auto_complete: false,
                    max_concurrent_calls: self.configuration.max_concurrent_calls,
                },
                callback,
            )
            .await
            .map_err(Error::transport)
    }

    /// Requests still waiting for a response or timeout.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.pending_requests.len()
    }

    /// Names of the return queues opened so far.
    #[must_use]
    pub fn return_queue_names(&self) -> Vec<String> {
        self.return_consumers
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Stops consuming every return queue.
    ///
    /// The queues are forgotten, so a later request opens a fresh one.
    pub async fn shutdown(&self) {
        self.return_queues.clear();

        let queues: Vec<String> = self
            .return_consumers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        for queue in queues {
            if let Some((_, consumer)) = self.return_consumers.remove(&queue) {
                consumer.shutdown().await;
                debug!(%queue, "stopped consuming return queue");
            }
        }
    }
}

fn decode_outcome<T, S>(serializer: &S, outcome: Outcome, correlation_id: Uuid) -> Result<T>
where
    T: Message,
    S: Serializer,
{
    let message = match outcome {
        Outcome::TimedOut => return Err(Error::Timeout { correlation_id }),
        Outcome::Response(message) => message,
    };

    if message.property_bool(headers::IS_FAULTED).unwrap_or(false) {
        let remote = message
            .property_str(headers::SERIALIZED_EXCEPTION)
            .and_then(|json| serde_json::from_str::<RemoteFault>(&json).ok());

        return Err(Error::ResponderFault {
            message: message
                .property_str(headers::EXCEPTION_MESSAGE)
                .filter(|text| !text.is_empty())
                .unwrap_or_else(|| DEFAULT_FAULT_MESSAGE.to_string()),
            remote,
        });
    }

    Ok(serializer.from_bytes(&message.body)?)
}
