use crate::config::RespondConfiguration;
use crate::fault::RemoteFault;
use crate::lock_renewal::LockRenewal;
use crate::message::{Message, headers};
use crate::serializer::Serializer;

use std::error::Error as StdError;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use conduit_broker::{Broker, BrokeredMessage, Delivery};
use dashmap::DashMap;
use futures::FutureExt;
use tracing::{debug, error, info, warn};

/// Handles requests of type `TReq`.
#[async_trait]
pub trait Responder<TReq>
where
    Self: Send + Sync + 'static,
    TReq: Message,
{
    /// The response type.
    type Response: Message;

    /// The error type. Errors are sent back to the requester as faults.
    type Error: StdError + Send + Sync + 'static;

    /// Produces the response for one request.
    async fn respond(&self, request: TReq) -> Result<Self::Response, Self::Error>;
}

/// A [`Responder`] backed by an async closure. See [`responder_fn`].
pub struct ResponderFn<F, TReq> {
    f: F,
    _request: PhantomData<fn(TReq)>,
}

/// Wraps an async closure as a [`Responder`].
pub const fn responder_fn<TReq, F>(f: F) -> ResponderFn<F, TReq> {
    ResponderFn {
        f,
        _request: PhantomData,
    }
}

#[async_trait]
impl<TReq, TRes, E, F, Fut> Responder<TReq> for ResponderFn<F, TReq>
where
    TReq: Message,
    TRes: Message,
    E: StdError + Send + Sync + 'static,
    F: Fn(TReq) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<TRes, E>> + Send,
{
    type Response = TRes;
    type Error = E;

    async fn respond(&self, request: TReq) -> Result<TRes, E> {
        (self.f)(request).await
    }
}

/// Counts how often each message has been seen and turned away for affinity.
#[derive(Clone, Debug, Default)]
pub struct AffinityTracker {
    seen: Arc<DashMap<String, u32>>,
}

impl AffinityTracker {
    /// Records one more sighting and returns the new count.
    pub fn observe(&self, message_id: &str) -> u32 {
        let mut count = self.seen.entry(message_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Drops the count for a message.
    pub fn forget(&self, message_id: &str) {
        self.seen.remove(message_id);
    }

    /// Current count for a message.
    #[must_use]
    pub fn seen_count(&self, message_id: &str) -> u32 {
        self.seen.get(message_id).map_or(0, |count| *count)
    }

    /// Number of messages being tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Whether nothing is being tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// What happened to a delivered request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// The handler succeeded and the response was sent.
    Processed,

    /// The handler failed and a fault response was sent.
    Faulted,

    /// Released for another responder to pick up.
    Abandoned,

    /// Re-sent to the request queue with a delay.
    Requeued {
        /// The new affinity cycle.
        cycle: i64,
    },

    /// Moved to the dead-letter queue.
    DeadLettered,
}

fn scheduled_after(delay: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|delay| Utc::now().checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn fault_response(fault: &RemoteFault) -> BrokeredMessage {
    let response = BrokeredMessage::new(Bytes::new())
        .with_property(headers::IS_FAULTED, true)
        .with_property(headers::EXCEPTION_MESSAGE, fault.message.clone());

    match serde_json::to_string(fault) {
        Ok(json) => response.with_property(headers::SERIALIZED_EXCEPTION, json),
        Err(error) => {
            warn!(%error, "failed to serialize fault");
            response
        }
    }
}

/// Runs one responder against deliveries from its request queue.
///
/// A request whose `Affinity` the resolver rejects is abandoned the first time
/// this dispatcher sees it, so another responder can take it. Seen a second
/// time, it is re-sent to the queue with `AffinityCycle` incremented and
/// `requeue_delay` of scheduled delay, and the original is completed.
pub struct AffinityDispatcher<B, S, TReq, R>
where
    B: Broker,
    S: Serializer,
    TReq: Message,
    R: Responder<TReq>,
{
    broker: B,
    configuration: RespondConfiguration,
    queue: String,
    responder: R,
    serializer: S,
    tracker: AffinityTracker,
    _request: PhantomData<fn(TReq)>,
}

impl<B, S, TReq, R> AffinityDispatcher<B, S, TReq, R>
where
    B: Broker,
    S: Serializer,
    TReq: Message,
    R: Responder<TReq>,
{
    /// Creates a dispatcher for requests arriving on `queue`.
    pub fn new(
        broker: B,
        serializer: S,
        queue: String,
        responder: R,
        configuration: RespondConfiguration,
    ) -> Self {
        Self {
            broker,
            configuration,
            queue,
            responder,
            serializer,
            tracker: AffinityTracker::default(),
            _request: PhantomData,
        }
    }

    /// The affinity tracker.
    pub const fn tracker(&self) -> &AffinityTracker {
        &self.tracker
    }

    /// Handles one delivery to completion.
    pub async fn dispatch(&self, delivery: B::Delivery) -> Disposition {
        let message = delivery.message();
        info!(queue = %self.queue, message_id = %message.message_id, "received request");

        if let Some(resolver) = &self.configuration.affinity_resolver {
            if let Some(affinity) = message
                .property_i64(headers::AFFINITY)
                .and_then(|affinity| i32::try_from(affinity).ok())
            {
                if !resolver(affinity) {
                    return self.reject(&delivery, affinity).await;
                }

                info!(
                    queue = %self.queue,
                    message_id = %message.message_id,
                    affinity,
                    "processing request with matched affinity"
                );
            }
        }

        let disposition = self.process(&delivery).await;
        self.tracker.forget(&message.message_id);
        disposition
    }

    async fn reject(&self, delivery: &B::Delivery, affinity: i32) -> Disposition {
        let message = delivery.message();
        let message_id = &message.message_id;

        if self.tracker.observe(message_id) <= 1 {
            info!(queue = %self.queue, %message_id, affinity, "abandoning request with unmatched affinity");
            self.settle(message_id, "abandon", delivery.abandon().await);
            return Disposition::Abandoned;
        }

        self.tracker.forget(message_id);
        let cycle = message.property_i64(headers::AFFINITY_CYCLE).unwrap_or(0) + 1;
        let requeued = message
            .clone()
            .with_property(headers::AFFINITY_CYCLE, cycle)
            .with_scheduled_enqueue_time(scheduled_after(self.configuration.requeue_delay));

        match self.broker.send(&self.queue, requeued).await {
            Ok(()) => {
                info!(queue = %self.queue, %message_id, affinity, cycle, "requeued request with unmatched affinity");
                self.settle(message_id, "complete", delivery.complete().await);
                Disposition::Requeued { cycle }
            }
            Err(error) => {
                error!(queue = %self.queue, %message_id, %error, "failed to requeue request");
                self.settle(message_id, "abandon", delivery.abandon().await);
                Disposition::Abandoned
            }
        }
    }

    async fn process(&self, delivery: &B::Delivery) -> Disposition {
        let message = delivery.message();
        let message_id = &message.message_id;

        let request: TReq = match self.serializer.from_bytes(&message.body) {
            Ok(request) => request,
            Err(error) => {
                error!(queue = %self.queue, %message_id, %error, "failed to deserialize request");
                return self.dead_letter(delivery, &error.to_string()).await;
            }
        };

        let Some(reply_to) = message.property_str(headers::REPLY_TO) else {
            error!(queue = %self.queue, %message_id, "request has no reply queue");
            return self.dead_letter(delivery, "request has no ReplyTo").await;
        };

        let renewal = LockRenewal::start(delivery.clone(), self.configuration.lock_renewal_interval);
        let outcome = AssertUnwindSafe(self.responder.respond(request))
            .catch_unwind()
            .await;
        let summary = renewal.stop().await;
        debug!(queue = %self.queue, %message_id, ?summary, "handler finished");

        let (mut response, faulted) = match outcome {
            Ok(Ok(response)) => match self.serializer.to_bytes(&response) {
                Ok(body) => (BrokeredMessage::new(body), false),
                Err(error) => {
                    error!(queue = %self.queue, %message_id, %error, "failed to serialize response");
                    return self.dead_letter(delivery, &error.to_string()).await;
                }
            },
            Ok(Err(error)) => {
                let fault = RemoteFault::from_error(&error);
                error!(queue = %self.queue, %message_id, %fault, "responder failed");
                (fault_response(&fault), true)
            }
            Err(panic) => {
                let fault = RemoteFault::from_panic(panic.as_ref());
                error!(queue = %self.queue, %message_id, %fault, "responder panicked");
                (fault_response(&fault), true)
            }
        };

        if let Some(correlation_id) = &message.correlation_id {
            response = response.with_correlation_id(correlation_id.clone());
        }

        if let Err(error) = self.broker.send(&reply_to, response).await {
            error!(queue = %self.queue, %message_id, %reply_to, %error, "failed to send response");
            return self.dead_letter(delivery, &error.to_string()).await;
        }

        self.settle(message_id, "complete", delivery.complete().await);
        info!(queue = %self.queue, %message_id, faulted, "completed request");

        if faulted {
            Disposition::Faulted
        } else {
            Disposition::Processed
        }
    }

    async fn dead_letter(&self, delivery: &B::Delivery, reason: &str) -> Disposition {
        let message_id = &delivery.message().message_id;
        self.settle(message_id, "dead-letter", delivery.dead_letter(reason).await);
        Disposition::DeadLettered
    }

    fn settle(&self, message_id: &str, action: &str, result: Result<(), B::Error>) {
        if let Err(error) = result {
            warn!(queue = %self.queue, %message_id, action, %error, "failed to settle request");
        }
    }
}
