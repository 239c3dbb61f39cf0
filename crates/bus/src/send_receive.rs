//! Every message sent here carries a `Type` property naming its Rust type.
//! A receiver registers one handler per type in a [`HandlerCollection`] and
//! each delivery is routed by that property.

use crate::config::ConnectionConfiguration;
use crate::declared::DeclaredQueues;
use crate::error::{Error, Result, SerializationError};
use crate::handler::Handler;
use crate::message::{Message, headers};
use crate::serializer::{JsonSerializer, Serializer, TypeNameSerializer};

use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use conduit_broker::{Broker, BrokeredMessage, Delivery, MessageCallback, OnMessageOptions, Source};
use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::{debug, error, info, warn};

enum HandleError {
    Deserialize(SerializationError),
    Handler(String),
}

type ErasedHandler =
    Arc<dyn Fn(Bytes) -> BoxFuture<'static, std::result::Result<(), HandleError>> + Send + Sync>;

/// Handlers for the message types accepted on one queue, keyed by type name.
pub struct HandlerCollection<S = JsonSerializer> {
    handlers: HashMap<String, ErasedHandler>,
    serializer: S,
}

impl<S> fmt::Debug for HandlerCollection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&String> = self.handlers.keys().collect();
        types.sort();
        f.debug_struct("HandlerCollection")
            .field("types", &types)
            .finish_non_exhaustive()
    }
}

impl<S: Serializer> HandlerCollection<S> {
    /// Creates an empty collection decoding bodies with `serializer`.
    #[must_use]
    pub fn new(serializer: S) -> Self {
        Self {
            handlers: HashMap::new(),
            serializer,
        }
    }

    /// Registers `handler` for messages of type `T`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateHandler`] if `T` already has a handler, or
    /// [`Error::TypeName`] if its name is too long.
    pub fn add<T, H>(&mut self, handler: H) -> Result<&mut Self>
    where
        T: Message,
        H: Handler<T>,
    {
        let type_name = TypeNameSerializer::serialize::<T>()?;
        if self.handlers.contains_key(&type_name) {
            return Err(Error::DuplicateHandler(type_name));
        }

        let handler = Arc::new(handler);
        let serializer = self.serializer.clone();
        let erased: ErasedHandler = Arc::new(move |body: Bytes| {
            let handler = Arc::clone(&handler);
            let decoded = serializer.from_bytes::<T>(&body);
            async move {
                let message = decoded.map_err(HandleError::Deserialize)?;
                match AssertUnwindSafe(handler.handle(message)).catch_unwind().await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(error)) => Err(HandleError::Handler(error.to_string())),
                    Err(panic) => Err(HandleError::Handler(
                        crate::fault::RemoteFault::from_panic(panic.as_ref()).message,
                    )),
                }
            }
            .boxed()
        });

        self.handlers.insert(type_name, erased);
        Ok(self)
    }

    /// Whether a handler is registered for `type_name`.
    #[must_use]
    pub fn contains(&self, type_name: &str) -> bool {
        self.handlers.contains_key(type_name)
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handler is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    async fn dispatch<D: Delivery>(&self, queue: &str, delivery: D) {
        let message = delivery.message();
        let message_id = message.message_id.clone();

        let Some(type_name) = message.property_str(headers::MESSAGE_TYPE) else {
            error!(%queue, %message_id, "message has no Type property");
            settle(queue, &message_id, delivery.dead_letter("message has no Type property").await);
            return;
        };

        let Some(handler) = self.handlers.get(&type_name) else {
            error!(%queue, %message_id, %type_name, "no handler for message type");
            let reason = format!("no handler for message type '{type_name}'");
            settle(queue, &message_id, delivery.dead_letter(&reason).await);
            return;
        };

        match handler(message.body.clone()).await {
            Ok(()) => {
                debug!(%queue, %message_id, %type_name, "handled message");
                settle(queue, &message_id, delivery.complete().await);
            }
            Err(HandleError::Deserialize(error)) => {
                error!(%queue, %message_id, %error, "failed to deserialize message");
                settle(queue, &message_id, delivery.dead_letter(&error.to_string()).await);
            }
            Err(HandleError::Handler(failure)) => {
                error!(
                    %queue,
                    %message_id,
                    delivery_count = delivery.delivery_count(),
                    %failure,
                    "failed to handle message"
                );
                settle(queue, &message_id, delivery.abandon().await);
            }
        }
    }
}

fn settle<E: std::error::Error>(queue: &str, message_id: &str, result: std::result::Result<(), E>) {
    if let Err(error) = result {
        warn!(%queue, %message_id, %error, "failed to settle message");
    }
}

/// Sends typed messages to named queues and consumes them.
#[derive(Clone, Debug)]
pub struct SendReceive<B, S = JsonSerializer>
where
    B: Broker,
    S: Serializer,
{
    broker: B,
    configuration: Arc<ConnectionConfiguration>,
    declared_queues: DeclaredQueues,
    serializer: S,
}

impl<B, S> SendReceive<B, S>
where
    B: Broker,
    S: Serializer,
{
    /// Creates the send/receive layer.
    pub const fn new(
        broker: B,
        serializer: S,
        configuration: Arc<ConnectionConfiguration>,
        declared_queues: DeclaredQueues,
    ) -> Self {
        Self {
            broker,
            configuration,
            declared_queues,
            serializer,
        }
    }

    /// Sends `message` to `queue`, declaring the queue on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be serialized or the broker rejects it.
    pub async fn send<T: Message>(&self, queue: &str, message: &T) -> Result<()> {
        self.declared_queues.ensure(&self.broker, queue).await?;

        let type_name = TypeNameSerializer::serialize::<T>()?;
        let brokered = BrokeredMessage::new(self.serializer.to_bytes(message)?)
            .with_property(headers::MESSAGE_TYPE, type_name.clone());

        info!(%queue, message_id = %brokered.message_id, %type_name, "sending message");
        self.broker
            .send(queue, brokered)
            .await
            .map_err(Error::transport)
    }

    /// Consumes messages of a single type from `queue`.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be declared or consumed.
    pub async fn receive<T, H>(&self, queue: &str, handler: H) -> Result<B::Consumer>
    where
        T: Message,
        H: Handler<T>,
    {
        self.receive_with(queue, |handlers| {
            handlers.add::<T, H>(handler)?;
            Ok(())
        })
        .await
    }

    /// Consumes messages of several types from `queue`.
    ///
    /// `register` populates the handler collection before consumption starts.
    ///
    /// # Errors
    ///
    /// Returns any error from `register`, or an error if the queue cannot be
    /// declared or consumed.
    pub async fn receive_with<F>(&self, queue: &str, register: F) -> Result<B::Consumer>
    where
        F: FnOnce(&mut HandlerCollection<S>) -> Result<()>,
    {
        let mut handlers = HandlerCollection::new(self.serializer.clone());
        register(&mut handlers)?;
        self.declared_queues.ensure(&self.broker, queue).await?;

        info!(%queue, ?handlers, "receiving messages");
        let handlers = Arc::new(handlers);
        let name = Arc::<str>::from(queue);
        let callback: MessageCallback<B::Delivery> = Arc::new(move |delivery: B::Delivery| {
            let handlers = Arc::clone(&handlers);
            let name = Arc::clone(&name);
            async move {
                handlers.dispatch(&name, delivery).await;
            }
            .boxed()
        });

        self.broker
            .on_message(
                Source::Queue(queue.to_string()),
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

#[cfg(test)]
mod tests {
    use super::*;

    use crate::handler::handler_fn;

    use assert_matches::assert_matches;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Created {
        id: u32,
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Deleted {
        id: u32,
    }

    fn ok_handler<T: Message>() -> impl Handler<T> {
        handler_fn(|_: T| async { Ok::<_, std::io::Error>(()) })
    }

    #[test]
    fn test_collection_registers_by_type_name() {
        let mut handlers = HandlerCollection::new(JsonSerializer);
        handlers
            .add::<Created, _>(ok_handler())
            .unwrap()
            .add::<Deleted, _>(ok_handler())
            .unwrap();

        assert_eq!(handlers.len(), 2);
        assert!(handlers.contains(&TypeNameSerializer::serialize::<Created>().unwrap()));
        assert!(handlers.contains(&TypeNameSerializer::serialize::<Deleted>().unwrap()));
    }

    #[test]
    fn test_collection_rejects_duplicates() {
        let mut handlers = HandlerCollection::new(JsonSerializer);
        handlers.add::<Created, _>(ok_handler()).unwrap();

        assert_matches!(
            handlers.add::<Created, _>(ok_handler()),
            Err(Error::DuplicateHandler(name)) if name.ends_with("Created")
        );
        assert_eq!(handlers.len(), 1);
    }
}
