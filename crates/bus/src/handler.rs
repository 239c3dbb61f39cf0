use crate::message::Message;

use std::error::Error as StdError;
use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;

/// Consumes messages of type `T` from a subscription or queue.
#[async_trait]
pub trait Handler<T>
where
    Self: Send + Sync + 'static,
    T: Message,
{
    /// The error type. A failed message is abandoned and redelivered.
    type Error: StdError + Send + Sync + 'static;

    /// Handles one message.
    async fn handle(&self, message: T) -> Result<(), Self::Error>;
}

/// A [`Handler`] backed by an async closure. See [`handler_fn`].
pub struct HandlerFn<F, T> {
    f: F,
    _message: PhantomData<fn(T)>,
}

/// Wraps an async closure as a [`Handler`].
pub const fn handler_fn<T, F>(f: F) -> HandlerFn<F, T> {
    HandlerFn {
        f,
        _message: PhantomData,
    }
}

#[async_trait]
impl<T, E, F, Fut> Handler<T> for HandlerFn<F, T>
where
    T: Message,
    E: StdError + Send + Sync + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send,
{
    type Error = E;

    async fn handle(&self, message: T) -> Result<(), E> {
        (self.f)(message).await
    }
}
