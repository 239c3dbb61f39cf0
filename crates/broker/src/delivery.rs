use crate::broker::BrokerError;
use crate::message::BrokeredMessage;

use std::fmt::Debug;

use async_trait::async_trait;

/// A message received under a peek lock.
///
/// Exactly one of [`complete`](Self::complete), [`abandon`](Self::abandon) or
/// [`dead_letter`](Self::dead_letter) settles the delivery. Settling after the
/// lock has expired fails with an error for which
/// [`BrokerError::is_lock_lost`] returns `true`.
#[async_trait]
pub trait Delivery
where
    Self: Clone + Debug + Send + Sync + 'static,
{
    /// The error type for settlement operations.
    type Error: BrokerError;

    /// The received message.
    fn message(&self) -> &BrokeredMessage;

    /// How many times the message has been delivered, including this time.
    fn delivery_count(&self) -> u32;

    /// Extends the lock by the entity's lock duration.
    async fn renew_lock(&self) -> Result<(), Self::Error>;

    /// Removes the message from the entity.
    async fn complete(&self) -> Result<(), Self::Error>;

    /// Releases the lock so the message can be delivered again.
    async fn abandon(&self) -> Result<(), Self::Error>;

    /// Moves the message to the entity's dead-letter queue.
    async fn dead_letter(&self, reason: &str) -> Result<(), Self::Error>;
}
