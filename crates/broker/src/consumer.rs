use std::fmt::Debug;

use async_trait::async_trait;

/// A running message pump.
#[async_trait]
pub trait Consumer
where
    Self: Clone + Debug + Send + Sync + 'static,
{
    /// Stops receiving and waits for in-flight callbacks to finish.
    async fn shutdown(&self);

    /// Waits until the consumer has stopped.
    async fn wait(&self);
}
