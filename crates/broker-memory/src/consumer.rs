use crate::MemoryBroker;
use crate::delivery::MemoryDelivery;
use crate::entity::Entity;

use std::sync::Arc;

use async_trait::async_trait;
use conduit_broker::{Consumer, Delivery, MessageCallback, OnMessageOptions};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// Handle to a running in-memory message pump.
#[derive(Clone, Debug)]
pub struct MemoryConsumer {
    path: String,
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
}

impl MemoryConsumer {
    pub(crate) fn start(
        broker: MemoryBroker,
        entity: Arc<Entity>,
        options: OnMessageOptions,
        callback: MessageCallback<MemoryDelivery>,
    ) -> Self {
        let consumer = Self {
            path: entity.path.clone(),
            shutdown_token: CancellationToken::new(),
            task_tracker: TaskTracker::new(),
        };

        entity.attach_consumer();
        consumer.task_tracker.spawn(pump(
            broker,
            entity,
            options,
            callback,
            consumer.shutdown_token.clone(),
            consumer.task_tracker.clone(),
        ));

        consumer
    }

    /// Path of the entity being consumed.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }
}

async fn pump(
    broker: MemoryBroker,
    entity: Arc<Entity>,
    options: OnMessageOptions,
    callback: MessageCallback<MemoryDelivery>,
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
) {
    let semaphore = Arc::new(Semaphore::new(options.max_concurrent_calls.max(1)));

    loop {
        let permit = tokio::select! {
            biased;
            () = shutdown_token.cancelled() => break,
            permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let Some(received) = entity.receive(&shutdown_token).await else {
            break;
        };

        let delivery = MemoryDelivery::new(Arc::clone(&entity), received);
        let callback = Arc::clone(&callback);

        task_tracker.spawn(async move {
            callback(delivery.clone()).await;

            if options.auto_complete && !delivery.is_settled() {
                if let Err(error) = delivery.complete().await {
                    warn!(
                        entity = delivery.entity_path(),
                        message_id = %delivery.message().message_id,
                        %error,
                        "failed to auto-complete delivery"
                    );
                }
            }

            drop(permit);
        });
    }

    debug!(entity = %entity.path, "shutdown token cancelled, exiting message pump");
    broker.detach_consumer(&entity);
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn shutdown(&self) {
        self.shutdown_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;
    }

    async fn wait(&self) {
        self.task_tracker.wait().await;
    }
}
