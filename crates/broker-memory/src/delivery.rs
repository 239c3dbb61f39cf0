use crate::entity::{Entity, Received};
use crate::error::Error;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use conduit_broker::{BrokeredMessage, Delivery};
use uuid::Uuid;

/// A message received from an in-memory queue or subscription.
#[derive(Clone, Debug)]
pub struct MemoryDelivery {
    delivery_count: u32,
    entity: Arc<Entity>,
    lock_token: Option<Uuid>,
    message: BrokeredMessage,
    settled: Arc<AtomicBool>,
}

impl MemoryDelivery {
    pub(crate) fn new(entity: Arc<Entity>, received: Received) -> Self {
        Self {
            delivery_count: received.delivery_count,
            entity,
            lock_token: received.lock_token,
            message: received.message,
            settled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether a settlement has been attempted on this delivery.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }

    /// Path of the entity the message was received from.
    #[must_use]
    pub fn entity_path(&self) -> &str {
        &self.entity.path
    }

    fn settle(&self) -> Option<Uuid> {
        self.settled.store(true, Ordering::SeqCst);
        self.lock_token
    }
}

#[async_trait]
impl Delivery for MemoryDelivery {
    type Error = Error;

    fn message(&self) -> &BrokeredMessage {
        &self.message
    }

    fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    async fn renew_lock(&self) -> Result<(), Error> {
        match self.lock_token {
            Some(lock_token) => self.entity.renew_lock(lock_token),
            None => Ok(()),
        }
    }

    async fn complete(&self) -> Result<(), Error> {
        match self.settle() {
            Some(lock_token) => self.entity.complete(lock_token),
            None => Ok(()),
        }
    }

    async fn abandon(&self) -> Result<(), Error> {
        match self.settle() {
            Some(lock_token) => self.entity.abandon(lock_token),
            None => Ok(()),
        }
    }

    async fn dead_letter(&self, reason: &str) -> Result<(), Error> {
        match self.settle() {
            Some(lock_token) => self.entity.dead_letter(lock_token, reason),
            None => Ok(()),
        }
    }
}
