use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use conduit_broker::BrokeredMessage;
use parking_lot::Mutex;

/// Something the broker did, in the order it happened.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    /// A queue was created.
    QueueCreated {
        /// Queue name.
        queue: String,
    },

    /// A queue was deleted, explicitly or after idling.
    QueueDeleted {
        /// Queue name.
        queue: String,
    },

    /// A message was accepted by a queue or topic.
    Sent {
        /// Queue or topic name.
        destination: String,
        /// The message as sent.
        message: BrokeredMessage,
        /// When the send happened.
        at: DateTime<Utc>,
    },

    /// A message was handed to a consumer.
    Received {
        /// Entity path.
        entity: String,
        /// Message id.
        message_id: String,
        /// Delivery count including this delivery.
        delivery_count: u32,
        /// When the receive happened.
        at: DateTime<Utc>,
    },

    /// A peek lock was renewed.
    LockRenewed {
        /// Entity path.
        entity: String,
        /// Message id.
        message_id: String,
        /// When the renewal happened.
        at: DateTime<Utc>,
    },

    /// A delivery was completed.
    Completed {
        /// Entity path.
        entity: String,
        /// Message id.
        message_id: String,
        /// When the completion happened.
        at: DateTime<Utc>,
    },

    /// A delivery was abandoned.
    Abandoned {
        /// Entity path.
        entity: String,
        /// Message id.
        message_id: String,
        /// When the abandon happened.
        at: DateTime<Utc>,
    },

    /// A message was moved to the dead-letter queue.
    DeadLettered {
        /// Entity path.
        entity: String,
        /// Message id.
        message_id: String,
        /// Why.
        reason: String,
        /// When it happened.
        at: DateTime<Utc>,
    },

    /// A peek lock expired and the message became visible again.
    LockExpired {
        /// Entity path.
        entity: String,
        /// Message id.
        message_id: String,
    },
}

impl Operation {
    /// The message id the operation concerns, if any.
    #[must_use]
    pub fn message_id(&self) -> Option<&str> {
        match self {
            Self::QueueCreated { .. } | Self::QueueDeleted { .. } => None,
            Self::Sent { message, .. } => Some(&message.message_id),
            Self::Received { message_id, .. }
            | Self::LockRenewed { message_id, .. }
            | Self::Completed { message_id, .. }
            | Self::Abandoned { message_id, .. }
            | Self::DeadLettered { message_id, .. }
            | Self::LockExpired { message_id, .. } => Some(message_id),
        }
    }
}

/// Operations kept by a journal unless configured otherwise.
pub const DEFAULT_JOURNAL_CAPACITY: usize = 10_000;

#[derive(Debug)]
struct Entries {
    capacity: usize,
    evicted: u64,
    operations: VecDeque<Operation>,
}

/// Record of the most recent broker operations, oldest first.
///
/// Holds at most `capacity` operations; recording past that evicts the oldest.
/// A capacity of zero records nothing.
#[derive(Clone, Debug)]
pub struct Journal {
    entries: Arc<Mutex<Entries>>,
}

impl Default for Journal {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_JOURNAL_CAPACITY)
    }
}

impl Journal {
    /// Creates a journal keeping the last `capacity` operations.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(Entries {
                capacity,
                evicted: 0,
                operations: VecDeque::new(),
            })),
        }
    }

    pub(crate) fn record(&self, operation: Operation) {
        let mut entries = self.entries.lock();
        if entries.capacity == 0 {
            entries.evicted += 1;
            return;
        }

        if entries.operations.len() == entries.capacity {
            entries.operations.pop_front();
            entries.evicted += 1;
        }
        entries.operations.push_back(operation);
    }

    /// Copy of every operation still held.
    #[must_use]
    pub fn operations(&self) -> Vec<Operation> {
        self.entries.lock().operations.iter().cloned().collect()
    }

    /// Operations concerning one message id, in order.
    #[must_use]
    pub fn for_message(&self, message_id: &str) -> Vec<Operation> {
        self.entries
            .lock()
            .operations
            .iter()
            .filter(|operation| operation.message_id() == Some(message_id))
            .cloned()
            .collect()
    }

    /// Operations recorded but no longer held.
    #[must_use]
    pub fn evicted(&self) -> u64 {
        self.entries.lock().evicted
    }
}
