//! In-memory (single process) implementation of the broker interface.
//!
//! Queues and subscriptions hold messages under peek locks with expiry,
//! redelivery, dead-lettering, scheduled enqueue and time to live. Recent
//! operations are recorded in a bounded [`Journal`] so tests can assert on
//! exactly what a client did.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod consumer;
mod delivery;
mod entity;
mod error;
mod journal;

pub use consumer::MemoryConsumer;
pub use delivery::MemoryDelivery;
pub use entity::DEAD_LETTER_REASON_PROPERTY;
pub use error::Error;
pub use journal::{DEFAULT_JOURNAL_CAPACITY, Journal, Operation};

use entity::Entity;

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use conduit_broker::{
    Broker, BrokeredMessage, MessageCallback, OnMessageOptions, QueueOptions, ReceiveMode,
    Source, SubscriptionOptions, TOPIC_PROPERTY, TopicOptions,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Options for the in-memory broker.
#[derive(Clone, Copy, Debug)]
pub struct MemoryBrokerOptions {
    /// How long a topic requiring duplicate detection remembers a message id.
    pub duplicate_detection_window: Duration,

    /// Operations the journal keeps. Zero disables the journal.
    pub journal_capacity: usize,

    /// How long a peek lock lasts before the message becomes visible again.
    pub lock_duration: Duration,

    /// Default max delivery count for entities which do not set one.
    pub max_delivery_count: u32,
}

impl Default for MemoryBrokerOptions {
    fn default() -> Self {
        Self {
            duplicate_detection_window: Duration::from_secs(10 * 60),
            journal_capacity: DEFAULT_JOURNAL_CAPACITY,
            lock_duration: Duration::from_secs(60),
            max_delivery_count: 10,
        }
    }
}

impl MemoryBrokerOptions {
    /// Sets the duplicate detection window.
    #[must_use]
    pub const fn with_duplicate_detection_window(mut self, window: Duration) -> Self {
        self.duplicate_detection_window = window;
        self
    }

    /// Sets how many operations the journal keeps.
    #[must_use]
    pub const fn with_journal_capacity(mut self, journal_capacity: usize) -> Self {
        self.journal_capacity = journal_capacity;
        self
    }

    /// Sets the lock duration.
    #[must_use]
    pub const fn with_lock_duration(mut self, lock_duration: Duration) -> Self {
        self.lock_duration = lock_duration;
        self
    }

    /// Sets the default max delivery count.
    #[must_use]
    pub const fn with_max_delivery_count(mut self, max_delivery_count: u32) -> Self {
        self.max_delivery_count = max_delivery_count;
        self
    }
}

#[derive(Debug)]
struct TopicSubscription {
    entity: Arc<Entity>,
    filters: Vec<String>,
    name: String,
}

impl TopicSubscription {
    fn accepts(&self, topic: Option<&str>) -> bool {
        self.filters.is_empty()
            || topic.is_some_and(|topic| self.filters.iter().any(|filter| filter == topic))
    }
}

/// Message ids seen within the duplicate detection window, oldest first.
#[derive(Debug, Default)]
struct SeenMessageIds {
    ids: HashSet<String>,
    order: VecDeque<(Instant, String)>,
}

impl SeenMessageIds {
    /// Remembers `message_id`. Returns `false` if it was already seen inside `window`.
    fn insert(&mut self, message_id: &str, window: Duration) -> bool {
        let now = Instant::now();
        while self
            .order
            .front()
            .is_some_and(|(seen, _)| now.duration_since(*seen) >= window)
        {
            if let Some((_, expired)) = self.order.pop_front() {
                self.ids.remove(&expired);
            }
        }

        if window.is_zero() {
            return true;
        }

        if !self.ids.insert(message_id.to_string()) {
            return false;
        }
        self.order.push_back((now, message_id.to_string()));
        true
    }
}

#[derive(Debug)]
struct Topic {
    options: TopicOptions,
    seen_message_ids: Mutex<SeenMessageIds>,
    subscriptions: Mutex<Vec<TopicSubscription>>,
}

#[derive(Debug, Default)]
struct Inner {
    entities: DashMap<String, Arc<Entity>>,
    journal: Journal,
    options: MemoryBrokerOptions,
    topics: DashMap<String, Arc<Topic>>,
}

/// An in-memory broker namespace. Clones share state.
#[derive(Clone, Debug, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    /// Creates an empty broker.
    #[must_use]
    pub fn new(options: MemoryBrokerOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                journal: Journal::with_capacity(options.journal_capacity),
                options,
                ..Inner::default()
            }),
        }
    }

    /// The operation journal.
    #[must_use]
    pub fn journal(&self) -> &Journal {
        &self.inner.journal
    }

    /// Names of all queues, sorted.
    #[must_use]
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .entities
            .iter()
            .filter(|entry| entry.value().is_queue)
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Messages waiting or locked in a queue or subscription.
    #[must_use]
    pub fn message_count(&self, source: &Source) -> usize {
        self.inner
            .entities
            .get(&source.path())
            .map_or(0, |entity| entity.message_count())
    }

    /// Messages dead-lettered from a queue or subscription.
    #[must_use]
    pub fn dead_letters(&self, source: &Source) -> Vec<BrokeredMessage> {
        self.inner
            .entities
            .get(&source.path())
            .map(|entity| entity.dead_letters())
            .unwrap_or_default()
    }

    fn entity(&self, path: &str) -> Result<Arc<Entity>, Error> {
        self.inner
            .entities
            .get(path)
            .map(|entity| Arc::clone(entity.value()))
            .ok_or_else(|| Error::EntityNotFound(path.to_string()))
    }

    fn enqueue(entity: &Arc<Entity>, message: BrokeredMessage) {
        let delay = message
            .scheduled_enqueue_time
            .and_then(|at| (at - Utc::now()).to_std().ok())
            .filter(|delay| !delay.is_zero());

        match delay {
            Some(delay) => {
                let entity = Arc::clone(entity);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    entity.push(message);
                });
            }
            None => entity.push(message),
        }
    }

    pub(crate) fn detach_consumer(&self, entity: &Arc<Entity>) {
        if entity.detach_consumer() > 0 {
            return;
        }

        let Some(idle) = entity.auto_delete_on_idle else {
            return;
        };

        let broker = self.clone();
        let entity = Arc::clone(entity);
        tokio::spawn(async move {
            tokio::time::sleep(idle).await;

            let removed = broker.inner.entities.remove_if(&entity.path, |_, current| {
                Arc::ptr_eq(current, &entity) && current.consumer_count() == 0
            });

            if removed.is_some() {
                debug!(queue = %entity.path, "deleted idle queue");
                broker.inner.journal.record(Operation::QueueDeleted {
                    queue: entity.path.clone(),
                });
            }
        });
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    type Error = Error;
    type Delivery = MemoryDelivery;
    type Consumer = MemoryConsumer;

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), Error> {
        let inner = &self.inner;

        inner.entities.entry(name.to_string()).or_insert_with(|| {
            debug!(queue = %name, "created queue");
            inner.journal.record(Operation::QueueCreated {
                queue: name.to_string(),
            });

            Arc::new(Entity::new(
                name.to_string(),
                true,
                inner.journal.clone(),
                inner.options.lock_duration,
                options
                    .max_delivery_count
                    .unwrap_or(inner.options.max_delivery_count),
                ReceiveMode::PeekLock,
                options.auto_delete_on_idle,
            ))
        });

        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<(), Error> {
        if self.inner.entities.remove(name).is_some() {
            self.inner.journal.record(Operation::QueueDeleted {
                queue: name.to_string(),
            });
        }

        Ok(())
    }

    async fn declare_topic(&self, name: &str, options: TopicOptions) -> Result<(), Error> {
        self.inner
            .topics
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(topic = %name, "created topic");
                Arc::new(Topic {
                    options,
                    seen_message_ids: Mutex::new(SeenMessageIds::default()),
                    subscriptions: Mutex::new(Vec::new()),
                })
            });

        Ok(())
    }

    async fn topic_exists(&self, name: &str) -> Result<bool, Error> {
        Ok(self.inner.topics.contains_key(name))
    }

    async fn declare_subscription(
        &self,
        topic: &str,
        name: &str,
        options: SubscriptionOptions,
    ) -> Result<(), Error> {
        let topic_entity = self
            .inner
            .topics
            .get(topic)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::TopicNotFound(topic.to_string()))?;

        let mut subscriptions = topic_entity.subscriptions.lock();
        if subscriptions.iter().any(|subscription| subscription.name == name) {
            return Ok(());
        }

        let path = Source::Subscription {
            topic: topic.to_string(),
            name: name.to_string(),
        }
        .path();

        let entity = Arc::new(Entity::new(
            path.clone(),
            false,
            self.inner.journal.clone(),
            self.inner.options.lock_duration,
            options
                .max_delivery_count
                .unwrap_or(self.inner.options.max_delivery_count),
            options.receive_mode,
            None,
        ));

        debug!(subscription = %path, filters = ?options.topics, "created subscription");
        self.inner.entities.insert(path, Arc::clone(&entity));
        subscriptions.push(TopicSubscription {
            entity,
            filters: options.topics,
            name: name.to_string(),
        });
        drop(subscriptions);

        Ok(())
    }

    async fn send(&self, destination: &str, message: BrokeredMessage) -> Result<(), Error> {
        if let Ok(entity) = self.entity(destination) {
            self.inner.journal.record(Operation::Sent {
                destination: destination.to_string(),
                message: message.clone(),
                at: Utc::now(),
            });
            Self::enqueue(&entity, message);
            return Ok(());
        }

        let topic = self
            .inner
            .topics
            .get(destination)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::EntityNotFound(destination.to_string()))?;

        if topic.options.requires_duplicate_detection
            && !topic.seen_message_ids.lock().insert(
                &message.message_id,
                self.inner.options.duplicate_detection_window,
            )
        {
            debug!(topic = %destination, message_id = %message.message_id, "dropped duplicate message");
            return Ok(());
        }

        self.inner.journal.record(Operation::Sent {
            destination: destination.to_string(),
            message: message.clone(),
            at: Utc::now(),
        });

        let topic_filter = message.property_str(TOPIC_PROPERTY);
        for subscription in topic.subscriptions.lock().iter() {
            if subscription.accepts(topic_filter.as_deref()) {
                Self::enqueue(&subscription.entity, message.clone());
            }
        }

        Ok(())
    }

    async fn on_message(
        &self,
        source: Source,
        options: OnMessageOptions,
        callback: MessageCallback<MemoryDelivery>,
    ) -> Result<MemoryConsumer, Error> {
        let entity = self.entity(&source.path())?;
        debug!(entity = %entity.path, ?options, "starting message pump");

        Ok(MemoryConsumer::start(
            self.clone(),
            entity,
            options,
            callback,
        ))
    }
}
