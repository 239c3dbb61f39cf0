use std::fmt;
use std::time::Duration;

/// Property consulted by subscription filters.
pub const TOPIC_PROPERTY: &str = "topic";

/// Options for declaring a queue.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Delete the queue once it has had no consumers for this long.
    pub auto_delete_on_idle: Option<Duration>,

    /// Messages delivered more than this many times are dead-lettered.
    pub max_delivery_count: Option<u32>,
}

impl QueueOptions {
    /// Sets the idle period after which the queue is deleted.
    #[must_use]
    pub const fn with_auto_delete_on_idle(mut self, idle: Duration) -> Self {
        self.auto_delete_on_idle = Some(idle);
        self
    }
}

/// Options for declaring a topic.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TopicOptions {
    /// Drop messages whose id has already been seen on this topic.
    pub requires_duplicate_detection: bool,
}

/// How deliveries from a subscription are settled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReceiveMode {
    /// Messages are locked on receive and must be completed, abandoned or dead-lettered.
    #[default]
    PeekLock,

    /// Messages are removed on receive; settlement is a no-op.
    ReceiveAndDelete,
}

/// Options for declaring a subscription.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubscriptionOptions {
    /// Only forward messages whose [`TOPIC_PROPERTY`] is one of these. Empty forwards everything.
    pub topics: Vec<String>,

    /// Settlement mode.
    pub receive_mode: ReceiveMode,

    /// Messages delivered more than this many times are dead-lettered.
    pub max_delivery_count: Option<u32>,
}

/// Where a consumer receives messages from.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Source {
    /// A queue.
    Queue(String),

    /// A subscription on a topic.
    Subscription {
        /// The topic name.
        topic: String,

        /// The subscription name.
        name: String,
    },
}

impl Source {
    /// Entity path used in logs and by brokers as a key.
    #[must_use]
    pub fn path(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queue(name) => f.write_str(name),
            Self::Subscription { topic, name } => write!(f, "{topic}/subscriptions/{name}"),
        }
    }
}

/// Options for a message pump.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OnMessageOptions {
    /// Complete deliveries the callback left unsettled.
    pub auto_complete: bool,

    /// Upper bound on callbacks running at once.
    pub max_concurrent_calls: usize,
}

impl Default for OnMessageOptions {
    fn default() -> Self {
        Self {
            auto_complete: false,
            max_concurrent_calls: 1,
        }
    }
}
