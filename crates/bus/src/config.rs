use crate::error::Error;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use conduit_broker::ReceiveMode;

/// Longest RPC timeout a connection accepts.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Settings shared by every operation on a bus.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionConfiguration {
    /// Interval a client-side batch may be held before sending.
    pub batching_interval: Duration,

    /// The raw connection string, including keys the bus does not interpret.
    pub connection_string: String,

    /// Upper bound on concurrently running callbacks per consumer.
    pub max_concurrent_calls: usize,

    /// Messages a receiver may fetch ahead of processing.
    pub prefetch_count: u32,

    /// Default RPC timeout.
    pub timeout: Duration,
}

impl Default for ConnectionConfiguration {
    fn default() -> Self {
        Self {
            batching_interval: Duration::from_millis(20),
            connection_string: String::new(),
            max_concurrent_calls: 1,
            prefetch_count: 0,
            timeout: Duration::from_secs(30),
        }
    }
}

impl ConnectionConfiguration {
    /// Sets the default RPC timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the per-consumer concurrency limit.
    #[must_use]
    pub const fn with_max_concurrent_calls(mut self, max_concurrent_calls: usize) -> Self {
        self.max_concurrent_calls = max_concurrent_calls;
        self
    }

    /// Checks the values are usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConnectionString`] for a zero timeout, a timeout
    /// above [`MAX_TIMEOUT`] or zero concurrency.
    pub fn validate(&self) -> Result<(), Error> {
        if self.timeout.is_zero() {
            return Err(Error::InvalidConnectionString(
                "Timeout must be greater than zero".to_string(),
            ));
        }

        if self.timeout > MAX_TIMEOUT {
            return Err(Error::InvalidConnectionString(format!(
                "Timeout must not exceed {} seconds",
                MAX_TIMEOUT.as_secs()
            )));
        }

        if self.max_concurrent_calls == 0 {
            return Err(Error::InvalidConnectionString(
                "MaxConcurrentCalls must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T, Error> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::InvalidConnectionString(format!("{key} is not a number: '{value}'")))
}

/// Parses `Key=Value;` pairs.
///
/// `Timeout` is in seconds and `BatchingInterval` in milliseconds. Keys are
/// case-insensitive; unknown keys (endpoints, credentials) are kept in
/// [`connection_string`](ConnectionConfiguration::connection_string) only.
impl FromStr for ConnectionConfiguration {
    type Err = Error;

    fn from_str(connection_string: &str) -> Result<Self, Error> {
        let mut configuration = Self {
            connection_string: connection_string.to_string(),
            ..Self::default()
        };

        for pair in connection_string.split(';') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }

            let (key, value) = pair.split_once('=').ok_or_else(|| {
                Error::InvalidConnectionString(format!("expected Key=Value, found '{pair}'"))
            })?;
            let key = key.trim();

            match key.to_ascii_lowercase().as_str() {
                "timeout" => {
                    configuration.timeout = Duration::from_secs(parse_number(key, value)?);
                }
                "prefetchcount" => configuration.prefetch_count = parse_number(key, value)?,
                "maxconcurrentcalls" => {
                    configuration.max_concurrent_calls = parse_number(key, value)?;
                }
                "batchinginterval" => {
                    configuration.batching_interval =
                        Duration::from_millis(parse_number(key, value)?);
                }
                _ => {}
            }
        }

        configuration.validate()?;
        Ok(configuration)
    }
}

/// Per-request options.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RequestConfiguration {
    /// Partition tag matched against responders' affinity resolvers.
    pub affinity: Option<i32>,

    /// Overrides [`ConnectionConfiguration::timeout`].
    pub timeout: Option<Duration>,
}

impl RequestConfiguration {
    /// Tags the request with an affinity.
    #[must_use]
    pub const fn with_affinity(mut self, affinity: i32) -> Self {
        self.affinity = Some(affinity);
        self
    }

    /// Overrides the timeout for this request.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Decides whether a responder serves an affinity tag.
pub type AffinityResolver = Arc<dyn Fn(i32) -> bool + Send + Sync>;

/// Per-responder options.
#[derive(Clone)]
pub struct RespondConfiguration {
    /// Without a resolver every request is processed.
    pub affinity_resolver: Option<AffinityResolver>,

    /// How often the lock on a request is renewed while its handler runs.
    pub lock_renewal_interval: Duration,

    /// Delay before a requeued request becomes visible again.
    pub requeue_delay: Duration,
}

impl Default for RespondConfiguration {
    fn default() -> Self {
        Self {
            affinity_resolver: None,
            lock_renewal_interval: Duration::from_secs(10),
            requeue_delay: Duration::from_secs(5),
        }
    }
}

impl fmt::Debug for RespondConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RespondConfiguration")
            .field("affinity_resolver", &self.affinity_resolver.is_some())
            .field("lock_renewal_interval", &self.lock_renewal_interval)
            .field("requeue_delay", &self.requeue_delay)
            .finish()
    }
}

impl RespondConfiguration {
    /// Only process requests whose affinity satisfies `resolver`.
    #[must_use]
    pub fn with_affinity_resolver(
        mut self,
        resolver: impl Fn(i32) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.affinity_resolver = Some(Arc::new(resolver));
        self
    }

    /// Sets the requeue delay.
    #[must_use]
    pub const fn with_requeue_delay(mut self, requeue_delay: Duration) -> Self {
        self.requeue_delay = requeue_delay;
        self
    }

    /// Sets the lock renewal interval. Zero disables renewal.
    #[must_use]
    pub const fn with_lock_renewal_interval(mut self, interval: Duration) -> Self {
        self.lock_renewal_interval = interval;
        self
    }
}

/// Per-subscriber options.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionConfiguration {
    /// How often the lock on a message is renewed while its handler runs.
    pub lock_renewal_interval: Duration,

    /// Deliveries after which a message is dead-lettered. `None` uses the broker default.
    pub max_delivery_count: Option<u32>,

    /// Settlement mode.
    pub receive_mode: ReceiveMode,

    /// Drop republished messages with a message id already seen.
    pub requires_duplicate_detection: bool,

    /// Subscription name. Subscribers sharing a name compete for messages.
    pub subscription: String,

    /// Topic filters. Empty receives every message published for the type.
    pub topics: Vec<String>,
}

impl Default for SubscriptionConfiguration {
    fn default() -> Self {
        Self {
            lock_renewal_interval: Duration::from_secs(30),
            max_delivery_count: None,
            receive_mode: ReceiveMode::PeekLock,
            requires_duplicate_detection: false,
            subscription: "Default".to_string(),
            topics: Vec::new(),
        }
    }
}

impl SubscriptionConfiguration {
    /// Sets the subscription name.
    #[must_use]
    pub fn with_subscription(mut self, subscription: impl Into<String>) -> Self {
        self.subscription = subscription.into();
        self
    }

    /// Adds a topic filter.
    #[must_use]
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topics.push(topic.into());
        self
    }

    /// Sets the receive mode.
    #[must_use]
    pub const fn with_receive_mode(mut self, receive_mode: ReceiveMode) -> Self {
        self.receive_mode = receive_mode;
        self
    }

    /// Enables duplicate detection on the topic.
    #[must_use]
    pub const fn with_duplicate_detection(mut self) -> Self {
        self.requires_duplicate_detection = true;
        self
    }

    /// Sets the max delivery count.
    #[must_use]
    pub const fn with_max_delivery_count(mut self, max_delivery_count: u32) -> Self {
        self.max_delivery_count = Some(max_delivery_count);
        self
    }

    /// Sets the lock renewal interval. Zero disables renewal.
    #[must_use]
    pub const fn with_lock_renewal_interval(mut self, interval: Duration) -> Self {
        self.lock_renewal_interval = interval;
        self
    }
}

/// Per-publish options.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PublishConfiguration {
    /// Broker message id, used for duplicate detection.
    pub message_id: Option<String>,

    /// Do not deliver before this instant.
    pub scheduled_enqueue_time: Option<DateTime<Utc>>,

    /// `topic` filter value. Defaults to the topic naming convention.
    pub topic: Option<String>,
}

impl PublishConfiguration {
    /// Sets the message id.
    #[must_use]
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    /// Sets the topic filter value.
    #[must_use]
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Schedules delivery.
    #[must_use]
    pub const fn with_scheduled_enqueue_time(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_enqueue_time = Some(at);
        self
    }
}
