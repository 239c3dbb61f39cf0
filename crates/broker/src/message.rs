use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A user property value attached to a message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PropertyValue {
    /// A boolean flag.
    Bool(bool),

    /// A signed integer.
    Int(i64),

    /// A string.
    String(String),
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(value) => write!(f, "{value}"),
            Self::Int(value) => write!(f, "{value}"),
            Self::String(value) => f.write_str(value),
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i32> for PropertyValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u32> for PropertyValue {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

/// A message as carried by the broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokeredMessage {
    /// Broker-level identity of the message. Preserved across clones.
    pub message_id: String,

    /// Correlates a response with its request.
    pub correlation_id: Option<String>,

    /// Serialized payload.
    pub body: Bytes,

    /// Application properties.
    pub properties: HashMap<String, PropertyValue>,

    /// When set, the message only becomes visible at this instant.
    pub scheduled_enqueue_time: Option<DateTime<Utc>>,

    /// When set, the message expires this long after it was enqueued.
    pub time_to_live: Option<Duration>,
}

impl BrokeredMessage {
    /// Creates a message with a fresh message id.
    #[must_use]
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            correlation_id: None,
            body: body.into(),
            properties: HashMap::new(),
            scheduled_enqueue_time: None,
            time_to_live: None,
        }
    }

    /// Sets the message id.
    #[must_use]
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = message_id.into();
        self
    }

    /// Sets the correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Sets an application property, replacing any previous value.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Delays visibility until `at`.
    #[must_use]
    pub const fn with_scheduled_enqueue_time(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_enqueue_time = Some(at);
        self
    }

    /// Sets the time to live.
    #[must_use]
    pub const fn with_time_to_live(mut self, time_to_live: Duration) -> Self {
        self.time_to_live = Some(time_to_live);
        self
    }

    /// Raw property lookup.
    #[must_use]
    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(key)
    }

    /// Returns a property rendered as a string.
    #[must_use]
    pub fn property_str(&self, key: &str) -> Option<String> {
        self.properties.get(key).map(ToString::to_string)
    }

    /// Returns a property as an integer. String values are parsed.
    #[must_use]
    pub fn property_i64(&self, key: &str) -> Option<i64> {
        match self.properties.get(key)? {
            PropertyValue::Int(value) => Some(*value),
            PropertyValue::String(value) => value.trim().parse().ok(),
            PropertyValue::Bool(_) => None,
        }
    }

    /// Returns a property as a boolean. String values are parsed case-insensitively.
    #[must_use]
    pub fn property_bool(&self, key: &str) -> Option<bool> {
        match self.properties.get(key)? {
            PropertyValue::Bool(value) => Some(*value),
            PropertyValue::String(value) => {
                if value.eq_ignore_ascii_case("true") {
                    Some(true)
                } else if value.eq_ignore_ascii_case("false") {
                    Some(false)
                } else {
                    None
                }
            }
            PropertyValue::Int(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lenient_property_accessors() {
        let message = BrokeredMessage::new(Bytes::new())
            .with_property("Affinity", "7")
            .with_property("AffinityCycle", 2)
            .with_property("IsFaulted", "True")
            .with_property("Broken", "seven");

        assert_eq!(message.property_i64("Affinity"), Some(7));
        assert_eq!(message.property_i64("AffinityCycle"), Some(2));
        assert_eq!(message.property_bool("IsFaulted"), Some(true));
        assert_eq!(message.property_i64("Broken"), None);
        assert_eq!(message.property_i64("Missing"), None);
        assert_eq!(message.property_str("AffinityCycle").as_deref(), Some("2"));
    }

    #[test]
    fn test_clone_preserves_message_id() {
        let message = BrokeredMessage::new("body").with_correlation_id("abc");
        let copy = message.clone().with_property("AffinityCycle", 1);

        assert_eq!(copy.message_id, message.message_id);
        assert_eq!(copy.correlation_id.as_deref(), Some("abc"));
        assert_eq!(copy.body, message.body);
    }
}
