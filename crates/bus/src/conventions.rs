use crate::error::Error;
use crate::serializer::TypeNameSerializer;

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

/// Maps a serialized type name to an entity name.
pub type TypeNaming = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Generates a fresh return queue name.
pub type ReturnQueueNaming = Arc<dyn Fn() -> String + Send + Sync>;

/// Prefix of generated return queue names.
pub const RETURN_QUEUE_PREFIX: &str = "conduit.response.";

/// Naming rules for topics, queues and RPC routing.
///
/// Every rule receives the [`TypeNameSerializer`] name of the message type.
#[derive(Clone)]
pub struct Conventions {
    queue_naming: TypeNaming,
    rpc_return_queue_naming: ReturnQueueNaming,
    rpc_routing_key_naming: TypeNaming,
    topic_naming: TypeNaming,
}

impl Default for Conventions {
    fn default() -> Self {
        Self {
            queue_naming: Arc::new(str::to_string),
            rpc_return_queue_naming: Arc::new(|| format!("{RETURN_QUEUE_PREFIX}{}", Uuid::new_v4())),
            rpc_routing_key_naming: Arc::new(str::to_string),
            topic_naming: Arc::new(|_: &str| String::new()),
        }
    }
}

impl fmt::Debug for Conventions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conventions").finish_non_exhaustive()
    }
}

impl Conventions {
    /// Overrides the queue (and publish topic entity) naming rule.
    #[must_use]
    pub fn with_queue_naming(mut self, rule: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        self.queue_naming = Arc::new(rule);
        self
    }

    /// Overrides the default `topic` filter value for published messages.
    #[must_use]
    pub fn with_topic_naming(mut self, rule: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        self.topic_naming = Arc::new(rule);
        self
    }

    /// Overrides the request queue naming rule.
    #[must_use]
    pub fn with_rpc_routing_key_naming(
        mut self,
        rule: impl Fn(&str) -> String + Send + Sync + 'static,
    ) -> Self {
        self.rpc_routing_key_naming = Arc::new(rule);
        self
    }

    /// Overrides the return queue naming rule.
    #[must_use]
    pub fn with_rpc_return_queue_naming(
        mut self,
        rule: impl Fn() -> String + Send + Sync + 'static,
    ) -> Self {
        self.rpc_return_queue_naming = Arc::new(rule);
        self
    }

    /// Entity name for messages of type `T`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TypeName`] if the type name is too long.
    pub fn queue_name<T: ?Sized + 'static>(&self) -> Result<String, Error> {
        Ok((self.queue_naming)(&TypeNameSerializer::serialize::<T>()?))
    }

    /// Default `topic` filter value for messages of type `T`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TypeName`] if the type name is too long.
    pub fn topic_name<T: ?Sized + 'static>(&self) -> Result<String, Error> {
        Ok((self.topic_naming)(&TypeNameSerializer::serialize::<T>()?))
    }

    /// Request queue for requests of type `T`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TypeName`] if the type name is too long.
    pub fn rpc_routing_key<T: ?Sized + 'static>(&self) -> Result<String, Error> {
        Ok((self.rpc_routing_key_naming)(&TypeNameSerializer::serialize::<T>()?))
    }

    /// A new, unique return queue name.
    #[must_use]
    pub fn rpc_return_queue_name(&self) -> String {
        (self.rpc_return_queue_naming)()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ping;

    #[test]
    fn test_defaults() {
        let conventions = Conventions::default();

        let queue = conventions.queue_name::<Ping>().unwrap();
        assert!(queue.ends_with("conventions.tests.Ping"));
        assert_eq!(conventions.rpc_routing_key::<Ping>().unwrap(), queue);
        assert_eq!(conventions.topic_name::<Ping>().unwrap(), "");

        let first = conventions.rpc_return_queue_name();
        let second = conventions.rpc_return_queue_name();
        assert!(first.starts_with(RETURN_QUEUE_PREFIX));
        assert_ne!(first, second);
    }

    #[test]
    fn test_overrides() {
        let conventions = Conventions::default()
            .with_queue_naming(|name| format!("q.{}", name.rsplit('.').next().unwrap_or(name)))
            .with_topic_naming(|_| "pings".to_string())
            .with_rpc_routing_key_naming(|name| format!("rpc.{}", name.len()))
            .with_rpc_return_queue_naming(|| "replies".to_string());

        assert_eq!(conventions.queue_name::<Ping>().unwrap(), "q.Ping");
        assert_eq!(conventions.topic_name::<Ping>().unwrap(), "pings");
        assert!(conventions.rpc_routing_key::<Ping>().unwrap().starts_with("rpc."));
        assert_eq!(conventions.rpc_return_queue_name(), "replies");
    }
}
