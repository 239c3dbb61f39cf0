use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use conduit_broker::BrokeredMessage;
use dashmap::DashMap;
use tokio::task::AbortHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// How a pending request ended.
#[derive(Debug)]
pub enum Outcome {
    /// A response with the request's correlation id arrived.
    Response(BrokeredMessage),

    /// The timer fired first.
    TimedOut,
}

/// Invoked exactly once with the outcome of a request.
pub type ResponseAction = Box<dyn FnOnce(Outcome) + Send + Sync>;

struct PendingRequest {
    on_response: ResponseAction,
    response_type: &'static str,
    timeout: Option<AbortHandle>,
}

/// In-flight requests keyed by correlation id.
///
/// Whoever removes an entry owns its [`ResponseAction`], so a request resolves
/// at most once no matter how a response and its timeout race.
#[derive(Clone, Default)]
pub struct PendingRequests {
    requests: Arc<DashMap<Uuid, PendingRequest>>,
}

impl fmt::Debug for PendingRequests {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequests")
            .field("len", &self.requests.len())
            .finish()
    }
}

impl PendingRequests {
    /// Registers a request and arms its timeout.
    pub fn register(
        &self,
        correlation_id: Uuid,
        response_type: &'static str,
        on_response: ResponseAction,
        timeout: Duration,
    ) {
        self.requests.insert(
            correlation_id,
            PendingRequest {
                on_response,
                response_type,
                timeout: None,
            },
        );

        let requests = self.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            requests.time_out(correlation_id);
        });

        match self.requests.get_mut(&correlation_id) {
            Some(mut pending) => pending.timeout = Some(timer.abort_handle()),
            None => timer.abort(),
        }
    }

    fn time_out(&self, correlation_id: Uuid) {
        if let Some((_, pending)) = self.requests.remove(&correlation_id) {
            warn!(%correlation_id, response_type = pending.response_type, "request timed out");
            (pending.on_response)(Outcome::TimedOut);
        }
    }

    /// Routes a response to its request. Returns `false` if no request was waiting.
    pub fn resolve(&self, message: BrokeredMessage) -> bool {
        let Some(correlation_id) = message
            .correlation_id
            .as_deref()
            .and_then(|id| Uuid::parse_str(id).ok())
        else {
            debug!(message_id = %message.message_id, "dropping response without a valid correlation id");
            return false;
        };

        let Some((_, pending)) = self.requests.remove(&correlation_id) else {
            debug!(%correlation_id, "dropping response with no pending request");
            return false;
        };

        if let Some(timeout) = pending.timeout {
            timeout.abort();
        }

        debug!(%correlation_id, response_type = pending.response_type, "received response");
        (pending.on_response)(Outcome::Response(message));
        true
    }

    /// Forgets a request without resolving it.
    pub fn cancel(&self, correlation_id: Uuid) {
        if let Some((_, pending)) = self.requests.remove(&correlation_id) {
            if let Some(timeout) = pending.timeout {
                timeout.abort();
            }
        }
    }

    /// Number of requests still waiting.
    pub fn len(&self) -> usize {
        self.requests.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::oneshot;

    fn response_for(correlation_id: Uuid) -> BrokeredMessage {
        BrokeredMessage::new("pong").with_correlation_id(correlation_id.to_string())
    }

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn test_pending_requests_can_cross_tasks() {
        assert_send_sync::<PendingRequests>();
        assert_send_sync::<ResponseAction>();
    }

    #[tokio::test]
    async fn test_response_resolves_once() {
        let pending = PendingRequests::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let correlation_id = Uuid::new_v4();

        let counter = Arc::clone(&calls);
        pending.register(
            correlation_id,
            "Pong",
            Box::new(move |outcome| {
                assert!(matches!(outcome, Outcome::Response(_)));
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            Duration::from_secs(30),
        );

        assert!(pending.resolve(response_for(correlation_id)));
        assert!(!pending.resolve(response_for(correlation_id)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_late_response_is_dropped() {
        let pending = PendingRequests::default();
        let correlation_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();

        pending.register(
            correlation_id,
            "Pong",
            Box::new(move |outcome| {
                let _ = tx.send(matches!(outcome, Outcome::TimedOut));
            }),
            Duration::from_secs(1),
        );

        assert!(rx.await.unwrap());
        assert_eq!(pending.len(), 0);
        assert!(!pending.resolve(response_for(correlation_id)));
    }

    #[tokio::test]
    async fn test_cancel_drops_action() {
        let pending = PendingRequests::default();
        let correlation_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel::<()>();

        pending.register(
            correlation_id,
            "Pong",
            Box::new(move |_| {
                let _ = tx.send(());
            }),
            Duration::from_secs(30),
        );
        pending.cancel(correlation_id);

        assert!(rx.await.is_err());
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test]
    async fn test_unparseable_correlation_id_is_ignored() {
        let pending = PendingRequests::default();

        assert!(!pending.resolve(BrokeredMessage::new("x").with_correlation_id("not-a-uuid")));
        assert!(!pending.resolve(BrokeredMessage::new("x")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_response_and_timeout_resolve_at_most_once() {
        for _ in 0..200 {
            let pending = PendingRequests::default();
            let calls = Arc::new(AtomicUsize::new(0));
            let correlation_id = Uuid::new_v4();

            let counter = Arc::clone(&calls);
            pending.register(
                correlation_id,
                "Pong",
                Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
                Duration::from_millis(1),
            );

            let racer = pending.clone();
            let response = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(1)).await;
                racer.resolve(response_for(correlation_id));
            });
            response.await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;

            assert_eq!(calls.load(Ordering::SeqCst), 1);
            assert_eq!(pending.len(), 0);
        }
    }
}
