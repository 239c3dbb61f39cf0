use std::time::Duration;

use conduit_broker::{BrokerError, Delivery};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, warn};

/// What a renewal loop did before it stopped.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RenewalSummary {
    /// Successful renewals.
    pub renewals: u32,

    /// Renewals which failed for reasons other than a lost lock.
    pub failures: u32,

    /// The loop stopped because the lock was gone.
    pub lock_lost: bool,
}

/// Keeps the peek lock on a delivery alive while its handler runs.
///
/// Renewal happens once per period, starting one period after [`start`](Self::start).
/// A zero period disables renewal.
/// Call [`stop`](Self::stop) before settling the delivery; once it returns no
/// further renewal is attempted. Dropping the supervisor also cancels it.
#[derive(Debug)]
pub struct LockRenewal {
    _cancel_on_drop: DropGuard,
    handle: JoinHandle<RenewalSummary>,
    shutdown_token: CancellationToken,
}

impl LockRenewal {
    /// Spawns the renewal loop.
    pub fn start<D: Delivery>(delivery: D, period: Duration) -> Self {
        let shutdown_token = CancellationToken::new();
        let handle = tokio::spawn(renew(delivery, period, shutdown_token.clone()));

        Self {
            _cancel_on_drop: shutdown_token.clone().drop_guard(),
            handle,
            shutdown_token,
        }
    }

    /// Cancels the loop and waits for any renewal in flight to finish.
    pub async fn stop(self) -> RenewalSummary {
        self.shutdown_token.cancel();

        match self.handle.await {
            Ok(summary) => summary,
            Err(error) => {
                error!(%error, "lock renewal task failed");
                RenewalSummary::default()
            }
        }
    }
}

async fn renew<D: Delivery>(
    delivery: D,
    period: Duration,
    shutdown_token: CancellationToken,
) -> RenewalSummary {
    if period.is_zero() {
        warn!(message_id = %delivery.message().message_id, "lock renewal period is zero, not renewing");
        shutdown_token.cancelled().await;
        return RenewalSummary::default();
    }

    // A period past the end of the clock never ticks.
    let Some(first_tick) = Instant::now().checked_add(period) else {
        shutdown_token.cancelled().await;
        return RenewalSummary::default();
    };

    let mut summary = RenewalSummary::default();
    let mut interval = tokio::time::interval_at(first_tick, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = shutdown_token.cancelled() => break,
            _ = interval.tick() => {}
        }

        let message_id = &delivery.message().message_id;
        match delivery.renew_lock().await {
            Ok(()) => {
                summary.renewals += 1;
                debug!(%message_id, "renewed message lock");
            }
            Err(error) if error.is_lock_lost() => {
                debug!(%message_id, "message lock lost, stopping renewal");
                summary.lock_lost = true;
                break;
            }
            Err(error) => {
                summary.failures += 1;
                error!(%message_id, %error, "failed to renew message lock");
            }
        }
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use conduit_broker::BrokeredMessage;

    #[derive(Debug, thiserror::Error)]
    enum FakeError {
        #[error("lock lost")]
        LockLost,
        #[error("broker busy")]
        Busy,
    }

    impl BrokerError for FakeError {
        fn is_lock_lost(&self) -> bool {
            matches!(self, Self::LockLost)
        }
    }

    /// Results for successive renew calls. Exhausted means success.
    #[derive(Clone, Debug)]
    struct FakeDelivery {
        message: BrokeredMessage,
        renewals: Arc<AtomicU32>,
        script: Arc<Mutex<VecDeque<Result<(), FakeError>>>>,
    }

    impl FakeDelivery {
        fn new(results: Vec<Result<(), FakeError>>) -> Self {
            Self {
                message: BrokeredMessage::new("payload"),
                renewals: Arc::new(AtomicU32::new(0)),
                script: Arc::new(Mutex::new(results.into())),
            }
        }

        fn attempts(&self) -> u32 {
            self.renewals.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Delivery for FakeDelivery {
        type Error = FakeError;

        fn message(&self) -> &BrokeredMessage {
            &self.message
        }

        fn delivery_count(&self) -> u32 {
            1
        }

        async fn renew_lock(&self) -> Result<(), FakeError> {
            self.renewals.fetch_add(1, Ordering::SeqCst);
            self.script.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }

        async fn complete(&self) -> Result<(), FakeError> {
            Ok(())
        }

        async fn abandon(&self) -> Result<(), FakeError> {
            Ok(())
        }

        async fn dead_letter(&self, _reason: &str) -> Result<(), FakeError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_renews_once_per_period() {
        let delivery = FakeDelivery::new(Vec::new());
        let renewal = LockRenewal::start(delivery.clone(), Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(delivery.attempts(), 0);

        tokio::time::sleep(Duration::from_secs(30)).await;
        let summary = renewal.stop().await;

        assert_eq!(summary.renewals, 3);
        assert_eq!(summary.failures, 0);
        assert!(!summary.lock_lost);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_lost_stops_silently() {
        let delivery = FakeDelivery::new(vec![Ok(()), Err(FakeError::LockLost)]);
        let renewal = LockRenewal::start(delivery.clone(), Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(delivery.attempts(), 2);

        let summary = renewal.stop().await;
        assert_eq!(summary.renewals, 1);
        assert!(summary.lock_lost);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_errors_keep_renewing() {
        let delivery = FakeDelivery::new(vec![Err(FakeError::Busy), Err(FakeError::Busy)]);
        let renewal = LockRenewal::start(delivery.clone(), Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(45)).await;
        let summary = renewal.stop().await;

        assert_eq!(summary.failures, 2);
        assert_eq!(summary.renewals, 2);
        assert!(!summary.lock_lost);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_renewal_after_stop() {
        let delivery = FakeDelivery::new(Vec::new());
        let renewal = LockRenewal::start(delivery.clone(), Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(15)).await;
        renewal.stop().await;
        let attempts = delivery.attempts();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(delivery.attempts(), attempts);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_period_disables_renewal() {
        let delivery = FakeDelivery::new(Vec::new());
        let renewal = LockRenewal::start(delivery.clone(), Duration::ZERO);

        tokio::time::sleep(Duration::from_secs(60)).await;
        let summary = renewal.stop().await;

        assert_eq!(summary, RenewalSummary::default());
        assert_eq!(delivery.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_period_never_renews() {
        let delivery = FakeDelivery::new(Vec::new());
        let renewal = LockRenewal::start(delivery.clone(), Duration::MAX);

        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(renewal.stop().await, RenewalSummary::default());
        assert_eq!(delivery.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels_renewal() {
        let delivery = FakeDelivery::new(Vec::new());
        drop(LockRenewal::start(delivery.clone(), Duration::from_secs(10)));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(delivery.attempts(), 0);
    }
}
