use crate::error::Error;
use crate::journal::{Journal, Operation};

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use conduit_broker::{BrokeredMessage, PropertyValue, ReceiveMode};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Property set on dead-lettered messages.
pub const DEAD_LETTER_REASON_PROPERTY: &str = "DeadLetterReason";

const MAX_DELIVERY_COUNT_EXCEEDED: &str = "MaxDeliveryCountExceeded";

#[derive(Clone, Debug)]
struct Stored {
    delivery_count: u32,
    expires_at: Option<Instant>,
    message: BrokeredMessage,
}

#[derive(Debug)]
struct Locked {
    locked_until: Instant,
    stored: Stored,
}

#[derive(Debug, Default)]
struct State {
    consumers: usize,
    dead_letters: Vec<BrokeredMessage>,
    locked: HashMap<Uuid, Locked>,
    ready: VecDeque<Stored>,
}

/// A message taken off an entity.
#[derive(Debug)]
pub struct Received {
    pub delivery_count: u32,
    pub lock_token: Option<Uuid>,
    pub message: BrokeredMessage,
}

/// Storage shared by queues and subscriptions.
#[derive(Debug)]
pub struct Entity {
    pub auto_delete_on_idle: Option<Duration>,
    pub is_queue: bool,
    journal: Journal,
    lock_duration: Duration,
    max_delivery_count: u32,
    notify: Notify,
    pub path: String,
    receive_mode: ReceiveMode,
    state: Mutex<State>,
}

impl Entity {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        path: String,
        is_queue: bool,
        journal: Journal,
        lock_duration: Duration,
        max_delivery_count: u32,
        receive_mode: ReceiveMode,
        auto_delete_on_idle: Option<Duration>,
    ) -> Self {
        Self {
            auto_delete_on_idle,
            is_queue,
            journal,
            lock_duration,
            max_delivery_count,
            notify: Notify::new(),
            path,
            receive_mode,
            state: Mutex::new(State::default()),
        }
    }

    pub fn push(&self, message: BrokeredMessage) {
        // A time to live past the end of the clock never expires.
        let expires_at = message
            .time_to_live
            .and_then(|ttl| Instant::now().checked_add(ttl));
        self.state.lock().ready.push_back(Stored {
            delivery_count: 0,
            expires_at,
            message,
        });
        self.notify.notify_waiters();
    }

    pub fn message_count(&self) -> usize {
        let state = self.state.lock();
        state.ready.len() + state.locked.len()
    }

    pub fn dead_letters(&self) -> Vec<BrokeredMessage> {
        self.state.lock().dead_letters.clone()
    }

    pub fn attach_consumer(&self) {
        self.state.lock().consumers += 1;
    }

    /// Returns the number of consumers still attached.
    pub fn detach_consumer(&self) -> usize {
        let mut state = self.state.lock();
        state.consumers = state.consumers.saturating_sub(1);
        state.consumers
    }

    pub fn consumer_count(&self) -> usize {
        self.state.lock().consumers
    }

    /// Waits for the next visible message. Returns `None` once `shutdown_token` is cancelled.
    pub async fn receive(self: &Arc<Self>, shutdown_token: &CancellationToken) -> Option<Received> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(received) = self.try_receive() {
                return Some(received);
            }

            tokio::select! {
                biased;
                () = shutdown_token.cancelled() => return None,
                () = &mut notified => {}
            }
        }
    }

    fn try_receive(self: &Arc<Self>) -> Option<Received> {
        let now = Instant::now();
        let mut state = self.state.lock();

        while let Some(mut stored) = state.ready.pop_front() {
            if stored.expires_at.is_some_and(|at| at <= now) {
                debug!(entity = %self.path, message_id = %stored.message.message_id, "message expired");
                continue;
            }

            if stored.delivery_count >= self.max_delivery_count {
                let message = self.mark_dead_lettered(stored.message, MAX_DELIVERY_COUNT_EXCEEDED);
                state.dead_letters.push(message);
                continue;
            }

            stored.delivery_count += 1;
            self.journal.record(Operation::Received {
                entity: self.path.clone(),
                message_id: stored.message.message_id.clone(),
                delivery_count: stored.delivery_count,
                at: Utc::now(),
            });

            let delivery_count = stored.delivery_count;
            let message = stored.message.clone();

            let lock_token = match self.receive_mode {
                ReceiveMode::ReceiveAndDelete => None,
                ReceiveMode::PeekLock => {
                    let lock_token = Uuid::new_v4();
                    state.locked.insert(
                        lock_token,
                        Locked {
                            locked_until: now + self.lock_duration,
                            stored,
                        },
                    );
                    Some(lock_token)
                }
            };
            drop(state);

            if let Some(lock_token) = lock_token {
                self.watch_lock(lock_token);
            }

            return Some(Received {
                delivery_count,
                lock_token,
                message,
            });
        }

        None
    }

    /// Puts the message back once its lock expires, unless it was settled or renewed first.
    fn watch_lock(self: &Arc<Self>, lock_token: Uuid) {
        let entity = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                let Some(locked_until) = entity
                    .state
                    .lock()
                    .locked
                    .get(&lock_token)
                    .map(|locked| locked.locked_until)
                else {
                    return;
                };

                tokio::time::sleep_until(locked_until).await;

                let mut state = entity.state.lock();
                let expired = state
                    .locked
                    .get(&lock_token)
                    .is_none_or(|locked| locked.locked_until <= Instant::now());
                if expired {
                    entity.expire(&mut state, lock_token);
                    return;
                }
                drop(state);
            }
        });
    }

    fn expire(&self, state: &mut State, lock_token: Uuid) {
        if let Some(locked) = state.locked.remove(&lock_token) {
            self.journal.record(Operation::LockExpired {
                entity: self.path.clone(),
                message_id: locked.stored.message.message_id.clone(),
            });
            state.ready.push_front(locked.stored);
            self.notify.notify_waiters();
        }
    }

    fn take_lock(&self, state: &mut State, lock_token: Uuid) -> Result<Stored, Error> {
        let locked_until = state
            .locked
            .get(&lock_token)
            .map(|locked| locked.locked_until)
            .ok_or(Error::LockLost)?;

        if locked_until <= Instant::now() {
            self.expire(state, lock_token);
            return Err(Error::LockLost);
        }

        state
            .locked
            .remove(&lock_token)
            .map(|locked| locked.stored)
            .ok_or(Error::LockLost)
    }

    fn mark_dead_lettered(&self, mut message: BrokeredMessage, reason: &str) -> BrokeredMessage {
        self.journal.record(Operation::DeadLettered {
            entity: self.path.clone(),
            message_id: message.message_id.clone(),
            reason: reason.to_string(),
            at: Utc::now(),
        });
        message.properties.insert(
            DEAD_LETTER_REASON_PROPERTY.to_string(),
            PropertyValue::from(reason),
        );
        message
    }

    pub fn renew_lock(&self, lock_token: Uuid) -> Result<(), Error> {
        let mut state = self.state.lock();
        let now = Instant::now();

        match state.locked.get_mut(&lock_token) {
            Some(locked) if locked.locked_until > now => {
                locked.locked_until = now + self.lock_duration;
                self.journal.record(Operation::LockRenewed {
                    entity: self.path.clone(),
                    message_id: locked.stored.message.message_id.clone(),
                    at: Utc::now(),
                });
                Ok(())
            }
            Some(_) => {
                self.expire(&mut state, lock_token);
                Err(Error::LockLost)
            }
            None => Err(Error::LockLost),
        }
    }

    pub fn complete(&self, lock_token: Uuid) -> Result<(), Error> {
        let mut state = self.state.lock();
        let stored = self.take_lock(&mut state, lock_token)?;
        self.journal.record(Operation::Completed {
            entity: self.path.clone(),
            message_id: stored.message.message_id,
            at: Utc::now(),
        });
        Ok(())
    }

    pub fn abandon(&self, lock_token: Uuid) -> Result<(), Error> {
        let mut state = self.state.lock();
        let stored = self.take_lock(&mut state, lock_token)?;
        self.journal.record(Operation::Abandoned {
            entity: self.path.clone(),
            message_id: stored.message.message_id.clone(),
            at: Utc::now(),
        });
        state.ready.push_front(stored);
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    pub fn dead_letter(&self, lock_token: Uuid, reason: &str) -> Result<(), Error> {
        let mut state = self.state.lock();
        let stored = self.take_lock(&mut state, lock_token)?;
        let message = self.mark_dead_lettered(stored.message, reason);
        state.dead_letters.push(message);
        Ok(())
    }
}
