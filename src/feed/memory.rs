//! In-memory hazard feed.
//!
//! Thread-safe reference implementation of `HazardFeed`, intended for
//! embedding, tests, and the relay binary. Notifications are pushed to each
//! subscription's bounded channel while the append lock is held, which keeps
//! per-subscription delivery in append order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Sender, TrySendError};

use crate::error::FeedError;
use crate::event::{AppendNotification, HazardEvent, HazardEventId, NewHazard};
use crate::feed::traits::{FeedSubscription, HazardFeed, SubscriptionId};
use crate::time::{Clock, SystemClock};

/// Default per-subscription buffer.
pub const DEFAULT_SUBSCRIPTION_CAPACITY: usize = 1024;

fn lock_err(context: &'static str) -> FeedError {
    FeedError::Backend(format!("poisoned lock: {context}"))
}

#[derive(Debug, Default)]
struct FeedState {
    events: Vec<HazardEvent>,
    by_id: HashMap<HazardEventId, usize>,
    subscribers: HashMap<SubscriptionId, Sender<AppendNotification>>,
    accepting_subscriptions: bool,
    /// Latest instant handed out by `now()`.
    issued: Option<DateTime<Utc>>,
}

impl FeedState {
    fn last_created_at(&self) -> Option<DateTime<Utc>> {
        self.events.last().map(|e| e.created_at)
    }

    /// Earliest instant strictly after every stamped event.
    fn after_last(&self) -> Option<DateTime<Utc>> {
        self.last_created_at()
            .map(|last| last + chrono::Duration::milliseconds(1))
    }
}

fn latest(a: DateTime<Utc>, b: Option<DateTime<Utc>>) -> DateTime<Utc> {
    match b {
        Some(b) if b > a => b,
        _ => a,
    }
}

/// In-memory append-only feed.
pub struct InMemoryHazardFeed {
    clock: Arc<dyn Clock>,
    state: RwLock<FeedState>,
    subscription_capacity: usize,
    dropped_notifications: AtomicU64,
}

impl std::fmt::Debug for InMemoryHazardFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryHazardFeed")
            .field("subscription_capacity", &self.subscription_capacity)
            .field("dropped_notifications", &self.dropped_notifications())
            .finish_non_exhaustive()
    }
}

impl Default for InMemoryHazardFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryHazardFeed {
    /// Creates an empty feed stamped by the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates an empty feed stamped by `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self::with_capacity(clock, DEFAULT_SUBSCRIPTION_CAPACITY)
    }

    /// Creates an empty feed with a custom per-subscription buffer.
    #[must_use]
    pub fn with_capacity(clock: Arc<dyn Clock>, subscription_capacity: usize) -> Self {
        Self {
            clock,
            state: RwLock::new(FeedState {
                accepting_subscriptions: true,
                ..FeedState::default()
            }),
            subscription_capacity: subscription_capacity.max(1),
            dropped_notifications: AtomicU64::new(0),
        }
    }

    /// Look up an appended event.
    pub fn get(&self, id: HazardEventId) -> Result<Option<HazardEvent>, FeedError> {
        let state = self.state.read().map_err(|_| lock_err("feed state"))?;
        Ok(state.by_id.get(&id).map(|&idx| state.events[idx].clone()))
    }

    /// Number of appended events.
    pub fn len(&self) -> Result<usize, FeedError> {
        let state = self.state.read().map_err(|_| lock_err("feed state"))?;
        Ok(state.events.len())
    }

    /// Returns true if nothing has been appended.
    pub fn is_empty(&self) -> Result<bool, FeedError> {
        Ok(self.len()? == 0)
    }

    /// Number of currently open subscriptions (closed ones are pruned lazily).
    pub fn subscription_count(&self) -> Result<usize, FeedError> {
        let state = self.state.read().map_err(|_| lock_err("feed state"))?;
        Ok(state.subscribers.len())
    }

    /// Notifications that could not be queued because a subscriber's buffer was full.
    #[must_use]
    pub fn dropped_notifications(&self) -> u64 {
        self.dropped_notifications.load(Ordering::Relaxed)
    }

    /// Re-sends an already appended event to every open subscription.
    ///
    /// Models the at-least-once delivery of real change feeds.
    pub fn redeliver(&self, id: HazardEventId) -> Result<(), FeedError> {
        let mut state = self.state.write().map_err(|_| lock_err("feed state"))?;
        let Some(&idx) = state.by_id.get(&id) else {
            return Err(FeedError::Backend(format!("unknown hazard event: {id}")));
        };
        let event = state.events[idx].clone();
        self.broadcast(&mut state, &event);
        Ok(())
    }

    /// Closes every open subscription, as a dropped connection would.
    pub fn disconnect_all(&self) -> Result<(), FeedError> {
        let mut state = self.state.write().map_err(|_| lock_err("feed state"))?;
        state.subscribers.clear();
        Ok(())
    }

    /// When false, `subscribe_changes` fails with `FeedError::Backend`.
    pub fn set_accepting_subscriptions(&self, accepting: bool) -> Result<(), FeedError> {
        let mut state = self.state.write().map_err(|_| lock_err("feed state"))?;
        state.accepting_subscriptions = accepting;
        Ok(())
    }

    fn broadcast(&self, state: &mut FeedState, event: &HazardEvent) {
        state.subscribers.retain(|id, tx| {
            match tx.try_send(AppendNotification { event: event.clone() }) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    self.dropped_notifications.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(subscription_id = %id, event_id = %event.id, "subscriber buffer full, notification dropped");
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            }
        });
    }
}

impl HazardFeed for InMemoryHazardFeed {
    fn append(&self, draft: NewHazard) -> Result<HazardEventId, FeedError> {
        let mut state = self.state.write().map_err(|_| lock_err("feed state"))?;

        // Strictly after the previous append and never before an issued
        // watermark, even if the clock steps back or stands still.
        let created_at = latest(latest(self.clock.now(), state.after_last()), state.issued);

        let id = HazardEventId::new();
        let event = HazardEvent::from_draft(id, created_at, draft);
        tracing::debug!(event_id = %id, reporter_id = %event.reporter_id, label = %event.label, "hazard appended");

        let idx = state.events.len();
        state.events.push(event.clone());
        state.by_id.insert(id, idx);
        self.broadcast(&mut state, &event);

        Ok(id)
    }

    fn subscribe_changes(&self) -> Result<FeedSubscription, FeedError> {
        let mut state = self.state.write().map_err(|_| lock_err("feed state"))?;
        if !state.accepting_subscriptions {
            return Err(FeedError::Backend("feed is not accepting subscriptions".to_string()));
        }

        let id = SubscriptionId::new();
        let (tx, rx) = bounded::<AppendNotification>(self.subscription_capacity);
        state.subscribers.insert(id, tx);
        Ok(FeedSubscription::new(id, rx))
    }

    fn now(&self) -> DateTime<Utc> {
        let clock_now = self.clock.now();
        let Ok(mut state) = self.state.write() else {
            return clock_now;
        };
        let now = latest(latest(clock_now, state.after_last()), state.issued);
        state.issued = Some(now);
        now
    }
}
