//! The hazard feed contract.
//!
//! The feed is an external, append-only, timestamp-ordered store. This crate
//! only relies on three things from it: appends are stamped with a
//! `created_at` at or after every instant `now()` has already returned,
//! every append after a subscription opens is delivered to it at least once,
//! and per-subscription delivery follows append order.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FeedError;
use crate::event::{AppendNotification, HazardEventId, NewHazard};

/// Unique identifier for a change subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// Create a new random subscription id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Storage trait for the append-only hazard feed.
///
/// # Ordering
/// - `append` must stamp `created_at` no earlier than any previous append
/// - notifications to one subscription arrive in append order
pub trait HazardFeed: Send + Sync {
    /// Append a report, returning the id the store assigned.
    fn append(&self, draft: NewHazard) -> Result<HazardEventId, FeedError>;

    /// Open a change subscription receiving every subsequent append.
    fn subscribe_changes(&self) -> Result<FeedSubscription, FeedError>;

    /// The store's current time, on the same clock that stamps `created_at`.
    ///
    /// The result is strictly after every event appended so far, and no later
    /// append is stamped before it.
    fn now(&self) -> DateTime<Utc>;
}

/// A live change subscription.
///
/// Dropping the subscription closes it; the feed prunes it on its next append.
#[derive(Debug)]
pub struct FeedSubscription {
    id: SubscriptionId,
    rx: Receiver<AppendNotification>,
}

impl FeedSubscription {
    /// Wraps the receiving half of a feed's notification channel.
    #[must_use]
    pub const fn new(id: SubscriptionId, rx: Receiver<AppendNotification>) -> Self {
        Self { id, rx }
    }

    /// The id backing this subscription.
    #[must_use]
    pub const fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Raw receiver, for use in `crossbeam_channel::select!`.
    #[must_use]
    pub const fn receiver(&self) -> &Receiver<AppendNotification> {
        &self.rx
    }

    /// Receive the next notification (blocking).
    pub fn recv(&self) -> Result<AppendNotification, FeedError> {
        self.rx.recv().map_err(|_| disconnected())
    }

    /// Receive the next notification with a timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<AppendNotification, FeedError> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => FeedError::Timeout {
                duration_ms: duration_ms(timeout),
            },
            RecvTimeoutError::Disconnected => disconnected(),
        })
    }

    /// Non-blocking receive. `Ok(None)` when nothing is queued.
    pub fn try_recv(&self) -> Result<Option<AppendNotification>, FeedError> {
        match self.rx.try_recv() {
            Ok(n) => Ok(Some(n)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(disconnected()),
        }
    }
}

pub(crate) fn disconnected() -> FeedError {
    FeedError::Disconnected {
        reason: "feed closed the subscription".to_string(),
    }
}

pub(crate) fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
