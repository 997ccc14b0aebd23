//! Bounded resubscription after a dropped change subscription.

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};

use crate::error::FeedError;

use super::traits::{duration_ms, FeedSubscription, HazardFeed};

/// Linear-backoff retry policy for reopening a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResubscribePolicy {
    /// Attempts before giving up. Zero gives up immediately.
    pub attempts: u32,
    /// Attempt `n` waits `n * backoff` first.
    pub backoff: Duration,
}

/// Outcome of `resubscribe`.
#[derive(Debug)]
pub enum Resubscribe {
    /// A fresh subscription.
    Ready(FeedSubscription),
    /// The stop channel fired (or closed) while waiting.
    Stopped,
    /// Every attempt failed.
    Exhausted(FeedError),
}

/// Reopens a subscription on `feed`, waiting on `stop_rx` between attempts so
/// a stop request interrupts the backoff.
pub fn resubscribe(
    feed: &dyn HazardFeed,
    policy: ResubscribePolicy,
    stop_rx: &Receiver<()>,
    consumer: &str,
) -> Resubscribe {
    let mut last_error = "feed closed the subscription".to_string();

    for attempt in 1..=policy.attempts {
        let backoff = policy.backoff * attempt;
        tracing::warn!(
            consumer,
            attempt,
            backoff_ms = duration_ms(backoff),
            "feed subscription dropped, resubscribing"
        );

        match stop_rx.recv_timeout(backoff) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return Resubscribe::Stopped,
            Err(RecvTimeoutError::Timeout) => {}
        }

        match feed.subscribe_changes() {
            Ok(subscription) => {
                tracing::info!(consumer, attempt, "feed subscription restored");
                return Resubscribe::Ready(subscription);
            }
            Err(e) => last_error = e.to_string(),
        }
    }

    Resubscribe::Exhausted(FeedError::ConnectivityLost {
        attempts: policy.attempts,
        last_error,
    })
}
