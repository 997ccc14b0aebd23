use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::error::FeedError;

use super::matcher::Alert;

/// Receives the output of a live matcher session.
///
/// Callbacks run on the session's worker thread. Calling
/// `LiveMatcher::stop` from inside a callback is allowed.
pub trait AlertSink: Send + Sync {
    /// A hazard matched this watcher.
    fn on_alert(&self, alert: Alert);

    /// Resubscription gave up; the session is now unsubscribed.
    fn on_connectivity_lost(&self, _error: &FeedError) {}
}

impl<F> AlertSink for F
where
    F: Fn(Alert) + Send + Sync,
{
    fn on_alert(&self, alert: Alert) {
        self(alert);
    }
}

/// Item yielded by an `AlertStream`.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A hazard matched.
    Alert(Alert),
    /// The session gave up resubscribing and is no longer live.
    ConnectivityLost {
        /// Last resubscribe failure.
        error: FeedError,
    },
}

/// Sink half of `alert_channel`.
///
/// Never blocks the session worker: when the stream's buffer is full the
/// item is dropped and counted.
#[derive(Debug, Clone)]
pub struct ChannelAlertSink {
    tx: Sender<SessionEvent>,
    dropped: Arc<AtomicU64>,
}

impl ChannelAlertSink {
    /// Items dropped because the stream was full or gone.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn push(&self, item: SessionEvent) {
        match self.tx.try_send(item) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl AlertSink for ChannelAlertSink {
    fn on_alert(&self, alert: Alert) {
        self.push(SessionEvent::Alert(alert));
    }

    fn on_connectivity_lost(&self, error: &FeedError) {
        self.push(SessionEvent::ConnectivityLost { error: error.clone() });
    }
}

/// Receiving half of `alert_channel`.
#[derive(Debug)]
pub struct AlertStream {
    rx: Receiver<SessionEvent>,
}

impl AlertStream {
    /// Receive the next item (blocking). `None` once every sink is dropped.
    #[must_use]
    pub fn recv(&self) -> Option<SessionEvent> {
        self.rx.recv().ok()
    }

    /// Receive the next item, waiting at most `timeout`.
    #[must_use]
    pub fn recv_timeout(&self, timeout: Duration) -> Option<SessionEvent> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Non-blocking receive.
    #[must_use]
    pub fn try_recv(&self) -> Option<SessionEvent> {
        self.rx.try_recv().ok()
    }

    /// Items currently buffered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Returns true if nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Creates a bounded sink/stream pair for consuming alerts by polling.
#[must_use]
pub fn alert_channel(capacity: usize) -> (ChannelAlertSink, AlertStream) {
    let (tx, rx) = bounded(capacity.max(1));
    (
        ChannelAlertSink {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        AlertStream { rx },
    )
}
