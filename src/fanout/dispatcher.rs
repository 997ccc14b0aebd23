//! Server-side fan-out of one hazard event.
//!
//! The dispatcher snapshots the subscriber directory, plans the recipients
//! and sends batches through the push transport. Each transport call runs on
//! a short-lived helper thread so a hung transport is cut off by the send
//! timeout instead of stalling the dispatch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use serde::Serialize;

use crate::config::FanoutConfig;
use crate::delivery::{DeliveryAddress, DeliveryFailure, DeliveryOutcome, DeliveryResult, Notification, NotificationSender};
use crate::directory::SubscriberDirectory;
use crate::error::{DeliveryError, HazardResult};
use crate::event::{HazardEvent, HazardEventId};
use crate::feed::duration_ms;

use super::planner::{plan, Batch, BatchId, FanoutSkip};

/// A batch that was dropped after exhausting its retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchFailure {
    /// Hazard being fanned out.
    pub event_id: HazardEventId,
    /// Stable id of the failed batch.
    pub batch_id: BatchId,
    /// Position of the batch within the event's plan.
    pub batch_index: usize,
    /// Recipients that were not reached.
    pub addresses: Vec<DeliveryAddress>,
    /// Error from the last attempt.
    pub error: DeliveryError,
    /// Attempts made, including the first.
    pub attempts: u32,
}

/// What one `dispatch` call did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Set when the event produced no plan.
    pub skipped: Option<FanoutSkip>,
    /// Distinct addresses selected.
    pub recipients: usize,
    /// Batches attempted.
    pub batches: usize,
    /// Addresses the transport confirmed.
    pub delivered: usize,
    /// Per-address failures inside otherwise successful batches.
    pub failed_addresses: Vec<DeliveryFailure>,
    /// Batches dropped after exhausting retries.
    pub failed_batches: Vec<BatchId>,
}

impl DispatchSummary {
    /// True when every selected address was delivered.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed_addresses.is_empty() && self.failed_batches.is_empty()
    }
}

/// Receiving side of dispatch failure reports.
#[derive(Debug, Clone)]
pub struct FailureReports {
    rx: Receiver<DispatchFailure>,
}

impl FailureReports {
    /// Blocks until a report arrives. Returns None once the dispatcher is gone.
    pub fn recv(&self) -> Option<DispatchFailure> {
        self.rx.recv().ok()
    }

    /// Waits at most `timeout` for the next report.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<DispatchFailure> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Next report, if one is already queued.
    pub fn try_recv(&self) -> Option<DispatchFailure> {
        match self.rx.try_recv() {
            Ok(report) => Some(report),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Every report currently buffered.
    pub fn drain(&self) -> Vec<DispatchFailure> {
        self.rx.try_iter().collect()
    }
}

/// Fans one hazard event out to nearby subscribers.
pub struct FanoutDispatcher {
    directory: Arc<dyn SubscriberDirectory>,
    sender: Arc<dyn NotificationSender>,
    config: FanoutConfig,
    notification: Notification,
    failures_tx: Sender<DispatchFailure>,
    failures_rx: Receiver<DispatchFailure>,
    dropped_reports: AtomicU64,
}

impl std::fmt::Debug for FanoutDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutDispatcher")
            .field("config", &self.config)
            .field("dropped_reports", &self.dropped_reports())
            .finish_non_exhaustive()
    }
}

impl FanoutDispatcher {
    /// Creates a dispatcher over `directory` and `sender`.
    ///
    /// Failure reports are buffered up to `config.failure_buffer`.
    #[must_use]
    pub fn new(
        directory: Arc<dyn SubscriberDirectory>,
        sender: Arc<dyn NotificationSender>,
        config: FanoutConfig,
    ) -> Self {
        let (failures_tx, failures_rx) = bounded(config.failure_buffer.max(1));
        let notification = Notification::new(&config.notification_title, &config.notification_body);
        Self {
            directory,
            sender,
            config,
            notification,
            failures_tx,
            failures_rx,
            dropped_reports: AtomicU64::new(0),
        }
    }

    /// Settings this dispatcher was built with.
    #[must_use]
    pub const fn config(&self) -> &FanoutConfig {
        &self.config
    }

    /// A handle on the failure report channel. All handles share one queue.
    #[must_use]
    pub fn failure_reports(&self) -> FailureReports {
        FailureReports {
            rx: self.failures_rx.clone(),
        }
    }

    /// Failure reports discarded because the report buffer was full.
    #[must_use]
    pub fn dropped_reports(&self) -> u64 {
        self.dropped_reports.load(Ordering::Relaxed)
    }

    /// Notify every nearby subscriber of `event`.
    ///
    /// Batches go out in order. A batch that keeps failing is reported and
    /// dropped; later batches still go out.
    ///
    /// # Errors
    ///
    /// Returns `DirectoryError` if the subscriber snapshot cannot be read.
    /// Delivery problems never fail the call; they land in the summary and
    /// the failure reports.
    pub fn dispatch(&self, event: &HazardEvent) -> HazardResult<DispatchSummary> {
        let snapshot = self.directory.snapshot()?;

        let plan = match plan(event, &snapshot, self.config.radius_km, self.config.batch_size) {
            Ok(plan) => plan,
            Err(skip) => {
                tracing::info!(event_id = %event.id, reason = ?skip, "fanout skipped");
                return Ok(DispatchSummary {
                    skipped: Some(skip),
                    ..DispatchSummary::default()
                });
            }
        };

        tracing::info!(
            event_id = %event.id,
            considered = plan.considered,
            reachable = plan.reachable,
            recipients = plan.recipients,
            batches = plan.batches.len(),
            "fanout planned"
        );

        let mut summary = DispatchSummary {
            skipped: None,
            recipients: plan.recipients,
            batches: plan.batches.len(),
            ..DispatchSummary::default()
        };

        for batch in plan.batches {
            match self.send_with_retry(&batch) {
                Ok(results) => {
                    for result in results {
                        match result.outcome {
                            DeliveryOutcome::Delivered => summary.delivered += 1,
                            DeliveryOutcome::Failed { reason } => {
                                tracing::warn!(
                                    event_id = %event.id,
                                    batch_index = batch.index,
                                    address = %result.address,
                                    %reason,
                                    "push delivery failed"
                                );
                                summary.failed_addresses.push(DeliveryFailure {
                                    address: result.address,
                                    reason,
                                });
                            }
                        }
                    }
                }
                Err((error, attempts)) => {
                    summary.failed_batches.push(batch.id);
                    self.report_failure(DispatchFailure {
                        event_id: event.id,
                        batch_id: batch.id,
                        batch_index: batch.index,
                        addresses: batch.addresses,
                        error,
                        attempts,
                    });
                }
            }
        }

        tracing::info!(
            event_id = %event.id,
            delivered = summary.delivered,
            failed_addresses = summary.failed_addresses.len(),
            failed_batches = summary.failed_batches.len(),
            "fanout finished"
        );

        Ok(summary)
    }

    /// Returns the per-address results, or the last error and the number of
    /// attempts made.
    fn send_with_retry(&self, batch: &Batch) -> Result<Vec<DeliveryResult>, (DeliveryError, u32)> {
        let max_attempts = self.config.retry_count.saturating_add(1);
        let mut attempt = 1u32;

        loop {
            match self.send_once(&batch.addresses) {
                Ok(results) => return Ok(results),
                Err(error) if error.is_retryable() && attempt < max_attempts => {
                    let backoff = self.config.retry_backoff() * attempt;
                    tracing::warn!(
                        batch_id = %batch.id,
                        batch_index = batch.index,
                        attempt,
                        backoff_ms = duration_ms(backoff),
                        error = %error,
                        "push batch failed, retrying"
                    );
                    thread::sleep(backoff);
                    attempt += 1;
                }
                Err(error) => return Err((error, attempt)),
            }
        }
    }

    fn send_once(&self, addresses: &[DeliveryAddress]) -> Result<Vec<DeliveryResult>, DeliveryError> {
        let timeout = self.config.send_timeout();
        let (reply_tx, reply_rx) = bounded(1);
        let sender = Arc::clone(&self.sender);
        let notification = self.notification.clone();
        let batch = addresses.to_vec();

        thread::Builder::new()
            .name("hazardwatch-push".to_string())
            .spawn(move || {
                let _ = reply_tx.send(sender.send(&batch, &notification));
            })
            .map_err(|e| DeliveryError::Transport {
                message: format!("failed to spawn push thread: {e}"),
            })?;

        let results = match reply_rx.recv_timeout(timeout) {
            Ok(result) => result?,
            Err(RecvTimeoutError::Timeout) => {
                return Err(DeliveryError::Timeout {
                    duration_ms: duration_ms(timeout),
                })
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(DeliveryError::Transport {
                    message: "push transport panicked".to_string(),
                })
            }
        };

        if results.len() != addresses.len() {
            return Err(DeliveryError::ResultCountMismatch {
                expected: addresses.len(),
                actual: results.len(),
            });
        }
        Ok(results)
    }

    fn report_failure(&self, failure: DispatchFailure) {
        tracing::error!(
            event_id = %failure.event_id,
            batch_id = %failure.batch_id,
            batch_index = failure.batch_index,
            recipients = failure.addresses.len(),
            attempts = failure.attempts,
            error = %failure.error,
            "push batch dropped"
        );

        match self.failures_tx.try_send(failure) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped_reports.fetch_add(1, Ordering::Relaxed);
            }
            // Unreachable while we hold the receiver.
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use crate::directory::{InMemorySubscriberDirectory, SubscriberRecord};
    use crate::error::HazardError;
    use crate::event::NewHazard;
    use crate::geo::Coordinate;
    use crate::time::from_millis;

    /// Fails the batches whose first address is listed, every time.
    #[derive(Default)]
    struct ScriptedSender {
        calls: Mutex<Vec<usize>>,
        fail_first: Vec<DeliveryAddress>,
        reject: Vec<DeliveryAddress>,
        short_reply: bool,
    }

    impl NotificationSender for ScriptedSender {
        fn send(
            &self,
            addresses: &[DeliveryAddress],
            _notification: &Notification,
        ) -> Result<Vec<DeliveryResult>, DeliveryError> {
            self.calls.lock().unwrap().push(addresses.len());
            if addresses.first().is_some_and(|a| self.fail_first.contains(a)) {
                return Err(DeliveryError::Transport {
                    message: "503".to_string(),
                });
            }
            let mut results: Vec<_> = addresses
                .iter()
                .map(|a| {
                    if self.reject.contains(a) {
                        DeliveryResult::failed(a.clone(), "unregistered")
                    } else {
                        DeliveryResult::delivered(a.clone())
                    }
                })
                .collect();
            if self.short_reply {
                results.pop();
            }
            Ok(results)
        }
    }

    fn origin() -> Coordinate {
        Coordinate::new(45.0, 7.0).unwrap()
    }

    fn directory(n: usize) -> Arc<InMemorySubscriberDirectory> {
        let dir = InMemorySubscriberDirectory::new();
        for i in 0..n {
            dir.upsert(
                SubscriberRecord::new(format!("s{i:04}"))
                    .with_location(origin())
                    .with_delivery_address(DeliveryAddress::new(format!("t{i:04}"))),
            )
            .unwrap();
        }
        Arc::new(dir)
    }

    fn config(batch_size: usize) -> FanoutConfig {
        FanoutConfig {
            batch_size,
            retry_count: 2,
            retry_backoff_ms: 1,
            send_timeout_ms: 500,
            ..FanoutConfig::default()
        }
    }

    fn event() -> HazardEvent {
        HazardEvent::from_draft(
            HazardEventId::new(),
            from_millis(0),
            NewHazard::new("reporter", origin(), "pothole"),
        )
    }

    #[test]
    fn failed_batch_is_reported_and_others_complete() {
        let sender = Arc::new(ScriptedSender {
            fail_first: vec![DeliveryAddress::from("t0500")],
            ..ScriptedSender::default()
        });
        let dispatcher = FanoutDispatcher::new(directory(1200), sender.clone(), config(500));
        let reports = dispatcher.failure_reports();

        let summary = dispatcher.dispatch(&event()).unwrap();
        assert_eq!(summary.batches, 3);
        assert_eq!(summary.delivered, 700);
        assert_eq!(summary.failed_batches.len(), 1);

        // batch 0 once, batch 1 three times, batch 2 once
        assert_eq!(*sender.calls.lock().unwrap(), vec![500, 500, 500, 500, 200]);

        let report = reports.try_recv().unwrap();
        assert_eq!(report.batch_index, 1);
        assert_eq!(report.attempts, 3);
        assert_eq!(report.addresses.len(), 500);
        assert!(reports.try_recv().is_none());
    }

    #[test]
    fn per_address_failures_do_not_fail_the_batch() {
        let sender = Arc::new(ScriptedSender {
            reject: vec![DeliveryAddress::from("t0001")],
            ..ScriptedSender::default()
        });
        let dispatcher = FanoutDispatcher::new(directory(3), sender, config(500));

        let summary = dispatcher.dispatch(&event()).unwrap();
        assert_eq!(summary.delivered, 2);
        assert_eq!(summary.failed_addresses.len(), 1);
        assert_eq!(summary.failed_addresses[0].address.as_str(), "t0001");
        assert!(summary.failed_batches.is_empty());
        assert!(dispatcher.failure_reports().try_recv().is_none());
    }

    #[test]
    fn short_reply_is_not_retried() {
        let sender = Arc::new(ScriptedSender {
            short_reply: true,
            ..ScriptedSender::default()
        });
        let dispatcher = FanoutDispatcher::new(directory(4), sender.clone(), config(500));
        let reports = dispatcher.failure_reports();

        dispatcher.dispatch(&event()).unwrap();
        assert_eq!(sender.calls.lock().unwrap().len(), 1);
        let report = reports.try_recv().unwrap();
        assert_eq!(
            report.error,
            DeliveryError::ResultCountMismatch { expected: 4, actual: 3 }
        );
    }

    #[test]
    fn unlocated_event_is_skipped() {
        let dispatcher = FanoutDispatcher::new(directory(3), Arc::new(ScriptedSender::default()), config(500));
        let event = HazardEvent::from_draft(HazardEventId::new(), from_millis(0), NewHazard::unlocated("r", "x"));
        let summary = dispatcher.dispatch(&event).unwrap();
        assert_eq!(summary.skipped, Some(FanoutSkip::NoLocation));
        assert_eq!(summary.batches, 0);
    }

    #[test]
    fn unavailable_directory_is_an_error() {
        let dir = directory(1);
        dir.set_available(false);
        let dispatcher = FanoutDispatcher::new(dir, Arc::new(ScriptedSender::default()), config(500));
        let err = dispatcher.dispatch(&event()).unwrap_err();
        assert!(matches!(err, HazardError::Directory(_)));
    }

    #[test]
    fn full_report_buffer_counts_drops() {
        let sender = Arc::new(ScriptedSender {
            fail_first: vec![DeliveryAddress::from("t0000"), DeliveryAddress::from("t0001")],
            ..ScriptedSender::default()
        });
        let cfg = FanoutConfig {
            retry_count: 0,
            failure_buffer: 1,
            ..config(1)
        };
        let dispatcher = FanoutDispatcher::new(directory(2), sender, cfg);
        let summary = dispatcher.dispatch(&event()).unwrap();
        assert_eq!(summary.failed_batches.len(), 2);
        assert_eq!(dispatcher.dropped_reports(), 1);
        assert_eq!(dispatcher.failure_reports().drain().len(), 1);
    }
}
