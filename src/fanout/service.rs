//! Long-running fan-out service.
//!
//! One listener thread follows the feed, drops redelivered events and hands
//! each new event to a bounded worker pool that runs `FanoutDispatcher`.
//! When every worker is busy and the queue is full, the listener waits for
//! room (or for shutdown) instead of dropping the event.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, select, Receiver, Sender};

use crate::config::FanoutConfig;
use crate::error::{HazardError, HazardResult};
use crate::event::HazardEvent;
use crate::feed::{resubscribe, FeedSubscription, HazardFeed, Resubscribe, ResubscribePolicy};
use crate::watch::matcher::SeenEvents;

use super::dispatcher::FanoutDispatcher;

/// Counters for a running service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceStats {
    /// Notifications read from the feed.
    pub received: u64,
    /// Notifications ignored because the event was already handled.
    pub duplicates: u64,
    /// Events never handed to a worker because the service stopped, or the
    /// workers were gone, while the listener waited on the queue.
    pub queue_dropped: u64,
    /// Events picked up by a worker.
    pub dispatched: u64,
    /// Dispatches that failed outright (for example, directory unavailable).
    pub dispatch_errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    duplicates: AtomicU64,
    queue_dropped: AtomicU64,
    dispatched: AtomicU64,
    dispatch_errors: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ServiceStats {
        ServiceStats {
            received: self.received.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            queue_dropped: self.queue_dropped.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            dispatch_errors: self.dispatch_errors.load(Ordering::Relaxed),
        }
    }
}

struct WorkerPool {
    tx: Option<Sender<HazardEvent>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    fn start(
        workers: usize,
        queue_capacity: usize,
        dispatcher: &Arc<FanoutDispatcher>,
        counters: &Arc<Counters>,
    ) -> HazardResult<Self> {
        let (tx, rx) = bounded::<HazardEvent>(queue_capacity.max(1));

        let mut handles = Vec::with_capacity(workers.max(1));
        for idx in 0..workers.max(1) {
            let rx: Receiver<HazardEvent> = rx.clone();
            let dispatcher = Arc::clone(dispatcher);
            let counters = Arc::clone(counters);
            let handle = thread::Builder::new()
                .name(format!("hazardwatch-fanout-{idx}"))
                .spawn(move || {
                    while let Ok(event) = rx.recv() {
                        counters.dispatched.fetch_add(1, Ordering::Relaxed);
                        if let Err(e) = dispatcher.dispatch(&event) {
                            counters.dispatch_errors.fetch_add(1, Ordering::Relaxed);
                            tracing::error!(event_id = %event.id, error = %e, "fanout dispatch failed");
                        }
                    }
                })
                .map_err(|e| HazardError::internal(format!("failed to spawn fanout worker: {e}")))?;
            handles.push(handle);
        }

        Ok(Self {
            tx: Some(tx),
            workers: handles,
        })
    }

    fn sender(&self) -> Option<Sender<HazardEvent>> {
        self.tx.clone()
    }

    /// Closes the queue and waits for queued events to finish.
    fn shutdown(&mut self) {
        self.tx.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Feed-driven fan-out with deduplication and a bounded worker pool.
pub struct FanoutService {
    stop_tx: Sender<()>,
    listener: Option<JoinHandle<()>>,
    pool: WorkerPool,
    listening: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for FanoutService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutService")
            .field("listening", &self.is_listening())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl FanoutService {
    /// Subscribe to `feed` and start dispatching.
    ///
    /// # Errors
    ///
    /// Returns `FeedError` if the initial subscription is refused, or an
    /// internal error if a thread cannot be spawned.
    pub fn start(
        feed: Arc<dyn HazardFeed>,
        dispatcher: Arc<FanoutDispatcher>,
        config: &FanoutConfig,
    ) -> HazardResult<Self> {
        let subscription = feed.subscribe_changes()?;

        let counters = Arc::new(Counters::default());
        let mut pool = WorkerPool::start(config.workers, config.queue_capacity, &dispatcher, &counters)?;
        let queue = pool
            .sender()
            .ok_or_else(|| HazardError::internal("fanout queue closed before start"))?;

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let listening = Arc::new(AtomicBool::new(true));

        let listener = Listener {
            feed,
            policy: ResubscribePolicy {
                attempts: config.resubscribe_attempts,
                backoff: config.resubscribe_backoff(),
            },
            seen: SeenEvents::new(config.dedupe_capacity),
            queue,
            stop_rx,
            listening: Arc::clone(&listening),
            counters: Arc::clone(&counters),
        };

        let spawned = thread::Builder::new()
            .name("hazardwatch-fanout-listener".to_string())
            .spawn(move || listener.run(subscription));
        let listener = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                pool.shutdown();
                return Err(HazardError::internal(format!("failed to spawn fanout listener: {e}")));
            }
        };

        tracing::info!(workers = config.workers.max(1), queue_capacity = config.queue_capacity.max(1), "fanout service started");

        Ok(Self {
            stop_tx,
            listener: Some(listener),
            pool,
            listening,
            counters,
        })
    }

    /// False once the listener stopped, either on shutdown or after failing
    /// to resubscribe.
    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    /// Snapshot of the service counters.
    #[must_use]
    pub fn stats(&self) -> ServiceStats {
        self.counters.snapshot()
    }

    /// Stop listening, finish queued dispatches and join every thread.
    pub fn shutdown(mut self) -> ServiceStats {
        self.stop();
        self.stats()
    }

    fn stop(&mut self) {
        let _ = self.stop_tx.try_send(());
        if let Some(handle) = self.listener.take() {
            let _ = handle.join();
            tracing::info!("fanout service stopped");
        }
        self.pool.shutdown();
    }
}

impl Drop for FanoutService {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Listener {
    feed: Arc<dyn HazardFeed>,
    policy: ResubscribePolicy,
    seen: SeenEvents,
    queue: Sender<HazardEvent>,
    stop_rx: Receiver<()>,
    listening: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl Listener {
    fn run(mut self, mut subscription: FeedSubscription) {
        let stop_rx = self.stop_rx.clone();
        let mut done = false;

        while !done {
            let feed_rx = subscription.receiver().clone();
            select! {
                recv(stop_rx) -> _ => done = true,
                recv(feed_rx) -> msg => match msg {
                    Ok(notification) => done = !self.handle(notification.event),
                    Err(_) => match resubscribe(self.feed.as_ref(), self.policy, &self.stop_rx, "fanout") {
                        Resubscribe::Ready(next) => subscription = next,
                        Resubscribe::Stopped => done = true,
                        Resubscribe::Exhausted(err) => {
                            tracing::error!(error = %err, "fanout service lost feed connectivity");
                            done = true;
                        }
                    },
                },
            }
        }

        self.listening.store(false, Ordering::Release);
    }

    /// Hands a new event to the workers. Returns false once the listener
    /// should exit.
    fn handle(&mut self, event: HazardEvent) -> bool {
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        let event_id = event.id;
        if !self.seen.insert(event_id) {
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(%event_id, "duplicate hazard notification ignored");
            return true;
        }

        if self.queue.is_full() {
            tracing::debug!(%event_id, "fanout queue full, waiting for a worker");
        }

        let queue = self.queue.clone();
        let stop_rx = self.stop_rx.clone();
        select! {
            send(queue, event) -> res => match res {
                Ok(()) => true,
                Err(_) => {
                    self.counters.queue_dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(%event_id, "fanout workers gone, event dropped");
                    false
                }
            },
            recv(stop_rx) -> _ => {
                self.counters.queue_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(%event_id, "fanout service stopping, event not dispatched");
                false
            },
        }
    }
}
