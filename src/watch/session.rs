//! Per-watcher live session.
//!
//! A `LiveMatcher` owns at most one session at a time. The session runs on a
//! dedicated worker thread that blocks on the feed subscription and a stop
//! channel; matching happens on that thread and alerts go straight to the
//! caller's sink.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, select, Receiver, Sender};

use crate::config::WatchConfig;
use crate::error::{ConfigurationError, HazardError, HazardResult};
use crate::event::{HazardEvent, UserId};
use crate::feed::{resubscribe, FeedSubscription, HazardFeed, Resubscribe, ResubscribePolicy};
use crate::geo::{validate_radius, Coordinate};

use super::matcher::{MatchOutput, SessionMatcher, Watcher};
use super::stream::{alert_channel, AlertSink, AlertStream, ChannelAlertSink};

/// Result of `LiveMatcher::start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new session began listening at `watermark`.
    Started {
        /// Events created before this instant are ignored.
        watermark: DateTime<Utc>,
    },
    /// A session was already live; nothing changed.
    AlreadySubscribed {
        /// Watermark of the session that was already live.
        watermark: DateTime<Utc>,
    },
}

impl StartOutcome {
    /// Watermark of the live session.
    #[must_use]
    pub const fn watermark(&self) -> DateTime<Utc> {
        match self {
            Self::Started { watermark } | Self::AlreadySubscribed { watermark } => *watermark,
        }
    }
}

/// Observable state of a `LiveMatcher`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatcherState {
    /// No live session.
    Unsubscribed,
    /// A session is listening on behalf of `watcher_id`.
    Subscribed {
        /// Watcher the session belongs to.
        watcher_id: UserId,
        /// Instant the session started listening.
        watermark: DateTime<Utc>,
    },
}

#[derive(Debug)]
struct ActiveSession {
    watcher_id: UserId,
    watermark: DateTime<Utc>,
    stop_tx: Sender<()>,
    stopped: Arc<AtomicBool>,
    live: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ActiveSession {
    fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    fn shutdown(mut self) {
        self.stopped.store(true, Ordering::Release);
        let _ = self.stop_tx.try_send(());

        if let Some(handle) = self.join.take() {
            // Stopping from inside a sink callback must not join our own thread.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

/// Client-side live matcher for one watcher.
///
/// State machine: Unsubscribed → Subscribed → Unsubscribed. Each `start`
/// takes a fresh watermark, so events appended while stopped are never
/// delivered retroactively.
pub struct LiveMatcher {
    feed: Arc<dyn HazardFeed>,
    config: WatchConfig,
    session: Mutex<Option<ActiveSession>>,
}

impl std::fmt::Debug for LiveMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveMatcher")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl LiveMatcher {
    /// Creates an unsubscribed matcher over `feed`.
    #[must_use]
    pub fn new(feed: Arc<dyn HazardFeed>, config: WatchConfig) -> Self {
        Self {
            feed,
            config,
            session: Mutex::new(None),
        }
    }

    /// Creates a sink/stream pair sized by `WatchConfig::alert_buffer`.
    #[must_use]
    pub fn alert_channel(&self) -> (ChannelAlertSink, AlertStream) {
        alert_channel(self.config.alert_buffer)
    }

    fn lock(&self) -> MutexGuard<'_, Option<ActiveSession>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Begin listening for hazards near `location`.
    ///
    /// `radius_km` falls back to the configured default. If a session is
    /// already live this is a no-op.
    ///
    /// # Errors
    ///
    /// - `ConfigurationError::MissingLocation` if `location` is `None`
    /// - `ConfigurationError::InvalidRadius` for a non-positive or non-finite radius
    /// - `FeedError` if the feed refuses the subscription
    pub fn start(
        &self,
        watcher_id: impl Into<UserId>,
        location: Option<Coordinate>,
        radius_km: Option<f64>,
        sink: Arc<dyn AlertSink>,
    ) -> HazardResult<StartOutcome> {
        let mut guard = self.lock();

        if let Some(session) = guard.as_ref() {
            if session.is_live() {
                return Ok(StartOutcome::AlreadySubscribed {
                    watermark: session.watermark,
                });
            }
        }
        // A worker that gave up is already exiting; detach it.
        guard.take();

        let watcher_id = watcher_id.into();
        let location = location.ok_or(ConfigurationError::MissingLocation)?;
        let radius_km = validate_radius(radius_km.unwrap_or(self.config.radius_km))?;

        // Subscribe before reading the watermark so no append at or after
        // the watermark can slip between the two.
        let subscription = self.feed.subscribe_changes()?;
        let watermark = self.feed.now();

        let watcher = Watcher {
            watcher_id: watcher_id.clone(),
            location: Some(location),
            watermark,
            radius_km,
        };

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let stopped = Arc::new(AtomicBool::new(false));
        let live = Arc::new(AtomicBool::new(true));

        let worker = SessionWorker {
            feed: Arc::clone(&self.feed),
            config: self.config.clone(),
            matcher: SessionMatcher::new(watcher, self.config.dedupe_capacity),
            sink,
            stop_rx,
            stopped: Arc::clone(&stopped),
            live: Arc::clone(&live),
        };

        let join = thread::Builder::new()
            .name(format!("hazardwatch-watch-{watcher_id}"))
            .spawn(move || worker.run(subscription))
            .map_err(|e| HazardError::internal(format!("failed to spawn watch session: {e}")))?;

        tracing::info!(watcher_id = %watcher_id, %location, radius_km, watermark = %watermark, "watch session started");

        *guard = Some(ActiveSession {
            watcher_id,
            watermark,
            stop_tx,
            stopped,
            live,
            join: Some(join),
        });

        Ok(StartOutcome::Started { watermark })
    }

    /// Stop listening and discard the watermark.
    ///
    /// Safe at any time, including from inside the session's own sink. An
    /// evaluation already in progress completes; nothing after it is
    /// processed. Returns false if there was no session.
    pub fn stop(&self) -> bool {
        let session = self.lock().take();
        let Some(session) = session else {
            return false;
        };

        tracing::info!(watcher_id = %session.watcher_id, "watch session stopped");
        session.shutdown();
        true
    }

    /// Current state. A session that lost connectivity reports Unsubscribed.
    #[must_use]
    pub fn state(&self) -> MatcherState {
        match self.lock().as_ref() {
            Some(s) if s.is_live() => MatcherState::Subscribed {
                watcher_id: s.watcher_id.clone(),
                watermark: s.watermark,
            },
            _ => MatcherState::Unsubscribed,
        }
    }

    /// Returns true while a live session exists.
    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        matches!(self.state(), MatcherState::Subscribed { .. })
    }
}

impl Drop for LiveMatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

struct SessionWorker {
    feed: Arc<dyn HazardFeed>,
    config: WatchConfig,
    matcher: SessionMatcher,
    sink: Arc<dyn AlertSink>,
    stop_rx: Receiver<()>,
    stopped: Arc<AtomicBool>,
    live: Arc<AtomicBool>,
}

impl SessionWorker {
    fn run(mut self, mut subscription: FeedSubscription) {
        let stop_rx = self.stop_rx.clone();
        let mut done = false;

        while !done {
            let feed_rx = subscription.receiver().clone();
            select! {
                recv(stop_rx) -> _ => {
                    // Explicit stop, or the owning matcher went away.
                    done = true;
                }
                recv(feed_rx) -> msg => {
                    match msg {
                        Ok(notification) => {
                            if self.stopped.load(Ordering::Acquire) {
                                done = true;
                            } else {
                                self.handle(&notification.event);
                            }
                        }
                        Err(_) => match self.resubscribe() {
                            Resubscribe::Ready(next) => subscription = next,
                            Resubscribe::Stopped => done = true,
                            Resubscribe::Exhausted(err) => {
                                tracing::error!(
                                    watcher_id = %self.matcher.watcher().watcher_id,
                                    error = %err,
                                    "watch session lost feed connectivity"
                                );
                                self.live.store(false, Ordering::Release);
                                self.sink.on_connectivity_lost(&err);
                                done = true;
                            }
                        },
                    }
                }
            }
        }

        self.live.store(false, Ordering::Release);
    }

    fn handle(&mut self, event: &HazardEvent) {
        let output = self.matcher.observe(event);
        let watcher_id = &self.matcher.watcher().watcher_id;
        match output {
            MatchOutput::Match(alert) => {
                tracing::info!(
                    watcher_id = %watcher_id,
                    event_id = %alert.event_id,
                    distance_km = alert.distance_km,
                    label = %alert.label,
                    "hazard alert"
                );
                self.sink.on_alert(alert);
            }
            MatchOutput::Skip(reason) => {
                tracing::debug!(watcher_id = %watcher_id, event_id = %event.id, ?reason, "hazard filtered");
            }
        }
    }

    fn resubscribe(&self) -> Resubscribe {
        let policy = ResubscribePolicy {
            attempts: self.config.resubscribe_attempts,
            backoff: self.config.resubscribe_backoff(),
        };
        let consumer = format!("watch:{}", self.matcher.watcher().watcher_id);
        match resubscribe(self.feed.as_ref(), policy, &self.stop_rx, &consumer) {
            Resubscribe::Ready(_) if self.stopped.load(Ordering::Acquire) => Resubscribe::Stopped,
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use crate::event::NewHazard;
    use crate::feed::InMemoryHazardFeed;
    use crate::watch::stream::{alert_channel, SessionEvent};

    fn here() -> Coordinate {
        Coordinate::new(10.0, 10.0).unwrap()
    }

    fn setup() -> (Arc<InMemoryHazardFeed>, LiveMatcher) {
        let feed = Arc::new(InMemoryHazardFeed::new());
        let cfg = WatchConfig {
            resubscribe_backoff_ms: 5,
            ..WatchConfig::default()
        };
        let matcher = LiveMatcher::new(feed.clone(), cfg);
        (feed, matcher)
    }

    #[test]
    fn start_requires_location() {
        let (_feed, matcher) = setup();
        let (sink, _stream) = alert_channel(8);
        let err = matcher.start("me", None, None, Arc::new(sink)).unwrap_err();
        assert_eq!(err, HazardError::Configuration(ConfigurationError::MissingLocation));
        assert_eq!(matcher.state(), MatcherState::Unsubscribed);
    }

    #[test]
    fn start_rejects_bad_radius() {
        let (_feed, matcher) = setup();
        let (sink, _stream) = alert_channel(8);
        let err = matcher.start("me", Some(here()), Some(0.0), Arc::new(sink)).unwrap_err();
        assert!(matches!(err, HazardError::Configuration(ConfigurationError::InvalidRadius { .. })));
    }

    #[test]
    fn second_start_is_a_noop() {
        let (_feed, matcher) = setup();
        let (sink, _stream) = alert_channel(8);
        let sink = Arc::new(sink);
        let first = matcher.start("me", Some(here()), None, sink.clone()).unwrap();
        let second = matcher.start("me", Some(here()), None, sink).unwrap();
        assert!(matches!(first, StartOutcome::Started { .. }));
        assert_eq!(second, StartOutcome::AlreadySubscribed { watermark: first.watermark() });
    }

    #[test]
    fn alerts_on_nearby_event_and_stop_is_idempotent() {
        let (feed, matcher) = setup();
        let (sink, stream) = alert_channel(8);
        matcher.start("me", Some(here()), None, Arc::new(sink)).unwrap();

        let id = feed
            .append(NewHazard::new("u1", Coordinate::new(10.02, 10.0).unwrap(), "pothole"))
            .unwrap();

        let Some(SessionEvent::Alert(alert)) = stream.recv_timeout(Duration::from_secs(2)) else {
            panic!("expected alert");
        };
        assert_eq!(alert.event_id, id);

        assert!(matcher.stop());
        assert!(!matcher.stop());
        assert_eq!(matcher.state(), MatcherState::Unsubscribed);
    }

    #[test]
    fn stop_from_inside_sink_does_not_deadlock() {
        let (feed, matcher) = setup();
        let matcher = Arc::new(matcher);
        let (tx, rx) = bounded::<bool>(1);

        let weak = Arc::downgrade(&matcher);
        let sink = move |_alert: crate::watch::Alert| {
            if let Some(m) = weak.upgrade() {
                let _ = tx.try_send(m.stop());
            }
        };
        matcher.start("me", Some(here()), None, Arc::new(sink)).unwrap();
        feed.append(NewHazard::new("u1", here(), "pothole")).unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)), Ok(true));
        assert!(!matcher.is_subscribed());
    }
}
