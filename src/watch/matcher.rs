//! Watermark, self-exclusion and radius matching for one watcher.
//!
//! `evaluate` is the pure per-event check. `SessionMatcher` wraps it with the
//! per-session dedupe set, so an event redelivered by the feed alerts once.

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::{HazardEvent, HazardEventId, UserId};
use crate::geo::{distance_km, Coordinate};

/// One listening client.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub struct Watcher {
    pub watcher_id: UserId,
    pub location: Option<Coordinate>,
    /// Events created before this instant are ignored.
    pub watermark: DateTime<Utc>,
    pub radius_km: f64,
}

/// A matched hazard, delivered to the session's alert sink.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub event_id: HazardEventId,
    pub distance_km: f64,
    pub label: String,
    pub reported_at: DateTime<Utc>,
}

impl Alert {
    /// Human-readable notification text.
    ///
    /// ```
    /// use hazardwatch::{Alert, HazardEventId};
    ///
    /// let alert = Alert {
    ///     event_id: HazardEventId::new(),
    ///     distance_km: 2.2239,
    ///     label: "pothole".to_string(),
    ///     reported_at: chrono::Utc::now(),
    /// };
    /// assert_eq!(alert.message(), "A road hazard was reported about 2.2 km from you. Drive safe!");
    /// ```
    #[must_use]
    pub fn message(&self) -> String {
        format!("A road hazard was reported about {:.1} km from you. Drive safe!", self.distance_km)
    }
}

/// Why an event did not produce an alert. Filtering is normal, not an error.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SkipReason {
    /// The event was created before the watcher's watermark.
    BeforeWatermark,
    /// The watcher reported the event itself.
    SelfReported,
    /// The event carries no location.
    EventWithoutLocation,
    /// The watcher has no known location.
    WatcherWithoutLocation,
    /// The event lies outside the watcher's radius.
    OutOfRange {
        /// Measured distance.
        distance_km: f64,
    },
    /// The event already produced an alert in this session.
    Duplicate,
}

/// Result of matching one event against one watcher.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutput {
    Skip(SkipReason),
    Match(Alert),
}

/// Checks watermark, self-exclusion, event location, watcher location and
/// radius, in that order; the first failing check names the `SkipReason`.
#[must_use]
pub fn evaluate(watcher: &Watcher, event: &HazardEvent) -> MatchOutput {
    if event.created_at < watcher.watermark {
        return MatchOutput::Skip(SkipReason::BeforeWatermark);
    }
    if event.reporter_id == watcher.watcher_id {
        return MatchOutput::Skip(SkipReason::SelfReported);
    }

    let Some(event_location) = event.location else {
        return MatchOutput::Skip(SkipReason::EventWithoutLocation);
    };
    let Some(watcher_location) = watcher.location else {
        return MatchOutput::Skip(SkipReason::WatcherWithoutLocation);
    };

    let distance = distance_km(event_location, watcher_location);
    if distance > watcher.radius_km {
        return MatchOutput::Skip(SkipReason::OutOfRange { distance_km: distance });
    }

    MatchOutput::Match(Alert {
        event_id: event.id,
        distance_km: distance,
        label: event.label.clone(),
        reported_at: event.created_at,
    })
}

/// Bounded set of alerted event ids, evicting the oldest first.
///
/// Feed delivery is ordered by `created_at`, so the evicted ids are the ones
/// least likely to be redelivered.
#[derive(Debug)]
pub struct SeenEvents {
    capacity: usize,
    order: VecDeque<HazardEventId>,
    ids: HashSet<HazardEventId>,
}

impl SeenEvents {
    /// Creates an empty set holding at most `capacity` ids.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity.min(1024)),
            ids: HashSet::with_capacity(capacity.min(1024)),
        }
    }

    /// Records `id`; returns false if it was already present.
    pub fn insert(&mut self, id: HazardEventId) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
        true
    }

    /// Returns true if `id` is currently remembered.
    #[must_use]
    pub fn contains(&self, id: &HazardEventId) -> bool {
        self.ids.contains(id)
    }

    /// Number of remembered ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns true if nothing is remembered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Matching state for one live session.
#[derive(Debug)]
pub struct SessionMatcher {
    watcher: Watcher,
    seen: SeenEvents,
}

impl SessionMatcher {
    /// Starts with an empty dedupe set of at most `dedupe_capacity` ids.
    #[must_use]
    pub fn new(watcher: Watcher, dedupe_capacity: usize) -> Self {
        Self {
            watcher,
            seen: SeenEvents::new(dedupe_capacity),
        }
    }

    /// The watcher being matched.
    #[must_use]
    pub const fn watcher(&self) -> &Watcher {
        &self.watcher
    }

    /// Evaluates an event, suppressing ids that already alerted.
    pub fn observe(&mut self, event: &HazardEvent) -> MatchOutput {
        match evaluate(&self.watcher, event) {
            MatchOutput::Match(alert) => {
                if self.seen.insert(alert.event_id) {
                    MatchOutput::Match(alert)
                } else {
                    MatchOutput::Skip(SkipReason::Duplicate)
                }
            }
            skip => skip,
        }
    }
}
