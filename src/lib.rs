//! # hazardwatch - Geofenced road-hazard alerting
//!
//! Devices report road hazards (potholes, speed bumps) into an append-only
//! feed. Two consumers follow that feed:
//!
//! - **Live matching** (`watch`): each watching client raises a local alert for
//!   every hazard reported after it started listening, by someone else, within
//!   its radius. Each hazard alerts at most once per session.
//! - **Fan-out** (`fanout`): a server-side service pushes a notification to
//!   every subscriber whose last known location is near a new hazard, in
//!   bounded batches with retry, timeouts and failure reporting.
//!
//! ## Core Concepts
//!
//! - **Watermark**: the instant a watch session started; older hazards never alert
//! - **Feed**: append-only store with a change subscription (`HazardFeed`)
//! - **Directory**: subscriber locations and push addresses (`SubscriberDirectory`)
//! - **Sender**: the push transport (`NotificationSender`)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use hazardwatch::{alert_channel, Coordinate, InMemoryHazardFeed, LiveMatcher, NewHazard, WatchConfig};
//!
//! let feed = Arc::new(InMemoryHazardFeed::new());
//! let matcher = LiveMatcher::new(feed.clone(), WatchConfig::default());
//! let (sink, alerts) = alert_channel(64);
//!
//! matcher.start("user_me", Some(Coordinate::new(10.0, 10.0)?), None, Arc::new(sink))?;
//! feed.append(NewHazard::new("user_other", Coordinate::new(10.02, 10.0)?, "pothole"))?;
//! let alert = alerts.recv();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod error;
pub mod event;
pub mod geo;
pub mod time;

// Boundaries
pub mod config;
pub mod delivery;
pub mod directory;
pub mod feed;

// Consumers and producers
pub mod fanout;
pub mod report;
pub mod watch;

pub use config::{
    load_config, load_config_with_source, ConfigError, ConfigSource, FanoutConfig, HazardConfig, LoggingConfig,
    WatchConfig,
};
pub use delivery::{
    DeliveryAddress, DeliveryFailure, DeliveryOutcome, DeliveryResult, LoggingSender, Notification,
    NotificationSender,
};
pub use directory::{InMemorySubscriberDirectory, SubscriberDirectory, SubscriberRecord};
pub use error::{
    ClassifierError, ConfigurationError, DeliveryError, DirectoryError, FeedError, HazardError, HazardResult,
};
pub use event::{AppendNotification, HazardEvent, HazardEventId, NewHazard, UserId};
pub use fanout::{
    BatchId, DispatchFailure, DispatchSummary, FailureReports, FanoutDispatcher, FanoutService, FanoutSkip,
    ServiceStats,
};
pub use feed::{FeedSubscription, HazardFeed, InMemoryHazardFeed};
pub use geo::{distance_km, within_radius, Coordinate, EARTH_RADIUS_KM};
pub use report::{Classification, Classifier, HazardReporter};
pub use time::{Clock, ManualClock, SystemClock};
pub use watch::{
    alert_channel, Alert, AlertSink, AlertStream, LiveMatcher, MatcherState, SessionEvent, StartOutcome,
};
