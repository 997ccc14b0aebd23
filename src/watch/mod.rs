//! Client-side live matching.
//!
//! Each watching client owns one `LiveMatcher`. A started session subscribes
//! to the hazard feed, remembers the instant it started (its watermark), and
//! raises an alert for each new, foreign, nearby hazard exactly once.

/// Watermark, self-exclusion, radius and dedupe checks.
pub mod matcher;
/// Session lifecycle and worker thread.
pub mod session;
/// Alert sinks and the channel-backed alert stream.
pub mod stream;

pub use matcher::{evaluate, Alert, MatchOutput, SessionMatcher, SkipReason, Watcher};
pub use session::{LiveMatcher, MatcherState, StartOutcome};
pub use stream::{alert_channel, AlertSink, AlertStream, ChannelAlertSink, SessionEvent};
