//! Error types for hazardwatch.
//!
//! Errors are strongly typed using thiserror and grouped by the boundary they
//! come from: caller configuration, the hazard feed, the subscriber directory
//! and the push transport. Filtering an event out is never an error.

use serde::Serialize;
use thiserror::Error;

/// Invalid input supplied by a caller at subscribe or construction time.
///
/// These are surfaced to the caller and never retried.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigurationError {
    /// `start` was called without a location.
    #[error("Watcher has no known location")]
    MissingLocation,

    /// A radius that is zero, negative or not finite.
    #[error("Radius {value} km is invalid; must be finite and greater than zero")]
    InvalidRadius {
        /// The rejected radius.
        value: f64,
    },

    /// A latitude or longitude outside its valid range.
    #[error("{field} {value} is out of range [{min}, {max}]")]
    CoordinateOutOfRange {
        /// `"latitude"` or `"longitude"`.
        field: &'static str,
        /// The rejected value.
        value: f64,
        /// Lower bound.
        min: f64,
        /// Upper bound.
        max: f64,
    },
}

/// Errors raised by a hazard feed or one of its change subscriptions.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FeedError {
    /// The change subscription dropped. Recovered by resubscribing.
    #[error("Feed subscription disconnected: {reason}")]
    Disconnected {
        /// What closed the subscription.
        reason: String,
    },

    /// Resubscription failed after every allowed attempt.
    #[error("Feed connectivity lost after {attempts} resubscribe attempts: {last_error}")]
    ConnectivityLost {
        /// Resubscribe attempts made.
        attempts: u32,
        /// Error from the final attempt.
        last_error: String,
    },

    /// No notification arrived within the wait.
    #[error("Timed out waiting {duration_ms}ms for a feed notification")]
    Timeout {
        /// How long the caller waited.
        duration_ms: u64,
    },

    /// The store refused or failed the operation.
    #[error("Feed backend error: {0}")]
    Backend(String),
}

/// Errors raised while reading the subscriber directory.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DirectoryError {
    /// The directory cannot be read right now; worth retrying later.
    #[error("Directory unavailable: {0}")]
    Unavailable(String),

    /// The directory failed in a way a retry will not fix.
    #[error("Directory backend error: {0}")]
    Backend(String),
}

/// Batch-level push transport failures.
///
/// Per-address rejections are reported as `DeliveryFailure` records instead,
/// since they never abort delivery to the rest of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeliveryError {
    /// The transport rejected the whole batch.
    #[error("Push transport failed: {message}")]
    Transport {
        /// Transport-specific detail.
        message: String,
    },

    /// The send did not return within `send_timeout_ms`.
    #[error("Push send timed out after {duration_ms}ms")]
    Timeout {
        /// The configured limit.
        duration_ms: u64,
    },

    /// The sender returned one result per address, but not for this batch.
    #[error("Sender returned {actual} results for a batch of {expected}")]
    ResultCountMismatch {
        /// Addresses in the batch.
        expected: usize,
        /// Results returned.
        actual: usize,
    },
}

/// Errors raised by an image classifier.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClassifierError {
    /// No image bytes were supplied.
    #[error("Image is empty")]
    EmptyImage,

    /// The model returned an empty score list.
    #[error("Classifier produced no scores")]
    NoScores,

    /// A score outside `[0, 1]` or not finite.
    #[error("Score for '{label}' is not a probability: {value}")]
    InvalidScore {
        /// Label the score belongs to.
        label: String,
        /// The rejected score.
        value: f32,
    },
}

impl DeliveryError {
    /// Transport failures and timeouts may succeed on a later attempt. A
    /// malformed reply is not retried, since some addresses may already
    /// have been pushed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Timeout { .. })
    }
}

/// Top-level error type for hazardwatch.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HazardError {
    /// Invalid caller input.
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// Hazard feed failure.
    #[error("Feed error: {0}")]
    Feed(#[from] FeedError),

    /// Subscriber directory failure.
    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),

    /// Push transport failure.
    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    /// Image classification failure.
    #[error("Classifier error: {0}")]
    Classifier(#[from] ClassifierError),

    /// A broken internal assumption, such as a thread that failed to spawn.
    #[error("Internal error: {message}")]
    Internal {
        /// What went wrong.
        message: String,
    },
}

impl HazardError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a configuration error.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    /// Returns true if this is a feed error.
    #[must_use]
    pub const fn is_feed(&self) -> bool {
        matches!(self, Self::Feed(_))
    }

    /// Returns true if this is a delivery error.
    #[must_use]
    pub const fn is_delivery(&self) -> bool {
        matches!(self, Self::Delivery(_))
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Configuration(_) => false, // Bad input won't change on retry
            Self::Feed(e) => matches!(e, FeedError::Disconnected { .. } | FeedError::Timeout { .. }),
            Self::Directory(e) => matches!(e, DirectoryError::Unavailable(_)),
            Self::Delivery(e) => e.is_retryable(),
            Self::Classifier(_) => false,
            Self::Internal { .. } => false,
        }
    }
}

/// Result type alias for hazardwatch operations.
pub type HazardResult<T> = Result<T, HazardError>;
