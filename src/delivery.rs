//! Push delivery boundary.
//!
//! The transport itself is external. It accepts a bounded batch of opaque
//! delivery addresses and reports a result per address; a transport-level
//! failure is returned as a `DeliveryError` for the whole batch.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;

/// Opaque push token identifying one device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeliveryAddress(String);

impl DeliveryAddress {
    /// Wraps a transport-specific device token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The full token.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeliveryAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Tokens are credentials of a sort; keep logs short.
        let shown: String = self.0.chars().take(8).collect();
        if self.0.chars().count() > 8 {
            write!(f, "{shown}…")
        } else {
            f.write_str(&shown)
        }
    }
}

impl From<&str> for DeliveryAddress {
    fn from(token: &str) -> Self {
        Self(token.to_string())
    }
}

/// Title and body of a push notification.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
}

impl Notification {
    /// Creates a notification from a title and body.
    #[must_use]
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
        }
    }
}

/// Per-address outcome reported by the transport.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Delivered,
    Failed { reason: String },
}

/// Result for one address of a batch.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryResult {
    pub address: DeliveryAddress,
    pub outcome: DeliveryOutcome,
}

impl DeliveryResult {
    /// The transport accepted `address`.
    #[must_use]
    pub fn delivered(address: DeliveryAddress) -> Self {
        Self {
            address,
            outcome: DeliveryOutcome::Delivered,
        }
    }

    /// The transport rejected `address` for `reason`.
    #[must_use]
    pub fn failed(address: DeliveryAddress, reason: impl Into<String>) -> Self {
        Self {
            address,
            outcome: DeliveryOutcome::Failed { reason: reason.into() },
        }
    }

    /// Returns true if the address accepted the push.
    #[must_use]
    pub const fn is_delivered(&self) -> bool {
        matches!(self.outcome, DeliveryOutcome::Delivered)
    }
}

/// A per-address failure, recorded without affecting sibling deliveries.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryFailure {
    pub address: DeliveryAddress,
    pub reason: String,
}

/// Push transport.
///
/// Implementations must return one result per address. They may block; the
/// dispatcher bounds every call with a timeout.
pub trait NotificationSender: Send + Sync {
    /// Send `notification` to every address in `addresses`.
    fn send(
        &self,
        addresses: &[DeliveryAddress],
        notification: &Notification,
    ) -> Result<Vec<DeliveryResult>, DeliveryError>;
}

/// Sender that logs each batch and reports every address as delivered.
///
/// Used by the relay binary when no real transport is wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSender;

impl NotificationSender for LoggingSender {
    fn send(
        &self,
        addresses: &[DeliveryAddress],
        notification: &Notification,
    ) -> Result<Vec<DeliveryResult>, DeliveryError> {
        tracing::info!(recipients = addresses.len(), title = %notification.title, "push batch");
        for address in addresses {
            tracing::debug!(address = %address, body = %notification.body, "push");
        }
        Ok(addresses.iter().cloned().map(DeliveryResult::delivered).collect())
    }
}
