//! Hazard events and the identities attached to them.
//!
//! A `HazardEvent` is immutable once the feed has appended it: the feed
//! assigns its id and creation time, and nothing in this crate mutates or
//! deletes it afterwards.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geo::Coordinate;

/// Store-assigned unique identifier for an appended hazard event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HazardEventId(Uuid);

impl HazardEventId {
    /// Creates a new random event ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an event ID from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for HazardEventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HazardEventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identity of a device or user.
///
/// Reporters, watchers and directory subscribers share this namespace, which
/// is what lets a watcher recognise (and skip) its own reports.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Wraps an existing identity string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh per-install identity of the form `user_<16 hex>`.
    ///
    /// ```
    /// use hazardwatch::UserId;
    ///
    /// let id = UserId::generate();
    /// assert!(id.as_str().starts_with("user_"));
    /// assert_eq!(id.as_str().len(), 21);
    /// ```
    #[must_use]
    pub fn generate() -> Self {
        let hex = Uuid::new_v4().simple().to_string();
        Self(format!("user_{}", &hex[..16]))
    }

    /// Borrows the identity string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for UserId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A hazard report as submitted, before the feed assigns id and time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewHazard {
    /// Who reported the hazard.
    pub reporter_id: UserId,

    /// Where the hazard was seen. Reports without a location are stored but
    /// never matched or fanned out.
    #[serde(default)]
    pub location: Option<Coordinate>,

    /// Classification label, e.g. "pothole" or "speedbump".
    pub label: String,

    /// Free-form origin tag, e.g. "android_app".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl NewHazard {
    /// Creates a located report.
    #[must_use]
    pub fn new(reporter_id: impl Into<UserId>, location: Coordinate, label: impl Into<String>) -> Self {
        Self {
            reporter_id: reporter_id.into(),
            location: Some(location),
            label: label.into(),
            source: None,
        }
    }

    /// Creates a report that carries no location.
    #[must_use]
    pub fn unlocated(reporter_id: impl Into<UserId>, label: impl Into<String>) -> Self {
        Self {
            reporter_id: reporter_id.into(),
            location: None,
            label: label.into(),
            source: None,
        }
    }

    /// Sets the origin tag.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// An appended, immutable hazard report.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HazardEvent {
    pub id: HazardEventId,
    pub reporter_id: UserId,
    #[serde(default)]
    pub location: Option<Coordinate>,
    /// Store-assigned; non-decreasing in append order.
    pub created_at: DateTime<Utc>,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl HazardEvent {
    /// Materializes a draft with its store-assigned id and creation time.
    #[must_use]
    pub fn from_draft(id: HazardEventId, created_at: DateTime<Utc>, draft: NewHazard) -> Self {
        Self {
            id,
            reporter_id: draft.reporter_id,
            location: draft.location,
            created_at,
            label: draft.label,
            source: draft.source,
        }
    }
}

/// Change notification delivered for every append.
#[derive(Debug, Clone, PartialEq)]
pub struct AppendNotification {
    /// The event that was just appended.
    pub event: HazardEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_user_ids_are_distinct() {
        let a = UserId::generate();
        let b = UserId::generate();
        assert_ne!(a, b);
        assert!(a.as_str()[5..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn event_json_shape() {
        let draft = NewHazard::new("u1", Coordinate::new(1.0, 2.0).unwrap(), "pothole").with_source("android_app");
        let event = HazardEvent::from_draft(HazardEventId::new(), crate::time::from_millis(5), draft);
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["reporter_id"], "u1");
        assert_eq!(v["location"]["lat"], 1.0);
        assert_eq!(v["source"], "android_app");

        let back: HazardEvent = serde_json::from_value(v).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn draft_without_location_deserializes() {
        let draft: NewHazard = serde_json::from_str(r#"{"reporter_id": "u9", "label": "speedbump"}"#).unwrap();
        assert_eq!(draft.location, None);
        assert_eq!(draft.source, None);
    }
}
