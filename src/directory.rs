//! Subscriber directory.
//!
//! The directory maps each subscriber to its last reported location and push
//! address. An external registration flow keeps it current; the fan-out only
//! ever reads snapshots of it, so a snapshot may be slightly stale.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::delivery::DeliveryAddress;
use crate::error::DirectoryError;
use crate::event::UserId;
use crate::geo::Coordinate;
use crate::time::{Clock, SystemClock};

/// Durable, addressable identity of a watcher.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriberRecord {
    pub subscriber_id: UserId,
    #[serde(default)]
    pub location: Option<Coordinate>,
    #[serde(default)]
    pub delivery_address: Option<DeliveryAddress>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl SubscriberRecord {
    /// A record with no location or address yet.
    #[must_use]
    pub fn new(subscriber_id: impl Into<UserId>) -> Self {
        Self {
            subscriber_id: subscriber_id.into(),
            location: None,
            delivery_address: None,
            updated_at: Utc::now(),
        }
    }

    /// Sets the last known location.
    #[must_use]
    pub fn with_location(mut self, location: Coordinate) -> Self {
        self.location = Some(location);
        self
    }

    /// Sets the push address.
    #[must_use]
    pub fn with_delivery_address(mut self, address: impl Into<DeliveryAddress>) -> Self {
        self.delivery_address = Some(address.into());
        self
    }

    /// Location and address, when both are known.
    #[must_use]
    pub fn reachable(&self) -> Option<(Coordinate, &DeliveryAddress)> {
        Some((self.location?, self.delivery_address.as_ref()?))
    }
}

/// Read side of the directory consumed by the fan-out.
pub trait SubscriberDirectory: Send + Sync {
    /// Every current record. The caller owns the returned copy.
    fn snapshot(&self) -> Result<Vec<SubscriberRecord>, DirectoryError>;
}

/// In-memory directory, ordered by subscriber id.
pub struct InMemorySubscriberDirectory {
    clock: Arc<dyn Clock>,
    records: RwLock<BTreeMap<UserId, SubscriberRecord>>,
    available: AtomicBool,
}

impl std::fmt::Debug for InMemorySubscriberDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemorySubscriberDirectory")
            .field("available", &self.available.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Default for InMemorySubscriberDirectory {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_err(context: &'static str) -> DirectoryError {
    DirectoryError::Backend(format!("poisoned lock: {context}"))
}

impl InMemorySubscriberDirectory {
    /// An empty directory stamping updates with the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// An empty directory stamping updates with `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            records: RwLock::new(BTreeMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Insert or replace a record, stamping `updated_at`.
    pub fn upsert(&self, mut record: SubscriberRecord) -> Result<(), DirectoryError> {
        record.updated_at = self.clock.now();
        let mut records = self.records.write().map_err(|_| lock_err("directory"))?;
        records.insert(record.subscriber_id.clone(), record);
        Ok(())
    }

    /// Record a new last-known location, creating the subscriber if needed.
    pub fn update_location(&self, id: &UserId, location: Option<Coordinate>) -> Result<(), DirectoryError> {
        let now = self.clock.now();
        let mut records = self.records.write().map_err(|_| lock_err("directory"))?;
        let record = records.entry(id.clone()).or_insert_with(|| SubscriberRecord::new(id.clone()));
        record.location = location;
        record.updated_at = now;
        Ok(())
    }

    /// Record a new push address, creating the subscriber if needed.
    pub fn update_delivery_address(
        &self,
        id: &UserId,
        address: Option<DeliveryAddress>,
    ) -> Result<(), DirectoryError> {
        let now = self.clock.now();
        let mut records = self.records.write().map_err(|_| lock_err("directory"))?;
        let record = records.entry(id.clone()).or_insert_with(|| SubscriberRecord::new(id.clone()));
        record.delivery_address = address;
        record.updated_at = now;
        Ok(())
    }

    /// Remove a subscriber. Returns the removed record, if any.
    pub fn remove(&self, id: &UserId) -> Result<Option<SubscriberRecord>, DirectoryError> {
        let mut records = self.records.write().map_err(|_| lock_err("directory"))?;
        Ok(records.remove(id))
    }

    /// Looks up one subscriber.
    pub fn get(&self, id: &UserId) -> Result<Option<SubscriberRecord>, DirectoryError> {
        let records = self.records.read().map_err(|_| lock_err("directory"))?;
        Ok(records.get(id).cloned())
    }

    /// Number of subscribers.
    pub fn len(&self) -> Result<usize, DirectoryError> {
        let records = self.records.read().map_err(|_| lock_err("directory"))?;
        Ok(records.len())
    }

    /// Returns true if there are no subscribers.
    pub fn is_empty(&self) -> Result<bool, DirectoryError> {
        Ok(self.len()? == 0)
    }

    /// When false, `snapshot` fails with `DirectoryError::Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }
}

impl SubscriberDirectory for InMemorySubscriberDirectory {
    fn snapshot(&self) -> Result<Vec<SubscriberRecord>, DirectoryError> {
        if !self.available.load(Ordering::Relaxed) {
            return Err(DirectoryError::Unavailable("directory marked unavailable".to_string()));
        }
        let records = self.records.read().map_err(|_| lock_err("directory"))?;
        Ok(records.values().cloned().collect())
    }
}
