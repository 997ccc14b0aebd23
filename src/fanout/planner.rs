//! Recipient selection and batching.
//!
//! Planning is pure: given an event and a directory snapshot it decides who
//! gets notified and how the recipients are split into transport batches.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::delivery::DeliveryAddress;
use crate::directory::SubscriberRecord;
use crate::event::{HazardEvent, HazardEventId};
use crate::geo::within_radius;

/// Deterministic batch identifier, derived from the event id and batch index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(Uuid);

impl BatchId {
    /// Same event and index always produce the same id, so a replayed
    /// dispatch can be correlated with its earlier failure reports.
    #[must_use]
    pub fn derive(event_id: &HazardEventId, index: usize) -> Self {
        let index = u64::try_from(index).unwrap_or(u64::MAX);
        Self(Uuid::new_v5(event_id.as_uuid(), &index.to_be_bytes()))
    }

    /// The underlying name-based UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One transport call's worth of recipients.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub id: BatchId,
    pub index: usize,
    pub addresses: Vec<DeliveryAddress>,
}

/// Why an event produced no plan at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanoutSkip {
    /// The report carried no location.
    NoLocation,
}

/// Recipients of one event, already split into batches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanoutPlan {
    /// Event the plan belongs to.
    pub event_id: HazardEventId,
    /// Records in the snapshot.
    pub considered: usize,
    /// Records with both a location and a delivery address.
    pub reachable: usize,
    /// Distinct addresses selected.
    pub recipients: usize,
    /// Batches in dispatch order.
    pub batches: Vec<Batch>,
}

/// Select recipients for `event` from `snapshot` and chunk them.
///
/// A record is selected when it has a location and an address, is not the
/// reporter, and lies within `radius_km` of the event. Duplicate addresses are
/// collapsed so a device is pushed once per event. Every batch but the last
/// holds exactly `batch_size` addresses.
pub fn plan(
    event: &HazardEvent,
    snapshot: &[SubscriberRecord],
    radius_km: f64,
    batch_size: usize,
) -> Result<FanoutPlan, FanoutSkip> {
    let origin = event.location.ok_or(FanoutSkip::NoLocation)?;
    let batch_size = batch_size.max(1);

    let mut reachable = 0usize;
    let mut seen: HashSet<&DeliveryAddress> = HashSet::new();
    let mut recipients: Vec<DeliveryAddress> = Vec::new();

    for record in snapshot {
        let Some((location, address)) = record.reachable() else {
            continue;
        };
        reachable += 1;

        if record.subscriber_id == event.reporter_id {
            continue;
        }
        if within_radius(origin, location, radius_km).is_none() {
            continue;
        }
        if seen.insert(address) {
            recipients.push(address.clone());
        }
    }

    let batches = recipients
        .chunks(batch_size)
        .enumerate()
        .map(|(index, chunk)| Batch {
            id: BatchId::derive(&event.id, index),
            index,
            addresses: chunk.to_vec(),
        })
        .collect();

    Ok(FanoutPlan {
        event_id: event.id,
        considered: snapshot.len(),
        reachable,
        recipients: recipients.len(),
        batches,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::event::NewHazard;
    use crate::geo::Coordinate;
    use crate::time::from_millis;

    fn at(lat: f64, lon: f64) -> Coordinate {
        Coordinate::new(lat, lon).unwrap()
    }

    fn event(reporter: &str, location: Option<Coordinate>) -> HazardEvent {
        let draft = match location {
            Some(loc) => NewHazard::new(reporter, loc, "pothole"),
            None => NewHazard::unlocated(reporter, "pothole"),
        };
        HazardEvent::from_draft(HazardEventId::new(), from_millis(1_000), draft)
    }

    fn subscriber(id: &str, loc: Coordinate, token: &str) -> SubscriberRecord {
        SubscriberRecord::new(id).with_location(loc).with_delivery_address(token)
    }

    #[test]
    fn unlocated_event_is_skipped() {
        let snap = vec![subscriber("a", at(0.0, 0.0), "ta")];
        assert_eq!(plan(&event("r", None), &snap, 5.0, 500), Err(FanoutSkip::NoLocation));
    }

    #[test]
    fn filters_reporter_range_and_incomplete_records() {
        let origin = at(45.0, 7.0);
        let snap = vec![
            subscriber("reporter", origin, "t-reporter"),
            subscriber("near", at(45.01, 7.0), "t-near"),
            subscriber("far", at(46.0, 7.0), "t-far"),
            SubscriberRecord::new("no-addr").with_location(origin),
            SubscriberRecord::new("no-loc").with_delivery_address("t-noloc"),
        ];

        let plan = plan(&event("reporter", Some(origin)), &snap, 5.0, 500).unwrap();
        assert_eq!(plan.considered, 5);
        assert_eq!(plan.reachable, 3);
        assert_eq!(plan.recipients, 1);
        assert_eq!(plan.batches.len(), 1);
        assert_eq!(plan.batches[0].addresses, vec![DeliveryAddress::from("t-near")]);
    }

    #[test]
    fn chunks_into_full_batches_then_remainder() {
        let origin = at(0.0, 0.0);
        let snap: Vec<_> = (0..1200).map(|i| subscriber(&format!("s{i}"), origin, &format!("t{i}"))).collect();

        let plan = plan(&event("r", Some(origin)), &snap, 5.0, 500).unwrap();
        let sizes: Vec<_> = plan.batches.iter().map(|b| b.addresses.len()).collect();
        assert_eq!(sizes, vec![500, 500, 200]);
        assert_eq!(plan.batches[2].index, 2);
    }

    #[test]
    fn duplicate_addresses_are_collapsed() {
        let origin = at(0.0, 0.0);
        let snap = vec![subscriber("a", origin, "shared"), subscriber("b", origin, "shared")];
        let plan = plan(&event("r", Some(origin)), &snap, 5.0, 10).unwrap();
        assert_eq!(plan.recipients, 1);
    }

    #[test]
    fn batch_ids_are_deterministic() {
        let id = HazardEventId::new();
        assert_eq!(BatchId::derive(&id, 3), BatchId::derive(&id, 3));
        assert_ne!(BatchId::derive(&id, 3), BatchId::derive(&id, 4));
    }

    #[test]
    fn empty_plan_when_nobody_in_range() {
        let plan = plan(&event("r", Some(at(0.0, 0.0))), &[], 5.0, 500).unwrap();
        assert!(plan.batches.is_empty());
    }
}
