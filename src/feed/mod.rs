//! Hazard feed boundary.
//!
//! The trait describes the external append-only store; the in-memory backend
//! is a reference implementation for embedding and tests.

mod memory;
mod resubscribe;
mod traits;

pub use memory::{InMemoryHazardFeed, DEFAULT_SUBSCRIPTION_CAPACITY};
pub use resubscribe::{resubscribe, Resubscribe, ResubscribePolicy};
pub use traits::{FeedSubscription, HazardFeed, SubscriptionId};

pub(crate) use traits::duration_ms;
