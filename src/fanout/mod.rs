//! Server-side fan-out.
//!
//! For each appended hazard, notify every subscriber whose last known
//! location lies within the fan-out radius, in bounded batches with retry.

/// Batch dispatch with retry, timeout and failure reporting.
pub mod dispatcher;
/// Recipient selection and batching.
pub mod planner;
/// Feed listener and worker pool.
pub mod service;

pub use dispatcher::{DispatchFailure, DispatchSummary, FailureReports, FanoutDispatcher};
pub use planner::{plan, Batch, BatchId, FanoutPlan, FanoutSkip};
pub use service::{FanoutService, ServiceStats};
