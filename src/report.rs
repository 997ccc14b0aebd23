//! Capture, classify and append.
//!
//! A reporting device photographs the road, runs the image through a
//! `Classifier`, and appends the labelled result to the hazard feed.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{ClassifierError, HazardResult};
use crate::event::{HazardEventId, NewHazard, UserId};
use crate::feed::HazardFeed;
use crate::geo::Coordinate;

/// Source tag attached to reports from the mobile client.
pub const DEFAULT_REPORT_SOURCE: &str = "android_app";

/// Winning label of a classification.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub label: String,
    pub confidence: f32,
}

impl Classification {
    /// Arg-max over `(label, probability)` pairs. On ties the earlier pair
    /// wins.
    ///
    /// # Errors
    ///
    /// `NoScores` for an empty input, `InvalidScore` for a NaN or a value
    /// outside `[0, 1]`.
    pub fn from_scores<I, L>(scores: I) -> Result<Self, ClassifierError>
    where
        I: IntoIterator<Item = (L, f32)>,
        L: Into<String>,
    {
        let mut best: Option<Self> = None;

        for (label, value) in scores {
            let label = label.into();
            if !(0.0..=1.0).contains(&value) {
                return Err(ClassifierError::InvalidScore { label, value });
            }
            match &best {
                Some(b) if b.confidence >= value => {}
                _ => {
                    best = Some(Self {
                        label,
                        confidence: value,
                    });
                }
            }
        }

        best.ok_or(ClassifierError::NoScores)
    }
}

/// Image classifier.
pub trait Classifier: Send + Sync {
    /// Label an encoded image.
    fn classify(&self, image: &[u8]) -> Result<Classification, ClassifierError>;
}

/// Appends classified reports to the feed.
pub struct HazardReporter {
    classifier: Arc<dyn Classifier>,
    feed: Arc<dyn HazardFeed>,
    source: String,
}

impl std::fmt::Debug for HazardReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HazardReporter")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl HazardReporter {
    /// Creates a reporter that classifies with `classifier` and appends to `feed`.
    #[must_use]
    pub fn new(classifier: Arc<dyn Classifier>, feed: Arc<dyn HazardFeed>) -> Self {
        Self {
            classifier,
            feed,
            source: DEFAULT_REPORT_SOURCE.to_string(),
        }
    }

    /// Tags every appended report with `source`.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Classify `image` and append the report.
    ///
    /// A report without a location is still appended; matching and fan-out
    /// skip it.
    ///
    /// # Errors
    ///
    /// `ClassifierError` if the image cannot be labelled, `FeedError` if the
    /// append fails. Nothing is appended in either case.
    pub fn report(
        &self,
        reporter_id: impl Into<UserId>,
        location: Option<Coordinate>,
        image: &[u8],
    ) -> HazardResult<(HazardEventId, Classification)> {
        if image.is_empty() {
            return Err(ClassifierError::EmptyImage.into());
        }

        let reporter_id = reporter_id.into();
        let classification = self.classifier.classify(image)?;

        let draft = NewHazard {
            reporter_id: reporter_id.clone(),
            location,
            label: classification.label.clone(),
            source: Some(self.source.clone()),
        };
        let event_id = self.feed.append(draft)?;

        match location {
            Some(location) => tracing::info!(
                %event_id,
                reporter_id = %reporter_id,
                %location,
                label = %classification.label,
                confidence = classification.confidence,
                "hazard reported"
            ),
            None => tracing::warn!(
                %event_id,
                reporter_id = %reporter_id,
                label = %classification.label,
                "hazard reported without a location"
            ),
        }

        Ok((event_id, classification))
    }
}
