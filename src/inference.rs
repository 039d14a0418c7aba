//! Model adapter abstractions
//!
//! Each vision capability the pipeline consumes is a small synchronous trait.
//! Adapters may fail; the pipeline turns failures into the stage's "no data"
//! value, so implementations should report errors rather than guess.

use crate::error::Result;
use crate::types::{BoundingBox, DepthMap, DetectedObject, FoodMask};
use image::{DynamicImage, RgbImage};

/// Sentinel label for a classifier that cannot tell what it is looking at
pub const UNKNOWN_LABEL: &str = "Unknown";

/// Object detection over the whole image
pub trait ObjectDetector: Send + Sync {
    /// Model key this detector was built from
    fn name(&self) -> &str;

    /// Detect labelled boxes in source-pixel coordinates.
    ///
    /// Returns an empty vector, not an error, when nothing is found.
    ///
    /// # Errors
    /// - Model inference failures
    /// - Output tensors with an unexpected layout
    fn detect(&self, image: &RgbImage) -> Result<Vec<DetectedObject>>;
}

/// Box-prompted segmentation
pub trait FoodSegmenter: Send + Sync {
    fn name(&self) -> &str;

    /// Candidate masks for the object inside `bbox`, each the size of `image`.
    ///
    /// An empty vector means no usable mask.
    ///
    /// # Errors
    /// - Encoder or decoder inference failures
    fn segment(&self, image: &RgbImage, bbox: &BoundingBox) -> Result<Vec<FoodMask>>;
}

/// Monocular relative depth
pub trait DepthEstimator: Send + Sync {
    fn name(&self) -> &str;

    /// Depth map with the same dimensions as `image`, or `None` when unavailable
    ///
    /// # Errors
    /// - Model inference failures
    fn estimate_depth(&self, image: &RgbImage) -> Result<Option<DepthMap>>;
}

/// Food classification of a crop or a whole photo
pub trait FoodClassifier: Send + Sync {
    fn name(&self) -> &str;

    /// Human-readable food label, [`UNKNOWN_LABEL`] when uncertain
    ///
    /// # Errors
    /// - Model inference failures
    fn classify(&self, image: &DynamicImage) -> Result<String>;
}

/// Whether a classifier label carries no information
#[must_use]
pub fn is_uninformative_label(label: &str) -> bool {
    let label = label.trim();
    label.is_empty() || label.eq_ignore_ascii_case("unknown") || label.eq_ignore_ascii_case("other")
}
