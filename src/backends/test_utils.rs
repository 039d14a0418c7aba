//! Test utilities and mock adapters
//!
//! Mock implementations of the adapter traits so the pipeline can be exercised
//! without model files or ONNX Runtime. Every mock records its calls for
//! verification and can be configured to fail.

use crate::{
    error::{NutrilensError, Result},
    inference::{DepthEstimator, FoodClassifier, FoodSegmenter, ObjectDetector, UNKNOWN_LABEL},
    types::{BoundingBox, DepthMap, DetectedObject, FoodMask},
};
use image::{DynamicImage, RgbImage};
use ndarray::Array2;
use std::sync::{Arc, Mutex};

/// Shared call log
#[derive(Debug, Clone, Default)]
pub struct CallHistory(Arc<Mutex<Vec<String>>>);

impl CallHistory {
    fn record(&self, call: String) {
        if let Ok(mut history) = self.0.lock() {
            history.push(call);
        }
    }

    /// Snapshot of recorded calls
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.0.lock().map(|h| h.clone()).unwrap_or_default()
    }

    /// Number of recorded calls
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.lock().map(|h| h.len()).unwrap_or_default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut history) = self.0.lock() {
            history.clear();
        }
    }
}

/// Detector returning a fixed list of objects
#[derive(Debug, Clone, Default)]
pub struct MockDetector {
    objects: Vec<DetectedObject>,
    should_fail: bool,
    history: CallHistory,
}

impl MockDetector {
    #[must_use]
    pub fn new(objects: Vec<DetectedObject>) -> Self {
        Self {
            objects,
            ..Self::default()
        }
    }

    /// Detector that finds nothing
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Detector whose inference always fails
    #[must_use]
    pub fn new_failing() -> Self {
        Self {
            should_fail: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn history(&self) -> CallHistory {
        self.history.clone()
    }
}

impl ObjectDetector for MockDetector {
    fn name(&self) -> &str {
        "mock-detector"
    }

    fn detect(&self, image: &RgbImage) -> Result<Vec<DetectedObject>> {
        self.history.record(format!("detect {}x{}", image.width(), image.height()));
        if self.should_fail {
            return Err(NutrilensError::inference("Mock detector inference failed"));
        }
        Ok(self.objects.clone())
    }
}

/// What a [`MockSegmenter`] returns for one call
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MaskBehavior {
    /// Mask exactly filling the prompt box
    FillBox,
    /// Mask covering this fraction of the image, filled row by row from the top
    Coverage(f64),
    /// No mask
    Empty,
    /// Inference error
    Fail,
}

/// Segmenter driven by a per-call behavior script; the last entry repeats
#[derive(Debug, Clone)]
pub struct MockSegmenter {
    script: Vec<MaskBehavior>,
    history: CallHistory,
}

impl MockSegmenter {
    #[must_use]
    pub fn new(behavior: MaskBehavior) -> Self {
        Self::scripted(vec![behavior])
    }

    /// Segmenter that returns the prompt box as mask
    #[must_use]
    pub fn fill_box() -> Self {
        Self::new(MaskBehavior::FillBox)
    }

    #[must_use]
    pub fn scripted(script: Vec<MaskBehavior>) -> Self {
        Self {
            script,
            history: CallHistory::default(),
        }
    }

    #[must_use]
    pub fn history(&self) -> CallHistory {
        self.history.clone()
    }

    fn coverage_mask(width: u32, height: u32, fraction: f64) -> FoodMask {
        let target = (f64::from(width) * f64::from(height) * fraction).round() as u64;
        FoodMask::from_fn(width, height, |x, y| u64::from(y) * u64::from(width) + u64::from(x) < target)
    }
}

impl FoodSegmenter for MockSegmenter {
    fn name(&self) -> &str {
        "mock-segmenter"
    }

    fn segment(&self, image: &RgbImage, bbox: &BoundingBox) -> Result<Vec<FoodMask>> {
        let call = self.history.len();
        self.history.record(format!(
            "segment [{:.0},{:.0},{:.0},{:.0}]",
            bbox.x1, bbox.y1, bbox.x2, bbox.y2
        ));

        let behavior = self
            .script
            .get(call)
            .or_else(|| self.script.last())
            .copied()
            .unwrap_or(MaskBehavior::Empty);
        let (width, height) = image.dimensions();

        match behavior {
            MaskBehavior::FillBox => Ok(vec![FoodMask::from_box(width, height, bbox)]),
            MaskBehavior::Coverage(fraction) => Ok(vec![Self::coverage_mask(width, height, fraction)]),
            MaskBehavior::Empty => Ok(Vec::new()),
            MaskBehavior::Fail => Err(NutrilensError::inference("Mock segmenter inference failed")),
        }
    }
}

/// Depth estimator returning a horizontal ramp, nothing, or an error
#[derive(Debug, Clone, Default)]
pub struct MockDepthEstimator {
    unavailable: bool,
    should_fail: bool,
    history: CallHistory,
}

impl MockDepthEstimator {
    /// Estimator producing a left-to-right depth ramp
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Estimator that reports no depth map
    #[must_use]
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn new_failing() -> Self {
        Self {
            should_fail: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn history(&self) -> CallHistory {
        self.history.clone()
    }
}

impl DepthEstimator for MockDepthEstimator {
    fn name(&self) -> &str {
        "mock-depth"
    }

    fn estimate_depth(&self, image: &RgbImage) -> Result<Option<DepthMap>> {
        self.history.record("estimate_depth".to_string());
        if self.should_fail {
            return Err(NutrilensError::inference("Mock depth inference failed"));
        }
        if self.unavailable {
            return Ok(None);
        }
        let (width, height) = image.dimensions();
        let values = Array2::from_shape_fn((height as usize, width as usize), |(_, x)| x as f32);
        Ok(Some(DepthMap::new(values)))
    }
}

/// Classifier answering from a script of labels; the last label repeats
#[derive(Debug, Clone)]
pub struct MockClassifier {
    labels: Vec<String>,
    should_fail: bool,
    history: CallHistory,
}

impl MockClassifier {
    #[must_use]
    pub fn new<S: Into<String>>(label: S) -> Self {
        Self::scripted(vec![label.into()])
    }

    #[must_use]
    pub fn scripted(labels: Vec<String>) -> Self {
        Self {
            labels,
            should_fail: false,
            history: CallHistory::default(),
        }
    }

    /// Classifier that always answers [`UNKNOWN_LABEL`]
    #[must_use]
    pub fn unknown() -> Self {
        Self::new(UNKNOWN_LABEL)
    }

    #[must_use]
    pub fn new_failing() -> Self {
        Self {
            should_fail: true,
            ..Self::unknown()
        }
    }

    #[must_use]
    pub fn history(&self) -> CallHistory {
        self.history.clone()
    }
}

impl FoodClassifier for MockClassifier {
    fn name(&self) -> &str {
        "mock-classifier"
    }

    fn classify(&self, image: &DynamicImage) -> Result<String> {
        let call = self.history.len();
        self.history.record(format!("classify {}x{}", image.width(), image.height()));
        if self.should_fail {
            return Err(NutrilensError::inference("Mock classifier inference failed"));
        }
        Ok(self
            .labels
            .get(call)
            .or_else(|| self.labels.last())
            .cloned()
            .unwrap_or_else(|| UNKNOWN_LABEL.to_string()))
    }
}
