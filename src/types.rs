//! Core value types for food analysis
//!
//! Everything in here is request-scoped: produced by one pipeline run and
//! discarded afterwards.

use crate::error::{NutrilensError, Result};
use image::{GrayImage, ImageBuffer, Luma};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Axis-aligned box in source-image pixel coordinates (`x1 < x2`, `y1 < y2`)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    #[must_use]
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    #[must_use]
    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    #[must_use]
    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    /// Box area in square pixels
    #[must_use]
    pub fn area(&self) -> f64 {
        f64::from(self.width()) * f64::from(self.height())
    }

    /// Whether the box has positive extent on both axes
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.x1.is_finite()
            && self.y1.is_finite()
            && self.x2.is_finite()
            && self.y2.is_finite()
            && self.x1 < self.x2
            && self.y1 < self.y2
    }

    /// Clamp the box into `[0, width] x [0, height]`
    #[must_use]
    pub fn clamped(&self, width: u32, height: u32) -> Self {
        let (w, h) = (width as f32, height as f32);
        Self {
            x1: self.x1.clamp(0.0, w),
            y1: self.y1.clamp(0.0, h),
            x2: self.x2.clamp(0.0, w),
            y2: self.y2.clamp(0.0, h),
        }
    }

    /// Intersection over union with another box
    #[must_use]
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);

        let intersection = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        let union = self.width() * self.height() + other.width() * other.height() - intersection;

        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }
}

/// One detector output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedObject {
    pub label: String,
    pub bounding_box: BoundingBox,
    /// Detector confidence in `[0, 1]`
    pub confidence: f32,
}

impl DetectedObject {
    #[must_use]
    pub fn new<S: Into<String>>(label: S, bounding_box: BoundingBox, confidence: f32) -> Self {
        Self {
            label: label.into(),
            bounding_box,
            confidence,
        }
    }
}

/// Binary food mask with the same dimensions as the analysed image
#[derive(Debug, Clone, PartialEq)]
pub struct FoodMask {
    /// Row-major mask values, 255 for food and 0 for background
    pub data: Vec<u8>,

    /// Mask dimensions (width, height)
    pub dimensions: (u32, u32),
}

impl FoodMask {
    /// Wrap raw mask data, validating its length against the dimensions
    pub fn new(data: Vec<u8>, dimensions: (u32, u32)) -> Result<Self> {
        let expected = dimensions.0 as usize * dimensions.1 as usize;
        if data.len() != expected {
            return Err(NutrilensError::processing(format!(
                "Mask data length {} does not match {}x{}",
                data.len(),
                dimensions.0,
                dimensions.1
            )));
        }
        Ok(Self { data, dimensions })
    }

    /// Build a mask from a per-pixel predicate
    pub fn from_fn<F>(width: u32, height: u32, mut f: F) -> Self
    where
        F: FnMut(u32, u32) -> bool,
    {
        let mut data = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                data.push(if f(x, y) { 255 } else { 0 });
            }
        }
        Self {
            data,
            dimensions: (width, height),
        }
    }

    /// Mask covering exactly the pixels inside `bbox`
    #[must_use]
    pub fn from_box(width: u32, height: u32, bbox: &BoundingBox) -> Self {
        Self::from_fn(width, height, |x, y| {
            let (px, py) = (x as f32 + 0.5, y as f32 + 0.5);
            px >= bbox.x1 && px < bbox.x2 && py >= bbox.y1 && py < bbox.y2
        })
    }

    /// Build a mask by thresholding a grayscale image at 128
    #[must_use]
    pub fn from_image(image: &GrayImage) -> Self {
        let (width, height) = image.dimensions();
        let data = image.as_raw().iter().map(|&v| if v > 127 { 255 } else { 0 }).collect();
        Self {
            data,
            dimensions: (width, height),
        }
    }

    /// Convert mask to a grayscale image
    pub fn to_image(&self) -> Result<GrayImage> {
        let (width, height) = self.dimensions;
        ImageBuffer::<Luma<u8>, Vec<u8>>::from_raw(width, height, self.data.clone())
            .ok_or_else(|| NutrilensError::processing("Failed to create image from mask data"))
    }

    #[must_use]
    pub fn is_set(&self, x: u32, y: u32) -> bool {
        let index = y as usize * self.dimensions.0 as usize + x as usize;
        self.data.get(index).is_some_and(|&v| v > 127)
    }

    /// Number of foreground pixels
    #[must_use]
    pub fn pixel_count(&self) -> u64 {
        self.data.iter().filter(|&&v| v > 127).count() as u64
    }

    /// Foreground fraction of `image_area_px`
    #[must_use]
    pub fn coverage(&self, image_area_px: u64) -> f64 {
        if image_area_px == 0 {
            return 0.0;
        }
        self.pixel_count() as f64 / image_area_px as f64
    }

    /// Tight bounding rectangle of the foreground, `None` for an empty mask
    #[must_use]
    pub fn bounding_rect(&self) -> Option<BoundingBox> {
        let (width, height) = self.dimensions;
        let mut min_x = u32::MAX;
        let mut min_y = u32::MAX;
        let mut max_x = 0u32;
        let mut max_y = 0u32;
        let mut any = false;

        for y in 0..height {
            for x in 0..width {
                if self.is_set(x, y) {
                    any = true;
                    min_x = min_x.min(x);
                    min_y = min_y.min(y);
                    max_x = max_x.max(x);
                    max_y = max_y.max(y);
                }
            }
        }

        any.then(|| {
            BoundingBox::new(
                min_x as f32,
                min_y as f32,
                (max_x + 1) as f32,
                (max_y + 1) as f32,
            )
        })
    }
}

/// Relative per-pixel depth for the whole image, shape `(height, width)`
#[derive(Debug, Clone, PartialEq)]
pub struct DepthMap {
    pub values: Array2<f32>,
}

impl DepthMap {
    #[must_use]
    pub fn new(values: Array2<f32>) -> Self {
        Self { values }
    }

    /// Dimensions as (width, height), matching [`FoodMask::dimensions`]
    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        let (rows, cols) = self.values.dim();
        (cols as u32, rows as u32)
    }

    /// Whether this map can be indexed with `mask` coordinates
    #[must_use]
    pub fn matches(&self, mask: &FoodMask) -> bool {
        self.dimensions() == mask.dimensions
    }

    /// Depth values under the foreground of `mask`
    #[must_use]
    pub fn values_under(&self, mask: &FoodMask) -> Vec<f32> {
        self.values
            .indexed_iter()
            .filter(|((y, x), _)| mask.is_set(*x as u32, *y as u32))
            .map(|(_, &v)| v)
            .collect()
    }
}

/// Outcome of reference-object calibration.
///
/// `pixel_to_cm_ratio` and `reference_label` are either both present or both absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationResult {
    /// Centimetres per pixel, always positive when present
    pub pixel_to_cm_ratio: Option<f64>,
    pub reference_label: Option<String>,
    /// Labels of every reference-type detection, before the size filter
    pub candidate_labels: Vec<String>,
}

impl CalibrationResult {
    #[must_use]
    pub fn is_calibrated(&self) -> bool {
        self.pixel_to_cm_ratio.is_some()
    }
}

/// How a weight figure was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimationMethod {
    /// Reference calibration with the static shape factor
    Calibrated,
    /// Reference calibration with a depth-derived shape factor
    CalibratedWithDepth,
    /// Screen-coverage proxy without calibration
    ScreenRatio,
    /// Fixed default, image area unknown
    FixedDefault,
    /// Computation failed and was replaced by the safe default
    Degraded,
}

/// Output of the volume/weight estimator
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightEstimate {
    /// Estimated weight in grams, within `[0, max_item_weight_g]`
    pub weight_g: f64,
    pub confidence: f64,
    /// Expected relative error, e.g. `0.25` for ±25 %
    pub error_fraction: f64,
    pub method: EstimationMethod,
}

/// Nutrient name to amount. Per 100 g when it comes from a lookup, absolute once scaled.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NutritionFacts(pub BTreeMap<String, f64>);

impl NutritionFacts {
    /// Nutrients that always appear in an item's and the meal's totals
    pub const BASE_NUTRIENTS: [&'static str; 5] = ["calories", "protein", "carbs", "fat", "fiber"];

    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record with every base nutrient set to zero
    #[must_use]
    pub fn zeroed() -> Self {
        Self(
            Self::BASE_NUTRIENTS
                .iter()
                .map(|name| ((*name).to_string(), 0.0))
                .collect(),
        )
    }

    #[must_use]
    pub fn with<S: Into<String>>(mut self, nutrient: S, amount: f64) -> Self {
        self.0.insert(nutrient.into(), amount);
        self
    }

    #[must_use]
    pub fn get(&self, nutrient: &str) -> Option<f64> {
        self.0.get(nutrient).copied()
    }

    pub fn insert<S: Into<String>>(&mut self, nutrient: S, amount: f64) {
        self.0.insert(nutrient.into(), amount);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Multiply every amount by `factor`; non-finite amounts are dropped
    #[must_use]
    pub fn scaled(&self, factor: f64) -> Self {
        Self(
            self.0
                .iter()
                .filter(|(_, v)| v.is_finite())
                .map(|(k, v)| (k.clone(), v * factor))
                .collect(),
        )
    }

    /// Element-wise add `other` into `self`
    pub fn accumulate(&mut self, other: &NutritionFacts) {
        for (name, amount) in &other.0 {
            *self.0.entry(name.clone()).or_insert(0.0) += amount;
        }
    }
}

/// One food item that survived segmentation and measurement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FoodItemMeasurement {
    /// Classifier label for the masked crop
    pub food_name: String,
    /// Raw detector label that produced this item
    pub detector_label: String,
    pub bounding_box: BoundingBox,
    pub mask_pixels: u64,
    #[serde(skip)]
    pub mask: Option<FoodMask>,
    pub estimated_weight_g: f64,
    pub confidence: f64,
    pub error_fraction: f64,
    /// Nutrition already scaled to `estimated_weight_g`
    pub nutrition: NutritionFacts,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackSuggestion {
    pub food_name: String,
}

/// Terminal state of one pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineOutcome {
    /// At least one item was measured
    Success,
    /// Nothing measured, whole-image classification produced a suggestion
    FallbackClassify,
    /// Nothing detected or nothing identified by any tier
    Empty,
}

/// Pipeline stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Decoding,
    Detecting,
    Calibrating,
    EstimatingDepth,
    MeasuringItems,
    FallbackClassify,
    Completed,
}

impl PipelineStage {
    /// Get a human-readable description of this stage
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::Decoding => "Decoding image",
            Self::Detecting => "Detecting objects",
            Self::Calibrating => "Resolving reference object",
            Self::EstimatingDepth => "Estimating depth",
            Self::MeasuringItems => "Measuring food items",
            Self::FallbackClassify => "Classifying whole image",
            Self::Completed => "Analysis completed",
        }
    }

    /// Progress through the pipeline in `[0, 1]`
    #[must_use]
    pub fn progress(&self) -> f32 {
        match self {
            Self::Decoding => 0.0,
            Self::Detecting => 0.1,
            Self::Calibrating => 0.3,
            Self::EstimatingDepth => 0.4,
            Self::MeasuringItems => 0.5,
            Self::FallbackClassify => 0.9,
            Self::Completed => 1.0,
        }
    }
}

/// Resolved model keys and load state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub detection: String,
    pub segmentation: String,
    pub depth: String,
    pub classification: String,
    /// Per adapter kind, whether the model is loaded
    pub models_loaded: BTreeMap<String, bool>,
}

/// Terminal output of one pipeline invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    /// Measured items in detection order
    pub detected_foods: Vec<FoodItemMeasurement>,
    pub total_weight_g: f64,
    pub total_nutrition: NutritionFacts,
    pub reference_object: Option<String>,
    pub pixel_to_cm_ratio: Option<f64>,
    pub note: String,
    pub outcome: PipelineOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_suggestion: Option<FallbackSuggestion>,
    pub model_info: ModelInfo,
    pub processing_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_output_path: Option<String>,
}

impl PipelineResult {
    /// Result with no measured items
    #[must_use]
    pub fn empty<S: Into<String>>(note: S, outcome: PipelineOutcome, model_info: ModelInfo) -> Self {
        Self {
            detected_foods: Vec::new(),
            total_weight_g: 0.0,
            total_nutrition: NutritionFacts::new(),
            reference_object: None,
            pixel_to_cm_ratio: None,
            note: note.into(),
            outcome,
            fallback_suggestion: None,
            model_info,
            processing_time_ms: 0,
            debug_output_path: None,
        }
    }

    /// Sum of item weights, equal to `total_weight_g` for results built by the pipeline
    #[must_use]
    pub fn items_weight_sum(&self) -> f64 {
        self.detected_foods.iter().map(|item| item.estimated_weight_g).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounding_box_geometry() {
        let bbox = BoundingBox::new(10.0, 20.0, 110.0, 70.0);
        assert!((bbox.width() - 100.0).abs() < f32::EPSILON);
        assert!((bbox.height() - 50.0).abs() < f32::EPSILON);
        assert!((bbox.area() - 5000.0).abs() < 1e-9);
        assert!(bbox.is_valid());
        assert!(!BoundingBox::new(5.0, 5.0, 5.0, 9.0).is_valid());
    }

    #[test]
    fn test_bounding_box_clamp_and_iou() {
        let bbox = BoundingBox::new(-10.0, -5.0, 120.0, 90.0).clamped(100, 80);
        assert_eq!(bbox, BoundingBox::new(0.0, 0.0, 100.0, 80.0));

        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(5.0, 0.0, 15.0, 10.0);
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_mask_from_box_counts_pixels() {
        let mask = FoodMask::from_box(100, 100, &BoundingBox::new(10.0, 10.0, 30.0, 20.0));
        assert_eq!(mask.pixel_count(), 200);
        assert!((mask.coverage(10_000) - 0.02).abs() < 1e-12);
        assert_eq!(mask.bounding_rect(), Some(BoundingBox::new(10.0, 10.0, 30.0, 20.0)));
    }

    #[test]
    fn test_empty_mask_has_no_bounding_rect() {
        let mask = FoodMask::from_fn(8, 8, |_, _| false);
        assert_eq!(mask.pixel_count(), 0);
        assert!(mask.bounding_rect().is_none());
        assert!(mask.coverage(0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_mask_length_validation() {
        assert!(FoodMask::new(vec![0; 10], (4, 4)).is_err());
        assert!(FoodMask::new(vec![0; 16], (4, 4)).is_ok());
    }

    #[test]
    fn test_depth_values_under_mask() {
        let values = Array2::from_shape_fn((4, 4), |(y, x)| (y * 4 + x) as f32);
        let depth = DepthMap::new(values);
        let mask = FoodMask::from_fn(4, 4, |x, y| x == 1 && y < 2);
        assert!(depth.matches(&mask));
        assert_eq!(depth.values_under(&mask), vec![1.0, 5.0]);

        let other = FoodMask::from_fn(3, 4, |_, _| true);
        assert!(!depth.matches(&other));
    }

    #[test]
    fn test_nutrition_scaling_and_accumulation() {
        let per_100g = NutritionFacts::new().with("calories", 200.0).with("protein", 10.0);
        let scaled = per_100g.scaled(1.5);
        assert_eq!(scaled.get("calories"), Some(300.0));
        assert_eq!(scaled.get("protein"), Some(15.0));

        let mut totals = NutritionFacts::zeroed();
        totals.accumulate(&scaled);
        totals.accumulate(&NutritionFacts::new().with("sodium", 2.0));
        assert_eq!(totals.get("calories"), Some(300.0));
        assert_eq!(totals.get("fiber"), Some(0.0));
        assert_eq!(totals.get("sodium"), Some(2.0));
    }

    #[test]
    fn test_result_serialization_field_names() {
        let result = PipelineResult::empty("nothing", PipelineOutcome::Empty, ModelInfo::default());
        let json = serde_json::to_value(&result).unwrap();
        assert!(json.get("detected_foods").unwrap().as_array().unwrap().is_empty());
        assert_eq!(json["total_weight_g"], 0.0);
        assert_eq!(json["outcome"], "empty");
        assert!(json["reference_object"].is_null());
        assert!(json.get("fallback_suggestion").is_none());
        assert!(json.get("debug_output_path").is_none());
    }
}
