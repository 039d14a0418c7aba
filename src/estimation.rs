//! Volume and weight estimation for a single food mask
//!
//! Two mutually exclusive models:
//!
//! - **Calibrated**: `area_cm2 = pixels * ratio^2`, `volume = shape_factor * area_cm2^1.5`,
//!   `weight = volume * density`. The shape factor is 0.5 unless a compatible depth
//!   map provides one.
//! - **Screen ratio**: without calibration the mask's share of the frame is scaled
//!   linearly, anchored at 25 % coverage = 350 g.
//!
//! The estimator never fails. Any numeric breakdown degrades to a fixed
//! 150 g estimate with low confidence.

use crate::error::{NutrilensError, Result};
use crate::types::{DepthMap, EstimationMethod, FoodMask, WeightEstimate};
use tracing::{debug, warn};

/// Default single-item weight cap in grams
pub const DEFAULT_MAX_ITEM_WEIGHT_G: f64 = 1500.0;

/// Shape factor used when no depth information is available
pub const DEFAULT_SHAPE_FACTOR: f64 = 0.5;

const SHAPE_FACTOR_MIN: f64 = 0.2;
const SHAPE_FACTOR_MAX: f64 = 0.8;

/// Screen-ratio anchor: this share of the frame corresponds to `ANCHOR_WEIGHT_G`
const ANCHOR_SCREEN_RATIO: f64 = 0.25;
const ANCHOR_WEIGHT_G: f64 = 350.0;

const DEGRADED: WeightEstimate = WeightEstimate {
    weight_g: 150.0,
    confidence: 0.3,
    error_fraction: 0.5,
    method: EstimationMethod::Degraded,
};

const UNKNOWN_AREA: WeightEstimate = WeightEstimate {
    weight_g: 150.0,
    confidence: 0.2,
    error_fraction: 0.8,
    method: EstimationMethod::FixedDefault,
};

/// Density table in g/cm³
const DENSITIES: [(&str, f64); 4] = [("rice", 0.8), ("noodles", 0.6), ("meat", 1.0), ("vegetables", 0.4)];

/// Fallback density in g/cm³
pub const DEFAULT_DENSITY: f64 = 0.8;

/// Keywords per density class, classes checked in order
const DENSITY_KEYWORDS: [(&str, &[&str]); 4] = [
    ("rice", &["rice", "飯"]),
    ("noodles", &["noodle", "麵"]),
    ("meat", &["meat", "肉", "chicken", "pork", "beef", "lamb"]),
    ("vegetables", &["vegetable", "菜"]),
];

/// Density class for a food label, `None` when no keyword matches
#[must_use]
pub fn density_class(food_label: &str) -> Option<&'static str> {
    let label = food_label.to_lowercase();
    DENSITY_KEYWORDS
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|keyword| label.contains(keyword)))
        .map(|(class, _)| *class)
}

/// Density in g/cm³ for a food label; first matching keyword wins
#[must_use]
pub fn food_density(food_label: &str) -> f64 {
    density_class(food_label)
        .and_then(|class| DENSITIES.iter().find(|(name, _)| *name == class))
        .map_or(DEFAULT_DENSITY, |(_, density)| *density)
}

/// Depth-derived shape factor for `mask`, `None` when the map cannot be used.
///
/// Depth values under the mask are min/max normalised, averaged and clipped to
/// `[0.2, 0.8]`. Non-finite depth values are ignored. A flat region carries no
/// shape information and yields `None`.
#[must_use]
pub fn depth_shape_factor(mask: &FoodMask, depth: &DepthMap) -> Option<f64> {
    if !depth.matches(mask) {
        debug!(
            depth = ?depth.dimensions(),
            mask = ?mask.dimensions,
            "Depth map shape differs from mask, ignoring it"
        );
        return None;
    }

    let values: Vec<f64> = depth
        .values_under(mask)
        .into_iter()
        .filter(|v| v.is_finite())
        .map(f64::from)
        .collect();
    if values.is_empty() {
        return None;
    }

    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max <= min {
        debug!(depth = min, "Flat depth under mask, keeping static shape factor");
        return None;
    }
    let mean = values.iter().map(|v| (v - min) / (max - min)).sum::<f64>() / values.len() as f64;

    Some(mean.clamp(SHAPE_FACTOR_MIN, SHAPE_FACTOR_MAX))
}

/// Stateless weight model with a configurable per-item cap
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightEstimator {
    pub max_item_weight_g: f64,
}

impl Default for WeightEstimator {
    fn default() -> Self {
        Self {
            max_item_weight_g: DEFAULT_MAX_ITEM_WEIGHT_G,
        }
    }
}

impl WeightEstimator {
    #[must_use]
    pub fn new(max_item_weight_g: f64) -> Self {
        Self { max_item_weight_g }
    }

    /// Estimate weight, confidence and relative error for one mask.
    ///
    /// `weight_g` is always within `[0, max_item_weight_g]`.
    #[must_use]
    pub fn estimate(
        &self,
        mask: &FoodMask,
        food_label: &str,
        pixel_to_cm_ratio: Option<f64>,
        depth: Option<&DepthMap>,
        image_area_px: Option<u64>,
    ) -> WeightEstimate {
        match self.try_estimate(mask, food_label, pixel_to_cm_ratio, depth, image_area_px) {
            Ok(estimate) => estimate,
            Err(e) => {
                warn!(food = %food_label, error = %e, "Weight estimation failed, using default estimate");
                DEGRADED.capped(self.max_item_weight_g)
            },
        }
    }

    fn try_estimate(
        &self,
        mask: &FoodMask,
        food_label: &str,
        pixel_to_cm_ratio: Option<f64>,
        depth: Option<&DepthMap>,
        image_area_px: Option<u64>,
    ) -> Result<WeightEstimate> {
        let pixels = mask.pixel_count() as f64;

        let estimate = if let Some(ratio) = pixel_to_cm_ratio {
            if !ratio.is_finite() || ratio <= 0.0 {
                return Err(NutrilensError::processing(format!(
                    "Invalid pixel-to-cm ratio {ratio}"
                )));
            }

            let area_cm2 = pixels * ratio * ratio;
            let depth_factor = depth.and_then(|d| depth_shape_factor(mask, d));
            let shape_factor = depth_factor.unwrap_or(DEFAULT_SHAPE_FACTOR);
            let volume_cm3 = shape_factor * area_cm2.powf(1.5);
            let density = food_density(food_label);

            debug!(
                food = %food_label,
                area_cm2,
                shape_factor,
                volume_cm3,
                density,
                "Calibrated volume estimate"
            );

            if depth_factor.is_some() {
                WeightEstimate {
                    weight_g: volume_cm3 * density,
                    confidence: 0.8,
                    error_fraction: 0.25,
                    method: EstimationMethod::CalibratedWithDepth,
                }
            } else {
                WeightEstimate {
                    weight_g: volume_cm3 * density,
                    confidence: 0.75,
                    error_fraction: 0.25,
                    method: EstimationMethod::Calibrated,
                }
            }
        } else {
            match image_area_px {
                Some(area) if area > 0 => {
                    let screen_ratio = pixels / area as f64;
                    debug!(food = %food_label, screen_ratio, "Screen-ratio estimate");
                    WeightEstimate {
                        weight_g: ANCHOR_WEIGHT_G * (screen_ratio / ANCHOR_SCREEN_RATIO),
                        confidence: 0.4,
                        error_fraction: 0.6,
                        method: EstimationMethod::ScreenRatio,
                    }
                },
                _ => UNKNOWN_AREA,
            }
        };

        if !estimate.weight_g.is_finite() {
            return Err(NutrilensError::processing(format!(
                "Non-finite weight for '{food_label}'"
            )));
        }

        Ok(estimate.capped(self.max_item_weight_g))
    }
}

impl WeightEstimate {
    fn capped(mut self, max_item_weight_g: f64) -> Self {
        self.weight_g = self.weight_g.clamp(0.0, max_item_weight_g.max(0.0));
        self
    }
}

/// Estimate with the default 1500 g cap
#[must_use]
pub fn estimate_weight(
    mask: &FoodMask,
    food_label: &str,
    pixel_to_cm_ratio: Option<f64>,
    depth: Option<&DepthMap>,
    image_area_px: Option<u64>,
) -> WeightEstimate {
    WeightEstimator::default().estimate(mask, food_label, pixel_to_cm_ratio, depth, image_area_px)
}
