//! Reference-object calibration
//!
//! Picks the largest detected object of known physical size and turns its
//! pixel width into a centimetres-per-pixel ratio.

use crate::types::{CalibrationResult, DetectedObject};
use tracing::{debug, info, warn};

/// Known physical size of a reference object
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReferenceSize {
    /// Round objects, measured across their bounding-box width
    Circular { diameter_cm: f64 },
    /// Rectangular objects, measured along their long edge
    Rectangular { width_cm: f64, height_cm: f64 },
}

/// Labels eligible to act as calibration references
pub const REFERENCE_LABELS: [&str; 4] = ["plate", "bowl", "credit_card", "coin"];

/// Physical size table
const REFERENCE_SIZES: [(&str, ReferenceSize); 4] = [
    ("plate", ReferenceSize::Circular { diameter_cm: 24.0 }),
    ("bowl", ReferenceSize::Circular { diameter_cm: 15.0 }),
    ("credit_card", ReferenceSize::Rectangular { width_cm: 8.56, height_cm: 5.4 }),
    ("coin", ReferenceSize::Circular { diameter_cm: 2.6 }),
];

/// Whether `label` belongs to the reference-object set
#[must_use]
pub fn is_reference_label(label: &str) -> bool {
    REFERENCE_LABELS.contains(&label)
}

/// Physical size for a label, if it is in the size table
#[must_use]
pub fn reference_size(label: &str) -> Option<ReferenceSize> {
    REFERENCE_SIZES
        .iter()
        .find(|(name, _)| *name == label)
        .map(|(_, size)| *size)
}

/// Calibrate with the default 1 % minimum reference area
#[must_use]
pub fn calibrate(objects: &[DetectedObject], image_area_px: u64) -> CalibrationResult {
    calibrate_with_threshold(objects, image_area_px, 0.01)
}

/// Derive a pixel-to-centimetre ratio from the best reference object.
///
/// A candidate qualifies when its box area is strictly greater than
/// `min_area_fraction * image_area_px`; the largest qualifying box wins, the
/// first one on ties. Never fails: anything unresolvable yields a result
/// without a ratio.
#[must_use]
pub fn calibrate_with_threshold(
    objects: &[DetectedObject],
    image_area_px: u64,
    min_area_fraction: f64,
) -> CalibrationResult {
    let candidates: Vec<&DetectedObject> = objects
        .iter()
        .filter(|obj| is_reference_label(&obj.label))
        .collect();

    let mut result = CalibrationResult {
        candidate_labels: candidates.iter().map(|obj| obj.label.clone()).collect(),
        ..CalibrationResult::default()
    };

    if candidates.is_empty() || image_area_px == 0 {
        return result;
    }

    let min_area = image_area_px as f64 * min_area_fraction;
    for obj in &candidates {
        debug!(
            label = %obj.label,
            area_percent = obj.bounding_box.area() / image_area_px as f64 * 100.0,
            "Reference candidate"
        );
    }

    let mut best: Option<&DetectedObject> = None;
    for obj in candidates.iter().copied().filter(|obj| obj.bounding_box.area() > min_area) {
        // strict comparison keeps the first of equally large candidates
        if best.map_or(true, |b| obj.bounding_box.area() > b.bounding_box.area()) {
            best = Some(obj);
        }
    }

    let Some(best) = best else {
        info!(
            candidates = ?result.candidate_labels,
            "Reference candidates too small for calibration"
        );
        return result;
    };

    let px_width = f64::from(best.bounding_box.width());
    let px_height = f64::from(best.bounding_box.height());

    let ratio = match reference_size(&best.label) {
        Some(ReferenceSize::Circular { diameter_cm }) if px_width > 0.0 => Some(diameter_cm / px_width),
        Some(ReferenceSize::Rectangular { width_cm, .. }) if px_width > 0.0 && px_height > 0.0 => {
            Some(width_cm / px_width)
        },
        _ => None,
    };

    match ratio {
        Some(ratio) if ratio.is_finite() && ratio > 0.0 => {
            info!(
                reference = %best.label,
                px_width,
                pixel_to_cm_ratio = ratio,
                "Calibrated from reference object"
            );
            result.pixel_to_cm_ratio = Some(ratio);
            result.reference_label = Some(best.label.clone());
        },
        _ => {
            warn!(reference = %best.label, "Reference object found but its scale could not be resolved");
        },
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BoundingBox;

    fn object(label: &str, x1: f32, y1: f32, x2: f32, y2: f32) -> DetectedObject {
        DetectedObject::new(label, BoundingBox::new(x1, y1, x2, y2), 0.9)
    }

    #[test]
    fn test_plate_ratio_uses_diameter_over_width() {
        for width in [120.0_f32, 240.0, 500.0, 999.0] {
            let objects = vec![object("plate", 0.0, 0.0, width, width)];
            let result = calibrate(&objects, 1_000_000);
            let expected = 24.0 / f64::from(width);
            assert!((result.pixel_to_cm_ratio.unwrap() - expected).abs() < 1e-12);
            assert_eq!(result.reference_label.as_deref(), Some("plate"));
        }
    }

    #[test]
    fn test_credit_card_uses_width() {
        let objects = vec![object("credit_card", 100.0, 100.0, 314.0, 235.0)];
        let result = calibrate(&objects, 1_000_000);
        assert!((result.pixel_to_cm_ratio.unwrap() - 8.56 / 214.0).abs() < 1e-12);
    }

    #[test]
    fn test_exactly_one_percent_does_not_qualify() {
        // 100 x 100 = 10_000 px = exactly 1 % of 1000 x 1000
        let objects = vec![object("plate", 0.0, 0.0, 100.0, 100.0)];
        let result = calibrate(&objects, 1_000_000);
        assert!(!result.is_calibrated());
        assert!(result.reference_label.is_none());
        assert_eq!(result.candidate_labels, vec!["plate".to_string()]);

        let objects = vec![object("plate", 0.0, 0.0, 101.0, 100.0)];
        assert!(calibrate(&objects, 1_000_000).is_calibrated());
    }

    #[test]
    fn test_largest_candidate_wins_first_on_tie() {
        let objects = vec![
            object("coin", 0.0, 0.0, 150.0, 150.0),
            object("bowl", 200.0, 200.0, 500.0, 500.0),
            object("plate", 500.0, 500.0, 800.0, 800.0),
        ];
        let result = calibrate(&objects, 1_000_000);
        assert_eq!(result.reference_label.as_deref(), Some("bowl"));
        assert!((result.pixel_to_cm_ratio.unwrap() - 15.0 / 300.0).abs() < 1e-12);
    }

    #[test]
    fn test_non_reference_labels_are_ignored() {
        let objects = vec![object("pizza", 0.0, 0.0, 900.0, 900.0), object("spoon", 0.0, 0.0, 400.0, 50.0)];
        let result = calibrate(&objects, 1_000_000);
        assert!(!result.is_calibrated());
        assert!(result.candidate_labels.is_empty());
    }

    #[test]
    fn test_zero_image_area_never_panics() {
        let objects = vec![object("plate", 0.0, 0.0, 240.0, 240.0)];
        let result = calibrate(&objects, 0);
        assert!(!result.is_calibrated());
    }

    #[test]
    fn test_custom_threshold() {
        let objects = vec![object("coin", 0.0, 0.0, 50.0, 50.0)];
        assert!(!calibrate(&objects, 1_000_000).is_calibrated());
        assert!(calibrate_with_threshold(&objects, 1_000_000, 0.001).is_calibrated());
    }

    #[test]
    fn test_size_table() {
        assert_eq!(reference_size("coin"), Some(ReferenceSize::Circular { diameter_cm: 2.6 }));
        assert!(reference_size("saucer").is_none());
        assert!(!is_reference_label("spoon"));

        // every reference label resolves, nothing else does
        for label in REFERENCE_LABELS {
            assert!(reference_size(label).is_some(), "{label}");
        }
        assert!(reference_size("fork").is_none());
    }
}
