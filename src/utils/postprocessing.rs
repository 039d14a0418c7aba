//! Model output decoding: YOLO boxes, NMS, classifier labels and mask logits
//!
//! Kept free of ONNX Runtime types so the decoding rules can be tested on
//! hand-built tensors.

use crate::error::{NutrilensError, Result};
use crate::types::{BoundingBox, DetectedObject, FoodMask};
use ndarray::{ArrayView2, ArrayViewD, Axis};

/// Detector labels that are never treated as food or reference objects
pub const IGNORED_DETECTION_LABELS: [&str; 5] = ["spoon", "fork", "knife", "scissors", "toothbrush"];

/// COCO class names in YOLO index order
pub const COCO_LABELS: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich", "orange",
    "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch", "potted plant",
    "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote", "keyboard", "cell phone",
    "microwave", "oven", "toaster", "sink", "refrigerator", "book", "clock", "vase", "scissors",
    "teddy bear", "hair drier", "toothbrush",
];

/// Row layout of a YOLO output tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YoloLayout {
    /// `[1, N, 5 + C]`: box, objectness, class scores (YOLOv5)
    Objectness,
    /// `[1, 4 + C, N]`: box and class scores, transposed (YOLOv8)
    Transposed,
}

/// Decoding parameters for one YOLO forward pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct YoloDecodeParams {
    pub layout: YoloLayout,
    pub confidence_threshold: f32,
    /// Factors mapping model-input x/y back to source pixels
    pub scale_x: f32,
    pub scale_y: f32,
    pub image_width: u32,
    pub image_height: u32,
}

struct Candidate {
    bbox: BoundingBox,
    score: f32,
    class_id: usize,
}

/// Decode raw YOLO output into labelled detections (before NMS).
///
/// Ignored labels (utensils and similar) are dropped here.
///
/// # Errors
/// - Output rank or width inconsistent with the layout
pub fn decode_yolo(output: &ArrayViewD<'_, f32>, params: &YoloDecodeParams, labels: &[String]) -> Result<Vec<(DetectedObject, usize)>> {
    let rows: ArrayView2<'_, f32> = match output.ndim() {
        3 => output
            .index_axis(Axis(0), 0)
            .into_dimensionality()
            .map_err(|e| NutrilensError::inference(format!("Unexpected YOLO output shape: {e}")))?,
        2 => output
            .view()
            .into_dimensionality()
            .map_err(|e| NutrilensError::inference(format!("Unexpected YOLO output shape: {e}")))?,
        n => {
            return Err(NutrilensError::inference(format!(
                "Expected 2D or 3D YOLO output, got {n}D"
            )))
        },
    };

    let rows = match params.layout {
        YoloLayout::Objectness => rows,
        YoloLayout::Transposed => rows.reversed_axes(),
    };

    let box_fields = match params.layout {
        YoloLayout::Objectness => 5,
        YoloLayout::Transposed => 4,
    };
    if rows.ncols() <= box_fields {
        return Err(NutrilensError::inference(format!(
            "YOLO rows have {} values, expected more than {box_fields}",
            rows.ncols()
        )));
    }

    let mut candidates = Vec::new();
    for row in rows.rows() {
        let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
        let objectness = if params.layout == YoloLayout::Objectness { row[4] } else { 1.0 };

        let (class_id, class_score) = row
            .iter()
            .skip(box_fields)
            .copied()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (i, s)| if s > best.1 { (i, s) } else { best });

        let score = objectness * class_score;
        if !score.is_finite() || score < params.confidence_threshold {
            continue;
        }

        let bbox = BoundingBox::new(
            (cx - w / 2.0) * params.scale_x,
            (cy - h / 2.0) * params.scale_y,
            (cx + w / 2.0) * params.scale_x,
            (cy + h / 2.0) * params.scale_y,
        )
        .clamped(params.image_width, params.image_height);

        if bbox.is_valid() {
            candidates.push(Candidate { bbox, score, class_id });
        }
    }

    Ok(candidates
        .into_iter()
        .filter_map(|c| {
            let label = labels.get(c.class_id)?;
            if IGNORED_DETECTION_LABELS.contains(&label.as_str()) {
                return None;
            }
            Some((DetectedObject::new(label.clone(), c.bbox, c.score), c.class_id))
        })
        .collect())
}

/// Class-wise non-maximum suppression, highest score first, capped at `max_detections`
#[must_use]
pub fn non_max_suppression(
    mut detections: Vec<(DetectedObject, usize)>,
    iou_threshold: f32,
    max_detections: usize,
) -> Vec<DetectedObject> {
    detections.sort_by(|a, b| b.0.confidence.total_cmp(&a.0.confidence));

    let mut kept: Vec<(DetectedObject, usize)> = Vec::new();
    for (det, class_id) in detections {
        if kept.len() >= max_detections {
            break;
        }
        let suppressed = kept
            .iter()
            .any(|(k, k_class)| *k_class == class_id && k.bounding_box.iou(&det.bounding_box) > iou_threshold);
        if !suppressed {
            kept.push((det, class_id));
        }
    }

    kept.into_iter().map(|(det, _)| det).collect()
}

/// Index and value of the largest logit
#[must_use]
pub fn argmax(values: &[f32]) -> Option<(usize, f32)> {
    values
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, v)| v.is_finite())
        .max_by(|a, b| a.1.total_cmp(&b.1))
}

/// `"fried_rice"` to `"Fried Rice"`
#[must_use]
pub fn format_food_label(raw: &str) -> String {
    raw.trim()
        .replace('_', " ")
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

/// Threshold a `HxW` logit map at zero (probability 0.5) into a mask
#[must_use]
pub fn mask_from_logits(logits: &ArrayView2<'_, f32>) -> FoodMask {
    let (height, width) = logits.dim();
    FoodMask::from_fn(width as u32, height as u32, |x, y| {
        logits.get((y as usize, x as usize)).is_some_and(|&v| v > 0.0)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn coco() -> Vec<String> {
        COCO_LABELS.iter().map(ToString::to_string).collect()
    }

    fn params(layout: YoloLayout) -> YoloDecodeParams {
        YoloDecodeParams {
            layout,
            confidence_threshold: 0.25,
            scale_x: 2.0,
            scale_y: 1.0,
            image_width: 1280,
            image_height: 640,
        }
    }

    #[test]
    fn test_decode_objectness_layout() {
        // one confident bowl (class 45), one low-confidence row, one fork (class 42)
        let mut output = Array3::<f32>::zeros((1, 3, 85));
        for (row, (obj, class, score)) in [(0.9, 45, 0.9), (0.2, 53, 0.9), (0.9, 42, 0.9)].into_iter().enumerate() {
            output[[0, row, 0]] = 100.0;
            output[[0, row, 1]] = 100.0;
            output[[0, row, 2]] = 40.0;
            output[[0, row, 3]] = 20.0;
            output[[0, row, 4]] = obj;
            output[[0, row, 5 + class]] = score;
        }

        let decoded = decode_yolo(&output.view().into_dyn(), &params(YoloLayout::Objectness), &coco()).unwrap();
        assert_eq!(decoded.len(), 1);
        let (det, class_id) = &decoded[0];
        assert_eq!(det.label, "bowl");
        assert_eq!(*class_id, 45);
        assert!((det.confidence - 0.81).abs() < 1e-6);
        assert_eq!(det.bounding_box, BoundingBox::new(160.0, 90.0, 240.0, 110.0));
    }

    #[test]
    fn test_decode_transposed_layout() {
        let mut output = Array3::<f32>::zeros((1, 84, 2));
        output[[0, 0, 1]] = 50.0;
        output[[0, 1, 1]] = 60.0;
        output[[0, 2, 1]] = 20.0;
        output[[0, 3, 1]] = 20.0;
        output[[0, 4 + 53, 1]] = 0.7;

        let decoded = decode_yolo(&output.view().into_dyn(), &params(YoloLayout::Transposed), &coco()).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].0.label, "pizza");
        assert!((decoded[0].0.confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_decode_rejects_bad_shape() {
        let output = Array3::<f32>::zeros((1, 3, 4));
        assert!(decode_yolo(&output.view().into_dyn(), &params(YoloLayout::Objectness), &coco()).is_err());
    }

    #[test]
    fn test_nms_is_class_wise() {
        let a = DetectedObject::new("pizza", BoundingBox::new(0.0, 0.0, 10.0, 10.0), 0.9);
        let b = DetectedObject::new("pizza", BoundingBox::new(1.0, 0.0, 11.0, 10.0), 0.8);
        let c = DetectedObject::new("bowl", BoundingBox::new(1.0, 0.0, 11.0, 10.0), 0.7);
        let kept = non_max_suppression(vec![(b, 53), (a, 53), (c, 45)], 0.45, 100);
        assert_eq!(kept.len(), 2);
        assert!((kept[0].confidence - 0.9).abs() < f32::EPSILON);
        assert_eq!(kept[1].label, "bowl");

        let d = DetectedObject::new("cake", BoundingBox::new(50.0, 50.0, 60.0, 60.0), 0.5);
        let e = DetectedObject::new("cake", BoundingBox::new(70.0, 70.0, 80.0, 80.0), 0.4);
        assert_eq!(non_max_suppression(vec![(d, 55), (e, 55)], 0.45, 1).len(), 1);
    }

    #[test]
    fn test_label_formatting() {
        assert_eq!(format_food_label("fried_rice"), "Fried Rice");
        assert_eq!(format_food_label("  chicken_CURRY "), "Chicken Curry");
        assert_eq!(format_food_label(""), "");
    }

    #[test]
    fn test_argmax_and_mask_logits() {
        assert_eq!(argmax(&[0.1, 3.0, f32::NAN, 2.0]), Some((1, 3.0)));
        assert_eq!(argmax(&[]), None);

        let logits = ndarray::arr2(&[[-1.0_f32, 0.5], [0.0, 2.0]]);
        let mask = mask_from_logits(&logits.view());
        assert_eq!(mask.dimensions, (2, 2));
        assert_eq!(mask.pixel_count(), 2);
        assert!(mask.is_set(1, 0));
        assert!(!mask.is_set(0, 1));
    }
}
