//! YOLO object detector

use super::{extract_f32, run_error, OnnxSession};
use crate::config::AnalysisConfig;
use crate::error::{NutrilensError, Result};
use crate::inference::ObjectDetector;
use crate::types::DetectedObject;
use crate::utils::postprocessing::{
    decode_yolo, non_max_suppression, YoloDecodeParams, YoloLayout, COCO_LABELS,
};
use crate::utils::preprocessing::{resize_exact_to_tensor, Normalization};
use image::RgbImage;
use ort::value::Value;
use std::path::Path;
use tracing::{debug, instrument};

const INPUT_SIZE: u32 = 640;
const MAX_DETECTIONS: usize = 100;

/// YOLOv5/YOLOv8 detector exported to ONNX with a `1x3x640x640` input
#[derive(Debug)]
pub struct OnnxObjectDetector {
    key: String,
    session: OnnxSession,
    layout: YoloLayout,
    labels: Vec<String>,
    confidence_threshold: f32,
    iou_threshold: f32,
}

impl OnnxObjectDetector {
    /// Load `<models_dir>/<key>.onnx`.
    ///
    /// Labels come from `<key>_labels.txt` when present (custom-trained
    /// detectors with `plate`, `credit_card`, `coin` classes), COCO otherwise.
    ///
    /// # Errors
    /// - Model file missing or invalid
    pub fn load(key: &str, config: &AnalysisConfig) -> Result<Self> {
        let path = config.models_dir.join(format!("{key}.onnx"));
        let session = OnnxSession::load(&path, config.execution_provider, config.intra_threads)?;

        let labels_path = config.models_dir.join(format!("{key}_labels.txt"));
        let labels = if labels_path.exists() {
            read_labels(&labels_path)?
        } else {
            COCO_LABELS.iter().map(ToString::to_string).collect()
        };

        let layout = if key.starts_with("yolov8") {
            YoloLayout::Transposed
        } else {
            YoloLayout::Objectness
        };

        Ok(Self {
            key: key.to_string(),
            session,
            layout,
            labels,
            confidence_threshold: config.detection_confidence,
            iou_threshold: config.nms_iou_threshold,
        })
    }
}

/// One label per line; blank lines are skipped
pub(crate) fn read_labels(path: &Path) -> Result<Vec<String>> {
    let contents = std::fs::read_to_string(path)?;
    let labels: Vec<String> = contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(ToString::to_string)
        .collect();
    if labels.is_empty() {
        return Err(NutrilensError::model(format!("Label file {} is empty", path.display())));
    }
    Ok(labels)
}

impl ObjectDetector for OnnxObjectDetector {
    fn name(&self) -> &str {
        &self.key
    }

    #[instrument(skip(self, image), fields(model = %self.key))]
    fn detect(&self, image: &RgbImage) -> Result<Vec<DetectedObject>> {
        let (width, height) = image.dimensions();
        let input = resize_exact_to_tensor(image, INPUT_SIZE, INPUT_SIZE, &Normalization::UNIT);
        let input_name = self.session.first_input_name("images").to_string();

        let output = self.session.with_session(|session| {
            let value = Value::from_array(input)
                .map_err(|e| NutrilensError::inference(format!("Failed to convert input tensor: {e}")))?;
            let outputs = session
                .run(ort::inputs![input_name.as_str() => value])
                .map_err(|e| run_error(&self.key, &e))?;
            let first_key = outputs
                .keys()
                .next()
                .map(ToString::to_string)
                .ok_or_else(|| NutrilensError::inference("No output tensors found"))?;
            let first = outputs
                .get(&first_key)
                .ok_or_else(|| NutrilensError::inference("First output tensor not found"))?;
            extract_f32(first)
        })?;

        let params = YoloDecodeParams {
            layout: self.layout,
            confidence_threshold: self.confidence_threshold,
            scale_x: width as f32 / INPUT_SIZE as f32,
            scale_y: height as f32 / INPUT_SIZE as f32,
            image_width: width,
            image_height: height,
        };
        let candidates = decode_yolo(&output.view(), &params, &self.labels)?;
        let detections = non_max_suppression(candidates, self.iou_threshold, MAX_DETECTIONS);

        debug!(count = detections.len(), "Detections after NMS");
        Ok(detections)
    }
}
