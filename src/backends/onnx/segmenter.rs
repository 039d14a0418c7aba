//! SAM-family box-prompted segmenter (MobileSAM, SlimSAM, EfficientViT-SAM)

use super::{extract_f32, run_error, OnnxSession};
use crate::config::AnalysisConfig;
use crate::error::{NutrilensError, Result};
use crate::inference::FoodSegmenter;
use crate::types::{BoundingBox, FoodMask};
use crate::utils::postprocessing::mask_from_logits;
use crate::utils::preprocessing::{resize_longest_padded_to_tensor, resize_map_bilinear, Normalization};
use image::RgbImage;
use ndarray::{Array1, Array2, Array3, Array4, Axis, Ix4};
use ort::value::Value;
use tracing::{debug, instrument};

const ENCODER_SIZE: u32 = 1024;
const LOW_RES_MASK_SIZE: usize = 256;

/// Point labels SAM uses for the top-left and bottom-right box corners
const BOX_TOP_LEFT: f32 = 2.0;
const BOX_BOTTOM_RIGHT: f32 = 3.0;

/// Image encoder plus prompt decoder pair
#[derive(Debug)]
pub struct OnnxSamSegmenter {
    key: String,
    encoder: OnnxSession,
    decoder: OnnxSession,
}

impl OnnxSamSegmenter {
    /// Load `<key>_encoder.onnx` and `<key>_decoder.onnx`
    ///
    /// # Errors
    /// - Either model file missing or invalid
    pub fn load(key: &str, config: &AnalysisConfig) -> Result<Self> {
        let encoder_path = config.models_dir.join(format!("{key}_encoder.onnx"));
        let decoder_path = config.models_dir.join(format!("{key}_decoder.onnx"));

        Ok(Self {
            key: key.to_string(),
            encoder: OnnxSession::load(&encoder_path, config.execution_provider, config.intra_threads)?,
            decoder: OnnxSession::load(&decoder_path, config.execution_provider, config.intra_threads)?,
        })
    }

    fn encode(&self, image: &RgbImage) -> Result<(ndarray::ArrayD<f32>, f32)> {
        let (input, scale) = resize_longest_padded_to_tensor(image, ENCODER_SIZE, &Normalization::SAM)?;
        let input_name = self.encoder.first_input_name("image").to_string();

        let embeddings = self.encoder.with_session(|session| {
            let value = Value::from_array(input)
                .map_err(|e| NutrilensError::inference(format!("Failed to convert encoder input: {e}")))?;
            let outputs = session
                .run(ort::inputs![input_name.as_str() => value])
                .map_err(|e| run_error(&self.key, &e))?;
            let first_key = outputs
                .keys()
                .next()
                .map(ToString::to_string)
                .ok_or_else(|| NutrilensError::inference("Encoder produced no outputs"))?;
            let first = outputs
                .get(&first_key)
                .ok_or_else(|| NutrilensError::inference("Encoder output not found"))?;
            extract_f32(first)
        })?;

        Ok((embeddings, scale))
    }

    fn decode(
        &self,
        embeddings: ndarray::ArrayD<f32>,
        bbox: &BoundingBox,
        scale: f32,
        width: u32,
        height: u32,
    ) -> Result<ndarray::ArrayD<f32>> {
        let coords = Array3::from_shape_vec(
            (1, 2, 2),
            vec![bbox.x1 * scale, bbox.y1 * scale, bbox.x2 * scale, bbox.y2 * scale],
        )
        .map_err(|e| NutrilensError::internal(format!("Failed to build prompt: {e}")))?;
        let labels = Array2::from_shape_vec((1, 2), vec![BOX_TOP_LEFT, BOX_BOTTOM_RIGHT])
            .map_err(|e| NutrilensError::internal(format!("Failed to build prompt labels: {e}")))?;
        let mask_input = Array4::<f32>::zeros((1, 1, LOW_RES_MASK_SIZE, LOW_RES_MASK_SIZE));
        let has_mask_input = Array1::<f32>::zeros(1);
        let orig_im_size = Array1::from(vec![height as f32, width as f32]);

        let convert = |e: ort::Error| NutrilensError::inference(format!("Failed to convert decoder input: {e}"));

        self.decoder.with_session(|session| {
            let outputs = session
                .run(ort::inputs![
                    "image_embeddings" => Value::from_array(embeddings).map_err(convert)?,
                    "point_coords" => Value::from_array(coords).map_err(convert)?,
                    "point_labels" => Value::from_array(labels).map_err(convert)?,
                    "mask_input" => Value::from_array(mask_input).map_err(convert)?,
                    "has_mask_input" => Value::from_array(has_mask_input).map_err(convert)?,
                    "orig_im_size" => Value::from_array(orig_im_size).map_err(convert)?,
                ])
                .map_err(|e| run_error(&self.key, &e))?;

            let masks = match outputs.get("masks") {
                Some(masks) => masks,
                None => {
                    let first_key = outputs
                        .keys()
                        .next()
                        .map(ToString::to_string)
                        .ok_or_else(|| NutrilensError::inference("Decoder produced no outputs"))?;
                    outputs
                        .get(&first_key)
                        .ok_or_else(|| NutrilensError::inference("Decoder output not found"))?
                },
            };
            extract_f32(masks)
        })
    }
}

impl FoodSegmenter for OnnxSamSegmenter {
    fn name(&self) -> &str {
        &self.key
    }

    #[instrument(skip(self, image), fields(model = %self.key))]
    fn segment(&self, image: &RgbImage, bbox: &BoundingBox) -> Result<Vec<FoodMask>> {
        let (width, height) = image.dimensions();
        let (embeddings, scale) = self.encode(image)?;
        let logits = self.decode(embeddings, bbox, scale, width, height)?;

        let logits = logits
            .into_dimensionality::<Ix4>()
            .map_err(|e| NutrilensError::inference(format!("Expected 4D mask logits: {e}")))?;

        let masks: Vec<FoodMask> = logits
            .index_axis(Axis(0), 0)
            .outer_iter()
            .map(|candidate| {
                let (rows, cols) = candidate.dim();
                if (cols as u32, rows as u32) == (width, height) {
                    mask_from_logits(&candidate)
                } else {
                    let resized = resize_map_bilinear(&candidate.to_owned(), width, height);
                    mask_from_logits(&resized.view())
                }
            })
            .filter(|mask| mask.pixel_count() > 0)
            .collect();

        debug!(candidates = masks.len(), "Segmentation masks");
        Ok(masks)
    }
}
