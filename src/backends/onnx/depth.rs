//! DPT / MiDaS style monocular depth estimator

use super::{extract_f32, run_error, OnnxSession};
use crate::config::AnalysisConfig;
use crate::error::{NutrilensError, Result};
use crate::inference::DepthEstimator;
use crate::types::DepthMap;
use crate::utils::preprocessing::{resize_exact_to_tensor, resize_map_bilinear, Normalization};
use image::RgbImage;
use ndarray::Array2;
use ort::value::Value;
use tracing::instrument;

#[derive(Debug)]
pub struct OnnxDepthEstimator {
    key: String,
    session: OnnxSession,
    input_size: u32,
}

impl OnnxDepthEstimator {
    /// Load `<models_dir>/<key>.onnx`
    ///
    /// # Errors
    /// - Model file missing or invalid
    pub fn load(key: &str, config: &AnalysisConfig) -> Result<Self> {
        let path = config.models_dir.join(format!("{key}.onnx"));
        let input_size = if key == "dpt_large" { 384 } else { 256 };

        Ok(Self {
            key: key.to_string(),
            session: OnnxSession::load(&path, config.execution_provider, config.intra_threads)?,
            input_size,
        })
    }
}

impl DepthEstimator for OnnxDepthEstimator {
    fn name(&self) -> &str {
        &self.key
    }

    #[instrument(skip(self, image), fields(model = %self.key))]
    fn estimate_depth(&self, image: &RgbImage) -> Result<Option<DepthMap>> {
        let (width, height) = image.dimensions();
        let input = resize_exact_to_tensor(image, self.input_size, self.input_size, &Normalization::IMAGENET);
        let input_name = self.session.first_input_name("pixel_values").to_string();

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

        // predicted depth comes as [1, 1, H, W], [1, H, W] or [H, W]
        let shape = output.shape().to_vec();
        let (rows, cols) = match shape.as_slice() {
            [.., rows, cols] if *rows > 0 && *cols > 0 => (*rows, *cols),
            _ => {
                log::warn!("Unexpected depth output shape {shape:?}");
                return Ok(None);
            },
        };

        let map: Array2<f32> = output
            .into_shape_with_order((rows, cols))
            .map_err(|e| NutrilensError::inference(format!("Failed to reshape depth output: {e}")))?;

        Ok(Some(DepthMap::new(resize_map_bilinear(&map, width, height))))
    }
}
