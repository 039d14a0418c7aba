//! Food-101 style image classifier

use super::detector::read_labels;
use super::{extract_f32, run_error, OnnxSession};
use crate::config::AnalysisConfig;
use crate::error::{NutrilensError, Result};
use crate::inference::{FoodClassifier, UNKNOWN_LABEL};
use crate::utils::postprocessing::{argmax, format_food_label};
use crate::utils::preprocessing::{resize_exact_to_tensor, Normalization};
use image::{DynamicImage, Rgb, RgbImage};
use ort::value::Value;
use tracing::{debug, instrument};

const INPUT_SIZE: u32 = 224;

#[derive(Debug)]
pub struct OnnxFoodClassifier {
    key: String,
    session: OnnxSession,
    labels: Vec<String>,
}

impl OnnxFoodClassifier {
    /// Load `<key>.onnx` and its `<key>_labels.txt`
    ///
    /// # Errors
    /// - Model or label file missing or invalid
    pub fn load(key: &str, config: &AnalysisConfig) -> Result<Self> {
        let path = config.models_dir.join(format!("{key}.onnx"));
        let labels_path = config.models_dir.join(format!("{key}_labels.txt"));
        if !labels_path.exists() {
            return Err(NutrilensError::model_error_with_context(
                "load labels for",
                &path,
                &format!("{} not found", labels_path.display()),
                &["place one label per line next to the model"],
            ));
        }

        Ok(Self {
            key: key.to_string(),
            session: OnnxSession::load(&path, config.execution_provider, config.intra_threads)?,
            labels: read_labels(&labels_path)?,
        })
    }
}

/// Flatten transparency onto white so masked-out pixels do not look like food
fn flatten_alpha(image: &DynamicImage) -> RgbImage {
    let rgba = image.to_rgba8();
    RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let [r, g, b, a] = rgba.get_pixel(x, y).0;
        let alpha = u16::from(a);
        let blend = |c: u8| ((u16::from(c) * alpha + 255 * (255 - alpha)) / 255) as u8;
        Rgb([blend(r), blend(g), blend(b)])
    })
}

impl FoodClassifier for OnnxFoodClassifier {
    fn name(&self) -> &str {
        &self.key
    }

    #[instrument(skip(self, image), fields(model = %self.key))]
    fn classify(&self, image: &DynamicImage) -> Result<String> {
        let rgb = if image.color().has_alpha() {
            flatten_alpha(image)
        } else {
            image.to_rgb8()
        };
        let input = resize_exact_to_tensor(&rgb, INPUT_SIZE, INPUT_SIZE, &Normalization::IMAGENET);
        let input_name = self.session.first_input_name("pixel_values").to_string();

        let logits = self.session.with_session(|session| {
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

        let scores: Vec<f32> = logits.iter().copied().collect();
        let label = argmax(&scores)
            .and_then(|(index, _)| self.labels.get(index))
            .map(|raw| format_food_label(raw))
            .filter(|label| !label.is_empty())
            .unwrap_or_else(|| UNKNOWN_LABEL.to_string());

        debug!(label = %label, "Classification");
        Ok(label)
    }
}
