//! Configuration types for food analysis

use crate::error::{NutrilensError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable holding the USDA FoodData Central API key
pub const USDA_API_KEY_ENV: &str = "USDA_API_KEY";

/// Environment variable overriding the default model directory
pub const MODELS_DIR_ENV: &str = "NUTRILENS_MODELS_DIR";

/// Execution provider options for ONNX Runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionProvider {
    /// Auto-detect best available provider (CUDA > `CoreML` > CPU)
    #[default]
    Auto,
    /// CPU execution (always available)
    Cpu,
    /// NVIDIA CUDA GPU acceleration
    Cuda,
    /// Apple Silicon acceleration
    CoreMl,
}

impl std::fmt::Display for ExecutionProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
            Self::CoreMl => write!(f, "coreml"),
        }
    }
}

impl std::str::FromStr for ExecutionProvider {
    type Err = NutrilensError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            "cuda" => Ok(Self::Cuda),
            "coreml" => Ok(Self::CoreMl),
            other => Err(NutrilensError::invalid_config(format!(
                "Unknown execution provider '{other}' (expected auto, cpu, cuda or coreml)"
            ))),
        }
    }
}

/// Model key per adapter kind.
///
/// Keys are resolved through [`crate::registry::resolve_key`], so an unknown
/// key degrades to that kind's default instead of failing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSelection {
    pub detection: String,
    pub segmentation: String,
    pub depth: String,
    pub classification: String,
}

impl Default for ModelSelection {
    fn default() -> Self {
        Self {
            detection: "yolov5n".to_string(),
            segmentation: "mobilesam".to_string(),
            depth: "dpt_swinv2_tiny".to_string(),
            classification: "food101".to_string(),
        }
    }
}

/// Settings for the USDA FoodData Central client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NutritionConfig {
    /// API key; never serialized
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub endpoint: String,
    /// FoodData Central `dataType` filter
    pub data_type: String,
    pub timeout_secs: u64,
}

impl Default for NutritionConfig {
    fn default() -> Self {
        Self {
            api_key: std::env::var(USDA_API_KEY_ENV).ok().filter(|key| !key.trim().is_empty()),
            endpoint: "https://api.nal.usda.gov/fdc/v1/foods/search".to_string(),
            data_type: "Branded".to_string(),
            timeout_secs: 10,
        }
    }
}

/// Default model directory: `$NUTRILENS_MODELS_DIR`, else `<cache>/nutrilens/models`
#[must_use]
pub fn default_models_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(MODELS_DIR_ENV) {
        return PathBuf::from(dir);
    }
    dirs::cache_dir()
        .map(|cache| cache.join("nutrilens").join("models"))
        .unwrap_or_else(|| PathBuf::from("models"))
}

/// Configuration for one analysis pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Masks covering more than this fraction of the image are rejected
    pub mask_rejection_threshold: f64,
    /// Reference candidates need a box area above this fraction of the image
    pub reference_min_area_fraction: f64,
    /// Upper bound for a single item's weight in grams
    pub max_item_weight_g: f64,
    /// Minimum detector score
    pub detection_confidence: f32,
    /// IoU threshold for non-maximum suppression
    pub nms_iou_threshold: f32,
    pub models: ModelSelection,
    pub models_dir: PathBuf,
    /// Execution provider for ONNX Runtime
    pub execution_provider: ExecutionProvider,
    /// Number of intra-op threads for inference (0 = auto)
    pub intra_threads: usize,
    /// Root directory for debug artifacts; `None` disables debug output
    pub debug_dir: Option<PathBuf>,
    pub nutrition: NutritionConfig,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            mask_rejection_threshold: 0.9,
            reference_min_area_fraction: 0.01,
            max_item_weight_g: 1500.0,
            detection_confidence: 0.25,
            nms_iou_threshold: 0.45,
            models: ModelSelection::default(),
            models_dir: default_models_dir(),
            execution_provider: ExecutionProvider::default(),
            intra_threads: 0,
            debug_dir: None,
            nutrition: NutritionConfig::default(),
        }
    }
}

impl AnalysisConfig {
    /// Create a new configuration builder
    ///
    /// ```rust
    /// use nutrilens::AnalysisConfig;
    ///
    /// let config = AnalysisConfig::builder()
    ///     .mask_rejection_threshold(0.95)
    ///     .build()
    ///     .unwrap();
    /// assert!((config.mask_rejection_threshold - 0.95).abs() < f64::EPSILON);
    /// ```
    #[must_use]
    pub fn builder() -> AnalysisConfigBuilder {
        AnalysisConfigBuilder::default()
    }

    /// Load a configuration from a JSON file; missing fields take their defaults
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration parameters
    ///
    /// # Errors
    /// - Any threshold or fraction outside its documented range
    /// - Non-positive weight cap or nutrition timeout
    pub fn validate(&self) -> Result<()> {
        if !(self.mask_rejection_threshold > 0.0 && self.mask_rejection_threshold <= 1.0) {
            return Err(NutrilensError::config_value_error(
                "mask_rejection_threshold",
                self.mask_rejection_threshold,
                "(0, 1]",
                Some(0.9),
            ));
        }
        if !(0.0..1.0).contains(&self.reference_min_area_fraction) {
            return Err(NutrilensError::config_value_error(
                "reference_min_area_fraction",
                self.reference_min_area_fraction,
                "[0, 1)",
                Some(0.01),
            ));
        }
        if !(self.max_item_weight_g.is_finite() && self.max_item_weight_g > 0.0) {
            return Err(NutrilensError::config_value_error(
                "max_item_weight_g",
                self.max_item_weight_g,
                "> 0",
                Some(1500.0),
            ));
        }
        if !(0.0..=1.0).contains(&self.detection_confidence) {
            return Err(NutrilensError::config_value_error(
                "detection_confidence",
                self.detection_confidence,
                "[0, 1]",
                Some(0.25),
            ));
        }
        if !(self.nms_iou_threshold > 0.0 && self.nms_iou_threshold <= 1.0) {
            return Err(NutrilensError::config_value_error(
                "nms_iou_threshold",
                self.nms_iou_threshold,
                "(0, 1]",
                Some(0.45),
            ));
        }
        if self.nutrition.timeout_secs == 0 {
            return Err(NutrilensError::config_value_error(
                "nutrition.timeout_secs",
                0,
                ">= 1",
                Some(10),
            ));
        }
        Ok(())
    }
}

/// Builder for `AnalysisConfig`
#[derive(Debug, Default)]
pub struct AnalysisConfigBuilder {
    config: AnalysisConfig,
}

impl AnalysisConfigBuilder {
    #[must_use]
    pub fn mask_rejection_threshold(mut self, threshold: f64) -> Self {
        self.config.mask_rejection_threshold = threshold;
        self
    }

    #[must_use]
    pub fn reference_min_area_fraction(mut self, fraction: f64) -> Self {
        self.config.reference_min_area_fraction = fraction;
        self
    }

    #[must_use]
    pub fn max_item_weight_g(mut self, grams: f64) -> Self {
        self.config.max_item_weight_g = grams;
        self
    }

    #[must_use]
    pub fn detection_confidence(mut self, confidence: f32) -> Self {
        self.config.detection_confidence = confidence;
        self
    }

    #[must_use]
    pub fn nms_iou_threshold(mut self, iou: f32) -> Self {
        self.config.nms_iou_threshold = iou;
        self
    }

    #[must_use]
    pub fn models(mut self, models: ModelSelection) -> Self {
        self.config.models = models;
        self
    }

    #[must_use]
    pub fn detection_model<S: Into<String>>(mut self, key: S) -> Self {
        self.config.models.detection = key.into();
        self
    }

    #[must_use]
    pub fn segmentation_model<S: Into<String>>(mut self, key: S) -> Self {
        self.config.models.segmentation = key.into();
        self
    }

    #[must_use]
    pub fn depth_model<S: Into<String>>(mut self, key: S) -> Self {
        self.config.models.depth = key.into();
        self
    }

    #[must_use]
    pub fn classification_model<S: Into<String>>(mut self, key: S) -> Self {
        self.config.models.classification = key.into();
        self
    }

    #[must_use]
    pub fn models_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.config.models_dir = dir.into();
        self
    }

    #[must_use]
    pub fn execution_provider(mut self, provider: ExecutionProvider) -> Self {
        self.config.execution_provider = provider;
        self
    }

    #[must_use]
    pub fn intra_threads(mut self, threads: usize) -> Self {
        self.config.intra_threads = threads;
        self
    }

    /// Enable debug artifacts below `dir`
    #[must_use]
    pub fn debug_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.config.debug_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn nutrition(mut self, nutrition: NutritionConfig) -> Self {
        self.config.nutrition = nutrition;
        self
    }

    #[must_use]
    pub fn usda_api_key<S: Into<String>>(mut self, key: S) -> Self {
        self.config.nutrition.api_key = Some(key.into());
        self
    }

    /// Build the configuration, validating all parameters
    pub fn build(self) -> Result<AnalysisConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AnalysisConfig::default();
        assert!(config.validate().is_ok());
        assert!((config.mask_rejection_threshold - 0.9).abs() < f64::EPSILON);
        assert!((config.reference_min_area_fraction - 0.01).abs() < f64::EPSILON);
        assert!((config.max_item_weight_g - 1500.0).abs() < f64::EPSILON);
        assert_eq!(config.models.detection, "yolov5n");
        assert_eq!(config.models.segmentation, "mobilesam");
        assert_eq!(config.models.depth, "dpt_swinv2_tiny");
    }

    #[test]
    fn test_builder_rejects_out_of_range_values() {
        assert!(AnalysisConfig::builder().mask_rejection_threshold(0.0).build().is_err());
        assert!(AnalysisConfig::builder().mask_rejection_threshold(1.2).build().is_err());
        assert!(AnalysisConfig::builder().reference_min_area_fraction(1.0).build().is_err());
        assert!(AnalysisConfig::builder().max_item_weight_g(-1.0).build().is_err());
        assert!(AnalysisConfig::builder().detection_confidence(1.5).build().is_err());
        assert!(AnalysisConfig::builder().nms_iou_threshold(0.0).build().is_err());
    }

    #[test]
    fn test_builder_sets_fields() {
        let config = AnalysisConfig::builder()
            .mask_rejection_threshold(0.95)
            .detection_model("yolov8n")
            .execution_provider(ExecutionProvider::Cpu)
            .debug_dir("/tmp/nutrilens-debug")
            .build()
            .unwrap();
        assert!((config.mask_rejection_threshold - 0.95).abs() < f64::EPSILON);
        assert_eq!(config.models.detection, "yolov8n");
        assert_eq!(config.execution_provider, ExecutionProvider::Cpu);
        assert_eq!(config.debug_dir, Some(PathBuf::from("/tmp/nutrilens-debug")));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: AnalysisConfig =
            serde_json::from_str(r#"{"mask_rejection_threshold": 0.8, "models": {"depth": "dpt_large"}}"#)
                .unwrap();
        assert!((config.mask_rejection_threshold - 0.8).abs() < f64::EPSILON);
        assert_eq!(config.models.depth, "dpt_large");
        assert_eq!(config.models.detection, "yolov5n");
        assert!((config.max_item_weight_g - 1500.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_api_key_is_not_serialized() {
        let config = AnalysisConfig::builder().usda_api_key("secret").build().unwrap();
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("secret"));
    }

    #[test]
    fn test_execution_provider_parsing() {
        assert_eq!("CUDA".parse::<ExecutionProvider>().unwrap(), ExecutionProvider::Cuda);
        assert_eq!("coreml".parse::<ExecutionProvider>().unwrap(), ExecutionProvider::CoreMl);
        assert!("tpu".parse::<ExecutionProvider>().is_err());
        assert_eq!(ExecutionProvider::Auto.to_string(), "auto");
    }
}
