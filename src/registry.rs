//! Model catalog and lazily loaded model set
//!
//! Every adapter kind has a fixed catalog of keys with one default. Models are
//! loaded on first use through a [`ModelFactory`]; a failed load leaves the
//! slot empty so the next request retries.

use crate::config::AnalysisConfig;
use crate::error::{NutrilensError, Result};
use crate::inference::{DepthEstimator, FoodClassifier, FoodSegmenter, ObjectDetector};
use crate::tracing_config::spans;
use crate::types::ModelInfo;
use image::{DynamicImage, RgbImage};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{info, instrument, warn, Instrument};

pub const DETECTION_MODELS: [&str; 2] = ["yolov5n", "yolov8n"];
pub const SEGMENTATION_MODELS: [&str; 3] = ["mobilesam", "slimsam", "efficientvit_sam"];
pub const DEPTH_MODELS: [&str; 4] = ["dpt_swinv2_tiny", "dpt_large", "lmdepth_s", "mininet"];
pub const CLASSIFICATION_MODELS: [&str; 1] = ["food101"];

/// Adapter kinds the pipeline consumes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Detection,
    Segmentation,
    Depth,
    Classification,
}

impl ModelKind {
    pub const ALL: [ModelKind; 4] = [
        ModelKind::Detection,
        ModelKind::Segmentation,
        ModelKind::Depth,
        ModelKind::Classification,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Detection => "detection",
            Self::Segmentation => "segmentation",
            Self::Depth => "depth",
            Self::Classification => "classification",
        }
    }
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Known keys for `kind`, default first
#[must_use]
pub fn catalog(kind: ModelKind) -> &'static [&'static str] {
    match kind {
        ModelKind::Detection => &DETECTION_MODELS,
        ModelKind::Segmentation => &SEGMENTATION_MODELS,
        ModelKind::Depth => &DEPTH_MODELS,
        ModelKind::Classification => &CLASSIFICATION_MODELS,
    }
}

#[must_use]
pub fn default_key(kind: ModelKind) -> &'static str {
    catalog(kind)[0]
}

/// Map a requested key onto the catalog.
///
/// Unknown keys log a warning and resolve to the kind's default.
#[must_use]
pub fn resolve_key(kind: ModelKind, requested: &str) -> &'static str {
    let requested = requested.trim();
    if let Some(key) = catalog(kind).iter().find(|key| key.eq_ignore_ascii_case(requested)) {
        return key;
    }
    let fallback = default_key(kind);
    warn!(kind = %kind, requested, fallback, "Unknown model key, using default");
    fallback
}

/// The model catalog, as listed by `--list-models`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailableModels {
    pub detection: Vec<String>,
    pub segmentation: Vec<String>,
    pub depth: Vec<String>,
    pub classification: Vec<String>,
}

#[must_use]
pub fn available_models() -> AvailableModels {
    let owned = |kind| catalog(kind).iter().map(ToString::to_string).collect();
    AvailableModels {
        detection: owned(ModelKind::Detection),
        segmentation: owned(ModelKind::Segmentation),
        depth: owned(ModelKind::Depth),
        classification: owned(ModelKind::Classification),
    }
}

/// Creates adapters from resolved model keys
pub trait ModelFactory: Send + Sync {
    /// # Errors
    /// - Model files missing or invalid
    fn create_detector(&self, key: &str, config: &AnalysisConfig) -> Result<Arc<dyn ObjectDetector>>;

    /// # Errors
    /// - Model files missing or invalid
    fn create_segmenter(&self, key: &str, config: &AnalysisConfig) -> Result<Arc<dyn FoodSegmenter>>;

    /// # Errors
    /// - Model files missing or invalid
    fn create_depth_estimator(&self, key: &str, config: &AnalysisConfig) -> Result<Arc<dyn DepthEstimator>>;

    /// # Errors
    /// - Model files missing or invalid
    fn create_classifier(&self, key: &str, config: &AnalysisConfig) -> Result<Arc<dyn FoodClassifier>>;
}

/// Loads ONNX Runtime adapters from `config.models_dir`
#[cfg(feature = "onnx")]
#[derive(Debug, Default, Clone, Copy)]
pub struct OnnxModelFactory;

#[cfg(feature = "onnx")]
impl ModelFactory for OnnxModelFactory {
    fn create_detector(&self, key: &str, config: &AnalysisConfig) -> Result<Arc<dyn ObjectDetector>> {
        Ok(Arc::new(crate::backends::OnnxObjectDetector::load(key, config)?))
    }

    fn create_segmenter(&self, key: &str, config: &AnalysisConfig) -> Result<Arc<dyn FoodSegmenter>> {
        Ok(Arc::new(crate::backends::OnnxSamSegmenter::load(key, config)?))
    }

    fn create_depth_estimator(&self, key: &str, config: &AnalysisConfig) -> Result<Arc<dyn DepthEstimator>> {
        Ok(Arc::new(crate::backends::OnnxDepthEstimator::load(key, config)?))
    }

    fn create_classifier(&self, key: &str, config: &AnalysisConfig) -> Result<Arc<dyn FoodClassifier>> {
        Ok(Arc::new(crate::backends::OnnxFoodClassifier::load(key, config)?))
    }
}

/// Factory for builds without an inference backend; every load fails
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableModelFactory;

impl UnavailableModelFactory {
    fn unavailable(kind: ModelKind, key: &str) -> NutrilensError {
        NutrilensError::invalid_config(format!(
            "Cannot load {kind} model '{key}': no inference backend compiled in. \
             Enable the 'onnx' feature or inject adapters with ModelRegistry::preloaded"
        ))
    }
}

impl ModelFactory for UnavailableModelFactory {
    fn create_detector(&self, key: &str, _config: &AnalysisConfig) -> Result<Arc<dyn ObjectDetector>> {
        Err(Self::unavailable(ModelKind::Detection, key))
    }

    fn create_segmenter(&self, key: &str, _config: &AnalysisConfig) -> Result<Arc<dyn FoodSegmenter>> {
        Err(Self::unavailable(ModelKind::Segmentation, key))
    }

    fn create_depth_estimator(&self, key: &str, _config: &AnalysisConfig) -> Result<Arc<dyn DepthEstimator>> {
        Err(Self::unavailable(ModelKind::Depth, key))
    }

    fn create_classifier(&self, key: &str, _config: &AnalysisConfig) -> Result<Arc<dyn FoodClassifier>> {
        Err(Self::unavailable(ModelKind::Classification, key))
    }
}

/// A complete set of already constructed adapters
#[derive(Clone)]
pub struct ModelSet {
    pub detector: Arc<dyn ObjectDetector>,
    pub segmenter: Arc<dyn FoodSegmenter>,
    pub depth: Arc<dyn DepthEstimator>,
    pub classifier: Arc<dyn FoodClassifier>,
}

impl std::fmt::Debug for ModelSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSet")
            .field("detector", &self.detector.name())
            .field("segmenter", &self.segmenter.name())
            .field("depth", &self.depth.name())
            .field("classifier", &self.classifier.name())
            .finish()
    }
}

#[derive(Debug, Clone)]
struct ResolvedKeys {
    detection: &'static str,
    segmentation: &'static str,
    depth: &'static str,
    classification: &'static str,
}

impl ResolvedKeys {
    fn from_config(config: &AnalysisConfig) -> Self {
        Self {
            detection: resolve_key(ModelKind::Detection, &config.models.detection),
            segmentation: resolve_key(ModelKind::Segmentation, &config.models.segmentation),
            depth: resolve_key(ModelKind::Depth, &config.models.depth),
            classification: resolve_key(ModelKind::Classification, &config.models.classification),
        }
    }
}

/// Wall-clock time per stage for one image, in milliseconds
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageTimings {
    pub detection_ms: f64,
    pub objects_count: usize,
    pub depth_ms: f64,
    pub depth_available: bool,
    /// `None` when nothing was detected to prompt the segmenter with
    pub segmentation_ms: Option<f64>,
    pub masks_count: usize,
    pub classification_ms: f64,
}

/// Lazily loaded adapters shared by every pipeline run
pub struct ModelRegistry {
    config: AnalysisConfig,
    keys: ResolvedKeys,
    factory: Arc<dyn ModelFactory>,
    detector: OnceCell<Arc<dyn ObjectDetector>>,
    segmenter: OnceCell<Arc<dyn FoodSegmenter>>,
    depth: OnceCell<Arc<dyn DepthEstimator>>,
    classifier: OnceCell<Arc<dyn FoodClassifier>>,
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("keys", &self.keys)
            .field("models_loaded", &self.loaded_map())
            .finish_non_exhaustive()
    }
}

/// Run a blocking model load off the async executor
async fn load_blocking<T, F>(kind: ModelKind, key: &'static str, load: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let result = async {
        info!("Loading model");
        tokio::task::spawn_blocking(load)
            .await
            .map_err(|e| NutrilensError::internal(format!("Model loading task panicked: {e}")))?
    }
    .instrument(spans::model_loading(kind.as_str(), key))
    .await;
    if let Err(e) = &result {
        warn!(kind = %kind, key, error = %e, "Model load failed");
    }
    result
}

impl ModelRegistry {
    /// Registry that loads models through `factory` on first use
    #[must_use]
    pub fn new(config: AnalysisConfig, factory: Arc<dyn ModelFactory>) -> Self {
        let keys = ResolvedKeys::from_config(&config);
        Self {
            config,
            keys,
            factory,
            detector: OnceCell::new(),
            segmenter: OnceCell::new(),
            depth: OnceCell::new(),
            classifier: OnceCell::new(),
        }
    }

    /// Registry backed by ONNX Runtime models in `config.models_dir`
    #[cfg(feature = "onnx")]
    #[must_use]
    pub fn onnx(config: AnalysisConfig) -> Self {
        Self::new(config, Arc::new(OnnxModelFactory))
    }

    /// Registry over adapters the caller already built
    #[must_use]
    pub fn preloaded(config: AnalysisConfig, models: ModelSet) -> Self {
        let keys = ResolvedKeys::from_config(&config);
        Self {
            config,
            keys,
            factory: Arc::new(UnavailableModelFactory),
            detector: OnceCell::new_with(Some(models.detector)),
            segmenter: OnceCell::new_with(Some(models.segmenter)),
            depth: OnceCell::new_with(Some(models.depth)),
            classifier: OnceCell::new_with(Some(models.classifier)),
        }
    }

    #[must_use]
    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// # Errors
    /// - Detector failed to load
    pub async fn detector(&self) -> Result<Arc<dyn ObjectDetector>> {
        let key = self.keys.detection;
        self.detector
            .get_or_try_init(|| {
                let factory = Arc::clone(&self.factory);
                let config = self.config.clone();
                load_blocking(ModelKind::Detection, key, move || factory.create_detector(key, &config))
            })
            .await
            .map(Arc::clone)
    }

    /// # Errors
    /// - Segmenter failed to load
    pub async fn segmenter(&self) -> Result<Arc<dyn FoodSegmenter>> {
        let key = self.keys.segmentation;
        self.segmenter
            .get_or_try_init(|| {
                let factory = Arc::clone(&self.factory);
                let config = self.config.clone();
                load_blocking(ModelKind::Segmentation, key, move || factory.create_segmenter(key, &config))
            })
            .await
            .map(Arc::clone)
    }

    /// # Errors
    /// - Depth estimator failed to load
    pub async fn depth_estimator(&self) -> Result<Arc<dyn DepthEstimator>> {
        let key = self.keys.depth;
        self.depth
            .get_or_try_init(|| {
                let factory = Arc::clone(&self.factory);
                let config = self.config.clone();
                load_blocking(ModelKind::Depth, key, move || factory.create_depth_estimator(key, &config))
            })
            .await
            .map(Arc::clone)
    }

    /// # Errors
    /// - Classifier failed to load
    pub async fn classifier(&self) -> Result<Arc<dyn FoodClassifier>> {
        let key = self.keys.classification;
        self.classifier
            .get_or_try_init(|| {
                let factory = Arc::clone(&self.factory);
                let config = self.config.clone();
                load_blocking(ModelKind::Classification, key, move || factory.create_classifier(key, &config))
            })
            .await
            .map(Arc::clone)
    }

    /// Load every model now instead of on first use
    ///
    /// # Errors
    /// - The first model that fails to load
    pub async fn preload_all(&self) -> Result<()> {
        self.detector().await?;
        self.segmenter().await?;
        self.depth_estimator().await?;
        self.classifier().await?;
        Ok(())
    }

    fn loaded_map(&self) -> BTreeMap<String, bool> {
        [
            (ModelKind::Detection, self.detector.initialized()),
            (ModelKind::Segmentation, self.segmenter.initialized()),
            (ModelKind::Depth, self.depth.initialized()),
            (ModelKind::Classification, self.classifier.initialized()),
        ]
        .into_iter()
        .map(|(kind, loaded)| (kind.as_str().to_string(), loaded))
        .collect()
    }

    /// Resolved keys and current load state
    #[must_use]
    pub fn model_info(&self) -> ModelInfo {
        ModelInfo {
            detection: self.keys.detection.to_string(),
            segmentation: self.keys.segmentation.to_string(),
            depth: self.keys.depth.to_string(),
            classification: self.keys.classification.to_string(),
            models_loaded: self.loaded_map(),
        }
    }

    /// Time each model on one image. Segmentation is prompted with the first detection only.
    ///
    /// # Errors
    /// - Any model failing to load or run
    #[instrument(skip(self, image), fields(width = image.width(), height = image.height()))]
    pub async fn benchmark(&self, image: &RgbImage) -> Result<StageTimings> {
        let detector = self.detector().await?;
        let depth = self.depth_estimator().await?;
        let segmenter = self.segmenter().await?;
        let classifier = self.classifier().await?;
        let image = Arc::new(image.clone());

        let task_image = Arc::clone(&image);
        tokio::task::spawn_blocking(move || {
            let elapsed_ms = |start: instant::Instant| start.elapsed().as_secs_f64() * 1000.0;
            let mut timings = StageTimings::default();

            let start = instant::Instant::now();
            let objects = detector.detect(&task_image)?;
            timings.detection_ms = elapsed_ms(start);
            timings.objects_count = objects.len();

            let start = instant::Instant::now();
            timings.depth_available = depth.estimate_depth(&task_image)?.is_some();
            timings.depth_ms = elapsed_ms(start);

            if let Some(first) = objects.first() {
                let start = instant::Instant::now();
                timings.masks_count = segmenter.segment(&task_image, &first.bounding_box)?.len();
                timings.segmentation_ms = Some(elapsed_ms(start));
            }

            let start = instant::Instant::now();
            classifier.classify(&DynamicImage::ImageRgb8((*task_image).clone()))?;
            timings.classification_ms = elapsed_ms(start);

            Ok(timings)
        })
        .await
        .map_err(|e| NutrilensError::internal(format!("Benchmark task panicked: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::test_utils::{MockClassifier, MockDepthEstimator, MockDetector, MockSegmenter};
    use crate::types::{BoundingBox, DetectedObject};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the first `failures` detector loads, then succeeds
    struct FlakyFactory {
        failures: usize,
        attempts: AtomicUsize,
    }

    impl ModelFactory for FlakyFactory {
        fn create_detector(&self, _key: &str, _config: &AnalysisConfig) -> Result<Arc<dyn ObjectDetector>> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                Err(NutrilensError::model("weights not downloaded yet"))
            } else {
                Ok(Arc::new(MockDetector::empty()))
            }
        }

        fn create_segmenter(&self, key: &str, config: &AnalysisConfig) -> Result<Arc<dyn FoodSegmenter>> {
            UnavailableModelFactory.create_segmenter(key, config)
        }

        fn create_depth_estimator(&self, key: &str, config: &AnalysisConfig) -> Result<Arc<dyn DepthEstimator>> {
            UnavailableModelFactory.create_depth_estimator(key, config)
        }

        fn create_classifier(&self, key: &str, config: &AnalysisConfig) -> Result<Arc<dyn FoodClassifier>> {
            UnavailableModelFactory.create_classifier(key, config)
        }
    }

    fn mock_set() -> ModelSet {
        ModelSet {
            detector: Arc::new(MockDetector::new(vec![DetectedObject::new(
                "food",
                BoundingBox::new(2.0, 2.0, 10.0, 10.0),
                0.9,
            )])),
            segmenter: Arc::new(MockSegmenter::fill_box()),
            depth: Arc::new(MockDepthEstimator::new()),
            classifier: Arc::new(MockClassifier::new("Fried Rice")),
        }
    }

    #[test]
    fn test_resolve_key_falls_back_to_default() {
        assert_eq!(resolve_key(ModelKind::Detection, "yolov8n"), "yolov8n");
        assert_eq!(resolve_key(ModelKind::Detection, "YOLOV8N"), "yolov8n");
        assert_eq!(resolve_key(ModelKind::Detection, "yolov99"), "yolov5n");
        assert_eq!(resolve_key(ModelKind::Segmentation, ""), "mobilesam");
        assert_eq!(resolve_key(ModelKind::Depth, "dpt_large"), "dpt_large");
        assert_eq!(resolve_key(ModelKind::Depth, "zoedepth"), "dpt_swinv2_tiny");
    }

    #[test]
    fn test_available_models_lists_catalog() {
        let models = available_models();
        assert_eq!(models.detection, vec!["yolov5n", "yolov8n"]);
        assert_eq!(models.segmentation.len(), 3);
        assert_eq!(models.depth.len(), 4);
        assert_eq!(models.classification, vec!["food101"]);
    }

    #[tokio::test]
    async fn test_failed_load_is_retried() {
        let factory = Arc::new(FlakyFactory {
            failures: 1,
            attempts: AtomicUsize::new(0),
        });
        let registry = ModelRegistry::new(AnalysisConfig::default(), factory.clone());

        assert!(registry.detector().await.is_err());
        assert!(!registry.model_info().models_loaded["detection"]);

        assert!(registry.detector().await.is_ok());
        assert!(registry.model_info().models_loaded["detection"]);

        // cached after success
        assert!(registry.detector().await.is_ok());
        assert_eq!(factory.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unavailable_factory_reports_config_error() {
        let registry = ModelRegistry::new(AnalysisConfig::default(), Arc::new(UnavailableModelFactory));
        let err = registry.classifier().await.err().expect("classifier should fail");
        assert!(matches!(err, NutrilensError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_preloaded_registry_info() {
        let config = AnalysisConfig::builder().depth_model("not-a-model").build().unwrap();
        let registry = ModelRegistry::preloaded(config, mock_set());
        let info = registry.model_info();

        assert_eq!(info.detection, "yolov5n");
        assert_eq!(info.depth, "dpt_swinv2_tiny");
        assert!(info.models_loaded.values().all(|loaded| *loaded));
        assert!(registry.preload_all().await.is_ok());
    }

    #[tokio::test]
    async fn test_benchmark_with_mocks() {
        let registry = ModelRegistry::preloaded(AnalysisConfig::default(), mock_set());
        let image = RgbImage::new(16, 16);
        let timings = registry.benchmark(&image).await.unwrap();

        assert_eq!(timings.objects_count, 1);
        assert_eq!(timings.masks_count, 1);
        assert!(timings.depth_available);
        assert!(timings.segmentation_ms.is_some());
    }
}
