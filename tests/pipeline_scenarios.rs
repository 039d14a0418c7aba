//! End-to-end pipeline scenarios
//!
//! These tests drive the full pipeline with mock adapters, so they need no
//! model files and no network.

use anyhow::Result;
use image::{DynamicImage, ImageFormat, RgbImage};
use nutrilens::{
    backends::test_utils::{MaskBehavior, MockClassifier, MockDepthEstimator, MockDetector, MockSegmenter},
    nutrition::{NoNutritionLookup, NutritionLookup, StaticNutritionTable},
    pipeline::{NOTE_NO_FOOD, NOTE_NO_OBJECTS, NOTE_NO_REFERENCE},
    registry::{ModelFactory, ModelRegistry, ModelSet},
    services::{debug, RecordingProgressReporter},
    AnalysisConfig, BoundingBox, DepthEstimator, DetectedObject, FoodAnalysisPipeline, FoodClassifier,
    FoodSegmenter, NutritionFacts, ObjectDetector, PipelineOutcome, PipelineStage,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

fn object(label: &str, x1: f32, y1: f32, x2: f32, y2: f32) -> DetectedObject {
    DetectedObject::new(label, BoundingBox::new(x1, y1, x2, y2), 0.9)
}

fn test_image(width: u32, height: u32) -> DynamicImage {
    let mut image = RgbImage::new(width, height);
    for (x, y, pixel) in image.enumerate_pixels_mut() {
        *pixel = image::Rgb([(x % 256) as u8, (y % 256) as u8, 128]);
    }
    DynamicImage::ImageRgb8(image)
}

fn encode_png(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    image.write_to(&mut std::io::Cursor::new(&mut buffer), ImageFormat::Png)?;
    Ok(buffer)
}

fn fried_rice_facts() -> NutritionFacts {
    NutritionFacts::new()
        .with("calories", 238.0)
        .with("protein", 8.0)
        .with("carbs", 26.0)
        .with("fat", 12.0)
}

struct Scenario {
    detector: MockDetector,
    segmenter: MockSegmenter,
    depth: MockDepthEstimator,
    classifier: MockClassifier,
    config: AnalysisConfig,
    nutrition: Arc<dyn NutritionLookup>,
}

impl Scenario {
    fn new(objects: Vec<DetectedObject>) -> Self {
        Self {
            detector: MockDetector::new(objects),
            segmenter: MockSegmenter::fill_box(),
            depth: MockDepthEstimator::unavailable(),
            classifier: MockClassifier::unknown(),
            config: AnalysisConfig::default(),
            nutrition: Arc::new(NoNutritionLookup),
        }
    }

    fn pipeline(&self) -> FoodAnalysisPipeline {
        let models = ModelSet {
            detector: Arc::new(self.detector.clone()),
            segmenter: Arc::new(self.segmenter.clone()),
            depth: Arc::new(self.depth.clone()),
            classifier: Arc::new(self.classifier.clone()),
        };
        let registry = Arc::new(ModelRegistry::preloaded(self.config.clone(), models));
        FoodAnalysisPipeline::new(registry, Arc::clone(&self.nutrition))
    }
}

#[tokio::test]
async fn test_plate_calibrated_fried_rice() -> Result<()> {
    let mut scenario = Scenario::new(vec![
        object("plate", 0.0, 0.0, 240.0, 240.0),
        object("food", 50.0, 50.0, 190.0, 190.0),
    ]);
    scenario.classifier = MockClassifier::new("fried_rice");
    scenario.nutrition = Arc::new(StaticNutritionTable::new().with_entry("fried_rice", fried_rice_facts()));

    let bytes = encode_png(&test_image(1000, 1000))?;
    let result = scenario.pipeline().run_pipeline(&bytes).await?;

    assert_eq!(result.outcome, PipelineOutcome::Success);
    assert_eq!(result.reference_object.as_deref(), Some("plate"));
    let ratio = result.pixel_to_cm_ratio.unwrap();
    assert!((ratio - 0.1).abs() < 1e-9);

    assert_eq!(result.detected_foods.len(), 1);
    let item = &result.detected_foods[0];
    assert_eq!(item.food_name, "fried_rice");
    assert_eq!(item.detector_label, "food");
    assert_eq!(item.mask_pixels, 140 * 140);
    // 196 cm² area, shape factor 0.5, rice density 0.8
    let expected = 0.5 * 196.0_f64.powf(1.5) * 0.8;
    assert!((expected - 1097.6).abs() < 1e-9);
    assert!((item.estimated_weight_g - expected).abs() < 1e-6);
    assert!((item.confidence - 0.75).abs() < 1e-9);

    let calories = item.nutrition.get("calories").unwrap();
    assert!((calories - 238.0 * expected / 100.0).abs() < 1e-6);
    assert!((item.nutrition.get("fat").unwrap() - 12.0 * expected / 100.0).abs() < 1e-6);
    // base nutrients missing from the record are zero, not absent
    assert_eq!(item.nutrition.get("fiber"), Some(0.0));
    assert!((result.total_weight_g - expected).abs() < 1e-6);
    assert!(result.note.contains("'plate'"));
    assert!(result.processing_time_ms < 60_000);

    // only the food object is segmented
    assert_eq!(scenario.segmenter.history().len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_no_detections_is_empty() -> Result<()> {
    let scenario = Scenario::new(Vec::new());
    let result = scenario.pipeline().analyze_image(&test_image(64, 64)).await?;

    assert_eq!(result.outcome, PipelineOutcome::Empty);
    assert_eq!(result.note, NOTE_NO_OBJECTS);
    assert!(result.detected_foods.is_empty());
    assert!(result.total_weight_g.abs() < f64::EPSILON);
    assert!(scenario.segmenter.history().is_empty());
    assert!(scenario.depth.history().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_all_masks_rejected_falls_back_to_classification() -> Result<()> {
    let mut scenario = Scenario::new(vec![object("bowl_of_food", 10.0, 10.0, 50.0, 50.0)]);
    scenario.segmenter = MockSegmenter::new(MaskBehavior::Empty);
    scenario.classifier = MockClassifier::new("ramen");

    let result = scenario.pipeline().analyze_image(&test_image(100, 100)).await?;

    assert_eq!(result.outcome, PipelineOutcome::FallbackClassify);
    assert!(result.detected_foods.is_empty());
    assert_eq!(result.fallback_suggestion.as_ref().map(|s| s.food_name.as_str()), Some("ramen"));
    assert!(result.note.contains("'ramen'"));
    assert!(result.total_weight_g.abs() < f64::EPSILON);
    // classifier saw the whole image
    assert_eq!(scenario.classifier.history().calls(), vec!["classify 100x100".to_string()]);
    Ok(())
}

#[tokio::test]
async fn test_fallback_without_meaningful_label_is_empty() -> Result<()> {
    let mut scenario = Scenario::new(vec![object("salad", 10.0, 10.0, 50.0, 50.0)]);
    scenario.segmenter = MockSegmenter::new(MaskBehavior::Fail);

    let result = scenario.pipeline().analyze_image(&test_image(100, 100)).await?;

    assert_eq!(result.outcome, PipelineOutcome::Empty);
    assert_eq!(result.note, NOTE_NO_FOOD);
    assert!(result.fallback_suggestion.is_none());
    Ok(())
}

#[tokio::test]
async fn test_mask_rejection_threshold() -> Result<()> {
    let image = test_image(100, 100);

    let mut rejected = Scenario::new(vec![object("pasta", 0.0, 0.0, 100.0, 100.0)]);
    rejected.segmenter = MockSegmenter::new(MaskBehavior::Coverage(0.96));
    let result = rejected.pipeline().analyze_image(&image).await?;
    assert!(result.detected_foods.is_empty());
    assert_ne!(result.outcome, PipelineOutcome::Success);

    let mut accepted = Scenario::new(vec![object("pasta", 0.0, 0.0, 100.0, 100.0)]);
    accepted.segmenter = MockSegmenter::new(MaskBehavior::Coverage(0.89));
    let result = accepted.pipeline().analyze_image(&image).await?;
    assert_eq!(result.outcome, PipelineOutcome::Success);
    assert_eq!(result.detected_foods[0].mask_pixels, 8900);
    // screen-ratio estimate anchored at 25 % = 350 g
    assert!((result.detected_foods[0].estimated_weight_g - 350.0 * 0.89 / 0.25).abs() < 1e-6);
    assert_eq!(result.note, NOTE_NO_REFERENCE);
    assert!(result.pixel_to_cm_ratio.is_none());

    let mut strict = Scenario::new(vec![object("pasta", 0.0, 0.0, 100.0, 100.0)]);
    strict.segmenter = MockSegmenter::new(MaskBehavior::Coverage(0.89));
    strict.config.mask_rejection_threshold = 0.5;
    let result = strict.pipeline().analyze_image(&image).await?;
    assert!(result.detected_foods.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_totals_equal_sum_of_items() -> Result<()> {
    let mut scenario = Scenario::new(vec![
        object("plate", 0.0, 0.0, 600.0, 600.0),
        object("rice", 20.0, 20.0, 120.0, 120.0),
        object("chicken", 200.0, 200.0, 260.0, 280.0),
        object("broccoli", 300.0, 50.0, 380.0, 90.0),
    ]);
    scenario.depth = MockDepthEstimator::new();
    scenario.classifier = MockClassifier::scripted(vec!["rice".into(), "chicken".into(), "unknown".into()]);
    scenario.nutrition = Arc::new(
        StaticNutritionTable::new()
            .with_entry("rice", NutritionFacts::new().with("calories", 130.0).with("carbs", 28.0))
            .with_entry("chicken", NutritionFacts::new().with("calories", 239.0).with("protein", 27.0))
            .with_entry("broccoli", NutritionFacts::new().with("calories", 34.0).with("vitamin_c", 89.2)),
    );

    let result = scenario.pipeline().analyze_image(&test_image(600, 600)).await?;

    assert_eq!(result.outcome, PipelineOutcome::Success);
    assert_eq!(result.detected_foods.len(), 3);
    let names: Vec<_> = result.detected_foods.iter().map(|i| i.food_name.as_str()).collect();
    // uninformative classifier output keeps the detector label
    assert_eq!(names, vec!["rice", "chicken", "broccoli"]);

    assert!((result.total_weight_g - result.items_weight_sum()).abs() < 1e-9);
    for nutrient in ["calories", "protein", "carbs", "fat", "fiber", "vitamin_c"] {
        let sum: f64 = result
            .detected_foods
            .iter()
            .map(|item| item.nutrition.get(nutrient).unwrap_or(0.0))
            .sum();
        let total = result.total_nutrition.get(nutrient).unwrap();
        assert!((total - sum).abs() < 1e-9, "{nutrient}: {total} != {sum}");
    }
    for item in &result.detected_foods {
        assert!(item.estimated_weight_g >= 0.0 && item.estimated_weight_g <= 1500.0);
        for base in NutritionFacts::BASE_NUTRIENTS {
            assert!(item.nutrition.get(base).is_some(), "{} lacks {base}", item.food_name);
        }
    }

    // depth is estimated once for the whole image
    assert_eq!(scenario.depth.history().len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_item_failure_is_isolated() -> Result<()> {
    let mut scenario = Scenario::new(vec![
        object("soup", 10.0, 10.0, 40.0, 40.0),
        object("bread", 50.0, 50.0, 90.0, 90.0),
    ]);
    scenario.segmenter = MockSegmenter::scripted(vec![MaskBehavior::Fail, MaskBehavior::FillBox]);
    let reporter = Arc::new(RecordingProgressReporter::new());

    let result = scenario
        .pipeline()
        .with_progress_reporter(reporter.clone())
        .analyze_image(&test_image(100, 100))
        .await?;

    assert_eq!(result.outcome, PipelineOutcome::Success);
    assert_eq!(result.detected_foods.len(), 1);
    assert_eq!(result.detected_foods[0].detector_label, "bread");
    assert_eq!(result.detected_foods[0].mask_pixels, 40 * 40);

    let errors = reporter.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, PipelineStage::MeasuringItems);
    assert_eq!(reporter.stages().last(), Some(&PipelineStage::Completed));
    assert_eq!(reporter.completions()[0].items, 1);
    Ok(())
}

#[tokio::test]
async fn test_detector_failure_degrades_to_empty() -> Result<()> {
    let mut scenario = Scenario::new(Vec::new());
    scenario.detector = MockDetector::new_failing();

    let result = scenario.pipeline().analyze_image(&test_image(32, 32)).await?;
    assert_eq!(result.outcome, PipelineOutcome::Empty);
    assert!(result.detected_foods.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_undecodable_bytes_are_input_errors() {
    let scenario = Scenario::new(Vec::new());
    let pipeline = scenario.pipeline();

    for bytes in [&b""[..], &b"definitely not an image"[..]] {
        let err = pipeline.run_pipeline(bytes).await.unwrap_err();
        assert!(err.is_input_error(), "unexpected error: {err}");
    }
    assert!(scenario.detector.history().is_empty());
}

#[tokio::test]
async fn test_debug_directory_artifacts() -> Result<()> {
    let temp = TempDir::new()?;
    let mut scenario = Scenario::new(vec![
        object("plate", 0.0, 0.0, 80.0, 80.0),
        object("Fried Rice", 10.0, 10.0, 50.0, 50.0),
    ]);
    scenario.depth = MockDepthEstimator::new();
    scenario.config.debug_dir = Some(temp.path().to_path_buf());

    let result = scenario.pipeline().analyze_image(&test_image(100, 100)).await?;

    let dir = std::path::PathBuf::from(result.debug_output_path.expect("debug path reported"));
    assert!(dir.starts_with(temp.path()));
    for name in [
        debug::ORIGINAL_ARTIFACT,
        debug::DETECTIONS_ARTIFACT,
        debug::DEPTH_ARTIFACT,
        debug::SEGMENTATION_ARTIFACT,
        "item_0_fried_rice_cropped.png",
    ] {
        assert!(dir.join(name).is_file(), "missing artifact {name}");
    }
    Ok(())
}

#[tokio::test]
async fn test_memory_debug_sink_overrides_directory() -> Result<()> {
    let scenario = Scenario::new(vec![object("egg", 10.0, 10.0, 30.0, 30.0)]);
    let sink = Arc::new(debug::MemoryDebugSink::new());

    let result = scenario
        .pipeline()
        .with_debug_sink(sink.clone())
        .analyze_image(&test_image(50, 50))
        .await?;

    assert!(result.debug_output_path.is_none());
    assert_eq!(
        sink.names(),
        vec![
            debug::ORIGINAL_ARTIFACT.to_string(),
            debug::DETECTIONS_ARTIFACT.to_string(),
            debug::item_crop_artifact(0, "egg"),
            debug::SEGMENTATION_ARTIFACT.to_string(),
        ]
    );
    Ok(())
}

/// Factory whose detector fails to load the first time
struct FlakyDetectorFactory {
    attempts: AtomicUsize,
}

impl ModelFactory for FlakyDetectorFactory {
    fn create_detector(&self, _key: &str, _config: &AnalysisConfig) -> nutrilens::Result<Arc<dyn ObjectDetector>> {
        if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(nutrilens::NutrilensError::model("weights not found"));
        }
        Ok(Arc::new(MockDetector::new(vec![object("toast", 5.0, 5.0, 25.0, 25.0)])))
    }

    fn create_segmenter(&self, _key: &str, _config: &AnalysisConfig) -> nutrilens::Result<Arc<dyn FoodSegmenter>> {
        Ok(Arc::new(MockSegmenter::fill_box()))
    }

    fn create_depth_estimator(
        &self,
        _key: &str,
        _config: &AnalysisConfig,
    ) -> nutrilens::Result<Arc<dyn DepthEstimator>> {
        Ok(Arc::new(MockDepthEstimator::unavailable()))
    }

    fn create_classifier(&self, _key: &str, _config: &AnalysisConfig) -> nutrilens::Result<Arc<dyn FoodClassifier>> {
        Ok(Arc::new(MockClassifier::unknown()))
    }
}

#[tokio::test]
async fn test_failed_model_load_is_retried_on_next_run() -> Result<()> {
    let factory = Arc::new(FlakyDetectorFactory {
        attempts: AtomicUsize::new(0),
    });
    let registry = Arc::new(ModelRegistry::new(AnalysisConfig::default(), factory.clone()));
    let pipeline = FoodAnalysisPipeline::new(Arc::clone(&registry), Arc::new(NoNutritionLookup));
    let image = test_image(40, 40);

    let first = pipeline.analyze_image(&image).await?;
    assert_eq!(first.outcome, PipelineOutcome::Empty);
    assert_eq!(first.model_info.models_loaded.get("detection"), Some(&false));

    let second = pipeline.analyze_image(&image).await?;
    assert_eq!(second.outcome, PipelineOutcome::Success);
    assert_eq!(second.detected_foods[0].food_name, "toast");
    assert_eq!(second.model_info.models_loaded.get("detection"), Some(&true));
    assert_eq!(factory.attempts.load(Ordering::SeqCst), 2);
    Ok(())
}
