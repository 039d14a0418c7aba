//! Food analysis pipeline
//!
//! `FoodAnalysisPipeline` drives one photo through
//! detect → calibrate → depth → per-item measurement → aggregation, with a
//! whole-image classification fallback when no item survives. Every model or
//! collaborator failure is recovered inside the stage that produced it; only
//! undecodable input makes [`FoodAnalysisPipeline::run_pipeline`] fail.

use crate::calibration::{calibrate_with_threshold, is_reference_label};
use crate::config::AnalysisConfig;
use crate::error::{NutrilensError, Result};
use crate::estimation::WeightEstimator;
use crate::imaging::{annotate_detections, crop_to_mask, depth_visualization, segmentation_overlay};
use crate::inference::is_uninformative_label;
use crate::nutrition::NutritionLookup;
use crate::registry::ModelRegistry;
use crate::services::debug::{
    item_crop_artifact, DEPTH_ARTIFACT, DETECTIONS_ARTIFACT, ORIGINAL_ARTIFACT, SEGMENTATION_ARTIFACT,
};
use crate::services::{
    CompletionSummary, DebugImage, DebugSink, DirectoryDebugSink, ImageIOService, NoOpDebugSink,
    NoOpProgressReporter, ProgressReporter, ProgressUpdate,
};
use crate::types::{
    CalibrationResult, DepthMap, DetectedObject, FallbackSuggestion, FoodItemMeasurement, FoodMask,
    NutritionFacts, PipelineOutcome, PipelineResult, PipelineStage,
};
use image::{DynamicImage, RgbImage};
use instant::Instant;
use std::sync::Arc;
use tracing::{debug, info, instrument, span, warn, Instrument, Level};

pub const NOTE_NO_OBJECTS: &str = "No object detected";
pub const NOTE_DETECTION_FAILED: &str = "Object detection unavailable, no object detected";
pub const NOTE_NO_FOOD: &str = "Could not identify any food item, please search manually";
pub const NOTE_NO_REFERENCE: &str = "No reliable reference object found, weights estimated from screen coverage";

/// Run a blocking model call on the blocking thread pool
async fn run_blocking<T, F>(what: &'static str, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| NutrilensError::internal(format!("{what} task failed: {e}")))?
}

/// Why an item produced no measurement
#[derive(Debug)]
enum ItemRejection {
    NoMask,
    TooLarge(f64),
}

/// Per-request state shared by the stages
struct RunContext {
    image: Arc<RgbImage>,
    image_area_px: u64,
    start: Instant,
    sink: Arc<dyn DebugSink>,
}

/// End-to-end food photo analysis
pub struct FoodAnalysisPipeline {
    registry: Arc<ModelRegistry>,
    nutrition: Arc<dyn NutritionLookup>,
    estimator: WeightEstimator,
    progress: Arc<dyn ProgressReporter>,
    debug_sink: Option<Arc<dyn DebugSink>>,
}

impl std::fmt::Debug for FoodAnalysisPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FoodAnalysisPipeline")
            .field("registry", &self.registry)
            .field("estimator", &self.estimator)
            .finish_non_exhaustive()
    }
}

impl FoodAnalysisPipeline {
    /// Pipeline over `registry`'s models and configuration
    #[must_use]
    pub fn new(registry: Arc<ModelRegistry>, nutrition: Arc<dyn NutritionLookup>) -> Self {
        let estimator = WeightEstimator::new(registry.config().max_item_weight_g);
        Self {
            registry,
            nutrition,
            estimator,
            progress: Arc::new(NoOpProgressReporter),
            debug_sink: None,
        }
    }

    /// ONNX models from `config.models_dir` and a cached USDA client
    ///
    /// # Errors
    /// - Invalid configuration
    /// - HTTP client construction failures
    #[cfg(feature = "onnx")]
    pub fn onnx(config: AnalysisConfig) -> Result<Self> {
        use crate::nutrition::{CachedNutritionLookup, UsdaNutritionClient};

        config.validate()?;
        let usda = UsdaNutritionClient::new(config.nutrition.clone())?;
        let registry = Arc::new(ModelRegistry::onnx(config));
        Ok(Self::new(registry, Arc::new(CachedNutritionLookup::new(usda))))
    }

    #[must_use]
    pub fn with_progress_reporter(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Send debug artifacts to `sink` instead of the configured `debug_dir`
    #[must_use]
    pub fn with_debug_sink(mut self, sink: Arc<dyn DebugSink>) -> Self {
        self.debug_sink = Some(sink);
        self
    }

    #[must_use]
    pub fn config(&self) -> &AnalysisConfig {
        self.registry.config()
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// Analyse an encoded photo
    ///
    /// # Errors
    /// - Empty, undecodable or zero-sized image data
    pub async fn run_pipeline(&self, image_bytes: &[u8]) -> Result<PipelineResult> {
        let start = Instant::now();
        self.report(PipelineStage::Decoding, start);
        let image = ImageIOService::decode_bytes(image_bytes)?;
        self.analyze(&image, start).await
    }

    /// Analyse an already decoded photo
    ///
    /// # Errors
    /// - Zero-sized image
    pub async fn analyze_image(&self, image: &DynamicImage) -> Result<PipelineResult> {
        self.analyze(image, Instant::now()).await
    }

    fn report(&self, stage: PipelineStage, start: Instant) {
        self.progress.report_progress(ProgressUpdate::new(stage, start));
    }

    fn debug_sink_for_run(&self) -> Arc<dyn DebugSink> {
        if let Some(sink) = &self.debug_sink {
            return Arc::clone(sink);
        }
        match &self.config().debug_dir {
            Some(root) => match DirectoryDebugSink::create(root) {
                Ok(sink) => Arc::new(sink),
                Err(e) => {
                    warn!(root = %root.display(), error = %e, "Debug output disabled");
                    Arc::new(NoOpDebugSink)
                },
            },
            None => Arc::new(NoOpDebugSink),
        }
    }

    #[instrument(skip_all, fields(width = image.width(), height = image.height()))]
    async fn analyze(&self, image: &DynamicImage, start: Instant) -> Result<PipelineResult> {
        if image.width() == 0 || image.height() == 0 {
            return Err(NutrilensError::invalid_input(format!(
                "Image has zero size ({}x{})",
                image.width(),
                image.height()
            )));
        }

        let rgb = Arc::new(image.to_rgb8());
        let ctx = RunContext {
            image_area_px: u64::from(rgb.width()) * u64::from(rgb.height()),
            image: rgb,
            start,
            sink: self.debug_sink_for_run(),
        };
        if ctx.sink.is_enabled() {
            ctx.sink.record(ORIGINAL_ARTIFACT, DebugImage::Rgb((*ctx.image).clone()));
        }

        // DETECTING
        self.report(PipelineStage::Detecting, start);
        let objects = match self.detect(&ctx).await {
            Ok(objects) => objects,
            Err(e) => {
                warn!(error = %e, "Detection failed");
                self.progress.report_error(PipelineStage::Detecting, &e.to_string());
                let result = PipelineResult::empty(NOTE_DETECTION_FAILED, PipelineOutcome::Empty, self.registry.model_info());
                return Ok(self.finish(result, &ctx));
            },
        };
        if ctx.sink.is_enabled() {
            ctx.sink.record(
                DETECTIONS_ARTIFACT,
                DebugImage::Rgb(annotate_detections(&ctx.image, &objects)),
            );
        }
        if objects.is_empty() {
            info!("No object detected");
            let result = PipelineResult::empty(NOTE_NO_OBJECTS, PipelineOutcome::Empty, self.registry.model_info());
            return Ok(self.finish(result, &ctx));
        }

        // CALIBRATING
        self.report(PipelineStage::Calibrating, start);
        let calibration = {
            let _span = span!(Level::INFO, "calibrate", objects = objects.len()).entered();
            calibrate_with_threshold(&objects, ctx.image_area_px, self.config().reference_min_area_fraction)
        };

        let food_objects: Vec<&DetectedObject> =
            objects.iter().filter(|obj| !is_reference_label(&obj.label)).collect();
        debug!(food_objects = food_objects.len(), "Food candidates");

        // Depth once per image, only when there is something to measure
        let depth = if food_objects.is_empty() {
            None
        } else {
            self.report(PipelineStage::EstimatingDepth, start);
            self.depth(&ctx).await
        };
        if let (Some(depth), true) = (&depth, ctx.sink.is_enabled()) {
            ctx.sink.record(DEPTH_ARTIFACT, DebugImage::Gray(depth_visualization(depth)));
        }

        // MEASURING_ITEMS
        let mut items = Vec::with_capacity(food_objects.len());
        for (index, object) in food_objects.iter().enumerate() {
            self.progress.report_progress(ProgressUpdate::with_description(
                PipelineStage::MeasuringItems,
                format!("Measuring item {}/{} ({})", index + 1, food_objects.len(), object.label),
                start,
            ));
            match self
                .measure_item(index, object, &calibration, depth.as_ref(), &ctx)
                .await
            {
                Ok(Ok(item)) => items.push(item),
                Ok(Err(ItemRejection::NoMask)) => {
                    debug!(label = %object.label, "No mask for item, skipping");
                },
                Ok(Err(ItemRejection::TooLarge(coverage))) => {
                    debug!(label = %object.label, coverage, "Mask too large, skipping");
                },
                Err(e) => {
                    warn!(label = %object.label, error = %e, "Item measurement failed, skipping");
                    self.progress.report_error(PipelineStage::MeasuringItems, &e.to_string());
                },
            }
        }

        if items.is_empty() {
            // FALLBACK_CLASSIFY
            self.report(PipelineStage::FallbackClassify, start);
            let result = match self.fallback_classify(image).await {
                Some(food_name) => {
                    info!(food = %food_name, "Fallback classification suggestion");
                    let mut result = PipelineResult::empty(
                        format!(
                            "Weight estimation failed, but the image looks like '{food_name}'. Please enter the weight manually"
                        ),
                        PipelineOutcome::FallbackClassify,
                        self.registry.model_info(),
                    );
                    result.fallback_suggestion = Some(FallbackSuggestion { food_name });
                    result
                },
                None => PipelineResult::empty(NOTE_NO_FOOD, PipelineOutcome::Empty, self.registry.model_info()),
            };
            return Ok(self.finish(result, &ctx));
        }

        if ctx.sink.is_enabled() {
            let masks: Vec<&FoodMask> = items.iter().filter_map(|item| item.mask.as_ref()).collect();
            ctx.sink.record(
                SEGMENTATION_ARTIFACT,
                DebugImage::Rgb(segmentation_overlay(&ctx.image, &masks)),
            );
        }

        let mut total_nutrition = NutritionFacts::zeroed();
        let mut total_weight_g = 0.0;
        for item in &items {
            total_weight_g += item.estimated_weight_g;
            total_nutrition.accumulate(&item.nutrition);
        }

        let result = PipelineResult {
            note: calibration_note(&calibration, items.len()),
            detected_foods: items,
            total_weight_g,
            total_nutrition,
            reference_object: calibration.reference_label.clone(),
            pixel_to_cm_ratio: calibration.pixel_to_cm_ratio,
            outcome: PipelineOutcome::Success,
            fallback_suggestion: None,
            model_info: self.registry.model_info(),
            processing_time_ms: 0,
            debug_output_path: None,
        };
        Ok(self.finish(result, &ctx))
    }

    fn finish(&self, mut result: PipelineResult, ctx: &RunContext) -> PipelineResult {
        result.processing_time_ms = ctx.start.elapsed().as_millis() as u64;
        result.debug_output_path = ctx
            .sink
            .output_path()
            .map(|path| path.display().to_string());

        self.report(PipelineStage::Completed, ctx.start);
        self.progress.report_completion(&CompletionSummary {
            outcome: result.outcome,
            items: result.detected_foods.len(),
            total_weight_g: result.total_weight_g,
            processing_time_ms: result.processing_time_ms,
        });
        info!(
            outcome = ?result.outcome,
            items = result.detected_foods.len(),
            total_weight_g = result.total_weight_g,
            processing_time_ms = result.processing_time_ms,
            "Analysis finished"
        );
        result
    }

    async fn detect(&self, ctx: &RunContext) -> Result<Vec<DetectedObject>> {
        let span = span!(Level::INFO, "detect");
        async {
            let detector = self.registry.detector().await?;
            let image = Arc::clone(&ctx.image);
            let objects = run_blocking("detection", move || detector.detect(&image)).await?;
            info!(count = objects.len(), "Objects detected");
            Ok(objects)
        }
        .instrument(span)
        .await
    }

    /// Depth map for the whole image; any failure means "no depth"
    async fn depth(&self, ctx: &RunContext) -> Option<DepthMap> {
        let span = span!(Level::INFO, "depth");
        let result: Result<Option<DepthMap>> = async {
            let estimator = self.registry.depth_estimator().await?;
            let image = Arc::clone(&ctx.image);
            run_blocking("depth estimation", move || estimator.estimate_depth(&image)).await
        }
        .instrument(span)
        .await;

        match result {
            Ok(depth) => depth,
            Err(e) => {
                warn!(error = %e, "Depth estimation failed, using static shape factor");
                self.progress.report_error(PipelineStage::EstimatingDepth, &e.to_string());
                None
            },
        }
    }

    /// Classifier label, `None` when the classifier fails or is uncertain
    async fn classify(&self, image: DynamicImage) -> Option<String> {
        let result: Result<String> = async {
            let classifier = self.registry.classifier().await?;
            run_blocking("classification", move || classifier.classify(&image)).await
        }
        .await;

        match result {
            Ok(label) if !is_uninformative_label(&label) => Some(label.trim().to_string()),
            Ok(label) => {
                debug!(label = %label, "Uninformative classification");
                None
            },
            Err(e) => {
                warn!(error = %e, "Classification failed");
                None
            },
        }
    }

    /// Segment, crop, classify, weigh and look up one detection.
    ///
    /// The outer `Err` is a failure that drops the item; the inner `Err` is an
    /// expected rejection.
    #[instrument(name = "measure_item", skip_all, fields(index = index, label = %object.label))]
    async fn measure_item(
        &self,
        index: usize,
        object: &DetectedObject,
        calibration: &CalibrationResult,
        depth: Option<&DepthMap>,
        ctx: &RunContext,
    ) -> Result<std::result::Result<FoodItemMeasurement, ItemRejection>> {
        let segmenter = self.registry.segmenter().await?;
        let image = Arc::clone(&ctx.image);
        let bbox = object.bounding_box;
        let masks = run_blocking("segmentation", move || segmenter.segment(&image, &bbox)).await?;

        // largest candidate, first on ties
        let mut best: Option<FoodMask> = None;
        let mut best_pixels = 0;
        for mask in masks {
            let pixels = mask.pixel_count();
            if best.is_none() || pixels > best_pixels {
                best_pixels = pixels;
                best = Some(mask);
            }
        }
        let Some(mask) = best.filter(|_| best_pixels > 0) else {
            return Ok(Err(ItemRejection::NoMask));
        };
        if mask.dimensions != ctx.image.dimensions() {
            return Err(NutrilensError::processing(format!(
                "Mask {:?} does not match image {:?}",
                mask.dimensions,
                ctx.image.dimensions()
            )));
        }

        let coverage = mask.coverage(ctx.image_area_px);
        if coverage > self.config().mask_rejection_threshold {
            warn!(
                coverage_percent = coverage * 100.0,
                "Rejected suspiciously large mask"
            );
            return Ok(Err(ItemRejection::TooLarge(coverage)));
        }

        let crop = crop_to_mask(&ctx.image, &mask)?;
        if ctx.sink.is_enabled() {
            ctx.sink.record(&item_crop_artifact(index, &object.label), DebugImage::Rgba(crop.clone()));
        }

        let food_name = match self.classify(DynamicImage::ImageRgba8(crop)).await {
            Some(label) => label,
            None => {
                debug!("Keeping detector label");
                object.label.clone()
            },
        };

        let estimate = self.estimator.estimate(
            &mask,
            &food_name,
            calibration.pixel_to_cm_ratio,
            depth,
            Some(ctx.image_area_px),
        );

        let per_100g = match self.nutrition.lookup(&food_name).await {
            Some(facts) => facts,
            None => {
                debug!(food = %food_name, "No nutrition data, using zeros");
                NutritionFacts::zeroed()
            },
        };
        let mut nutrition = NutritionFacts::zeroed();
        nutrition.accumulate(&per_100g.scaled(estimate.weight_g / 100.0));

        info!(
            food = %food_name,
            weight_g = estimate.weight_g,
            confidence = estimate.confidence,
            method = ?estimate.method,
            "Item measured"
        );

        Ok(Ok(FoodItemMeasurement {
            food_name,
            detector_label: object.label.clone(),
            bounding_box: object.bounding_box,
            mask_pixels: best_pixels,
            mask: Some(mask),
            estimated_weight_g: estimate.weight_g,
            confidence: estimate.confidence,
            error_fraction: estimate.error_fraction,
            nutrition,
        }))
    }

    #[instrument(name = "fallback_classify", skip_all)]
    async fn fallback_classify(&self, image: &DynamicImage) -> Option<String> {
        self.classify(image.clone()).await
    }
}

/// Note describing how trustworthy the weights are
fn calibration_note(calibration: &CalibrationResult, items: usize) -> String {
    match (&calibration.reference_label, calibration.pixel_to_cm_ratio) {
        (Some(reference), Some(_)) => {
            format!("Used '{reference}' as reference, measured {items} item(s) with high confidence")
        },
        _ if !calibration.candidate_labels.is_empty() => {
            let mut labels = calibration.candidate_labels.clone();
            labels.sort();
            labels.dedup();
            format!(
                "Reference candidates {labels:?} too small for calibration, weights estimated from screen coverage"
            )
        },
        _ => NOTE_NO_REFERENCE.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::test_utils::{
        MaskBehavior, MockClassifier, MockDepthEstimator, MockDetector, MockSegmenter,
    };
    use crate::nutrition::NoNutritionLookup;
    use crate::registry::ModelSet;
    use crate::services::RecordingProgressReporter;
    use crate::types::BoundingBox;

    fn pipeline(detector: MockDetector, segmenter: MockSegmenter, classifier: MockClassifier) -> FoodAnalysisPipeline {
        let models = ModelSet {
            detector: Arc::new(detector),
            segmenter: Arc::new(segmenter),
            depth: Arc::new(MockDepthEstimator::unavailable()),
            classifier: Arc::new(classifier),
        };
        let registry = ModelRegistry::preloaded(AnalysisConfig::default(), models);
        FoodAnalysisPipeline::new(Arc::new(registry), Arc::new(NoNutritionLookup))
    }

    fn food(x1: f32, y1: f32, x2: f32, y2: f32) -> DetectedObject {
        DetectedObject::new("food", BoundingBox::new(x1, y1, x2, y2), 0.8)
    }

    #[test]
    fn test_calibration_notes() {
        let calibrated = CalibrationResult {
            pixel_to_cm_ratio: Some(0.1),
            reference_label: Some("plate".to_string()),
            candidate_labels: vec!["plate".to_string()],
        };
        assert!(calibration_note(&calibrated, 2).contains("'plate'"));

        let too_small = CalibrationResult {
            candidate_labels: vec!["coin".to_string(), "coin".to_string()],
            ..CalibrationResult::default()
        };
        let note = calibration_note(&too_small, 1);
        assert!(note.contains("too small"));
        assert!(note.contains("[\"coin\"]"));

        assert_eq!(calibration_note(&CalibrationResult::default(), 1), NOTE_NO_REFERENCE);
    }

    #[tokio::test]
    async fn test_zero_sized_image_is_input_error() {
        let pipeline = pipeline(MockDetector::empty(), MockSegmenter::fill_box(), MockClassifier::unknown());
        let err = pipeline.analyze_image(&DynamicImage::new_rgb8(0, 0)).await.unwrap_err();
        assert!(matches!(err, NutrilensError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_detection_failure_is_recovered() {
        let reporter = Arc::new(RecordingProgressReporter::new());
        let pipeline = pipeline(MockDetector::new_failing(), MockSegmenter::fill_box(), MockClassifier::unknown())
            .with_progress_reporter(reporter.clone());

        let result = pipeline.analyze_image(&DynamicImage::new_rgb8(32, 32)).await.unwrap();
        assert_eq!(result.outcome, PipelineOutcome::Empty);
        assert_eq!(result.note, NOTE_DETECTION_FAILED);
        assert_eq!(reporter.errors()[0].0, PipelineStage::Detecting);
        assert_eq!(reporter.stages().last(), Some(&PipelineStage::Completed));
    }

    #[tokio::test]
    async fn test_item_reports_mask_pixels() {
        let pipeline = pipeline(
            MockDetector::new(vec![food(0.0, 0.0, 10.0, 10.0)]),
            MockSegmenter::scripted(vec![MaskBehavior::FillBox]),
            MockClassifier::new("Rice"),
        );
        let result = pipeline.analyze_image(&DynamicImage::new_rgb8(100, 100)).await.unwrap();
        assert_eq!(result.detected_foods[0].mask_pixels, 100);
    }

    #[tokio::test]
    async fn test_uncertain_classifier_keeps_detector_label() {
        let pipeline = pipeline(
            MockDetector::new(vec![DetectedObject::new("sandwich", BoundingBox::new(0.0, 0.0, 10.0, 10.0), 0.7)]),
            MockSegmenter::fill_box(),
            MockClassifier::unknown(),
        );
        let result = pipeline.analyze_image(&DynamicImage::new_rgb8(100, 100)).await.unwrap();
        assert_eq!(result.outcome, PipelineOutcome::Success);
        assert_eq!(result.detected_foods[0].food_name, "sandwich");
        assert_eq!(result.note, NOTE_NO_REFERENCE);
    }

    #[tokio::test]
    async fn test_reference_only_detections_go_to_fallback() {
        let plate = DetectedObject::new("plate", BoundingBox::new(0.0, 0.0, 50.0, 50.0), 0.9);
        let segmenter = MockSegmenter::fill_box();
        let history = segmenter.history();
        let pipeline = pipeline(MockDetector::new(vec![plate]), segmenter, MockClassifier::new("Pizza"));

        let result = pipeline.analyze_image(&DynamicImage::new_rgb8(100, 100)).await.unwrap();
        assert!(history.is_empty());
        assert_eq!(result.outcome, PipelineOutcome::FallbackClassify);
        assert_eq!(result.fallback_suggestion.unwrap().food_name, "Pizza");
    }
}
