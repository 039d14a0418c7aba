#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::unused_async)]

//! # NutriLens
//!
//! Food photo analysis: find the food items in a photo, measure how much of
//! each is on the plate, and report estimated weight and nutrition.
//!
//! The pipeline runs detection, reference calibration, segmentation, depth
//! estimation, weight estimation and nutrition lookup. Every model stage
//! degrades instead of failing the whole run: a missing depth model falls back
//! to area-only estimation, a missing reference object falls back to screen
//! coverage, and a photo with no measurable items falls back to whole-image
//! classification.
//!
//! ## Features
//!
//! - **Pluggable adapters**: detector, segmenter, depth and classifier traits with ONNX Runtime implementations
//! - **Reference calibration**: plates, bowls, cards and coins give a pixel-to-centimetre ratio
//! - **Nutrition sources**: USDA FoodData Central, static JSON tables, chained and cached
//! - **Debug artifacts**: annotated detections, depth map, crops and final overlay
//! - **CLI Integration**: optional command-line interface (enable with `cli` feature)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use nutrilens::{AnalysisConfig, FoodAnalysisPipeline};
//!
//! # #[cfg(feature = "onnx")]
//! # async fn example() -> anyhow::Result<()> {
//! let config = AnalysisConfig::builder()
//!     .models_dir("./models")
//!     .mask_rejection_threshold(0.9)
//!     .build()?;
//! let pipeline = FoodAnalysisPipeline::onnx(config)?;
//!
//! let bytes = std::fs::read("lunch.jpg")?;
//! let result = pipeline.run_pipeline(&bytes).await?;
//! for item in &result.detected_foods {
//!     println!("{}: {:.0} g", item.food_name, item.estimated_weight_g);
//! }
//! println!("{}", result.note);
//! # Ok(())
//! # }
//! ```
//!
//! ## Custom adapters
//!
//! Anything implementing the [`inference`] traits can be plugged in through a
//! [`registry::ModelSet`]:
//!
//! ```rust
//! use nutrilens::backends::test_utils::{MockClassifier, MockDepthEstimator, MockDetector, MockSegmenter};
//! use nutrilens::nutrition::NoNutritionLookup;
//! use nutrilens::registry::{ModelRegistry, ModelSet};
//! use nutrilens::{AnalysisConfig, FoodAnalysisPipeline};
//! use std::sync::Arc;
//!
//! let models = ModelSet {
//!     detector: Arc::new(MockDetector::empty()),
//!     segmenter: Arc::new(MockSegmenter::fill_box()),
//!     depth: Arc::new(MockDepthEstimator::unavailable()),
//!     classifier: Arc::new(MockClassifier::unknown()),
//! };
//! let registry = Arc::new(ModelRegistry::preloaded(AnalysisConfig::default(), models));
//! let pipeline = FoodAnalysisPipeline::new(registry, Arc::new(NoNutritionLookup));
//! ```
//!
//! ### Feature Flags
//!
//! - `onnx` (default): ONNX Runtime adapters with CUDA and `CoreML` execution providers
//! - `cli` (default): Command-line interface and tracing subscriber setup
//! - `webp-support` (default): WebP image format support
//! - `tracing-json`, `tracing-files`: extra log output formats for the CLI

pub mod backends;
pub mod calibration;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod error;
pub mod estimation;
pub mod imaging;
pub mod inference;
pub mod nutrition;
pub mod pipeline;
pub mod registry;
pub mod services;
pub mod tracing_config;
pub mod types;
pub mod utils;

// Public API exports
pub use config::{AnalysisConfig, AnalysisConfigBuilder, ExecutionProvider, ModelSelection, NutritionConfig};
pub use error::{NutrilensError, Result};
pub use inference::{DepthEstimator, FoodClassifier, FoodSegmenter, ObjectDetector};
pub use nutrition::{NutritionLookup, StaticNutritionTable, UsdaNutritionClient};
pub use pipeline::FoodAnalysisPipeline;
pub use registry::{available_models, ModelFactory, ModelKind, ModelRegistry, ModelSet};
pub use services::{ImageIOService, ProgressReporter};
pub use types::{
    BoundingBox, CalibrationResult, DepthMap, DetectedObject, EstimationMethod, FallbackSuggestion,
    FoodItemMeasurement, FoodMask, ModelInfo, NutritionFacts, PipelineOutcome, PipelineResult,
    PipelineStage, WeightEstimate,
};

#[cfg(feature = "cli")]
pub use tracing_config::{init_cli_tracing, TracingConfig, TracingFormat, TracingOutput};
