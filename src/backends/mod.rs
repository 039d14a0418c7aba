//! Model adapter implementations
//!
//! - ONNX Runtime adapters for every capability (feature `onnx`)
//! - Mock adapters for tests and for hosts that inject their own models

#[cfg(feature = "onnx")]
pub mod onnx;

// Mock adapters, public so integration tests and downstream crates can use them
pub mod test_utils;

#[cfg(feature = "onnx")]
pub use self::onnx::{OnnxDepthEstimator, OnnxFoodClassifier, OnnxObjectDetector, OnnxSamSegmenter};
