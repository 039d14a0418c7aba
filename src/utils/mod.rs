//! Tensor conversion helpers shared by the ONNX adapters

pub mod postprocessing;
pub mod preprocessing;
