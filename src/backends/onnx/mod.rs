//! ONNX Runtime model adapters
//!
//! One [`OnnxSession`] per model file. Sessions need `&mut` access to run, so
//! each is kept behind a mutex; adapters are therefore `Sync` and can be
//! shared by concurrent pipeline runs.

mod classifier;
mod depth;
mod detector;
mod segmenter;

pub use classifier::OnnxFoodClassifier;
pub use depth::OnnxDepthEstimator;
pub use detector::OnnxObjectDetector;
pub use segmenter::OnnxSamSegmenter;

use crate::config::ExecutionProvider;
use crate::error::{NutrilensError, Result};
use ndarray::ArrayD;
use ort::execution_providers::{
    CUDAExecutionProvider, CoreMLExecutionProvider, ExecutionProvider as OrtExecutionProvider,
};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::DynValue;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// A loaded ONNX Runtime session
pub struct OnnxSession {
    session: Mutex<Session>,
    path: PathBuf,
    input_names: Vec<String>,
}

impl std::fmt::Debug for OnnxSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxSession")
            .field("path", &self.path)
            .field("input_names", &self.input_names)
            .finish_non_exhaustive()
    }
}

impl OnnxSession {
    /// Load a model file with the requested execution provider.
    ///
    /// Hardware providers that are not available fall back to CPU with a warning.
    ///
    /// # Errors
    /// - Model file missing
    /// - ONNX Runtime session creation failures
    pub fn load(path: &Path, provider: ExecutionProvider, intra_threads: usize) -> Result<Self> {
        if !path.exists() {
            return Err(NutrilensError::model_error_with_context(
                "load",
                path,
                "file not found",
                &["check --models-dir", "set NUTRILENS_MODELS_DIR"],
            ));
        }

        let mut builder = Session::builder()
            .map_err(|e| NutrilensError::model(format!("Failed to create session builder: {e}")))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| NutrilensError::model(format!("Failed to set optimization level: {e}")))?;

        let mut providers = Vec::new();
        if matches!(provider, ExecutionProvider::Auto | ExecutionProvider::Cuda) {
            let cuda = CUDAExecutionProvider::default();
            if OrtExecutionProvider::is_available(&cuda).unwrap_or(false) {
                log::info!("Using CUDA execution provider for {}", path.display());
                providers.push(cuda.build());
            } else if provider == ExecutionProvider::Cuda {
                log::warn!("CUDA execution provider requested but not available, falling back to CPU");
            }
        }
        if matches!(provider, ExecutionProvider::Auto | ExecutionProvider::CoreMl) {
            let coreml = CoreMLExecutionProvider::default();
            if OrtExecutionProvider::is_available(&coreml).unwrap_or(false) {
                log::info!("Using CoreML execution provider for {}", path.display());
                providers.push(CoreMLExecutionProvider::default().with_subgraphs(true).build());
            } else if provider == ExecutionProvider::CoreMl {
                log::warn!("CoreML execution provider requested but not available, falling back to CPU");
            }
        }
        if !providers.is_empty() {
            builder = builder
                .with_execution_providers(providers)
                .map_err(|e| NutrilensError::model(format!("Failed to set execution providers: {e}")))?;
        }

        let intra_threads = if intra_threads > 0 {
            intra_threads
        } else {
            std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(4)
        };

        let session = builder
            .with_intra_threads(intra_threads)
            .map_err(|e| NutrilensError::model(format!("Failed to set intra threads: {e}")))?
            .commit_from_file(path)
            .map_err(|e| {
                NutrilensError::model_error_with_context("load", path, &e.to_string(), &[])
            })?;

        let input_names = session.inputs.iter().map(|input| input.name.clone()).collect();
        log::debug!("Loaded ONNX model {} with inputs {:?}", path.display(), input_names);

        Ok(Self {
            session: Mutex::new(session),
            path: path.to_path_buf(),
            input_names,
        })
    }

    /// Names of the model inputs, in declaration order
    #[must_use]
    pub fn input_names(&self) -> &[String] {
        &self.input_names
    }

    /// Name of the first input, or `fallback` for models that report none
    #[must_use]
    pub fn first_input_name<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.input_names.first().map_or(fallback, String::as_str)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` with exclusive access to the session
    ///
    /// # Errors
    /// - Poisoned session lock
    /// - Whatever `f` returns
    pub fn with_session<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Session) -> Result<T>,
    {
        let mut session = self
            .session
            .lock()
            .map_err(|_| NutrilensError::internal(format!("Session lock poisoned for {}", self.path.display())))?;
        f(&mut session)
    }
}

/// Copy an output value into an owned `f32` array
pub(crate) fn extract_f32(value: &DynValue) -> Result<ArrayD<f32>> {
    let view = value
        .try_extract_array::<f32>()
        .map_err(|e| NutrilensError::inference(format!("Failed to extract output tensor: {e}")))?;
    Ok(view.to_owned())
}

/// Convert an inference error
pub(crate) fn run_error(model: &str, e: &ort::Error) -> NutrilensError {
    NutrilensError::inference(format!("{model} inference failed: {e}"))
}
