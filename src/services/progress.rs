//! Progress reporting service
//!
//! This module separates progress reporting concerns from the pipeline,
//! allowing different frontends to implement their own progress handling.

use crate::types::{PipelineOutcome, PipelineStage};
use instant::Instant;

/// Progress update containing stage and timing information
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub stage: PipelineStage,
    /// Progress percentage (0-100)
    pub progress: u8,
    /// Human-readable stage description
    pub description: String,
    /// Elapsed time since the run started (milliseconds)
    pub elapsed_ms: u64,
}

impl ProgressUpdate {
    #[must_use]
    pub fn new(stage: PipelineStage, start_time: Instant) -> Self {
        Self {
            progress: (stage.progress() * 100.0).round().clamp(0.0, 100.0) as u8,
            description: stage.description().to_string(),
            elapsed_ms: start_time.elapsed().as_millis() as u64,
            stage,
        }
    }

    /// Progress update with a custom description
    #[must_use]
    pub fn with_description(stage: PipelineStage, description: String, start_time: Instant) -> Self {
        Self {
            description,
            ..Self::new(stage, start_time)
        }
    }
}

/// Summary handed to [`ProgressReporter::report_completion`]
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionSummary {
    pub outcome: PipelineOutcome,
    pub items: usize,
    pub total_weight_g: f64,
    pub processing_time_ms: u64,
}

/// Trait for reporting progress during food analysis
pub trait ProgressReporter: Send + Sync {
    fn report_progress(&self, update: ProgressUpdate);

    fn report_completion(&self, summary: &CompletionSummary);

    /// Report a recovered stage failure
    ///
    /// # Arguments
    /// * `stage` - Stage where the error occurred
    /// * `error` - Error description
    fn report_error(&self, stage: PipelineStage, error: &str);
}

/// No-op progress reporter that discards all progress updates
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpProgressReporter;

impl ProgressReporter for NoOpProgressReporter {
    fn report_progress(&self, _update: ProgressUpdate) {}

    fn report_completion(&self, _summary: &CompletionSummary) {}

    fn report_error(&self, _stage: PipelineStage, _error: &str) {}
}

/// Console progress reporter that logs progress through `log`
#[derive(Debug, Clone, Copy)]
pub struct ConsoleProgressReporter {
    verbose: bool,
}

impl ConsoleProgressReporter {
    /// # Arguments
    /// * `verbose` - Whether to show elapsed times
    #[must_use]
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl ProgressReporter for ConsoleProgressReporter {
    fn report_progress(&self, update: ProgressUpdate) {
        if self.verbose {
            log::info!(
                "[{}%] {} ({}ms elapsed)",
                update.progress,
                update.description,
                update.elapsed_ms
            );
        } else {
            log::info!("[{}%] {}", update.progress, update.description);
        }
    }

    fn report_completion(&self, summary: &CompletionSummary) {
        log::info!(
            "Analysis finished in {}ms: {:?}, {} item(s), {:.1} g",
            summary.processing_time_ms,
            summary.outcome,
            summary.items,
            summary.total_weight_g
        );
    }

    fn report_error(&self, stage: PipelineStage, error: &str) {
        log::warn!("Recovered error during {}: {}", stage.description(), error);
    }
}

/// Reporter that records every stage it sees, for tests
#[derive(Debug, Default)]
pub struct RecordingProgressReporter {
    stages: std::sync::Mutex<Vec<PipelineStage>>,
    errors: std::sync::Mutex<Vec<(PipelineStage, String)>>,
    completions: std::sync::Mutex<Vec<CompletionSummary>>,
}

impl RecordingProgressReporter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn stages(&self) -> Vec<PipelineStage> {
        self.stages.lock().map(|s| s.clone()).unwrap_or_default()
    }

    #[must_use]
    pub fn errors(&self) -> Vec<(PipelineStage, String)> {
        self.errors.lock().map(|e| e.clone()).unwrap_or_default()
    }

    #[must_use]
    pub fn completions(&self) -> Vec<CompletionSummary> {
        self.completions.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl ProgressReporter for RecordingProgressReporter {
    fn report_progress(&self, update: ProgressUpdate) {
        if let Ok(mut stages) = self.stages.lock() {
            stages.push(update.stage);
        }
    }

    fn report_completion(&self, summary: &CompletionSummary) {
        if let Ok(mut completions) = self.completions.lock() {
            completions.push(summary.clone());
        }
    }

    fn report_error(&self, stage: PipelineStage, error: &str) {
        if let Ok(mut errors) = self.errors.lock() {
            errors.push((stage, error.to_string()));
        }
    }
}
