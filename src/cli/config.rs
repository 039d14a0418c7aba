//! Configuration conversion utilities for CLI arguments

use crate::cli::main_impl::Cli;
use crate::config::AnalysisConfig;
use anyhow::{Context, Result};

/// Convert CLI arguments to an `AnalysisConfig`
pub(crate) struct CliConfigBuilder;

impl CliConfigBuilder {
    /// Start from `--config` (or defaults) and apply every flag that was given
    pub(crate) fn from_cli(cli: &Cli) -> Result<AnalysisConfig> {
        let mut config = match &cli.config {
            Some(path) => AnalysisConfig::from_json_file(path)
                .with_context(|| format!("Failed to load configuration {}", path.display()))?,
            None => AnalysisConfig::default(),
        };

        if let Some(dir) = &cli.models_dir {
            config.models_dir = dir.clone();
        }
        if let Some(key) = &cli.detector {
            config.models.detection = key.clone();
        }
        if let Some(key) = &cli.segmenter {
            config.models.segmentation = key.clone();
        }
        if let Some(key) = &cli.depth {
            config.models.depth = key.clone();
        }
        if let Some(key) = &cli.classifier {
            config.models.classification = key.clone();
        }
        if let Some(provider) = cli.parsed_execution_provider()? {
            config.execution_provider = provider;
        }
        if let Some(threshold) = cli.mask_threshold {
            config.mask_rejection_threshold = threshold;
        }
        if let Some(dir) = &cli.debug_dir {
            config.debug_dir = Some(dir.clone());
        }

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }

    /// Checks that do not depend on the loaded configuration
    pub(crate) fn validate_cli(cli: &Cli) -> Result<()> {
        if cli.jobs == 0 {
            anyhow::bail!("--jobs must be at least 1");
        }
        if let Some(threshold) = cli.mask_threshold {
            if !(threshold > 0.0 && threshold <= 1.0) {
                anyhow::bail!("--mask-threshold must be in (0, 1], got {threshold}");
            }
        }
        if let Some(path) = &cli.nutrition_table {
            if !path.is_file() {
                anyhow::bail!("Nutrition table not found: {}", path.display());
            }
        }
        if cli.benchmark && cli.debug_dir.is_some() {
            log::warn!("--debug-dir has no effect together with --benchmark");
        }
        Ok(())
    }
}
