//! Food analysis CLI tool
//!
//! Analyses food photos and prints one JSON result per input.

use super::config::CliConfigBuilder;
use crate::{
    config::{AnalysisConfig, ExecutionProvider},
    nutrition::{
        CachedNutritionLookup, ChainedNutritionLookup, NutritionLookup, StaticNutritionTable,
        UsdaNutritionClient,
    },
    registry::{available_models, ModelRegistry},
    services::{ConsoleProgressReporter, ImageIOService},
    tracing_config::{init_cli_tracing, spans},
    FoodAnalysisPipeline, PipelineResult,
};
use anyhow::{Context, Result};
use clap::Parser;
use futures::stream::{self, StreamExt};
use log::{error, info, warn};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;

/// Food photo analysis tool
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(name = "nutrilens")]
#[allow(clippy::struct_excessive_bools)]
pub struct Cli {
    /// Image files or directories of images
    #[arg(value_name = "INPUT", required_unless_present = "list_models")]
    pub inputs: Vec<PathBuf>,

    /// Directory holding the ONNX model files
    #[arg(long, value_name = "DIR", env = "NUTRILENS_MODELS_DIR")]
    pub models_dir: Option<PathBuf>,

    /// Object detection model key
    #[arg(long)]
    pub detector: Option<String>,

    /// Segmentation model key
    #[arg(long)]
    pub segmenter: Option<String>,

    /// Depth estimation model key
    #[arg(long)]
    pub depth: Option<String>,

    /// Food classification model key
    #[arg(long)]
    pub classifier: Option<String>,

    /// Execution provider (auto, cpu, cuda, coreml)
    #[arg(short, long)]
    pub execution_provider: Option<String>,

    /// JSON file mapping food names to nutrients per 100 g
    #[arg(long, value_name = "FILE")]
    pub nutrition_table: Option<PathBuf>,

    /// Reject masks covering more than this fraction of the image
    #[arg(long)]
    pub mask_threshold: Option<f64>,

    /// JSON configuration file; flags override its values
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Write intermediate images below this directory
    #[arg(long, value_name = "DIR")]
    pub debug_dir: Option<PathBuf>,

    /// Pretty-print JSON output
    #[arg(long)]
    pub pretty: bool,

    /// Write results to this file instead of stdout
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Number of images analysed concurrently
    #[arg(short, long, default_value_t = 1)]
    pub jobs: usize,

    /// Print the model catalog and exit
    #[arg(long)]
    pub list_models: bool,

    /// Print per-stage timings instead of analysis results
    #[arg(long)]
    pub benchmark: bool,

    /// Enable verbose logging (-v: DEBUG, -vv: TRACE)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

pub async fn main() -> Result<()> {
    let cli = Cli::parse();

    let _guard = init_cli_tracing(cli.verbose).context("Failed to initialize tracing")?;

    if cli.list_models {
        let catalog = serde_json::to_string_pretty(&available_models())?;
        println!("{catalog}");
        return Ok(());
    }

    CliConfigBuilder::validate_cli(&cli).context("Invalid CLI arguments")?;
    let config = CliConfigBuilder::from_cli(&cli).context("Failed to build configuration")?;

    let files = collect_inputs(&cli.inputs)?;
    if files.is_empty() {
        anyhow::bail!("No supported images found in the provided inputs");
    }

    let session_id = uuid::Uuid::new_v4().to_string();
    let session = spans::session(&session_id, &config.execution_provider.to_string());
    let succeeded = run(&cli, config, &files).instrument(session).await?;

    if succeeded == 0 {
        anyhow::bail!("No input could be analysed");
    }
    Ok(())
}

/// Analyse (or benchmark) every file, returning how many succeeded
async fn run(cli: &Cli, config: AnalysisConfig, files: &[PathBuf]) -> Result<usize> {
    info!("Found {} image(s) to analyse", files.len());
    let start_time = Instant::now();

    let nutrition = if cli.benchmark {
        None
    } else {
        Some(build_nutrition_lookup(cli, &config)?)
    };
    let registry = Arc::new(build_registry(config));
    let mut sink = OutputSink::open(cli.output.as_deref(), cli.pretty, files.len() > 1)?;

    let succeeded = match nutrition {
        None => run_benchmarks(&registry, files, &mut sink).await?,
        Some(nutrition) => {
            let pipeline = FoodAnalysisPipeline::new(Arc::clone(&registry), nutrition)
                .with_progress_reporter(Arc::new(ConsoleProgressReporter::new(cli.verbose > 0)));
            run_analyses(&pipeline, files, cli.jobs, &mut sink)
                .instrument(spans::batch_analysis(files.len()))
                .await?
        },
    };
    sink.finish()?;

    info!(
        "Analysed {}/{} image(s) in {:.2}s",
        succeeded,
        files.len(),
        start_time.elapsed().as_secs_f64()
    );
    Ok(succeeded)
}

/// Expand directories into the images they contain, in sorted order per directory
fn collect_inputs(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for path in inputs {
        if path.is_file() {
            if ImageIOService::is_supported_image(path) {
                files.push(path.clone());
            } else {
                warn!("Skipping unsupported file: {}", path.display());
            }
        } else if path.is_dir() {
            let mut dir_files = find_image_files(path)?;
            dir_files.sort();
            files.extend(dir_files);
        } else {
            anyhow::bail!("Input path does not exist or is not accessible: {}", path.display());
        }
    }
    Ok(files)
}

fn find_image_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(dir) {
        let entry = entry?;
        if entry.file_type().is_file() && ImageIOService::is_supported_image(entry.path()) {
            files.push(entry.path().to_path_buf());
        }
    }
    Ok(files)
}

fn build_registry(config: AnalysisConfig) -> ModelRegistry {
    #[cfg(feature = "onnx")]
    {
        ModelRegistry::onnx(config)
    }
    #[cfg(not(feature = "onnx"))]
    {
        warn!("Built without the onnx feature; every model stage will degrade");
        ModelRegistry::new(config, Arc::new(crate::registry::UnavailableModelFactory))
    }
}

/// Static table first, then USDA when an API key is configured, behind one cache
fn build_nutrition_lookup(cli: &Cli, config: &AnalysisConfig) -> Result<Arc<dyn NutritionLookup>> {
    let mut chain = ChainedNutritionLookup::new();
    if let Some(path) = &cli.nutrition_table {
        let table = StaticNutritionTable::from_json_file(path)
            .with_context(|| format!("Failed to load nutrition table {}", path.display()))?;
        info!("Loaded {} nutrition table entries", table.len());
        chain = chain.then(Arc::new(table));
    }
    let usda = UsdaNutritionClient::new(config.nutrition.clone())
        .context("Failed to create nutrition client")?;
    if usda.has_api_key() {
        chain = chain.then(Arc::new(usda));
    } else if cli.nutrition_table.is_none() {
        warn!("No USDA API key and no nutrition table; nutrition will be zero");
    }
    Ok(Arc::new(CachedNutritionLookup::new(chain)))
}

async fn analyse_file(pipeline: &FoodAnalysisPipeline, path: &Path) -> Result<PipelineResult> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let result = pipeline
        .run_pipeline(&bytes)
        .await
        .with_context(|| format!("Failed to analyse {}", path.display()))?;
    Ok(result)
}

async fn run_analyses(
    pipeline: &FoodAnalysisPipeline,
    files: &[PathBuf],
    jobs: usize,
    sink: &mut OutputSink,
) -> Result<usize> {
    let mut results = stream::iter(files.iter().map(|path| async move {
        let outcome = analyse_file(pipeline, path)
            .instrument(spans::file_analysis(path))
            .await;
        (path, outcome)
    }))
    .buffered(jobs.max(1));

    let mut succeeded = 0;
    while let Some((path, outcome)) = results.next().await {
        match outcome {
            Ok(result) => {
                info!(
                    "{}: {} item(s), {:.1} g in {}ms",
                    path.display(),
                    result.detected_foods.len(),
                    result.total_weight_g,
                    result.processing_time_ms
                );
                sink.write_result(path, &result)?;
                succeeded += 1;
            },
            Err(e) => {
                error!("{e:#}");
                sink.write_error(path, &e)?;
            },
        }
    }
    Ok(succeeded)
}

async fn run_benchmarks(
    registry: &ModelRegistry,
    files: &[PathBuf],
    sink: &mut OutputSink,
) -> Result<usize> {
    if let Err(e) = registry.preload_all().await {
        warn!("Not every model could be preloaded: {e}");
    }

    let mut succeeded = 0;
    for path in files {
        let timings = async {
            let image = ImageIOService::load_image(path)?;
            registry.benchmark(&image.to_rgb8()).await
        }
        .instrument(spans::file_analysis(path))
        .await;

        match timings {
            Ok(timings) => {
                sink.write_result(path, &timings)?;
                succeeded += 1;
            },
            Err(e) => {
                let e = anyhow::Error::from(e).context(format!("Benchmark failed for {}", path.display()));
                error!("{e:#}");
                sink.write_error(path, &e)?;
            },
        }
    }
    Ok(succeeded)
}

/// Destination for JSON results: stdout or a file
struct OutputSink {
    writer: Box<dyn Write>,
    pretty: bool,
    /// Wrap each record with its input path
    tagged: bool,
}

impl OutputSink {
    fn open(path: Option<&Path>, pretty: bool, tagged: bool) -> Result<Self> {
        let writer: Box<dyn Write> = match path {
            Some(path) => Box::new(std::io::BufWriter::new(
                std::fs::File::create(path)
                    .with_context(|| format!("Failed to create output file {}", path.display()))?,
            )),
            None => Box::new(std::io::stdout()),
        };
        Ok(Self { writer, pretty, tagged })
    }

    fn write_result<T: serde::Serialize>(&mut self, input: &Path, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.write_record(input, "result", value)
    }

    fn write_error(&mut self, input: &Path, error: &anyhow::Error) -> Result<()> {
        self.write_record(input, "error", serde_json::Value::String(format!("{error:#}")))
    }

    fn write_record(&mut self, input: &Path, key: &str, value: serde_json::Value) -> Result<()> {
        let record = if self.tagged || key == "error" {
            let mut map = serde_json::Map::new();
            map.insert("input".to_string(), input.display().to_string().into());
            map.insert(key.to_string(), value);
            serde_json::Value::Object(map)
        } else {
            value
        };
        let line = if self.pretty {
            serde_json::to_string_pretty(&record)?
        } else {
            serde_json::to_string(&record)?
        };
        writeln!(self.writer, "{line}").context("Failed to write output")?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.writer.flush().context("Failed to flush output")
    }
}

impl Cli {
    /// Execution provider flag, parsed
    pub(crate) fn parsed_execution_provider(&self) -> Result<Option<ExecutionProvider>> {
        self.execution_provider
            .as_deref()
            .map(str::parse::<ExecutionProvider>)
            .transpose()
            .map_err(anyhow::Error::from)
    }
}
