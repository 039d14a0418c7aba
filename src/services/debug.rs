//! Debug artifact sinks
//!
//! The pipeline can emit intermediate images (annotated detections, depth
//! visualisation, per-item crops, final overlay). Sinks never fail the run;
//! write errors are logged and dropped.

use super::io::ImageIOService;
use crate::error::Result;
use image::{DynamicImage, GrayImage, RgbImage, RgbaImage};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

pub const ORIGINAL_ARTIFACT: &str = "00_original.jpg";
pub const DETECTIONS_ARTIFACT: &str = "01_detected_objects.jpg";
pub const SEGMENTATION_ARTIFACT: &str = "02_final_segmentation.jpg";
pub const DEPTH_ARTIFACT: &str = "03_depth_map.png";

/// File name for the RGBA crop of item `index`
#[must_use]
pub fn item_crop_artifact(index: usize, label: &str) -> String {
    let label: String = label
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    format!("item_{index}_{label}_cropped.png")
}

/// One named intermediate image
#[derive(Debug, Clone)]
pub enum DebugImage {
    Rgb(RgbImage),
    Rgba(RgbaImage),
    Gray(GrayImage),
}

impl DebugImage {
    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            Self::Rgb(image) => image.dimensions(),
            Self::Rgba(image) => image.dimensions(),
            Self::Gray(image) => image.dimensions(),
        }
    }

    fn to_dynamic(&self) -> DynamicImage {
        match self {
            Self::Rgb(image) => DynamicImage::ImageRgb8(image.clone()),
            Self::Rgba(image) => DynamicImage::ImageRgba8(image.clone()),
            Self::Gray(image) => DynamicImage::ImageLuma8(image.clone()),
        }
    }
}

/// Receiver of debug artifacts for one pipeline run
pub trait DebugSink: Send + Sync {
    /// Whether artifacts are wanted at all; the pipeline skips rendering when not
    fn is_enabled(&self) -> bool {
        true
    }

    fn record(&self, name: &str, image: DebugImage);

    /// Where artifacts ended up, reported as `debug_output_path`
    fn output_path(&self) -> Option<PathBuf> {
        None
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpDebugSink;

impl DebugSink for NoOpDebugSink {
    fn is_enabled(&self) -> bool {
        false
    }

    fn record(&self, _name: &str, _image: DebugImage) {}
}

/// Writes artifacts into a fresh timestamped directory below a root
#[derive(Debug)]
pub struct DirectoryDebugSink {
    dir: PathBuf,
}

impl DirectoryDebugSink {
    /// Create `<root>/<YYYYmmdd_HHMMSS_micros>`
    ///
    /// # Errors
    /// - Directory creation failures
    pub fn create<P: AsRef<Path>>(root: P) -> Result<Self> {
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S_%6f").to_string();
        let dir = root.as_ref().join(stamp);
        std::fs::create_dir_all(&dir)?;
        debug!(dir = %dir.display(), "Debug output directory created");
        Ok(Self { dir })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl DebugSink for DirectoryDebugSink {
    fn record(&self, name: &str, image: DebugImage) {
        let path = self.dir.join(name);
        if let Err(e) = ImageIOService::save_image(&image.to_dynamic(), &path) {
            warn!(path = %path.display(), error = %e, "Failed to write debug artifact");
        }
    }

    fn output_path(&self) -> Option<PathBuf> {
        Some(self.dir.clone())
    }
}

/// Keeps artifacts in memory
#[derive(Debug, Default)]
pub struct MemoryDebugSink {
    artifacts: Mutex<Vec<(String, DebugImage)>>,
}

impl MemoryDebugSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Artifact names in recording order
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.artifacts
            .lock()
            .map(|artifacts| artifacts.iter().map(|(name, _)| name.clone()).collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<DebugImage> {
        self.artifacts.lock().ok().and_then(|artifacts| {
            artifacts
                .iter()
                .find(|(recorded, _)| recorded == name)
                .map(|(_, image)| image.clone())
        })
    }
}

impl DebugSink for MemoryDebugSink {
    fn record(&self, name: &str, image: DebugImage) {
        if let Ok(mut artifacts) = self.artifacts.lock() {
            artifacts.push((name.to_string(), image));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_crop_name_is_filesystem_safe() {
        assert_eq!(item_crop_artifact(0, "Fried Rice"), "item_0_fried_rice_cropped.png");
        assert_eq!(item_crop_artifact(3, "mac/cheese"), "item_3_mac_cheese_cropped.png");
    }

    #[test]
    fn test_directory_sink_writes_files() {
        let root = tempfile::tempdir().unwrap();
        let sink = DirectoryDebugSink::create(root.path()).unwrap();
        assert!(sink.dir().starts_with(root.path()));

        sink.record(ORIGINAL_ARTIFACT, DebugImage::Rgb(RgbImage::new(4, 4)));
        sink.record(DEPTH_ARTIFACT, DebugImage::Gray(GrayImage::new(4, 4)));
        sink.record(&item_crop_artifact(0, "rice"), DebugImage::Rgba(RgbaImage::new(2, 2)));

        for name in [ORIGINAL_ARTIFACT, DEPTH_ARTIFACT, "item_0_rice_cropped.png"] {
            assert!(sink.dir().join(name).exists(), "{name} missing");
        }
        assert_eq!(sink.output_path(), Some(sink.dir().to_path_buf()));
    }

    #[test]
    fn test_directory_sink_swallows_write_errors() {
        let root = tempfile::tempdir().unwrap();
        let sink = DirectoryDebugSink::create(root.path()).unwrap();
        // unknown extension cannot be encoded
        sink.record("artifact.unknown", DebugImage::Rgb(RgbImage::new(2, 2)));
        assert!(!sink.dir().join("artifact.unknown").exists());
    }

    #[test]
    fn test_memory_sink_records_in_order() {
        let sink = MemoryDebugSink::new();
        sink.record(ORIGINAL_ARTIFACT, DebugImage::Rgb(RgbImage::new(3, 2)));
        sink.record(DETECTIONS_ARTIFACT, DebugImage::Rgb(RgbImage::new(3, 2)));

        assert_eq!(sink.names(), vec![ORIGINAL_ARTIFACT, DETECTIONS_ARTIFACT]);
        assert_eq!(sink.get(ORIGINAL_ARTIFACT).unwrap().dimensions(), (3, 2));
        assert!(sink.get(DEPTH_ARTIFACT).is_none());
        assert!(NoOpDebugSink.output_path().is_none());
        assert!(!NoOpDebugSink.is_enabled());
    }
}
