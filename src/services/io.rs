//! Image I/O operations service
//!
//! Decoding of request input and encoding of debug artifacts. Input problems
//! surface as [`NutrilensError::InvalidInput`] or [`NutrilensError::Image`],
//! the only errors the pipeline lets escape.

use crate::error::{NutrilensError, Result};
use image::{DynamicImage, ImageFormat};
use std::path::Path;

/// Service for handling image input/output operations
pub struct ImageIOService;

impl ImageIOService {
    /// Decode an image from raw bytes, detecting the format from content
    ///
    /// # Errors
    /// - Empty input
    /// - Unrecognised or corrupt image data
    /// - Zero-sized image
    pub fn decode_bytes(bytes: &[u8]) -> Result<DynamicImage> {
        if bytes.is_empty() {
            return Err(NutrilensError::invalid_input("Image data is empty"));
        }

        let format = image::guess_format(bytes).map_err(|e| {
            NutrilensError::invalid_input(format!(
                "Unrecognised image format ({} bytes): {e}",
                bytes.len()
            ))
        })?;
        let image = image::load_from_memory_with_format(bytes, format)?;
        Self::ensure_non_empty(image)
    }

    /// Load an image from a file path.
    ///
    /// Content-based format detection is tried when the extension is wrong.
    ///
    /// # Errors
    /// - File missing or unreadable
    /// - Undecodable or zero-sized image
    pub fn load_image<P: AsRef<Path>>(path: P) -> Result<DynamicImage> {
        let path_ref = path.as_ref();
        if !path_ref.exists() {
            return Err(NutrilensError::invalid_input(format!(
                "Image file does not exist: {}",
                path_ref.display()
            )));
        }

        match image::open(path_ref) {
            Ok(image) => Self::ensure_non_empty(image),
            Err(e) => {
                log::debug!(
                    "Extension-based loading failed for {}: {}. Attempting content-based detection.",
                    path_ref.display(),
                    e
                );
                let data = std::fs::read(path_ref)?;
                Self::decode_bytes(&data)
            },
        }
    }

    fn ensure_non_empty(image: DynamicImage) -> Result<DynamicImage> {
        if image.width() == 0 || image.height() == 0 {
            return Err(NutrilensError::invalid_input(format!(
                "Image has zero size ({}x{})",
                image.width(),
                image.height()
            )));
        }
        Ok(image)
    }

    /// Save an image, picking the encoder from the file extension
    ///
    /// JPEG cannot carry alpha, so images with transparency are flattened to RGB first.
    ///
    /// # Errors
    /// - Unknown extension
    /// - Directory creation or encoding failures
    pub fn save_image<P: AsRef<Path>>(image: &DynamicImage, path: P) -> Result<()> {
        let path_ref = path.as_ref();
        if let Some(parent) = path_ref.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let format = ImageFormat::from_path(path_ref)?;
        if format == ImageFormat::Jpeg && image.color().has_alpha() {
            DynamicImage::ImageRgb8(image.to_rgb8()).save_with_format(path_ref, format)?;
        } else {
            image.save_with_format(path_ref, format)?;
        }
        Ok(())
    }

    /// Whether `path` has an extension this build can decode
    #[must_use]
    pub fn is_supported_image(path: &Path) -> bool {
        let Some(extension) = path.extension().and_then(|e| e.to_str()) else {
            return false;
        };
        let supported: &[&str] = if cfg!(feature = "webp-support") {
            &["jpg", "jpeg", "png", "tif", "tiff", "webp"]
        } else {
            &["jpg", "jpeg", "png", "tif", "tiff"]
        };
        supported.iter().any(|ext| extension.eq_ignore_ascii_case(ext))
    }
}
