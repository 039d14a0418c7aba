//! Image to tensor preprocessing shared by the model adapters

use crate::error::{NutrilensError, Result};
use image::{imageops::FilterType, RgbImage};
use ndarray::{Array2, Array4};

/// Per-channel normalisation applied after scaling pixel values
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalization {
    /// Multiplier applied to raw `0..=255` values before mean/std
    pub scale: f32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Normalization {
    /// `x / 255`, used by YOLO exports
    pub const UNIT: Self = Self {
        scale: 1.0 / 255.0,
        mean: [0.0, 0.0, 0.0],
        std: [1.0, 1.0, 1.0],
    };

    /// ImageNet statistics on `x / 255`, used by classifiers and DPT
    pub const IMAGENET: Self = Self {
        scale: 1.0 / 255.0,
        mean: [0.485, 0.456, 0.406],
        std: [0.229, 0.224, 0.225],
    };

    /// ImageNet statistics on raw pixel values, used by SAM image encoders
    pub const SAM: Self = Self {
        scale: 1.0,
        mean: [123.675, 116.28, 103.53],
        std: [58.395, 57.12, 57.375],
    };
}

/// Convert an RGB image to a normalised `1x3xHxW` tensor
#[must_use]
pub fn image_to_tensor(image: &RgbImage, norm: &Normalization) -> Array4<f32> {
    let (width, height) = image.dimensions();
    let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));

    for (x, y, pixel) in image.enumerate_pixels() {
        for c in 0..3 {
            let value = f32::from(pixel.0[c]) * norm.scale;
            tensor[[0, c, y as usize, x as usize]] = (value - norm.mean[c]) / norm.std[c];
        }
    }

    tensor
}

/// Stretch to `width x height` (no aspect preservation) and convert
#[must_use]
pub fn resize_exact_to_tensor(
    image: &RgbImage,
    width: u32,
    height: u32,
    norm: &Normalization,
) -> Array4<f32> {
    let resized = image::imageops::resize(image, width, height, FilterType::Triangle);
    image_to_tensor(&resized, norm)
}

/// Scale factor that fits the longest side into `target`
#[must_use]
pub fn longest_side_scale(width: u32, height: u32, target: u32) -> f32 {
    target as f32 / width.max(height).max(1) as f32
}

/// Resize so the longest side equals `target`, then zero-pad bottom/right to a square.
///
/// Padding is applied after normalisation, so padded pixels are exactly zero.
/// Returns the tensor and the scale factor applied to source coordinates.
///
/// # Errors
/// - Zero-sized input image
pub fn resize_longest_padded_to_tensor(
    image: &RgbImage,
    target: u32,
    norm: &Normalization,
) -> Result<(Array4<f32>, f32)> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(NutrilensError::invalid_input("Cannot preprocess an empty image"));
    }

    let scale = longest_side_scale(width, height, target);
    let new_width = ((width as f32 * scale).round() as u32).clamp(1, target);
    let new_height = ((height as f32 * scale).round() as u32).clamp(1, target);

    let resized = image::imageops::resize(image, new_width, new_height, FilterType::Triangle);
    let content = image_to_tensor(&resized, norm);

    let mut tensor = Array4::<f32>::zeros((1, 3, target as usize, target as usize));
    tensor
        .slice_mut(ndarray::s![.., .., ..new_height as usize, ..new_width as usize])
        .assign(&content);

    Ok((tensor, scale))
}

/// Bilinear resample of a 2-D map to `width x height`
#[must_use]
pub fn resize_map_bilinear(map: &Array2<f32>, width: u32, height: u32) -> Array2<f32> {
    let (src_h, src_w) = map.dim();
    let (dst_w, dst_h) = (width as usize, height as usize);
    if src_h == 0 || src_w == 0 {
        return Array2::zeros((dst_h, dst_w));
    }
    if (src_h, src_w) == (dst_h, dst_w) {
        return map.clone();
    }

    let sx = src_w as f32 / dst_w.max(1) as f32;
    let sy = src_h as f32 / dst_h.max(1) as f32;

    Array2::from_shape_fn((dst_h, dst_w), |(y, x)| {
        let fx = ((x as f32 + 0.5) * sx - 0.5).clamp(0.0, (src_w - 1) as f32);
        let fy = ((y as f32 + 0.5) * sy - 0.5).clamp(0.0, (src_h - 1) as f32);
        let (x0, y0) = (fx.floor() as usize, fy.floor() as usize);
        let (x1, y1) = ((x0 + 1).min(src_w - 1), (y0 + 1).min(src_h - 1));
        let (tx, ty) = (fx - x0 as f32, fy - y0 as f32);

        let top = map[[y0, x0]] * (1.0 - tx) + map[[y0, x1]] * tx;
        let bottom = map[[y1, x0]] * (1.0 - tx) + map[[y1, x1]] * tx;
        top * (1.0 - ty) + bottom * ty
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_unit_normalization() {
        let image = RgbImage::from_pixel(2, 2, Rgb([255, 0, 51]));
        let tensor = image_to_tensor(&image, &Normalization::UNIT);
        assert_eq!(tensor.dim(), (1, 3, 2, 2));
        assert!((tensor[[0, 0, 1, 1]] - 1.0).abs() < 1e-6);
        assert!(tensor[[0, 1, 0, 0]].abs() < 1e-6);
        assert!((tensor[[0, 2, 0, 1]] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_longest_side_padding() {
        let image = RgbImage::from_pixel(200, 100, Rgb([200, 200, 200]));
        let (tensor, scale) = resize_longest_padded_to_tensor(&image, 64, &Normalization::SAM).unwrap();
        assert_eq!(tensor.dim(), (1, 3, 64, 64));
        assert!((scale - 0.32).abs() < 1e-6);
        // content rows are normalised, padded rows stay zero
        assert!(tensor[[0, 0, 10, 10]].abs() > 0.1);
        assert!(tensor[[0, 0, 40, 10]].abs() < f32::EPSILON);
    }

    #[test]
    fn test_empty_image_rejected() {
        let image = RgbImage::new(0, 0);
        assert!(resize_longest_padded_to_tensor(&image, 64, &Normalization::SAM).is_err());
    }

    #[test]
    fn test_bilinear_resize_preserves_constant_and_range() {
        let map = Array2::from_elem((4, 4), 3.0_f32);
        let resized = resize_map_bilinear(&map, 9, 7);
        assert_eq!(resized.dim(), (7, 9));
        assert!(resized.iter().all(|v| (v - 3.0).abs() < 1e-6));

        let ramp = Array2::from_shape_fn((2, 2), |(_, x)| x as f32);
        let up = resize_map_bilinear(&ramp, 8, 8);
        assert!(up.iter().all(|v| (0.0..=1.0).contains(v)));
        assert!(up[[0, 0]] < up[[0, 7]]);
    }
}
