//! Pixel-level helpers: mask crops and debug visualisations

use crate::error::{NutrilensError, Result};
use crate::types::{DepthMap, DetectedObject, FoodMask};
use image::{GrayImage, Luma, Rgb, RgbImage, Rgba, RgbaImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;

const BOX_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const BOX_THICKNESS: u32 = 3;

/// Overlay colours, cycled per mask
const OVERLAY_PALETTE: [[u8; 3]; 8] = [
    [230, 25, 75],
    [60, 180, 75],
    [255, 225, 25],
    [0, 130, 200],
    [245, 130, 48],
    [145, 30, 180],
    [70, 240, 240],
    [240, 50, 230],
];

/// Crop `image` to the mask's bounding rectangle, using the mask as alpha.
///
/// Pixels outside the mask become fully transparent.
///
/// # Errors
/// - Mask and image dimensions differ
/// - Mask is empty
pub fn crop_to_mask(image: &RgbImage, mask: &FoodMask) -> Result<RgbaImage> {
    if image.dimensions() != mask.dimensions {
        return Err(NutrilensError::processing(format!(
            "Mask {:?} does not match image {:?}",
            mask.dimensions,
            image.dimensions()
        )));
    }

    let rect = mask
        .bounding_rect()
        .ok_or_else(|| NutrilensError::processing("Cannot crop to an empty mask"))?;

    let (x0, y0) = (rect.x1 as u32, rect.y1 as u32);
    let (width, height) = (rect.width() as u32, rect.height() as u32);

    Ok(RgbaImage::from_fn(width, height, |x, y| {
        let (sx, sy) = (x0 + x, y0 + y);
        let Rgb([r, g, b]) = *image.get_pixel(sx, sy);
        let alpha = if mask.is_set(sx, sy) { 255 } else { 0 };
        Rgba([r, g, b, alpha])
    }))
}

/// Copy of `image` with a red rectangle around every detection
#[must_use]
pub fn annotate_detections(image: &RgbImage, objects: &[DetectedObject]) -> RgbImage {
    let mut annotated = image.clone();
    let (width, height) = image.dimensions();

    for obj in objects {
        let bbox = obj.bounding_box.clamped(width, height);
        for inset in 0..BOX_THICKNESS {
            let w = bbox.width() as u32;
            let h = bbox.height() as u32;
            if w <= 2 * inset || h <= 2 * inset {
                break;
            }
            let rect = Rect::at((bbox.x1 as u32 + inset) as i32, (bbox.y1 as u32 + inset) as i32)
                .of_size(w - 2 * inset, h - 2 * inset);
            draw_hollow_rect_mut(&mut annotated, rect, BOX_COLOR);
        }
    }

    annotated
}

/// Grayscale rendering of a depth map, min/max normalised to `0..=255`
#[must_use]
pub fn depth_visualization(depth: &DepthMap) -> GrayImage {
    let (width, height) = depth.dimensions();
    let finite = depth.values.iter().copied().filter(|v| v.is_finite());
    let (min, max) = finite.fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
    let range = (max - min).max(1e-6);

    GrayImage::from_fn(width, height, |x, y| {
        let value = depth
            .values
            .get((y as usize, x as usize))
            .copied()
            .filter(|v| v.is_finite())
            .unwrap_or(min);
        Luma([((value - min) / range * 255.0).clamp(0.0, 255.0) as u8])
    })
}

/// Blend each mask into `image` at 50 % with a distinct colour
#[must_use]
pub fn segmentation_overlay(image: &RgbImage, masks: &[&FoodMask]) -> RgbImage {
    let mut overlay = image.clone();

    for (index, mask) in masks.iter().enumerate() {
        if mask.dimensions != image.dimensions() {
            continue;
        }
        let color = OVERLAY_PALETTE[index % OVERLAY_PALETTE.len()];
        for (x, y, pixel) in overlay.enumerate_pixels_mut() {
            if mask.is_set(x, y) {
                for (channel, tint) in pixel.0.iter_mut().zip(color) {
                    *channel = ((u16::from(*channel) + u16::from(tint)) / 2) as u8;
                }
            }
        }
    }

    overlay
}
