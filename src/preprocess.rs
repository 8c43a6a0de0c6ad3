//! Image normalization for classifier inference.
//!
//! Turns an arbitrary uploaded photo into the tensor layout the ResNet
//! weights were trained on: shorter edge resized to 256, center crop to
//! 224x224, scaled to [0, 1] and normalized with the ImageNet channel stats.

use crate::error::{Result, ServeError};
use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbImage};

/// Target length of the shorter edge before cropping
pub const RESIZE_SHORT_EDGE: u32 = 256;

/// Side length of the square crop fed to the model
pub const INPUT_SIZE: u32 = 224;

/// Per-channel mean (R, G, B)
pub const CHANNEL_MEAN: [f32; 3] = [0.485, 0.456, 0.406];

/// Per-channel standard deviation (R, G, B)
pub const CHANNEL_STD: [f32; 3] = [0.229, 0.224, 0.225];

const PLANE: usize = (INPUT_SIZE * INPUT_SIZE) as usize;

/// Largest full resize performed; above this only the cropped window is resized
const MAX_RESIZE_BYTES: u64 = 64 * 1024 * 1024;

/// Normalized model input in NCHW order with a batch of one.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedTensor {
    data: Vec<f32>,
}

impl NormalizedTensor {
    /// Tensor shape: (batch, channels, height, width)
    pub const SHAPE: [usize; 4] = [1, 3, INPUT_SIZE as usize, INPUT_SIZE as usize];

    pub fn shape(&self) -> [usize; 4] {
        Self::SHAPE
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }
}

/// Stateless image normalizer. Safe to share across threads.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageNormalizer;

impl ImageNormalizer {
    pub fn new() -> Self {
        Self
    }

    /// Decode raw bytes (any format the `image` crate recognizes).
    pub fn decode(&self, bytes: &[u8]) -> Result<DynamicImage> {
        if bytes.is_empty() {
            return Err(ServeError::ImageDecode("empty payload".to_string()));
        }

        let image = image::load_from_memory(bytes)
            .map_err(|e| ServeError::ImageDecode(e.to_string()))?;

        if image.width() == 0 || image.height() == 0 {
            return Err(ServeError::ImageDecode(format!(
                "image has zero extent ({}x{})",
                image.width(),
                image.height()
            )));
        }

        Ok(image)
    }

    /// Decode and normalize in one step.
    pub fn normalize_bytes(&self, bytes: &[u8]) -> Result<NormalizedTensor> {
        let image = self.decode(bytes)?;
        self.normalize(&image)
    }

    /// Normalize an already decoded image.
    pub fn normalize(&self, image: &DynamicImage) -> Result<NormalizedTensor> {
        let (width, height) = (image.width(), image.height());
        if width == 0 || height == 0 {
            return Err(ServeError::ImageDecode(format!(
                "image has zero extent ({}x{})",
                width, height
            )));
        }

        // Alpha is dropped, palette/grayscale expanded
        let rgb = image.to_rgb8();
        let cropped = resize_and_crop(&rgb, MAX_RESIZE_BYTES);
        drop(rgb);

        Ok(NormalizedTensor {
            data: to_chw_normalized(&cropped),
        })
    }
}

/// Shorter-edge resize followed by the center crop.
///
/// When the full resize would exceed `max_resize_bytes` (extreme aspect
/// ratios), only the source strip under the crop, plus the filter support on
/// each side, is resized.
fn resize_and_crop(rgb: &RgbImage, max_resize_bytes: u64) -> RgbImage {
    let (width, height) = rgb.dimensions();
    let short = width.min(height) as u64;
    let long = width.max(height) as u64;
    let resized_long = (RESIZE_SHORT_EDGE as u64 * long / short).max(RESIZE_SHORT_EDGE as u64);

    if resized_long * RESIZE_SHORT_EDGE as u64 * 3 <= max_resize_bytes {
        let (resized_w, resized_h) = resized_dimensions(width, height);
        let resized = imageops::resize(rgb, resized_w, resized_h, FilterType::Triangle);
        let (left, top) = center_crop_offsets(resized_w, resized_h);
        return imageops::crop_imm(&resized, left, top, INPUT_SIZE, INPUT_SIZE).to_image();
    }

    // Only the long axis is windowed; the short axis always resizes to 256
    let scale = RESIZE_SHORT_EDGE as f64 / short as f64;
    let offset = ((resized_long - INPUT_SIZE as u64) as f64 / 2.0).round_ties_even();
    let margin = (1.0 / scale).max(1.0).ceil() + 1.0;

    let src_start = ((offset / scale).floor() - margin).max(0.0) as u32;
    let src_end = (((offset + INPUT_SIZE as f64) / scale).ceil() + margin).min(long as f64) as u32;
    let src_len = src_end - src_start;

    let window_len = ((src_len as f64 * scale).round() as u32).max(INPUT_SIZE);
    let crop_at = ((offset - src_start as f64 * scale).round_ties_even().max(0.0) as u32)
        .min(window_len - INPUT_SIZE);

    if width > height {
        let strip = imageops::crop_imm(rgb, src_start, 0, src_len, height).to_image();
        let resized = imageops::resize(&strip, window_len, RESIZE_SHORT_EDGE, FilterType::Triangle);
        let top = center_crop_offsets(window_len, RESIZE_SHORT_EDGE).1;
        imageops::crop_imm(&resized, crop_at, top, INPUT_SIZE, INPUT_SIZE).to_image()
    } else {
        let strip = imageops::crop_imm(rgb, 0, src_start, width, src_len).to_image();
        let resized = imageops::resize(&strip, RESIZE_SHORT_EDGE, window_len, FilterType::Triangle);
        let left = center_crop_offsets(RESIZE_SHORT_EDGE, window_len).0;
        imageops::crop_imm(&resized, left, crop_at, INPUT_SIZE, INPUT_SIZE).to_image()
    }
}

/// Output size for a shorter-edge resize to [`RESIZE_SHORT_EDGE`].
///
/// The long edge is truncated, not rounded, so a 500x400 photo becomes 320x256.
pub fn resized_dimensions(width: u32, height: u32) -> (u32, u32) {
    let short = width.min(height) as u64;
    let long = width.max(height) as u64;
    let target = RESIZE_SHORT_EDGE as u64;
    let scaled_long = ((target * long) / short).clamp(target, u32::MAX as u64) as u32;

    if width <= height {
        (RESIZE_SHORT_EDGE, scaled_long)
    } else {
        (scaled_long, RESIZE_SHORT_EDGE)
    }
}

/// Top-left corner of the centered [`INPUT_SIZE`] crop. Half pixels round to even.
pub fn center_crop_offsets(width: u32, height: u32) -> (u32, u32) {
    let offset = |dim: u32| -> u32 {
        let excess = dim.saturating_sub(INPUT_SIZE) as f64;
        (excess / 2.0).round_ties_even() as u32
    };
    (offset(width), offset(height))
}

fn to_chw_normalized(crop: &RgbImage) -> Vec<f32> {
    let mut data = vec![0.0f32; 3 * PLANE];
    let side = INPUT_SIZE as usize;

    for (x, y, pixel) in crop.enumerate_pixels() {
        let idx = y as usize * side + x as usize;
        for channel in 0..3 {
            let unit = pixel[channel] as f32 / 255.0;
            data[channel * PLANE + idx] = (unit - CHANNEL_MEAN[channel]) / CHANNEL_STD[channel];
        }
    }

    data
}
