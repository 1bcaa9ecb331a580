//! Image normalization.
//!
//! Decodes arbitrary image bytes once into the planes the rest of the
//! pipeline needs: the original color raster (for the vision backend), a
//! grayscale plane (for the neural extraction engine) and a binarized mask
//! (for tesseract). Binarization uses a global Otsu threshold, so there are
//! no tunable parameters and the whole step is deterministic.

use std::io::Cursor;

use image::{GrayImage, ImageFormat, Luma, RgbImage};

use crate::prelude::*;

/// A decoded, preprocessed raster image. Immutable once created.
#[derive(Debug, Clone)]
pub struct ImageBuffer {
    width: u32,
    height: u32,
    rgb: RgbImage,
    gray: GrayImage,
    binary: GrayImage,
}

impl ImageBuffer {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// The original image, converted to RGB8.
    pub fn rgb(&self) -> &RgbImage {
        &self.rgb
    }

    /// The grayscale plane.
    pub fn gray(&self) -> &GrayImage {
        &self.gray
    }

    /// The Otsu-binarized mask. Every pixel is 0 or 255.
    pub fn binary(&self) -> &GrayImage {
        &self.binary
    }

    /// Encode the color plane as PNG, for handing to subprocess runners.
    pub fn rgb_png(&self) -> Result<Vec<u8>, image::ImageError> {
        let mut buf = Vec::new();
        self.rgb()
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
        Ok(buf)
    }

    /// Encode the grayscale plane as PNG.
    pub fn gray_png(&self) -> Result<Vec<u8>, image::ImageError> {
        let mut buf = Vec::new();
        self.gray()
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
        Ok(buf)
    }

    /// Encode the binarized mask as PNG.
    pub fn binary_png(&self) -> Result<Vec<u8>, image::ImageError> {
        let mut buf = Vec::new();
        self.binary()
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
        Ok(buf)
    }
}

/// Decode `raw_bytes` and build all planes.
///
/// Same input bytes always yield the same buffer. Fails only if the bytes
/// cannot be parsed as an image.
pub fn normalize(raw_bytes: &[u8]) -> Result<ImageBuffer, PipelineError> {
    let decoded = image::load_from_memory(raw_bytes)
        .map_err(|source| PipelineError::Decode { source })?;
    let rgb = decoded.to_rgb8();
    let gray = decoded.to_luma8();
    let threshold = otsu_threshold(&gray);
    debug!(threshold, "binarizing with Otsu threshold");
    let binary = binarize(&gray, threshold);
    Ok(ImageBuffer {
        width: gray.width(),
        height: gray.height(),
        rgb,
        gray,
        binary,
    })
}

/// Compute the global threshold maximizing between-class variance.
///
/// Ties resolve to the lowest threshold, which keeps the result stable for
/// degenerate (single-level) images.
fn otsu_threshold(gray: &GrayImage) -> u8 {
    let mut histogram = [0u64; 256];
    for Luma([level]) in gray.pixels() {
        histogram[*level as usize] += 1;
    }

    let total = gray.width() as u64 * gray.height() as u64;
    let weighted_sum: u64 = histogram
        .iter()
        .enumerate()
        .map(|(level, count)| level as u64 * count)
        .sum();

    let mut best = (0u8, 0.0f64);
    let mut background_count = 0u64;
    let mut background_sum = 0u64;
    for threshold in 0..256usize {
        background_count += histogram[threshold];
        background_sum += threshold as u64 * histogram[threshold];
        let foreground_count = total - background_count;
        if background_count == 0 || foreground_count == 0 {
            continue;
        }
        let mean_background = background_sum as f64 / background_count as f64;
        let mean_foreground =
            (weighted_sum - background_sum) as f64 / foreground_count as f64;
        let diff = mean_background - mean_foreground;
        let variance =
            background_count as f64 * foreground_count as f64 * diff * diff;
        if variance > best.1 {
            best = (threshold as u8, variance);
        }
    }
    best.0
}

/// Map every pixel above `threshold` to 255 and the rest to 0.
fn binarize(gray: &GrayImage, threshold: u8) -> GrayImage {
    let mut out = gray.clone();
    for Luma([level]) in out.pixels_mut() {
        *level = if *level > threshold { 255 } else { 0 };
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A small synthetic page: dark strip on the left, light elsewhere.
    fn bimodal_png() -> Vec<u8> {
        let img = GrayImage::from_fn(16, 8, |x, _| {
            if x < 6 { Luma([20]) } else { Luma([230]) }
        });
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }

    #[test]
    fn normalize_is_deterministic() {
        let bytes = bimodal_png();
        let a = normalize(&bytes).unwrap();
        let b = normalize(&bytes).unwrap();
        assert_eq!(a.binary().as_raw(), b.binary().as_raw());
        assert_eq!(a.gray().as_raw(), b.gray().as_raw());
    }

    #[test]
    fn otsu_separates_bimodal_image() {
        let buffer = normalize(&bimodal_png()).unwrap();
        for (x, _, Luma([level])) in buffer.binary().enumerate_pixels() {
            if x < 6 {
                assert_eq!(*level, 0, "dark strip must binarize to 0");
            } else {
                assert_eq!(*level, 255, "light area must binarize to 255");
            }
        }
    }

    #[test]
    fn normalize_is_idempotent_on_binarized_output() {
        let first = normalize(&bimodal_png()).unwrap();
        let again = normalize(&first.binary_png().unwrap()).unwrap();
        assert_eq!(first.binary().as_raw(), again.binary().as_raw());
    }

    #[test]
    fn uniform_image_survives_binarization() {
        let img = GrayImage::from_pixel(4, 4, Luma([255]));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        let buffer = normalize(&buf).unwrap();
        assert!(buffer.binary().pixels().all(|p| p.0[0] == 255));
    }

    #[test]
    fn garbage_bytes_fail_with_decode_error() {
        let err = normalize(b"definitely not an image").unwrap_err();
        assert!(matches!(err, PipelineError::Decode { .. }));
    }
}
