use std::{io::Cursor, path::Path};

use image::{
    DynamicImage, GrayImage, Luma, RgbImage,
    codecs::jpeg::JpegEncoder,
    imageops::{self, FilterType},
};
use imageproc::region_labelling::{Connectivity, connected_components};
use ndarray::Array2;

use crate::error::{ForensicsError, Result};

/// Reads an image from disk and resizes it to `(height, width)`.
pub fn load_rgb_image<P: AsRef<Path>>(path: P, image_size: [u32; 2]) -> Result<RgbImage> {
    let image = image::open(path)?;
    Ok(fit_to_size(&image, image_size))
}

/// Decodes an in-memory upload and resizes it to `(height, width)`.
pub fn decode_image_bytes(bytes: &[u8], image_size: [u32; 2]) -> Result<RgbImage> {
    if bytes.is_empty() {
        return Err(ForensicsError::InvalidParameter("empty image payload".into()));
    }
    let image = image::load_from_memory(bytes)?;
    Ok(fit_to_size(&image, image_size))
}

fn fit_to_size(image: &DynamicImage, image_size: [u32; 2]) -> RgbImage {
    let [height, width] = image_size;
    let rgb = image.to_rgb8();
    if rgb.dimensions() == (width, height) {
        return rgb;
    }
    imageops::resize(&rgb, width, height, FilterType::Triangle)
}

pub fn recompress_jpeg(image: &RgbImage, quality: u8) -> Result<RgbImage> {
    let mut buffer = Cursor::new(Vec::new());

    let encoder = JpegEncoder::new_with_quality(&mut buffer, quality);
    DynamicImage::ImageRgb8(image.clone()).write_with_encoder(encoder)?;

    let recompressed = image::load_from_memory(&buffer.into_inner())?;
    Ok(recompressed.to_rgb8())
}

pub fn rgb_to_luma(image: &RgbImage) -> Array2<f64> {
    let (width, height) = image.dimensions();
    let mut gray = Array2::zeros((height as usize, width as usize));

    for (x, y, pixel) in image.enumerate_pixels() {
        gray[[y as usize, x as usize]] =
            0.299 * pixel[0] as f64 + 0.587 * pixel[1] as f64 + 0.114 * pixel[2] as f64;
    }

    gray
}

pub fn gray_to_array(image: &GrayImage) -> Array2<f64> {
    let (width, height) = image.dimensions();
    let mut arr = Array2::zeros((height as usize, width as usize));

    for (x, y, pixel) in image.enumerate_pixels() {
        arr[[y as usize, x as usize]] = pixel[0] as f64;
    }

    arr
}

/// Mirror index without repeating the edge sample (`gfedcb|abcdefgh|gfedcba`).
fn reflect_101(idx: isize, len: usize) -> usize {
    if len == 1 {
        return 0;
    }
    let period = 2 * (len as isize - 1);
    let mut i = idx.rem_euclid(period);
    if i >= len as isize {
        i = period - i;
    }
    i as usize
}

pub fn gaussian_kernel(ksize: usize, sigma: f64) -> Vec<f64> {
    let ksize = if ksize % 2 == 0 { ksize + 1 } else { ksize };
    let sigma = if sigma > 0.0 {
        sigma
    } else {
        0.3 * ((ksize as f64 - 1.0) * 0.5 - 1.0) + 0.8
    };
    let half = (ksize / 2) as isize;
    let mut kernel = (-half..=half)
        .map(|i| (-((i * i) as f64) / (2.0 * sigma * sigma)).exp())
        .collect::<Vec<_>>();
    let sum = kernel.iter().sum::<f64>();
    for k in &mut kernel {
        *k /= sum;
    }
    kernel
}

/// Kernel size used when only sigma is given.
pub fn auto_kernel_size(sigma: f64) -> usize {
    ((sigma * 8.0 + 1.0).round() as usize) | 1
}

pub fn convolve_separable(arr: &Array2<f64>, kernel: &[f64]) -> Array2<f64> {
    let (height, width) = arr.dim();
    let half = (kernel.len() / 2) as isize;

    let mut horizontal = Array2::zeros((height, width));
    for y in 0..height {
        for x in 0..width {
            let mut sum = 0.0;
            for (k, weight) in kernel.iter().enumerate() {
                let sx = reflect_101(x as isize + k as isize - half, width);
                sum += arr[[y, sx]] * weight;
            }
            horizontal[[y, x]] = sum;
        }
    }

    let mut result = Array2::zeros((height, width));
    for y in 0..height {
        for x in 0..width {
            let mut sum = 0.0;
            for (k, weight) in kernel.iter().enumerate() {
                let sy = reflect_101(y as isize + k as isize - half, height);
                sum += horizontal[[sy, x]] * weight;
            }
            result[[y, x]] = sum;
        }
    }

    result
}

pub fn gaussian_blur(arr: &Array2<f64>, ksize: usize, sigma: f64) -> Array2<f64> {
    convolve_separable(arr, &gaussian_kernel(ksize, sigma))
}

pub fn gaussian_blur_sigma(arr: &Array2<f64>, sigma: f64) -> Array2<f64> {
    gaussian_blur(arr, auto_kernel_size(sigma), sigma)
}

/// Normalized box filter with the anchor at the kernel centre.
pub fn box_blur(arr: &Array2<f64>, size: usize) -> Array2<f64> {
    let size = size.max(1);
    let (height, width) = arr.dim();
    let anchor = (size / 2) as isize;
    let norm = (size * size) as f64;
    let mut result = Array2::zeros((height, width));

    for y in 0..height {
        for x in 0..width {
            let mut sum = 0.0;
            for dy in 0..size as isize {
                let sy = reflect_101(y as isize + dy - anchor, height);
                for dx in 0..size as isize {
                    let sx = reflect_101(x as isize + dx - anchor, width);
                    sum += arr[[sy, sx]];
                }
            }
            result[[y, x]] = sum / norm;
        }
    }

    result
}

/// 3x3 aperture Laplacian (`[[2,0,2],[0,-8,0],[2,0,2]]`).
pub fn laplacian_3x3(arr: &Array2<f64>) -> Array2<f64> {
    let kernel = [[2.0, 0.0, 2.0], [0.0, -8.0, 0.0], [2.0, 0.0, 2.0]];
    let (height, width) = arr.dim();
    let mut result = Array2::zeros((height, width));

    for y in 0..height {
        for x in 0..width {
            let mut sum = 0.0;
            for (ky, row) in kernel.iter().enumerate() {
                let sy = reflect_101(y as isize + ky as isize - 1, height);
                for (kx, weight) in row.iter().enumerate() {
                    let sx = reflect_101(x as isize + kx as isize - 1, width);
                    sum += arr[[sy, sx]] * weight;
                }
            }
            result[[y, x]] = sum;
        }
    }

    result
}

/// Percentile with linear interpolation between closest ranks.
pub fn percentile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    percentile_sorted(&sorted, q)
}

pub fn percentile_sorted(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let pos = (q / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    let frac = pos - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * frac
}

pub fn map_percentile(arr: &Array2<f64>, q: f64) -> f64 {
    percentile(&arr.iter().copied().collect::<Vec<_>>(), q)
}

pub fn mean_and_std(arr: &Array2<f64>) -> (f64, f64) {
    let n = arr.len().max(1) as f64;
    let mean = arr.sum() / n;
    let variance = arr.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

pub fn fraction_true(mask: &Array2<bool>) -> f64 {
    if mask.is_empty() {
        return 0.0;
    }
    mask.iter().filter(|&&m| m).count() as f64 / mask.len() as f64
}

/// Area of the largest 8-connected foreground component over the mask area.
pub fn largest_component_ratio(mask: &Array2<bool>) -> f64 {
    let (height, width) = mask.dim();
    if height == 0 || width == 0 {
        return 0.0;
    }

    let mut binary = GrayImage::new(width as u32, height as u32);
    for ((y, x), &on) in mask.indexed_iter() {
        if on {
            binary.put_pixel(x as u32, y as u32, Luma([255]));
        }
    }

    let labels = connected_components(&binary, Connectivity::Eight, Luma([0u8]));
    let mut areas: Vec<usize> = Vec::new();
    for pixel in labels.pixels() {
        let label = pixel[0] as usize;
        if label == 0 {
            continue;
        }
        if areas.len() < label {
            areas.resize(label, 0);
        }
        areas[label - 1] += 1;
    }

    areas.into_iter().max().unwrap_or(0) as f64 / mask.len() as f64
}

/// Scales a map into [0, 1] by its 99th percentile.
pub fn normalize_by_p99(arr: &Array2<f64>, absolute: bool) -> Array2<f64> {
    let base = if absolute {
        arr.mapv(f64::abs)
    } else {
        arr.mapv(|v| v.max(0.0))
    };
    let max_v = map_percentile(&base, 99.0);
    if !(max_v > 1e-8) {
        return Array2::zeros(base.dim());
    }
    base.mapv(|v| (v / max_v).clamp(0.0, 1.0))
}

pub fn min_max_normalize(arr: &Array2<f64>) -> Array2<f64> {
    let min = arr.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = arr.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    arr.mapv(|v| (v - min) / (max - min + 1e-6))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn percentile_interpolates_between_ranks() {
        let values = [1.0, 2.0, 3.0, 4.0];
        assert!((percentile(&values, 50.0) - 2.5).abs() < 1e-12);
        assert!((percentile(&values, 100.0) - 4.0).abs() < 1e-12);
        assert!((percentile(&values, 0.0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn gaussian_kernel_is_normalized_and_symmetric() {
        let kernel = gaussian_kernel(5, 1.2);
        assert_eq!(kernel.len(), 5);
        assert!((kernel.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!((kernel[0] - kernel[4]).abs() < 1e-12);
    }

    #[test]
    fn blur_preserves_constant_maps() {
        let arr = Array2::from_elem((9, 7), 3.5);
        let blurred = gaussian_blur_sigma(&arr, 1.0);
        assert!(blurred.iter().all(|v| (v - 3.5).abs() < 1e-9));
        let boxed = box_blur(&arr, 8);
        assert!(boxed.iter().all(|v| (v - 3.5).abs() < 1e-9));
    }

    #[test]
    fn largest_component_counts_diagonal_neighbours() {
        let mask = array![
            [true, false, false, false],
            [false, true, false, false],
            [false, false, false, true],
            [false, false, false, false]
        ];
        assert!((largest_component_ratio(&mask) - 2.0 / 16.0).abs() < 1e-12);
        assert_eq!(largest_component_ratio(&Array2::from_elem((3, 3), false)), 0.0);
    }

    #[test]
    fn reflect_101_mirrors_without_edge_repeat() {
        assert_eq!(reflect_101(-1, 5), 1);
        assert_eq!(reflect_101(-2, 5), 2);
        assert_eq!(reflect_101(5, 5), 3);
        assert_eq!(reflect_101(6, 5), 2);
    }
}
