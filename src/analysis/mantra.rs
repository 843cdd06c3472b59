use image::RgbImage;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::{
    analysis::{Features, SignalOutput, check_dimensions, clip01},
    error::{ForensicsError, Result},
    image_utils,
    report::visualization::ColorScheme,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MantraConfig {
    pub heuristic_sigma: f64,
    pub high_threshold: f64,
    pub top_k_percentile: f64,
}

impl Default for MantraConfig {
    fn default() -> Self {
        Self {
            heuristic_sigma: 1.2,
            high_threshold: 0.65,
            top_k_percentile: 93.0,
        }
    }
}

impl MantraConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=100.0).contains(&self.top_k_percentile) {
            return Err(ForensicsError::InvalidConfig(format!(
                "mantra.top_k_percentile must be in [0, 100], got {}",
                self.top_k_percentile
            )));
        }
        Ok(())
    }
}

/// Heuristic manipulation-localization mask built from high-frequency
/// energy, Laplacian response and blockiness.
pub struct MantraAnalyzer {
    config: MantraConfig,
}

impl MantraAnalyzer {
    pub fn new() -> Self {
        Self {
            config: MantraConfig::default(),
        }
    }

    pub fn with_config(config: MantraConfig) -> Self {
        Self { config }
    }

    pub fn analyze(&self, image: &RgbImage, with_mask: bool) -> Result<SignalOutput> {
        let (width, height) = image.dimensions();
        check_dimensions(width, height)?;

        let mask = self.heuristic_mask(image);
        let values: Vec<f64> = mask.iter().copied().collect();

        let cutoff = image_utils::percentile(&values, self.config.top_k_percentile);
        let top: Vec<f64> = values.iter().copied().filter(|&v| v >= cutoff).collect();
        let (mean, std) = image_utils::mean_and_std(&mask);
        let top_mean = if top.is_empty() {
            mean
        } else {
            top.iter().sum::<f64>() / top.len() as f64
        };
        let high = mask.mapv(|v| v >= self.config.high_threshold);

        let mut features = Features::new();
        features.push("mantra_score", top_mean.clamp(0.0, 1.0));
        features.push("mantra_mask_mean", mean);
        features.push("mantra_mask_std", std);
        features.push("mantra_mask_p95", image_utils::percentile(&values, 95.0));
        features.push("mantra_high_ratio", image_utils::fraction_true(&high));
        // Only the heuristic backend exists; the column keeps the table schema stable.
        features.push("mantra_backend_torchscript", 0.0);

        let display = with_mask
            .then(|| (image_utils::normalize_by_p99(&mask, false), ColorScheme::Plasma));
        SignalOutput::with_rendering(features, mask, display)
    }

    fn heuristic_mask(&self, image: &RgbImage) -> Array2<f64> {
        let gray = image_utils::rgb_to_luma(image);
        let blur = image_utils::gaussian_blur_sigma(&gray, self.config.heuristic_sigma.max(0.1));
        let highpass = (&gray - &blur).mapv(f64::abs);
        let lap = image_utils::laplacian_3x3(&gray).mapv(f64::abs);
        let block = (&highpass - &image_utils::box_blur(&highpass, 8)).mapv(f64::abs);

        let mask = image_utils::normalize_by_p99(&highpass, false) * 0.45
            + image_utils::normalize_by_p99(&lap, false) * 0.35
            + image_utils::normalize_by_p99(&block, false) * 0.20;
        image_utils::gaussian_blur_sigma(&mask, 0.8)
    }
}

impl Default for MantraAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

pub fn simple_score(features: &Features) -> f64 {
    let score = 0.45 * features.get_or_zero("mantra_score")
        + 0.25 * features.get_or_zero("mantra_mask_p95")
        + 0.20 * features.get_or_zero("mantra_high_ratio")
        + 0.10 * features.get_or_zero("mantra_mask_std");
    clip01(score)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn flat_image_yields_empty_mask() {
        let flat = RgbImage::from_pixel(32, 32, Rgb([200, 200, 200]));
        let output = MantraAnalyzer::new().analyze(&flat, false).unwrap();
        assert!(output.map.iter().all(|v| v.abs() < 1e-9));
        assert_eq!(output.features.get("mantra_backend_torchscript"), Some(0.0));
        assert_eq!(simple_score(&output.features), 0.0);
    }

    #[test]
    fn pasted_patch_lights_up_its_edges() {
        let image = RgbImage::from_fn(48, 48, |x, y| {
            if (16..32).contains(&x) && (16..32).contains(&y) {
                Rgb([250, 250, 250])
            } else {
                Rgb([20, 20, 20])
            }
        });
        let output = MantraAnalyzer::new().analyze(&image, true).unwrap();
        assert!(output.map[[16, 24]] > output.map[[2, 2]]);
        assert!(output.features.get("mantra_score").unwrap() > 0.0);
        assert!(output.png_base64.is_some());
    }
}
