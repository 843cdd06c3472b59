use image::RgbImage;
use ndarray::{Array2, s};
use serde::{Deserialize, Serialize};

use crate::{
    analysis::{Features, SignalOutput, check_dimensions, clip01},
    error::{ForensicsError, Result},
    image_utils,
    report::visualization::ColorScheme,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CfaConfig {
    pub window_size: usize,
    /// Inconsistency above which a pixel counts towards the hotspot mask.
    pub variance_threshold: f64,
    pub smooth_sigma: f64,
}

impl Default for CfaConfig {
    fn default() -> Self {
        Self {
            window_size: 7,
            variance_threshold: 0.6,
            smooth_sigma: 1.0,
        }
    }
}

impl CfaConfig {
    pub fn validate(&self) -> Result<()> {
        if self.window_size == 0 {
            return Err(ForensicsError::InvalidConfig("cfa.window_size must be positive".into()));
        }
        if !self.smooth_sigma.is_finite() {
            return Err(ForensicsError::InvalidConfig("cfa.smooth_sigma must be finite".into()));
        }
        Ok(())
    }
}

/// Positions of a 2x2 Bayer tile, as (row offset, column offset).
const PHASES: [(usize, usize); 4] = [(0, 0), (0, 1), (1, 0), (1, 1)];

pub struct CfaAnalyzer {
    config: CfaConfig,
}

impl CfaAnalyzer {
    pub fn new() -> Self {
        Self {
            config: CfaConfig::default(),
        }
    }

    pub fn with_config(config: CfaConfig) -> Self {
        Self { config }
    }

    pub fn analyze(&self, image: &RgbImage, with_map: bool) -> Result<SignalOutput> {
        let (width, height) = image.dimensions();
        check_dimensions(width, height)?;

        let gray = image_utils::rgb_to_luma(image);
        let demosaic_err = Self::demosaic_error(&gray);
        let local_var = self.local_variance(&demosaic_err);

        let phase_means = Self::phase_means(&local_var);
        let mut inconsistency = Array2::zeros(local_var.dim());
        for ((y, x), &v) in local_var.indexed_iter() {
            let expected = phase_means[(y % 2) * 2 + (x % 2)];
            inconsistency[[y, x]] = (v - expected).abs() / (expected + 1e-6);
        }
        let cfa_map =
            image_utils::gaussian_blur_sigma(&inconsistency, self.config.smooth_sigma.max(0.1));

        let threshold = self.config.variance_threshold;
        let high_mask = cfa_map.mapv(|v| v >= threshold);

        let phase_mean = phase_means.iter().sum::<f64>() / 4.0;
        let phase_std =
            (phase_means.iter().map(|p| (p - phase_mean).powi(2)).sum::<f64>() / 4.0).sqrt();
        let (mean, std) = image_utils::mean_and_std(&cfa_map);

        let mut features = Features::new();
        features.push("cfa_var_mean", mean);
        features.push("cfa_var_std", std);
        features.push("cfa_p95_inconsistency", image_utils::map_percentile(&cfa_map, 95.0));
        features.push("cfa_high_inconsistency_ratio", image_utils::fraction_true(&high_mask));
        features.push(
            "cfa_largest_hotspot_ratio",
            image_utils::largest_component_ratio(&high_mask),
        );
        features.push("cfa_phase_dispersion", phase_std / (phase_mean + 1e-6));

        let display = with_map
            .then(|| (image_utils::normalize_by_p99(&cfa_map, false), ColorScheme::Turbo));
        SignalOutput::with_rendering(features, cfa_map, display)
    }

    /// Disagreement between horizontal and vertical neighbour interpolation,
    /// wrapping around the image borders.
    fn demosaic_error(gray: &Array2<f64>) -> Array2<f64> {
        let (height, width) = gray.dim();
        Array2::from_shape_fn((height, width), |(y, x)| {
            let left = gray[[y, (x + width - 1) % width]];
            let right = gray[[y, (x + 1) % width]];
            let up = gray[[(y + height - 1) % height, x]];
            let down = gray[[(y + 1) % height, x]];
            (0.5 * (left + right) - 0.5 * (up + down)).abs()
        })
    }

    fn local_variance(&self, values: &Array2<f64>) -> Array2<f64> {
        let k = self.config.window_size | 1;
        let mean = image_utils::gaussian_blur(values, k, 0.0);
        let mean_sq = image_utils::gaussian_blur(&values.mapv(|v| v * v), k, 0.0);
        let mut var = mean_sq - &mean * &mean;
        var.mapv_inplace(|v| v.max(0.0));
        var
    }

    fn phase_means(local_var: &Array2<f64>) -> [f64; 4] {
        PHASES.map(|(dy, dx)| {
            let phase = local_var.slice(s![dy..;2, dx..;2]);
            phase.mean().unwrap_or(0.0)
        })
    }
}

impl Default for CfaAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

pub fn simple_score(features: &Features) -> f64 {
    let score = 0.30 * features.get_or_zero("cfa_high_inconsistency_ratio")
        + 0.20 * features.get_or_zero("cfa_largest_hotspot_ratio")
        + 0.25 * (features.get_or_zero("cfa_p95_inconsistency") / 3.0).min(1.0)
        + 0.25 * (features.get_or_zero("cfa_phase_dispersion") / 1.5).min(1.0);
    clip01(score)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn flat_image_is_consistent() {
        let flat = RgbImage::from_pixel(32, 32, Rgb([120, 60, 30]));
        let output = CfaAnalyzer::new().analyze(&flat, true).unwrap();
        assert!(output.features.get("cfa_var_mean").unwrap().abs() < 1e-9);
        assert_eq!(output.features.get("cfa_high_inconsistency_ratio"), Some(0.0));
        assert!(output.png_base64.is_some());
    }

    #[test]
    fn phase_means_follow_bayer_layout() {
        let var = Array2::from_shape_fn((4, 4), |(y, x)| ((y % 2) * 2 + (x % 2)) as f64);
        assert_eq!(CfaAnalyzer::phase_means(&var), [0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn demosaic_error_wraps_borders() {
        let gray = Array2::from_shape_fn((3, 3), |(_, x)| x as f64);
        let err = CfaAnalyzer::demosaic_error(&gray);
        // column 0: horizontal neighbours are columns 2 and 1
        assert!((err[[0, 0]] - 1.5).abs() < 1e-12);
        assert!((err[[0, 1]] - 0.0).abs() < 1e-12);
    }

    #[test]
    fn score_stays_in_unit_range() {
        let image = RgbImage::from_fn(40, 40, |x, y| Rgb([(x * 6) as u8, (y * 6) as u8, ((x ^ y) * 4) as u8]));
        let output = CfaAnalyzer::new().analyze(&image, false).unwrap();
        let score = simple_score(&output.features);
        assert!((0.0..=1.0).contains(&score));
        assert_eq!(output.features.len(), 6);
    }
}
