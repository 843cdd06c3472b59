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
pub struct ElaConfig {
    pub jpeg_quality: u8,
    /// Residual level (0..255 scale) above which a pixel counts as "high".
    pub high_threshold: f64,
    pub smooth_blur_kernel: usize,
}

impl Default for ElaConfig {
    fn default() -> Self {
        Self {
            jpeg_quality: 90,
            high_threshold: 10.0,
            smooth_blur_kernel: 5,
        }
    }
}

impl ElaConfig {
    pub fn validate(&self) -> Result<()> {
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(ForensicsError::InvalidConfig(format!(
                "ela.jpeg_quality must be in 1..=100, got {}",
                self.jpeg_quality
            )));
        }
        if self.smooth_blur_kernel == 0 {
            return Err(ForensicsError::InvalidConfig(
                "ela.smooth_blur_kernel must be positive".into(),
            ));
        }
        Ok(())
    }
}

pub struct ElaAnalyzer {
    config: ElaConfig,
}

impl ElaAnalyzer {
    pub fn new() -> Self {
        Self {
            config: ElaConfig::default(),
        }
    }

    pub fn with_config(config: ElaConfig) -> Self {
        Self { config }
    }

    pub fn analyze(&self, image: &RgbImage, with_heatmap: bool) -> Result<SignalOutput> {
        let (width, height) = image.dimensions();
        check_dimensions(width, height)?;

        let recompressed = image_utils::recompress_jpeg(image, self.config.jpeg_quality)?;
        let residual = Self::residual_map(image, &recompressed);

        let threshold = self.config.high_threshold;
        let high_mask = residual.mapv(|v| v >= threshold);
        let kernel = self.config.smooth_blur_kernel | 1;
        let smoothed = image_utils::gaussian_blur(&residual, kernel, 1.2);
        let smooth_high_mask = smoothed.mapv(|v| v >= threshold);

        let (mean, std) = image_utils::mean_and_std(&residual);

        let mut features = Features::new();
        features.push("ela_mean_residual", mean);
        features.push("ela_std_residual", std);
        features.push("ela_p95_residual", image_utils::map_percentile(&residual, 95.0));
        features.push("ela_high_residual_ratio", image_utils::fraction_true(&high_mask));
        features.push(
            "ela_smooth_high_residual_ratio",
            image_utils::fraction_true(&smooth_high_mask),
        );
        features.push(
            "ela_largest_hotspot_ratio",
            image_utils::largest_component_ratio(&high_mask),
        );

        let display = with_heatmap.then(|| {
            (
                residual.mapv(|v| (v * 4.0).clamp(0.0, 255.0) / 255.0),
                ColorScheme::HeatMap,
            )
        });
        SignalOutput::with_rendering(features, residual, display)
    }

    /// Per-pixel absolute difference averaged over the three channels.
    fn residual_map(original: &RgbImage, recompressed: &RgbImage) -> Array2<f64> {
        let (width, height) = original.dimensions();
        let mut residual = Array2::zeros((height as usize, width as usize));

        for (x, y, orig) in original.enumerate_pixels() {
            let recomp = recompressed.get_pixel(x, y);
            let sum: f64 = (0..3)
                .map(|c| (orig[c] as f64 - recomp[c] as f64).abs())
                .sum();
            residual[[y as usize, x as usize]] = sum / 3.0;
        }

        residual
    }
}

impl Default for ElaAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

pub fn simple_score(features: &Features) -> f64 {
    let score = 0.35 * features.get_or_zero("ela_high_residual_ratio")
        + 0.25 * features.get_or_zero("ela_smooth_high_residual_ratio")
        + 0.20 * features.get_or_zero("ela_largest_hotspot_ratio")
        + 0.20 * (features.get_or_zero("ela_p95_residual") / 80.0).min(1.0);
    clip01(score)
}

/// Names of the three features with the largest magnitude.
pub fn top_signals(features: &Features) -> Vec<String> {
    features.largest_magnitude(3)
}
