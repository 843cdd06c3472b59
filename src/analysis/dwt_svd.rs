use image::RgbImage;
use nalgebra::DMatrix;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::{
    analysis::{Features, check_dimensions, clip01, wavelet::{self, Wavelet}},
    error::{ForensicsError, Result},
    image_utils,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DwtConfig {
    pub wavelet: Wavelet,
    pub level: usize,
    pub top_k_singular: usize,
}

impl Default for DwtConfig {
    fn default() -> Self {
        Self {
            wavelet: Wavelet::Haar,
            level: 2,
            top_k_singular: 8,
        }
    }
}

impl DwtConfig {
    pub fn validate(&self) -> Result<()> {
        if self.level == 0 {
            return Err(ForensicsError::InvalidConfig("dwt.level must be at least 1".into()));
        }
        if self.top_k_singular == 0 {
            return Err(ForensicsError::InvalidConfig(
                "dwt.top_k_singular must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

pub struct DwtSvdAnalyzer {
    config: DwtConfig,
}

impl DwtSvdAnalyzer {
    pub fn new() -> Self {
        Self {
            config: DwtConfig::default(),
        }
    }

    pub fn with_config(config: DwtConfig) -> Self {
        Self { config }
    }

    pub fn analyze(&self, image: &RgbImage) -> Result<Features> {
        let (width, height) = image.dimensions();
        check_dimensions(width, height)?;

        let gray = image_utils::rgb_to_luma(image);
        let decomposition = wavelet::wavedec2(&gray, self.config.wavelet, self.config.level)?;
        let top_k = self.config.top_k_singular;

        let mut features = Features::new();
        let mut detail_energies = Vec::new();
        let mut all_singular = Vec::new();

        for (i, bands) in decomposition.details.iter().enumerate() {
            for (band_name, band) in bands.named() {
                let energy = band.iter().map(|v| v * v).sum::<f64>();
                detail_energies.push(energy);
                let sv = singular_values_top_k(band, top_k);
                let (mean, std) = mean_std(&sv);

                let prefix = format!("dwt_l{}_{}", i + 1, band_name);
                features.push(format!("{prefix}_energy"), energy);
                features.push(format!("{prefix}_sv_mean"), mean);
                features.push(format!("{prefix}_sv_std"), std);
                features.push(format!("{prefix}_sv_dispersion"), std / (mean + 1e-8));
                features.push(format!("{prefix}_sv_top1"), sv[0]);
                features.push(format!("{prefix}_sv_topk_sum"), sv.iter().sum::<f64>());

                all_singular.extend(sv);
            }
        }

        let total_detail_energy = detail_energies.iter().sum::<f64>() + 1e-8;
        for (i, energy) in detail_energies.iter().enumerate() {
            features.push(format!("dwt_detail_energy_ratio_{i}"), energy / total_detail_energy);
        }

        let approx = &decomposition.approx;
        let approx_sv = singular_values_top_k(approx, top_k);
        let (approx_mean, approx_std) = mean_std(&approx_sv);
        features.push("dwt_approx_energy", approx.iter().map(|v| v * v).sum::<f64>());
        features.push("dwt_approx_sv_mean", approx_mean);
        features.push("dwt_approx_sv_std", approx_std);

        let (global_mean, global_std) = mean_std(&all_singular);
        features.push("dwt_singular_global_mean", global_mean);
        features.push("dwt_singular_global_std", global_std);
        features.push(
            "dwt_singular_global_dispersion",
            global_std / (global_mean + 1e-8),
        );

        let head = &all_singular[..top_k.min(all_singular.len())];
        let tail = &all_singular[all_singular.len().saturating_sub(top_k)..];
        features.push(
            "dwt_singular_topk_dynamic",
            mean_std(head).0 / (mean_std(tail).0 + 1e-8),
        );

        Ok(features)
    }
}

impl Default for DwtSvdAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

/// Largest `top_k` singular values in descending order, zero padded.
fn singular_values_top_k(band: &Array2<f64>, top_k: usize) -> Vec<f64> {
    let (rows, cols) = band.dim();
    let mut values: Vec<f64> = if rows == 0 || cols == 0 {
        Vec::new()
    } else {
        let matrix = DMatrix::from_fn(rows, cols, |r, c| band[[r, c]]);
        matrix.singular_values().iter().copied().collect()
    };
    values.sort_by(|a, b| b.total_cmp(a));
    values.resize(top_k, 0.0);
    values
}

fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

pub fn simple_score(features: &Features) -> f64 {
    let dispersion = features.get_or_zero("dwt_singular_global_dispersion").min(1.0);
    let dynamics = features.get_or_zero("dwt_singular_topk_dynamic").min(2.0) / 2.0;
    let ratio0 = (features.get_or_zero("dwt_detail_energy_ratio_0") * 3.0).min(1.0);
    clip01(0.45 * dispersion + 0.35 * dynamics + 0.20 * ratio0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use image::Rgb;

    fn checker(size: u32) -> RgbImage {
        RgbImage::from_fn(size, size, |x, y| {
            if (x / 4 + y / 4) % 2 == 0 {
                Rgb([220, 200, 180])
            } else {
                Rgb([30, 40, 50])
            }
        })
    }

    #[test]
    fn feature_layout_matches_levels_and_bands() {
        let config = DwtConfig {
            wavelet: Wavelet::Db2,
            level: 2,
            top_k_singular: 4,
        };
        let features = DwtSvdAnalyzer::with_config(config).analyze(&checker(32)).unwrap();
        // 2 levels x 3 bands x 6 stats + 6 ratios + 3 approx + 4 global
        assert_eq!(features.len(), 36 + 6 + 3 + 4);
        assert_eq!(features.names()[0], "dwt_l1_lh_energy");
        assert!(features.get("dwt_l2_hh_sv_topk_sum").is_some());
        let ratio_sum: f64 = (0..6)
            .map(|i| features.get(&format!("dwt_detail_energy_ratio_{i}")).unwrap())
            .sum();
        assert_abs_diff_eq!(ratio_sum, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn singular_values_are_sorted_and_padded() {
        let band = Array2::from_shape_fn((2, 3), |(r, c)| if r == c { (r + 1) as f64 } else { 0.0 });
        let sv = singular_values_top_k(&band, 4);
        assert_eq!(sv.len(), 4);
        assert_abs_diff_eq!(sv[0], 2.0, epsilon = 1e-10);
        assert_abs_diff_eq!(sv[1], 1.0, epsilon = 1e-10);
        assert_eq!(sv[3], 0.0);
    }

    #[test]
    fn flat_image_scores_low() {
        let flat = RgbImage::from_pixel(32, 32, Rgb([90, 90, 90]));
        let features = DwtSvdAnalyzer::new().analyze(&flat).unwrap();
        assert!(simple_score(&features) < 0.5);
    }
}
