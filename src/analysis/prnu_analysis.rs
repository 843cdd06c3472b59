use image::RgbImage;
use ndarray::{Array2, Axis, s};
use serde::{Deserialize, Serialize};

use crate::{
    analysis::{
        Features, SignalOutput, check_dimensions, clip01,
        wavelet::{self, Decomposition, Subbands, Wavelet},
    },
    error::{ForensicsError, Result},
    image_utils,
    report::visualization::ColorScheme,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrnuConfig {
    pub wavelet: Wavelet,
    pub level: usize,
}

impl Default for PrnuConfig {
    fn default() -> Self {
        Self {
            wavelet: Wavelet::Db4,
            level: 2,
        }
    }
}

impl PrnuConfig {
    pub fn validate(&self) -> Result<()> {
        if self.level == 0 {
            return Err(ForensicsError::InvalidConfig("prnu.level must be at least 1".into()));
        }
        Ok(())
    }
}

pub struct PrnuAnalyzer {
    config: PrnuConfig,
}

impl PrnuAnalyzer {
    pub fn new() -> Self {
        Self {
            config: PrnuConfig::default(),
        }
    }

    pub fn with_config(config: PrnuConfig) -> Self {
        Self { config }
    }

    /// Features plus the zero-mean noise residual (`map`).
    pub fn analyze(&self, image: &RgbImage, with_map: bool) -> Result<SignalOutput> {
        let (width, height) = image.dimensions();
        check_dimensions(width, height)?;

        let gray = image_utils::rgb_to_luma(image);
        let residual = self.extract_residual(&gray)?;

        let abs_res = residual.mapv(f64::abs);
        let row_mean = residual.mean_axis(Axis(1)).unwrap_or_default();
        let col_mean = residual.mean_axis(Axis(0)).unwrap_or_default();
        let pseudo_pattern =
            Array2::from_shape_fn(residual.dim(), |(y, x)| row_mean[y] * col_mean[x]);
        let denom = frobenius(&residual) * frobenius(&pseudo_pattern);
        let pseudo_corr = if denom > 1e-8 {
            (&residual * &pseudo_pattern).sum() / denom
        } else {
            0.0
        };

        let n = residual.len() as f64;
        let residual_energy = residual.iter().map(|v| v * v).sum::<f64>() / n;
        let gray_energy = gray.iter().map(|v| v * v).sum::<f64>() / n + 1e-8;
        let p90 = image_utils::map_percentile(&abs_res, 90.0);
        let high_ratio = image_utils::fraction_true(&abs_res.mapv(|v| v >= p90));
        let (_, std) = image_utils::mean_and_std(&residual);

        let mut features = Features::new();
        features.push("prnu_residual_std", std);
        features.push("prnu_residual_energy", residual_energy);
        features.push("prnu_snr_estimate", residual_energy / gray_energy);
        features.push("prnu_row_col_corr", pseudo_corr.clamp(-1.0, 1.0));
        features.push("prnu_high_residual_ratio", high_ratio);
        features.push("prnu_p95_abs_residual", image_utils::map_percentile(&abs_res, 95.0));

        let display = with_map
            .then(|| (image_utils::normalize_by_p99(&residual, true), ColorScheme::Inferno));
        SignalOutput::with_rendering(features, residual, display)
    }

    /// Grayscale minus its wavelet-Wiener denoised version, mean-centred.
    pub fn extract_residual(&self, gray: &Array2<f64>) -> Result<Array2<f64>> {
        let denoised = self.wiener_denoise(gray)?;
        let mut residual = gray - &denoised;
        let mean = residual.mean().unwrap_or(0.0);
        residual.mapv_inplace(|v| v - mean);
        Ok(residual)
    }

    fn wiener_denoise(&self, gray: &Array2<f64>) -> Result<Array2<f64>> {
        let wavelet = self.config.wavelet;
        let decomposition = wavelet::wavedec2(gray, wavelet, self.config.level)?;
        let Some(finest) = decomposition.details.last() else {
            return Ok(gray.clone());
        };

        let noise_sigma = if finest.hh.is_empty() {
            0.0
        } else {
            let abs_hh: Vec<f64> = finest.hh.iter().map(|v| v.abs()).collect();
            image_utils::percentile(&abs_hh, 50.0) / 0.6745
        };
        let noise_var = (noise_sigma * noise_sigma).max(1e-8);

        let shrink = |band: &Array2<f64>| {
            let n = band.len().max(1) as f64;
            let mean = band.sum() / n;
            let var = band.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
            let gain = (var - noise_var).max(0.0) / (var + 1e-8);
            band * gain
        };
        let details = decomposition
            .details
            .iter()
            .map(|bands| Subbands {
                lh: shrink(&bands.lh),
                hl: shrink(&bands.hl),
                hh: shrink(&bands.hh),
            })
            .collect();

        let filtered = Decomposition {
            approx: decomposition.approx,
            details,
        };
        let denoised = wavelet::waverec2(&filtered, wavelet);
        let (height, width) = gray.dim();
        Ok(denoised.slice(s![..height, ..width]).to_owned())
    }
}

impl Default for PrnuAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

fn frobenius(arr: &Array2<f64>) -> f64 {
    arr.iter().map(|v| v * v).sum::<f64>().sqrt()
}

/// Camera fingerprint estimate: mean of residuals, zero-mean, unit norm.
pub fn build_reference(residuals: &[Array2<f64>]) -> Result<Array2<f64>> {
    let first = residuals.first().ok_or_else(|| {
        ForensicsError::InvalidParameter("at least one residual is required".into())
    })?;
    let mut reference = Array2::<f64>::zeros(first.dim());
    for residual in residuals {
        if residual.dim() != first.dim() {
            return Err(ForensicsError::InvalidParameter(
                "residual maps must share one shape".into(),
            ));
        }
        reference += residual;
    }
    reference /= residuals.len() as f64;

    let mean = reference.mean().unwrap_or(0.0);
    reference.mapv_inplace(|v| v - mean);
    let norm = frobenius(&reference);
    if norm > 1e-8 {
        reference /= norm;
    }
    Ok(reference)
}

/// Normalized cross-correlation in [-1, 1]; 0 when either side is flat.
pub fn correlate_with_reference(residual: &Array2<f64>, reference: &Array2<f64>) -> Result<f64> {
    if residual.dim() != reference.dim() {
        return Err(ForensicsError::InvalidParameter(
            "residual and reference must have the same shape".into(),
        ));
    }
    let a_mean = residual.mean().unwrap_or(0.0);
    let b_mean = reference.mean().unwrap_or(0.0);
    let a = residual.mapv(|v| v - a_mean);
    let b = reference.mapv(|v| v - b_mean);
    let denom = frobenius(&a) * frobenius(&b);
    if denom <= 1e-8 {
        return Ok(0.0);
    }
    Ok(((&a * &b).sum() / denom).clamp(-1.0, 1.0))
}

pub fn simple_score(features: &Features) -> f64 {
    let corr_penalty = 1.0 - (features.get_or_zero("prnu_row_col_corr") + 1.0) / 2.0;
    let score = 0.35 * (features.get_or_zero("prnu_snr_estimate") * 40.0).min(1.0)
        + 0.30 * (features.get_or_zero("prnu_p95_abs_residual") / 35.0).min(1.0)
        + 0.20 * features.get_or_zero("prnu_high_residual_ratio")
        + 0.15 * corr_penalty;
    clip01(score)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use image::Rgb;

    fn noisy_image() -> RgbImage {
        RgbImage::from_fn(48, 48, |x, y| {
            let v = (100 + (x * 31 + y * 17) % 23) as u8;
            Rgb([v, v, v])
        })
    }

    #[test]
    fn residual_is_mean_centred() {
        let output = PrnuAnalyzer::new().analyze(&noisy_image(), false).unwrap();
        assert_eq!(output.map.dim(), (48, 48));
        assert_abs_diff_eq!(output.map.mean().unwrap(), 0.0, epsilon = 1e-9);
        let corr = output.features.get("prnu_row_col_corr").unwrap();
        assert!((-1.0..=1.0).contains(&corr));
    }

    #[test]
    fn reference_correlates_with_its_sources() {
        let analyzer = PrnuAnalyzer::new();
        let image = noisy_image();
        let residual = analyzer.analyze(&image, false).unwrap().map;
        let reference = build_reference(&[residual.clone(), residual.clone()]).unwrap();
        assert_abs_diff_eq!(frobenius(&reference), 1.0, epsilon = 1e-9);
        let corr = correlate_with_reference(&residual, &reference).unwrap();
        assert_abs_diff_eq!(corr, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn reference_rejects_empty_and_mismatched_inputs() {
        assert!(build_reference(&[]).is_err());
        let a = Array2::zeros((4, 4));
        let b = Array2::zeros((4, 5));
        assert!(build_reference(&[a.clone(), b.clone()]).is_err());
        assert!(correlate_with_reference(&a, &b).is_err());
        assert_eq!(correlate_with_reference(&a, &a).unwrap(), 0.0);
    }
}
