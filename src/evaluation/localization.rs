use std::{collections::BTreeMap, path::Path};

use image::imageops::{self, FilterType};
use ndarray::{Array2, Zip};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    ForensicsAnalyzer,
    config::LabConfig,
    error::{ForensicsError, Result},
    features::FeatureRow,
    image_utils,
};

const PIXEL_THRESHOLD: f64 = 0.5;

/// Pixel-level agreement between a predicted map and a ground-truth mask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalizationMetrics {
    pub iou: f64,
    pub dice: f64,
    pub pixel_f1: f64,
    pub pixel_precision: f64,
    pub pixel_recall: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalizationRow {
    pub method: String,
    pub iou: f64,
    pub dice: f64,
    pub pixel_f1: f64,
    pub pixel_precision: f64,
    pub pixel_recall: f64,
}

fn ratio(num: f64, den: f64) -> f64 {
    if den > 0.0 { num / den } else { 0.0 }
}

/// Binarizes both maps at `threshold` and scores the overlap.
pub fn compute_localization_metrics(
    pred_map: &Array2<f64>,
    gt_mask: &Array2<f64>,
    threshold: f64,
) -> Result<LocalizationMetrics> {
    if pred_map.dim() != gt_mask.dim() {
        return Err(ForensicsError::InvalidParameter(format!(
            "prediction map {:?} does not match mask {:?}",
            pred_map.dim(),
            gt_mask.dim()
        )));
    }

    let (mut tp, mut fp, mut fn_) = (0.0, 0.0, 0.0);
    Zip::from(pred_map).and(gt_mask).for_each(|&p, &g| {
        match (p >= threshold, g >= threshold) {
            (true, true) => tp += 1.0,
            (true, false) => fp += 1.0,
            (false, true) => fn_ += 1.0,
            (false, false) => {}
        }
    });

    let precision = ratio(tp, tp + fp);
    let recall = ratio(tp, tp + fn_);
    Ok(LocalizationMetrics {
        iou: ratio(tp, tp + fp + fn_),
        dice: ratio(2.0 * tp, 2.0 * tp + fp + fn_),
        pixel_f1: ratio(2.0 * precision * recall, precision + recall),
        pixel_precision: precision,
        pixel_recall: recall,
    })
}

/// Loads a grayscale mask at the experiment size, scaled to [0, 1].
/// Returns `None` when the file does not exist.
pub fn load_mask<P: AsRef<Path>>(path: P, image_size: [u32; 2]) -> Result<Option<Array2<f64>>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(None);
    }
    let [height, width] = image_size;
    let gray = image::open(path)?.to_luma8();
    let resized = imageops::resize(&gray, width, height, FilterType::Nearest);
    Ok(Some(image_utils::gray_to_array(&resized).mapv(|v| (v / 255.0).clamp(0.0, 1.0))))
}

fn score_image(
    analyzer: &ForensicsAnalyzer,
    row: &FeatureRow,
    mask_path: &str,
    image_size: [u32; 2],
) -> Result<Vec<(&'static str, LocalizationMetrics)>> {
    let Some(mask) = load_mask(mask_path, image_size)? else {
        log::debug!("Mask {} missing, skipping {}", mask_path, row.image_path);
        return Ok(Vec::new());
    };

    let image = image_utils::load_rgb_image(&row.image_path, image_size)?;
    let cfa_map = analyzer.cfa(&image, false)?.normalized_map();
    let prnu_abs = image_utils::min_max_normalize(&analyzer.prnu(&image, false)?.map.mapv(f64::abs));
    let mantra_mask = analyzer.mantra(&image, false)?.normalized_map();

    [
        ("cfa_map", cfa_map),
        ("prnu_residual_abs", prnu_abs),
        ("mantra_mask", mantra_mask),
    ]
    .into_iter()
    .map(|(method, map)| compute_localization_metrics(&map, &mask, PIXEL_THRESHOLD).map(|m| (method, m)))
    .collect()
}

/// Mean pixel metrics per map type over test images that carry a mask.
///
/// Returns an empty table when no image is usable.
pub fn run_localization_suite(test_rows: &[FeatureRow], config: &LabConfig) -> Vec<LocalizationRow> {
    let analyzer = ForensicsAnalyzer::with_config(config.features.clone());
    let image_size = config.experiment.image_size;

    let scored: Vec<(&'static str, LocalizationMetrics)> = test_rows
        .par_iter()
        .filter_map(|row| row.mask_path.as_deref().map(|mask| (row, mask)))
        .flat_map_iter(|(row, mask)| match score_image(&analyzer, row, mask, image_size) {
            Ok(scores) => scores,
            Err(e) => {
                log::warn!("Localization eval failed for {}: {}", row.image_path, e);
                Vec::new()
            }
        })
        .collect();

    let mut sums: BTreeMap<&'static str, (LocalizationMetrics, usize)> = BTreeMap::new();
    for (method, m) in scored {
        let (acc, count) = sums.entry(method).or_default();
        acc.iou += m.iou;
        acc.dice += m.dice;
        acc.pixel_f1 += m.pixel_f1;
        acc.pixel_precision += m.pixel_precision;
        acc.pixel_recall += m.pixel_recall;
        *count += 1;
    }

    sums.into_iter()
        .map(|(method, (acc, count))| {
            let n = count as f64;
            LocalizationRow {
                method: method.to_string(),
                iou: acc.iou / n,
                dice: acc.dice / n,
                pixel_f1: acc.pixel_f1 / n,
                pixel_precision: acc.pixel_precision / n,
                pixel_recall: acc.pixel_recall / n,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn perfect_overlap_scores_one() {
        let mask = array![[0.0, 1.0], [1.0, 0.0]];
        let m = compute_localization_metrics(&mask, &mask, 0.5).unwrap();
        assert_eq!(m.iou, 1.0);
        assert_eq!(m.dice, 1.0);
        assert_eq!(m.pixel_f1, 1.0);
    }

    #[test]
    fn partial_overlap() {
        let pred = array![[0.9, 0.8], [0.1, 0.0]];
        let gt = array![[1.0, 0.0], [1.0, 0.0]];
        let m = compute_localization_metrics(&pred, &gt, 0.5).unwrap();
        assert_relative_eq!(m.iou, 1.0 / 3.0);
        assert_relative_eq!(m.dice, 0.5);
        assert_relative_eq!(m.pixel_precision, 0.5);
        assert_relative_eq!(m.pixel_recall, 0.5);
        assert_relative_eq!(m.pixel_f1, m.dice);
    }

    #[test]
    fn empty_prediction_scores_zero() {
        let pred = Array2::zeros((3, 3));
        let gt = Array2::ones((3, 3));
        let m = compute_localization_metrics(&pred, &gt, 0.5).unwrap();
        assert_eq!(m, LocalizationMetrics::default());
    }

    #[test]
    fn shape_mismatch_is_an_error() {
        let a = Array2::<f64>::zeros((2, 2));
        let b = Array2::<f64>::zeros((3, 2));
        assert!(compute_localization_metrics(&a, &b, 0.5).is_err());
    }

    #[test]
    fn missing_mask_file_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        let mask = load_mask(dir.path().join("nope.png"), [32, 32]).unwrap();
        assert!(mask.is_none());
    }

    #[test]
    fn mask_is_resized_and_scaled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mask.png");
        image::GrayImage::from_fn(8, 8, |x, _| image::Luma([if x < 4 { 0 } else { 255 }]))
            .save(&path)
            .unwrap();

        let mask = load_mask(&path, [16, 32]).unwrap().unwrap();
        assert_eq!(mask.dim(), (16, 32));
        assert_eq!(mask[[0, 0]], 0.0);
        assert_eq!(mask[[15, 31]], 1.0);
    }

    #[test]
    fn rows_without_masks_give_empty_table() {
        let row = FeatureRow {
            image_path: "missing.png".into(),
            label: 1,
            split: crate::features::Split::Test,
            source_dataset: "synthetic".into(),
            perturbation_tag: "clean".into(),
            mask_path: None,
            values: vec![],
        };
        assert!(run_localization_suite(&[row], &LabConfig::default()).is_empty());
    }
}
