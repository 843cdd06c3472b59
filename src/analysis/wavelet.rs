//! Orthogonal discrete wavelet transforms with half-sample symmetric
//! boundary extension.
//!
//! Coefficient layout follows the usual multilevel convention: one
//! approximation band at the coarsest level, followed by detail triplets
//! ordered from the coarsest level to the finest.

use std::f64::consts::FRAC_1_SQRT_2;

use ndarray::{Array1, Array2, Axis, s};
use serde::{Deserialize, Serialize};

use crate::error::{ForensicsError, Result};

const HAAR: [f64; 2] = [FRAC_1_SQRT_2, FRAC_1_SQRT_2];

const DB2: [f64; 4] = [
    -0.12940952255092145,
    0.22414386804185735,
    0.836516303737469,
    0.48296291314469025,
];

const DB4: [f64; 8] = [
    -0.010597401784997278,
    0.032883011666982945,
    0.030841381835986965,
    -0.18703481171888114,
    -0.02798376941698385,
    0.6308807679295904,
    0.7148465705525415,
    0.23037781330885523,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Wavelet {
    Haar,
    Db2,
    Db4,
}

impl Wavelet {
    pub fn dec_lo(&self) -> &'static [f64] {
        match self {
            Wavelet::Haar => &HAAR,
            Wavelet::Db2 => &DB2,
            Wavelet::Db4 => &DB4,
        }
    }

    pub fn filter_len(&self) -> usize {
        self.dec_lo().len()
    }

    /// Quadrature mirror of the low-pass decomposition filter.
    pub fn dec_hi(&self) -> Vec<f64> {
        let lo = self.dec_lo();
        let len = lo.len();
        (0..len)
            .map(|k| {
                let sign = if k % 2 == 0 { -1.0 } else { 1.0 };
                sign * lo[len - 1 - k]
            })
            .collect()
    }

    pub fn rec_lo(&self) -> Vec<f64> {
        self.dec_lo().iter().rev().copied().collect()
    }

    pub fn rec_hi(&self) -> Vec<f64> {
        self.dec_hi().into_iter().rev().collect()
    }

    /// Deepest useful decomposition level for a signal of `len` samples.
    pub fn max_level(&self, len: usize) -> usize {
        let filter_len = self.filter_len();
        if len < filter_len - 1 || filter_len < 2 {
            return 0;
        }
        ((len as f64) / (filter_len - 1) as f64).log2().floor() as usize
    }
}

/// Detail bands of one level: horizontal, vertical and diagonal.
#[derive(Debug, Clone)]
pub struct Subbands {
    pub lh: Array2<f64>,
    pub hl: Array2<f64>,
    pub hh: Array2<f64>,
}

impl Subbands {
    pub fn named(&self) -> [(&'static str, &Array2<f64>); 3] {
        [("lh", &self.lh), ("hl", &self.hl), ("hh", &self.hh)]
    }
}

#[derive(Debug, Clone)]
pub struct Decomposition {
    pub approx: Array2<f64>,
    /// Coarsest level first.
    pub details: Vec<Subbands>,
}

fn symmetric_index(idx: isize, len: usize) -> usize {
    let period = 2 * len as isize;
    let i = idx.rem_euclid(period);
    if i < len as isize {
        i as usize
    } else {
        (period - 1 - i) as usize
    }
}

fn analysis_filter(signal: &[f64], filter: &[f64]) -> Vec<f64> {
    let n = signal.len();
    let out_len = (n + filter.len() - 1) / 2;
    (0..out_len)
        .map(|m| {
            filter
                .iter()
                .enumerate()
                .map(|(j, h)| h * signal[symmetric_index(2 * m as isize + 1 - j as isize, n)])
                .sum()
        })
        .collect()
}

pub fn dwt1(signal: &[f64], wavelet: Wavelet) -> (Vec<f64>, Vec<f64>) {
    if signal.is_empty() {
        return (Vec::new(), Vec::new());
    }
    (
        analysis_filter(signal, wavelet.dec_lo()),
        analysis_filter(signal, &wavelet.dec_hi()),
    )
}

pub fn idwt1(approx: &[f64], detail: &[f64], wavelet: Wavelet) -> Vec<f64> {
    let rec_lo = wavelet.rec_lo();
    let rec_hi = wavelet.rec_hi();
    let filter_len = rec_lo.len() as isize;
    let n = approx.len().min(detail.len()) as isize;
    let out_len = (2 * n - filter_len + 2).max(0);

    (0..out_len)
        .map(|t| {
            let q = t + filter_len - 2;
            let mut sum = 0.0;
            for m in 0..n {
                let k = q - 2 * m;
                if k < 0 {
                    break;
                }
                if k < filter_len {
                    sum += rec_lo[k as usize] * approx[m as usize]
                        + rec_hi[k as usize] * detail[m as usize];
                }
            }
            sum
        })
        .collect()
}

fn dwt_along(data: &Array2<f64>, axis: Axis, wavelet: Wavelet) -> (Array2<f64>, Array2<f64>) {
    let lanes: Vec<(Vec<f64>, Vec<f64>)> = data
        .lanes(axis)
        .into_iter()
        .map(|lane| dwt1(&lane.to_vec(), wavelet))
        .collect();
    (
        stack_lanes(lanes.iter().map(|(a, _)| a.as_slice()), axis),
        stack_lanes(lanes.iter().map(|(_, d)| d.as_slice()), axis),
    )
}

fn idwt_along(approx: &Array2<f64>, detail: &Array2<f64>, axis: Axis, wavelet: Wavelet) -> Array2<f64> {
    let lanes: Vec<Vec<f64>> = approx
        .lanes(axis)
        .into_iter()
        .zip(detail.lanes(axis))
        .map(|(a, d)| idwt1(&a.to_vec(), &d.to_vec(), wavelet))
        .collect();
    stack_lanes(lanes.iter().map(Vec::as_slice), axis)
}

/// Reassembles 1-D lanes into a matrix whose `axis` runs along each lane.
fn stack_lanes<'a>(lanes: impl Iterator<Item = &'a [f64]>, axis: Axis) -> Array2<f64> {
    let lanes: Vec<&[f64]> = lanes.collect();
    let count = lanes.len();
    let len = lanes.first().map_or(0, |l| l.len());
    let mut out = if axis == Axis(0) {
        Array2::zeros((len, count))
    } else {
        Array2::zeros((count, len))
    };
    for (i, lane) in lanes.iter().enumerate() {
        let lane = Array1::from(lane.to_vec());
        if axis == Axis(0) {
            out.column_mut(i).assign(&lane);
        } else {
            out.row_mut(i).assign(&lane);
        }
    }
    out
}

pub fn dwt2(data: &Array2<f64>, wavelet: Wavelet) -> (Array2<f64>, Subbands) {
    let (lo0, hi0) = dwt_along(data, Axis(0), wavelet);
    let (aa, ad) = dwt_along(&lo0, Axis(1), wavelet);
    let (da, dd) = dwt_along(&hi0, Axis(1), wavelet);
    (
        aa,
        Subbands {
            lh: da,
            hl: ad,
            hh: dd,
        },
    )
}

pub fn idwt2(approx: &Array2<f64>, bands: &Subbands, wavelet: Wavelet) -> Array2<f64> {
    let lo0 = idwt_along(approx, &bands.hl, Axis(1), wavelet);
    let hi0 = idwt_along(&bands.lh, &bands.hh, Axis(1), wavelet);
    idwt_along(&lo0, &hi0, Axis(0), wavelet)
}

pub fn wavedec2(data: &Array2<f64>, wavelet: Wavelet, level: usize) -> Result<Decomposition> {
    if level == 0 {
        return Err(ForensicsError::InvalidParameter(
            "wavelet decomposition level must be at least 1".into(),
        ));
    }
    let (height, width) = data.dim();
    if height == 0 || width == 0 {
        return Err(ForensicsError::InvalidParameter(
            "cannot decompose an empty array".into(),
        ));
    }
    let max_level = wavelet.max_level(height.min(width));
    if level > max_level {
        log::debug!(
            "decomposition level {} exceeds useful maximum {} for {:?}",
            level,
            max_level,
            wavelet
        );
    }

    let mut approx = data.clone();
    let mut details = Vec::with_capacity(level);
    for _ in 0..level {
        let (next, bands) = dwt2(&approx, wavelet);
        details.push(bands);
        approx = next;
    }
    details.reverse();

    Ok(Decomposition { approx, details })
}

pub fn waverec2(decomposition: &Decomposition, wavelet: Wavelet) -> Array2<f64> {
    let mut approx = decomposition.approx.clone();
    for bands in &decomposition.details {
        let (dh, dw) = bands.lh.dim();
        if approx.dim() != (dh, dw) {
            let (ah, aw) = approx.dim();
            approx = approx.slice(s![..dh.min(ah), ..dw.min(aw)]).to_owned();
        }
        approx = idwt2(&approx, bands, wavelet);
    }
    approx
}
