//! Handcrafted tamper-detection signals.
//!
//! Every extractor consumes an RGB image already resized to the experiment
//! size and produces an ordered, named feature vector. Extractors that have a
//! spatial interpretation also return their 2-D map.

pub mod cfa_analysis;
pub mod dwt_svd;
pub mod ela;
pub mod mantra;
pub mod prnu_analysis;
pub mod wavelet;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::{
    error::{ForensicsError, Result},
    image_utils,
    report::visualization::{ColorScheme, Visualizer},
};

/// Ordered feature vector. Insertion order is the table column order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Features {
    names: Vec<String>,
    values: Vec<f64>,
}

impl Features {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: f64) {
        self.names.push(name.into());
        self.values.push(value);
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|idx| self.values[idx])
    }

    pub fn get_or_zero(&self, name: &str) -> f64 {
        self.get(name).unwrap_or(0.0)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.names
            .iter()
            .map(String::as_str)
            .zip(self.values.iter().copied())
    }

    pub fn extend(&mut self, other: Features) {
        self.names.extend(other.names);
        self.values.extend(other.values);
    }

    /// Names of the `k` largest-magnitude features; ties keep insertion order.
    pub fn largest_magnitude(&self, k: usize) -> Vec<String> {
        let mut ranked: Vec<(&str, f64)> = self.iter().collect();
        ranked.sort_by(|a, b| b.1.abs().total_cmp(&a.1.abs()));
        ranked.into_iter().take(k).map(|(name, _)| name.to_string()).collect()
    }

    /// Values for `columns`, in that order.
    pub fn select(&self, columns: &[String]) -> Result<Vec<f64>> {
        columns
            .iter()
            .map(|c| {
                self.get(c)
                    .ok_or_else(|| ForensicsError::MissingFeature(c.clone()))
            })
            .collect()
    }
}

/// Feature vector plus the spatial map it was computed from.
#[derive(Debug, Clone)]
pub struct SignalOutput {
    pub features: Features,
    pub map: Array2<f64>,
    pub png_base64: Option<String>,
}

impl SignalOutput {
    /// The [0, 1] form of `map` used for display and localization.
    pub fn normalized_map(&self) -> Array2<f64> {
        image_utils::min_max_normalize(&self.map)
    }

    pub(crate) fn with_rendering(
        features: Features,
        map: Array2<f64>,
        display: Option<(Array2<f64>, ColorScheme)>,
    ) -> Result<Self> {
        let png_base64 = match display {
            Some((normalized, scheme)) => {
                Some(Visualizer::with_scheme(scheme).encode_png_base64(&normalized)?)
            }
            None => None,
        };
        Ok(Self {
            features,
            map,
            png_base64,
        })
    }
}

pub(crate) fn clip01(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 1.0)
}

pub(crate) fn check_dimensions(width: u32, height: u32) -> Result<()> {
    const MIN_SIDE: u32 = 16;
    if width < MIN_SIDE || height < MIN_SIDE {
        return Err(ForensicsError::ImageTooSmall(MIN_SIDE));
    }
    Ok(())
}
