use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::{
    analysis::{
        Features, SignalOutput, cfa_analysis::{self, CfaAnalyzer}, dwt_svd::{self, DwtSvdAnalyzer},
        ela::{self, ElaAnalyzer}, mantra::{self, MantraAnalyzer}, prnu_analysis::{self, PrnuAnalyzer},
    },
    config::FeatureConfig,
    error::Result,
};

pub mod analysis;
pub mod config;
pub mod error;
pub mod evaluation;
pub mod features;
pub mod image_utils;
pub mod models;
pub mod pipeline;
pub mod report;
pub mod serve;
pub mod training;

pub use config::LabConfig;
pub use error::ForensicsError;

/// Runs every signal extractor on one image with a shared configuration.
#[derive(Debug, Clone, Default)]
pub struct ForensicsAnalyzer {
    config: FeatureConfig,
}

impl ForensicsAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: FeatureConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FeatureConfig {
        &self.config
    }

    pub fn ela(&self, image: &RgbImage, with_map: bool) -> Result<SignalOutput> {
        ElaAnalyzer::with_config(self.config.ela.clone()).analyze(image, with_map)
    }

    pub fn dwt_svd(&self, image: &RgbImage) -> Result<Features> {
        DwtSvdAnalyzer::with_config(self.config.dwt.clone()).analyze(image)
    }

    pub fn cfa(&self, image: &RgbImage, with_map: bool) -> Result<SignalOutput> {
        CfaAnalyzer::with_config(self.config.cfa.clone()).analyze(image, with_map)
    }

    pub fn prnu(&self, image: &RgbImage, with_map: bool) -> Result<SignalOutput> {
        PrnuAnalyzer::with_config(self.config.prnu.clone()).analyze(image, with_map)
    }

    pub fn mantra(&self, image: &RgbImage, with_map: bool) -> Result<SignalOutput> {
        MantraAnalyzer::with_config(self.config.mantra.clone()).analyze(image, with_map)
    }

    pub fn full_analysis(&self, image: &RgbImage, with_maps: bool) -> Result<FullAnalysisReport> {
        Ok(FullAnalysisReport {
            ela: self.ela(image, with_maps)?,
            dwt: self.dwt_svd(image)?,
            cfa: self.cfa(image, with_maps)?,
            prnu: self.prnu(image, with_maps)?,
            mantra: self.mantra(image, with_maps)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct FullAnalysisReport {
    pub ela: SignalOutput,
    pub dwt: Features,
    pub cfa: SignalOutput,
    pub prnu: SignalOutput,
    pub mantra: SignalOutput,
}

impl FullAnalysisReport {
    /// All features in feature-table column order.
    pub fn features(&self) -> Features {
        let mut features = self.ela.features.clone();
        features.extend(self.dwt.clone());
        features.extend(self.cfa.features.clone());
        features.extend(self.prnu.features.clone());
        features.extend(self.mantra.features.clone());
        features
    }

    pub fn simple_scores(&self) -> SignalScores {
        SignalScores {
            ela: ela::simple_score(&self.ela.features),
            dwt_svd: dwt_svd::simple_score(&self.dwt),
            cfa: cfa_analysis::simple_score(&self.cfa.features),
            prnu: prnu_analysis::simple_score(&self.prnu.features),
            mantra: mantra::simple_score(&self.mantra.features),
        }
    }
}

/// Fixed-weight severity of each signal, each in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalScores {
    pub ela: f64,
    pub dwt_svd: f64,
    pub cfa: f64,
    pub prnu: f64,
    pub mantra: f64,
}

impl SignalScores {
    pub fn heuristic_fusion(&self) -> f64 {
        let score = 0.40 * self.mantra
            + 0.25 * self.cfa
            + 0.20 * self.prnu
            + 0.10 * self.ela
            + 0.05 * self.dwt_svd;
        score.clamp(0.0, 1.0)
    }
}
