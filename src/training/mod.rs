//! Per-method training, primary-method tuning and the persisted bundle.

pub mod bundle;
pub mod trainer;
pub mod tuner;

pub use bundle::{ConfigSnapshot, MethodPayload, ModelBundle};
pub use trainer::{
    MethodData, ThresholdChoice, TieBreak, TrainedModel, fit_calibrated, select_threshold, threshold_grid,
    train_method, train_methods,
};
pub use tuner::{ReferenceCandidate, SelectedCandidate, SweepRow, TuningMode, TuningOutcome, tune_primary};

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::features::{FeatureRow, FeatureTable, Split};

    /// 36 train, 12 val and 12 test rows; label shifts the ELA and DWT energy columns.
    pub(crate) fn synthetic_table() -> FeatureTable {
        let columns = ["ela_mean", "ela_std", "dwt_l1_hh_energy", "dwt_l1_hh_sv_mean", "cfa_var_mean"];
        let mut table = FeatureTable::new(columns.iter().map(|c| c.to_string()).collect());
        for i in 0..60 {
            let label = u8::from(i % 2 == 1);
            let split = match i % 5 {
                0 => Split::Val,
                1 => Split::Test,
                _ => Split::Train,
            };
            let t = i as f32;
            let shift = if label == 1 { 1.5 } else { 0.0 };
            table
                .push(FeatureRow {
                    image_path: format!("img_{i:03}.png"),
                    label,
                    split,
                    source_dataset: "synthetic".into(),
                    perturbation_tag: "clean".into(),
                    mask_path: None,
                    values: vec![
                        shift + (t * 0.7).sin() * 0.6,
                        (t * 1.3).cos(),
                        shift * 0.5 + (t * 0.4).sin() * 0.8,
                        (t * 0.9).cos() * 0.5,
                        (t * 2.1).sin(),
                    ],
                })
                .unwrap();
        }
        table
    }
}
