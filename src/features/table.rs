use std::{fmt, fs, path::Path, str::FromStr};

use ndarray::Array2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    ForensicsAnalyzer,
    analysis::Features,
    config::LabConfig,
    error::{ForensicsError, Result},
    image_utils,
};

const IDENTITY_COLUMNS: [&str; 6] = [
    "image_path",
    "label",
    "split",
    "source_dataset",
    "perturbation_tag",
    "mask_path",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Val,
    Test,
}

impl Split {
    pub const ALL: [Split; 3] = [Split::Train, Split::Val, Split::Test];

    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Val => "val",
            Split::Test => "test",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Split {
    type Err = ForensicsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "train" => Ok(Split::Train),
            "val" => Ok(Split::Val),
            "test" => Ok(Split::Test),
            other => Err(ForensicsError::InvalidParameter(format!("unknown split '{other}'"))),
        }
    }
}

fn default_perturbation_tag() -> String {
    "clean".to_string()
}

/// One image of the dataset manifest. Extra manifest columns are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestRow {
    pub image_path: String,
    pub label: u8,
    pub split: Split,
    #[serde(default)]
    pub source_dataset: String,
    #[serde(default = "default_perturbation_tag")]
    pub perturbation_tag: String,
    #[serde(default)]
    pub mask_path: Option<String>,
}

pub fn read_manifest<P: AsRef<Path>>(path: P) -> Result<Vec<ManifestRow>> {
    let mut reader = csv::Reader::from_path(path.as_ref())?;
    let mut rows = Vec::new();
    for record in reader.deserialize() {
        let mut row: ManifestRow = record?;
        if row.label > 1 {
            return Err(ForensicsError::InvalidParameter(format!(
                "label must be 0 or 1, got {} for {}",
                row.label, row.image_path
            )));
        }
        if row.mask_path.as_deref().is_some_and(|m| m.trim().is_empty()) {
            row.mask_path = None;
        }
        rows.push(row);
    }
    Ok(rows)
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow {
    pub image_path: String,
    pub label: u8,
    pub split: Split,
    pub source_dataset: String,
    pub perturbation_tag: String,
    pub mask_path: Option<String>,
    /// Aligned with [`FeatureTable::columns`].
    pub values: Vec<f32>,
}

/// Feature matrix of one split restricted to a column subset.
#[derive(Debug, Clone)]
pub struct SplitData {
    pub split: Split,
    pub x: Array2<f64>,
    pub y: Vec<u8>,
    pub paths: Vec<String>,
}

impl SplitData {
    pub fn len(&self) -> usize {
        self.y.len()
    }

    pub fn is_empty(&self) -> bool {
        self.y.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct FeatureTable {
    columns: Vec<String>,
    rows: Vec<FeatureRow>,
}

impl FeatureTable {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[FeatureRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn push(&mut self, row: FeatureRow) -> Result<()> {
        if row.values.len() != self.columns.len() {
            return Err(ForensicsError::FeatureMismatch {
                path: row.image_path,
                detail: format!(
                    "expected {} values, got {}",
                    self.columns.len(),
                    row.values.len()
                ),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    fn push_features(&mut self, manifest_row: &ManifestRow, features: Features) -> Result<()> {
        if features.names() != self.columns.as_slice() {
            return Err(ForensicsError::FeatureMismatch {
                path: manifest_row.image_path.clone(),
                detail: format!(
                    "{} feature names differ from the {} table columns",
                    features.len(),
                    self.columns.len()
                ),
            });
        }
        self.push(FeatureRow {
            image_path: manifest_row.image_path.clone(),
            label: manifest_row.label,
            split: manifest_row.split,
            source_dataset: manifest_row.source_dataset.clone(),
            perturbation_tag: manifest_row.perturbation_tag.clone(),
            mask_path: manifest_row.mask_path.clone(),
            values: features.values().iter().map(|&v| v as f32).collect(),
        })
    }

    fn column_indices(&self, columns: &[String]) -> Result<Vec<usize>> {
        columns
            .iter()
            .map(|c| {
                self.columns
                    .iter()
                    .position(|t| t == c)
                    .ok_or_else(|| ForensicsError::MissingFeature(c.clone()))
            })
            .collect()
    }

    /// Rows of `split` projected onto `columns` in the given order.
    pub fn split_data(&self, split: Split, columns: &[String]) -> Result<SplitData> {
        let indices = self.column_indices(columns)?;
        let rows: Vec<&FeatureRow> = self.rows.iter().filter(|r| r.split == split).collect();
        if rows.is_empty() {
            return Err(ForensicsError::EmptySplit(split.to_string()));
        }

        let x = Array2::from_shape_fn((rows.len(), indices.len()), |(i, j)| {
            rows[i].values[indices[j]] as f64
        });
        Ok(SplitData {
            split,
            x,
            y: rows.iter().map(|r| r.label).collect(),
            paths: rows.iter().map(|r| r.image_path.clone()).collect(),
        })
    }

    pub fn split_rows(&self, split: Split) -> impl Iterator<Item = &FeatureRow> {
        self.rows.iter().filter(move |r| r.split == split)
    }

    pub fn write_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        let mut writer = csv::Writer::from_path(path.as_ref())?;
        writer.write_record(IDENTITY_COLUMNS.iter().copied().chain(self.columns.iter().map(String::as_str)))?;

        for row in &self.rows {
            let mut record = vec![
                row.image_path.clone(),
                row.label.to_string(),
                row.split.to_string(),
                row.source_dataset.clone(),
                row.perturbation_tag.clone(),
                row.mask_path.clone().unwrap_or_default(),
            ];
            record.extend(row.values.iter().map(|v| v.to_string()));
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn read_csv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path.as_ref())?;
        let headers = reader.headers()?.clone();

        let identity_index = |name: &str| headers.iter().position(|h| h == name);
        let required = |name: &str| {
            identity_index(name).ok_or_else(|| ForensicsError::MissingFeature(name.to_string()))
        };
        let path_idx = required("image_path")?;
        let label_idx = required("label")?;
        let split_idx = required("split")?;
        let source_idx = identity_index("source_dataset");
        let tag_idx = identity_index("perturbation_tag");
        let mask_idx = identity_index("mask_path");

        let feature_idx: Vec<usize> = (0..headers.len())
            .filter(|&i| !IDENTITY_COLUMNS.contains(&&headers[i]))
            .collect();
        let mut table = FeatureTable::new(feature_idx.iter().map(|&i| headers[i].to_string()).collect());

        for record in reader.records() {
            let record = record?;
            let field = |idx: Option<usize>| idx.and_then(|i| record.get(i)).unwrap_or("").to_string();
            let image_path = field(Some(path_idx));
            let label = record[label_idx].trim().parse::<u8>().map_err(|e| {
                ForensicsError::InvalidParameter(format!("bad label for {image_path}: {e}"))
            })?;
            let values = feature_idx
                .iter()
                .map(|&i| {
                    record[i].trim().parse::<f32>().map_err(|e| ForensicsError::FeatureMismatch {
                        path: image_path.clone(),
                        detail: format!("column '{}': {e}", &headers[i]),
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            let mask_path = field(mask_idx);

            table.push(FeatureRow {
                image_path: image_path.clone(),
                label,
                split: record[split_idx].parse()?,
                source_dataset: field(source_idx),
                perturbation_tag: field(tag_idx),
                mask_path: (!mask_path.is_empty()).then_some(mask_path),
                values,
            })?;
        }

        if table.is_empty() {
            return Err(ForensicsError::EmptyFeatureTable);
        }
        Ok(table)
    }
}

/// Extracts every signal for every manifest image.
///
/// Images that fail to decode or extract are logged and dropped. All
/// surviving rows must produce the same feature names in the same order.
pub fn build_feature_table(manifest: &[ManifestRow], config: &LabConfig) -> Result<FeatureTable> {
    let analyzer = ForensicsAnalyzer::with_config(config.features.clone());
    let image_size = config.experiment.image_size;

    let extracted: Vec<Option<Features>> = manifest
        .par_iter()
        .map(|row| {
            let result = image_utils::load_rgb_image(&row.image_path, image_size)
                .and_then(|image| analyzer.full_analysis(&image, false))
                .map(|report| report.features());
            match result {
                Ok(features) => Some(features),
                Err(e) => {
                    log::warn!("Failed feature extraction for {}: {}", row.image_path, e);
                    None
                }
            }
        })
        .collect();

    let mut table: Option<FeatureTable> = None;
    for (row, features) in manifest.iter().zip(extracted) {
        let Some(features) = features else { continue };
        let table = table.get_or_insert_with(|| FeatureTable::new(features.names().to_vec()));
        table.push_features(row, features)?;
    }

    let table = table.ok_or(ForensicsError::EmptyFeatureTable)?;
    log::info!(
        "Extracted {} features for {}/{} images",
        table.columns().len(),
        table.len(),
        manifest.len()
    );
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(path: &str, split: Split, label: u8, values: Vec<f32>) -> FeatureRow {
        FeatureRow {
            image_path: path.into(),
            label,
            split,
            source_dataset: "synthetic".into(),
            perturbation_tag: "clean".into(),
            mask_path: None,
            values,
        }
    }

    fn table() -> FeatureTable {
        let mut table = FeatureTable::new(vec!["ela_a".into(), "dwt_b".into(), "cfa_c".into()]);
        table.push(row("a.png", Split::Train, 0, vec![1.0, 2.0, 3.0])).unwrap();
        table.push(row("b.png", Split::Val, 1, vec![4.0, 5.0, 6.0])).unwrap();
        table.push(row("c.png", Split::Train, 1, vec![7.0, 8.0, 9.0])).unwrap();
        table
    }

    #[test]
    fn split_data_projects_columns_in_requested_order() {
        let data = table()
            .split_data(Split::Train, &["cfa_c".into(), "ela_a".into()])
            .unwrap();
        assert_eq!(data.x.dim(), (2, 2));
        assert_eq!(data.x[[0, 0]], 3.0);
        assert_eq!(data.x[[1, 1]], 7.0);
        assert_eq!(data.y, vec![0, 1]);
        assert_eq!(data.paths, vec!["a.png", "c.png"]);
    }

    #[test]
    fn empty_split_is_fatal() {
        let err = table().split_data(Split::Test, &["ela_a".into()]).unwrap_err();
        assert!(matches!(err, ForensicsError::EmptySplit(s) if s == "test"));
    }

    #[test]
    fn mismatched_row_width_is_rejected() {
        let mut table = table();
        let err = table.push(row("d.png", Split::Test, 0, vec![1.0])).unwrap_err();
        assert!(matches!(err, ForensicsError::FeatureMismatch { .. }));
    }

    #[test]
    fn csv_round_trip_preserves_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("features.csv");
        let original = table();
        original.write_csv(&path).unwrap();
        let loaded = FeatureTable::read_csv(&path).unwrap();
        assert_eq!(loaded.columns(), original.columns());
        assert_eq!(loaded.rows(), original.rows());
    }

    #[test]
    fn manifest_reader_ignores_extra_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.csv");
        fs::write(
            &path,
            "image_path,label,split,source_dataset,perturbation_tag,mask_path,width\n\
             a.png,0,train,casia,clean,,256\n\
             b.png,1,test,casia,clean,masks/b.png,256\n",
        )
        .unwrap();
        let rows = read_manifest(&path).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].mask_path, None);
        assert_eq!(rows[1].mask_path.as_deref(), Some("masks/b.png"));
        assert_eq!(rows[1].split, Split::Test);
    }
}
