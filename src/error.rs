use thiserror::Error;

#[derive(Error, Debug)]
pub enum ForensicsError {
    #[error("Image loading error: {0}")]
    ImageLoad(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Analysis failed: {0}")]
    AnalysisFailed(String),

    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    #[error("No feature columns selected for method {0}")]
    NoFeatureColumns(String),

    #[error("Feature table split '{0}' is empty")]
    EmptySplit(String),

    #[error("No features extracted; check dataset and decoding pipeline")]
    EmptyFeatureTable,

    #[error("Feature set mismatch for {path}: {detail}")]
    FeatureMismatch { path: String, detail: String },

    #[error("Missing feature column: {0}")]
    MissingFeature(String),

    #[error("Prediction rows do not align for statistical test: {0}")]
    MisalignedPredictions(String),

    #[error("Primary method '{0}' not found in predictions")]
    MissingPrimary(String),

    #[error("No valid candidate found during tuning")]
    NoValidCandidate,

    #[error("Model fit failed: {0}")]
    ModelFit(String),

    #[error("Image too small for analysis (minimum: {0}x{0})")]
    ImageTooSmall(u32),
}

pub type Result<T> = std::result::Result<T, ForensicsError>;
