use std::{path::Path, sync::Arc};

use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    serve::inference::{InferenceEngine, InferenceResponse},
};

pub const SERVICE_NAME: &str = "forensic-fusion-inference";
pub const INFER_PATH: &str = "/infer";

/// Decoded upload of the `/infer` endpoint.
#[derive(Debug, Clone, Default)]
pub struct InferRequest {
    pub file_bytes: Vec<u8>,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub return_heatmap: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub ok: bool,
    pub service: String,
    pub ready: bool,
    pub artifact_path: Option<String>,
    pub model_version: Option<String>,
}

/// Failure body. Carries the error message only, never a backtrace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub ok: bool,
    pub request_id: String,
    pub error: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServiceResponse {
    Success(Box<InferenceResponse>),
    Failure { status: u16, body: ErrorResponse },
}

impl ServiceResponse {
    pub fn status(&self) -> u16 {
        match self {
            ServiceResponse::Success(_) => 200,
            ServiceResponse::Failure { status, .. } => *status,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(match self {
            ServiceResponse::Success(body) => serde_json::to_string(body)?,
            ServiceResponse::Failure { body, .. } => serde_json::to_string(body)?,
        })
    }
}

fn new_request_id() -> String {
    let raw: u128 = rand::thread_rng().gen_range(0..=u128::MAX);
    let hex = format!("{raw:032x}");
    format!("{}-{}-{}-{}-{}", &hex[..8], &hex[8..12], &hex[12..16], &hex[16..20], &hex[20..])
}

/// Process-wide engine slot shared by request handlers.
///
/// The engine is loaded once and then only read; handlers clone the `Arc`
/// out of the lock so inference never holds it.
#[derive(Debug, Default)]
pub struct InferenceService {
    engine: RwLock<Option<Arc<InferenceEngine>>>,
}

impl InferenceService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_engine(engine: InferenceEngine) -> Self {
        Self {
            engine: RwLock::new(Some(Arc::new(engine))),
        }
    }

    pub fn load<P: AsRef<Path>>(&self, bundle_path: P) -> Result<()> {
        let engine = InferenceEngine::load(bundle_path)?;
        *self.engine.write() = Some(Arc::new(engine));
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.engine.read().is_some()
    }

    pub fn health(&self) -> HealthResponse {
        let engine = self.engine.read().clone();
        HealthResponse {
            ok: true,
            service: SERVICE_NAME.to_string(),
            ready: engine.is_some(),
            artifact_path: engine.as_ref().map(|e| e.bundle_path().display().to_string()),
            model_version: engine.as_ref().map(|e| e.model_version().to_string()),
        }
    }

    pub fn handle_infer(&self, request: &InferRequest) -> ServiceResponse {
        let request_id = new_request_id();
        let Some(engine) = self.engine.read().clone() else {
            return ServiceResponse::Failure {
                status: 503,
                body: ErrorResponse {
                    ok: false,
                    request_id,
                    error: "Inference engine not ready".into(),
                    path: INFER_PATH.into(),
                },
            };
        };

        let filename = request.filename.as_deref().unwrap_or("unknown");
        match engine.infer(&request.file_bytes, filename, request.return_heatmap) {
            Ok(mut response) => {
                response.request_id = Some(request_id);
                response.content_type = request.content_type.clone();
                ServiceResponse::Success(Box::new(response))
            }
            Err(e) => {
                log::warn!("Request {} for {} failed: {}", request_id, filename, e);
                ServiceResponse::Failure {
                    status: 500,
                    body: ErrorResponse {
                        ok: false,
                        request_id,
                        error: e.to_string(),
                        path: INFER_PATH.into(),
                    },
                }
            }
        }
    }
}
