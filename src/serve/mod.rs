//! Single-image inference against a persisted bundle.
//!
//! [`inference::InferenceEngine`] does the work; [`service::InferenceService`]
//! wraps it in the request/response contract of the HTTP front end (health
//! check, JSON error bodies, status codes) without binding a listener.

pub mod inference;
pub mod service;

pub use inference::{InferenceEngine, InferenceResponse, PredictionLabel};
pub use service::{ErrorResponse, HealthResponse, InferRequest, InferenceService, ServiceResponse};
