use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;

pub type DynInferenceProvider = Arc<dyn InferenceProvider>;

/// Outcome of one prediction. Only `success` and `derived` drive the workflow.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceResult {
    pub success: bool,
    pub derived: Option<Bytes>,
    pub stats: Option<Value>,
    pub error: Option<String>,
}

impl InferenceResult {
    pub fn succeeded(derived: Option<Bytes>, stats: Option<Value>) -> Self {
        Self {
            success: true,
            derived,
            stats,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            derived: None,
            stats: None,
            error: Some(error.into()),
        }
    }
}

/// Model lifecycle as observed by the adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Loading,
    Ready,
    Unavailable(String),
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready)
    }
}

impl fmt::Display for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Readiness::Loading => f.write_str("loading"),
            Readiness::Ready => f.write_str("ready"),
            Readiness::Unavailable(reason) => write!(f, "unavailable: {reason}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("inference request failed: {0}")]
    Transport(String),
    #[error("inference response could not be decoded: {0}")]
    Decode(String),
}

#[async_trait]
pub trait InferenceProvider: Send + Sync + 'static {
    fn readiness(&self) -> Readiness;

    /// Must answer `success = false` instead of waiting when the model is not ready.
    async fn predict(
        &self,
        image: Bytes,
        content_type: &str,
        filename: &str,
    ) -> Result<InferenceResult, InferenceError>;
}

/// Provider used when no model service is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledInference;

#[async_trait]
impl InferenceProvider for DisabledInference {
    fn readiness(&self) -> Readiness {
        Readiness::Unavailable("inference is not configured".to_string())
    }

    async fn predict(
        &self,
        _image: Bytes,
        _content_type: &str,
        _filename: &str,
    ) -> Result<InferenceResult, InferenceError> {
        Ok(InferenceResult::failed("inference is not configured"))
    }
}
