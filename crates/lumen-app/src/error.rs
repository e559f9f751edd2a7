//! Application-level error type shared across binaries and services.

use lumen_server::{GatewayError, ServerError, StoreError};
use thiserror::Error;

use crate::config::AppConfigError;
use crate::paths::PathError;
use crate::services::{CommitStoreError, InferenceClientError, StoreClientError};

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    ConfigLoad(#[from] AppConfigError),
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error(transparent)]
    Paths(#[from] PathError),
    #[error(transparent)]
    CommitStore(#[from] CommitStoreError),
    #[error(transparent)]
    StoreClient(#[from] StoreClientError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Inference(#[from] InferenceClientError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("retrieval gateway has no upstream; set `gateway.upstream_url`")]
    MissingGatewayUpstream,
    #[error("`lumen audit` needs the local storage backend")]
    AuditRequiresLocalStore,
    #[error("audit found {orphaned} orphaned and {missing} missing files")]
    AuditInconsistent { orphaned: usize, missing: usize },
}
