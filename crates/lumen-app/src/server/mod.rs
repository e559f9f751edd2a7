//! Wires configured adapters into the `lumen_server` surface.

use std::sync::Arc;

use lumen_server::{
    ApiState, ArtifactGateway, DisabledInference, DynArtifactStore, DynInferenceProvider,
};
use tokio::task::JoinHandle;

use crate::config::{AppConfig, StorageBackend};
use crate::error::AppError;
use crate::paths::AppPaths;
use crate::services::{FsCommitStore, HttpInferenceProvider, HttpStoreClient};

/// Collaborators built from configuration, plus the background readiness probe.
pub struct ServerParts {
    pub state: ApiState,
    pub readiness_probe: Option<JoinHandle<()>>,
}

pub fn open_local_store(config: &AppConfig) -> Result<FsCommitStore, AppError> {
    let paths = AppPaths::new(&config.storage.path)?;
    let store = FsCommitStore::builder()
        .paths(paths)
        .durability(config.storage.durability)
        .build()?;
    Ok(store)
}

pub fn build_store(config: &AppConfig) -> Result<DynArtifactStore, AppError> {
    match config.storage.backend {
        StorageBackend::Local => {
            tracing::info!(path = %config.storage.path.display(), durability = ?config.storage.durability, "using local commit store");
            Ok(Arc::new(open_local_store(config)?))
        }
        StorageBackend::Remote => {
            let url = config
                .storage
                .remote_url
                .as_deref()
                .ok_or(crate::config::AppConfigError::MissingRemoteUrl)?;
            tracing::info!(upstream = %url, "using remote commit store");
            let client = HttpStoreClient::new(url, config.session.upload_timeout())?;
            Ok(Arc::new(client))
        }
    }
}

/// Must run inside a tokio runtime when an inference URL is configured.
pub fn build_inference(
    config: &AppConfig,
) -> Result<(DynInferenceProvider, Option<JoinHandle<()>>), AppError> {
    let Some(url) = config.inference.url.as_deref() else {
        tracing::info!("inference disabled; uploads will skip the derived artifact");
        let disabled: DynInferenceProvider = Arc::new(DisabledInference);
        return Ok((disabled, None));
    };
    let provider = Arc::new(HttpInferenceProvider::new(url, config.inference.timeout())?);
    let probe = Arc::clone(&provider).spawn_readiness_probe(config.inference.probe_interval());
    tracing::info!(upstream = %url, "inference provider configured");
    Ok((provider as DynInferenceProvider, Some(probe)))
}

pub fn build_parts(config: &AppConfig) -> Result<ServerParts, AppError> {
    let store = build_store(config)?;
    let upstream = config
        .gateway_upstream()
        .ok_or(AppError::MissingGatewayUpstream)?;
    let gateway = ArtifactGateway::new(&config.gateway, &upstream)?;
    tracing::info!(upstream = %gateway.upstream(), "retrieval gateway configured");
    let (inference, readiness_probe) = build_inference(config)?;

    Ok(ServerParts {
        state: ApiState::new(store, inference, gateway, config.session.clone()),
        readiness_probe,
    })
}

pub async fn run(config: AppConfig) -> Result<(), AppError> {
    let ServerParts {
        state,
        readiness_probe,
    } = build_parts(&config)?;
    let result = lumen_server::serve(config.server.clone(), state).await;
    if let Some(probe) = readiness_probe {
        probe.abort();
    }
    result.map_err(AppError::from)
}
