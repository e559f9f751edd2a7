//! Client for a staged commit store running behind another lumen instance.

use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use lumen_server::{
    ArtifactSlot, ArtifactStore, ArtifactUpload, CommittedArtifactSet, SetId, StageReceipt,
    StoreError,
};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response, StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

const UPLOAD_FIELD: &str = "file";
const ERROR_MESSAGE_LIMIT: usize = 512;

#[derive(Debug, Error)]
pub enum StoreClientError {
    #[error("invalid store url `{0}`")]
    InvalidBaseUrl(String),
    #[error("{stage} request failed: {source}")]
    Request {
        stage: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{stage} answered {status}: {message}")]
    Status {
        stage: &'static str,
        status: StatusCode,
        message: String,
    },
    #[error("{stage} response could not be decoded: {source}")]
    Decode {
        stage: &'static str,
        #[source]
        source: reqwest::Error,
    },
}

impl StoreClientError {
    fn request(stage: &'static str, source: reqwest::Error) -> Self {
        Self::Request { stage, source }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Request { source, .. } => source.is_connect() || source.is_timeout(),
            Self::Status { status, .. } => matches!(
                *status,
                StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
            ),
            Self::InvalidBaseUrl(_) | Self::Decode { .. } => false,
        }
    }
}

impl From<StoreClientError> for StoreError {
    fn from(error: StoreClientError) -> Self {
        match &error {
            StoreClientError::Request { .. } => StoreError::unavailable(error.to_string()),
            StoreClientError::Status { status, message, .. } => match *status {
                StatusCode::NOT_FOUND => StoreError::not_found(message.clone()),
                status if status.is_client_error() => StoreError::invalid_artifact(message.clone()),
                StatusCode::BAD_GATEWAY
                | StatusCode::SERVICE_UNAVAILABLE
                | StatusCode::GATEWAY_TIMEOUT => StoreError::unavailable(error.to_string()),
                _ => StoreError::internal(error.to_string()),
            },
            StoreClientError::InvalidBaseUrl(_) | StoreClientError::Decode { .. } => {
                StoreError::internal(error.to_string())
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreateSetBody {
    set_id: String,
}

#[derive(Debug, Deserialize)]
struct StageBody {
    committed: bool,
    path: String,
}

#[derive(Debug, Deserialize)]
struct SetBody {
    item: CommittedArtifactSet,
}

#[derive(Debug, Deserialize)]
struct ListBody {
    items: Vec<CommittedArtifactSet>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

/// Talks to the `/sets` API of a remote store.
///
/// Only reads are retried; creating and staging are not idempotent from the
/// caller's point of view.
#[derive(Debug, Clone)]
pub struct HttpStoreClient {
    base_url: Url,
    http: Client,
    backoff: ExponentialBuilder,
}

impl HttpStoreClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, StoreClientError> {
        let parsed = Url::parse(base_url)
            .map_err(|_| StoreClientError::InvalidBaseUrl(base_url.to_string()))?;
        if parsed.cannot_be_a_base() {
            return Err(StoreClientError::InvalidBaseUrl(base_url.to_string()));
        }

        let http = Client::builder()
            .timeout(timeout)
            .user_agent("lumen-store-client/0.1")
            .build()
            .map_err(|err| StoreClientError::request("build_client", err))?;

        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(2))
            .with_max_times(3)
            .with_jitter();

        Ok(Self {
            base_url: parsed,
            http,
            backoff,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, StoreClientError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| StoreClientError::InvalidBaseUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    pub async fn create(&self) -> Result<SetId, StoreClientError> {
        const STAGE: &str = "create_set";
        let url = self.endpoint(&["sets"])?;
        let response = self
            .http
            .post(url)
            .send()
            .await
            .map_err(|err| StoreClientError::request(STAGE, err))?;
        let body: CreateSetBody = decode(STAGE, response).await?;
        debug!(set_id = %body.set_id, "remote staging set created");
        Ok(body.set_id)
    }

    pub async fn stage(
        &self,
        set_id: &str,
        slot: ArtifactSlot,
        upload: ArtifactUpload,
    ) -> Result<StageReceipt, StoreClientError> {
        const STAGE: &str = "stage_artifact";
        let url = self.endpoint(&["sets", set_id, slot.as_str()])?;
        let length = upload.bytes.len() as u64;
        let part = Part::stream_with_length(upload.bytes, length)
            .file_name(upload.filename)
            .mime_str(&upload.content_type)
            .map_err(|err| StoreClientError::request(STAGE, err))?;
        let form = Form::new().part(UPLOAD_FIELD, part);

        let response = self
            .http
            .post(url)
            .multipart(form)
            .send()
            .await
            .map_err(|err| StoreClientError::request(STAGE, err))?;
        let body: StageBody = decode(STAGE, response).await?;
        Ok(StageReceipt {
            committed: body.committed,
            path: body.path,
        })
    }

    pub async fn committed_set(
        &self,
        set_id: &str,
    ) -> Result<Option<CommittedArtifactSet>, StoreClientError> {
        const STAGE: &str = "get_set";
        let url = self.endpoint(&["sets", set_id])?;
        let attempt = || {
            let url = url.clone();
            async move {
                let response = self
                    .http
                    .get(url)
                    .send()
                    .await
                    .map_err(|err| StoreClientError::request(STAGE, err))?;
                if response.status() == StatusCode::NOT_FOUND {
                    return Ok(None);
                }
                decode::<SetBody>(STAGE, response)
                    .await
                    .map(|body| Some(body.item))
            }
        };
        attempt
            .retry(self.backoff)
            .sleep(sleep)
            .when(StoreClientError::is_retryable)
            .notify(|err: &StoreClientError, delay: Duration| {
                warn!(stage = STAGE, %set_id, delay_ms = delay.as_millis(), error = %err, "retrying remote store read");
            })
            .await
    }

    pub async fn list(&self) -> Result<Vec<CommittedArtifactSet>, StoreClientError> {
        const STAGE: &str = "list_sets";
        let url = self.endpoint(&["sets"])?;
        let attempt = || {
            let url = url.clone();
            async move {
                let response = self
                    .http
                    .get(url)
                    .send()
                    .await
                    .map_err(|err| StoreClientError::request(STAGE, err))?;
                decode::<ListBody>(STAGE, response)
                    .await
                    .map(|body| body.items)
            }
        };
        attempt
            .retry(self.backoff)
            .sleep(sleep)
            .when(StoreClientError::is_retryable)
            .notify(|err: &StoreClientError, delay: Duration| {
                warn!(stage = STAGE, delay_ms = delay.as_millis(), error = %err, "retrying remote store read");
            })
            .await
    }
}

async fn decode<T: DeserializeOwned>(
    stage: &'static str,
    response: Response,
) -> Result<T, StoreClientError> {
    let status = response.status();
    if !status.is_success() {
        let raw = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&raw)
            .map(|body| body.message)
            .unwrap_or_else(|_| raw.chars().take(ERROR_MESSAGE_LIMIT).collect());
        return Err(StoreClientError::Status {
            stage,
            status,
            message,
        });
    }
    response
        .json::<T>()
        .await
        .map_err(|source| StoreClientError::Decode { stage, source })
}

#[async_trait]
impl ArtifactStore for HttpStoreClient {
    async fn create_set(&self) -> Result<SetId, StoreError> {
        self.create().await.map_err(StoreError::from)
    }

    async fn stage_artifact(
        &self,
        set_id: &str,
        slot: ArtifactSlot,
        upload: ArtifactUpload,
    ) -> Result<StageReceipt, StoreError> {
        self.stage(set_id, slot, upload)
            .await
            .map_err(StoreError::from)
    }

    async fn committed(&self, set_id: &str) -> Result<Option<CommittedArtifactSet>, StoreError> {
        self.committed_set(set_id).await.map_err(StoreError::from)
    }

    async fn list_committed(&self) -> Result<Vec<CommittedArtifactSet>, StoreError> {
        self.list().await.map_err(StoreError::from)
    }
}
