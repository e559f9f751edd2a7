//! HTTP adapter for the segmentation model service.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use lumen_server::{InferenceError, InferenceProvider, InferenceResult, Readiness};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const UPLOAD_FIELD: &str = "file";
const DETAIL_LIMIT: usize = 512;

#[derive(Debug, Error)]
pub enum InferenceClientError {
    #[error("invalid inference url `{0}`")]
    InvalidBaseUrl(String),
    #[error("failed to build inference client: {0}")]
    Client(#[from] reqwest::Error),
}

#[derive(Debug, Deserialize)]
struct HealthBody {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    model_loaded: bool,
}

#[derive(Debug, Deserialize)]
struct PredictBody {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    mask_base64: Option<String>,
    #[serde(default)]
    statistics: Option<Value>,
    #[serde(default)]
    detail: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DetailBody {
    detail: String,
}

/// Model service reached over HTTP (`/api/predict`, `/api/health`).
///
/// Readiness is tracked locally from health probes and 503 answers; `predict`
/// never waits for the model to load.
#[derive(Debug)]
pub struct HttpInferenceProvider {
    base_url: Url,
    http: Client,
    readiness: watch::Sender<Readiness>,
}

impl HttpInferenceProvider {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, InferenceClientError> {
        let parsed = Url::parse(base_url)
            .map_err(|_| InferenceClientError::InvalidBaseUrl(base_url.to_string()))?;
        if parsed.cannot_be_a_base() {
            return Err(InferenceClientError::InvalidBaseUrl(base_url.to_string()));
        }
        let http = Client::builder()
            .timeout(timeout)
            .user_agent("lumen-inference/0.1")
            .build()?;
        let (readiness, _) = watch::channel(Readiness::Loading);
        Ok(Self {
            base_url: parsed,
            http,
            readiness,
        })
    }

    fn endpoint(&self, leaf: &str) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(["api", leaf]);
        }
        url
    }

    pub fn subscribe(&self) -> watch::Receiver<Readiness> {
        self.readiness.subscribe()
    }

    /// Probes the health endpoint once and records the answer.
    pub async fn load(&self) -> Readiness {
        let next = match self.http.get(self.endpoint("health")).send().await {
            Ok(response) if response.status().is_success() => {
                match response.json::<HealthBody>().await {
                    Ok(HealthBody {
                        model_loaded: true, ..
                    }) => Readiness::Ready,
                    Ok(HealthBody { status, .. }) => {
                        debug!(status = status.as_deref().unwrap_or("-"), "model not loaded yet");
                        Readiness::Loading
                    }
                    Err(err) => Readiness::Unavailable(format!("unreadable health answer: {err}")),
                }
            }
            Ok(response) => {
                Readiness::Unavailable(format!("health check answered {}", response.status()))
            }
            Err(err) => Readiness::Unavailable(format!("health check failed: {err}")),
        };
        self.record(next.clone());
        next
    }

    /// Re-probes health on every tick until the handle is aborted.
    pub fn spawn_readiness_probe(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.load().await;
            }
        })
    }

    fn record(&self, next: Readiness) {
        let previous = self.readiness.send_replace(next.clone());
        if previous != next {
            match &next {
                Readiness::Ready => info!("inference model ready"),
                Readiness::Loading => info!("inference model loading"),
                Readiness::Unavailable(reason) => warn!(%reason, "inference unavailable"),
            }
        }
    }
}

#[async_trait]
impl InferenceProvider for HttpInferenceProvider {
    fn readiness(&self) -> Readiness {
        self.readiness.borrow().clone()
    }

    async fn predict(
        &self,
        image: Bytes,
        content_type: &str,
        filename: &str,
    ) -> Result<InferenceResult, InferenceError> {
        let readiness = self.readiness();
        if !readiness.is_ready() {
            return Ok(InferenceResult::failed(format!("model is {readiness}")));
        }

        let length = image.len() as u64;
        let part = Part::stream_with_length(image, length)
            .file_name(filename.to_string())
            .mime_str(content_type)
            .map_err(|err| InferenceError::Transport(err.to_string()))?;
        let response = self
            .http
            .post(self.endpoint("predict"))
            .multipart(Form::new().part(UPLOAD_FIELD, part))
            .send()
            .await
            .map_err(|err| InferenceError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let raw = response.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<DetailBody>(&raw)
                .map(|body| body.detail)
                .unwrap_or_else(|_| raw.chars().take(DETAIL_LIMIT).collect());
            if status == StatusCode::SERVICE_UNAVAILABLE {
                self.record(Readiness::Unavailable(detail.clone()));
            }
            return Ok(InferenceResult::failed(format!(
                "inference service answered {status}: {detail}"
            )));
        }

        let body: PredictBody = response
            .json()
            .await
            .map_err(|err| InferenceError::Decode(err.to_string()))?;
        if !body.success {
            return Ok(InferenceResult::failed(
                body.detail
                    .unwrap_or_else(|| "inference reported failure".to_string()),
            ));
        }
        let derived = body
            .mask_base64
            .map(|encoded| STANDARD.decode(encoded.trim()))
            .transpose()
            .map_err(|err| InferenceError::Decode(format!("mask is not base64: {err}")))?
            .map(Bytes::from);
        Ok(InferenceResult::succeeded(derived, body.statistics))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn mount_health(server: &MockServer, loaded: bool) {
        Mock::given(method("GET"))
            .and(path("/api/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": if loaded { "healthy" } else { "model_not_loaded" },
                "model_loaded": loaded
            })))
            .mount(server)
            .await;
    }

    fn provider(server: &MockServer) -> HttpInferenceProvider {
        HttpInferenceProvider::new(&server.uri(), Duration::from_secs(5)).expect("provider")
    }

    #[tokio::test]
    async fn predict_decodes_mask_once_ready() {
        let server = MockServer::start().await;
        mount_health(&server, true).await;
        Mock::given(method("POST"))
            .and(path("/api/predict"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "filename": "scan.png",
                "mask_base64": STANDARD.encode(b"PNGMASK"),
                "statistics": {"coverage_percent": 12.5}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = provider(&server);
        assert_eq!(provider.load().await, Readiness::Ready);
        let result = provider
            .predict(Bytes::from_static(b"img"), "image/png", "scan.png")
            .await
            .expect("predict");

        assert!(result.success);
        assert_eq!(result.derived.as_deref(), Some(&b"PNGMASK"[..]));
        assert_eq!(result.stats, Some(json!({"coverage_percent": 12.5})));
    }

    #[tokio::test]
    async fn loading_model_fails_fast_without_calling_predict() {
        let server = MockServer::start().await;
        mount_health(&server, false).await;
        Mock::given(method("POST"))
            .and(path("/api/predict"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let provider = provider(&server);
        assert_eq!(provider.load().await, Readiness::Loading);
        let result = provider
            .predict(Bytes::from_static(b"img"), "image/png", "scan.png")
            .await
            .expect("predict");
        assert!(!result.success);
        assert!(result.derived.is_none());
    }

    #[tokio::test]
    async fn service_unavailable_marks_provider_unavailable() {
        let server = MockServer::start().await;
        mount_health(&server, true).await;
        Mock::given(method("POST"))
            .and(path("/api/predict"))
            .respond_with(
                ResponseTemplate::new(503).set_body_json(json!({"detail": "Model not loaded"})),
            )
            .mount(&server)
            .await;

        let provider = provider(&server);
        provider.load().await;
        let mut readiness = provider.subscribe();
        let result = provider
            .predict(Bytes::from_static(b"img"), "image/png", "scan.png")
            .await
            .expect("predict");

        assert!(!result.success);
        assert!(result.error.unwrap_or_default().contains("Model not loaded"));
        assert!(readiness.has_changed().unwrap_or(false));
        assert_eq!(
            *readiness.borrow_and_update(),
            Readiness::Unavailable("Model not loaded".to_string())
        );
    }

    #[tokio::test]
    async fn unreachable_service_reads_as_unavailable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind probe port");
        let addr = listener.local_addr().expect("local addr");
        drop(listener);

        let provider =
            HttpInferenceProvider::new(&format!("http://{addr}"), Duration::from_secs(2))
                .expect("provider");
        assert!(matches!(provider.load().await, Readiness::Unavailable(_)));
    }
}
