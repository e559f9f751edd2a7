//! Streaming retrieval gateway.
//!
//! Reads a committed artifact from an upstream byte source and relays it to
//! the caller. The upstream is probed with `HEAD` first; servers that reject
//! `HEAD` with 405 are read with a single `GET` whose response becomes
//! authoritative. Bodies are relayed in bounded chunks and never buffered.

use std::io;
use std::time::Duration;

use axum::{
    body::Body,
    http::{
        HeaderMap, HeaderName, HeaderValue, Method, StatusCode,
        header::{
            ACCEPT_RANGES, AUTHORIZATION, CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_RANGE,
            CONTENT_TYPE, ETAG, RANGE,
        },
    },
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::{Client, RequestBuilder, Url};
use thiserror::Error;

use crate::config::GatewayConfig;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const FORWARDED_RESPONSE_HEADERS: [HeaderName; 5] = [
    CONTENT_RANGE,
    ACCEPT_RANGES,
    CONTENT_DISPOSITION,
    CACHE_CONTROL,
    ETAG,
];

/// Address of one committed artifact in the upstream namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactAddress<'a> {
    Primary { set_id: &'a str, filename: &'a str },
    Secondary { set_id: &'a str },
}

impl ArtifactAddress<'_> {
    /// Segments below the `/files` (caller) or `/api/files` (upstream) prefix.
    fn segments(&self) -> Vec<&str> {
        match *self {
            ArtifactAddress::Primary { set_id, filename } => {
                vec!["files", set_id, "report", filename]
            }
            ArtifactAddress::Secondary { set_id } => vec!["files", set_id, "mask"],
        }
    }

    /// Escaped caller-facing path, e.g. `/files/{set_id}/mask`.
    pub fn relay_path(&self) -> String {
        let mut url = Url::parse("http://localhost/").expect("static base url parses");
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.clear().extend(self.segments());
        }
        url.path().to_string()
    }
}

/// Caller headers that are replayed against the upstream.
#[derive(Debug, Clone, Default)]
pub struct ForwardedHeaders {
    pub range: Option<HeaderValue>,
    pub authorization: Option<HeaderValue>,
}

impl ForwardedHeaders {
    pub fn from_request(headers: &HeaderMap) -> Self {
        Self {
            range: headers.get(RANGE).cloned(),
            authorization: headers.get(AUTHORIZATION).cloned(),
        }
    }

    fn apply(&self, mut builder: RequestBuilder) -> RequestBuilder {
        if let Some(range) = &self.range {
            builder = builder.header(RANGE, range.clone());
        }
        if let Some(authorization) = &self.authorization {
            builder = builder.header(AUTHORIZATION, authorization.clone());
        }
        builder
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("upstream {method} {url} failed: {source}")]
    Transport {
        method: Method,
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("upstream {method} {url} timed out after {timeout_ms}ms")]
    Timeout {
        method: Method,
        url: String,
        timeout_ms: u64,
    },
    #[error("invalid upstream url `{url}`: {reason}")]
    InvalidUpstream { url: String, reason: String },
    #[error("failed to build upstream client: {0}")]
    Client(#[source] reqwest::Error),
}

impl GatewayError {
    /// Transport-level failures may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::Transport { .. } | GatewayError::Timeout { .. }
        )
    }
}

/// Outcome of upstream negotiation.
#[derive(Debug)]
pub enum UpstreamReply {
    Stream(UpstreamStream),
    ErrorStatus { status: StatusCode, body: String },
}

/// An opened upstream body plus the headers that will be relayed.
///
/// Owns the upstream response; dropping it releases the connection.
#[derive(Debug)]
pub struct UpstreamStream {
    pub status: StatusCode,
    pub headers: HeaderMap,
    response: reqwest::Response,
    chunk_size: usize,
}

impl UpstreamStream {
    pub fn into_body_stream(self) -> impl Stream<Item = Result<Bytes, io::Error>> + Send + 'static {
        relay_chunks(self.response, self.chunk_size)
    }
}

impl IntoResponse for UpstreamStream {
    fn into_response(self) -> Response {
        let status = self.status;
        let headers = self.headers.clone();
        let mut response = Response::new(Body::from_stream(self.into_body_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactGateway {
    http: Client,
    upstream: Url,
    head_timeout: Duration,
    get_timeout: Duration,
    chunk_size: usize,
    error_body_limit: usize,
}

impl ArtifactGateway {
    pub fn new(config: &GatewayConfig, upstream: &str) -> Result<Self, GatewayError> {
        let upstream = Url::parse(upstream).map_err(|error| GatewayError::InvalidUpstream {
            url: upstream.to_string(),
            reason: error.to_string(),
        })?;
        if upstream.cannot_be_a_base() {
            return Err(GatewayError::InvalidUpstream {
                url: upstream.to_string(),
                reason: "url cannot carry path segments".to_string(),
            });
        }
        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(config.get_timeout())
            .build()
            .map_err(GatewayError::Client)?;
        Ok(Self {
            http,
            upstream,
            head_timeout: config.head_timeout(),
            get_timeout: config.get_timeout(),
            chunk_size: config.chunk_size_bytes.get(),
            error_body_limit: config.error_body_limit_bytes,
        })
    }

    pub fn upstream(&self) -> &Url {
        &self.upstream
    }

    pub fn artifact_url(&self, address: ArtifactAddress<'_>) -> Url {
        let mut url = self.upstream.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .push("api")
                .extend(address.segments());
        }
        url
    }

    pub async fn fetch(
        &self,
        address: ArtifactAddress<'_>,
        forwarded: &ForwardedHeaders,
    ) -> Result<UpstreamReply, GatewayError> {
        let url = self.artifact_url(address);

        let head = self
            .send(Method::HEAD, &url, forwarded, self.head_timeout)
            .await?;
        if head.status() == StatusCode::METHOD_NOT_ALLOWED {
            tracing::debug!(%url, "upstream rejected HEAD; falling back to GET");
            let get = self
                .send(Method::GET, &url, forwarded, self.get_timeout)
                .await?;
            if is_error_status(get.status()) {
                return Ok(self.error_reply(get).await);
            }
            let status = get.status();
            let headers = relay_headers(get.headers());
            return Ok(UpstreamReply::Stream(self.stream(status, headers, get)));
        }
        if is_error_status(head.status()) {
            return Ok(self.error_reply(head).await);
        }

        let status = head.status();
        let headers = relay_headers(head.headers());
        drop(head);
        let get = self
            .send(Method::GET, &url, forwarded, self.get_timeout)
            .await?;
        if is_error_status(get.status()) {
            return Ok(self.error_reply(get).await);
        }
        Ok(UpstreamReply::Stream(self.stream(status, headers, get)))
    }

    fn stream(
        &self,
        status: StatusCode,
        headers: HeaderMap,
        response: reqwest::Response,
    ) -> UpstreamStream {
        UpstreamStream {
            status,
            headers,
            response,
            chunk_size: self.chunk_size,
        }
    }

    /// Bounds the wait for response headers only; body reads use the client read timeout.
    async fn send(
        &self,
        method: Method,
        url: &Url,
        forwarded: &ForwardedHeaders,
        limit: Duration,
    ) -> Result<reqwest::Response, GatewayError> {
        let request = forwarded.apply(self.http.request(method.clone(), url.clone()));
        match tokio::time::timeout(limit, request.send()).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(source)) if source.is_timeout() => Err(GatewayError::Timeout {
                method,
                url: url.to_string(),
                timeout_ms: limit.as_millis() as u64,
            }),
            Ok(Err(source)) => Err(GatewayError::Transport {
                method,
                url: url.to_string(),
                source,
            }),
            Err(_) => Err(GatewayError::Timeout {
                method,
                url: url.to_string(),
                timeout_ms: limit.as_millis() as u64,
            }),
        }
    }

    async fn error_reply(&self, mut response: reqwest::Response) -> UpstreamReply {
        let status = response.status();
        let mut body = Vec::new();
        while body.len() < self.error_body_limit {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    let room = self.error_body_limit - body.len();
                    body.extend_from_slice(&chunk[..chunk.len().min(room)]);
                }
                Ok(None) => break,
                Err(error) => {
                    tracing::debug!(%error, %status, "upstream error body unreadable");
                    break;
                }
            }
        }
        UpstreamReply::ErrorStatus {
            status,
            body: String::from_utf8_lossy(&body).into_owned(),
        }
    }
}

fn is_error_status(status: StatusCode) -> bool {
    status.is_client_error() || status.is_server_error()
}

/// Keeps the allow-listed headers and settles the content type. Never relays `content-length`.
fn relay_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for name in FORWARDED_RESPONSE_HEADERS {
        if let Some(value) = upstream.get(&name) {
            headers.insert(name, value.clone());
        }
    }
    let content_type = upstream
        .get(CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static(DEFAULT_CONTENT_TYPE));
    headers.insert(CONTENT_TYPE, content_type);
    headers
}

/// Re-chunks the upstream body into pieces of at most `chunk_size` bytes.
///
/// A mid-stream failure yields one final `Err` and ends the stream, so the
/// server aborts the transfer instead of finishing a short body cleanly.
fn relay_chunks(
    response: reqwest::Response,
    chunk_size: usize,
) -> impl Stream<Item = Result<Bytes, io::Error>> + Send + 'static {
    debug_assert!(chunk_size > 0);
    let url = response.url().to_string();
    async_stream::stream! {
        let mut upstream = response.bytes_stream();
        while let Some(next) = upstream.next().await {
            match next {
                Ok(mut chunk) => {
                    while chunk.len() > chunk_size {
                        yield Ok::<Bytes, io::Error>(chunk.split_to(chunk_size));
                    }
                    if !chunk.is_empty() {
                        yield Ok(chunk);
                    }
                }
                Err(error) => {
                    tracing::warn!(%url, %error, "upstream stream failed; truncating response");
                    yield Err(io::Error::other(format!("upstream body from {url} ended early: {error}")));
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway(upstream: &str) -> ArtifactGateway {
        ArtifactGateway::new(&GatewayConfig::default(), upstream).expect("valid upstream")
    }

    #[test]
    fn artifact_urls_escape_segments() {
        let gateway = gateway("http://store.local:9000/base/");
        let url = gateway.artifact_url(ArtifactAddress::Primary {
            set_id: "abc",
            filename: "my scan.png",
        });
        assert_eq!(
            url.as_str(),
            "http://store.local:9000/base/api/files/abc/report/my%20scan.png"
        );
        let mask = gateway.artifact_url(ArtifactAddress::Secondary { set_id: "abc" });
        assert_eq!(mask.as_str(), "http://store.local:9000/base/api/files/abc/mask");
    }

    #[test]
    fn rejects_non_hierarchical_upstream() {
        let error = ArtifactGateway::new(&GatewayConfig::default(), "mailto:ops@example.com")
            .expect_err("mailto cannot be a base");
        assert!(matches!(error, GatewayError::InvalidUpstream { .. }));
        assert!(!error.is_retryable());
    }

    #[test]
    fn relay_headers_filters_and_defaults_content_type() {
        let mut upstream = HeaderMap::new();
        upstream.insert(ETAG, HeaderValue::from_static("\"abc\""));
        upstream.insert(
            axum::http::header::CONTENT_LENGTH,
            HeaderValue::from_static("42"),
        );
        upstream.insert(
            axum::http::header::SET_COOKIE,
            HeaderValue::from_static("session=1"),
        );

        let headers = relay_headers(&upstream);

        assert_eq!(headers.get(ETAG).unwrap(), "\"abc\"");
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), DEFAULT_CONTENT_TYPE);
        assert!(headers.get(axum::http::header::CONTENT_LENGTH).is_none());
        assert!(headers.get(axum::http::header::SET_COOKIE).is_none());
    }
}
