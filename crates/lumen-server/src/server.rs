//! Web server entrypoints live here.

use std::{future::Future, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use axum::{
    Extension, Json, Router,
    body::Body,
    extract::{DefaultBodyLimit, MatchedPath, Multipart, Path, WebSocketUpgrade, multipart::MultipartError},
    http::{HeaderMap, HeaderName, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use thiserror::Error;
use tokio::{net::TcpListener, sync::watch};
use tower::ServiceExt;
use tower_http::{
    add_extension::AddExtensionLayer,
    classify::ServerErrorsFailureClass,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    services::ServeFile,
    trace::TraceLayer,
};
use uuid::Uuid;

use crate::config::{ServerConfig, SessionConfig};
use crate::gateway::{ArtifactAddress, ArtifactGateway, ForwardedHeaders, GatewayError, UpstreamReply};
use crate::inference::DynInferenceProvider;
use crate::session::SessionCoordinator;
use crate::socket::WsChannel;
use crate::store::{
    ArtifactSlot, ArtifactUpload, CommittedArtifactSet, DynArtifactStore, StoreError,
    StoreErrorKind, durable_file_name,
};

const HEALTHZ_PATH: &str = "/v1/healthz";
const UPLOAD_SOCKET_PATH: &str = "/api/upload/ws";
const SETS_PATH: &str = "/sets";
const SET_PATH: &str = "/sets/{set_id}";
const STAGE_PATH: &str = "/sets/{set_id}/{slot}";
const PRIMARY_FILE_PATH: &str = "/files/{set_id}/report/{filename}";
const SECONDARY_FILE_PATH: &str = "/files/{set_id}/mask";
const RAW_PRIMARY_FILE_PATH: &str = "/api/files/{set_id}/report/{filename}";
const RAW_SECONDARY_FILE_PATH: &str = "/api/files/{set_id}/mask";
const HEALTHZ_STATUS: &str = "ok";
const UPLOAD_FIELD: &str = "file";
const DEFAULT_UPLOAD_CONTENT_TYPE: &str = "application/octet-stream";
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
const ERROR_INVALID_PARAMETER: &str = "invalid_parameter";
const ERROR_NOT_FOUND: &str = "not_found";
const ERROR_METHOD_NOT_ALLOWED: &str = "method_not_allowed";
const ERROR_PAYLOAD_TOO_LARGE: &str = "payload_too_large";
const ERROR_UPSTREAM: &str = "upstream_error";
const ERROR_BAD_GATEWAY: &str = "bad_gateway";
const ERROR_GATEWAY_TIMEOUT: &str = "gateway_timeout";
const ERROR_UNAVAILABLE: &str = "service_unavailable";
const ERROR_INTERNAL: &str = "internal_server_error";
const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
struct HealthzResponse {
    status: &'static str,
    inference: String,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ShutdownEvent {
    Pending,
    CtrlC,
    SigTerm,
    ListenerFailed,
}

#[derive(Debug, Serialize)]
struct CreateSetResponse {
    success: bool,
    set_id: String,
}

#[derive(Debug, Serialize)]
struct StageResponse {
    success: bool,
    committed: bool,
    path: String,
}

#[derive(Debug, Serialize)]
struct ListSetsResponse {
    success: bool,
    items: Vec<CommittedArtifactSet>,
}

#[derive(Debug, Serialize)]
struct SetResponse {
    success: bool,
    item: CommittedArtifactSet,
}

type ApiStateHandle = Arc<ApiState>;

/// Collaborators shared by every request.
#[derive(Clone)]
pub struct ApiState {
    store: DynArtifactStore,
    inference: DynInferenceProvider,
    coordinator: SessionCoordinator,
    gateway: ArtifactGateway,
}

impl ApiState {
    pub fn new(
        store: DynArtifactStore,
        inference: DynInferenceProvider,
        gateway: ArtifactGateway,
        session: SessionConfig,
    ) -> Self {
        let coordinator =
            SessionCoordinator::new(Arc::clone(&store), Arc::clone(&inference), session);
        Self {
            store,
            inference,
            coordinator,
            gateway,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct ApiErrorBody {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_id: Option<String>,
}

#[derive(Debug, Clone)]
struct ApiError {
    status: StatusCode,
    body: ApiErrorBody,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("listen address may not be empty")]
    EmptyListenAddr,
    #[error("invalid listen address `{address}`: {source}")]
    InvalidListenAddr {
        address: String,
        #[source]
        source: std::net::AddrParseError,
    },
    #[error("failed to bind to {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to determine local address: {source}")]
    LocalAddr {
        #[source]
        source: std::io::Error,
    },
    #[error("axum server error: {source}")]
    Serve {
        #[source]
        source: std::io::Error,
    },
}

impl ApiError {
    fn new(status: StatusCode, error: &'static str, message: impl Into<String>) -> Self {
        ApiError {
            status,
            body: ApiErrorBody {
                error,
                message: message.into(),
                field: None,
                request_id: None,
            },
        }
    }

    fn with_field(mut self, field: &str) -> Self {
        debug_assert!(!field.is_empty());
        self.body.field = Some(field.to_string());
        self
    }

    fn with_request_id(mut self, request_id: Option<&str>) -> Self {
        if let Some(id) = request_id {
            debug_assert!(!id.is_empty());
            self.body.request_id = Some(id.to_string());
        }
        self
    }

    fn invalid_param(field: &str, message: impl Into<String>) -> Self {
        debug_assert!(!field.is_empty());
        ApiError::new(StatusCode::BAD_REQUEST, ERROR_INVALID_PARAMETER, message).with_field(field)
    }

    fn not_found(field: &str, message: impl Into<String>) -> Self {
        debug_assert!(!field.is_empty());
        ApiError::new(StatusCode::NOT_FOUND, ERROR_NOT_FOUND, message).with_field(field)
    }

    fn internal() -> Self {
        ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            ERROR_INTERNAL,
            "internal server error",
        )
    }

    fn resource_not_found(path: &str) -> Self {
        debug_assert!(path.starts_with('/'));
        ApiError::new(
            StatusCode::NOT_FOUND,
            ERROR_NOT_FOUND,
            format!("resource `{path}` not found"),
        )
    }

    fn method_not_allowed(method: &str, path: &str) -> Self {
        debug_assert!(!method.is_empty());
        debug_assert!(path.starts_with('/'));
        ApiError::new(
            StatusCode::METHOD_NOT_ALLOWED,
            ERROR_METHOD_NOT_ALLOWED,
            format!("method `{method}` not allowed for `{path}`"),
        )
    }

    fn upstream_status(status: StatusCode, body: String) -> Self {
        debug_assert!(status.is_client_error() || status.is_server_error());
        let code = if status == StatusCode::NOT_FOUND {
            ERROR_NOT_FOUND
        } else {
            ERROR_UPSTREAM
        };
        ApiError::new(status, code, body)
    }

    fn multipart(error: MultipartError) -> Self {
        let status = error.status();
        if status == StatusCode::PAYLOAD_TOO_LARGE {
            return ApiError::new(status, ERROR_PAYLOAD_TOO_LARGE, error.body_text());
        }
        ApiError::invalid_param(UPLOAD_FIELD, error.body_text())
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        match error.kind {
            StoreErrorKind::NotFound => ApiError::not_found("set_id", error.message),
            StoreErrorKind::InvalidArtifact => ApiError::invalid_param(UPLOAD_FIELD, error.message),
            StoreErrorKind::Unavailable => {
                tracing::warn!(message = %error.message, "artifact store unavailable");
                ApiError::new(StatusCode::SERVICE_UNAVAILABLE, ERROR_UNAVAILABLE, error.message)
            }
            StoreErrorKind::Internal => {
                tracing::error!(message = %error.message, "artifact store request failed");
                ApiError::internal()
            }
        }
    }
}

impl From<GatewayError> for ApiError {
    fn from(error: GatewayError) -> Self {
        tracing::warn!(%error, retryable = error.is_retryable(), "artifact relay failed");
        match error {
            GatewayError::Timeout { .. } => ApiError::new(
                StatusCode::GATEWAY_TIMEOUT,
                ERROR_GATEWAY_TIMEOUT,
                error.to_string(),
            ),
            GatewayError::Transport { .. }
            | GatewayError::InvalidUpstream { .. }
            | GatewayError::Client(_) => {
                ApiError::new(StatusCode::BAD_GATEWAY, ERROR_BAD_GATEWAY, error.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

pub fn build_api_router() -> Router {
    debug_assert!(HEALTHZ_PATH.starts_with("/v1/"));
    debug_assert!(HEALTHZ_PATH.ends_with("healthz"));

    Router::new()
        .route(
            HEALTHZ_PATH,
            get(healthz).fallback(method_not_allowed_handler),
        )
        .route(
            UPLOAD_SOCKET_PATH,
            get(upload_socket).fallback(method_not_allowed_handler),
        )
        .route(
            SETS_PATH,
            post(create_set)
                .get(list_sets)
                .fallback(method_not_allowed_handler),
        )
        .route(
            SET_PATH,
            get(get_set).fallback(method_not_allowed_handler),
        )
        .route(
            STAGE_PATH,
            post(stage_artifact).fallback(method_not_allowed_handler),
        )
        .route(
            PRIMARY_FILE_PATH,
            get(relay_primary).fallback(method_not_allowed_handler),
        )
        .route(
            SECONDARY_FILE_PATH,
            get(relay_secondary).fallback(method_not_allowed_handler),
        )
}

/// Raw byte source for committed artifacts stored on this host.
fn local_file_router() -> Router {
    Router::new()
        .route(
            RAW_PRIMARY_FILE_PATH,
            get(serve_primary_file).fallback(method_not_allowed_handler),
        )
        .route(
            RAW_SECONDARY_FILE_PATH,
            get(serve_secondary_file).fallback(method_not_allowed_handler),
        )
}

pub async fn serve(config: ServerConfig, state: ApiState) -> Result<(), ServerError> {
    debug_assert!(config.listen_addr.len() <= 128);
    debug_assert!(!config.listen_addr.contains('\n'));

    let listen_addr = parse_listen_addr(&config.listen_addr)?;
    let listener = bind_listener(listen_addr).await?;

    let local_addr = listener
        .local_addr()
        .map_err(|source| ServerError::LocalAddr { source })?;
    tracing::info!(%local_addr, "lumen server listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(ShutdownEvent::Pending);

    let shutdown_future = broadcast_shutdown(shutdown_tx);

    let app = build_app_router(&config, state);
    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();

    let mut server_future = Box::pin(async move {
        axum::serve(listener, make_service)
            .with_graceful_shutdown(shutdown_future)
            .await
    });

    let drain_rx = shutdown_rx.clone();
    let mut drain_timeout = Box::pin(drain_timeout_future(drain_rx));

    tokio::select! {
        result = server_future.as_mut() => {
            if let Err(source) = result {
                return Err(ServerError::Serve { source });
            }
        }
        _ = drain_timeout.as_mut() => {
            // Dropping the server future forces termination of lingering streams.
        }
    }

    let final_event = *shutdown_rx.borrow();
    if final_event == ShutdownEvent::Pending {
        tracing::info!("server stopped without external shutdown signal");
    } else {
        tracing::info!(?final_event, "server shutdown complete");
    }

    Ok(())
}

/// Full application router: routes, body limit, tracing, request ids and shared state.
pub fn build_app_router(config: &ServerConfig, state: ApiState) -> Router {
    debug_assert!(config.max_upload_bytes > 0);
    debug_assert_eq!(HEALTHZ_STATUS, "ok");

    let serves_local_files = state.store.serves_local_files();
    let state: ApiStateHandle = Arc::new(state);

    let mut router = Router::new().merge(build_api_router());
    if serves_local_files {
        router = router.merge(local_file_router());
    }
    router = router
        .fallback(not_found_handler)
        .layer(DefaultBodyLimit::max(config.max_upload_bytes));

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            let path = matched_path_or_uri(request);
            let request_id =
                header_request_id(request.headers()).unwrap_or_else(|| "-".to_string());
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                path = %path,
                request_id = %request_id
            )
        })
        .on_response(|response: &Response, latency: Duration, span: &tracing::Span| {
            let status = response.status().as_u16();
            let latency_ms = latency.as_millis().min(u128::from(u64::MAX)) as u64;
            tracing::info!(parent: span, status, latency_ms, "request completed");
        })
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, span: &tracing::Span| {
                let latency_ms = latency.as_millis().min(u128::from(u64::MAX)) as u64;
                tracing::error!(parent: span, latency_ms, error = %error, "request failed");
            },
        );

    router = router.layer(trace_layer);

    let request_id_header = HeaderName::from_static(REQUEST_ID_HEADER);
    let make_request_id = MakeRequestUuid::default();
    router = router
        .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
        .layer(SetRequestIdLayer::new(request_id_header, make_request_id));

    let max_message_bytes = config.max_upload_bytes;
    router
        .layer(AddExtensionLayer::new(UploadLimit(max_message_bytes)))
        .layer(AddExtensionLayer::new(state))
}

#[derive(Debug, Clone, Copy)]
struct UploadLimit(usize);

async fn healthz(Extension(state): Extension<ApiStateHandle>) -> impl IntoResponse {
    debug_assert_eq!(HEALTHZ_STATUS, "ok");

    Json(HealthzResponse {
        status: HEALTHZ_STATUS,
        inference: state.inference.readiness().to_string(),
    })
}

async fn upload_socket(
    Extension(state): Extension<ApiStateHandle>,
    Extension(UploadLimit(limit)): Extension<UploadLimit>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.max_message_size(limit)
        .on_upgrade(move |socket| async move {
            let mut channel = WsChannel::new(socket);
            let outcome = state.coordinator.run(&mut channel).await;
            tracing::info!(
                state = ?outcome.state,
                set_id = outcome.set_id.as_deref().unwrap_or("-"),
                "upload session finished"
            );
            channel.close().await;
        })
}

async fn create_set(
    Extension(state): Extension<ApiStateHandle>,
) -> Result<Json<CreateSetResponse>, ApiError> {
    let set_id = state.store.create_set().await?;
    tracing::info!(%set_id, "staging set created");
    Ok(Json(CreateSetResponse {
        success: true,
        set_id,
    }))
}

async fn list_sets(
    Extension(state): Extension<ApiStateHandle>,
) -> Result<Json<ListSetsResponse>, ApiError> {
    let items = state.store.list_committed().await?;
    Ok(Json(ListSetsResponse {
        success: true,
        items,
    }))
}

async fn get_set(
    Extension(state): Extension<ApiStateHandle>,
    Path(set_id): Path<String>,
) -> Result<Json<SetResponse>, ApiError> {
    let item = committed_or_not_found(&state, &set_id).await?;
    Ok(Json(SetResponse {
        success: true,
        item,
    }))
}

async fn stage_artifact(
    Extension(state): Extension<ApiStateHandle>,
    Path((set_id, slot)): Path<(String, String)>,
    multipart: Multipart,
) -> Result<Json<StageResponse>, ApiError> {
    let Some(slot) = ArtifactSlot::parse(&slot) else {
        return Err(ApiError::not_found(
            "slot",
            format!("slot `{slot}` does not exist; expected primary or secondary"),
        ));
    };
    let upload = read_upload(multipart).await?;
    let size = upload.bytes.len();
    let receipt = state.store.stage_artifact(&set_id, slot, upload).await?;
    tracing::info!(%set_id, %slot, size, committed = receipt.committed, "artifact staged");
    Ok(Json(StageResponse {
        success: true,
        committed: receipt.committed,
        path: receipt.path,
    }))
}

async fn read_upload(mut multipart: Multipart) -> Result<ArtifactUpload, ApiError> {
    while let Some(field) = multipart.next_field().await.map_err(ApiError::multipart)? {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        let filename = field
            .file_name()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("upload_{}", Uuid::new_v4().simple()));
        let content_type = field
            .content_type()
            .unwrap_or(DEFAULT_UPLOAD_CONTENT_TYPE)
            .to_string();
        let bytes = field.bytes().await.map_err(ApiError::multipart)?;
        return Ok(ArtifactUpload {
            filename,
            content_type,
            bytes,
        });
    }
    Err(ApiError::invalid_param(
        UPLOAD_FIELD,
        "multipart field `file` is required",
    ))
}

async fn relay_primary(
    Extension(state): Extension<ApiStateHandle>,
    Path((set_id, filename)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    committed_or_not_found(&state, &set_id).await?;
    let address = ArtifactAddress::Primary {
        set_id: &set_id,
        filename: &filename,
    };
    relay(&state.gateway, address, &headers).await
}

async fn relay_secondary(
    Extension(state): Extension<ApiStateHandle>,
    Path(set_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    committed_or_not_found(&state, &set_id).await?;
    relay(&state.gateway, ArtifactAddress::Secondary { set_id: &set_id }, &headers).await
}

async fn relay(
    gateway: &ArtifactGateway,
    address: ArtifactAddress<'_>,
    headers: &HeaderMap,
) -> Result<Response, ApiError> {
    let forwarded = ForwardedHeaders::from_request(headers);
    match gateway.fetch(address, &forwarded).await? {
        UpstreamReply::Stream(stream) => Ok(stream.into_response()),
        UpstreamReply::ErrorStatus { status, body } => {
            tracing::debug!(%status, "upstream answered with an error status");
            Err(ApiError::upstream_status(status, body))
        }
    }
}

async fn serve_primary_file(
    Extension(state): Extension<ApiStateHandle>,
    Path((set_id, filename)): Path<(String, String)>,
    request: Request<Body>,
) -> Result<Response, ApiError> {
    let set = committed_or_not_found(&state, &set_id).await?;
    let path = PathBuf::from(&set.primary_path);
    let expected = durable_file_name(&set_id, &filename);
    if path.file_name().and_then(|name| name.to_str()) != Some(expected.as_str()) {
        return Err(ApiError::not_found(
            "filename",
            format!("set `{set_id}` has no report named `{filename}`"),
        ));
    }
    Ok(serve_file(path, request).await)
}

async fn serve_secondary_file(
    Extension(state): Extension<ApiStateHandle>,
    Path(set_id): Path<String>,
    request: Request<Body>,
) -> Result<Response, ApiError> {
    let set = committed_or_not_found(&state, &set_id).await?;
    Ok(serve_file(PathBuf::from(&set.secondary_path), request).await)
}

/// Range, conditional and HEAD handling are delegated to `ServeFile`.
async fn serve_file(path: PathBuf, request: Request<Body>) -> Response {
    match ServeFile::new(path).oneshot(request).await {
        Ok(response) => response.map(Body::new),
        Err(never) => match never {},
    }
}

async fn committed_or_not_found(
    state: &ApiState,
    set_id: &str,
) -> Result<CommittedArtifactSet, ApiError> {
    state.store.committed(set_id).await?.ok_or_else(|| {
        ApiError::not_found("set_id", format!("set `{set_id}` has no committed artifacts"))
    })
}

async fn method_not_allowed_handler(request: Request<Body>) -> Response {
    debug_assert!(request.uri().path().starts_with('/'));
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let request_id = header_request_id(request.headers());
    ApiError::method_not_allowed(&method, &path)
        .with_request_id(request_id.as_deref())
        .into_response()
}

async fn not_found_handler(request: Request<Body>) -> Response {
    debug_assert!(request.uri().path().starts_with('/'));
    let path = request.uri().path().to_string();
    let request_id = header_request_id(request.headers());
    ApiError::resource_not_found(&path)
        .with_request_id(request_id.as_deref())
        .into_response()
}

fn matched_path_or_uri<B>(request: &Request<B>) -> String {
    if let Some(path) = request.extensions().get::<MatchedPath>() {
        return path.as_str().to_string();
    }
    request.uri().path().to_string()
}

fn header_request_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| value.to_string())
}

async fn wait_for_shutdown() -> ShutdownEvent {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => ShutdownEvent::CtrlC,
            Err(error) => {
                tracing::warn!(%error, "failed to capture Ctrl+C signal");
                ShutdownEvent::ListenerFailed
            }
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => match term.recv().await {
                Some(_) => ShutdownEvent::SigTerm,
                None => ShutdownEvent::ListenerFailed,
            },
            Err(error) => {
                tracing::warn!(%error, "failed to capture SIGTERM");
                ShutdownEvent::ListenerFailed
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending();

    tokio::select! {
        event = ctrl_c => event,
        event = sigterm => event,
    }
}

fn parse_listen_addr(addr: &str) -> Result<SocketAddr, ServerError> {
    let trimmed = addr.trim();
    if trimmed.is_empty() {
        return Err(ServerError::EmptyListenAddr);
    }

    trimmed
        .parse()
        .map_err(|source| ServerError::InvalidListenAddr {
            address: trimmed.to_string(),
            source,
        })
}

async fn bind_listener(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind {
            address: addr.to_string(),
            source,
        })
}

fn broadcast_shutdown(
    sender: watch::Sender<ShutdownEvent>,
) -> impl Future<Output = ()> + Send + 'static {
    debug_assert!(!sender.is_closed());
    async move {
        let event = wait_for_shutdown().await;
        debug_assert!(event != ShutdownEvent::Pending);
        if let Err(error) = sender.send(event) {
            tracing::warn!(?event, %error, "failed to broadcast shutdown event");
        }
    }
}

fn drain_timeout_future(
    mut receiver: watch::Receiver<ShutdownEvent>,
) -> impl Future<Output = ()> + Send + 'static {
    debug_assert!(DRAIN_TIMEOUT.as_secs() >= 1);
    async move {
        if receiver.changed().await.is_ok() {
            let event = *receiver.borrow_and_update();
            tracing::info!(?event, "shutdown signal received; draining connections");
            tokio::time::sleep(DRAIN_TIMEOUT).await;
            tracing::warn!(
                ?event,
                seconds = DRAIN_TIMEOUT.as_secs(),
                "graceful shutdown timed out; continuing shutdown"
            );
        }
    }
}
