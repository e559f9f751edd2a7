//! Upload session coordinator.
//!
//! One [`SessionCoordinator::run`] call drives a single client from the
//! metadata handshake through primary staging, inference and derived-artifact
//! staging to a terminal report. Steps execute strictly in order; the client
//! transport is abstracted behind [`SessionChannel`].

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::gateway::ArtifactAddress;
use crate::inference::{DynInferenceProvider, InferenceResult};
use crate::messages::{
    FileMetadata, MaskReport, MetadataParseError, ServerMessage, UploadSummary, VisionReport,
    parse_metadata,
};
use crate::store::{
    ArtifactSlot, ArtifactUpload, DynArtifactStore, SetId, StoreError, StoreErrorKind,
    sanitize_filename,
};

const IMAGE_CONTENT_PREFIX: &str = "image/";
const SUMMARY_STATUS: &str = "processed";
pub const SECONDARY_FILENAME: &str = "mask.png";
pub const SECONDARY_CONTENT_TYPE: &str = "image/png";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionState {
    Init,
    AwaitingMetadata,
    MetadataValidated,
    StagingCreated,
    AwaitingPayload,
    PrimaryStaged,
    InferenceRequested,
    SecondaryStaged,
    InferenceSkipped,
    Finalized,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Finalized | SessionState::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStep {
    CreateSet,
    StagePrimary,
    StageSecondary,
}

impl fmt::Display for SessionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionStep::CreateSet => "create set",
            SessionStep::StagePrimary => "stage primary artifact",
            SessionStep::StageSecondary => "stage secondary artifact",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{0}")]
    Protocol(String),
    #[error("{0}")]
    Validation(String),
    #[error("{step} failed: {message}")]
    UpstreamUnavailable { step: SessionStep, message: String },
    #[error("{step} failed: {message}")]
    NotFound { step: SessionStep, message: String },
    #[error("client disconnected")]
    Disconnected,
}

impl SessionError {
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::Protocol(_) => "protocol_error",
            SessionError::Validation(_) => "validation_error",
            SessionError::UpstreamUnavailable { .. } => "upstream_unavailable",
            SessionError::NotFound { .. } => "not_found",
            SessionError::Disconnected => "disconnected",
        }
    }

    fn from_store(step: SessionStep, error: StoreError) -> Self {
        match error.kind {
            StoreErrorKind::NotFound => SessionError::NotFound {
                step,
                message: error.message,
            },
            StoreErrorKind::InvalidArtifact => {
                SessionError::Validation(format!("{step} rejected: {}", error.message))
            }
            StoreErrorKind::Unavailable | StoreErrorKind::Internal => {
                SessionError::UpstreamUnavailable {
                    step,
                    message: error.message,
                }
            }
        }
    }
}

impl From<ChannelClosed> for SessionError {
    fn from(_: ChannelClosed) -> Self {
        SessionError::Disconnected
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Binary(Bytes),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("session channel closed")]
pub struct ChannelClosed;

/// Bidirectional transport between the coordinator and one client.
#[async_trait]
pub trait SessionChannel: Send {
    async fn recv(&mut self) -> Result<Inbound, ChannelClosed>;
    async fn send(&mut self, message: &ServerMessage) -> Result<(), ChannelClosed>;
}

/// Transient per-connection state. Dropped with the connection.
#[derive(Debug, Clone)]
pub struct UploadSession {
    state: SessionState,
    filename: String,
    declared_size: u64,
    content_type: String,
    received: u64,
    set_id: Option<SetId>,
}

impl UploadSession {
    fn new() -> Self {
        Self {
            state: SessionState::Init,
            filename: String::new(),
            declared_size: 0,
            content_type: String::new(),
            received: 0,
            set_id: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn advance(&mut self, next: SessionState) {
        debug_assert!(!self.state.is_terminal(), "terminal sessions never transition");
        debug_assert!(next > self.state, "session transitions only move forward");
        tracing::debug!(from = ?self.state, to = ?next, set_id = ?self.set_id, "session transition");
        self.state = next;
    }

    fn accept(&mut self, metadata: FileMetadata) -> Result<(), SessionError> {
        let content_type = metadata.content_type.unwrap_or_default();
        if !content_type.starts_with(IMAGE_CONTENT_PREFIX) {
            return Err(SessionError::Validation(format!(
                "Only image files are allowed, got `{content_type}`"
            )));
        }
        let filename = match metadata.filename.as_deref().map(str::trim) {
            None | Some("") => format!("upload_{}", Uuid::new_v4().simple()),
            Some(raw) => sanitize_filename(raw).ok_or_else(|| {
                SessionError::Validation(format!("filename `{raw}` is not usable"))
            })?,
        };
        self.filename = filename;
        self.content_type = content_type;
        self.declared_size = metadata.size.unwrap_or(0);
        Ok(())
    }
}

#[derive(Debug)]
pub struct SessionOutcome {
    pub state: SessionState,
    pub set_id: Option<SetId>,
    pub error: Option<SessionError>,
}

/// Percentage of the declared size received so far, clamped to 100.
pub fn progress_percent(received: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let percent = u128::from(received) * 100 / u128::from(total);
    percent.min(100) as u8
}

pub fn primary_url(set_id: &str, filename: &str) -> String {
    ArtifactAddress::Primary { set_id, filename }.relay_path()
}

pub fn secondary_url(set_id: &str) -> String {
    ArtifactAddress::Secondary { set_id }.relay_path()
}

async fn bounded<T, F>(step: SessionStep, limit: Duration, future: F) -> Result<T, SessionError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, future).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(SessionError::from_store(step, error)),
        Err(_) => Err(SessionError::UpstreamUnavailable {
            step,
            message: format!("timed out after {}ms", limit.as_millis()),
        }),
    }
}

#[derive(Clone)]
pub struct SessionCoordinator {
    store: DynArtifactStore,
    inference: DynInferenceProvider,
    config: SessionConfig,
}

impl SessionCoordinator {
    pub fn new(
        store: DynArtifactStore,
        inference: DynInferenceProvider,
        config: SessionConfig,
    ) -> Self {
        Self {
            store,
            inference,
            config,
        }
    }

    pub async fn run<C>(&self, channel: &mut C) -> SessionOutcome
    where
        C: SessionChannel + ?Sized,
    {
        let mut session = UploadSession::new();
        let error = match self.drive(&mut session, channel).await {
            Ok(()) => {
                session.advance(SessionState::Finalized);
                None
            }
            Err(SessionError::Disconnected) => {
                tracing::info!(state = ?session.state, set_id = ?session.set_id, "client disconnected; session abandoned");
                session.advance(SessionState::Failed);
                Some(SessionError::Disconnected)
            }
            Err(error) => {
                tracing::warn!(state = ?session.state, set_id = ?session.set_id, %error, "upload session failed");
                let report = ServerMessage::Error {
                    error: error.code().to_string(),
                    message: error.to_string(),
                };
                if channel.send(&report).await.is_err() {
                    tracing::debug!("client left before the error report");
                }
                session.advance(SessionState::Failed);
                Some(error)
            }
        };
        SessionOutcome {
            state: session.state,
            set_id: session.set_id,
            error,
        }
    }

    async fn drive<C>(
        &self,
        session: &mut UploadSession,
        channel: &mut C,
    ) -> Result<(), SessionError>
    where
        C: SessionChannel + ?Sized,
    {
        session.advance(SessionState::AwaitingMetadata);
        channel
            .send(&ServerMessage::status("Server connected"))
            .await?;

        let metadata = match channel.recv().await? {
            Inbound::Text(text) => {
                parse_metadata(&text).map_err(|error| SessionError::Protocol(error.message()))?
            }
            Inbound::Binary(_) => {
                return Err(SessionError::Protocol(
                    MetadataParseError::NotMetadata.message(),
                ));
            }
        };
        session.accept(metadata)?;
        channel
            .send(&ServerMessage::status(format!(
                "Received metadata for {}",
                session.filename
            )))
            .await?;
        session.advance(SessionState::MetadataValidated);

        let set_id = bounded(
            SessionStep::CreateSet,
            self.config.create_timeout(),
            self.store.create_set(),
        )
        .await?;
        tracing::info!(%set_id, filename = %session.filename, "staging set created");
        session.set_id = Some(set_id.clone());
        session.advance(SessionState::StagingCreated);

        session.advance(SessionState::AwaitingPayload);
        channel
            .send(&ServerMessage::status(format!(
                "Ready to receive file {}",
                session.filename
            )))
            .await?;
        let payload = match channel.recv().await? {
            Inbound::Binary(bytes) => bytes,
            Inbound::Text(_) => {
                return Err(SessionError::Protocol(
                    "Expected binary file payload".to_string(),
                ));
            }
        };
        session.received = payload.len() as u64;
        let progress = progress_percent(session.received, session.declared_size);
        channel
            .send(&ServerMessage::Progress {
                progress,
                received: session.received,
                total: session.declared_size,
                message: format!(
                    "Received {} of {} bytes ({progress}%)",
                    session.received, session.declared_size
                ),
            })
            .await?;

        let upload = ArtifactUpload {
            filename: session.filename.clone(),
            content_type: session.content_type.clone(),
            bytes: payload.clone(),
        };
        let primary = bounded(
            SessionStep::StagePrimary,
            self.config.upload_timeout(),
            self.store
                .stage_artifact(&set_id, ArtifactSlot::Primary, upload),
        )
        .await?;
        session.advance(SessionState::PrimaryStaged);
        channel
            .send(&ServerMessage::status(format!(
                "File saved successfully at {}",
                primary.path
            )))
            .await?;

        session.advance(SessionState::InferenceRequested);
        channel
            .send(&ServerMessage::status("Running image analysis"))
            .await?;
        let result = self.infer(payload, session).await;
        let vision = self
            .stage_derived(&set_id, result, session, channel)
            .await?;

        let summary = UploadSummary {
            url: primary_url(&set_id, &session.filename),
            id: set_id,
            filename: session.filename.clone(),
            size: session.received,
            content_type: session.content_type.clone(),
            uploaded_at: Utc::now().to_rfc3339(),
            status: SUMMARY_STATUS,
            vision_result: Some(vision),
        };
        channel
            .send(&ServerMessage::Success {
                data: summary,
                message: "Upload complete and processed successfully".to_string(),
            })
            .await?;
        Ok(())
    }

    async fn infer(&self, payload: Bytes, session: &UploadSession) -> InferenceResult {
        let limit = self.config.inference_timeout();
        let call = self
            .inference
            .predict(payload, &session.content_type, &session.filename);
        match tokio::time::timeout(limit, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(error)) => {
                tracing::warn!(%error, set_id = ?session.set_id, "inference call failed");
                InferenceResult::failed(error.to_string())
            }
            Err(_) => {
                tracing::warn!(set_id = ?session.set_id, timeout_ms = limit.as_millis() as u64, "inference call timed out");
                InferenceResult::failed(format!(
                    "inference timed out after {}ms",
                    limit.as_millis()
                ))
            }
        }
    }

    /// Stages the derived artifact when inference produced one. Never fatal.
    async fn stage_derived<C>(
        &self,
        set_id: &str,
        result: InferenceResult,
        session: &mut UploadSession,
        channel: &mut C,
    ) -> Result<VisionReport, SessionError>
    where
        C: SessionChannel + ?Sized,
    {
        let mut report = VisionReport {
            success: result.success,
            statistics: result.stats,
            error: result.error,
            mask: None,
        };
        let derived = match result.derived {
            Some(bytes) if report.success && !bytes.is_empty() => bytes,
            _ => {
                if !report.success {
                    let reason = report.error.as_deref().unwrap_or("unknown error");
                    channel
                        .send(&ServerMessage::status(format!(
                            "Image analysis failed: {reason}"
                        )))
                        .await?;
                }
                session.advance(SessionState::InferenceSkipped);
                return Ok(report);
            }
        };

        channel
            .send(&ServerMessage::status("Saving analysis mask"))
            .await?;
        let upload = ArtifactUpload {
            filename: SECONDARY_FILENAME.to_string(),
            content_type: SECONDARY_CONTENT_TYPE.to_string(),
            bytes: derived,
        };
        let staged = bounded(
            SessionStep::StageSecondary,
            self.config.upload_timeout(),
            self.store
                .stage_artifact(set_id, ArtifactSlot::Secondary, upload),
        )
        .await;
        match staged {
            Ok(receipt) => {
                session.advance(SessionState::SecondaryStaged);
                let message = if receipt.committed {
                    "Analysis mask committed"
                } else {
                    "Analysis mask staged"
                };
                report.mask = Some(MaskReport {
                    staged: true,
                    committed: receipt.committed,
                    url: receipt.committed.then(|| secondary_url(set_id)),
                    path: Some(receipt.path),
                    error: None,
                });
                channel.send(&ServerMessage::status(message)).await?;
            }
            Err(error) => {
                tracing::warn!(%set_id, %error, "secondary staging failed; set stays pending");
                session.advance(SessionState::InferenceSkipped);
                channel
                    .send(&ServerMessage::status(format!(
                        "Analysis mask could not be saved: {error}"
                    )))
                    .await?;
                report.mask = Some(MaskReport {
                    staged: false,
                    committed: false,
                    path: None,
                    url: None,
                    error: Some(error.to_string()),
                });
            }
        }
        Ok(report)
    }
}
