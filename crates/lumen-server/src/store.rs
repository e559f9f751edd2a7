use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type SetId = String;
pub type DynArtifactStore = Arc<dyn ArtifactStore>;

/// The two named slots of an artifact set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactSlot {
    Primary,
    Secondary,
}

impl ArtifactSlot {
    pub const ALL: [ArtifactSlot; 2] = [ArtifactSlot::Primary, ArtifactSlot::Secondary];

    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactSlot::Primary => "primary",
            ArtifactSlot::Secondary => "secondary",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "primary" => Some(ArtifactSlot::Primary),
            "secondary" => Some(ArtifactSlot::Secondary),
            _ => None,
        }
    }
}

impl fmt::Display for ArtifactSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactUpload {
    pub filename: String,
    pub content_type: String,
    pub bytes: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageReceipt {
    pub committed: bool,
    pub path: String,
}

/// Durable catalog row. Never mutated once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedArtifactSet {
    pub set_id: SetId,
    pub primary_path: String,
    pub secondary_path: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CommittedArtifactSet {
    pub fn path_for(&self, slot: ArtifactSlot) -> &str {
        match slot {
            ArtifactSlot::Primary => &self.primary_path,
            ArtifactSlot::Secondary => &self.secondary_path,
        }
    }
}

#[async_trait]
pub trait ArtifactStore: Send + Sync + 'static {
    async fn create_set(&self) -> Result<SetId, StoreError>;

    /// Writes one slot and attempts to finalize the set in the same critical section.
    async fn stage_artifact(
        &self,
        set_id: &str,
        slot: ArtifactSlot,
        upload: ArtifactUpload,
    ) -> Result<StageReceipt, StoreError>;

    async fn committed(&self, set_id: &str) -> Result<Option<CommittedArtifactSet>, StoreError>;

    async fn list_committed(&self) -> Result<Vec<CommittedArtifactSet>, StoreError>;

    /// True when committed paths are readable from this process.
    fn serves_local_files(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
pub struct StoreError {
    pub kind: StoreErrorKind,
    pub message: String,
}

impl StoreError {
    pub fn not_found(message: impl Into<String>) -> Self {
        StoreError {
            kind: StoreErrorKind::NotFound,
            message: message.into(),
        }
    }

    pub fn invalid_artifact(message: impl Into<String>) -> Self {
        StoreError {
            kind: StoreErrorKind::InvalidArtifact,
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        StoreError {
            kind: StoreErrorKind::Unavailable,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        StoreError {
            kind: StoreErrorKind::Internal,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    NotFound,
    InvalidArtifact,
    Unavailable,
    Internal,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for StoreError {}

/// Reduces a client-supplied filename to its last path component.
///
/// Returns `None` for names that would escape or alias a directory.
pub fn sanitize_filename(raw: &str) -> Option<String> {
    let last = raw
        .rsplit(['/', '\\'])
        .next()
        .map(str::trim)
        .unwrap_or_default();
    if last.is_empty() || last == "." || last == ".." || last.contains('\0') {
        return None;
    }
    Some(last.to_string())
}

/// Name a committed artifact carries in durable storage.
pub fn durable_file_name(set_id: &str, filename: &str) -> String {
    format!("{set_id}_{filename}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_keeps_last_component() {
        assert_eq!(sanitize_filename("scan.png").as_deref(), Some("scan.png"));
        assert_eq!(
            sanitize_filename("../../etc/passwd").as_deref(),
            Some("passwd")
        );
        assert_eq!(
            sanitize_filename(r"C:\Users\me\x-ray.jpg").as_deref(),
            Some("x-ray.jpg")
        );
    }

    #[test]
    fn sanitize_rejects_directory_aliases() {
        for raw in ["", " ", ".", "..", "dir/", "a/.."] {
            assert!(sanitize_filename(raw).is_none(), "`{raw}` must be rejected");
        }
    }

    #[test]
    fn slot_round_trips_through_str() {
        for slot in ArtifactSlot::ALL {
            assert_eq!(ArtifactSlot::parse(slot.as_str()), Some(slot));
        }
        assert_eq!(ArtifactSlot::parse("mask"), None);
    }
}
