//! Filesystem path helpers (XDG-aware) for the catalog, staging and durable artifacts.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use lumen_server::ArtifactSlot;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("unable to determine project directories")]
    MissingProjectDirs,
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid set identifier `{set_id}`")]
    InvalidSetId { set_id: String },
}

/// Container providing filesystem paths for the application. In production this is
/// rooted at `$XDG_DATA_HOME/lumen`; tests may construct custom instances.
#[derive(Debug, Clone)]
pub struct AppPaths {
    base_dir: PathBuf,
}

impl AppPaths {
    /// Construct paths rooted under `$XDG_DATA_HOME/lumen`.
    pub fn from_project_dirs() -> Result<Self, PathError> {
        let dirs = ProjectDirs::from("dev", "lumen", "lumen").ok_or(PathError::MissingProjectDirs)?;
        Self::new(dirs.data_dir())
    }

    /// Construct paths rooted under the provided directory, ensuring it exists.
    pub fn new<P: AsRef<Path>>(base: P) -> Result<Self, PathError> {
        let base = base.as_ref().to_path_buf();
        ensure_dir(&base)?;
        Ok(Self { base_dir: base })
    }

    pub fn data_dir(&self) -> PathBuf {
        self.base_dir.clone()
    }

    /// LMDB environment directory for the committed-set catalog (`.../lmdb/catalog`).
    pub fn catalog_lmdb_dir(&self) -> Result<PathBuf, PathError> {
        self.ensure_child(&["lmdb", "catalog"])
    }

    /// Root of all pending sets (`.../staging`).
    pub fn staging_dir(&self) -> Result<PathBuf, PathError> {
        self.ensure_child(&["staging"])
    }

    /// Staging area of one set, without creating it.
    pub fn staging_set_dir(&self, set_id: &str) -> Result<PathBuf, PathError> {
        if Uuid::parse_str(set_id).is_err() {
            return Err(PathError::InvalidSetId {
                set_id: set_id.to_owned(),
            });
        }
        Ok(self.base_dir.join("staging").join(set_id))
    }

    /// Durable directory for committed artifacts of one slot
    /// (`.../reports` for primaries, `.../masks` for secondaries).
    pub fn durable_dir(&self, slot: ArtifactSlot) -> Result<PathBuf, PathError> {
        match slot {
            ArtifactSlot::Primary => self.ensure_child(&["reports"]),
            ArtifactSlot::Secondary => self.ensure_child(&["masks"]),
        }
    }

    fn ensure_child(&self, segments: &[&str]) -> Result<PathBuf, PathError> {
        let mut path = self.base_dir.clone();
        for segment in segments {
            path.push(segment);
        }
        ensure_dir(&path)
    }
}

fn ensure_dir(path: &Path) -> Result<PathBuf, PathError> {
    if let Err(err) = fs::create_dir_all(path)
        && err.kind() != io::ErrorKind::AlreadyExists
    {
        return Err(PathError::CreateDir {
            path: path.to_path_buf(),
            source: err,
        });
    }
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn staging_dir_rejects_non_uuid_ids() {
        let temp = TempDir::new().expect("temp dir");
        let paths = AppPaths::new(temp.path()).expect("app paths");

        for bad in ["..", "../reports", "abc", ""] {
            assert!(matches!(
                paths.staging_set_dir(bad),
                Err(PathError::InvalidSetId { .. })
            ));
        }

        let id = Uuid::new_v4().to_string();
        let dir = paths.staging_set_dir(&id).expect("uuid accepted");
        assert_eq!(dir, temp.path().join("staging").join(&id));
        assert!(!dir.exists(), "lookup must not create the staging area");
    }

    #[test]
    fn durable_dirs_are_created_per_slot() {
        let temp = TempDir::new().expect("temp dir");
        let paths = AppPaths::new(temp.path()).expect("app paths");

        let reports = paths.durable_dir(ArtifactSlot::Primary).expect("reports");
        let masks = paths.durable_dir(ArtifactSlot::Secondary).expect("masks");

        assert!(reports.ends_with("reports") && reports.is_dir());
        assert!(masks.ends_with("masks") && masks.is_dir());
    }
}
