use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use lumen_server::{
    ArtifactSlot, ArtifactStore, ArtifactUpload, CommittedArtifactSet, SetId, StageReceipt,
    StoreError, durable_file_name, sanitize_filename,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use super::catalog::{Catalog, CatalogError, CatalogRecord};
use crate::paths::{AppPaths, PathError};

/// Durability policy for filesystem writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurableWrite {
    /// No explicit fsync (fastest, least durable).
    #[default]
    None,
    /// Fsync the file only.
    FileOnly,
    /// Fsync file and parent directory (recommended for production).
    FileAndDir,
}

#[derive(Debug, Error)]
pub enum CommitStoreError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("set `{0}` has no staging area")]
    UnknownSet(String),
    #[error("filename `{0}` is not usable")]
    InvalidFilename(String),
    #[error("{context} {path}: {source}")]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<CommitStoreError> for StoreError {
    fn from(error: CommitStoreError) -> Self {
        match &error {
            CommitStoreError::UnknownSet(_)
            | CommitStoreError::Path(PathError::InvalidSetId { .. }) => {
                StoreError::not_found(error.to_string())
            }
            CommitStoreError::InvalidFilename(_) => StoreError::invalid_artifact(error.to_string()),
            CommitStoreError::Io { .. } | CommitStoreError::Path(_) => {
                StoreError::unavailable(error.to_string())
            }
            CommitStoreError::Catalog(_) => StoreError::internal(error.to_string()),
        }
    }
}

fn io_error(context: &'static str, path: &Path) -> impl FnOnce(std::io::Error) -> CommitStoreError {
    let path = path.to_path_buf();
    move |source| CommitStoreError::Io {
        context,
        path,
        source,
    }
}

/// Per-set exclusion. Entries are dropped once nobody holds or waits on them.
#[derive(Debug, Default)]
struct SetLocks {
    table: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SetLocks {
    async fn acquire(self: &Arc<Self>, set_id: &str) -> SetLockGuard {
        let lock = {
            let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(table.entry(set_id.to_string()).or_default())
        };
        let guard = lock.lock_owned().await;
        SetLockGuard {
            locks: Arc::clone(self),
            set_id: set_id.to_string(),
            guard: Some(guard),
        }
    }
}

struct SetLockGuard {
    locks: Arc<SetLocks>,
    set_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for SetLockGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut table = self
            .locks
            .table
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(lock) = table.get(&self.set_id)
            && Arc::strong_count(lock) == 1
        {
            table.remove(&self.set_id);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissingArtifact {
    pub set_id: String,
    pub path: PathBuf,
}

/// Result of an out-of-band consistency check.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditReport {
    pub committed: usize,
    /// Sets still waiting for one of their slots.
    pub pending_sets: Vec<String>,
    /// Durable files no catalog row references (crash between move and insert).
    pub orphaned_files: Vec<PathBuf>,
    /// Catalog rows whose files are gone.
    pub missing_files: Vec<MissingArtifact>,
}

impl AuditReport {
    pub fn is_consistent(&self) -> bool {
        self.orphaned_files.is_empty() && self.missing_files.is_empty()
    }
}

/// Filesystem staged commit store.
///
/// Layout under the data root:
/// - `staging/{set_id}/{primary,secondary}/` hold at most one staged file each.
/// - `reports/` and `masks/` hold committed artifacts as `{set_id}_{filename}`.
/// - `lmdb/catalog` holds one row per committed set.
///
/// Staging and finalize for one set run under a per-set lock. Finalize moves
/// both files, removes the staging area and only then inserts the catalog row,
/// so a crash can leave unreferenced durable files but never a dangling row.
#[derive(Debug, Clone)]
pub struct FsCommitStore {
    paths: AppPaths,
    catalog: Arc<Catalog>,
    durability: DurableWrite,
    locks: Arc<SetLocks>,
}

#[bon::bon]
impl FsCommitStore {
    #[builder]
    pub fn new(
        paths: AppPaths,
        #[builder(default)] durability: DurableWrite,
    ) -> Result<Self, CommitStoreError> {
        let catalog = Catalog::open(&paths)?;
        paths.staging_dir()?;
        for slot in ArtifactSlot::ALL {
            paths.durable_dir(slot)?;
        }
        Ok(Self {
            paths,
            catalog: Arc::new(catalog),
            durability,
            locks: Arc::default(),
        })
    }
}

impl FsCommitStore {
    pub async fn create(&self) -> Result<SetId, CommitStoreError> {
        let set_id = Uuid::new_v4().to_string();
        let set_dir = self.paths.staging_set_dir(&set_id)?;
        for slot in ArtifactSlot::ALL {
            let slot_dir = set_dir.join(slot.as_str());
            fs::create_dir_all(&slot_dir)
                .await
                .map_err(io_error("create slot dir", &slot_dir))?;
        }
        if self.durability == DurableWrite::FileAndDir {
            self.fsync_dir(&self.paths.staging_dir()?).await;
        }
        tracing::debug!(%set_id, "staging area created");
        Ok(set_id)
    }

    pub async fn stage(
        &self,
        set_id: &str,
        slot: ArtifactSlot,
        upload: ArtifactUpload,
    ) -> Result<StageReceipt, CommitStoreError> {
        let filename = sanitize_filename(&upload.filename)
            .ok_or_else(|| CommitStoreError::InvalidFilename(upload.filename.clone()))?;
        let set_dir = self.paths.staging_set_dir(set_id)?;

        let _guard = self.locks.acquire(set_id).await;
        if !self.exists(&set_dir).await? {
            return Err(CommitStoreError::UnknownSet(set_id.to_string()));
        }
        let staged = self
            .write_slot(&set_dir, slot, &filename, &upload.bytes)
            .await?;
        tracing::debug!(%set_id, %slot, path = %staged.display(), size = upload.bytes.len(), "artifact staged");

        let receipt = match self.finalize_locked(set_id, &set_dir).await? {
            Some(committed) => StageReceipt {
                committed: true,
                path: committed.path_for(slot).to_string(),
            },
            None => StageReceipt {
                committed: false,
                path: staged.to_string_lossy().into_owned(),
            },
        };
        Ok(receipt)
    }

    /// Commits the set when both slots hold a file. Returns `None` when not
    /// ready or already finalized.
    pub async fn finalize_if_ready(
        &self,
        set_id: &str,
    ) -> Result<Option<CommittedArtifactSet>, CommitStoreError> {
        let set_dir = self.paths.staging_set_dir(set_id)?;
        let _guard = self.locks.acquire(set_id).await;
        self.finalize_locked(set_id, &set_dir).await
    }

    pub fn committed_set(
        &self,
        set_id: &str,
    ) -> Result<Option<CommittedArtifactSet>, CommitStoreError> {
        Ok(self
            .catalog
            .get(set_id)?
            .map(|record| record.to_committed()))
    }

    pub fn list(&self) -> Result<Vec<CommittedArtifactSet>, CommitStoreError> {
        Ok(self
            .catalog
            .list()?
            .iter()
            .map(CatalogRecord::to_committed)
            .collect())
    }

    pub async fn pending_sets(&self) -> Result<Vec<SetId>, CommitStoreError> {
        let staging = self.paths.staging_dir()?;
        let mut entries = fs::read_dir(&staging)
            .await
            .map_err(io_error("read staging dir", &staging))?;
        let mut pending = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(io_error("read staging dir", &staging))?
        {
            let is_dir = entry
                .file_type()
                .await
                .map(|kind| kind.is_dir())
                .unwrap_or(false);
            if is_dir && let Some(name) = entry.file_name().to_str() {
                pending.push(name.to_string());
            }
        }
        pending.sort();
        Ok(pending)
    }

    /// Cross-checks durable files against catalog rows.
    pub async fn audit(&self) -> Result<AuditReport, CommitStoreError> {
        let records = self.catalog.list()?;
        let mut referenced = HashSet::new();
        let mut missing_files = Vec::new();
        for record in &records {
            for path in [&record.primary_path, &record.secondary_path] {
                let path = PathBuf::from(path);
                if !self.exists(&path).await? {
                    missing_files.push(MissingArtifact {
                        set_id: record.set_id.clone(),
                        path: path.clone(),
                    });
                }
                referenced.insert(path);
            }
        }

        let mut orphaned_files = Vec::new();
        for slot in ArtifactSlot::ALL {
            for path in list_files(&self.paths.durable_dir(slot)?).await? {
                if !referenced.contains(&path) {
                    orphaned_files.push(path);
                }
            }
        }
        orphaned_files.sort();

        Ok(AuditReport {
            committed: records.len(),
            pending_sets: self.pending_sets().await?,
            orphaned_files,
            missing_files,
        })
    }

    async fn exists(&self, path: &Path) -> Result<bool, CommitStoreError> {
        fs::try_exists(path)
            .await
            .map_err(io_error("stat", path))
    }

    /// Replaces the slot content with `bytes`. The slot never holds more than one file.
    async fn write_slot(
        &self,
        set_dir: &Path,
        slot: ArtifactSlot,
        filename: &str,
        bytes: &[u8],
    ) -> Result<PathBuf, CommitStoreError> {
        let slot_dir = set_dir.join(slot.as_str());
        fs::create_dir_all(&slot_dir)
            .await
            .map_err(io_error("create slot dir", &slot_dir))?;

        let temp_file = tempfile::NamedTempFile::new_in(set_dir)
            .map_err(io_error("create temp file in", set_dir))?;
        let temp_path = temp_file.path().to_path_buf();
        let mut file = fs::File::from_std(
            temp_file
                .reopen()
                .map_err(io_error("reopen temp file", &temp_path))?,
        );
        file.write_all(bytes)
            .await
            .map_err(io_error("write temp file", &temp_path))?;
        if self.durability != DurableWrite::None {
            file.sync_all()
                .await
                .map_err(io_error("fsync temp file", &temp_path))?;
        }
        drop(file);

        for stale in list_files(&slot_dir).await? {
            fs::remove_file(&stale)
                .await
                .map_err(io_error("remove staged file", &stale))?;
        }
        let final_path = slot_dir.join(filename);
        fs::rename(&temp_path, &final_path)
            .await
            .map_err(io_error("move staged file to", &final_path))?;
        if self.durability == DurableWrite::FileAndDir {
            self.fsync_dir(&slot_dir).await;
        }
        Ok(final_path)
    }

    /// Caller must hold the set lock.
    async fn finalize_locked(
        &self,
        set_id: &str,
        set_dir: &Path,
    ) -> Result<Option<CommittedArtifactSet>, CommitStoreError> {
        if !self.exists(set_dir).await? {
            return Ok(None);
        }
        let Some(primary) = self.slot_file(set_dir, ArtifactSlot::Primary).await? else {
            return Ok(None);
        };
        let Some(secondary) = self.slot_file(set_dir, ArtifactSlot::Secondary).await? else {
            return Ok(None);
        };

        let primary_path = self.durable_destination(set_id, ArtifactSlot::Primary, &primary)?;
        let secondary_path =
            self.durable_destination(set_id, ArtifactSlot::Secondary, &secondary)?;
        for destination in [&primary_path, &secondary_path] {
            if fs::symlink_metadata(destination)
                .await
                .is_ok_and(|meta| meta.is_dir())
            {
                return Err(CommitStoreError::Io {
                    context: "move artifact to",
                    path: destination.clone(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::AlreadyExists,
                        "destination is a directory",
                    ),
                });
            }
        }

        self.move_file(&primary, &primary_path).await?;
        if let Err(error) = self.move_file(&secondary, &secondary_path).await {
            self.restore(&primary_path, &primary).await;
            return Err(error);
        }
        if let Err(source) = fs::remove_dir_all(set_dir).await {
            self.restore(&primary_path, &primary).await;
            self.restore(&secondary_path, &secondary).await;
            return Err(CommitStoreError::Io {
                context: "remove staging area",
                path: set_dir.to_path_buf(),
                source,
            });
        }

        let record = CatalogRecord::new(
            set_id,
            primary_path.to_string_lossy(),
            secondary_path.to_string_lossy(),
        );
        self.catalog.insert(&record)?;
        tracing::info!(%set_id, primary = %record.primary_path, secondary = %record.secondary_path, "artifact set committed");
        Ok(Some(record.to_committed()))
    }

    /// The staged file of a slot, present only when exactly one regular file exists.
    async fn slot_file(
        &self,
        set_dir: &Path,
        slot: ArtifactSlot,
    ) -> Result<Option<PathBuf>, CommitStoreError> {
        let slot_dir = set_dir.join(slot.as_str());
        if !self.exists(&slot_dir).await? {
            return Ok(None);
        }
        let mut files = list_files(&slot_dir).await?;
        match files.len() {
            0 => Ok(None),
            1 => Ok(files.pop()),
            count => {
                tracing::warn!(slot_dir = %slot_dir.display(), count, "slot holds several files; not finalizing");
                Ok(None)
            }
        }
    }

    fn durable_destination(
        &self,
        set_id: &str,
        slot: ArtifactSlot,
        staged: &Path,
    ) -> Result<PathBuf, CommitStoreError> {
        let filename = staged
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| CommitStoreError::InvalidFilename(staged.display().to_string()))?;
        Ok(self
            .paths
            .durable_dir(slot)?
            .join(durable_file_name(set_id, filename)))
    }

    async fn move_file(&self, from: &Path, to: &Path) -> Result<(), CommitStoreError> {
        fs::rename(from, to)
            .await
            .map_err(io_error("move artifact to", to))?;
        if self.durability == DurableWrite::FileAndDir
            && let Some(dir) = to.parent()
        {
            self.fsync_dir(dir).await;
        }
        Ok(())
    }

    /// Puts a moved artifact back into its staging slot after a failed finalize,
    /// so the set stays pending and a later stage can commit it.
    async fn restore(&self, durable: &Path, staged: &Path) {
        if let Some(slot_dir) = staged.parent()
            && let Err(error) = fs::create_dir_all(slot_dir).await
        {
            tracing::error!(%error, slot_dir = %slot_dir.display(), "failed to recreate staging slot");
            return;
        }
        if let Err(error) = fs::rename(durable, staged).await {
            tracing::error!(
                %error,
                durable = %durable.display(),
                staged = %staged.display(),
                "failed to return artifact to staging; audit will report it as orphaned"
            );
        }
    }

    /// Directory fsync is best-effort; some platforms don't support it.
    async fn fsync_dir(&self, dir_path: &Path) {
        match fs::File::open(dir_path).await {
            Ok(dir_file) => {
                if let Err(error) = dir_file.sync_all().await {
                    tracing::warn!(%error, "directory fsync unsupported or failed");
                }
            }
            Err(error) => {
                tracing::warn!(%error, "failed to open directory for fsync");
            }
        }
    }
}

async fn list_files(dir: &Path) -> Result<Vec<PathBuf>, CommitStoreError> {
    let mut entries = fs::read_dir(dir)
        .await
        .map_err(io_error("read dir", dir))?;
    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(io_error("read dir", dir))?
    {
        let is_file = entry
            .file_type()
            .await
            .map(|kind| kind.is_file())
            .unwrap_or(false);
        if is_file {
            files.push(entry.path());
        }
    }
    Ok(files)
}

#[async_trait]
impl ArtifactStore for FsCommitStore {
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
        self.committed_set(set_id).map_err(StoreError::from)
    }

    async fn list_committed(&self) -> Result<Vec<CommittedArtifactSet>, StoreError> {
        self.list().map_err(StoreError::from)
    }

    fn serves_local_files(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use lumen_server::StoreErrorKind;
    use tempfile::TempDir;

    fn store(temp: &TempDir) -> FsCommitStore {
        let paths = AppPaths::new(temp.path()).expect("app paths");
        FsCommitStore::builder()
            .paths(paths)
            .build()
            .expect("open store")
    }

    fn upload(filename: &str, bytes: &'static [u8]) -> ArtifactUpload {
        ArtifactUpload {
            filename: filename.to_string(),
            content_type: "image/png".to_string(),
            bytes: Bytes::from_static(bytes),
        }
    }

    #[tokio::test]
    async fn pair_commits_once_both_slots_are_filled() {
        let temp = TempDir::new().expect("temp dir");
        let store = store(&temp);
        let set_id = store.create().await.expect("create");
        let staging = temp.path().join("staging").join(&set_id);
        assert!(staging.join("primary").is_dir());

        let first = store
            .stage(&set_id, ArtifactSlot::Primary, upload("scan.png", b"primary"))
            .await
            .expect("stage primary");
        assert!(!first.committed);
        assert!(store.committed_set(&set_id).expect("lookup").is_none());

        let second = store
            .stage(&set_id, ArtifactSlot::Secondary, upload("mask.png", b"mask"))
            .await
            .expect("stage secondary");
        assert!(second.committed);
        assert!(!staging.exists(), "staging area removed after commit");

        let committed = store
            .committed_set(&set_id)
            .expect("lookup")
            .expect("row exists");
        let primary = PathBuf::from(&committed.primary_path);
        assert_eq!(primary, temp.path().join("reports").join(format!("{set_id}_scan.png")));
        assert_eq!(std::fs::read(&primary).expect("primary readable"), b"primary");
        assert_eq!(second.path, committed.secondary_path);
        assert_eq!(
            std::fs::read(&committed.secondary_path).expect("mask readable"),
            b"mask"
        );
    }

    #[tokio::test]
    async fn last_write_wins_before_commit() {
        let temp = TempDir::new().expect("temp dir");
        let store = store(&temp);
        let set_id = store.create().await.expect("create");

        store
            .stage(&set_id, ArtifactSlot::Primary, upload("a.png", b"first"))
            .await
            .expect("stage a");
        store
            .stage(&set_id, ArtifactSlot::Primary, upload("b.png", b"second"))
            .await
            .expect("stage b");
        let slot_dir = temp.path().join("staging").join(&set_id).join("primary");
        let names: Vec<String> = std::fs::read_dir(&slot_dir)
            .expect("slot dir")
            .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["b.png"]);

        store
            .stage(&set_id, ArtifactSlot::Secondary, upload("mask.png", b"m"))
            .await
            .expect("stage mask");
        let committed = store.committed_set(&set_id).unwrap().unwrap();
        assert!(committed.primary_path.ends_with(&format!("{set_id}_b.png")));
        assert_eq!(std::fs::read(&committed.primary_path).unwrap(), b"second");
    }

    #[tokio::test]
    async fn staging_after_commit_is_rejected_and_row_unchanged() {
        let temp = TempDir::new().expect("temp dir");
        let store = store(&temp);
        let set_id = store.create().await.expect("create");
        store
            .stage(&set_id, ArtifactSlot::Primary, upload("scan.png", b"p"))
            .await
            .unwrap();
        store
            .stage(&set_id, ArtifactSlot::Secondary, upload("mask.png", b"m"))
            .await
            .unwrap();
        let before = store.committed_set(&set_id).unwrap().unwrap();

        let error = store
            .stage(&set_id, ArtifactSlot::Secondary, upload("mask.png", b"again"))
            .await
            .expect_err("set already finalized");
        assert!(matches!(error, CommitStoreError::UnknownSet(_)));
        assert_eq!(StoreError::from(error).kind, StoreErrorKind::NotFound);

        assert_eq!(store.committed_set(&set_id).unwrap().unwrap(), before);
        assert_eq!(std::fs::read(&before.secondary_path).unwrap(), b"m");
        assert!(store.finalize_if_ready(&set_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_and_malformed_sets_are_not_found() {
        let temp = TempDir::new().expect("temp dir");
        let store = store(&temp);

        for set_id in [Uuid::new_v4().to_string(), "../reports".to_string()] {
            let error = store
                .stage_artifact(&set_id, ArtifactSlot::Primary, upload("scan.png", b"p"))
                .await
                .expect_err("no staging area");
            assert_eq!(error.kind, StoreErrorKind::NotFound, "{set_id}");
        }
    }

    #[tokio::test]
    async fn directory_alias_filenames_are_invalid() {
        let temp = TempDir::new().expect("temp dir");
        let store = store(&temp);
        let set_id = store.create().await.expect("create");

        let error = store
            .stage_artifact(&set_id, ArtifactSlot::Primary, upload("..", b"p"))
            .await
            .expect_err("filename rejected");
        assert_eq!(error.kind, StoreErrorKind::InvalidArtifact);
    }

    #[tokio::test]
    async fn finalize_if_ready_waits_for_both_slots() {
        let temp = TempDir::new().expect("temp dir");
        let store = store(&temp);
        let set_id = store.create().await.expect("create");

        assert!(store.finalize_if_ready(&set_id).await.unwrap().is_none());
        store
            .stage(&set_id, ArtifactSlot::Secondary, upload("mask.png", b"m"))
            .await
            .unwrap();
        assert!(store.finalize_if_ready(&set_id).await.unwrap().is_none());
        assert_eq!(store.pending_sets().await.unwrap(), vec![set_id.clone()]);
    }

    #[tokio::test]
    async fn audit_reports_orphans_and_pending_sets() {
        let temp = TempDir::new().expect("temp dir");
        let store = store(&temp);

        let committed = store.create().await.unwrap();
        store
            .stage(&committed, ArtifactSlot::Primary, upload("scan.png", b"p"))
            .await
            .unwrap();
        store
            .stage(&committed, ArtifactSlot::Secondary, upload("mask.png", b"m"))
            .await
            .unwrap();
        let pending = store.create().await.unwrap();

        let clean = store.audit().await.expect("audit");
        assert!(clean.is_consistent());
        assert_eq!(clean.committed, 1);
        assert_eq!(clean.pending_sets, vec![pending.clone()]);

        let orphan = temp.path().join("reports").join("crashed_scan.png");
        std::fs::write(&orphan, b"left behind").unwrap();
        let row = store.committed_set(&committed).unwrap().unwrap();
        std::fs::remove_file(&row.secondary_path).unwrap();

        let report = store.audit().await.expect("audit");
        assert!(!report.is_consistent());
        assert_eq!(report.orphaned_files, vec![orphan]);
        assert_eq!(report.missing_files.len(), 1);
        assert_eq!(report.missing_files[0].set_id, committed);
    }

    #[tokio::test]
    async fn blocked_destination_keeps_set_pending_for_retry() {
        let temp = TempDir::new().expect("temp dir");
        let store = store(&temp);
        let set_id = store.create().await.expect("create");
        store
            .stage(&set_id, ArtifactSlot::Primary, upload("scan.png", b"primary"))
            .await
            .expect("stage primary");

        let blocker = temp
            .path()
            .join("masks")
            .join(durable_file_name(&set_id, "mask.png"));
        std::fs::create_dir_all(blocker.join("occupied")).expect("create blocker");

        let error = store
            .stage(&set_id, ArtifactSlot::Secondary, upload("mask.png", b"mask"))
            .await
            .expect_err("finalize blocked");
        assert!(matches!(error, CommitStoreError::Io { .. }));
        assert!(store.committed_set(&set_id).unwrap().is_none());
        let primary_slot = temp.path().join("staging").join(&set_id).join("primary");
        assert_eq!(list_files(&primary_slot).await.unwrap().len(), 1);
        assert!(store.audit().await.unwrap().orphaned_files.is_empty());

        std::fs::remove_dir_all(&blocker).expect("remove blocker");
        let retry = store
            .stage(&set_id, ArtifactSlot::Secondary, upload("mask.png", b"mask"))
            .await
            .expect("retry secondary");
        assert!(retry.committed);
        let row = store.committed_set(&set_id).unwrap().expect("row exists");
        assert_eq!(std::fs::read(&row.primary_path).unwrap(), b"primary");
        assert!(store.audit().await.unwrap().is_consistent());
    }

    #[tokio::test]
    async fn failed_secondary_move_returns_primary_to_staging() {
        let temp = TempDir::new().expect("temp dir");
        let store = store(&temp);
        let set_id = store.create().await.expect("create");
        store
            .stage(&set_id, ArtifactSlot::Primary, upload("scan.png", b"primary"))
            .await
            .expect("stage primary");
        let staged = store
            .slot_file(&temp.path().join("staging").join(&set_id), ArtifactSlot::Primary)
            .await
            .unwrap()
            .expect("primary staged");

        let durable = store
            .durable_destination(&set_id, ArtifactSlot::Primary, &staged)
            .unwrap();
        store.move_file(&staged, &durable).await.expect("move out");
        assert!(!staged.exists());

        store.restore(&durable, &staged).await;
        assert!(!durable.exists());
        assert_eq!(std::fs::read(&staged).unwrap(), b"primary");
    }
}
