use std::time::{SystemTime, UNIX_EPOCH};

use bincode::config;
use bincode::error::{DecodeError, EncodeError};
use bincode::serde::{decode_from_slice, encode_to_vec};
use chrono::DateTime;
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions};
use lumen_server::CommittedArtifactSet;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::paths::{AppPaths, PathError};

const CATALOG_ENV_MAP_SIZE_BYTES: usize = 1 << 28; // 256 MiB
const SETS_DB: &str = "committed_sets";

/// Row persisted for every committed artifact set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogRecord {
    pub set_id: String,
    pub primary_path: String,
    pub secondary_path: String,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl CatalogRecord {
    #[must_use]
    pub fn new(
        set_id: impl Into<String>,
        primary_path: impl Into<String>,
        secondary_path: impl Into<String>,
    ) -> Self {
        let set_id = set_id.into();
        debug_assert!(!set_id.is_empty());
        let now_ms = current_timestamp_ms();
        Self {
            set_id,
            primary_path: primary_path.into(),
            secondary_path: secondary_path.into(),
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        }
    }

    pub fn to_committed(&self) -> CommittedArtifactSet {
        CommittedArtifactSet {
            set_id: self.set_id.clone(),
            primary_path: self.primary_path.clone(),
            secondary_path: self.secondary_path.clone(),
            created_at: DateTime::from_timestamp_millis(self.created_at_ms).unwrap_or_default(),
            updated_at: DateTime::from_timestamp_millis(self.updated_at_ms).unwrap_or_default(),
        }
    }
}

pub(crate) fn current_timestamp_ms() -> i64 {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    since_epoch.as_millis() as i64
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Heed(#[from] heed::Error),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("set `{0}` is already committed")]
    Duplicate(String),
}

/// LMDB-backed catalog of committed sets. Rows are insert-only.
#[derive(Debug)]
pub struct Catalog {
    env: Env,
    sets: Database<Str, Bytes>,
}

impl Catalog {
    pub fn open(paths: &AppPaths) -> Result<Self, CatalogError> {
        let path = paths.catalog_lmdb_dir()?;
        debug_assert!(path.exists());

        let mut options = EnvOpenOptions::new();
        options.max_dbs(4);
        options.map_size(CATALOG_ENV_MAP_SIZE_BYTES);
        let env = unsafe {
            // SAFETY: the environment is opened once per process for this path and
            // lives as long as the catalog.
            options.open(&path)?
        };
        let sets = {
            let rtxn = env.read_txn()?;
            let opened = env.open_database::<Str, Bytes>(&rtxn, Some(SETS_DB))?;
            drop(rtxn);
            match opened {
                Some(existing) => existing,
                None => {
                    let mut wtxn = env.write_txn()?;
                    let db = env.create_database::<Str, Bytes>(&mut wtxn, Some(SETS_DB))?;
                    wtxn.commit()?;
                    db
                }
            }
        };
        Ok(Self { env, sets })
    }

    /// Inserts a row; an existing row for the same set id is never replaced.
    pub fn insert(&self, record: &CatalogRecord) -> Result<(), CatalogError> {
        debug_assert!(!record.set_id.is_empty());

        let mut wtxn = self.env.write_txn()?;
        if self.sets.get(&wtxn, record.set_id.as_str())?.is_some() {
            return Err(CatalogError::Duplicate(record.set_id.clone()));
        }
        let encoded = encode_to_vec(record, config::standard())?;
        self.sets
            .put(&mut wtxn, record.set_id.as_str(), encoded.as_slice())?;
        wtxn.commit()?;
        Ok(())
    }

    pub fn get(&self, set_id: &str) -> Result<Option<CatalogRecord>, CatalogError> {
        let rtxn = self.env.read_txn()?;
        match self.sets.get(&rtxn, set_id)? {
            Some(raw) => {
                let (record, _) = decode_from_slice::<CatalogRecord, _>(raw, config::standard())?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// All rows, newest first.
    pub fn list(&self) -> Result<Vec<CatalogRecord>, CatalogError> {
        let rtxn = self.env.read_txn()?;
        let mut out = Vec::new();
        for entry in self.sets.iter(&rtxn)? {
            let (_, raw) = entry?;
            let (record, _) = decode_from_slice::<CatalogRecord, _>(raw, config::standard())?;
            out.push(record);
        }
        out.sort_by(|a, b| {
            b.created_at_ms
                .cmp(&a.created_at_ms)
                .then_with(|| a.set_id.cmp(&b.set_id))
        });
        Ok(out)
    }
}
