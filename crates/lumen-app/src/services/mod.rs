//! IO-bound adapters behind the server seams.
//!
//! Each module here implements one of the `lumen_server` traits against a
//! concrete system (local filesystem and LMDB, a remote store, the model
//! service). Request handling and workflow sequencing stay in `lumen_server`.

pub mod catalog;
pub mod commit_store;
pub mod inference;
pub mod store_client;

pub use catalog::{Catalog, CatalogError, CatalogRecord};
pub use commit_store::{
    AuditReport, CommitStoreError, DurableWrite, FsCommitStore, MissingArtifact,
};
pub use inference::{HttpInferenceProvider, InferenceClientError};
pub use store_client::{HttpStoreClient, StoreClientError};
