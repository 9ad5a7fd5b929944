//! Rendition storage: the filesystem tree written by the encoder and the
//! SQLite fallback the indexer keeps in sync with it.

mod adapter;
mod database;
pub mod hls;
mod layout;

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub use adapter::RenditionStore;
pub(crate) use adapter::write_master_playlist;
pub use database::{
    NewVideo, SegmentPayload, SqliteRenditionStore, SqliteRenditionStoreBuilder, StreamRecord,
    SyncChanges, VideoRecord, VideoScope,
};
pub use layout::MediaLayout;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open rendition database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("failed to execute statement on rendition database: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("rendition database path not configured")]
    MissingStore,
    #[error("io error at {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("Unsupported resolution '{0}'.")]
    UnknownResolution(String),
    #[error("invalid segment name '{0}'")]
    InvalidName(String),
    #[error("{0} not found")]
    NotFound(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Reads a manifest and returns it only when it is a finished playlist.
pub(crate) async fn read_ready_manifest(path: &Path) -> Option<String> {
    let text = tokio::fs::read_to_string(path).await.ok()?;
    if !hls::is_complete_manifest(&text) {
        None
    } else {
        Some(text)
    }
}
