use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::{CacheResult, SharedStore};
use crate::profile::ProfileCatalog;
use crate::storage::{read_ready_manifest, MediaLayout};
use crate::VideoId;

use super::keys;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscodeState {
    Unknown,
    Processing,
    Ready,
    Failed,
}

impl TranscodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TranscodeState::Unknown => "unknown",
            TranscodeState::Processing => "processing",
            TranscodeState::Ready => "ready",
            TranscodeState::Failed => "failed",
        }
    }
}

impl fmt::Display for TranscodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TranscodeState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(Self::Unknown),
            "processing" => Ok(Self::Processing),
            "ready" => Ok(Self::Ready),
            "failed" => Ok(Self::Failed),
            other => Err(format!("invalid transcode state: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResult {
    pub state: TranscodeState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StatusResult {
    pub fn new(state: TranscodeState) -> Self {
        Self {
            state,
            message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            state: TranscodeState::Failed,
            message: Some(message.into()),
        }
    }
}

/// Progress record per video: `unknown → processing → ready | failed`.
#[derive(Debug, Clone)]
pub struct StatusTracker {
    store: SharedStore,
    layout: MediaLayout,
    status_ttl: Duration,
    failed_ttl: Duration,
}

impl StatusTracker {
    pub fn new(
        store: SharedStore,
        layout: MediaLayout,
        status_ttl: Duration,
        failed_ttl: Duration,
    ) -> Self {
        Self {
            store,
            layout,
            status_ttl,
            failed_ttl,
        }
    }

    fn write(&self, video_id: VideoId, status: &StatusResult, ttl: Duration) -> CacheResult<()> {
        let payload = serde_json::to_string(status)?;
        self.store.set(&keys::status(video_id), &payload, ttl)
    }

    pub fn mark_processing(&self, video_id: VideoId) -> CacheResult<()> {
        self.store.delete(&keys::ready(video_id))?;
        self.write(
            video_id,
            &StatusResult::new(TranscodeState::Processing),
            self.status_ttl,
        )
    }

    pub fn mark_ready(&self, video_id: VideoId) -> CacheResult<()> {
        self.store.set(&keys::ready(video_id), "1", self.status_ttl)?;
        self.write(
            video_id,
            &StatusResult::new(TranscodeState::Ready),
            self.status_ttl,
        )
    }

    pub fn mark_failed(&self, video_id: VideoId, message: &str) -> CacheResult<()> {
        self.store.delete(&keys::ready(video_id))?;
        self.write(video_id, &StatusResult::failed(message), self.failed_ttl)
    }

    /// Cached record first, then the ready marker, then whatever is on disk.
    pub async fn get_status(&self, video_id: VideoId) -> CacheResult<StatusResult> {
        if let Some(status) = self.cached_status(video_id)? {
            return Ok(status);
        }
        Ok(self.disk_status(video_id).await)
    }

    /// What the key-value store alone knows about `video_id`.
    pub fn cached_status(&self, video_id: VideoId) -> CacheResult<Option<StatusResult>> {
        if let Some(raw) = self.store.get(&keys::status(video_id))? {
            return Ok(Some(serde_json::from_str(&raw)?));
        }
        if self.store.get(&keys::ready(video_id))?.is_some() {
            return Ok(Some(StatusResult::new(TranscodeState::Ready)));
        }
        Ok(None)
    }

    /// Ready when any catalog rendition has a finished manifest on disk.
    pub async fn disk_status(&self, video_id: VideoId) -> StatusResult {
        for label in ProfileCatalog::new().labels() {
            let manifest = self.layout.manifest_path(video_id, label);
            if read_ready_manifest(&manifest).await.is_some() {
                return StatusResult::new(TranscodeState::Ready);
            }
        }
        StatusResult::new(TranscodeState::Unknown)
    }
}
