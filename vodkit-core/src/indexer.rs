//! Mirrors filesystem renditions into the database fallback and audits the
//! two for drift.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::cache::{CacheError, SharedStore};
use crate::profile::ProfileCatalog;
use crate::state::keys;
use crate::storage::{
    hls, read_ready_manifest, write_master_playlist, MediaLayout, SegmentPayload,
    SqliteRenditionStore, StoreError, VideoScope,
};
use crate::VideoId;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Unsupported resolution '{0}'.")]
    UnknownResolution(String),
    #[error("index task failed: {0}")]
    Join(String),
}

pub type IndexResult<T> = Result<T, IndexError>;

/// Result of one reconcile. `skipped` means nothing was examined (stub or
/// missing manifest, guard window, unknown video).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IndexOutcome {
    pub created: bool,
    pub updated: bool,
    pub segments: usize,
    pub bytes: u64,
    pub missing: usize,
    pub skipped: bool,
}

impl IndexOutcome {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HealRequest {
    /// `None` scans every video found on disk or in the database.
    pub videos: Option<Vec<VideoId>>,
    /// Empty means the whole catalog.
    pub resolutions: Vec<String>,
    /// Dry run unless set.
    pub write: bool,
    pub rebuild_master: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum HealAction {
    CreateStream { resolution: String },
    UpdateStream { resolution: String },
    RebuildMaster,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RenditionScan {
    pub resolution: String,
    pub exists: bool,
    pub stub: bool,
    /// Closed with `#EXT-X-ENDLIST`; false for stubs and truncated encodes.
    pub complete: bool,
    pub segments: usize,
    pub min_bytes: Option<u64>,
    pub max_bytes: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VideoHealReport {
    pub video_id: VideoId,
    pub renditions: Vec<RenditionScan>,
    pub actions: Vec<HealAction>,
    pub warnings: Vec<String>,
    pub applied: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HealReport {
    pub dry_run: bool,
    pub videos: Vec<VideoHealReport>,
}

impl HealReport {
    pub fn action_count(&self) -> usize {
        self.videos.iter().map(|video| video.actions.len()).sum()
    }
}

/// Numeric `hls/<id>` directories without a video row. Nothing is deleted
/// unless `confirm` was set.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PruneReport {
    pub confirm: bool,
    pub orphans: Vec<VideoId>,
    pub deleted: Vec<VideoId>,
}

#[derive(Debug, Clone)]
pub struct RenditionIndexer {
    layout: MediaLayout,
    database: Arc<SqliteRenditionStore>,
    store: SharedStore,
    guard_window: Duration,
    catalog: ProfileCatalog,
}

impl RenditionIndexer {
    pub fn new(
        layout: MediaLayout,
        database: Arc<SqliteRenditionStore>,
        store: SharedStore,
        guard_window: Duration,
    ) -> Self {
        Self {
            layout,
            database,
            store,
            guard_window,
            catalog: ProfileCatalog::new(),
        }
    }

    /// Throttled reconcile: at most one per `(video, resolution)` per guard
    /// window.
    pub async fn reconcile(&self, video_id: VideoId, resolution: &str) -> IndexResult<IndexOutcome> {
        self.reconcile_inner(video_id, resolution, true).await
    }

    /// Reconcile without the guard window, for maintenance runs.
    pub async fn reconcile_forced(
        &self,
        video_id: VideoId,
        resolution: &str,
    ) -> IndexResult<IndexOutcome> {
        self.reconcile_inner(video_id, resolution, false).await
    }

    async fn reconcile_inner(
        &self,
        video_id: VideoId,
        resolution: &str,
        guarded: bool,
    ) -> IndexResult<IndexOutcome> {
        if !self.catalog.contains(resolution) {
            return Err(IndexError::UnknownResolution(resolution.to_string()));
        }
        let Some(manifest) = read_ready_manifest(&self.layout.manifest_path(video_id, resolution)).await
        else {
            debug!(video_id, resolution, "no ready manifest on disk, skipping index");
            return Ok(IndexOutcome::skipped());
        };

        if guarded
            && !self
                .store
                .add(&keys::index_guard(video_id, resolution), "1", self.guard_window)?
        {
            debug!(video_id, resolution, "index guard active, skipping");
            return Ok(IndexOutcome::skipped());
        }

        if !self.blocking(move |db| db.video_exists(video_id)).await? {
            debug!(video_id, resolution, "video row missing, skipping index");
            return Ok(IndexOutcome::skipped());
        }

        let mut payloads = Vec::new();
        let mut absent = Vec::new();
        for name in hls::segment_references(&manifest) {
            let path = self.layout.segment_path(video_id, resolution, &name)?;
            match fs::read(&path).await {
                Ok(content) => payloads.push(SegmentPayload::new(name, content)),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => absent.push(name),
                Err(source) => return Err(IndexError::Io { path, source }),
            }
        }
        let missing = absent.len();
        if missing > 0 {
            warn!(video_id, resolution, missing, "manifest references segments missing on disk");
        }

        let res = resolution.to_string();
        let changes = self
            .blocking(move |db| db.sync_rendition(video_id, &res, &manifest, &payloads, &absent))
            .await?;

        let outcome = IndexOutcome {
            created: changes.stream_created,
            updated: !changes.stream_created && !changes.is_noop(),
            segments: changes.segments_created + changes.segments_updated,
            bytes: changes.bytes_written,
            missing,
            skipped: false,
        };
        if outcome.created || outcome.updated {
            info!(
                video_id,
                resolution,
                created = outcome.created,
                segments = outcome.segments,
                deleted = changes.segments_deleted,
                "rendition indexed"
            );
        }
        Ok(outcome)
    }

    async fn blocking<T, F>(&self, op: F) -> IndexResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&SqliteRenditionStore) -> Result<T, StoreError> + Send + 'static,
    {
        let database = Arc::clone(&self.database);
        tokio::task::spawn_blocking(move || op(&database))
            .await
            .map_err(|err| IndexError::Join(err.to_string()))?
            .map_err(IndexError::from)
    }

    /// Audits disk against the database and, when `request.write` is set,
    /// repairs what it finds.
    pub async fn heal(&self, request: &HealRequest) -> IndexResult<HealReport> {
        let resolutions = if request.resolutions.is_empty() {
            self.catalog.labels().map(str::to_string).collect()
        } else {
            for label in &request.resolutions {
                if !self.catalog.contains(label) {
                    return Err(IndexError::UnknownResolution(label.clone()));
                }
            }
            request.resolutions.clone()
        };
        let videos = match &request.videos {
            Some(videos) => videos.clone(),
            None => self.discover_videos().await?,
        };

        let mut report = HealReport {
            dry_run: !request.write,
            videos: Vec::with_capacity(videos.len()),
        };
        for video_id in videos {
            let entry = self.heal_video(video_id, &resolutions, request).await?;
            report.videos.push(entry);
        }
        info!(
            videos = report.videos.len(),
            actions = report.action_count(),
            dry_run = report.dry_run,
            "heal finished"
        );
        Ok(report)
    }

    async fn heal_video(
        &self,
        video_id: VideoId,
        resolutions: &[String],
        request: &HealRequest,
    ) -> IndexResult<VideoHealReport> {
        let mut entry = VideoHealReport {
            video_id,
            ..VideoHealReport::default()
        };
        let streams = self.blocking(move |db| db.list_streams(video_id)).await?;

        for resolution in resolutions {
            let scan = self.scan_rendition(video_id, resolution).await?;
            let stream = streams.iter().find(|s| &s.resolution == resolution);
            let ready = scan.exists && scan.complete;

            match stream {
                None if ready => entry.actions.push(HealAction::CreateStream {
                    resolution: resolution.clone(),
                }),
                Some(stream) if ready => {
                    let manifest =
                        read_ready_manifest(&self.layout.manifest_path(video_id, resolution))
                            .await
                            .unwrap_or_default();
                    if stream.manifest != manifest || stream.segment_count != scan.segments {
                        entry.actions.push(HealAction::UpdateStream {
                            resolution: resolution.clone(),
                        });
                    }
                }
                Some(_) if !scan.exists => entry
                    .warnings
                    .push(format!("{resolution}: database stream has no manifest on disk")),
                Some(_) if scan.stub => entry
                    .warnings
                    .push(format!("{resolution}: manifest on disk is a stub")),
                _ if scan.exists && !scan.stub => entry
                    .warnings
                    .push(format!("{resolution}: manifest on disk is incomplete")),
                _ => {}
            }
            if let Some(stream) = stream {
                if stream.segment_count == 0 {
                    entry
                        .warnings
                        .push(format!("{resolution}: database stream has no segments"));
                }
            }
            entry.renditions.push(scan);
        }

        if request.rebuild_master && entry.renditions.iter().any(|r| r.complete) {
            entry.actions.push(HealAction::RebuildMaster);
        }

        if request.write && !entry.actions.is_empty() {
            for action in &entry.actions {
                match action {
                    HealAction::CreateStream { resolution } | HealAction::UpdateStream { resolution } => {
                        self.reconcile_forced(video_id, resolution).await?;
                    }
                    HealAction::RebuildMaster => {
                        write_master_playlist(&self.layout, self.catalog, video_id).await?;
                    }
                }
            }
            entry.applied = true;
        }
        Ok(entry)
    }

    async fn scan_rendition(&self, video_id: VideoId, resolution: &str) -> IndexResult<RenditionScan> {
        let mut scan = RenditionScan {
            resolution: resolution.to_string(),
            ..RenditionScan::default()
        };
        let path = self.layout.manifest_path(video_id, resolution);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(scan),
            Err(source) => return Err(IndexError::Io { path, source }),
        };
        scan.exists = true;
        scan.stub = hls::is_stub_manifest(&text);
        scan.complete = hls::is_complete_manifest(&text);
        if scan.stub {
            return Ok(scan);
        }
        for name in hls::segment_references(&text) {
            let segment = self.layout.segment_path(video_id, resolution, &name)?;
            if let Ok(meta) = fs::metadata(&segment).await {
                let len = meta.len();
                scan.segments += 1;
                scan.min_bytes = Some(scan.min_bytes.map_or(len, |min| min.min(len)));
                scan.max_bytes = Some(scan.max_bytes.map_or(len, |max| max.max(len)));
            }
        }
        Ok(scan)
    }

    /// Finds rendition trees whose video row is gone and, with `confirm`,
    /// removes them.
    pub async fn prune_orphans(&self, confirm: bool) -> IndexResult<PruneReport> {
        let known: BTreeSet<VideoId> = self
            .blocking(|db| db.list_video_ids(VideoScope::All))
            .await?
            .into_iter()
            .collect();
        let orphans: Vec<VideoId> = self
            .disk_video_ids()
            .into_iter()
            .filter(|video_id| !known.contains(video_id))
            .collect();

        let mut report = PruneReport {
            confirm,
            orphans,
            deleted: Vec::new(),
        };
        if confirm {
            for &video_id in &report.orphans {
                let dir = self.layout.video_dir(video_id);
                match fs::remove_dir_all(&dir).await {
                    Ok(()) => report.deleted.push(video_id),
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => {
                        warn!(video_id, path = %dir.display(), error = %err, "failed to remove orphan rendition tree")
                    }
                }
            }
        }
        info!(
            orphans = report.orphans.len(),
            deleted = report.deleted.len(),
            confirm,
            "orphan prune finished"
        );
        Ok(report)
    }

    /// Directories directly under `hls/` named exactly like a video id.
    fn disk_video_ids(&self) -> BTreeSet<VideoId> {
        WalkDir::new(self.layout.hls_root())
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_dir())
            .filter_map(|entry| {
                let name = entry.file_name().to_str()?;
                if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                let video_id = name.parse::<VideoId>().ok()?;
                (video_id.to_string() == name).then_some(video_id)
            })
            .collect()
    }

    /// Numeric directories under `hls/` plus every video row.
    async fn discover_videos(&self) -> IndexResult<Vec<VideoId>> {
        let mut found = self.disk_video_ids();
        let known = self
            .blocking(|db| db.list_video_ids(VideoScope::All))
            .await?;
        found.extend(known);
        Ok(found.into_iter().collect())
    }
}
