use std::path::PathBuf;
use std::sync::Arc;

use tokio::fs;
use tracing::{debug, info, warn};

use crate::indexer::RenditionIndexer;
use crate::profile::{Profile, ProfileCatalog};
use crate::VideoId;

use super::{hls, read_ready_manifest, MediaLayout, SqliteRenditionStore, StoreError, StoreResult};

/// Single read/write surface over both rendition backends. Reads go to the
/// filesystem first and fall back to the database; writes only ever touch the
/// filesystem (the indexer mirrors them).
#[derive(Debug, Clone)]
pub struct RenditionStore {
    layout: MediaLayout,
    database: Arc<SqliteRenditionStore>,
    catalog: ProfileCatalog,
    indexer: Option<Arc<RenditionIndexer>>,
}

impl RenditionStore {
    pub fn new(layout: MediaLayout, database: Arc<SqliteRenditionStore>) -> Self {
        Self {
            layout,
            database,
            catalog: ProfileCatalog::new(),
            indexer: None,
        }
    }

    /// Enables the read-time reconcile on `resolve_stream`.
    pub fn with_self_heal(mut self, indexer: Arc<RenditionIndexer>) -> Self {
        self.indexer = Some(indexer);
        self
    }

    pub fn layout(&self) -> &MediaLayout {
        &self.layout
    }

    pub fn database(&self) -> &Arc<SqliteRenditionStore> {
        &self.database
    }

    pub fn catalog(&self) -> ProfileCatalog {
        self.catalog
    }

    fn profile(&self, resolution: &str) -> StoreResult<&'static Profile> {
        self.catalog
            .get(resolution)
            .ok_or_else(|| StoreError::UnknownResolution(resolution.to_string()))
    }

    /// Media playlist text for `resolution`. A finished manifest on disk wins
    /// (and opportunistically refreshes the database copy); otherwise the
    /// database stream is served.
    pub async fn resolve_stream(&self, video_id: VideoId, resolution: &str) -> StoreResult<String> {
        self.profile(resolution)?;
        let path = self.layout.manifest_path(video_id, resolution);
        if let Some(manifest) = read_ready_manifest(&path).await {
            if let Some(indexer) = &self.indexer {
                if let Err(err) = indexer.reconcile(video_id, resolution).await {
                    debug!(video_id, resolution, error = %err, "self-heal reconcile skipped");
                }
            }
            return Ok(manifest);
        }

        let database = Arc::clone(&self.database);
        let res = resolution.to_string();
        let stream = tokio::task::spawn_blocking(move || database.get_stream(video_id, &res))
            .await
            .map_err(|err| StoreError::io(&path, std::io::Error::other(err)))??;
        match stream {
            Some(stream) => Ok(stream.manifest),
            None => Err(StoreError::NotFound(format!(
                "stream {resolution} for video {video_id}"
            ))),
        }
    }

    pub async fn resolve_segment(
        &self,
        video_id: VideoId,
        resolution: &str,
        name: &str,
    ) -> StoreResult<Vec<u8>> {
        self.profile(resolution)?;
        let path = self.layout.segment_path(video_id, resolution, name)?;
        match fs::read(&path).await {
            Ok(bytes) => return Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(StoreError::io(&path, err)),
        }

        let database = Arc::clone(&self.database);
        let (res, seg) = (resolution.to_string(), name.to_string());
        let content = tokio::task::spawn_blocking(move || database.get_segment(video_id, &res, &seg))
            .await
            .map_err(|err| StoreError::io(&path, std::io::Error::other(err)))??;
        content.ok_or_else(|| {
            StoreError::NotFound(format!("segment {name} of {resolution} for video {video_id}"))
        })
    }

    /// True when a finished manifest for `resolution` is on disk.
    pub async fn manifest_ready(&self, video_id: VideoId, resolution: &str) -> bool {
        read_ready_manifest(&self.layout.manifest_path(video_id, resolution))
            .await
            .is_some()
    }

    /// Catalog profiles with a finished manifest on disk, highest bandwidth
    /// first.
    pub async fn ready_profiles(&self, video_id: VideoId) -> Vec<&'static Profile> {
        ready_profiles(&self.layout, self.catalog, video_id).await
    }

    /// Rewrites `hls/<id>/index.m3u8` from what is on disk. Returns `None`
    /// and writes nothing when no rendition is ready.
    pub async fn write_master_playlist(&self, video_id: VideoId) -> StoreResult<Option<PathBuf>> {
        write_master_playlist(&self.layout, self.catalog, video_id).await
    }

    /// Directory the encoder should write into. Forced rebuilds get a fresh
    /// staging directory that `commit_rendition` later swaps into place.
    pub async fn prepare_rendition_dir(
        &self,
        video_id: VideoId,
        resolution: &str,
        staged: bool,
    ) -> StoreResult<PathBuf> {
        let dir = if staged {
            let staging = self.layout.staging_dir(video_id, resolution);
            remove_dir_if_exists(&staging).await?;
            staging
        } else {
            self.layout.rendition_dir(video_id, resolution)
        };
        fs::create_dir_all(&dir)
            .await
            .map_err(|source| StoreError::io(&dir, source))?;
        Ok(dir)
    }

    /// Swaps a finished staging directory into place. Readers see either the
    /// old rendition or the new one, never a mix.
    pub async fn commit_rendition(&self, video_id: VideoId, resolution: &str) -> StoreResult<()> {
        let staging = self.layout.staging_dir(video_id, resolution);
        let live = self.layout.rendition_dir(video_id, resolution);
        let retired = self.layout.retired_dir(video_id, resolution);

        remove_dir_if_exists(&retired).await?;
        if fs::metadata(&live).await.is_ok() {
            fs::rename(&live, &retired)
                .await
                .map_err(|source| StoreError::io(&live, source))?;
        }
        fs::rename(&staging, &live)
            .await
            .map_err(|source| StoreError::io(&staging, source))?;
        if let Err(err) = fs::remove_dir_all(&retired).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %retired.display(), error = %err, "failed to remove retired rendition");
            }
        }
        Ok(())
    }

    pub async fn discard_staging(&self, video_id: VideoId, resolution: &str) {
        let staging = self.layout.staging_dir(video_id, resolution);
        if let Err(err) = remove_dir_if_exists(&staging).await {
            warn!(path = %staging.display(), error = %err, "failed to clean staging directory");
        }
    }
}

pub(crate) async fn ready_profiles(
    layout: &MediaLayout,
    catalog: ProfileCatalog,
    video_id: VideoId,
) -> Vec<&'static Profile> {
    let mut ready = Vec::new();
    for profile in catalog.by_bandwidth_desc() {
        if read_ready_manifest(&layout.manifest_path(video_id, profile.label))
            .await
            .is_some()
        {
            ready.push(profile);
        }
    }
    ready
}

pub(crate) async fn write_master_playlist(
    layout: &MediaLayout,
    catalog: ProfileCatalog,
    video_id: VideoId,
) -> StoreResult<Option<PathBuf>> {
    let ready = ready_profiles(layout, catalog, video_id).await;
    if ready.is_empty() {
        debug!(video_id, "no ready renditions, master playlist not written");
        return Ok(None);
    }
    let path = layout.master_path(video_id);
    let body = hls::render_master_playlist(&ready);
    let tmp = path.with_extension("m3u8.tmp");
    fs::write(&tmp, body)
        .await
        .map_err(|source| StoreError::io(&tmp, source))?;
    fs::rename(&tmp, &path)
        .await
        .map_err(|source| StoreError::io(&path, source))?;
    info!(video_id, variants = ready.len(), "master playlist written");
    Ok(Some(path))
}

async fn remove_dir_if_exists(path: &std::path::Path) -> StoreResult<()> {
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(StoreError::io(path, err)),
    }
}
