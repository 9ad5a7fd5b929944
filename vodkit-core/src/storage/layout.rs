use std::path::{Path, PathBuf};

use crate::VideoId;

use super::hls::is_plain_segment_name;
use super::{StoreError, StoreResult};

pub const MANIFEST_NAME: &str = "index.m3u8";

/// Path scheme under the media root:
///
/// ```text
/// hls/<id>/index.m3u8            master playlist
/// hls/<id>/<res>/index.m3u8      media playlist
/// hls/<id>/<res>/NNN.ts          segments
/// uploads/videos/<id>.mp4        source (falls back to sources/<id>.mp4)
/// ```
#[derive(Debug, Clone)]
pub struct MediaLayout {
    media_root: PathBuf,
}

impl MediaLayout {
    pub fn new(media_root: impl AsRef<Path>) -> Self {
        Self {
            media_root: media_root.as_ref().to_path_buf(),
        }
    }

    pub fn media_root(&self) -> &Path {
        &self.media_root
    }

    pub fn hls_root(&self) -> PathBuf {
        self.media_root.join("hls")
    }

    pub fn video_dir(&self, video_id: VideoId) -> PathBuf {
        self.hls_root().join(video_id.to_string())
    }

    pub fn rendition_dir(&self, video_id: VideoId, resolution: &str) -> PathBuf {
        self.video_dir(video_id).join(resolution)
    }

    pub fn staging_dir(&self, video_id: VideoId, resolution: &str) -> PathBuf {
        self.video_dir(video_id).join(format!(".{resolution}.staging"))
    }

    pub fn retired_dir(&self, video_id: VideoId, resolution: &str) -> PathBuf {
        self.video_dir(video_id).join(format!(".{resolution}.old"))
    }

    pub fn manifest_path(&self, video_id: VideoId, resolution: &str) -> PathBuf {
        self.rendition_dir(video_id, resolution).join(MANIFEST_NAME)
    }

    pub fn master_path(&self, video_id: VideoId) -> PathBuf {
        self.video_dir(video_id).join(MANIFEST_NAME)
    }

    pub fn segment_path(
        &self,
        video_id: VideoId,
        resolution: &str,
        name: &str,
    ) -> StoreResult<PathBuf> {
        if !is_plain_segment_name(name) {
            return Err(StoreError::InvalidName(name.to_string()));
        }
        Ok(self.rendition_dir(video_id, resolution).join(name))
    }

    pub fn upload_path(&self, video_id: VideoId) -> PathBuf {
        self.media_root
            .join("uploads")
            .join("videos")
            .join(format!("{video_id}.mp4"))
    }

    pub fn legacy_source_path(&self, video_id: VideoId) -> PathBuf {
        self.media_root
            .join("sources")
            .join(format!("{video_id}.mp4"))
    }

    /// First existing source file, preferring the upload location.
    pub fn source_path(&self, video_id: VideoId) -> Option<PathBuf> {
        [self.upload_path(video_id), self.legacy_source_path(video_id)]
            .into_iter()
            .find(|path| path.is_file())
    }
}
