//! Transcode state kept in the key-value store. None of it is a source of
//! truth for whether a rendition exists; it only coordinates encodes.

mod lock;
mod pending;
mod status;

pub use lock::{LockGuard, TranscodeLock};
pub use pending::PendingMarker;
pub use status::{StatusResult, StatusTracker, TranscodeState};

use crate::VideoId;

pub mod keys {
    use super::VideoId;

    pub fn lock(video_id: VideoId) -> String {
        format!("transcode:{video_id}:lock")
    }

    pub fn status(video_id: VideoId) -> String {
        format!("transcode:{video_id}:status")
    }

    pub fn pending(video_id: VideoId) -> String {
        format!("transcode:{video_id}:pending")
    }

    pub fn ready(video_id: VideoId) -> String {
        format!("transcode:{video_id}:ready")
    }

    pub fn index_guard(video_id: VideoId, resolution: &str) -> String {
        format!("index:{video_id}:{resolution}")
    }

    pub fn autotranscode(video_id: VideoId) -> String {
        format!("autotranscode:{video_id}")
    }
}
