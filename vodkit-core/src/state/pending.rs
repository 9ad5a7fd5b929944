use std::time::Duration;

use crate::cache::{CacheResult, SharedStore};
use crate::VideoId;

use super::keys;

/// "Enqueue requested, worker has not started yet."
#[derive(Debug, Clone)]
pub struct PendingMarker {
    store: SharedStore,
    ttl: Duration,
}

impl PendingMarker {
    pub fn new(store: SharedStore, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Atomic; `false` means somebody else already marked the video.
    pub fn mark(&self, video_id: VideoId) -> CacheResult<bool> {
        self.store.add(&keys::pending(video_id), "1", self.ttl)
    }

    pub fn is_pending(&self, video_id: VideoId) -> CacheResult<bool> {
        Ok(self.store.get(&keys::pending(video_id))?.is_some())
    }

    pub fn clear(&self, video_id: VideoId) -> CacheResult<()> {
        self.store.delete(&keys::pending(video_id))
    }
}
