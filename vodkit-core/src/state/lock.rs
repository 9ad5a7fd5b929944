use std::time::Duration;

use tracing::{debug, warn};

use crate::cache::{CacheResult, SharedStore};
use crate::VideoId;

use super::keys;

/// Per-video mutual exclusion on top of the store's atomic `add`.
#[derive(Debug, Clone)]
pub struct TranscodeLock {
    store: SharedStore,
    ttl: Duration,
}

impl TranscodeLock {
    pub fn new(store: SharedStore, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn acquire(&self, video_id: VideoId) -> CacheResult<bool> {
        let acquired = self.store.add(&keys::lock(video_id), "1", self.ttl)?;
        debug!(video_id, acquired, "transcode lock acquire");
        Ok(acquired)
    }

    pub fn is_locked(&self, video_id: VideoId) -> CacheResult<bool> {
        Ok(self.store.get(&keys::lock(video_id))?.is_some())
    }

    pub fn release(&self, video_id: VideoId) -> CacheResult<()> {
        self.store.delete(&keys::lock(video_id))
    }

    /// Acquires the lock and hands back a guard that releases it when dropped,
    /// on success, error and panic paths alike.
    pub fn try_lock(&self, video_id: VideoId) -> CacheResult<Option<LockGuard>> {
        if self.acquire(video_id)? {
            Ok(Some(LockGuard {
                lock: self.clone(),
                video_id,
            }))
        } else {
            Ok(None)
        }
    }
}

#[derive(Debug)]
pub struct LockGuard {
    lock: TranscodeLock,
    video_id: VideoId,
}

impl LockGuard {
    pub fn video_id(&self) -> VideoId {
        self.video_id
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(err) = self.lock.release(self.video_id) {
            warn!(video_id = self.video_id, error = %err, "failed to release transcode lock");
        }
    }
}
