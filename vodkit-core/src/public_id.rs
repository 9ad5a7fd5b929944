//! Maps the ordinal ids shown to viewers onto database ids.

use std::sync::Arc;

use crate::error::{TranscodeError, TranscodeResult};
use crate::storage::SqliteRenditionStore;
use crate::VideoId;

pub use crate::storage::VideoScope;

#[derive(Debug, Clone)]
pub struct PublicIdResolver {
    database: Arc<SqliteRenditionStore>,
}

impl PublicIdResolver {
    pub fn new(database: Arc<SqliteRenditionStore>) -> Self {
        Self { database }
    }

    /// `public_id` is a 1-based position in the viewer's newest-first list.
    /// Values past the end are accepted when they match a listed id exactly.
    pub fn resolve(&self, public_id: i64, scope: VideoScope) -> TranscodeResult<VideoId> {
        let ids = self.database.list_video_ids(scope)?;
        resolve_in(&ids, public_id)
            .ok_or_else(|| TranscodeError::not_found(format!("Video {public_id} not found.")))
    }
}

fn resolve_in(ids: &[VideoId], public_id: i64) -> Option<VideoId> {
    if public_id < 1 {
        return None;
    }
    let position = usize::try_from(public_id).ok()?;
    if position <= ids.len() {
        return Some(ids[position - 1]);
    }
    ids.contains(&public_id).then_some(public_id)
}
