use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::sqlite::SqliteTarget;
use crate::VideoId;

use super::{StoreError, StoreResult};

const RENDITIONS_SCHEMA: &str = include_str!("../../../sql/renditions.sql");

/// Which videos a caller may see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoScope {
    /// Staff: every video.
    All,
    /// Published videos plus the viewer's own.
    Viewer { user_id: Option<i64> },
}

#[derive(Debug, Clone, Default)]
pub struct NewVideo {
    pub title: String,
    pub description: String,
    pub owner_id: Option<i64>,
    pub is_published: bool,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VideoRecord {
    pub id: VideoId,
    pub title: String,
    pub description: String,
    pub owner_id: Option<i64>,
    pub is_published: bool,
    pub created_at: Option<DateTime<Utc>>,
}

impl VideoRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            title: row.get("title")?,
            description: row.get("description")?,
            owner_id: row.get("owner_id")?,
            is_published: row.get::<_, i64>("is_published")? != 0,
            created_at: parse_timestamp(row.get("created_at")?),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamRecord {
    pub id: i64,
    pub video_id: VideoId,
    pub resolution: String,
    pub manifest: String,
    pub segment_count: usize,
    pub updated_at: Option<DateTime<Utc>>,
}

impl StreamRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            video_id: row.get("video_id")?,
            resolution: row.get("resolution")?,
            manifest: row.get("manifest")?,
            segment_count: row.get::<_, i64>("segment_count")?.max(0) as usize,
            updated_at: parse_timestamp(row.get("updated_at")?),
        })
    }
}

/// Segment as read from disk, ready to be mirrored.
#[derive(Debug, Clone)]
pub struct SegmentPayload {
    pub name: String,
    pub content: Vec<u8>,
    pub digest: String,
}

impl SegmentPayload {
    pub fn new(name: impl Into<String>, content: Vec<u8>) -> Self {
        let digest = crate::digest_hex(&content);
        Self {
            name: name.into(),
            content,
            digest,
        }
    }
}

/// What one `sync_rendition` call changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncChanges {
    pub stream_created: bool,
    pub manifest_updated: bool,
    pub segments_created: usize,
    pub segments_updated: usize,
    pub segments_deleted: usize,
    pub bytes_written: u64,
}

impl SyncChanges {
    pub fn is_noop(&self) -> bool {
        *self == SyncChanges::default()
    }
}

#[derive(Debug, Clone)]
pub struct SqliteRenditionStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteRenditionStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteRenditionStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> StoreResult<SqliteRenditionStore> {
        let path = self.path.ok_or(StoreError::MissingStore)?;
        Ok(SqliteRenditionStore {
            target: SqliteTarget::new(path, self.read_only, self.create_if_missing),
        })
    }
}

/// Database side of the rendition storage: videos, streams (one per
/// resolution) and segment blobs.
#[derive(Debug, Clone)]
pub struct SqliteRenditionStore {
    target: SqliteTarget,
}

impl SqliteRenditionStore {
    pub fn builder() -> SqliteRenditionStoreBuilder {
        SqliteRenditionStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        SqliteRenditionStoreBuilder::new().path(path).build()
    }

    pub fn path(&self) -> &Path {
        self.target.path()
    }

    fn open(&self) -> StoreResult<Connection> {
        self.target.open().map_err(|source| StoreError::Open {
            source,
            path: self.target.path().to_path_buf(),
        })
    }

    pub fn initialize(&self) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute_batch(RENDITIONS_SCHEMA)?;
        Ok(())
    }

    pub fn create_video(&self, video: &NewVideo) -> StoreResult<VideoId> {
        let conn = self.open()?;
        let created_at = video.created_at.unwrap_or_else(Utc::now).naive_utc();
        conn.execute(
            "INSERT INTO videos (title, description, owner_id, is_published, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                video.title,
                video.description,
                video.owner_id,
                video.is_published as i64,
                created_at
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn video_exists(&self, video_id: VideoId) -> StoreResult<bool> {
        let conn = self.open()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM videos WHERE id = ?1",
                params![video_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn get_video(&self, video_id: VideoId) -> StoreResult<Option<VideoRecord>> {
        let conn = self.open()?;
        let video = conn
            .query_row(
                "SELECT * FROM videos WHERE id = ?1",
                params![video_id],
                VideoRecord::from_row,
            )
            .optional()?;
        Ok(video)
    }

    /// Visible video ids, newest first with ties broken by ascending id.
    pub fn list_video_ids(&self, scope: VideoScope) -> StoreResult<Vec<VideoId>> {
        let conn = self.open()?;
        let ids = match scope {
            VideoScope::All => {
                let mut stmt =
                    conn.prepare("SELECT id FROM videos ORDER BY created_at DESC, id ASC")?;
                let rows = stmt.query_map([], |row| row.get::<_, VideoId>(0))?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
            VideoScope::Viewer { user_id } => {
                let mut stmt = conn.prepare(
                    "SELECT id FROM videos
                     WHERE is_published = 1 OR (?1 IS NOT NULL AND owner_id = ?1)
                     ORDER BY created_at DESC, id ASC",
                )?;
                let rows = stmt.query_map(params![user_id], |row| row.get::<_, VideoId>(0))?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
        };
        Ok(ids)
    }

    pub fn get_stream(&self, video_id: VideoId, resolution: &str) -> StoreResult<Option<StreamRecord>> {
        let conn = self.open()?;
        let stream = conn
            .query_row(
                "SELECT s.*, (SELECT COUNT(*) FROM video_segments g WHERE g.stream_id = s.id) AS segment_count
                 FROM video_streams s WHERE s.video_id = ?1 AND s.resolution = ?2",
                params![video_id, resolution],
                StreamRecord::from_row,
            )
            .optional()?;
        Ok(stream)
    }

    pub fn list_streams(&self, video_id: VideoId) -> StoreResult<Vec<StreamRecord>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT s.*, (SELECT COUNT(*) FROM video_segments g WHERE g.stream_id = s.id) AS segment_count
             FROM video_streams s WHERE s.video_id = ?1 ORDER BY s.resolution",
        )?;
        let rows = stmt.query_map(params![video_id], StreamRecord::from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn get_segment(
        &self,
        video_id: VideoId,
        resolution: &str,
        name: &str,
    ) -> StoreResult<Option<Vec<u8>>> {
        let conn = self.open()?;
        let content = conn
            .query_row(
                "SELECT g.content FROM video_segments g
                 JOIN video_streams s ON s.id = g.stream_id
                 WHERE s.video_id = ?1 AND s.resolution = ?2 AND g.name = ?3",
                params![video_id, resolution, name],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(content)
    }

    /// Mirrors one rendition into the database in a single transaction. Rows
    /// whose manifest or digest already match are left untouched, so a second
    /// call with the same input writes nothing. Stored segments absent from
    /// `segments` are deleted unless listed in `retain`.
    pub fn sync_rendition(
        &self,
        video_id: VideoId,
        resolution: &str,
        manifest: &str,
        segments: &[SegmentPayload],
        retain: &[String],
    ) -> StoreResult<SyncChanges> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let mut changes = SyncChanges::default();
        let now = Utc::now().naive_utc();

        let existing = tx
            .query_row(
                "SELECT id, manifest FROM video_streams WHERE video_id = ?1 AND resolution = ?2",
                params![video_id, resolution],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;

        let stream_id = match existing {
            Some((id, current)) => {
                if current != manifest {
                    tx.execute(
                        "UPDATE video_streams SET manifest = ?1, updated_at = ?2 WHERE id = ?3",
                        params![manifest, now, id],
                    )?;
                    changes.manifest_updated = true;
                }
                id
            }
            None => {
                tx.execute(
                    "INSERT INTO video_streams (video_id, resolution, manifest, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?4)",
                    params![video_id, resolution, manifest, now],
                )?;
                changes.stream_created = true;
                tx.last_insert_rowid()
            }
        };

        let mut stored: HashMap<String, String> = HashMap::new();
        {
            let mut stmt =
                tx.prepare("SELECT name, digest FROM video_segments WHERE stream_id = ?1")?;
            let rows = stmt.query_map(params![stream_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (name, digest) = row?;
                stored.insert(name, digest);
            }
        }

        for segment in segments {
            match stored.remove(&segment.name) {
                Some(digest) if digest == segment.digest => {}
                Some(_) => {
                    tx.execute(
                        "UPDATE video_segments SET content = ?1, digest = ?2, size_bytes = ?3
                         WHERE stream_id = ?4 AND name = ?5",
                        params![
                            segment.content,
                            segment.digest,
                            segment.content.len() as i64,
                            stream_id,
                            segment.name
                        ],
                    )?;
                    changes.segments_updated += 1;
                    changes.bytes_written += segment.content.len() as u64;
                }
                None => {
                    tx.execute(
                        "INSERT INTO video_segments (stream_id, name, content, digest, size_bytes, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        params![
                            stream_id,
                            segment.name,
                            segment.content,
                            segment.digest,
                            segment.content.len() as i64,
                            now
                        ],
                    )?;
                    changes.segments_created += 1;
                    changes.bytes_written += segment.content.len() as u64;
                }
            }
        }

        for name in stored.keys().filter(|name| !retain.contains(name)) {
            tx.execute(
                "DELETE FROM video_segments WHERE stream_id = ?1 AND name = ?2",
                params![stream_id, name],
            )?;
            changes.segments_deleted += 1;
        }

        tx.commit()?;
        Ok(changes)
    }
}

fn parse_timestamp(value: Option<NaiveDateTime>) -> Option<DateTime<Utc>> {
    value.map(|dt| DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc))
}
