//! Requesting missing renditions for a batch of videos.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::TranscodeResult;
use crate::profile::ProfileCatalog;
use crate::VideoId;

use super::dispatcher::{EnqueueResult, JobDispatcher};

#[derive(Debug, Clone, Default)]
pub struct BulkEnqueueRequest {
    pub videos: Vec<VideoId>,
    /// Empty means the whole catalog.
    pub resolutions: Vec<String>,
    pub dry_run: bool,
    /// Rebuild renditions that already exist.
    pub force: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BulkOutcome {
    UnknownVideo,
    SourceMissing,
    Present,
    Planned {
        resolutions: Vec<String>,
    },
    Queued {
        resolutions: Vec<String>,
        result: EnqueueResult,
    },
    Failed {
        resolutions: Vec<String>,
        message: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkEntry {
    pub video_id: VideoId,
    #[serde(flatten)]
    pub outcome: BulkOutcome,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkEnqueueReport {
    pub dry_run: bool,
    pub force: bool,
    pub entries: Vec<BulkEntry>,
}

impl BulkEnqueueReport {
    pub fn queued(&self) -> usize {
        self.count(|outcome| matches!(outcome, BulkOutcome::Queued { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|outcome| matches!(outcome, BulkOutcome::Failed { .. }))
    }

    fn count(&self, predicate: impl Fn(&BulkOutcome) -> bool) -> usize {
        self.entries
            .iter()
            .filter(|entry| predicate(&entry.outcome))
            .count()
    }
}

impl JobDispatcher {
    /// Requests the missing (with `force`, all) renditions of every listed
    /// video. Problems with one video are reported in its entry; only an
    /// unsupported resolution label fails the whole batch.
    pub async fn enqueue_missing(
        &self,
        request: &BulkEnqueueRequest,
    ) -> TranscodeResult<BulkEnqueueReport> {
        let labels = ProfileCatalog::new().resolve(&request.resolutions)?;
        let mut report = BulkEnqueueReport {
            dry_run: request.dry_run,
            force: request.force,
            entries: Vec::with_capacity(request.videos.len()),
        };
        let mut seen = Vec::with_capacity(request.videos.len());
        for &video_id in &request.videos {
            if seen.contains(&video_id) {
                continue;
            }
            seen.push(video_id);
            let outcome = self.enqueue_missing_for(video_id, &labels, request).await;
            report.entries.push(BulkEntry { video_id, outcome });
        }
        info!(
            videos = report.entries.len(),
            queued = report.queued(),
            failed = report.failed(),
            dry_run = request.dry_run,
            "bulk enqueue finished"
        );
        Ok(report)
    }

    async fn enqueue_missing_for(
        &self,
        video_id: VideoId,
        labels: &[String],
        request: &BulkEnqueueRequest,
    ) -> BulkOutcome {
        let renditions = self.encoder().renditions();
        let database = Arc::clone(renditions.database());
        match tokio::task::spawn_blocking(move || database.video_exists(video_id)).await {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => return BulkOutcome::UnknownVideo,
            Ok(Err(err)) => {
                return BulkOutcome::Failed {
                    resolutions: Vec::new(),
                    message: err.to_string(),
                }
            }
            Err(err) => {
                return BulkOutcome::Failed {
                    resolutions: Vec::new(),
                    message: err.to_string(),
                }
            }
        }
        if renditions.layout().source_path(video_id).is_none() {
            return BulkOutcome::SourceMissing;
        }

        let mut targets = Vec::new();
        for label in labels {
            if request.force || !renditions.manifest_ready(video_id, label).await {
                targets.push(label.clone());
            }
        }
        if targets.is_empty() {
            return BulkOutcome::Present;
        }
        if request.dry_run {
            return BulkOutcome::Planned {
                resolutions: targets,
            };
        }

        let result = if request.force {
            self.rebuild(video_id, &targets).await
        } else {
            self.enqueue(video_id, &targets).await
        };
        match result {
            Ok(result) => BulkOutcome::Queued {
                resolutions: targets,
                result,
            },
            Err(err) => {
                warn!(video_id, error = %err, "bulk enqueue failed for video");
                BulkOutcome::Failed {
                    resolutions: targets,
                    message: err.to_string(),
                }
            }
        }
    }
}
