//! Picks default renditions for a freshly created or updated video and
//! schedules whichever of them are missing.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::cache::SharedStore;
use crate::config::{AutotranscodeSection, RungPolicy};
use crate::dispatch::{EnqueueResult, JobDispatcher};
use crate::encoder::{probe_source, SourceMeta};
use crate::error::TranscodeResult;
use crate::state::keys;
use crate::VideoId;

const RELAXED_ORDER: [&str; 3] = ["1080p", "720p", "480p"];

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ScheduleOutcome {
    SourceMissing,
    Debounced,
    NothingMissing,
    Scheduled {
        resolutions: Vec<String>,
        result: EnqueueResult,
    },
    Failed {
        message: String,
    },
}

/// Rung list for a source, highest first.
pub fn select_rungs(config: &AutotranscodeSection, meta: Option<SourceMeta>) -> Vec<String> {
    let allowed = |label: &str| config.allowed_renditions.iter().any(|a| a == label);
    let relaxed = || -> Vec<String> {
        RELAXED_ORDER
            .iter()
            .filter(|&&label| allowed(label))
            .map(|label| label.to_string())
            .collect()
    };
    match config.policy {
        RungPolicy::Relaxed => relaxed(),
        RungPolicy::Force1080 => {
            let mut rungs = relaxed();
            if allowed("1080p") && !rungs.iter().any(|r| r == "1080p") {
                rungs.insert(0, "1080p".to_string());
            }
            rungs
        }
        RungPolicy::Strict => {
            let meta = meta.unwrap_or_default();
            let height = meta.height.unwrap_or(0);
            let bitrate = meta.bitrate_bps.unwrap_or(0);
            let mut rungs = vec!["480p".to_string()];
            if height >= config.min_720_height || bitrate >= config.min_720_bitrate {
                rungs.insert(0, "720p".to_string());
            }
            if height >= config.min_1080_height && bitrate >= config.min_1080_bitrate {
                rungs.insert(0, "1080p".to_string());
            }
            rungs
        }
    }
}

#[derive(Debug, Clone)]
pub struct AutoTranscoder {
    config: AutotranscodeSection,
    store: SharedStore,
    dispatcher: Arc<JobDispatcher>,
}

impl AutoTranscoder {
    pub fn new(config: AutotranscodeSection, store: SharedStore, dispatcher: Arc<JobDispatcher>) -> Self {
        Self {
            config,
            store,
            dispatcher,
        }
    }

    /// Never fails: problems are logged and reported in the outcome, and the
    /// debounce key is dropped so the next call can try again.
    pub async fn schedule_default_renditions(&self, video_id: VideoId, force: bool) -> ScheduleOutcome {
        let encoder = self.dispatcher.encoder();
        let Some(source) = encoder.renditions().layout().source_path(video_id) else {
            info!(video_id, "autotranscode skipped, no source");
            return ScheduleOutcome::SourceMissing;
        };

        match self.acquire_debounce(video_id, force) {
            Ok(true) => {}
            Ok(false) => {
                info!(video_id, "autotranscode skipped, debounced");
                return ScheduleOutcome::Debounced;
            }
            Err(err) => {
                warn!(video_id, error = %err, "autotranscode debounce failed");
                return ScheduleOutcome::Failed {
                    message: err.to_string(),
                };
            }
        }

        let meta = if self.config.policy == RungPolicy::Strict {
            probe_source(encoder.executor().as_ref(), encoder.ffprobe(), &source).await
        } else {
            None
        };
        let targets = select_rungs(&self.config, meta);
        let mut missing = Vec::new();
        for label in targets {
            if !encoder.renditions().manifest_ready(video_id, &label).await {
                missing.push(label);
            }
        }
        if missing.is_empty() {
            self.clear_debounce(video_id);
            info!(video_id, "autotranscode skipped, no renditions needed");
            return ScheduleOutcome::NothingMissing;
        }

        match self.dispatcher.enqueue(video_id, &missing).await {
            Ok(result) => {
                info!(video_id, renditions = ?missing, mode = result.mode.as_str(), "autotranscode scheduled");
                ScheduleOutcome::Scheduled {
                    resolutions: missing,
                    result,
                }
            }
            Err(err) => {
                self.clear_debounce(video_id);
                warn!(video_id, error = %err, "autotranscode failed to schedule");
                ScheduleOutcome::Failed {
                    message: err.to_string(),
                }
            }
        }
    }

    fn acquire_debounce(&self, video_id: VideoId, force: bool) -> TranscodeResult<bool> {
        let key = keys::autotranscode(video_id);
        let window = std::time::Duration::from_secs(self.config.debounce_seconds);
        if force {
            self.store.set(&key, "1", window)?;
            Ok(true)
        } else {
            Ok(self.store.add(&key, "1", window)?)
        }
    }

    fn clear_debounce(&self, video_id: VideoId) {
        if let Err(err) = self.store.delete(&keys::autotranscode(video_id)) {
            warn!(video_id, error = %err, "failed to clear autotranscode debounce");
        }
    }
}
