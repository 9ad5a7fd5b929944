use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::cache::CacheResult;
use crate::config::{DispatchMode, DispatchSection};
use crate::encoder::{EncodeProgress, EncoderExecutor};
use crate::error::{TranscodeError, TranscodeErrorKind, TranscodeResult};
use crate::profile::ProfileCatalog;
use crate::state::{PendingMarker, StatusTracker, TranscodeLock, TranscodeState};
use crate::VideoId;

use super::broker::{Broker, BrokerResult, JobOptions, JobRequest};
use super::retry::{RetryController, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnqueueResult {
    /// Handed to the broker; the encode has not run yet.
    pub accepted: bool,
    pub job_id: Option<String>,
    pub queue: Option<String>,
    pub mode: DispatchMode,
    pub state: TranscodeState,
    pub message: String,
    /// Labels the encoder actually produced (inline runs only).
    pub encoded: Vec<String>,
}

impl EnqueueResult {
    fn already_present(video_id: VideoId, mode: DispatchMode) -> Self {
        Self {
            accepted: false,
            job_id: None,
            queue: None,
            mode,
            state: TranscodeState::Ready,
            message: format!("Transcode skipped for video {video_id}; renditions already exist."),
            encoded: Vec::new(),
        }
    }
}

/// Key-value backed state shared by every dispatcher and worker.
#[derive(Debug, Clone)]
pub struct TranscodeStateHandles {
    pub lock: TranscodeLock,
    pub pending: PendingMarker,
    pub status: StatusTracker,
}

/// Decides between a broker hand-off and an inline encode, and owns the
/// lock/status bookkeeping around every execution.
#[derive(Debug, Clone)]
pub struct JobDispatcher {
    mode: DispatchMode,
    state: TranscodeStateHandles,
    encoder: EncoderExecutor,
    retry: RetryController,
    broker: Option<Arc<dyn Broker>>,
    job: DispatchSection,
    catalog: ProfileCatalog,
}

impl JobDispatcher {
    pub fn new(
        mode: DispatchMode,
        state: TranscodeStateHandles,
        encoder: EncoderExecutor,
        retry: RetryController,
        job: DispatchSection,
    ) -> Self {
        Self {
            mode,
            state,
            encoder,
            retry,
            broker: None,
            job,
            catalog: ProfileCatalog::new(),
        }
    }

    pub fn with_broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    pub fn state(&self) -> &TranscodeStateHandles {
        &self.state
    }

    pub fn encoder(&self) -> &EncoderExecutor {
        &self.encoder
    }

    /// Controller for `policy` that sleeps the same way the dispatcher's own
    /// controller does.
    pub fn retry_controller(&self, policy: RetryPolicy) -> RetryController {
        self.retry.with_policy(policy)
    }

    pub async fn status(&self, video_id: VideoId) -> TranscodeResult<crate::state::StatusResult> {
        let cached = self
            .blocking(move |state| state.status.cached_status(video_id))
            .await?;
        match cached {
            Some(status) => Ok(status),
            None => Ok(self.state.status.disk_status(video_id).await),
        }
    }

    pub fn is_locked(&self, video_id: VideoId) -> TranscodeResult<bool> {
        Ok(self.state.lock.is_locked(video_id)?)
    }

    /// Entry point for callers asking for renditions of `video_id`.
    pub async fn enqueue<S: AsRef<str>>(
        &self,
        video_id: VideoId,
        resolutions: &[S],
    ) -> TranscodeResult<EnqueueResult> {
        let labels = self.catalog.resolve(resolutions)?;

        if let Some(result) = self.short_circuit(video_id, &labels).await? {
            return Ok(result);
        }

        self.clear_stale_pending(video_id).await?;
        let in_flight = self
            .blocking(move |state| {
                Ok(state.pending.is_pending(video_id)? || state.lock.is_locked(video_id)?)
            })
            .await?;
        if in_flight {
            debug!(video_id, "enqueue rejected, transcode in flight");
            return Err(TranscodeError::conflict());
        }

        if self.mode == DispatchMode::Broker {
            if let Some(broker) = &self.broker {
                if !self.blocking(move |state| state.pending.mark(video_id)).await? {
                    return Err(TranscodeError::conflict());
                }
                let request = JobRequest {
                    video_id,
                    resolutions: labels.clone(),
                };
                let options = self.job_options();
                let submitted =
                    on_broker(broker, move |broker| broker.enqueue(&request, &options)).await?;
                match submitted {
                    Ok(handle) => {
                        info!(video_id, job_id = %handle.id, queue = %handle.queue, profiles = ?labels, "transcode enqueued");
                        return Ok(EnqueueResult {
                            accepted: true,
                            job_id: Some(handle.id),
                            queue: Some(handle.queue),
                            mode: DispatchMode::Broker,
                            state: TranscodeState::Unknown,
                            message: format!("Transcode queued for video {video_id}."),
                            encoded: Vec::new(),
                        });
                    }
                    Err(err) => {
                        self.blocking(move |state| state.pending.clear(video_id)).await?;
                        warn!(video_id, error = %err, "broker submit failed, falling back to inline execution");
                    }
                }
            } else {
                warn!(video_id, "broker mode without a broker, running inline");
            }
        }

        self.execute(video_id, &labels, false, &self.retry).await
    }

    /// Worker entry point: same short-circuit, no pending conflict check (the
    /// marker belongs to the job being run).
    pub async fn run_job<S: AsRef<str>>(
        &self,
        video_id: VideoId,
        resolutions: &[S],
        retry: &RetryController,
    ) -> TranscodeResult<EnqueueResult> {
        let labels = self.catalog.resolve(resolutions)?;
        if let Some(result) = self.short_circuit(video_id, &labels).await? {
            return Ok(result);
        }
        self.execute(video_id, &labels, false, retry).await
    }

    /// Re-encodes every label even when renditions exist. Each rendition is
    /// built in a staging directory and swapped in when complete.
    pub async fn rebuild<S: AsRef<str>>(
        &self,
        video_id: VideoId,
        resolutions: &[S],
    ) -> TranscodeResult<EnqueueResult> {
        let labels = self.catalog.resolve(resolutions)?;
        if self.blocking(move |state| state.lock.is_locked(video_id)).await? {
            return Err(TranscodeError::conflict());
        }
        self.execute(video_id, &labels, true, &self.retry).await
    }

    fn job_options(&self) -> JobOptions {
        JobOptions {
            queue: self.job.queue_name.clone(),
            job_name: self.job.job_name.clone(),
            timeout: Duration::from_secs(self.job.job_timeout_seconds),
            result_ttl: Duration::from_secs(self.job.result_ttl_seconds),
            retry: self.retry.policy().clone(),
        }
    }

    async fn short_circuit(
        &self,
        video_id: VideoId,
        labels: &[String],
    ) -> TranscodeResult<Option<EnqueueResult>> {
        let renditions = self.encoder.renditions();
        for label in labels {
            if !renditions.manifest_ready(video_id, label).await {
                return Ok(None);
            }
        }
        self.blocking(move |state| {
            state.pending.clear(video_id)?;
            state.lock.release(video_id)?;
            state.status.mark_ready(video_id)
        })
        .await?;
        info!(video_id, profiles = ?labels, "transcode skipped, renditions already exist");
        Ok(Some(EnqueueResult::already_present(video_id, self.mode)))
    }

    /// A pending marker with no lock and no live broker job was left behind by
    /// a lost job; drop it so the video is not blocked until the TTL expires.
    async fn clear_stale_pending(&self, video_id: VideoId) -> TranscodeResult<()> {
        let suspect = self
            .blocking(move |state| {
                Ok(state.pending.is_pending(video_id)? && !state.lock.is_locked(video_id)?)
            })
            .await?;
        if !suspect {
            return Ok(());
        }
        let active = match &self.broker {
            Some(broker) => on_broker(broker, move |broker| broker.has_active_job(video_id))
                .await?
                .unwrap_or_else(|err| {
                    debug!(video_id, error = %err, "pending sanity check failed");
                    true
                }),
            None => false,
        };
        if !active {
            self.blocking(move |state| state.pending.clear(video_id)).await?;
            info!(video_id, "cleared stale transcode pending flag");
        }
        Ok(())
    }

    /// Runs a key-value store operation off the async runtime; the SQLite
    /// backend may wait on its busy timeout.
    async fn blocking<T, F>(&self, op: F) -> TranscodeResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&TranscodeStateHandles) -> CacheResult<T> + Send + 'static,
    {
        let state = self.state.clone();
        Ok(tokio::task::spawn_blocking(move || op(&state)).await??)
    }

    async fn execute(
        &self,
        video_id: VideoId,
        labels: &[String],
        force: bool,
        retry: &RetryController,
    ) -> TranscodeResult<EnqueueResult> {
        let lock_ttl = self.state.lock.ttl();
        let deadline = Instant::now() + lock_ttl;
        let Some(guard) = self.blocking(move |state| state.lock.try_lock(video_id)).await? else {
            return Err(TranscodeError::conflict());
        };
        let result = self
            .execute_locked(video_id, labels, force, retry, deadline)
            .await;
        // Dropping the guard deletes the lock key, which is a store write.
        if let Err(err) = tokio::task::spawn_blocking(move || drop(guard)).await {
            warn!(video_id, error = %err, "lock release task failed");
        }
        result
    }

    async fn execute_locked(
        &self,
        video_id: VideoId,
        labels: &[String],
        force: bool,
        retry: &RetryController,
        deadline: Instant,
    ) -> TranscodeResult<EnqueueResult> {
        let lock_ttl = self.state.lock.ttl();
        self.blocking(move |state| {
            state.pending.clear(video_id)?;
            state.status.mark_processing(video_id)
        })
        .await?;

        // The whole run, retries included, must end before the lock can expire
        // under it.
        let label = format!("transcode video {video_id}");
        let progress = EncodeProgress::default();
        let run = retry.run(&label, |_| {
            self.encoder
                .encode_resumable(video_id, labels, force, &progress)
        });
        let outcome = match tokio::time::timeout_at(deadline, run).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(
                    video_id,
                    lock_ttl_s = lock_ttl.as_secs(),
                    finished = ?progress.completed(),
                    "transcode outlived its lock"
                );
                Err(TranscodeError::transient(format!(
                    "transcode exceeded the {}s lock ttl",
                    lock_ttl.as_secs()
                )))
            }
        };
        let pending_cleared = self.blocking(move |state| state.pending.clear(video_id)).await;

        match outcome {
            Ok(outcome) => {
                pending_cleared?;
                self.blocking(move |state| state.status.mark_ready(video_id))
                    .await?;
                info!(
                    video_id,
                    profiles = ?labels,
                    attempts = outcome.attempts,
                    "transcode finished"
                );
                Ok(EnqueueResult {
                    accepted: false,
                    job_id: None,
                    queue: None,
                    mode: DispatchMode::Inline,
                    state: TranscodeState::Ready,
                    message: format!(
                        "Transcode finished for video {video_id} ({}).",
                        labels.join(", ")
                    ),
                    encoded: outcome.result.encoded,
                })
            }
            Err(err) => {
                let message = err.message().to_string();
                let recorded = self
                    .blocking(move |state| state.status.mark_failed(video_id, &message))
                    .await;
                if let Err(cache_err) = recorded {
                    warn!(video_id, error = %cache_err, "failed to record transcode failure");
                }
                if err.kind() == TranscodeErrorKind::Environment {
                    error!(video_id, error = %err, "transcode failed, environment needs attention");
                } else {
                    warn!(video_id, error = %err, status = err.status_code(), "transcode failed");
                }
                Err(err)
            }
        }
    }
}

/// Runs a broker call off the async runtime. Only a panicked task is an error
/// here; broker failures are handed back for the caller to judge.
async fn on_broker<T, F>(broker: &Arc<dyn Broker>, op: F) -> TranscodeResult<BrokerResult<T>>
where
    T: Send + 'static,
    F: FnOnce(&dyn Broker) -> BrokerResult<T> + Send + 'static,
{
    let broker = Arc::clone(broker);
    Ok(tokio::task::spawn_blocking(move || op(broker.as_ref())).await?)
}
