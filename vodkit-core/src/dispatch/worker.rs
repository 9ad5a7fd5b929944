use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{TranscodeError, TranscodeResult};
use crate::VideoId;

use super::broker::{BrokerResult, JobQueue, JobRecord};
use super::dispatcher::{EnqueueResult, JobDispatcher};

const RECORD_ATTEMPTS: usize = 3;
const RECORD_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job_id: String,
    pub video_id: VideoId,
    pub succeeded: bool,
    pub message: String,
}

/// Drains the job queue one job at a time.
#[derive(Debug, Clone)]
pub struct TranscodeWorker {
    jobs: Arc<dyn JobQueue>,
    dispatcher: Arc<JobDispatcher>,
    queue: String,
    fast_mode: bool,
}

impl TranscodeWorker {
    pub fn new(
        jobs: Arc<dyn JobQueue>,
        dispatcher: Arc<JobDispatcher>,
        queue: impl Into<String>,
    ) -> Self {
        Self {
            jobs,
            dispatcher,
            queue: queue.into(),
            fast_mode: false,
        }
    }

    pub fn with_fast_mode(mut self, fast_mode: bool) -> Self {
        self.fast_mode = fast_mode;
        self
    }

    /// Claims and runs the next queued job. `None` when the queue is empty.
    /// Only a failed claim is an error; the job's own outcome is in the report.
    pub async fn run_once(&self) -> TranscodeResult<Option<JobReport>> {
        let queue = self.queue.clone();
        let Some(job) = self.on_queue(move |jobs| jobs.claim_next(&queue)).await? else {
            return Ok(None);
        };
        let video_id = job.video_id;
        info!(job_id = %job.id, video_id, profiles = ?job.resolutions, "job started");

        let result = self.execute(&job).await;
        let report = match result {
            Ok(outcome) => {
                let id = job.id.clone();
                self.record(&job, move |jobs| jobs.complete(&id)).await;
                JobReport {
                    job_id: job.id,
                    video_id,
                    succeeded: true,
                    message: outcome.message,
                }
            }
            Err(err) => {
                let (id, message) = (job.id.clone(), err.message().to_string());
                self.record(&job, move |jobs| jobs.fail(&id, &message)).await;
                warn!(job_id = %job.id, video_id, error = %err, "job failed, no further attempts");
                JobReport {
                    job_id: job.id,
                    video_id,
                    succeeded: false,
                    message: err.message().to_string(),
                }
            }
        };
        Ok(Some(report))
    }

    async fn execute(&self, job: &JobRecord) -> TranscodeResult<EnqueueResult> {
        let video_id = job.video_id;
        let retry = self
            .dispatcher
            .retry_controller(job.retry_policy(self.fast_mode));
        let limit = Duration::from_secs(job.timeout_s.max(1));
        match tokio::time::timeout(
            limit,
            self.dispatcher.run_job(video_id, &job.resolutions, &retry),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                let err = TranscodeError::transient(format!(
                    "job exceeded its {}s timeout",
                    limit.as_secs()
                ));
                let status = self.dispatcher.state().status.clone();
                let message = err.message().to_string();
                let recorded =
                    tokio::task::spawn_blocking(move || status.mark_failed(video_id, &message))
                        .await;
                match recorded {
                    Ok(Ok(())) => {}
                    Ok(Err(cache_err)) => {
                        warn!(video_id, error = %cache_err, "failed to record job timeout")
                    }
                    Err(join_err) => {
                        warn!(video_id, error = %join_err, "failed to record job timeout")
                    }
                }
                Err(err)
            }
        }
    }

    /// Writes the job outcome, retrying a couple of times so a briefly locked
    /// database does not leave the job `started`.
    async fn record<F>(&self, job: &JobRecord, op: F)
    where
        F: Fn(&dyn JobQueue) -> BrokerResult<()> + Clone + Send + 'static,
    {
        for attempt in 1..=RECORD_ATTEMPTS {
            match self.on_queue(op.clone()).await {
                Ok(()) => return,
                Err(err) if attempt < RECORD_ATTEMPTS => {
                    debug!(job_id = %job.id, attempt, error = %err, "recording job outcome failed, retrying");
                    tokio::time::sleep(RECORD_BACKOFF).await;
                }
                Err(err) => {
                    warn!(job_id = %job.id, error = %err, "job outcome not recorded");
                }
            }
        }
    }

    async fn on_queue<T, F>(&self, op: F) -> TranscodeResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn JobQueue) -> BrokerResult<T> + Send + 'static,
    {
        let jobs = Arc::clone(&self.jobs);
        Ok(tokio::task::spawn_blocking(move || op(jobs.as_ref())).await??)
    }

    /// Processes jobs until the queue is empty (`burst`) or forever, sleeping
    /// `poll_interval` whenever there is nothing to do. Outside burst mode a
    /// queue error is logged and polling continues.
    pub async fn run(&self, burst: bool, poll_interval: Duration) -> TranscodeResult<Vec<JobReport>> {
        let mut reports = Vec::new();
        loop {
            match self.run_once().await {
                Ok(Some(report)) => reports.push(report),
                Ok(None) if burst => break,
                Ok(None) => {
                    match self.on_queue(|jobs| jobs.cleanup_finished()).await {
                        Ok(0) => {}
                        Ok(removed) => debug!(removed, "expired job results removed"),
                        Err(err) => warn!(error = %err, "job cleanup failed"),
                    }
                    tokio::time::sleep(poll_interval).await;
                }
                Err(err) if burst => return Err(err),
                Err(err) => {
                    warn!(error = %err, "job queue unavailable, polling again");
                    tokio::time::sleep(poll_interval).await;
                }
            }
        }
        Ok(reports)
    }
}
