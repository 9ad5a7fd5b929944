use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::config::RetrySection;
use crate::error::TranscodeResult;

const DEFAULT_SCHEDULE_SECS: [u64; 6] = [1, 2, 4, 8, 16, 32];

#[async_trait]
pub trait Sleeper: Send + Sync + fmt::Debug {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: usize,
    schedule: Vec<Duration>,
    fast_mode: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetrySection::default())
    }
}

impl RetryPolicy {
    pub fn new(config: &RetrySection) -> Self {
        Self::from_parts(config.max_attempts, &config.schedule_seconds, config.fast_mode)
    }

    /// Rebuilds a policy from the metadata stored with a queued job.
    pub fn from_parts(max_attempts: usize, schedule_seconds: &[u64], fast_mode: bool) -> Self {
        let mut schedule: Vec<Duration> = schedule_seconds
            .iter()
            .copied()
            .map(Duration::from_secs)
            .collect();
        if schedule.is_empty() {
            schedule = DEFAULT_SCHEDULE_SECS
                .iter()
                .copied()
                .map(Duration::from_secs)
                .collect();
        }
        Self {
            max_attempts: max_attempts.max(1),
            schedule,
            fast_mode,
        }
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn schedule_seconds(&self) -> Vec<u64> {
        self.schedule.iter().map(Duration::as_secs).collect()
    }

    pub fn fast_mode(&self) -> bool {
        self.fast_mode
    }

    /// Wait before retry number `retry` (1-based). The last schedule entry
    /// repeats once the schedule runs out.
    pub fn delay_for_retry(&self, retry: usize) -> Duration {
        let index = retry.saturating_sub(1).min(self.schedule.len().saturating_sub(1));
        self.schedule.get(index).copied().unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct RetryOutcome<T> {
    pub result: T,
    pub attempts: usize,
}

#[derive(Debug, Clone)]
pub struct RetryController {
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Same sleeper, different policy.
    pub fn with_policy(&self, policy: RetryPolicy) -> Self {
        Self {
            policy,
            sleeper: Arc::clone(&self.sleeper),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `operation` until it succeeds, fails permanently or the attempt
    /// budget is spent. The closure receives the 0-based attempt number.
    pub async fn run<F, Fut, T>(&self, label: &str, mut operation: F) -> TranscodeResult<RetryOutcome<T>>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = TranscodeResult<T>>,
    {
        let budget = self.policy.max_attempts;
        let mut attempt = 0usize;
        loop {
            match operation(attempt).await {
                Ok(result) => {
                    return Ok(RetryOutcome {
                        result,
                        attempts: attempt + 1,
                    })
                }
                Err(error) if error.is_permanent() => return Err(error),
                Err(error) => {
                    attempt += 1;
                    if attempt >= budget {
                        warn!(
                            operation = label,
                            attempts = attempt,
                            error = %error,
                            "retry budget exhausted"
                        );
                        return Err(error);
                    }
                    let wait = self.policy.delay_for_retry(attempt);
                    warn!(
                        operation = label,
                        attempt,
                        budget,
                        wait_s = wait.as_secs(),
                        error = %error,
                        "transient failure, retrying"
                    );
                    if !self.policy.fast_mode {
                        self.sleeper.sleep(wait).await;
                    }
                }
            }
        }
    }
}
