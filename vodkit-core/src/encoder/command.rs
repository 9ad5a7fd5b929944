use std::fmt;
use std::io;
use std::path::Path;
use std::process::Output;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

/// Seam over external processes so encodes can be exercised without ffmpeg.
#[async_trait]
pub trait CommandExecutor: Send + Sync + fmt::Debug {
    /// Runs `program` to completion. A run exceeding `timeout` is killed and
    /// reported as `io::ErrorKind::TimedOut`.
    async fn run(
        &self,
        program: &Path,
        args: &[String],
        timeout: Option<Duration>,
    ) -> io::Result<Output>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommandExecutor;

#[async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn run(
        &self,
        program: &Path,
        args: &[String],
        timeout: Option<Duration>,
    ) -> io::Result<Output> {
        let mut command = Command::new(program);
        command.args(args).kill_on_drop(true);
        match timeout {
            Some(limit) => tokio::time::timeout(limit, command.output())
                .await
                .map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("{} exceeded {}s", program.display(), limit.as_secs()),
                    )
                })?,
            None => command.output().await,
        }
    }
}
