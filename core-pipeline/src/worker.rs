//! # Chapter Workers
//!
//! A [`Worker`] turns one [`ChapterJob`] into a [`ChapterOutput`].
//!
//! - [`InProcessWorker`] runs the chapter processor on the runtime's threads.
//! - [`ProcessWorker`] spawns the configured worker executable once per
//!   chapter. The child reads one JSON job line from stdin and answers with
//!   one JSON [`WorkerReply`] line on stdout; [`serve_stdio`] is the
//!   child-side half of that exchange.
//!
//! The parent keeps the child's stdin open while the job runs. Closing it
//! is the stop request: the child cancels its job, which ends at the next
//! batch boundary, replies and exits. Children run in their own process
//! group so a terminal interrupt reaches only the parent. A child that has
//! not exited within the exit grace period is killed.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chapter::{ChapterJob, ChapterOutput, ChapterProcessor};
use crate::error::{PipelineError, Result};

/// Environment variable carrying the child's memory share in bytes.
pub const WORKER_MEMORY_ENV: &str = "NARRATOR_WORKER_MEMORY_BYTES";

/// How long a child may take to exit after replying or after a stop request.
pub const DEFAULT_EXIT_GRACE: Duration = Duration::from_secs(30);

#[async_trait]
pub trait Worker: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, job: ChapterJob, cancel: CancellationToken) -> Result<ChapterOutput>;
}

pub struct InProcessWorker {
    processor: Arc<ChapterProcessor>,
}

impl InProcessWorker {
    pub fn new(processor: Arc<ChapterProcessor>) -> Self {
        Self { processor }
    }
}

#[async_trait]
impl Worker for InProcessWorker {
    fn name(&self) -> &'static str {
        "in-process"
    }

    async fn run(&self, job: ChapterJob, cancel: CancellationToken) -> Result<ChapterOutput> {
        self.processor.process(job, &cancel).await
    }
}

/// Reply line written by a worker child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerReply {
    Completed { output: ChapterOutput },
    Failed { code: String, message: String },
}

impl WorkerReply {
    fn from_result(result: Result<ChapterOutput>) -> Self {
        match result {
            Ok(output) => WorkerReply::Completed { output },
            Err(err) => {
                let code = err.code().to_string();
                let message = match err {
                    PipelineError::Chapter { message, .. } => message,
                    other => other.to_string(),
                };
                WorkerReply::Failed { code, message }
            }
        }
    }

    fn into_result(self, index: usize) -> Result<ChapterOutput> {
        match self {
            WorkerReply::Completed { output } => Ok(output),
            WorkerReply::Failed { code, message } => Err(match code.as_str() {
                "E100" => PipelineError::Chapter { index, message },
                "E200" => PipelineError::Encoding(message),
                "E300" => PipelineError::ResourceExhausted(message),
                "E400" => PipelineError::Cancelled,
                _ => PipelineError::Worker(message),
            }),
        }
    }
}

pub struct ProcessWorker {
    program: PathBuf,
    args: Vec<String>,
    memory_share: u64,
    exit_grace: Duration,
}

impl ProcessWorker {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, memory_share: u64) -> Self {
        Self {
            program: program.into(),
            args,
            memory_share,
            exit_grace: DEFAULT_EXIT_GRACE,
        }
    }

    pub fn with_exit_grace(mut self, grace: Duration) -> Self {
        self.exit_grace = grace;
        self
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env(WORKER_MEMORY_ENV, self.memory_share.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        command
    }

    /// Waits up to the exit grace for `child`, then kills it.
    async fn reap(&self, index: usize, child: &mut Child) -> Option<ExitStatus> {
        match tokio::time::timeout(self.exit_grace, child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(err)) => {
                warn!(chapter = index, error = %err, "Failed to wait for chapter worker");
                None
            }
            Err(_) => {
                warn!(
                    chapter = index,
                    grace_ms = self.exit_grace.as_millis() as u64,
                    "Chapter worker did not exit in time; killing it"
                );
                if let Err(err) = child.kill().await {
                    warn!(chapter = index, error = %err, "Failed to kill chapter worker");
                }
                None
            }
        }
    }
}

/// Sends the job line and reads the reply line.
async fn exchange(
    stdin: &mut ChildStdin,
    request: &[u8],
    lines: &mut Lines<BufReader<ChildStdout>>,
) -> Result<Option<String>> {
    stdin.write_all(request).await?;
    stdin.flush().await?;
    Ok(lines.next_line().await?)
}

#[async_trait]
impl Worker for ProcessWorker {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn run(&self, job: ChapterJob, cancel: CancellationToken) -> Result<ChapterOutput> {
        let index = job.index;
        let mut child = self.command().spawn().map_err(|err| {
            PipelineError::Worker(format!("failed to spawn {}: {}", self.program.display(), err))
        })?;
        debug!(chapter = index, pid = ?child.id(), "Spawned chapter worker");

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| PipelineError::Worker("worker stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PipelineError::Worker("worker stdout unavailable".to_string()))?;

        let mut request = serde_json::to_string(&job)?;
        request.push('\n');

        let mut lines = BufReader::new(stdout).lines();
        let reply = tokio::select! {
            _ = cancel.cancelled() => None,
            reply = exchange(&mut stdin, request.as_bytes(), &mut lines) => Some(reply),
        };
        drop(stdin);

        let Some(reply) = reply else {
            info!(chapter = index, "Asked chapter worker to stop");
            self.reap(index, &mut child).await;
            return Err(PipelineError::Cancelled);
        };

        let status = self.reap(index, &mut child).await;
        let line = reply?.ok_or_else(|| {
            let status = status
                .map(|status| status.to_string())
                .unwrap_or_else(|| "unknown status".to_string());
            PipelineError::Worker(format!("worker exited with {} without a reply", status))
        })?;

        serde_json::from_str::<WorkerReply>(&line)?.into_result(index)
    }
}

/// Memory share handed to this process by its parent, if any.
pub fn worker_memory_share() -> Option<u64> {
    std::env::var(WORKER_MEMORY_ENV)
        .ok()
        .and_then(|value| value.trim().parse().ok())
}

/// Child-side entry point: reads one job from stdin, processes it and
/// writes the reply to stdout. End of input while the job runs cancels it.
pub async fn serve_stdio(processor: Arc<ChapterProcessor>) -> Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    serve(processor, stdin, stdout).await
}

/// [`serve_stdio`] over arbitrary streams.
pub async fn serve<R, W>(processor: Arc<ChapterProcessor>, reader: R, mut writer: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    let line = lines
        .next_line()
        .await?
        .ok_or_else(|| PipelineError::Worker("no job received".to_string()))?;
    let job: ChapterJob = serde_json::from_str(&line)?;
    info!(chapter = job.index, "Worker received chapter job");

    let cancel = CancellationToken::new();
    let result = {
        let processing = processor.process(job, &cancel);
        tokio::pin!(processing);
        loop {
            tokio::select! {
                result = &mut processing => break result,
                _ = lines.next_line(), if !cancel.is_cancelled() => {
                    info!("Stop requested by parent");
                    cancel.cancel();
                }
            }
        }
    };
    let mut reply = serde_json::to_string(&WorkerReply::from_result(result))?;
    reply.push('\n');

    writer.write_all(reply.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
