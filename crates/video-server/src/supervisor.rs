use std::{
    collections::VecDeque,
    path::Path,
    process::{ExitStatus, Stdio},
    sync::Arc,
    time::{Duration, Instant},
};

use serde::Serialize;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    command::EncodeInvocation,
    error::PipelineError,
    ffmpeg::{Ffmpeg, MediaInfo},
    progress::{ProgressParser, ProgressSample},
};

const STDERR_TAIL_LINES: usize = 20;
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Serialize)]
pub struct CompletionReport {
    pub success: bool,
    pub wall_clock: Duration,
    pub last_progress: Option<ProgressSample>,
}

enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Runs one encoder process per job and watches it until it exits.
#[derive(Debug, Clone)]
pub struct EncodeSupervisor {
    ffmpeg: Arc<Ffmpeg>,
    timeout: Option<Duration>,
    probe_attempts: u32,
}

impl EncodeSupervisor {
    pub fn new(ffmpeg: Arc<Ffmpeg>, timeout: Option<Duration>, probe_attempts: u32) -> Self {
        Self {
            ffmpeg,
            timeout,
            probe_attempts,
        }
    }

    pub fn ffmpeg(&self) -> &Ffmpeg {
        &self.ffmpeg
    }

    /// Startup phase: the probe has to succeed before a ladder can be planned.
    pub async fn probe(&self, media: &Path) -> Result<MediaInfo, PipelineError> {
        self.ffmpeg.probe(media, self.probe_attempts).await
    }

    /// Blocks until the encoder exits, is killed by the timeout, or `cancel` fires.
    ///
    /// `on_progress` is called inline for every sample read from the progress pipe, so it
    /// should return quickly. Partial outputs are left in place on failure.
    pub async fn run<F>(
        &self,
        invocation: &EncodeInvocation,
        total: Duration,
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> Result<CompletionReport, PipelineError>
    where
        F: FnMut(&ProgressSample) + Send,
    {
        let started = Instant::now();

        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PipelineError::Encode {
                exit_code: None,
                stderr_tail: format!("failed to spawn {}: {e}", invocation.program.display()),
                last_progress: None,
            })?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(PipelineError::Encode {
                exit_code: None,
                stderr_tail: "encoder pipes were not captured".to_string(),
                last_progress: None,
            });
        };

        let mut stderr_task = tokio::spawn(collect_tail(stderr, STDERR_TAIL_LINES));

        let mut lines = BufReader::new(stdout).lines();
        let mut parser = ProgressParser::new(total);
        let mut stdout_open = true;

        let deadline = tokio::time::sleep(self.timeout.unwrap_or_default());
        tokio::pin!(deadline);

        // The progress pipe is drained while waiting so a full pipe never stalls the encoder.
        let outcome = loop {
            tokio::select! {
                line = lines.next_line(), if stdout_open => match line {
                    Ok(Some(line)) => {
                        if let Some(sample) = parser.feed(&line) {
                            on_progress(&sample);
                        }
                    }
                    Ok(None) => stdout_open = false,
                    Err(e) => {
                        warn!("Progress pipe read failed: {e}");
                        stdout_open = false;
                    }
                },
                status = child.wait() => break Outcome::Exited(status),
                () = &mut deadline, if self.timeout.is_some() => break Outcome::TimedOut,
                () = cancel.cancelled() => break Outcome::Cancelled,
            }
        };

        let status = match outcome {
            Outcome::Exited(status) => status,
            Outcome::TimedOut => {
                stop(&mut child, &stderr_task).await;
                return Err(PipelineError::Timeout {
                    after: self.timeout.unwrap_or_default(),
                    last_progress: parser.last(),
                });
            }
            Outcome::Cancelled => {
                stop(&mut child, &stderr_task).await;
                return Err(PipelineError::Cancelled {
                    last_progress: parser.last(),
                });
            }
        };

        // A descendant that inherited the pipes can keep them open after the encoder is gone.
        let drained = tokio::time::timeout(PIPE_DRAIN_GRACE, async {
            while stdout_open {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if let Some(sample) = parser.feed(&line) {
                            on_progress(&sample);
                        }
                    }
                    _ => stdout_open = false,
                }
            }
            (&mut stderr_task).await.unwrap_or_default()
        })
        .await;

        let stderr_tail = drained.unwrap_or_else(|_| {
            warn!("Encoder pipes still open {PIPE_DRAIN_GRACE:?} after exit, abandoning them");
            stderr_task.abort();
            String::new()
        });
        let last_progress = parser.last();

        match status {
            Ok(status) if status.success() => {
                debug!("Encoder exited cleanly in {:?}", started.elapsed());
                Ok(CompletionReport {
                    success: true,
                    wall_clock: started.elapsed(),
                    last_progress,
                })
            }
            Ok(status) => Err(PipelineError::Encode {
                exit_code: status.code(),
                stderr_tail,
                last_progress,
            }),
            Err(e) => Err(PipelineError::Encode {
                exit_code: None,
                stderr_tail: format!("failed to wait for encoder: {e}"),
                last_progress,
            }),
        }
    }
}

async fn stop(child: &mut Child, stderr_task: &JoinHandle<String>) {
    if let Err(e) = child.kill().await {
        warn!("Failed to kill encoder: {e}");
    }
    stderr_task.abort();
}

async fn collect_tail<R>(reader: R, limit: usize) -> String
where
    R: AsyncRead + Unpin,
{
    let mut tail = VecDeque::with_capacity(limit);
    let mut lines = BufReader::new(reader).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        trace!("encoder: {line}");
        if tail.len() == limit {
            tail.pop_front();
        }
        tail.push_back(line);
    }

    Vec::from(tail).join("\n")
}
