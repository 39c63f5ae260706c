use std::{
    collections::{HashMap, HashSet},
    io,
    sync::Arc,
    time::Duration,
};

use axum::BoxError;
use bytes::Bytes;
use futures::Stream;
use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    command::EncodeCommandBuilder,
    config::PipelineConfig,
    error::PipelineError,
    ffmpeg::Ffmpeg,
    ladder,
    supervisor::{CompletionReport, EncodeSupervisor},
    workspace::{JobId, WorkspaceManager},
};

#[derive(Debug, Clone, Serialize)]
pub struct SubmittedJob {
    pub job_id: String,
    pub source_height: u32,
    pub renditions: Vec<u32>,
    pub report: CompletionReport,
}

type ActiveJobs = Arc<RwLock<HashMap<JobId, CancellationToken>>>;

/// Runs upload → persist → probe → plan → build → encode for one job at a time per call.
/// Calls are independent; any number may run concurrently.
#[derive(Clone, Debug)]
pub struct Transcoder {
    workspaces: WorkspaceManager,
    builder: EncodeCommandBuilder,
    supervisor: EncodeSupervisor,
    active: ActiveJobs,
    shutdown: CancellationToken,
}

impl Transcoder {
    pub fn new(config: &PipelineConfig, ffmpeg: Arc<Ffmpeg>) -> Self {
        let builder = EncodeCommandBuilder::new(ffmpeg.path(), config.encode.clone());
        let supervisor =
            EncodeSupervisor::new(ffmpeg, config.encode_timeout(), config.probe_attempts);

        Self {
            workspaces: WorkspaceManager::new(config.base_dir.clone()),
            builder,
            supervisor,
            active: Arc::new(RwLock::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    pub fn ffmpeg(&self) -> &Ffmpeg {
        self.supervisor.ffmpeg()
    }

    pub fn active_jobs(&self) -> usize {
        self.active.read().len()
    }

    /// Kills every running encode and makes later ones stop immediately. Workspaces stay.
    pub fn cancel_all(&self) {
        let count = self.active_jobs();
        if count > 0 {
            warn!("Cancelling {count} running encode(s)");
        }
        self.shutdown.cancel();
    }

    /// Deletes stale job trees, leaving every job that is still encoding alone.
    pub async fn sweep_stale(&self, max_age: Duration) -> io::Result<usize> {
        let busy: HashSet<JobId> = self.active.read().keys().cloned().collect();
        self.workspaces.sweep_stale(max_age, &busy).await
    }

    /// Runs the whole pipeline for one upload and returns once the encode has finished.
    pub async fn submit<S, E>(
        &self,
        file_name: &str,
        upload: S,
    ) -> Result<SubmittedJob, PipelineError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Into<BoxError>,
    {
        let workspace = self.workspaces.create_workspace().await?;
        let job_id = workspace.job_id.clone();
        info!("[Job {job_id}] Accepted upload {file_name:?}");

        let input = self
            .workspaces
            .persist_upload(&workspace, file_name, upload)
            .await?;

        let media = self.supervisor.probe(&input).await.inspect_err(|e| {
            warn!("[Job {job_id}] {e}");
        })?;

        let ladder = ladder::plan(media.height);
        let renditions: Vec<u32> = ladder.iter().map(|r| r.height).collect();
        info!(
            "[Job {job_id}] Source {}p, {}; renditions {renditions:?}",
            media.height,
            format_duration(media.duration)
        );

        let invocation = self.builder.build(&input, &workspace.output_dir, &ladder);

        let report = if ladder.is_empty() {
            info!("[Job {job_id}] Nothing to encode below the lowest rendition");
            CompletionReport {
                success: true,
                wall_clock: Duration::ZERO,
                last_progress: None,
            }
        } else {
            debug!("[Job {job_id}] {invocation}");

            let guard = ActiveJob::register(&self.active, &job_id, &self.shutdown);
            let result = self
                .supervisor
                .run(&invocation, media.duration, &guard.cancel, |sample| {
                    info!(
                        "{job_id}: [{} / {}] {}%",
                        format_duration(sample.elapsed),
                        format_duration(sample.total),
                        sample.percent
                    );
                })
                .await;
            drop(guard);

            result.inspect_err(|e| error!("[Job {job_id}] {e}"))?
        };

        let total = format_duration(media.duration);
        info!(
            "{job_id}: [{total} / {total}] 100% in {}",
            format_duration(report.wall_clock)
        );

        Ok(SubmittedJob {
            job_id: job_id.to_string(),
            source_height: media.height,
            renditions,
            report,
        })
    }
}

/// Registry entry for an in-flight encode, removed even if the request future is dropped.
struct ActiveJob<'a> {
    active: &'a ActiveJobs,
    job_id: JobId,
    cancel: CancellationToken,
}

impl<'a> ActiveJob<'a> {
    fn register(active: &'a ActiveJobs, job_id: &JobId, shutdown: &CancellationToken) -> Self {
        let cancel = shutdown.child_token();
        active.write().insert(job_id.clone(), cancel.clone());
        Self {
            active,
            job_id: job_id.clone(),
            cancel,
        }
    }
}

impl Drop for ActiveJob<'_> {
    fn drop(&mut self) {
        self.active.write().remove(&self.job_id);
    }
}

/// `HH:MM:SS.ss`
fn format_duration(d: Duration) -> String {
    let centis = d.as_millis() / 10;
    let (secs, centis) = (centis / 100, centis % 100);
    format!(
        "{:02}:{:02}:{:02}.{centis:02}",
        secs / 3600,
        (secs / 60) % 60,
        secs % 60
    )
}
