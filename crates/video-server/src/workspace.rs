//! Per-job filesystem isolation.
//!
//! Layout: `<base>/input/<job>/<upload name>` and `<base>/output/<job>/<height>p*.{m3u8,ts}`.
//! Directory existence is the only record of a job.

use std::{
    collections::HashSet,
    fmt, io,
    path::{Component, Path, PathBuf},
    time::{Duration, SystemTime},
};

use axum::BoxError;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::{fs, io::AsyncWriteExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::PipelineError;

const INPUT_AREA: &str = "input";
const OUTPUT_AREA: &str = "output";
const FALLBACK_FILE_NAME: &str = "source";

/// 128 random bits rendered as 32 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobId(String);

impl JobId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Accepts only the exact shape [`JobId::generate`] produces.
    pub fn parse(raw: &str) -> Option<Self> {
        let well_formed =
            raw.len() == 32 && raw.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        well_formed.then(|| Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct Workspace {
    pub job_id: JobId,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    base_dir: PathBuf,
}

impl WorkspaceManager {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn area_dir(&self, area: &str, job_id: &JobId) -> PathBuf {
        self.base_dir.join(area).join(job_id.as_str())
    }

    /// Allocates a fresh job id and creates its input and output directories.
    ///
    /// A directory that already exists is a collision and fails the job rather than sharing
    /// another job's tree.
    pub async fn create_workspace(&self) -> Result<Workspace, PipelineError> {
        let job_id = JobId::generate();
        let input_dir = self.area_dir(INPUT_AREA, &job_id);
        let output_dir = self.area_dir(OUTPUT_AREA, &job_id);

        for dir in [&input_dir, &output_dir] {
            create_job_dir(dir).await.map_err(|e| {
                warn!("[Job {job_id}] Failed to create {}: {e}", dir.display());
                PipelineError::Workspace(e)
            })?;
        }

        debug!("[Job {job_id}] Workspace created under {}", self.base_dir.display());

        Ok(Workspace {
            job_id,
            input_dir,
            output_dir,
        })
    }

    /// Streams an upload into the job's input area without holding it in memory.
    pub async fn persist_upload<S, E>(
        &self,
        workspace: &Workspace,
        file_name: &str,
        stream: S,
    ) -> Result<PathBuf, PipelineError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Into<BoxError>,
    {
        let path = workspace.input_dir.join(sanitize_file_name(file_name));
        let mut file = fs::File::create(&path)
            .await
            .map_err(PipelineError::Workspace)?;

        futures::pin_mut!(stream);
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| PipelineError::Upload(io::Error::other(e)))?;
            file.write_all(&chunk)
                .await
                .map_err(PipelineError::Workspace)?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(PipelineError::Workspace)?;

        info!(
            "[Job {}] Saved upload to {} ({written} bytes)",
            workspace.job_id,
            path.display()
        );
        Ok(path)
    }

    /// Maps an untrusted `(job id, file name)` pair to a file inside that job's output tree.
    ///
    /// Every rejection is the same [`PipelineError::NotFound`].
    pub async fn resolve_artifact(
        &self,
        job_id: &str,
        file_name: &str,
    ) -> Result<PathBuf, PipelineError> {
        let Some(job_id) = JobId::parse(job_id) else {
            return Err(not_found("malformed job id", job_id, file_name));
        };
        if !is_plain_file_name(file_name) {
            return Err(not_found("file name is not a single component", job_id.as_str(), file_name));
        }

        let job_dir = self.area_dir(OUTPUT_AREA, &job_id);
        let Ok(canonical_dir) = fs::canonicalize(&job_dir).await else {
            return Err(not_found("no output directory", job_id.as_str(), file_name));
        };
        let Ok(canonical) = fs::canonicalize(job_dir.join(file_name)).await else {
            return Err(not_found("no such artifact", job_id.as_str(), file_name));
        };
        if !canonical.starts_with(&canonical_dir) {
            return Err(not_found("artifact escapes job directory", job_id.as_str(), file_name));
        }

        match fs::metadata(&canonical).await {
            Ok(meta) if meta.is_file() => Ok(canonical),
            _ => Err(not_found("artifact is not a regular file", job_id.as_str(), file_name)),
        }
    }

    /// Removes job trees whose last modification is older than `max_age`, except those in `busy`.
    ///
    /// Returns the number of distinct jobs removed. A job that cannot be inspected or removed is
    /// logged and left for the next sweep.
    pub async fn sweep_stale(
        &self,
        max_age: Duration,
        busy: &HashSet<JobId>,
    ) -> io::Result<usize> {
        let now = SystemTime::now();
        let mut removed = HashSet::new();

        for area in [INPUT_AREA, OUTPUT_AREA] {
            let root = self.base_dir.join(area);
            let mut entries = match fs::read_dir(&root).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };

            loop {
                let entry = match entries.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Stopped listing {}: {e}", root.display());
                        break;
                    }
                };
                let name = entry.file_name();
                let Some(job_id) = name.to_str().and_then(JobId::parse) else {
                    continue;
                };
                if busy.contains(&job_id) {
                    continue;
                }
                let meta = match entry.metadata().await {
                    Ok(meta) if meta.is_dir() => meta,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("[Job {job_id}] Cannot inspect {area} directory: {e}");
                        continue;
                    }
                };
                let age = meta
                    .modified()
                    .ok()
                    .and_then(|modified| now.duration_since(modified).ok())
                    .unwrap_or_default();
                if age <= max_age {
                    continue;
                }

                if let Err(e) = fs::remove_dir_all(entry.path()).await {
                    warn!("[Job {job_id}] Cannot remove stale {area} directory: {e}");
                    continue;
                }
                debug!("[Job {job_id}] Removed stale {area} directory");
                removed.insert(job_id);
            }
        }

        if !removed.is_empty() {
            info!("Swept {} stale job(s) from {}", removed.len(), self.base_dir.display());
        }
        Ok(removed.len())
    }
}

async fn create_job_dir(dir: &Path) -> io::Result<()> {
    if let Some(parent) = dir.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::create_dir(dir).await
}

fn not_found(reason: &str, job_id: &str, file_name: &str) -> PipelineError {
    debug!("Artifact lookup rejected ({reason}): job={job_id:?} file={file_name:?}");
    PipelineError::NotFound
}

fn is_plain_file_name(name: &str) -> bool {
    if name.is_empty() || name.contains(['/', '\\', '\0']) {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Reduces a client-supplied upload name to its last path component.
pub fn sanitize_file_name(raw: &str) -> String {
    let last = raw.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    if last.is_empty() || last == "." || last == ".." || last.contains('\0') {
        FALLBACK_FILE_NAME.to_string()
    } else {
        last.to_string()
    }
}
