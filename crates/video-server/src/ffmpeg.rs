use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::PipelineError;

/// Locations of the external encoder and prober. Nothing here is process-global.
#[derive(Debug, Clone)]
pub struct Ffmpeg {
    path: PathBuf,
    probe_path: PathBuf,
    version: String,
}

impl Ffmpeg {
    /// Checks that the encoder answers `-version` before any job relies on it.
    pub async fn new(path: PathBuf, probe_path: PathBuf) -> Result<Self> {
        let version = read_version(&path)
            .await
            .with_context(|| format!("Failed to run encoder at {}", path.display()))?;
        info!("FFmpeg version: {}", version);

        Ok(Self {
            path,
            probe_path,
            version,
        })
    }

    /// Skips the version check; used when the binaries are known to exist or are stand-ins.
    pub fn unchecked(path: PathBuf, probe_path: PathBuf) -> Self {
        Self {
            path,
            probe_path,
            version: "unknown".to_string(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn probe_path(&self) -> &Path {
        &self.probe_path
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Reads duration and first-video-stream height, retrying only when the prober could not
    /// be started at all.
    pub async fn probe(&self, media: &Path, attempts: u32) -> Result<MediaInfo, PipelineError> {
        let attempts = attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.probe_once(media).await {
                Err(ProbeFailure::Spawn(e)) if attempt < attempts => {
                    warn!(
                        "ffprobe could not start (attempt {attempt}/{attempts}): {e}; retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(200 * u64::from(attempt))).await;
                }
                Err(ProbeFailure::Spawn(e)) => {
                    return Err(PipelineError::Probe(format!(
                        "failed to run {}: {e}",
                        self.probe_path.display()
                    )));
                }
                Err(ProbeFailure::Rejected(reason)) => return Err(PipelineError::Probe(reason)),
                Ok(info) => return Ok(info),
            }
        }
    }

    async fn probe_once(&self, media: &Path) -> Result<MediaInfo, ProbeFailure> {
        debug!("Probing {}", media.display());

        let output = Command::new(&self.probe_path)
            .arg("-v")
            .arg("error")
            .arg("-print_format")
            .arg("json")
            .arg("-show_streams")
            .arg("-show_format")
            .arg(media)
            .output()
            .await
            .map_err(ProbeFailure::Spawn)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProbeFailure::Rejected(format!(
                "ffprobe exited with code {} for {}: {}",
                output.status.code().unwrap_or(-1),
                media.display(),
                stderr.trim()
            )));
        }

        let data: ProbeData = serde_json::from_slice(&output.stdout).map_err(|e| {
            ProbeFailure::Rejected(format!("unreadable ffprobe output for {}: {e}", media.display()))
        })?;

        Ok(MediaInfo::from(data))
    }
}

async fn read_version(path: &Path) -> Result<String> {
    let output = Command::new(path).arg("-version").output().await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!("-version exited with {}: {}", output.status, stderr.trim()));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.lines().next().unwrap_or("unknown").to_string())
}

enum ProbeFailure {
    Spawn(io::Error),
    Rejected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaInfo {
    pub duration: Duration,
    /// Height of the first video stream; 0 when the container has none.
    pub height: u32,
}

#[derive(Debug, Deserialize)]
struct ProbeData {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    height: Option<u32>,
}

impl From<ProbeData> for MediaInfo {
    fn from(data: ProbeData) -> Self {
        let duration = data
            .format
            .and_then(|f| f.duration)
            .and_then(|d| d.trim().parse::<f64>().ok())
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .map(Duration::from_secs_f64)
            .unwrap_or_default();

        let height = data
            .streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some("video"))
            .and_then(|s| s.height)
            .unwrap_or(0);

        Self { duration, height }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn parse(json: &str) -> MediaInfo {
        let data: ProbeData = serde_json::from_str(json).expect("valid probe json");
        MediaInfo::from(data)
    }

    #[test]
    fn test_media_info_from_probe() {
        let info = parse(
            r#"{
                "streams": [
                    { "index": 0, "codec_type": "audio", "codec_name": "aac" },
                    { "index": 1, "codec_type": "video", "codec_name": "h264", "width": 1280, "height": 720 },
                    { "index": 2, "codec_type": "video", "codec_name": "mjpeg", "width": 320, "height": 180 }
                ],
                "format": { "format_name": "mov,mp4,m4a,3gp,3g2,mj2", "duration": "2.000000" }
            }"#,
        );
        assert_eq!(
            info,
            MediaInfo {
                duration: Duration::from_secs(2),
                height: 720,
            }
        );
    }

    #[test]
    fn test_media_info_without_video() {
        let info = parse(
            r#"{ "streams": [ { "codec_type": "audio" } ], "format": { "duration": "N/A" } }"#,
        );
        assert_eq!(info.height, 0);
        assert_eq!(info.duration, Duration::ZERO);
    }

    #[test]
    fn test_media_info_empty_document() {
        assert_eq!(
            parse("{}"),
            MediaInfo {
                duration: Duration::ZERO,
                height: 0
            }
        );
    }

    #[tokio::test]
    async fn test_probe_missing_binary_is_probe_error() {
        let ffmpeg = Ffmpeg::unchecked(
            PathBuf::from("/nonexistent/ffmpeg"),
            PathBuf::from("/nonexistent/ffprobe"),
        );
        let result = ffmpeg.probe(Path::new("/tmp/whatever.mp4"), 2).await;
        assert!(matches!(result, Err(PipelineError::Probe(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_probe_rejection_is_not_retried() {
        let dir = tempfile::tempdir().expect("tempdir");
        let counter = dir.path().join("calls");
        let script = dir.path().join("ffprobe");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\necho x >> '{}'\necho 'Invalid data found when processing input' >&2\nexit 1\n",
                counter.display()
            ),
        )
        .expect("write script");
        make_executable(&script);

        let ffmpeg = Ffmpeg::unchecked(PathBuf::from("ffmpeg"), script);
        let result = ffmpeg.probe(Path::new("/tmp/corrupt.mp4"), 3).await;

        let reason = match result {
            Err(PipelineError::Probe(reason)) => reason,
            other => panic!("expected probe error, got {other:?}"),
        };
        assert!(reason.contains("Invalid data"));
        let calls = std::fs::read_to_string(counter).expect("counter");
        assert_eq!(calls.lines().count(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_probe_parses_script_output() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = dir.path().join("ffprobe");
        std::fs::write(
            &script,
            "#!/bin/sh\necho '{\"streams\":[{\"codec_type\":\"video\",\"height\":1080}],\"format\":{\"duration\":\"12.5\"}}'\n",
        )
        .expect("write script");
        make_executable(&script);

        let ffmpeg = Ffmpeg::unchecked(PathBuf::from("ffmpeg"), script);
        let info = ffmpeg
            .probe(Path::new("/tmp/any.mp4"), 1)
            .await
            .expect("probe");
        assert_eq!(info.height, 1080);
        assert_eq!(info.duration, Duration::from_millis(12_500));
    }

    #[cfg(unix)]
    fn make_executable(path: &Path) {
        use std::os::unix::fs::PermissionsExt;

        let mut perms = std::fs::metadata(path).expect("metadata").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(path, perms).expect("chmod");
    }
}
