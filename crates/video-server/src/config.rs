use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Encode policy shared by every rendition of every job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodeSettings {
    #[serde(default = "default_video_encoder")]
    pub video_encoder: String,
    #[serde(default = "default_audio_codec")]
    pub audio_codec: String,
    #[serde(default = "default_audio_sample_rate")]
    pub audio_sample_rate: u32,
    #[serde(default = "default_crf")]
    pub crf: u8,
    #[serde(default = "default_gop_size")]
    pub gop_size: u32,
    #[serde(default = "default_gop_size")]
    pub keyint_min: u32,
    #[serde(default)]
    pub scene_cut_threshold: u32,
    #[serde(default = "default_segment_duration")]
    pub segment_duration: u32,
    #[serde(default = "default_playlist_type")]
    pub playlist_type: String,
}

fn default_video_encoder() -> String {
    "libx264".to_string()
}

fn default_audio_codec() -> String {
    "aac".to_string()
}

fn default_audio_sample_rate() -> u32 {
    48_000
}

fn default_crf() -> u8 {
    19
}

fn default_gop_size() -> u32 {
    60
}

fn default_segment_duration() -> u32 {
    1
}

fn default_playlist_type() -> String {
    "vod".to_string()
}

impl Default for EncodeSettings {
    fn default() -> Self {
        Self {
            video_encoder: default_video_encoder(),
            audio_codec: default_audio_codec(),
            audio_sample_rate: default_audio_sample_rate(),
            crf: default_crf(),
            gop_size: default_gop_size(),
            keyint_min: default_gop_size(),
            scene_cut_threshold: 0,
            segment_duration: default_segment_duration(),
            playlist_type: default_playlist_type(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Root of the `input/<job>` and `output/<job>` trees.
    pub base_dir: PathBuf,
    #[serde(default = "default_ffmpeg_bin")]
    pub ffmpeg_bin: PathBuf,
    #[serde(default = "default_ffprobe_bin")]
    pub ffprobe_bin: PathBuf,
    #[serde(default = "default_encode_timeout_secs")]
    pub encode_timeout_secs: Option<u64>,
    #[serde(default = "default_probe_attempts")]
    pub probe_attempts: u32,
    #[serde(default)]
    pub encode: EncodeSettings,
}

fn default_ffmpeg_bin() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe_bin() -> PathBuf {
    PathBuf::from("ffprobe")
}

fn default_encode_timeout_secs() -> Option<u64> {
    Some(3600)
}

fn default_probe_attempts() -> u32 {
    2
}

impl PipelineConfig {
    pub fn new(base_dir: PathBuf) -> Self {
        Self {
            base_dir,
            ffmpeg_bin: default_ffmpeg_bin(),
            ffprobe_bin: default_ffprobe_bin(),
            encode_timeout_secs: default_encode_timeout_secs(),
            probe_attempts: default_probe_attempts(),
            encode: EncodeSettings::default(),
        }
    }

    pub fn encode_timeout(&self) -> Option<Duration> {
        self.encode_timeout_secs.map(Duration::from_secs)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::new(std::env::temp_dir().join("hlsladder"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: PipelineConfig = serde_json::from_str(
            r#"{ "base_dir": "/srv/hls", "encode_timeout_secs": null, "encode": { "crf": 23 } }"#,
        )
        .expect("config should parse");

        assert_eq!(config.base_dir, PathBuf::from("/srv/hls"));
        assert_eq!(config.ffmpeg_bin, PathBuf::from("ffmpeg"));
        assert_eq!(config.encode_timeout(), None);
        assert_eq!(config.probe_attempts, 2);
        assert_eq!(config.encode.crf, 23);
        assert_eq!(config.encode.keyint_min, 60);
        assert_eq!(config.encode.playlist_type, "vod");
    }

    #[test]
    fn test_default_timeout() {
        let config = PipelineConfig::new(PathBuf::from("/tmp/x"));
        assert_eq!(config.encode_timeout(), Some(Duration::from_secs(3600)));
    }
}
