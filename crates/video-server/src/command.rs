//! Assembly of the single encoder invocation that writes the whole ladder in one pass.

use std::{
    ffi::{OsStr, OsString},
    fmt,
    path::{Path, PathBuf},
};

use crate::{config::EncodeSettings, ladder::RenditionSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeInvocation {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl EncodeInvocation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(&mut self, arg: impl AsRef<OsStr>) -> &mut Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    /// Number of HLS outputs. Each one carries exactly one `-hls_segment_filename`.
    pub fn output_count(&self) -> usize {
        self.args
            .iter()
            .filter(|a| a.as_os_str() == "-hls_segment_filename")
            .count()
    }
}

impl fmt::Display for EncodeInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            let arg = arg.to_string_lossy();
            if arg.contains(' ') {
                write!(f, " \"{arg}\"")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct EncodeCommandBuilder {
    program: PathBuf,
    settings: EncodeSettings,
}

impl EncodeCommandBuilder {
    pub fn new(program: impl Into<PathBuf>, settings: EncodeSettings) -> Self {
        Self {
            program: program.into(),
            settings,
        }
    }

    /// Pure construction; an empty ladder yields an invocation without outputs.
    pub fn build(
        &self,
        input: &Path,
        output_dir: &Path,
        ladder: &[RenditionSpec],
    ) -> EncodeInvocation {
        let s = &self.settings;
        let mut cmd = EncodeInvocation::new(&self.program);

        cmd.arg("-hide_banner")
            .arg("-nostats")
            .arg("-progress")
            .arg("pipe:1")
            .arg("-y")
            .arg("-i")
            .arg(input);

        for rendition in ladder {
            let name = rendition.name();

            cmd.arg("-map").arg("0:v:0").arg("-map").arg("0:a:0?");

            cmd.arg("-c:a")
                .arg(&s.audio_codec)
                .arg("-ar")
                .arg(s.audio_sample_rate.to_string())
                .arg("-b:a")
                .arg("0k");

            cmd.arg("-c:v")
                .arg(&s.video_encoder)
                .arg("-profile:v")
                .arg(rendition.profile())
                .arg("-level:v")
                .arg(rendition.level())
                .arg("-crf")
                .arg(s.crf.to_string())
                .arg("-vf")
                .arg(format!("scale=w={}:h=-2", rendition.target_width))
                .arg("-b:v")
                .arg(format!("{}k", rendition.video_bitrate))
                .arg("-maxrate")
                .arg(format!("{}k", rendition.max_rate))
                .arg("-bufsize")
                .arg(format!("{}k", rendition.buf_size));

            // Shared keyframe policy keeps segment boundaries aligned across renditions.
            cmd.arg("-sc_threshold")
                .arg(s.scene_cut_threshold.to_string())
                .arg("-g")
                .arg(s.gop_size.to_string())
                .arg("-keyint_min")
                .arg(s.keyint_min.to_string());

            cmd.arg("-f")
                .arg("hls")
                .arg("-hls_time")
                .arg(s.segment_duration.to_string())
                .arg("-hls_playlist_type")
                .arg(&s.playlist_type)
                .arg("-hls_segment_filename")
                .arg(output_dir.join(format!("{name}_%03d.ts")))
                .arg(output_dir.join(format!("{name}.m3u8")));
        }

        cmd
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::ladder::plan;

    fn builder() -> EncodeCommandBuilder {
        EncodeCommandBuilder::new("ffmpeg", EncodeSettings::default())
    }

    fn args(cmd: &EncodeInvocation) -> Vec<String> {
        cmd.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    fn values_of(args: &[String], flag: &str) -> Vec<String> {
        args.windows(2)
            .filter(|w| w[0] == flag)
            .map(|w| w[1].clone())
            .collect()
    }

    #[test]
    fn test_single_input_all_outputs() {
        let cmd = builder().build(
            Path::new("/data/input/abc/clip.mp4"),
            Path::new("/data/output/abc"),
            &plan(720),
        );
        let args = args(&cmd);

        assert_eq!(values_of(&args, "-i"), vec!["/data/input/abc/clip.mp4"]);
        assert_eq!(cmd.output_count(), 5);
        assert!(args.contains(&"-y".to_string()));
        assert_eq!(values_of(&args, "-progress"), vec!["pipe:1"]);
        assert_eq!(
            values_of(&args, "-hls_segment_filename"),
            vec![
                "/data/output/abc/144p_%03d.ts",
                "/data/output/abc/240p_%03d.ts",
                "/data/output/abc/360p_%03d.ts",
                "/data/output/abc/480p_%03d.ts",
                "/data/output/abc/720p_%03d.ts",
            ]
        );
    }

    #[test]
    fn test_rendition_parameters() {
        let cmd = builder().build(Path::new("in.mp4"), Path::new("out"), &plan(1080));
        let args = args(&cmd);

        assert_eq!(
            values_of(&args, "-vf"),
            vec![
                "scale=w=256:h=-2",
                "scale=w=426:h=-2",
                "scale=w=640:h=-2",
                "scale=w=842:h=-2",
                "scale=w=1280:h=-2",
                "scale=w=1920:h=-2",
            ]
        );
        assert_eq!(
            values_of(&args, "-b:v"),
            vec!["200k", "400k", "800k", "1400k", "2800k", "5000k"]
        );
        assert_eq!(values_of(&args, "-maxrate")[5], "5350k");
        assert_eq!(values_of(&args, "-bufsize")[0], "300k");
        assert_eq!(values_of(&args, "-profile:v")[0], "main");
        assert_eq!(values_of(&args, "-profile:v")[5], "high");
    }

    #[test]
    fn test_shared_policy_for_every_rendition() {
        let cmd = builder().build(Path::new("in.mp4"), Path::new("out"), &plan(1080));
        let args = args(&cmd);

        for (flag, value) in [
            ("-g", "60"),
            ("-keyint_min", "60"),
            ("-sc_threshold", "0"),
            ("-hls_time", "1"),
            ("-hls_playlist_type", "vod"),
            ("-c:a", "aac"),
            ("-ar", "48000"),
            ("-b:a", "0k"),
            ("-c:v", "libx264"),
            ("-crf", "19"),
        ] {
            assert_eq!(values_of(&args, flag), vec![value; 6], "{flag}");
        }
    }

    #[test]
    fn test_manifest_follows_its_options() {
        let cmd = builder().build(Path::new("in.mp4"), Path::new("out"), &plan(240));
        let args = args(&cmd);

        let manifests: Vec<usize> = args
            .iter()
            .enumerate()
            .filter(|(_, a)| a.ends_with(".m3u8"))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(manifests.len(), 2);
        assert_eq!(args[manifests[0]], "out/144p.m3u8");
        assert_eq!(args[manifests[1]], "out/240p.m3u8");
        assert_eq!(args[manifests[0] - 1], "out/144p_%03d.ts");
        assert_eq!(args.last(), Some(&"out/240p.m3u8".to_string()));
    }

    #[test]
    fn test_empty_ladder_has_no_outputs() {
        let cmd = builder().build(Path::new("in.mp4"), Path::new("out"), &[]);
        assert_eq!(cmd.output_count(), 0);
        assert_eq!(
            args(&cmd),
            vec!["-hide_banner", "-nostats", "-progress", "pipe:1", "-y", "-i", "in.mp4"]
        );
    }

    #[test]
    fn test_playlist_named_input_is_not_an_output() {
        let cmd = builder().build(Path::new("in/tiny.m3u8"), Path::new("out"), &[]);
        assert_eq!(cmd.output_count(), 0);

        let cmd = builder().build(Path::new("in/tiny.m3u8"), Path::new("out"), &plan(144));
        assert_eq!(cmd.output_count(), 1);
    }

    #[test]
    fn test_display_quotes_spaces() {
        let cmd = builder().build(Path::new("my clip.mp4"), Path::new("out"), &[]);
        assert_eq!(
            cmd.to_string(),
            "ffmpeg -hide_banner -nostats -progress pipe:1 -y -i \"my clip.mp4\""
        );
    }
}
