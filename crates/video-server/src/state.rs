use std::sync::Arc;

use crate::{config::PipelineConfig, ffmpeg::Ffmpeg, transcoder::Transcoder};

#[derive(Clone)]
pub struct VideoServerState {
    pub transcoder: Transcoder,
}

impl VideoServerState {
    pub fn new(config: &PipelineConfig, ffmpeg: Arc<Ffmpeg>) -> Self {
        Self {
            transcoder: Transcoder::new(config, ffmpeg),
        }
    }
}
