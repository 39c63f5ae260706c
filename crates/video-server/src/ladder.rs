use serde::Serialize;

/// One quality level of the adaptive-bitrate ladder. Bitrates are in kbit/s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RenditionSpec {
    pub height: u32,
    pub target_width: u32,
    pub video_bitrate: u32,
    pub max_rate: u32,
    pub buf_size: u32,
    pub profile_tier: u8,
}

impl RenditionSpec {
    const fn new(
        height: u32,
        target_width: u32,
        video_bitrate: u32,
        max_rate: u32,
        buf_size: u32,
        profile_tier: u8,
    ) -> Self {
        Self {
            height,
            target_width,
            video_bitrate,
            max_rate,
            buf_size,
            profile_tier,
        }
    }

    /// `"720p"` and friends; the stem of every file this rendition writes.
    pub fn name(&self) -> String {
        format!("{}p", self.height)
    }

    pub fn profile(&self) -> &'static str {
        match self.profile_tier {
            0 | 1 => "main",
            _ => "high",
        }
    }

    pub fn level(&self) -> &'static str {
        match self.profile_tier {
            0 => "3.0",
            1 => "3.1",
            2 => "4.0",
            _ => "4.1",
        }
    }
}

/// Static catalog, ascending by height.
pub const CATALOG: [RenditionSpec; 6] = [
    RenditionSpec::new(144, 256, 200, 214, 300, 0),
    RenditionSpec::new(240, 426, 400, 428, 600, 0),
    RenditionSpec::new(360, 640, 800, 856, 1200, 0),
    RenditionSpec::new(480, 842, 1400, 1498, 2100, 1),
    RenditionSpec::new(720, 1280, 2800, 2996, 4200, 2),
    RenditionSpec::new(1080, 1920, 5000, 5350, 7500, 3),
];

/// Every catalog rendition no taller than the source, lowest first.
///
/// An unknown (0) or sub-144p source yields an empty ladder.
pub fn plan(source_height: u32) -> Vec<RenditionSpec> {
    CATALOG
        .iter()
        .copied()
        .take_while(|spec| spec.height <= source_height)
        .collect()
}
