//! Parsing of the encoder's machine-readable progress channel.
//!
//! The encoder runs with `-nostats -progress pipe:1`, which writes blocks of `key=value` lines
//! to stdout. Every block ends with `progress=continue` (or `progress=end` for the last one).

use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgressSample {
    pub elapsed: Duration,
    pub total: Duration,
    pub percent: u8,
}

impl ProgressSample {
    pub fn new(elapsed: Duration, total: Duration) -> Self {
        Self {
            elapsed,
            total,
            percent: percent_of(elapsed, total),
        }
    }
}

/// `round(elapsed / total, 2) * 100`, clamped to `0..=100`. A zero total reads as 0%.
pub fn percent_of(elapsed: Duration, total: Duration) -> u8 {
    if total.is_zero() {
        return 0;
    }
    let ratio = elapsed.as_secs_f64() / total.as_secs_f64();
    (ratio * 100.0).round().clamp(0.0, 100.0) as u8
}

#[derive(Debug)]
pub struct ProgressParser {
    total: Duration,
    elapsed: Duration,
    last: Option<ProgressSample>,
}

impl ProgressParser {
    pub fn new(total: Duration) -> Self {
        Self {
            total,
            elapsed: Duration::ZERO,
            last: None,
        }
    }

    /// Feeds one line of progress output.
    ///
    /// Returns a sample at the end of each report block. With an unknown (zero) total nothing
    /// is returned, but the sample is still remembered for [`ProgressParser::last`].
    pub fn feed(&mut self, line: &str) -> Option<ProgressSample> {
        let (key, value) = line.trim().split_once('=')?;
        match key {
            // ffmpeg reports out_time_ms in microseconds too.
            "out_time_us" | "out_time_ms" => {
                if let Ok(micros) = value.trim().parse::<i64>() {
                    self.elapsed = Duration::from_micros(micros.max(0) as u64);
                }
                None
            }
            "progress" => {
                let sample = ProgressSample::new(self.elapsed, self.total);
                self.last = Some(sample);
                if self.total.is_zero() {
                    None
                } else {
                    Some(sample)
                }
            }
            _ => None,
        }
    }

    pub fn last(&self) -> Option<ProgressSample> {
        self.last
    }
}
