use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, ScanError};

/// Width of every rectified frame
pub const TARGET_WIDTH: u32 = 1280;
/// Height of every rectified frame
pub const TARGET_HEIGHT: u32 = 720;

/// Pause between two camera reads
pub const READ_INTERVAL: Duration = Duration::from_millis(10);

/// Time before the warm-up reference publishes its plane
pub const WARMUP_INTERVAL: Duration = Duration::from_secs(10);

/// Fixed difference threshold used inside a region of interest
pub const ROI_THRESHOLD: u8 = 20;

/// Plane published by the warm-up reference (a, b, c, d), before normalization
pub const PLACEHOLDER_PLANE: [f64; 4] = [1.0, 1.0, 2.1, -1.0];

/// Minimum number of stripe pixels for any fit
pub const MIN_FIT_POINTS: usize = 3;

/// Runtime settings of a scanning session.
///
/// Every field has a default, so a config file only needs to name the values
/// it overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Mirror frames horizontally after rectification
    pub mirror: bool,
    /// Milliseconds to wait between reads
    pub read_interval_ms: u64,
    /// Seconds before the warm-up reference publishes its plane
    pub warmup_secs: f64,
    /// Plane published by the warm-up reference
    pub placeholder_plane: [f64; 4],
    /// Threshold for ROI-restricted extraction
    pub roi_threshold: u8,
    /// Capacity of the record channel between worker and consumer
    pub channel_capacity: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            mirror: true,
            read_interval_ms: READ_INTERVAL.as_millis() as u64,
            warmup_secs: WARMUP_INTERVAL.as_secs_f64(),
            placeholder_plane: PLACEHOLDER_PLANE,
            roi_threshold: ROI_THRESHOLD,
            channel_capacity: 4,
        }
    }
}

impl ScanConfig {
    /// Load a config file; missing fields keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| ScanError::InvalidConfig(format!("{:?}: {}", path, e)))
    }

    pub fn read_interval(&self) -> Duration {
        Duration::from_millis(self.read_interval_ms)
    }

    /// Negative values mean no warm-up; NaN, infinite or out-of-range values
    /// fall back to the default.
    pub fn warmup(&self) -> Duration {
        if !self.warmup_secs.is_finite() {
            return WARMUP_INTERVAL;
        }
        Duration::try_from_secs_f64(self.warmup_secs.max(0.0)).unwrap_or(WARMUP_INTERVAL)
    }
}
