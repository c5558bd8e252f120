use std::path::PathBuf;

/// Errors produced by the scanning pipeline.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    /// The calibration artifact is missing a field or a field is malformed.
    #[error("invalid calibration file {path:?}: {reason}")]
    InvalidCalibrationFile { path: PathBuf, reason: String },

    /// The calibration values cannot be used for rectification.
    #[error("invalid calibration: {0}")]
    InvalidCalibration(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Camera source or calibration absent when a session starts.
    #[error("device not ready: {0}")]
    DeviceNotReady(String),

    /// The frame source stopped returning frames.
    #[error("failed to read frame: {0}")]
    FrameReadError(String),

    #[error("insufficient points for fit: found {found}, need at least 3")]
    InsufficientPoints { found: usize },

    #[error("plane normal has zero magnitude")]
    ZeroNormal,

    #[error("degenerate geometry: {0}")]
    DegenerateGeometry(String),

    #[error("cannot rectify an empty frame")]
    EmptyFrame,

    #[error("scan worker panicked")]
    WorkerPanicked,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),
}

impl ScanError {
    /// Per-frame failures that skip reconstruction for one frame but keep the
    /// session streaming.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ScanError::InsufficientPoints { .. }
                | ScanError::ZeroNormal
                | ScanError::DegenerateGeometry(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ScanError>;
