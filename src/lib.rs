pub mod calibration;
pub mod cli;
pub mod config;
pub mod error;
pub mod geometry;
pub mod rectify;
pub mod reference;
pub mod session;
pub mod source;
pub mod stripe;
pub mod triangulate;

pub use calibration::{CalibrationModel, DistortionModel};
pub use cli::Cli;
pub use config::ScanConfig;
pub use error::{Result, ScanError};
pub use geometry::{
    fit_line_2d, fit_line_2d_from_skeleton, fit_line_3d, plane_from_normal_and_point,
    plane_from_slices, plane_through_line_and_point, PlaneEquation,
};
pub use rectify::{apply as rectify, optimal_camera_matrix, precompute, RectificationMap};
pub use reference::{
    ReferenceDetector, ReferenceInput, ReferenceStatus, StripeReference, WarmupReference,
};
pub use session::{
    CancellationToken, DeviceContext, LogStatus, Phase, Resource, ScanRecord, ScanSession,
    SessionHandle, SessionStartError, SessionState, SessionSummary, StatusSink,
};
pub use source::{FrameSource, ImageSequenceSource};
pub use stripe::{
    extract_full_frame, extract_within_roi, roi_mask_from_polygon, stripe_pixels, thin,
    StripeMask,
};
pub use triangulate::{backproject, backproject_point, camera_to_board, project_points};
