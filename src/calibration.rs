use std::path::{Path, PathBuf};

use nalgebra::Matrix3;
use serde::Deserialize;

use crate::error::{Result, ScanError};

/// Distortion vector lengths understood by the rectification model
const SUPPORTED_DISTORTION_LENGTHS: [usize; 3] = [4, 5, 8];

/// Brown–Conrady distortion with the rational radial extension.
///
/// Coefficients follow the usual `k1 k2 p1 p2 k3 k4 k5 k6` ordering; missing
/// trailing terms are zero.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DistortionModel {
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    pub k3: f64,
    pub k4: f64,
    pub k5: f64,
    pub k6: f64,
}

impl DistortionModel {
    pub fn from_coefficients(coeffs: &[f64]) -> Self {
        let at = |i: usize| coeffs.get(i).copied().unwrap_or(0.0);
        Self {
            k1: at(0),
            k2: at(1),
            p1: at(2),
            p2: at(3),
            k3: at(4),
            k4: at(5),
            k5: at(6),
            k6: at(7),
        }
    }

    /// Apply the distortion to a normalized image coordinate.
    pub fn distort(&self, x: f64, y: f64) -> (f64, f64) {
        let r2 = x * x + y * y;
        let r4 = r2 * r2;
        let r6 = r4 * r2;

        let radial = (1.0 + self.k1 * r2 + self.k2 * r4 + self.k3 * r6)
            / (1.0 + self.k4 * r2 + self.k5 * r4 + self.k6 * r6);

        let xd = x * radial + 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
        let yd = y * radial + self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
        (xd, yd)
    }

    /// Invert the distortion of a normalized coordinate by fixed-point iteration.
    pub fn undistort(&self, xd: f64, yd: f64) -> (f64, f64) {
        let (mut x, mut y) = (xd, yd);
        for _ in 0..20 {
            let r2 = x * x + y * y;
            let r4 = r2 * r2;
            let r6 = r4 * r2;

            let radial = (1.0 + self.k1 * r2 + self.k2 * r4 + self.k3 * r6)
                / (1.0 + self.k4 * r2 + self.k5 * r4 + self.k6 * r6);
            let dx = 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
            let dy = self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;

            x = (xd - dx) / radial;
            y = (yd - dy) / radial;
        }
        (x, y)
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::default()
    }
}

/// Intrinsic camera matrix and distortion coefficients of one camera.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationModel {
    camera_matrix: Matrix3<f64>,
    dist_coeffs: Vec<f64>,
    source: Option<PathBuf>,
}

/// `dist_coeffs` is stored either flat or as a single-row matrix.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Coefficients {
    Flat(Vec<f64>),
    Nested(Vec<Vec<f64>>),
}

impl Coefficients {
    fn flatten(self) -> Vec<f64> {
        match self {
            Coefficients::Flat(v) => v,
            Coefficients::Nested(rows) => rows.into_iter().flatten().collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CalibrationFile {
    camera_matrix: Option<Vec<Vec<f64>>>,
    dist_coeffs: Option<Coefficients>,
}

impl CalibrationModel {
    /// Build a model from values already in memory.
    pub fn new(camera_matrix: Matrix3<f64>, dist_coeffs: Vec<f64>) -> Result<Self> {
        if camera_matrix.iter().any(|v| !v.is_finite()) {
            return Err(ScanError::InvalidCalibration(
                "camera matrix contains non-finite values".into(),
            ));
        }
        if camera_matrix[(0, 0)] <= 0.0 || camera_matrix[(1, 1)] <= 0.0 {
            return Err(ScanError::InvalidCalibration(format!(
                "focal lengths must be positive (fx={}, fy={})",
                camera_matrix[(0, 0)],
                camera_matrix[(1, 1)]
            )));
        }
        if !SUPPORTED_DISTORTION_LENGTHS.contains(&dist_coeffs.len()) {
            return Err(ScanError::InvalidCalibration(format!(
                "expected 4, 5 or 8 distortion coefficients, got {}",
                dist_coeffs.len()
            )));
        }
        if dist_coeffs.iter().any(|v| !v.is_finite()) {
            return Err(ScanError::InvalidCalibration(
                "distortion coefficients contain non-finite values".into(),
            ));
        }

        Ok(Self {
            camera_matrix,
            dist_coeffs,
            source: None,
        })
    }

    /// Load a calibration artifact holding `camera_matrix` and `dist_coeffs`.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| invalid_file(path, e))?;
        let mut model = Self::parse(&text).map_err(|reason| invalid_file(path, reason))?;
        model.source = Some(path.to_path_buf());
        log::info!(
            "Loaded calibration {:?} (fx={:.2}, fy={:.2}, {} distortion terms)",
            path,
            model.camera_matrix[(0, 0)],
            model.camera_matrix[(1, 1)],
            model.dist_coeffs.len()
        );
        Ok(model)
    }

    /// Parse an in-memory JSON artifact.
    pub fn from_json_str(text: &str) -> Result<Self> {
        Self::parse(text).map_err(|reason| invalid_file(Path::new("<memory>"), reason))
    }

    /// Replace both fields from a new artifact. On failure `self` is untouched.
    pub fn reload(&mut self, path: &Path) -> Result<()> {
        let fresh = Self::load(path)?;
        *self = fresh;
        Ok(())
    }

    fn parse(text: &str) -> std::result::Result<Self, String> {
        let file: CalibrationFile = serde_json::from_str(text).map_err(|e| e.to_string())?;

        let rows = file
            .camera_matrix
            .ok_or_else(|| "missing field `camera_matrix`".to_string())?;
        let coeffs = file
            .dist_coeffs
            .ok_or_else(|| "missing field `dist_coeffs`".to_string())?
            .flatten();

        if rows.len() != 3 || rows.iter().any(|r| r.len() != 3) {
            return Err(format!(
                "`camera_matrix` must be 3x3, got {} rows",
                rows.len()
            ));
        }
        let camera_matrix = Matrix3::from_fn(|r, c| rows[r][c]);

        Self::new(camera_matrix, coeffs).map_err(|e| e.to_string())
    }

    pub fn camera_matrix(&self) -> &Matrix3<f64> {
        &self.camera_matrix
    }

    pub fn dist_coeffs(&self) -> &[f64] {
        &self.dist_coeffs
    }

    pub fn distortion(&self) -> DistortionModel {
        DistortionModel::from_coefficients(&self.dist_coeffs)
    }

    /// Path of the artifact this model came from, if any
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }
}

fn invalid_file(path: &Path, reason: impl ToString) -> ScanError {
    ScanError::InvalidCalibrationFile {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::io::Write;

    const VALID: &str = r#"{
        "camera_matrix": [[900.0, 0.0, 640.0], [0.0, 910.0, 360.0], [0.0, 0.0, 1.0]],
        "dist_coeffs": [[-0.12, 0.05, 0.001, -0.0005, 0.0]]
    }"#;

    fn write_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_flattens_nested_coefficients() {
        let file = write_file(VALID);
        let model = CalibrationModel::load(file.path()).unwrap();
        assert_eq!(model.dist_coeffs().len(), 5);
        assert_relative_eq!(model.camera_matrix()[(1, 1)], 910.0);
        assert_relative_eq!(model.distortion().k1, -0.12);
        assert_eq!(model.source(), Some(file.path()));
    }

    #[test]
    fn test_missing_field_fails() {
        let file = write_file(r#"{ "camera_matrix": [[1,0,0],[0,1,0],[0,0,1]] }"#);
        let err = CalibrationModel::load(file.path()).unwrap_err();
        match err {
            ScanError::InvalidCalibrationFile { reason, .. } => {
                assert!(reason.contains("dist_coeffs"))
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_malformed_matrix_fails() {
        let text = r#"{ "camera_matrix": [[1,0],[0,1]], "dist_coeffs": [0,0,0,0,0] }"#;
        assert!(matches!(
            CalibrationModel::from_json_str(text),
            Err(ScanError::InvalidCalibrationFile { .. })
        ));
    }

    #[test]
    fn test_non_positive_focal_rejected() {
        let text = r#"{ "camera_matrix": [[0,0,5],[0,10,5],[0,0,1]], "dist_coeffs": [0,0,0,0,0] }"#;
        assert!(CalibrationModel::from_json_str(text).is_err());
    }

    #[test]
    fn test_reload_failure_keeps_previous_values() {
        let good = write_file(VALID);
        let bad = write_file(r#"{ "dist_coeffs": [0.3, 0, 0, 0, 0] }"#);

        let mut model = CalibrationModel::load(good.path()).unwrap();
        let before = model.clone();
        assert!(model.reload(bad.path()).is_err());
        assert_eq!(model, before);
    }

    #[test]
    fn test_undistort_inverts_distort() {
        let model = DistortionModel::from_coefficients(&[-0.2, 0.05, 0.001, -0.002, 0.01]);
        let (xd, yd) = model.distort(0.3, -0.2);
        let (x, y) = model.undistort(xd, yd);
        assert_relative_eq!(x, 0.3, epsilon = 1e-9);
        assert_relative_eq!(y, -0.2, epsilon = 1e-9);
    }
}
