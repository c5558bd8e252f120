use nalgebra::{Matrix3, Point2, Point3, Rotation3, Vector3};

use crate::config::MIN_FIT_POINTS;
use crate::error::{Result, ScanError};
use crate::geometry::PlaneEquation;

/// Rays closer to parallel than this (relative to fx*fy) are rejected
const PARALLEL_TOLERANCE: f64 = 1e-9;

/// Intersect the camera ray through `pixel` with `plane`.
///
/// Returns `None` when the ray is (nearly) parallel to the plane or the
/// intersection lies behind the camera.
pub fn backproject_point(
    pixel: &Point2<f64>,
    plane: &PlaneEquation,
    camera_matrix: &Matrix3<f64>,
) -> Option<Point3<f64>> {
    let (fx, fy) = (camera_matrix[(0, 0)], camera_matrix[(1, 1)]);
    let (cx, cy) = (camera_matrix[(0, 2)], camera_matrix[(1, 2)]);

    let x = pixel.x - cx;
    let y = pixel.y - cy;
    let denom = plane.a * fy * x + plane.b * fx * y + plane.c * fx * fy;
    if denom.abs() <= PARALLEL_TOLERANCE * (fx * fy).abs() {
        return None;
    }

    let z = -plane.d * fx * fy / denom;
    if !z.is_finite() || z <= 0.0 {
        return None;
    }
    Some(Point3::new(x * z / fx, y * z / fy, z))
}

/// Backproject stripe pixels onto `plane`, dropping unreconstructable ones.
pub fn backproject(
    pixels: &[Point2<f64>],
    plane: &PlaneEquation,
    camera_matrix: &Matrix3<f64>,
) -> Result<Vec<Point3<f64>>> {
    if pixels.len() < MIN_FIT_POINTS {
        return Err(ScanError::InsufficientPoints {
            found: pixels.len(),
        });
    }

    let points: Vec<_> = pixels
        .iter()
        .filter_map(|p| backproject_point(p, plane, camera_matrix))
        .collect();

    let rejected = pixels.len() - points.len();
    if rejected > 0 {
        log::debug!(
            "Backprojection dropped {} of {} pixels (ray parallel to plane or behind camera)",
            rejected,
            pixels.len()
        );
    }
    Ok(points)
}

/// Express camera-frame points in the frame of a marker with pose `(rvec, tvec)`.
pub fn camera_to_board(
    points: &[Point3<f64>],
    rvec: &Vector3<f64>,
    tvec: &Vector3<f64>,
) -> Vec<Point3<f64>> {
    let rotation_t = Rotation3::new(*rvec).inverse();
    points.iter().map(|p| rotation_t * (p - tvec)).collect()
}

/// Project board-frame points into the image with a pinhole camera.
///
/// Points at or behind the camera plane are skipped.
pub fn project_points(
    points: &[Point3<f64>],
    rvec: &Vector3<f64>,
    tvec: &Vector3<f64>,
    camera_matrix: &Matrix3<f64>,
) -> Vec<Point2<f64>> {
    let rotation = Rotation3::new(*rvec);
    points
        .iter()
        .map(|p| rotation * p + tvec)
        .filter(|p| p.z > 0.0)
        .map(|p| {
            let h = camera_matrix * p.coords;
            Point2::new(h.x / h.z, h.y / h.z)
        })
        .collect()
}
