use image::GrayImage;
use nalgebra::{Matrix2, Matrix3, Point2, Point3, SymmetricEigen, Unit, Vector2, Vector3};

use crate::config::MIN_FIT_POINTS;
use crate::error::{Result, ScanError};
use crate::stripe::stripe_pixels;

/// Plane `a*x + b*y + c*z + d = 0` with a unit normal `(a, b, c)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaneEquation {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
}

impl PlaneEquation {
    /// Build a plane from raw coefficients, scaling all four terms so the
    /// normal has unit length
    pub fn new(a: f64, b: f64, c: f64, d: f64) -> Result<Self> {
        let norm = Vector3::new(a, b, c).norm();
        if norm == 0.0 || !norm.is_finite() || !d.is_finite() {
            return Err(ScanError::ZeroNormal);
        }
        Ok(Self {
            a: a / norm,
            b: b / norm,
            c: c / norm,
            d: d / norm,
        })
    }

    pub fn normal(&self) -> Vector3<f64> {
        Vector3::new(self.a, self.b, self.c)
    }

    pub fn signed_distance(&self, p: &Point3<f64>) -> f64 {
        self.normal().dot(&p.coords) + self.d
    }

    pub fn coefficients(&self) -> [f64; 4] {
        [self.a, self.b, self.c, self.d]
    }
}

/// Principal axis of a 3D point set.
///
/// Returns the unit direction of largest variance and the centroid. The sign
/// of the direction is arbitrary.
pub fn fit_line_3d(points: &[Point3<f64>]) -> Result<(Unit<Vector3<f64>>, Point3<f64>)> {
    if points.len() < MIN_FIT_POINTS {
        return Err(ScanError::InsufficientPoints {
            found: points.len(),
        });
    }

    let n = points.len() as f64;
    let centroid = Point3::from(points.iter().map(|p| p.coords).sum::<Vector3<f64>>() / n);

    let mut cov = Matrix3::zeros();
    for p in points {
        let d = p - centroid;
        cov += d * d.transpose();
    }
    cov /= n - 1.0;

    let eig = SymmetricEigen::new(cov);
    let axis: Vector3<f64> = eig.eigenvectors.column(eig.eigenvalues.imax()).into_owned();
    let direction = Unit::try_new(axis, f64::EPSILON)
        .ok_or_else(|| ScanError::DegenerateGeometry("zero principal axis".into()))?;

    Ok((direction, centroid))
}

/// Principal axis of a 2D point set.
pub fn fit_line_2d(points: &[Point2<f64>]) -> Result<(Unit<Vector2<f64>>, Point2<f64>)> {
    if points.len() < MIN_FIT_POINTS {
        return Err(ScanError::InsufficientPoints {
            found: points.len(),
        });
    }

    let n = points.len() as f64;
    let centroid = Point2::from(points.iter().map(|p| p.coords).sum::<Vector2<f64>>() / n);

    let mut cov = Matrix2::zeros();
    for p in points {
        let d = p - centroid;
        cov += d * d.transpose();
    }
    cov /= n - 1.0;

    let eig = SymmetricEigen::new(cov);
    let axis: Vector2<f64> = eig.eigenvectors.column(eig.eigenvalues.imax()).into_owned();
    let direction = Unit::try_new(axis, f64::EPSILON)
        .ok_or_else(|| ScanError::DegenerateGeometry("zero principal axis".into()))?;

    Ok((direction, centroid))
}

/// Fit a line through the non-zero pixels of a stripe skeleton.
pub fn fit_line_2d_from_skeleton(mask: &GrayImage) -> Result<(Unit<Vector2<f64>>, Point2<f64>)> {
    fit_line_2d(&stripe_pixels(mask))
}

/// Plane through `point` with normal `normal`.
pub fn plane_from_normal_and_point(
    normal: &Vector3<f64>,
    point: &Point3<f64>,
) -> Result<PlaneEquation> {
    let norm = normal.norm();
    if norm == 0.0 || !norm.is_finite() {
        return Err(ScanError::ZeroNormal);
    }
    let n = normal / norm;
    let d = -n.dot(&point.coords);
    Ok(PlaneEquation {
        a: n.x,
        b: n.y,
        c: n.z,
        d,
    })
}

/// Slice-based variant for callers holding untyped buffers.
pub fn plane_from_slices(normal: &[f64], point: &[f64]) -> Result<PlaneEquation> {
    if normal.len() != 3 || point.len() != 3 {
        return Err(ScanError::DegenerateGeometry(format!(
            "normal and point must have 3 components, got {} and {}",
            normal.len(),
            point.len()
        )));
    }
    plane_from_normal_and_point(
        &Vector3::from_column_slice(normal),
        &Point3::new(point[0], point[1], point[2]),
    )
}

/// Plane containing the line `(direction, on_line)` and the point `point`.
pub fn plane_through_line_and_point(
    direction: &Vector3<f64>,
    on_line: &Point3<f64>,
    point: &Point3<f64>,
) -> Result<PlaneEquation> {
    let normal = direction.cross(&(point - on_line));
    if normal.norm() <= 1e-12 * direction.norm().max(1.0) {
        return Err(ScanError::DegenerateGeometry(
            "point lies on the line".into(),
        ));
    }
    plane_from_normal_and_point(&normal, on_line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use image::Luma;

    fn same_direction_up_to_sign(a: &Vector3<f64>, b: &Vector3<f64>) -> bool {
        (a.dot(b).abs() - 1.0).abs() < 1e-9
    }

    #[test]
    fn test_fit_line_3d_recovers_direction() {
        let dir = Vector3::new(1.0, 2.0, -0.5).normalize();
        let points: Vec<_> = (0..20)
            .map(|i| Point3::new(1.0, -2.0, 3.0) + dir * i as f64)
            .collect();
        let (fitted, centroid) = fit_line_3d(&points).unwrap();
        assert!(same_direction_up_to_sign(&fitted, &dir));
        assert_relative_eq!(centroid, Point3::new(1.0, -2.0, 3.0) + dir * 9.5, epsilon = 1e-9);
    }

    #[test]
    fn test_fit_line_3d_translation_invariant() {
        let points: Vec<_> = [(0.0, 0.0, 0.0), (1.0, 0.1, 2.0), (2.0, -0.1, 4.1), (3.0, 0.05, 5.9)]
            .iter()
            .map(|&(x, y, z)| Point3::new(x, y, z))
            .collect();
        let shift = Vector3::new(-50.0, 12.0, 300.0);
        let shifted: Vec<_> = points.iter().map(|p| p + shift).collect();

        let (a, _) = fit_line_3d(&points).unwrap();
        let (b, _) = fit_line_3d(&shifted).unwrap();
        assert!(same_direction_up_to_sign(&a, &b));
    }

    #[test]
    fn test_fit_line_3d_needs_three_points() {
        let points = [Point3::origin(), Point3::new(1.0, 1.0, 1.0)];
        assert!(matches!(
            fit_line_3d(&points),
            Err(ScanError::InsufficientPoints { found: 2 })
        ));
    }

    #[test]
    fn test_skeleton_with_two_pixels_fails() {
        let mut mask = GrayImage::new(10, 10);
        mask.put_pixel(2, 2, Luma([255]));
        mask.put_pixel(3, 3, Luma([255]));
        assert!(matches!(
            fit_line_2d_from_skeleton(&mask),
            Err(ScanError::InsufficientPoints { found: 2 })
        ));
    }

    #[test]
    fn test_skeleton_diagonal() {
        let mut mask = GrayImage::new(20, 20);
        for i in 0..15 {
            mask.put_pixel(i + 2, i + 2, Luma([255]));
        }
        let (dir, centroid) = fit_line_2d_from_skeleton(&mask).unwrap();
        assert_relative_eq!(dir.x.abs(), std::f64::consts::FRAC_1_SQRT_2, epsilon = 1e-9);
        assert_relative_eq!(dir.x * dir.y, 0.5, epsilon = 1e-9);
        assert_relative_eq!(centroid, Point2::new(9.0, 9.0));
    }

    #[test]
    fn test_plane_normal_is_unit() {
        for normal in [
            Vector3::new(0.0, 0.0, 5.0),
            Vector3::new(1e-8, 3e-8, -2e-8),
            Vector3::new(-3.0, 4.0, 12.0),
        ] {
            let point = Point3::new(1.0, 2.0, 3.0);
            let plane = plane_from_normal_and_point(&normal, &point).unwrap();
            assert_relative_eq!(plane.normal().norm(), 1.0, epsilon = 1e-12);
            assert_relative_eq!(plane.signed_distance(&point), 0.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_zero_normal_fails() {
        assert!(matches!(
            plane_from_normal_and_point(&Vector3::zeros(), &Point3::origin()),
            Err(ScanError::ZeroNormal)
        ));
        assert!(matches!(PlaneEquation::new(0.0, 0.0, 0.0, 1.0), Err(ScanError::ZeroNormal)));
    }

    #[test]
    fn test_slices_must_have_three_components() {
        assert!(matches!(
            plane_from_slices(&[0.0, 1.0], &[0.0, 0.0, 0.0]),
            Err(ScanError::DegenerateGeometry(_))
        ));
        let plane = plane_from_slices(&[0.0, 2.0, 0.0], &[0.0, 3.0, 0.0]).unwrap();
        assert_relative_eq!(plane.d, -3.0);
    }

    #[test]
    fn test_plane_through_line_and_point() {
        let plane = plane_through_line_and_point(
            &Vector3::x(),
            &Point3::new(0.0, 0.0, 5.0),
            &Point3::new(0.0, 1.0, 5.0),
        )
        .unwrap();
        assert_relative_eq!(plane.c.abs(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(plane.signed_distance(&Point3::new(7.0, -3.0, 5.0)), 0.0, epsilon = 1e-12);
    }
}
