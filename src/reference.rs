use std::time::Duration;

use image::RgbImage;
use nalgebra::{Matrix3, Point3};

use crate::error::Result;
use crate::geometry::{fit_line_3d, plane_through_line_and_point, PlaneEquation};
use crate::stripe::{extract_full_frame, stripe_pixels};
use crate::triangulate::backproject;

/// Outcome of feeding one frame to a reference detector
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReferenceStatus {
    /// Still collecting; `progress` in `[0, 1]`
    Pending { progress: f64 },
    Established(PlaneEquation),
}

/// What a detector sees for one rectified frame.
///
/// Frames are in camera orientation; display mirroring is never applied here.
pub struct ReferenceInput<'a> {
    pub frame: &'a RgbImage,
    /// Stripe-free frame captured when the session started
    pub background: Option<&'a RgbImage>,
    pub elapsed: Duration,
    /// Camera matrix of the rectified image
    pub camera_matrix: &'a Matrix3<f64>,
}

/// Strategy that decides when and where the laser reference plane is known.
pub trait ReferenceDetector: Send {
    fn observe(&mut self, input: &ReferenceInput<'_>) -> Result<ReferenceStatus>;

    fn name(&self) -> &'static str;
}

/// Publishes a fixed plane once a warm-up interval has elapsed.
///
/// Stand-in for installations without a reference target in view.
pub struct WarmupReference {
    interval: Duration,
    plane: PlaneEquation,
}

impl WarmupReference {
    pub fn new(interval: Duration, plane: PlaneEquation) -> Self {
        Self { interval, plane }
    }
}

impl ReferenceDetector for WarmupReference {
    fn observe(&mut self, input: &ReferenceInput<'_>) -> Result<ReferenceStatus> {
        if input.elapsed >= self.interval {
            return Ok(ReferenceStatus::Established(self.plane));
        }
        let progress = input.elapsed.as_secs_f64() / self.interval.as_secs_f64();
        Ok(ReferenceStatus::Pending {
            progress: progress.clamp(0.0, 1.0),
        })
    }

    fn name(&self) -> &'static str {
        "warmup"
    }
}

/// Derives the laser plane from the stripe it draws on a known surface.
///
/// Stripe pixels are backprojected onto `surface` (e.g. the calibration board
/// in camera coordinates), a 3D line is fitted through them, and the laser
/// plane is the plane through that line and the laser `emitter`.
pub struct StripeReference {
    surface: PlaneEquation,
    emitter: Point3<f64>,
    min_pixels: usize,
}

impl StripeReference {
    pub fn new(surface: PlaneEquation, emitter: Point3<f64>, min_pixels: usize) -> Self {
        Self {
            surface,
            emitter,
            min_pixels: min_pixels.max(crate::config::MIN_FIT_POINTS),
        }
    }
}

impl ReferenceDetector for StripeReference {
    fn observe(&mut self, input: &ReferenceInput<'_>) -> Result<ReferenceStatus> {
        let Some(background) = input.background else {
            return Ok(ReferenceStatus::Pending { progress: 0.0 });
        };

        let mask = extract_full_frame(background, input.frame)?;
        let pixels = stripe_pixels(&mask);
        if pixels.len() < self.min_pixels {
            log::trace!(
                "Stripe reference: {} pixels, waiting for {}",
                pixels.len(),
                self.min_pixels
            );
            return Ok(ReferenceStatus::Pending { progress: 0.5 });
        }

        let on_surface = backproject(&pixels, &self.surface, input.camera_matrix)?;
        let (direction, centroid) = fit_line_3d(&on_surface)?;
        let plane = plane_through_line_and_point(&direction, &centroid, &self.emitter)?;

        log::info!(
            "Laser plane from {} stripe pixels: [{:.4}, {:.4}, {:.4}, {:.4}]",
            pixels.len(),
            plane.a,
            plane.b,
            plane.c,
            plane.d
        );
        Ok(ReferenceStatus::Established(plane))
    }

    fn name(&self) -> &'static str {
        "stripe"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use image::Rgb;
    use nalgebra::Vector3;

    fn camera() -> Matrix3<f64> {
        Matrix3::new(300.0, 0.0, 160.0, 0.0, 300.0, 120.0, 0.0, 0.0, 1.0)
    }

    #[test]
    fn test_warmup_reports_progress_then_plane() {
        let plane = PlaneEquation::new(1.0, 1.0, 2.1, -1.0).unwrap();
        let mut detector = WarmupReference::new(Duration::from_secs(10), plane);
        let frame = RgbImage::new(4, 4);
        let k = camera();

        let mut input = ReferenceInput {
            frame: &frame,
            background: None,
            elapsed: Duration::from_secs(5),
            camera_matrix: &k,
        };
        assert_eq!(
            detector.observe(&input).unwrap(),
            ReferenceStatus::Pending { progress: 0.5 }
        );

        input.elapsed = Duration::from_secs(11);
        match detector.observe(&input).unwrap() {
            ReferenceStatus::Established(p) => assert_relative_eq!(p.normal().norm(), 1.0),
            other => panic!("expected plane, got {other:?}"),
        }
    }

    #[test]
    fn test_stripe_reference_recovers_laser_plane() {
        // board at z = 500, laser plane x + 0.2 z - 100 = 0 through emitter (100, 0, 0)
        // meets the board along x = 0, i.e. image column 160
        let surface = PlaneEquation::new(0.0, 0.0, 1.0, -500.0).unwrap();
        let emitter = Point3::new(100.0, 0.0, 0.0);
        let mut detector = StripeReference::new(surface, emitter, 50);

        let background = RgbImage::from_pixel(320, 240, Rgb([15, 15, 15]));
        let mut frame = background.clone();
        for y in 20..220 {
            for x in 159..=161 {
                frame.put_pixel(x, y, Rgb([255, 40, 40]));
            }
        }

        let k = camera();
        let input = ReferenceInput {
            frame: &frame,
            background: Some(&background),
            elapsed: Duration::from_millis(100),
            camera_matrix: &k,
        };
        let plane = match detector.observe(&input).unwrap() {
            ReferenceStatus::Established(p) => p,
            other => panic!("expected plane, got {other:?}"),
        };

        let expected = Vector3::new(1.0, 0.0, 0.2).normalize();
        assert_relative_eq!(plane.normal().dot(&expected).abs(), 1.0, epsilon = 1e-3);
        assert_relative_eq!(plane.signed_distance(&emitter), 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_stripe_reference_waits_without_stripe() {
        let surface = PlaneEquation::new(0.0, 0.0, 1.0, -500.0).unwrap();
        let mut detector = StripeReference::new(surface, Point3::new(100.0, 0.0, 0.0), 50);
        let background = RgbImage::from_pixel(64, 48, Rgb([15, 15, 15]));
        let k = camera();
        let input = ReferenceInput {
            frame: &background,
            background: Some(&background),
            elapsed: Duration::ZERO,
            camera_matrix: &k,
        };
        assert_eq!(
            detector.observe(&input).unwrap(),
            ReferenceStatus::Pending { progress: 0.5 }
        );
    }
}
