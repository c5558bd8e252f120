use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use nalgebra::Matrix3;

use crate::calibration::{CalibrationModel, DistortionModel};
use crate::config::{TARGET_HEIGHT, TARGET_WIDTH};
use crate::error::{Result, ScanError};

/// Grid size used to sample the valid region of the undistorted image
const OPTIMAL_GRID: usize = 9;

/// Precomputed undistortion tables for one calibration.
///
/// `map_x[i]`/`map_y[i]` hold the source location (in the resized raw frame)
/// sampled for output pixel `i` in row-major order.
#[derive(Debug, Clone)]
pub struct RectificationMap {
    width: u32,
    height: u32,
    map_x: Vec<f32>,
    map_y: Vec<f32>,
    optimized_camera_matrix: Matrix3<f64>,
    optimized_dist_coeffs: Vec<f64>,
}

impl RectificationMap {
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Camera matrix of the rectified image
    pub fn optimized_camera_matrix(&self) -> &Matrix3<f64> {
        &self.optimized_camera_matrix
    }

    /// Distortion of the rectified image; always zero
    pub fn optimized_dist_coeffs(&self) -> &[f64] {
        &self.optimized_dist_coeffs
    }

    /// Source coordinate sampled for output pixel `(x, y)`
    pub fn lookup(&self, x: u32, y: u32) -> Option<(f32, f32)> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = (y * self.width + x) as usize;
        Some((self.map_x[idx], self.map_y[idx]))
    }
}

/// Scale the intrinsics from the calibration resolution to the target frame
fn scale_camera_matrix(k: &Matrix3<f64>, source: (u32, u32)) -> Matrix3<f64> {
    let sx = TARGET_WIDTH as f64 / source.0 as f64;
    let sy = TARGET_HEIGHT as f64 / source.1 as f64;

    let mut scaled = *k;
    for c in 0..3 {
        scaled[(0, c)] *= sx;
        scaled[(1, c)] *= sy;
    }
    scaled
}

/// Camera matrix for the undistorted image at alpha = 0.
///
/// A grid of pixels is undistorted; the rectangle bounded by the innermost
/// samples of each border is stretched over the whole output so that every
/// output pixel comes from a valid source pixel.
pub fn optimal_camera_matrix(
    k: &Matrix3<f64>,
    distortion: &DistortionModel,
    size: (u32, u32),
) -> Result<Matrix3<f64>> {
    let (width, height) = (size.0 as f64, size.1 as f64);
    let (fx, fy, cx, cy, skew) = (k[(0, 0)], k[(1, 1)], k[(0, 2)], k[(1, 2)], k[(0, 1)]);

    let mut inner_x0 = f64::NEG_INFINITY;
    let mut inner_x1 = f64::INFINITY;
    let mut inner_y0 = f64::NEG_INFINITY;
    let mut inner_y1 = f64::INFINITY;

    let last = (OPTIMAL_GRID - 1) as f64;
    for gy in 0..OPTIMAL_GRID {
        for gx in 0..OPTIMAL_GRID {
            let u = gx as f64 * (width - 1.0) / last;
            let v = gy as f64 * (height - 1.0) / last;

            let yd = (v - cy) / fy;
            let xd = (u - cx - skew * yd) / fx;
            let (x, y) = distortion.undistort(xd, yd);

            if gx == 0 {
                inner_x0 = inner_x0.max(x);
            }
            if gx == OPTIMAL_GRID - 1 {
                inner_x1 = inner_x1.min(x);
            }
            if gy == 0 {
                inner_y0 = inner_y0.max(y);
            }
            if gy == OPTIMAL_GRID - 1 {
                inner_y1 = inner_y1.min(y);
            }
        }
    }

    let inner_w = inner_x1 - inner_x0;
    let inner_h = inner_y1 - inner_y0;
    if !(inner_w > 0.0 && inner_h > 0.0) || !inner_w.is_finite() || !inner_h.is_finite() {
        return Err(ScanError::InvalidCalibration(format!(
            "no valid undistorted region ({:.4} x {:.4})",
            inner_w, inner_h
        )));
    }

    let new_fx = (width - 1.0) / inner_w;
    let new_fy = (height - 1.0) / inner_h;
    Ok(Matrix3::new(
        new_fx,
        0.0,
        -new_fx * inner_x0,
        0.0,
        new_fy,
        -new_fy * inner_y0,
        0.0,
        0.0,
        1.0,
    ))
}

/// Build the rectification tables for frames captured at `source` resolution.
pub fn precompute(calib: &CalibrationModel, source: (u32, u32)) -> Result<RectificationMap> {
    if source.0 == 0 || source.1 == 0 {
        return Err(ScanError::InvalidCalibration(format!(
            "source resolution {}x{} has zero area",
            source.0, source.1
        )));
    }

    let k = scale_camera_matrix(calib.camera_matrix(), source);
    let distortion = calib.distortion();
    let size = (TARGET_WIDTH, TARGET_HEIGHT);
    let k_opt = optimal_camera_matrix(&k, &distortion, size)?;

    let (opt_fx, opt_fy, opt_cx, opt_cy) =
        (k_opt[(0, 0)], k_opt[(1, 1)], k_opt[(0, 2)], k_opt[(1, 2)]);

    let pixel_count = (size.0 * size.1) as usize;
    let mut map_x = Vec::with_capacity(pixel_count);
    let mut map_y = Vec::with_capacity(pixel_count);

    for v in 0..size.1 {
        let y = (v as f64 - opt_cy) / opt_fy;
        for u in 0..size.0 {
            let x = (u as f64 - opt_cx) / opt_fx;
            let (xd, yd) = distortion.distort(x, y);
            map_x.push((k[(0, 0)] * xd + k[(0, 1)] * yd + k[(0, 2)]) as f32);
            map_y.push((k[(1, 1)] * yd + k[(1, 2)]) as f32);
        }
    }

    log::debug!(
        "Rectification map {}x{} from source {}x{} (fx {:.2} -> {:.2})",
        size.0,
        size.1,
        source.0,
        source.1,
        k[(0, 0)],
        opt_fx
    );

    Ok(RectificationMap {
        width: size.0,
        height: size.1,
        map_x,
        map_y,
        optimized_camera_matrix: k_opt,
        optimized_dist_coeffs: vec![0.0; calib.dist_coeffs().len()],
    })
}

/// Bilinear sample with a black border outside the frame
fn bilinear_sample(img: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (width, height) = (img.width() as i64, img.height() as i64);
    let x0 = x.floor() as i64;
    let y0 = y.floor() as i64;
    let x_frac = x - x.floor();
    let y_frac = y - y.floor();

    let get_pixel = |px: i64, py: i64| -> [f32; 3] {
        if px < 0 || py < 0 || px >= width || py >= height {
            return [0.0; 3];
        }
        let p = img.get_pixel(px as u32, py as u32);
        [p[0] as f32, p[1] as f32, p[2] as f32]
    };

    let p00 = get_pixel(x0, y0);
    let p10 = get_pixel(x0 + 1, y0);
    let p01 = get_pixel(x0, y0 + 1);
    let p11 = get_pixel(x0 + 1, y0 + 1);

    let mut result = [0u8; 3];
    for c in 0..3 {
        let top = p00[c] * (1.0 - x_frac) + p10[c] * x_frac;
        let bottom = p01[c] * (1.0 - x_frac) + p11[c] * x_frac;
        result[c] = (top * (1.0 - y_frac) + bottom * y_frac)
            .round()
            .clamp(0.0, 255.0) as u8;
    }
    Rgb(result)
}

/// Resize a raw frame to the target resolution and undistort it.
pub fn apply(map: &RectificationMap, frame: &RgbImage) -> Result<RgbImage> {
    if frame.width() == 0 || frame.height() == 0 {
        return Err(ScanError::EmptyFrame);
    }

    let resized;
    let src = if frame.dimensions() == (map.width, map.height) {
        frame
    } else {
        resized = imageops::resize(frame, map.width, map.height, FilterType::Triangle);
        &resized
    };

    let mut output = RgbImage::new(map.width, map.height);
    for (out_x, out_y, pixel) in output.enumerate_pixels_mut() {
        let idx = (out_y * map.width + out_x) as usize;
        *pixel = bilinear_sample(src, map.map_x[idx], map.map_y[idx]);
    }

    Ok(output)
}
