use image::{GrayImage, Luma, RgbImage};
use imageproc::contrast::{otsu_level, threshold, ThresholdType};
use imageproc::drawing::draw_polygon_mut;
use imageproc::map::map_colors2;
use imageproc::morphology::{grayscale_dilate, grayscale_erode, Mask};
use imageproc::point::Point;
use nalgebra::Point2;

use crate::config::MIN_FIT_POINTS;
use crate::error::{Result, ScanError};

/// Side of the square structuring element
const MORPH_SIZE: u32 = 2;

/// Binary stripe image: 255 on stripe pixels, 0 elsewhere
pub type StripeMask = GrayImage;

fn ensure_same_size(a: (u32, u32), b: (u32, u32), what: &str) -> Result<()> {
    if a != b {
        return Err(ScanError::DegenerateGeometry(format!(
            "{} size mismatch: {}x{} vs {}x{}",
            what, a.0, a.1, b.0, b.1
        )));
    }
    Ok(())
}

/// The 2x2 element anchored at its bottom-right corner, and its reflection.
///
/// Each opening and closing pairs one with the other, so the result is not
/// shifted by a pixel the way an even-sized element applied twice would be.
fn structuring_elements() -> (Mask, Mask) {
    let square = GrayImage::from_pixel(MORPH_SIZE, MORPH_SIZE, Luma([255]));
    let anchor = (MORPH_SIZE - 1) as u8;
    (
        Mask::from_image(&square, anchor, anchor),
        Mask::from_image(&square, 0, 0),
    )
}

fn close_mask(mask: &GrayImage, element: &Mask, reflected: &Mask) -> GrayImage {
    grayscale_erode(&grayscale_dilate(mask, element), reflected)
}

fn open_mask(mask: &GrayImage, element: &Mask, reflected: &Mask) -> GrayImage {
    grayscale_dilate(&grayscale_erode(mask, element), reflected)
}

/// Grayscale of the per-channel absolute difference
fn difference_intensity(background: &RgbImage, foreground: &RgbImage) -> GrayImage {
    let diff: RgbImage = map_colors2(background, foreground, |bg, fg| {
        image::Rgb([
            bg[0].abs_diff(fg[0]),
            bg[1].abs_diff(fg[1]),
            bg[2].abs_diff(fg[2]),
        ])
    });
    image::imageops::grayscale(&diff)
}

/// Extract a one-pixel stripe skeleton from a background/foreground pair.
///
/// The difference image is binarised with Otsu's level, closed then opened
/// with a 2x2 square and thinned. Opening erases one-pixel lines; when it
/// leaves nothing usable the closed mask is thinned instead.
pub fn extract_full_frame(background: &RgbImage, foreground: &RgbImage) -> Result<StripeMask> {
    ensure_same_size(background.dimensions(), foreground.dimensions(), "background/foreground")?;

    let gray = difference_intensity(background, foreground);
    let level = otsu_level(&gray);
    let binary = threshold(&gray, level, ThresholdType::Binary);

    let (element, reflected) = structuring_elements();
    let closed = close_mask(&binary, &element, &reflected);
    let opened = open_mask(&closed, &element, &reflected);

    let cleaned = if count_nonzero(&opened) < MIN_FIT_POINTS
        && count_nonzero(&closed) >= MIN_FIT_POINTS
    {
        log::debug!("Opening removed the stripe, keeping closed mask");
        closed
    } else {
        opened
    };

    let skeleton = thin(&cleaned);
    log::trace!(
        "Stripe extraction: otsu level {}, {} skeleton pixels",
        level,
        count_nonzero(&skeleton)
    );
    Ok(skeleton)
}

/// Extract the stripe inside `roi_mask` using a fixed difference threshold.
pub fn extract_within_roi(
    background: &RgbImage,
    foreground: &RgbImage,
    roi_mask: &GrayImage,
    level: u8,
) -> Result<StripeMask> {
    ensure_same_size(background.dimensions(), foreground.dimensions(), "background/foreground")?;
    ensure_same_size(background.dimensions(), roi_mask.dimensions(), "frame/roi")?;

    let mut gray = difference_intensity(background, foreground);
    for (pixel, roi) in gray.pixels_mut().zip(roi_mask.pixels()) {
        if roi[0] == 0 {
            pixel[0] = 0;
        }
    }

    let binary = threshold(&gray, level, ThresholdType::Binary);
    Ok(thin(&binary))
}

/// Rasterise a polygon (e.g. a projected marker outline) into an ROI mask.
pub fn roi_mask_from_polygon(corners: &[Point2<f64>], width: u32, height: u32) -> Result<GrayImage> {
    let mut poly: Vec<Point<i32>> = corners
        .iter()
        .map(|c| Point::new(c.x.round() as i32, c.y.round() as i32))
        .collect();
    poly.dedup();
    if poly.len() > 1 && poly.first() == poly.last() {
        poly.pop();
    }
    if poly.len() < 3 {
        return Err(ScanError::DegenerateGeometry(format!(
            "ROI polygon needs 3 distinct corners, got {}",
            poly.len()
        )));
    }

    let mut mask = GrayImage::new(width, height);
    draw_polygon_mut(&mut mask, &poly, Luma([255]));
    Ok(mask)
}

pub fn count_nonzero(mask: &GrayImage) -> usize {
    mask.pixels().filter(|p| p[0] > 0).count()
}

/// Coordinates of all non-zero pixels, row by row
pub fn stripe_pixels(mask: &GrayImage) -> Vec<Point2<f64>> {
    mask.enumerate_pixels()
        .filter(|(_, _, p)| p[0] > 0)
        .map(|(x, y, _)| Point2::new(x as f64, y as f64))
        .collect()
}

/// Zhang–Suen thinning of a binary mask.
pub fn thin(mask: &GrayImage) -> GrayImage {
    let (width, height) = mask.dimensions();
    let (w, h) = (width as usize, height as usize);
    let mut grid: Vec<bool> = mask.pixels().map(|p| p[0] > 0).collect();

    if w < 3 || h < 3 {
        return mask.clone();
    }

    let mut to_clear = Vec::new();
    loop {
        let mut changed = false;
        for pass in 0..2 {
            to_clear.clear();
            for y in 1..h - 1 {
                for x in 1..w - 1 {
                    if !grid[y * w + x] {
                        continue;
                    }
                    let at = |dx: isize, dy: isize| -> u8 {
                        let nx = (x as isize + dx) as usize;
                        let ny = (y as isize + dy) as usize;
                        grid[ny * w + nx] as u8
                    };
                    // P2..P9 clockwise starting north
                    let n = [
                        at(0, -1),
                        at(1, -1),
                        at(1, 0),
                        at(1, 1),
                        at(0, 1),
                        at(-1, 1),
                        at(-1, 0),
                        at(-1, -1),
                    ];
                    let neighbours: u8 = n.iter().sum();
                    if !(2..=6).contains(&neighbours) {
                        continue;
                    }
                    let transitions = (0..8).filter(|&i| n[i] == 0 && n[(i + 1) % 8] == 1).count();
                    if transitions != 1 {
                        continue;
                    }
                    let (p2, p4, p6, p8) = (n[0], n[2], n[4], n[6]);
                    let keep = if pass == 0 {
                        p2 * p4 * p6 != 0 || p4 * p6 * p8 != 0
                    } else {
                        p2 * p4 * p8 != 0 || p2 * p6 * p8 != 0
                    };
                    if !keep {
                        to_clear.push(y * w + x);
                    }
                }
            }
            for &idx in &to_clear {
                grid[idx] = false;
            }
            changed |= !to_clear.is_empty();
        }
        if !changed {
            break;
        }
    }

    GrayImage::from_fn(width, height, |x, y| {
        Luma([if grid[(y * width + x) as usize] { 255 } else { 0 }])
    })
}
