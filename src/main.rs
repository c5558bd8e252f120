use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::Parser;
use image::ImageReader;

use surface_scan::cli::{Cli, Command};
use surface_scan::{
    extract_full_frame, extract_within_roi, fit_line_2d_from_skeleton, precompute, rectify,
    stripe_pixels, CalibrationModel, DeviceContext, ImageSequenceSource, PlaneEquation,
    Resource, ScanConfig, ScanError, ScanSession, WarmupReference,
};

fn load_rgb(path: &Path) -> Result<image::RgbImage> {
    let img = ImageReader::open(path)
        .with_context(|| format!("Failed to open image: {:?}", path))?
        .decode()
        .with_context(|| format!("Failed to decode image: {:?}", path))?;
    Ok(img.to_rgb8())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let mut config = match &cli.config {
        Some(path) => ScanConfig::from_file(path)
            .with_context(|| format!("Failed to load config: {:?}", path))?,
        None => ScanConfig::default(),
    };

    match cli.command {
        Command::Rectify {
            calibration,
            input,
            output,
            calibration_size,
        } => {
            let calib = CalibrationModel::load(&calibration)
                .context("Failed to load calibration")?;
            let map = precompute(&calib, calibration_size)
                .context("Failed to build rectification map")?;

            let raw = load_rgb(&input)?;
            let rectified = rectify(&map, &raw).context("Failed to rectify image")?;

            let output_path = Command::output_path(&input, &output, "rectified");
            rectified
                .save(&output_path)
                .with_context(|| format!("Failed to save output: {:?}", output_path))?;

            let k = map.optimized_camera_matrix();
            log::info!(
                "Optimized camera matrix: fx={:.3} fy={:.3} cx={:.3} cy={:.3}",
                k[(0, 0)],
                k[(1, 1)],
                k[(0, 2)],
                k[(1, 2)]
            );
            log::info!(
                "Saved rectified image: {:?} ({}x{} -> {}x{})",
                output_path,
                raw.width(),
                raw.height(),
                rectified.width(),
                rectified.height()
            );
        }

        Command::Stripe {
            background,
            foreground,
            roi,
            roi_threshold,
            output,
        } => {
            let bg = load_rgb(&background)?;
            let fg = load_rgb(&foreground)?;

            let skeleton = match &roi {
                Some(roi_path) => {
                    let mask = ImageReader::open(roi_path)
                        .with_context(|| format!("Failed to open ROI mask: {:?}", roi_path))?
                        .decode()
                        .with_context(|| format!("Failed to decode ROI mask: {:?}", roi_path))?
                        .to_luma8();
                    let level = roi_threshold.unwrap_or(config.roi_threshold);
                    extract_within_roi(&bg, &fg, &mask, level)?
                }
                None => extract_full_frame(&bg, &fg)?,
            };

            let pixel_count = stripe_pixels(&skeleton).len();
            log::info!("Stripe skeleton: {} pixels", pixel_count);

            let (direction, centroid) = fit_line_2d_from_skeleton(&skeleton)
                .context("Failed to fit stripe line")?;
            let angle = direction.y.atan2(direction.x).to_degrees();
            println!(
                "direction=({:.5}, {:.5}) centroid=({:.2}, {:.2}) angle={:.2}°",
                direction.x, direction.y, centroid.x, centroid.y, angle
            );

            if output.is_some() {
                let output_path = Command::output_path(&foreground, &output, "stripe");
                skeleton
                    .save(&output_path)
                    .with_context(|| format!("Failed to save skeleton: {:?}", output_path))?;
                log::info!("Saved stripe skeleton: {:?}", output_path);
            }
        }

        Command::Scan {
            calibration,
            frames,
            calibration_size,
            no_mirror,
            warmup,
            read_interval_ms,
            max_frames,
        } => {
            if no_mirror {
                config.mirror = false;
            }
            if let Some(secs) = warmup {
                if !secs.is_finite() || secs < 0.0 {
                    bail!("Warm-up must be a non-negative number of seconds, got {}", secs);
                }
                config.warmup_secs = secs;
            }
            if let Some(ms) = read_interval_ms {
                config.read_interval_ms = ms;
            }

            let calib = CalibrationModel::load(&calibration)
                .context("Failed to load calibration")?;
            let source = ImageSequenceSource::open(&frames)
                .with_context(|| format!("Failed to open frame directory: {:?}", frames))?;

            let [a, b, c, d] = config.placeholder_plane;
            let plane = PlaneEquation::new(a, b, c, d).context("Invalid placeholder plane")?;
            let detector = Box::new(WarmupReference::new(config.warmup(), plane));

            let context = DeviceContext::new()
                .with_source(source)
                .with_calibration(calib)
                .with_calibration_resolution(calibration_size);

            let session = ScanSession::start(context, config, detector)
                .map_err(|e| e.error)
                .context("Failed to start scan session")?;
            let handle = session.spawn().context("Failed to start scan worker")?;

            let mut points_total = 0usize;
            let mut plane_seen = false;
            let mut records = 0u64;
            for record in handle.records().iter() {
                records += 1;
                if let Some(points) = &record.points {
                    points_total += points.len();
                }
                if let (Resource::Plane(p), false) = (&record.resource, plane_seen) {
                    plane_seen = true;
                    log::info!(
                        "Reference plane: [{:.4}, {:.4}, {:.4}, {:.4}]",
                        p.a,
                        p.b,
                        p.c,
                        p.d
                    );
                }
                log::debug!("{}", record);

                if max_frames.is_some_and(|max| records >= max) {
                    handle.cancel();
                    break;
                }
            }

            match handle.join() {
                Ok(summary) => log::info!(
                    "Scan finished: {} records, {} frames read, {} stripe points",
                    summary.records,
                    summary.frames_read,
                    points_total
                ),
                Err(ScanError::FrameReadError(reason)) => log::info!(
                    "Frame stream ended ({}): {} records, {} stripe points",
                    reason, records, points_total
                ),
                Err(e) => return Err(e).context("Scan session failed"),
            }
        }
    }

    Ok(())
}
