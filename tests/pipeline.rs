use std::io::Write;

use approx::assert_relative_eq;
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_line_segment_mut;
use nalgebra::{Matrix3, Point2};

use surface_scan::config::{TARGET_HEIGHT, TARGET_WIDTH};
use surface_scan::{
    backproject, extract_full_frame, fit_line_2d_from_skeleton, precompute, rectify,
    CalibrationModel, DeviceContext, ImageSequenceSource, PlaneEquation, Resource, ScanConfig,
    ScanError, ScanSession, SessionState, WarmupReference,
};

const CALIBRATION_JSON: &str = r#"{
    "camera_matrix": [[900.0, 0.0, 640.0], [0.0, 900.0, 360.0], [0.0, 0.0, 1.0]],
    "dist_coeffs": [[0.0, 0.0, 0.0, 0.0, 0.0]]
}"#;

fn calibration_file() -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(CALIBRATION_JSON.as_bytes()).unwrap();
    file
}

fn placeholder_plane() -> PlaneEquation {
    PlaneEquation::new(1.0, 1.0, 2.1, -1.0).unwrap()
}

#[test]
fn test_rectified_frames_have_target_size() {
    let file = calibration_file();
    let calib = CalibrationModel::load(file.path()).unwrap();
    let map = precompute(&calib, (640, 480)).unwrap();

    for (w, h) in [(640, 480), (1920, 1080), (TARGET_WIDTH, TARGET_HEIGHT)] {
        let frame = RgbImage::from_pixel(w, h, Rgb([90, 90, 90]));
        let out = rectify(&map, &frame).unwrap();
        assert_eq!(out.dimensions(), (TARGET_WIDTH, TARGET_HEIGHT));
    }
}

#[test]
fn test_stripe_angle_is_recovered() {
    let background = RgbImage::from_pixel(200, 150, Rgb([20, 20, 20]));
    let mut foreground = background.clone();
    draw_line_segment_mut(&mut foreground, (20.0, 30.0), (180.0, 110.0), Rgb([255, 0, 0]));

    let skeleton = extract_full_frame(&background, &foreground).unwrap();
    let (direction, centroid) = fit_line_2d_from_skeleton(&skeleton).unwrap();

    let angle = (direction.y / direction.x).atan().to_degrees();
    assert_relative_eq!(angle, 0.5f64.atan().to_degrees(), epsilon = 1.0);
    assert_relative_eq!(centroid.x, 100.0, epsilon = 3.0);
    assert_relative_eq!(centroid.y, 70.0, epsilon = 3.0);
}

#[test]
fn test_session_without_source_reads_nothing() {
    let file = calibration_file();
    let calib = CalibrationModel::load(file.path()).unwrap();
    let context: DeviceContext<ImageSequenceSource> = DeviceContext::new().with_calibration(calib);

    let detector = Box::new(WarmupReference::new(
        std::time::Duration::ZERO,
        placeholder_plane(),
    ));
    let (error, context) = ScanSession::start(context, ScanConfig::default(), detector)
        .err()
        .unwrap()
        .into_parts();
    assert!(matches!(error, ScanError::DeviceNotReady(_)));
    assert!(context.rectification().is_none());
}

#[test]
fn test_backprojected_stripe_lies_on_plane() {
    let k = Matrix3::new(900.0, 0.0, 640.0, 0.0, 900.0, 360.0, 0.0, 0.0, 1.0);
    let plane = placeholder_plane();
    let pixels: Vec<_> = (100..200)
        .map(|y| Point2::new(600.0, y as f64))
        .collect();

    let points = backproject(&pixels, &plane, &k).unwrap();
    assert_eq!(points.len(), pixels.len());
    for p in &points {
        assert!(p.z > 0.0);
        assert_relative_eq!(plane.signed_distance(p), 0.0, epsilon = 1e-9);
    }
}

#[test]
fn test_scan_directory_end_to_end() {
    let frames_dir = tempfile::tempdir().unwrap();
    let background = RgbImage::from_pixel(TARGET_WIDTH, TARGET_HEIGHT, Rgb([25, 25, 25]));
    background.save(frames_dir.path().join("frame_000.png")).unwrap();
    for i in 1..3 {
        let mut frame = background.clone();
        for y in 100..600 {
            for x in 600..603 {
                frame.put_pixel(x, y, Rgb([250, 30, 30]));
            }
        }
        frame
            .save(frames_dir.path().join(format!("frame_{:03}.png", i)))
            .unwrap();
    }

    let file = calibration_file();
    let calib = CalibrationModel::load(file.path()).unwrap();
    let source = ImageSequenceSource::open(frames_dir.path()).unwrap();
    let context = DeviceContext::new()
        .with_source(source)
        .with_calibration(calib)
        .with_calibration_resolution((TARGET_WIDTH, TARGET_HEIGHT));

    let config = ScanConfig {
        read_interval_ms: 1,
        ..ScanConfig::default()
    };
    let plane = placeholder_plane();
    let detector = Box::new(WarmupReference::new(std::time::Duration::ZERO, plane));
    let mut session = ScanSession::start(context, config, detector).unwrap();

    let first = session.next_record().unwrap().unwrap();
    assert_eq!(first.resource, Resource::Plane(plane));
    assert!(first.points.is_none());

    for _ in 1..3 {
        let record = session.next_record().unwrap().unwrap();
        let points = record.points.expect("stripe points");
        assert!(points.len() >= 100);
        for p in &points {
            assert_relative_eq!(plane.signed_distance(p), 0.0, epsilon = 1e-9);
        }
        // the stripe sits in columns 600..=602 of the unmirrored camera image
        let mean_column =
            points.iter().map(|p| 900.0 * p.x / p.z + 640.0).sum::<f64>() / points.len() as f64;
        assert_relative_eq!(mean_column, 601.0, epsilon = 1.0);
    }

    assert!(matches!(
        session.next_record(),
        Err(ScanError::FrameReadError(_))
    ));
    assert_eq!(session.state(), SessionState::Terminated);
}
