use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "surface-scan")]
#[command(version, about = "Laser-stripe 3D surface scanning pipeline")]
pub struct Cli {
    /// Show debug logging
    #[arg(long, global = true)]
    pub verbose: bool,

    /// JSON file overriding session settings
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Undistort a single image with a calibration file
    Rectify {
        /// Calibration JSON with `camera_matrix` and `dist_coeffs`
        #[arg(short, long)]
        calibration: PathBuf,

        /// Raw input image
        #[arg(short, long)]
        input: PathBuf,

        /// Output path [default: input_rectified.png]
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Resolution the calibration was computed at, e.g. "1280x720"
        #[arg(long, default_value = "1280x720", value_parser = parse_resolution)]
        calibration_size: (u32, u32),
    },

    /// Extract the laser stripe from a background/foreground pair and fit a line
    Stripe {
        #[arg(short, long)]
        background: PathBuf,

        #[arg(short, long)]
        foreground: PathBuf,

        /// Region-of-interest mask; enables the fixed-threshold extractor
        #[arg(long)]
        roi: Option<PathBuf>,

        /// Difference level for the ROI extractor [default: from config, 20]
        #[arg(long, requires = "roi")]
        roi_threshold: Option<u8>,

        /// Save the stripe skeleton here
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Stream a directory of frames through the full session loop
    Scan {
        #[arg(short, long)]
        calibration: PathBuf,

        /// Directory of raw frames, read in file-name order
        #[arg(short, long)]
        frames: PathBuf,

        #[arg(long, default_value = "1280x720", value_parser = parse_resolution)]
        calibration_size: (u32, u32),

        /// Keep the camera orientation instead of mirroring
        #[arg(long)]
        no_mirror: bool,

        /// Seconds before the placeholder reference plane is published
        #[arg(long)]
        warmup: Option<f64>,

        /// Milliseconds between reads
        #[arg(long)]
        read_interval_ms: Option<u64>,

        /// Stop after this many records
        #[arg(long)]
        max_frames: Option<u64>,
    },
}

impl Command {
    /// Default output next to the input, with a suffix
    pub fn output_path(input: &std::path::Path, output: &Option<PathBuf>, suffix: &str) -> PathBuf {
        output.clone().unwrap_or_else(|| {
            let stem = input.file_stem().unwrap_or_default().to_string_lossy();
            let parent = input.parent().unwrap_or(std::path::Path::new("."));
            parent.join(format!("{}_{}.png", stem, suffix))
        })
    }
}

fn parse_resolution(s: &str) -> Result<(u32, u32), String> {
    let parts: Vec<&str> = s.split(['x', 'X']).collect();
    if parts.len() != 2 {
        return Err(format!("Invalid resolution '{}', expected WIDTHxHEIGHT", s));
    }

    let width: u32 = parts[0]
        .trim()
        .parse()
        .map_err(|_| format!("Invalid width: {}", parts[0]))?;
    let height: u32 = parts[1]
        .trim()
        .parse()
        .map_err(|_| format!("Invalid height: {}", parts[1]))?;

    if width == 0 || height == 0 {
        return Err("Resolution must be non-zero".to_string());
    }

    Ok((width, height))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_resolution() {
        assert_eq!(parse_resolution("1280x720"), Ok((1280, 720)));
        assert_eq!(parse_resolution("640X480"), Ok((640, 480)));
        assert!(parse_resolution("1280").is_err());
        assert!(parse_resolution("0x720").is_err());
    }

    #[test]
    fn test_default_output_path() {
        let path = Command::output_path(std::path::Path::new("shots/a.png"), &None, "rectified");
        assert_eq!(path, PathBuf::from("shots/a_rectified.png"));
    }

    #[test]
    fn test_rectify_and_stripe_arguments() {
        let cli = Cli::parse_from([
            "surface-scan",
            "rectify",
            "-c",
            "calib.json",
            "--input",
            "raw.png",
        ]);
        match cli.command {
            Command::Rectify { input, .. } => assert_eq!(input, PathBuf::from("raw.png")),
            other => panic!("unexpected command {other:?}"),
        }

        let cli = Cli::parse_from([
            "surface-scan",
            "stripe",
            "-b",
            "bg.png",
            "-f",
            "fg.png",
            "--roi",
            "roi.png",
            "--roi-threshold",
            "35",
        ]);
        match cli.command {
            Command::Stripe { roi_threshold, .. } => assert_eq!(roi_threshold, Some(35)),
            other => panic!("unexpected command {other:?}"),
        }

        assert!(Cli::try_parse_from([
            "surface-scan",
            "stripe",
            "-b",
            "bg.png",
            "-f",
            "fg.png",
            "--roi-threshold",
            "35",
        ])
        .is_err());
    }

    #[test]
    fn test_scan_arguments() {
        let cli = Cli::parse_from([
            "surface-scan",
            "--verbose",
            "scan",
            "-c",
            "calib.json",
            "-f",
            "frames",
            "--no-mirror",
            "--max-frames",
            "5",
        ]);
        assert!(cli.verbose);
        match cli.command {
            Command::Scan {
                no_mirror,
                max_frames,
                calibration_size,
                ..
            } => {
                assert!(no_mirror);
                assert_eq!(max_frames, Some(5));
                assert_eq!(calibration_size, (1280, 720));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
