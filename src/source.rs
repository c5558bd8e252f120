use std::path::{Path, PathBuf};

use image::{ImageReader, RgbImage};

use crate::error::Result;

/// A camera-like producer of raw colour frames.
pub trait FrameSource: Send {
    fn is_open(&self) -> bool;

    /// Next frame, or `None` once the source stops delivering.
    fn read_frame(&mut self) -> Option<RgbImage>;

    /// Nominal capture resolution, when known before the first read
    fn resolution(&self) -> Option<(u32, u32)> {
        None
    }
}

const FRAME_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

/// Replays a directory of still images as a frame stream, in file-name order.
pub struct ImageSequenceSource {
    frames: Vec<PathBuf>,
    next: usize,
    resolution: Option<(u32, u32)>,
}

impl ImageSequenceSource {
    pub fn open(dir: &Path) -> Result<Self> {
        let mut frames: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| FRAME_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();
        frames.sort();

        let resolution = match frames.first() {
            Some(first) => Some(image::image_dimensions(first)?),
            None => None,
        };

        log::info!("Frame sequence {:?}: {} frames", dir, frames.len());
        Ok(Self {
            frames,
            next: 0,
            resolution,
        })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl FrameSource for ImageSequenceSource {
    fn is_open(&self) -> bool {
        !self.frames.is_empty()
    }

    fn read_frame(&mut self) -> Option<RgbImage> {
        let path = self.frames.get(self.next)?;
        self.next += 1;

        let decoded = ImageReader::open(path)
            .map_err(image::ImageError::IoError)
            .and_then(|reader| reader.decode());
        match decoded {
            Ok(img) => Some(img.to_rgb8()),
            Err(e) => {
                log::warn!("Failed to decode frame {:?}: {}", path, e);
                None
            }
        }
    }

    fn resolution(&self) -> Option<(u32, u32)> {
        self.resolution
    }
}
