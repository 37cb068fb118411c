//! Screenshot capture.
//!
//! The real capture mechanism belongs to the host; the engine only needs a
//! pixel buffer with its dimensions. `FileCapture` stands in for it by loading
//! an image from disk, which is what the CLI and the tests use.

use crate::fingerprint::{ContentFingerprint, ContentHasher};
use chrono::{DateTime, Utc};
use image::{ImageFormat, RgbaImage};
use std::io::Cursor;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Failed to load image: {0}")]
    Image(#[from] image::ImageError),
    #[error("Capture region {0} lies outside the {1}x{2} source")]
    RegionOutOfBounds(String, u32, u32),
    #[error("Captured image is empty")]
    Empty,
}

/// What part of the screen to capture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureDescriptor {
    ActiveWindow,
    FullScreen,
    Rect { x: u32, y: u32, width: u32, height: u32 },
}

impl CaptureDescriptor {
    /// Parse "x,y,w,h"
    pub fn parse_rect(spec: &str) -> Option<Self> {
        let parts: Vec<u32> = spec
            .split(',')
            .map(|p| p.trim().parse().ok())
            .collect::<Option<Vec<_>>>()?;

        match parts.as_slice() {
            [x, y, width, height] if *width > 0 && *height > 0 => Some(CaptureDescriptor::Rect {
                x: *x,
                y: *y,
                width: *width,
                height: *height,
            }),
            _ => None,
        }
    }
}

/// A captured screen image. Never persisted; only its fingerprint is.
#[derive(Debug, Clone)]
pub struct Screenshot {
    pub image: RgbaImage,
    pub captured_at: DateTime<Utc>,
    /// Window title or file name the pixels came from
    pub source_label: String,
}

impl Screenshot {
    pub fn new(image: RgbaImage, source_label: impl Into<String>) -> Self {
        Self {
            image,
            captured_at: Utc::now(),
            source_label: source_label.into(),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn fingerprint(&self) -> ContentFingerprint {
        ContentHasher::fingerprint(&self.image)
    }

    /// PNG-encode the pixels for backends that take an image file
    pub fn to_png_bytes(&self) -> Result<Vec<u8>, image::ImageError> {
        let mut buffer = Cursor::new(Vec::new());
        self.image.write_to(&mut buffer, ImageFormat::Png)?;
        Ok(buffer.into_inner())
    }
}

/// Source of screenshots
pub trait CaptureService: Send + Sync {
    fn capture_region(&self, descriptor: &CaptureDescriptor) -> Result<Screenshot, CaptureError>;
}

/// Capture service backed by an image file
pub struct FileCapture {
    path: PathBuf,
}

impl FileCapture {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn label(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

impl CaptureService for FileCapture {
    fn capture_region(&self, descriptor: &CaptureDescriptor) -> Result<Screenshot, CaptureError> {
        trace!("Loading capture from {}", self.path.display());
        let image = image::open(&self.path)?.to_rgba8();
        let screenshot = Screenshot::new(crop(image, descriptor)?, self.label());

        debug!(
            "Captured {}x{} from {} ({:?})",
            screenshot.width(),
            screenshot.height(),
            screenshot.source_label,
            descriptor
        );
        Ok(screenshot)
    }
}

/// Apply a descriptor to a full image. Window and screen captures use the
/// whole image; a rectangle is clipped to the image bounds.
fn crop(image: RgbaImage, descriptor: &CaptureDescriptor) -> Result<RgbaImage, CaptureError> {
    if image.width() == 0 || image.height() == 0 {
        return Err(CaptureError::Empty);
    }

    match *descriptor {
        CaptureDescriptor::ActiveWindow | CaptureDescriptor::FullScreen => Ok(image),
        CaptureDescriptor::Rect { x, y, width, height } => {
            if x >= image.width() || y >= image.height() {
                return Err(CaptureError::RegionOutOfBounds(
                    format!("{},{},{},{}", x, y, width, height),
                    image.width(),
                    image.height(),
                ));
            }

            let width = width.min(image.width() - x);
            let height = height.min(image.height() - y);
            Ok(image::imageops::crop_imm(&image, x, y, width, height).to_image())
        }
    }
}
