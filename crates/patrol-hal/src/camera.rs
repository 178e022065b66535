//! Generic `Camera` trait and supporting types for image-capture hardware.

use std::io::Cursor;
use std::path::Path;

use image::{DynamicImage, GrayImage, ImageBuffer, ImageFormat, RgbImage};
use patrol_types::PatrolError;
use thiserror::Error;

/// Pixel layout of a [`CameraFrame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// One byte per pixel.
    Gray8,
    /// Three bytes per pixel, R-G-B order.
    Rgb24,
}

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("frame buffer does not hold a {width}x{height} {format:?} image")]
    Geometry {
        width: u32,
        height: u32,
        format: PixelFormat,
    },
    #[error("frame has no pixels")]
    Empty,
    #[error(transparent)]
    Image(#[from] image::ImageError),
    #[error("frame I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl From<FrameError> for PatrolError {
    fn from(e: FrameError) -> Self {
        PatrolError::CaptureFailure(e.to_string())
    }
}

/// An image frame returned by a camera driver.
///
/// Always non-empty and either 8-bit grey or 8-bit RGB; anything else is
/// converted on construction.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraFrame {
    image: DynamicImage,
}

impl CameraFrame {
    pub fn gray(image: GrayImage) -> Result<Self, FrameError> {
        Self::from_image(DynamicImage::ImageLuma8(image))
    }

    pub fn rgb(image: RgbImage) -> Result<Self, FrameError> {
        Self::from_image(DynamicImage::ImageRgb8(image))
    }

    /// Wrap a raw row-major driver buffer.
    ///
    /// # Errors
    ///
    /// [`FrameError::Geometry`] when `data` is not exactly
    /// `width * height` pixels, [`FrameError::Empty`] when either dimension
    /// is zero.
    pub fn from_raw(
        width: u32,
        height: u32,
        format: PixelFormat,
        data: Vec<u8>,
    ) -> Result<Self, FrameError> {
        let geometry = FrameError::Geometry {
            width,
            height,
            format,
        };
        match format {
            PixelFormat::Gray8 => ImageBuffer::from_raw(width, height, data)
                .ok_or(geometry)
                .and_then(Self::gray),
            PixelFormat::Rgb24 => ImageBuffer::from_raw(width, height, data)
                .ok_or(geometry)
                .and_then(Self::rgb),
        }
    }

    /// Accept any decoded image, normalising its pixel type.
    pub fn from_image(image: DynamicImage) -> Result<Self, FrameError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(FrameError::Empty);
        }
        let image = match image {
            DynamicImage::ImageLuma8(_) | DynamicImage::ImageRgb8(_) => image,
            other if other.color().has_color() => DynamicImage::ImageRgb8(other.to_rgb8()),
            other => DynamicImage::ImageLuma8(other.to_luma8()),
        };
        Ok(Self { image })
    }

    /// Decode an encoded image (JPEG, PNG, PNM, …), format sniffed from the
    /// bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        Self::from_image(image::load_from_memory(bytes)?)
    }

    /// Read and decode an image file.
    pub fn open(path: &Path) -> Result<Self, FrameError> {
        Self::from_image(image::open(path)?)
    }

    pub fn encode(&self, format: ImageFormat) -> Result<Vec<u8>, FrameError> {
        let mut out = Cursor::new(Vec::new());
        self.image.write_to(&mut out, format)?;
        Ok(out.into_inner())
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn format(&self) -> PixelFormat {
        match self.image {
            DynamicImage::ImageLuma8(_) => PixelFormat::Gray8,
            _ => PixelFormat::Rgb24,
        }
    }

    /// Greyscale copy of the frame.
    pub fn to_luma8(&self) -> GrayImage {
        self.image.to_luma8()
    }

    pub fn as_image(&self) -> &DynamicImage {
        &self.image
    }
}

/// A camera or image-capture device.
///
/// Drivers implement this trait and register themselves with a
/// [`HardwareRegistry`][crate::registry::HardwareRegistry].
pub trait Camera: Send + Sync {
    /// Stable identifier for this camera, e.g. `"front_door"`.
    fn id(&self) -> &str;

    /// Capture and return the next available frame.
    ///
    /// # Errors
    ///
    /// Returns [`PatrolError::CaptureFailure`] if the frame cannot be captured
    /// (e.g. the device is disconnected or asleep).
    fn capture(&mut self) -> Result<CameraFrame, PatrolError>;

    /// Enter the low-power state.  Drivers without one ignore this.
    fn sleep(&mut self) -> Result<(), PatrolError> {
        Ok(())
    }

    /// Leave the low-power state.
    fn wake(&mut self) -> Result<(), PatrolError> {
        Ok(())
    }
}
