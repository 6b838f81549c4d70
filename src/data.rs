//! Image and frame data types.
//!
//! A finished exposure is delivered as a [`Frame`]: the raw counts image, a
//! per-pixel uncertainty map, the detector mask and the assembled metadata
//! header. Raw images come from the frame store as [`ImageData`]; the
//! uncertainty map is derived here with the Poisson approximation used by
//! the reduction pipeline downstream.

use serde::{Deserialize, Serialize};

use crate::metadata::FrameHeader;

/// A two-dimensional detector image in row-major order.
///
/// Pixel values are photon counts. They are stored as `f64` so that derived
/// quantities (uncertainties, corrected intensities) share the same layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageData {
    /// Image width in pixels.
    pub width: u32,
    /// Image height in pixels.
    pub height: u32,
    /// Pixel values, `width * height` entries, row-major.
    pub pixels: Vec<f64>,
}

impl ImageData {
    /// Creates an image from raw pixel data.
    ///
    /// The caller is responsible for `pixels.len() == width * height`.
    pub fn new(width: u32, height: u32, pixels: Vec<f64>) -> Self {
        debug_assert_eq!(pixels.len(), (width as usize) * (height as usize));
        Self {
            width,
            height,
            pixels,
        }
    }

    /// Creates an image with every pixel set to `value`.
    pub fn filled(width: u32, height: u32, value: f64) -> Self {
        Self {
            width,
            height,
            pixels: vec![value; (width as usize) * (height as usize)],
        }
    }

    /// Number of pixels.
    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    /// Whether the image has no pixels.
    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    /// Per-pixel uncertainty of a raw counts image.
    ///
    /// Poisson statistics: `sqrt(counts)` where `counts > 0`, otherwise 1.0.
    /// The floor keeps empty pixels from producing zero uncertainties that
    /// would blow up as divisors in the reduction pipeline.
    pub fn poisson_uncertainty(&self) -> ImageData {
        let pixels = self
            .pixels
            .iter()
            .map(|&c| if c > 0.0 { c.sqrt() } else { 1.0 })
            .collect();
        ImageData {
            width: self.width,
            height: self.height,
            pixels,
        }
    }
}

/// A detector mask: 1 marks a valid pixel, 0 a masked one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaskData {
    /// Mask width in pixels.
    pub width: u32,
    /// Mask height in pixels.
    pub height: u32,
    /// Mask values, `width * height` entries, row-major.
    pub pixels: Vec<u8>,
}

impl MaskData {
    /// An all-valid mask. Used as the fallback when the configured mask
    /// cannot be found.
    pub fn ones(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![1; (width as usize) * (height as usize)],
        }
    }
}

/// One complete exposed frame: image, uncertainty, mask and metadata.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Assembled metadata record for this frame.
    pub header: FrameHeader,
    /// Raw counts image.
    pub image: ImageData,
    /// Per-pixel uncertainty map, same shape as `image`.
    pub uncertainty: ImageData,
    /// Detector mask, same shape as `image`.
    pub mask: MaskData,
}
