//! Pixel buffer descriptors and regions of interest.

use serde::{Deserialize, Serialize};

/// Channel layout of a pixel buffer.
///
/// The CFA pattern is only meaningful when the layout is
/// monochrome, i.e. `channels() == 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Channels {
    /// Single channel, Bayer color filter array. `filter` is the CFA filter
    /// code (the usual RGGB/BGGR/... 2x2 tiling encoded as a `u32`).
    BayerCfa {
        /// Encoded 2x2 CFA filter pattern.
        filter: u32,
    },
    /// Single channel, X-Trans color filter array (Fujifilm's 6x6 mosaic).
    XTransCfa {
        /// The 6x6 pattern, each entry is a CFA color index in `0..3`.
        pattern: XTransPattern,
    },
    /// Four interleaved floats per pixel (RGBA), the default intermediate
    /// format between demosaicing and output.
    Rgba,
}

impl Channels {
    /// Number of channels stored per pixel.
    #[must_use]
    pub const fn count(&self) -> u32 {
        match self {
            Self::BayerCfa { .. } | Self::XTransCfa { .. } => 1,
            Self::Rgba => 4,
        }
    }

    /// Whether a CFA pattern is carried by this layout.
    #[must_use]
    pub const fn is_cfa(&self) -> bool {
        matches!(self, Self::BayerCfa { .. } | Self::XTransCfa { .. })
    }
}

/// Fujifilm X-Trans 6x6 mosaic: a color index (0, 1 or 2) per cell.
pub type XTransPattern = [[u8; 6]; 6];

/// Storage type of a pixel channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Datatype {
    /// 32-bit IEEE float, the working precision of the pipeline.
    Float32,
    /// 8-bit unsigned integer, the gamma node's output precision.
    Uint8,
}

impl Datatype {
    /// Size in bytes of a single channel value.
    #[must_use]
    pub const fn size_bytes(&self) -> usize {
        match self {
            Self::Float32 => 4,
            Self::Uint8 => 1,
        }
    }
}

/// Describes the pixel layout of a buffer.
///
/// Invariant: `bytes_per_pixel() == channels.count() * datatype.size_bytes()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageBufferDescriptor {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Channel layout.
    pub channels: Channels,
    /// Channel storage type.
    pub datatype: Datatype,
    /// Per-channel processed maximum, used by operators that need to know
    /// the legal output range (e.g. after a highlight-recovery stage).
    pub processed_maximum: [f32; 4],
}

impl ImageBufferDescriptor {
    /// Creates a descriptor, clamping nothing: callers are expected to pass
    /// already-valid dimensions.
    #[must_use]
    pub const fn new(width: u32, height: u32, channels: Channels, datatype: Datatype) -> Self {
        Self {
            width,
            height,
            channels,
            datatype,
            processed_maximum: [1.0; 4],
        }
    }

    /// Bytes occupied by a single pixel.
    #[must_use]
    pub const fn bytes_per_pixel(&self) -> usize {
        self.channels.count() as usize * self.datatype.size_bytes()
    }

    /// Total buffer size in bytes for this descriptor's dimensions.
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.width as usize * self.height as usize * self.bytes_per_pixel()
    }
}

/// A rectangular region of interest on a (possibly scaled) canvas.
///
/// `scale` relates this rectangle's pixel coordinates to the un-scaled input
/// canvas: a source pixel at `(sx, sy)` maps to roughly `(sx * scale, sy *
/// scale)` in this ROI's coordinate space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Roi {
    /// Left edge, in pixels.
    pub x: u32,
    /// Top edge, in pixels.
    pub y: u32,
    /// Width, in pixels. Must be >= 1.
    pub width: u32,
    /// Height, in pixels. Must be >= 1.
    pub height: u32,
    /// Scale factor relating this ROI to the un-scaled input, in `(0, 1]`.
    pub scale: f32,
}

impl Roi {
    /// Creates a new ROI. Panics if `width`/`height` are zero or `scale` is
    /// outside `(0, 1]` — these are programmer errors, not run-time faults.
    #[must_use]
    pub fn new(x: u32, y: u32, width: u32, height: u32, scale: f32) -> Self {
        assert!(width >= 1 && height >= 1, "ROI must be non-empty");
        assert!(scale > 0.0 && scale <= 1.0, "scale must be in (0, 1]");
        Self {
            x,
            y,
            width,
            height,
            scale,
        }
    }

    /// Identity ROI covering a `width x height` canvas at scale 1.
    #[must_use]
    pub fn identity(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height, 1.0)
    }

    /// Whether `self` is fully contained within `other`.
    #[must_use]
    pub fn is_contained_in(&self, other: &Self) -> bool {
        self.x >= other.x
            && self.y >= other.y
            && self.x + self.width <= other.x + other.width
            && self.y + self.height <= other.y + other.height
    }

    /// Area in pixels.
    #[must_use]
    pub const fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Whether this ROI collapses to less than one pixel in either axis,
    /// the condition under which a color-picker box is rejected as invalid.
    #[must_use]
    pub const fn is_degenerate(&self) -> bool {
        self.width < 1 || self.height < 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_per_pixel_rgba_float() {
        let dsc = ImageBufferDescriptor::new(64, 64, Channels::Rgba, Datatype::Float32);
        assert_eq!(dsc.bytes_per_pixel(), 16);
    }

    #[test]
    fn bytes_per_pixel_bayer_float() {
        let dsc = ImageBufferDescriptor::new(
            64,
            64,
            Channels::BayerCfa { filter: 0x9449 },
            Datatype::Float32,
        );
        assert_eq!(dsc.bytes_per_pixel(), 4);
        assert!(dsc.channels.is_cfa());
    }

    #[test]
    fn roi_containment() {
        let outer = Roi::identity(16, 16);
        let inner = Roi::new(4, 4, 8, 8, 1.0);
        assert!(inner.is_contained_in(&outer));
        assert!(!outer.is_contained_in(&inner));
    }

    #[test]
    #[should_panic(expected = "ROI must be non-empty")]
    fn roi_rejects_zero_size() {
        let _ = Roi::new(0, 0, 0, 4, 1.0);
    }
}
