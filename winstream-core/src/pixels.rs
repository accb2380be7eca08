//! Pixel buffers handed over by the window model.
//!
//! An [`ImageWrapper`] is a snapshot of exactly one damaged rectangle.
//! It is created on the event loop and then owned by the encode worker.

use serde::{Deserialize, Serialize};

use crate::geometry::Rect;

// ── PixelFormat ──────────────────────────────────────────────────

/// Byte layout of one pixel, named as on the wire (`rgb_format`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 4 bytes: Blue, Green, Red, padding.
    Bgrx,
    /// 4 bytes: Blue, Green, Red, Alpha.
    Bgra,
    /// 4 bytes: Red, Green, Blue, padding.
    Rgbx,
    /// 4 bytes: Red, Green, Blue, Alpha.
    Rgba,
    /// 3 bytes: Red, Green, Blue.
    Rgb,
    /// 3 bytes: Blue, Green, Red.
    Bgr,
}

impl PixelFormat {
    /// Bytes consumed by a single pixel in this format.
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Bgrx | PixelFormat::Bgra | PixelFormat::Rgbx | PixelFormat::Rgba => 4,
            PixelFormat::Rgb | PixelFormat::Bgr => 3,
        }
    }

    pub const fn has_alpha(self) -> bool {
        matches!(self, PixelFormat::Bgra | PixelFormat::Rgba)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            PixelFormat::Bgrx => "BGRX",
            PixelFormat::Bgra => "BGRA",
            PixelFormat::Rgbx => "RGBX",
            PixelFormat::Rgba => "RGBA",
            PixelFormat::Rgb => "RGB",
            PixelFormat::Bgr => "BGR",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "BGRX" => PixelFormat::Bgrx,
            "BGRA" => PixelFormat::Bgra,
            "RGBX" => PixelFormat::Rgbx,
            "RGBA" => PixelFormat::Rgba,
            "RGB" => PixelFormat::Rgb,
            "BGR" => PixelFormat::Bgr,
            _ => return None,
        })
    }

    /// Channel offsets `(r, g, b, a)` inside one pixel.
    pub const fn channel_offsets(self) -> (usize, usize, usize, Option<usize>) {
        match self {
            PixelFormat::Bgrx => (2, 1, 0, None),
            PixelFormat::Bgra => (2, 1, 0, Some(3)),
            PixelFormat::Rgbx => (0, 1, 2, None),
            PixelFormat::Rgba => (0, 1, 2, Some(3)),
            PixelFormat::Rgb => (0, 1, 2, None),
            PixelFormat::Bgr => (2, 1, 0, None),
        }
    }
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── ImageWrapper ─────────────────────────────────────────────────

/// Raw pixels of one window rectangle.
///
/// The `pixels` buffer holds `height` rows of `stride` bytes each.
/// `stride` may be larger than `width * bytes_per_pixel`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageWrapper {
    /// Position and size inside the window.
    pub rect: Rect,
    /// Row pitch in **bytes**.
    pub stride: u32,
    /// Pixel layout.
    pub format: PixelFormat,
    /// Raw pixel data, `stride * height` bytes.
    pub pixels: Vec<u8>,
}

impl ImageWrapper {
    pub fn new(rect: Rect, stride: u32, format: PixelFormat, pixels: Vec<u8>) -> Self {
        Self {
            rect,
            stride,
            format,
            pixels,
        }
    }

    pub fn width(&self) -> u32 {
        self.rect.width
    }

    pub fn height(&self) -> u32 {
        self.rect.height
    }

    /// Bytes of pixel data in one row, without padding.
    pub fn row_bytes(&self) -> usize {
        self.rect.width as usize * self.format.bytes_per_pixel()
    }

    /// Whether the buffer is large enough for the declared geometry.
    pub fn is_valid(&self) -> bool {
        self.stride as usize >= self.row_bytes()
            && self.pixels.len() >= self.stride as usize * self.rect.height as usize
    }

    /// Returns a row slice without padding bytes.
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.stride as usize;
        &self.pixels[start..start + self.row_bytes()]
    }

    /// Drop row padding so that `stride == width * bpp`.
    pub fn restride(&mut self) {
        let row_bytes = self.row_bytes();
        if self.stride as usize == row_bytes {
            return;
        }
        let mut packed = Vec::with_capacity(row_bytes * self.rect.height as usize);
        for y in 0..self.rect.height {
            packed.extend_from_slice(self.row(y));
        }
        self.pixels = packed;
        self.stride = row_bytes as u32;
    }

    /// Replace the pixel buffer, keeping geometry and format.
    pub fn set_pixels(&mut self, pixels: Vec<u8>) {
        self.pixels = pixels;
    }
}

// ── Tests ────────────────────────────────────────────────────────
