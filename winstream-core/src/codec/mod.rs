//! Pluggable picture encoders.
//!
//! The pipeline never calls a codec library directly: it looks the
//! [`Encoding`] up in a [`CodecRegistry`] built once at startup and
//! shared by every connection, then calls [`Encoder::encode`] on the
//! encode worker thread.
//!
//! | Module    | Encodings                       |
//! |-----------|---------------------------------|
//! | `rgb`     | `rgb24`, `rgb32` (zstd / zlib)  |
//! | `picture` | `png`, `png/P`, `png/L`, `jpeg` |
//! | `mmap`    | shared memory ring, not a codec |

pub mod mmap;
pub mod picture;
pub mod rgb;

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::EncodeError;
use crate::pixels::{ImageWrapper, PixelFormat};
use crate::wire::{Options, Payload};

pub use mmap::{MmapArea, MmapWrite};
pub use picture::PictureEncoder;
pub use rgb::RgbEncoder;

// ── Encoding ─────────────────────────────────────────────────────

/// Every encoding name the pipeline understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Encoding {
    /// Pseudo encoding: "rgb24 or rgb32, whichever fits".
    Rgb,
    Rgb24,
    Rgb32,
    Png,
    /// 8-bit colour png.
    PngP,
    /// Greyscale png.
    PngL,
    Jpeg,
    Webp,
    H264,
    Vp8,
    Vp9,
    /// Pixels written to the shared memory area.
    Mmap,
}

impl Encoding {
    /// Server preference order when the client does not choose.
    pub const PREFERRED: [Encoding; 11] = [
        Encoding::H264,
        Encoding::Vp9,
        Encoding::Vp8,
        Encoding::Png,
        Encoding::PngP,
        Encoding::PngL,
        Encoding::Webp,
        Encoding::Rgb,
        Encoding::Rgb24,
        Encoding::Rgb32,
        Encoding::Jpeg,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Encoding::Rgb => "rgb",
            Encoding::Rgb24 => "rgb24",
            Encoding::Rgb32 => "rgb32",
            Encoding::Png => "png",
            Encoding::PngP => "png/P",
            Encoding::PngL => "png/L",
            Encoding::Jpeg => "jpeg",
            Encoding::Webp => "webp",
            Encoding::H264 => "h264",
            Encoding::Vp8 => "vp8",
            Encoding::Vp9 => "vp9",
            Encoding::Mmap => "mmap",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "rgb" => Encoding::Rgb,
            "rgb24" => Encoding::Rgb24,
            "rgb32" => Encoding::Rgb32,
            "png" => Encoding::Png,
            "png/P" => Encoding::PngP,
            "png/L" => Encoding::PngL,
            "jpeg" => Encoding::Jpeg,
            "webp" => Encoding::Webp,
            "h264" => Encoding::H264,
            "vp8" => Encoding::Vp8,
            "vp9" => Encoding::Vp9,
            "mmap" => Encoding::Mmap,
            _ => return None,
        })
    }

    /// Encodings that can carry an alpha channel.
    pub const fn supports_alpha(self) -> bool {
        matches!(
            self,
            Encoding::Rgb | Encoding::Rgb32 | Encoding::Png | Encoding::PngP | Encoding::Webp
        )
    }

    /// Pixel exact output, never needs an auto-refresh.
    pub const fn is_lossless(self) -> bool {
        matches!(
            self,
            Encoding::Rgb | Encoding::Rgb24 | Encoding::Rgb32 | Encoding::Png | Encoding::Mmap
        )
    }

    pub const fn is_rgb(self) -> bool {
        matches!(self, Encoding::Rgb | Encoding::Rgb24 | Encoding::Rgb32)
    }

    pub const fn is_video(self) -> bool {
        matches!(self, Encoding::H264 | Encoding::Vp8 | Encoding::Vp9)
    }

    /// Quality is pinned at 100 for these, whatever the estimator says.
    pub const fn has_fixed_quality(self) -> bool {
        matches!(
            self,
            Encoding::Rgb | Encoding::Rgb24 | Encoding::Rgb32 | Encoding::Png | Encoding::PngP | Encoding::PngL
        )
    }
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Encoder contract ─────────────────────────────────────────────

/// Parameters for one encode call, captured on the event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeParams {
    pub quality: u8,
    pub speed: u8,
    /// Layouts the client accepts for rgb payloads.
    pub rgb_formats: Arc<[PixelFormat]>,
    /// The client paints alpha.
    pub transparency: bool,
    pub rgb_zstd: bool,
    pub rgb_zlib: bool,
}

impl Default for EncodeParams {
    fn default() -> Self {
        Self {
            quality: 100,
            speed: 50,
            rgb_formats: Arc::from(
                [
                    PixelFormat::Bgrx,
                    PixelFormat::Bgra,
                    PixelFormat::Rgbx,
                    PixelFormat::Rgba,
                    PixelFormat::Rgb,
                    PixelFormat::Bgr,
                ]
                .as_slice(),
            ),
            transparency: false,
            rgb_zstd: false,
            rgb_zlib: true,
        }
    }
}

/// Output of an encoder.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedImage {
    /// The encoding actually produced (`rgb24` may turn into `rgb32`).
    pub encoding: Encoding,
    pub payload: Payload,
    /// Options the client needs to decode the payload.
    pub client_options: Options,
    pub width: u32,
    pub height: u32,
    /// Row stride of the payload, `0` when the container carries it.
    pub stride: u32,
    pub bpp: u8,
}

/// A codec family.
pub trait Encoder: Send + Sync {
    fn name(&self) -> &'static str;

    /// Encodings this encoder produces.
    fn encodings(&self) -> &[Encoding];

    /// Video encoders need the whole window for every frame.
    fn whole_frame_only(&self) -> bool {
        false
    }

    fn encode(
        &self,
        encoding: Encoding,
        image: &ImageWrapper,
        params: &EncodeParams,
    ) -> Result<EncodedImage, EncodeError>;
}

// ── CodecRegistry ────────────────────────────────────────────────

/// Encoders available to this process, keyed by encoding.
#[derive(Clone, Default)]
pub struct CodecRegistry {
    encoders: HashMap<Encoding, Arc<dyn Encoder>>,
}

impl CodecRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in rgb and still-image encoders.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(RgbEncoder::new()));
        registry.register(Arc::new(PictureEncoder::new()));
        registry
    }

    /// Register `encoder` for every encoding it declares, replacing earlier ones.
    pub fn register(&mut self, encoder: Arc<dyn Encoder>) {
        for &enc in encoder.encodings() {
            tracing::debug!(encoding = %enc, encoder = encoder.name(), "registered encoder");
            self.encoders.insert(enc, Arc::clone(&encoder));
        }
    }

    pub fn get(&self, encoding: Encoding) -> Option<&Arc<dyn Encoder>> {
        self.encoders.get(&encoding)
    }

    pub fn contains(&self, encoding: Encoding) -> bool {
        (encoding == Encoding::Rgb && self.has_rgb()) || self.encoders.contains_key(&encoding)
    }

    fn has_rgb(&self) -> bool {
        self.encoders.contains_key(&Encoding::Rgb24) || self.encoders.contains_key(&Encoding::Rgb32)
    }

    /// Registered encodings in preference order, with the `rgb` pseudo encoding.
    pub fn encodings(&self) -> Vec<Encoding> {
        Encoding::PREFERRED
            .into_iter()
            .filter(|e| self.contains(*e))
            .collect()
    }

    /// Whether `encoding` always needs `(0, 0, width, height)`.
    pub fn is_whole_frame_only(&self, encoding: Encoding) -> bool {
        self.get(encoding).is_some_and(|e| e.whole_frame_only())
    }

    pub fn encode(
        &self,
        encoding: Encoding,
        image: &ImageWrapper,
        params: &EncodeParams,
    ) -> Result<EncodedImage, EncodeError> {
        let lookup = match encoding {
            Encoding::Rgb if image.format.bytes_per_pixel() == 4 => Encoding::Rgb32,
            Encoding::Rgb => Encoding::Rgb24,
            other => other,
        };
        let encoder = self.get(lookup).ok_or(EncodeError::NoEncoder(encoding))?;
        if !image.is_valid() {
            return Err(EncodeError::InvalidImage("pixel buffer smaller than geometry"));
        }
        encoder.encode(lookup, image, params)
    }
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("encodings", &self.encodings())
            .finish()
    }
}

// ── Tests ────────────────────────────────────────────────────────
