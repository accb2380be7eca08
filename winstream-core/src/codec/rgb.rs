//! Plain rgb encoder with optional zstd or zlib compression.
//!
//! Pixels are sent in a layout the client declared in `rgb_formats`,
//! converted first if needed. Rows are always packed tightly.

use std::io::Write;

use bytes::Bytes;
use flate2::Compression;
use flate2::write::ZlibEncoder;

use crate::codec::{EncodeParams, EncodedImage, Encoder, Encoding};
use crate::error::EncodeError;
use crate::pixels::{ImageWrapper, PixelFormat};
use crate::wire::{Options, OptionsExt, Payload};

/// Below this many bytes compression is not attempted.
const MIN_COMPRESS_SIZE: usize = 256;
/// Compressed data must save at least this much to be used.
const MIN_SAVING: usize = 32;

// ── RgbEncoder ───────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct RgbEncoder;

impl RgbEncoder {
    pub fn new() -> Self {
        Self
    }
}

impl Encoder for RgbEncoder {
    fn name(&self) -> &'static str {
        "rgb"
    }

    fn encodings(&self) -> &[Encoding] {
        &[Encoding::Rgb24, Encoding::Rgb32]
    }

    fn encode(
        &self,
        encoding: Encoding,
        image: &ImageWrapper,
        params: &EncodeParams,
    ) -> Result<EncodedImage, EncodeError> {
        let mut image = if params.rgb_formats.contains(&image.format) {
            image.clone()
        } else {
            reformat(image, &params.rgb_formats, params.transparency)
                .ok_or_else(|| {
                    EncodeError::failed(
                        encoding,
                        format!(
                            "no compatible rgb format for {} (client accepts {:?})",
                            image.format, params.rgb_formats
                        ),
                    )
                })?
        };
        image.restride();

        let bpp = image.format.bytes_per_pixel();
        let encoding = match (encoding, bpp) {
            (Encoding::Rgb24, 4) => Encoding::Rgb32,
            (Encoding::Rgb32, 3) => Encoding::Rgb24,
            (e, _) => e,
        };

        let mut options = Options::new();
        options.set("rgb_format", image.format.as_str());

        let level = compression_level(image.pixels.len(), params.speed);
        let payload = match compress(&image.pixels, level, params)? {
            Some((algo, data)) => {
                options.set(algo, level);
                Payload::Compressed(Bytes::from(data))
            }
            None => Payload::Raw(Bytes::from(image.pixels)),
        };

        Ok(EncodedImage {
            encoding,
            payload,
            client_options: options,
            width: image.rect.width,
            height: image.rect.height,
            stride: image.stride,
            bpp: if bpp == 4 { 32 } else { 24 },
        })
    }
}

// ── Compression ──────────────────────────────────────────────────

/// zlib style level 0-5: faster speed means less compression.
fn compression_level(len: usize, speed: u8) -> u32 {
    if len < MIN_COMPRESS_SIZE {
        return 0;
    }
    let level = (115u32.saturating_sub(u32::from(speed)) / 20).min(5);
    if len < 1024 { level / 2 } else { level }
}

/// Returns the algorithm name and compressed bytes, or `None` when
/// compression is off or does not pay.
fn compress(
    pixels: &[u8],
    level: u32,
    params: &EncodeParams,
) -> Result<Option<(&'static str, Vec<u8>)>, EncodeError> {
    if level == 0 {
        return Ok(None);
    }
    let (algo, data) = if params.rgb_zstd {
        let data = zstd::encode_all(pixels, level as i32)
            .map_err(|e| EncodeError::failed(Encoding::Rgb, format!("zstd encode failed: {e}")))?;
        ("zstd", data)
    } else if params.rgb_zlib {
        let zlib_err = |e: std::io::Error| EncodeError::failed(Encoding::Rgb, format!("zlib encode failed: {e}"));
        let mut enc = ZlibEncoder::new(Vec::with_capacity(pixels.len() / 2), Compression::new(level));
        enc.write_all(pixels).map_err(zlib_err)?;
        ("zlib", enc.finish().map_err(zlib_err)?)
    } else {
        return Ok(None);
    };
    if data.len() + MIN_SAVING >= pixels.len() {
        return Ok(None);
    }
    Ok(Some((algo, data)))
}

// ── Reformatting ─────────────────────────────────────────────────

/// Convert `image` to the best layout in `accepted`.
///
/// Alpha is kept only when the source has it and the client paints it.
pub fn reformat(
    image: &ImageWrapper,
    accepted: &[PixelFormat],
    transparency: bool,
) -> Option<ImageWrapper> {
    let keep_alpha = transparency && image.format.has_alpha();
    let order: &[PixelFormat] = if keep_alpha {
        &[PixelFormat::Rgba, PixelFormat::Bgra]
    } else {
        &[
            PixelFormat::Rgb,
            PixelFormat::Bgr,
            PixelFormat::Rgbx,
            PixelFormat::Bgrx,
            PixelFormat::Rgba,
            PixelFormat::Bgra,
        ]
    };
    let target = *order.iter().find(|f| accepted.contains(f))?;
    Some(convert(image, target))
}

/// Channel-by-channel conversion, padding bytes become `0xff`.
pub fn convert(image: &ImageWrapper, target: PixelFormat) -> ImageWrapper {
    let (sr, sg, sb, sa) = image.format.channel_offsets();
    let (tr, tg, tb, ta) = target.channel_offsets();
    let sbpp = image.format.bytes_per_pixel();
    let tbpp = target.bytes_per_pixel();
    let width = image.rect.width as usize;
    let mut out = Vec::with_capacity(width * tbpp * image.rect.height as usize);
    let mut px = [0u8; 4];
    for y in 0..image.rect.height {
        for src in image.row(y).chunks_exact(sbpp) {
            px[..tbpp].fill(0xff);
            px[tr] = src[sr];
            px[tg] = src[sg];
            px[tb] = src[sb];
            if let (Some(ta), Some(sa)) = (ta, sa) {
                px[ta] = src[sa];
            }
            out.extend_from_slice(&px[..tbpp]);
        }
    }
    ImageWrapper::new(image.rect, (width * tbpp) as u32, target, out)
}

// ── Tests ────────────────────────────────────────────────────────
