//! Still-image encoders backed by the `image` crate.

use bytes::Bytes;
use image::ExtendedColorType;
use image::ImageEncoder as _;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};

use crate::codec::rgb::convert;
use crate::codec::{EncodeParams, EncodedImage, Encoder, Encoding};
use crate::error::EncodeError;
use crate::pixels::{ImageWrapper, PixelFormat};
use crate::wire::{Options, OptionsExt, Payload};

#[derive(Debug, Default)]
pub struct PictureEncoder;

impl PictureEncoder {
    pub fn new() -> Self {
        Self
    }
}

impl Encoder for PictureEncoder {
    fn name(&self) -> &'static str {
        "image"
    }

    fn encodings(&self) -> &[Encoding] {
        &[Encoding::Png, Encoding::PngP, Encoding::PngL, Encoding::Jpeg]
    }

    fn encode(
        &self,
        encoding: Encoding,
        image: &ImageWrapper,
        params: &EncodeParams,
    ) -> Result<EncodedImage, EncodeError> {
        let alpha = params.transparency && image.format.has_alpha();
        let mut options = Options::new();
        let (data, color, bpp) = match encoding {
            Encoding::Png => {
                let (pixels, color, bpp) = if alpha {
                    (convert(image, PixelFormat::Rgba).pixels, ExtendedColorType::Rgba8, 32)
                } else {
                    (convert(image, PixelFormat::Rgb).pixels, ExtendedColorType::Rgb8, 24)
                };
                (pixels, color, bpp)
            }
            Encoding::PngP => {
                let target = if alpha { PixelFormat::Rgba } else { PixelFormat::Rgb };
                let mut pixels = convert(image, target).pixels;
                reduce_to_332(&mut pixels, target.bytes_per_pixel());
                let color = if alpha { ExtendedColorType::Rgba8 } else { ExtendedColorType::Rgb8 };
                (pixels, color, 8)
            }
            Encoding::PngL => (luma(image), ExtendedColorType::L8, 8),
            Encoding::Jpeg => {
                let quality = params.quality.clamp(1, 100);
                options.set("quality", quality);
                (convert(image, PixelFormat::Rgb).pixels, ExtendedColorType::Rgb8, 24)
            }
            other => return Err(EncodeError::NoEncoder(other)),
        };

        let (w, h) = (image.width(), image.height());
        let mut out = Vec::with_capacity(data.len() / 4);
        if encoding == Encoding::Jpeg {
            JpegEncoder::new_with_quality(&mut out, params.quality.clamp(1, 100))
                .encode(&data, w, h, color)
                .map_err(|e| EncodeError::failed(encoding, e))?;
        } else {
            PngEncoder::new_with_quality(&mut out, png_compression(params.speed), FilterType::Adaptive)
                .write_image(&data, w, h, color)
                .map_err(|e| EncodeError::failed(encoding, e))?;
        }
        if alpha && encoding != Encoding::Jpeg && encoding != Encoding::PngL {
            options.set("has_alpha", true);
        }

        Ok(EncodedImage {
            encoding,
            payload: Payload::Compressed(Bytes::from(out)),
            client_options: options,
            width: w,
            height: h,
            stride: 0,
            bpp,
        })
    }
}

fn png_compression(speed: u8) -> CompressionType {
    match speed {
        0..=20 => CompressionType::Best,
        21..=79 => CompressionType::Default,
        _ => CompressionType::Fast,
    }
}

/// Keep 3 bits of red and green and 2 bits of blue.
fn reduce_to_332(pixels: &mut [u8], bpp: usize) {
    for px in pixels.chunks_exact_mut(bpp) {
        px[0] &= 0xe0;
        px[1] &= 0xe0;
        px[2] &= 0xc0;
    }
}

fn luma(image: &ImageWrapper) -> Vec<u8> {
    let (r, g, b, _) = image.format.channel_offsets();
    let bpp = image.format.bytes_per_pixel();
    let mut out = Vec::with_capacity(image.width() as usize * image.height() as usize);
    for y in 0..image.height() {
        for px in image.row(y).chunks_exact(bpp) {
            let l = (u32::from(px[r]) * 299 + u32::from(px[g]) * 587 + u32::from(px[b]) * 114) / 1000;
            out.push(l as u8);
        }
    }
    out
}

// ── Tests ────────────────────────────────────────────────────────
