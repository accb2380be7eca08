//! Shared memory ring used instead of inline pixel payloads.
//!
//! Layout of the area:
//!
//! ```text
//! [ S: u32 LE | E: u32 LE | data .................................. ]
//!   0           4           8                                      size
//! ```
//!
//! `S` is only written by the client and says how far it has read.
//! `E` is only written here and marks the end of the last write.
//! A slot is never reused before the client has moved `S` past it.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::codec::rgb::reformat;
use crate::codec::{EncodeParams, EncodedImage, Encoding};
use crate::error::EncodeError;
use crate::pixels::ImageWrapper;
use crate::wire::{Options, OptionsExt, Payload};

/// Bytes reserved for the two indices.
pub const HEADER_SIZE: usize = 8;

/// Result of one write into the area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MmapWrite {
    /// `(offset, length)` chunks holding the data, in order.
    pub chunks: Vec<(u32, u32)>,
    /// Space left after this write.
    pub free_size: usize,
}

/// A ring buffer shared with the client.
///
/// Cloning gives another handle on the same memory.
#[derive(Debug, Clone)]
pub struct MmapArea {
    area: Arc<Mutex<Vec<u8>>>,
    size: usize,
}

impl MmapArea {
    pub fn new(size: usize) -> Self {
        let size = size.max(HEADER_SIZE * 2);
        Self {
            area: Arc::new(Mutex::new(vec![0; size])),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn index(area: &[u8], at: usize) -> usize {
        u32::from_le_bytes([area[at], area[at + 1], area[at + 2], area[at + 3]]) as usize
    }

    fn set_index(area: &mut [u8], at: usize, value: usize) {
        area[at..at + 4].copy_from_slice(&(value as u32).to_le_bytes());
    }

    /// Where the client has read up to.
    pub fn read_position(&self) -> usize {
        Self::index(&self.area.lock(), 0)
    }

    /// Where the server has written up to.
    pub fn write_position(&self) -> usize {
        Self::index(&self.area.lock(), 4)
    }

    /// Client side: mark everything up to `pos` as consumed.
    pub fn set_read_position(&self, pos: usize) {
        Self::set_index(&mut self.area.lock(), 0, pos.min(self.size));
    }

    /// Client side: copy the data referenced by `chunks`.
    pub fn read(&self, chunks: &[(u32, u32)]) -> Vec<u8> {
        let area = self.area.lock();
        let mut out = Vec::with_capacity(chunks.iter().map(|c| c.1 as usize).sum());
        for &(offset, len) in chunks {
            let (start, end) = (offset as usize, offset as usize + len as usize);
            if end <= area.len() {
                out.extend_from_slice(&area[start..end]);
            }
        }
        out
    }

    /// Write `data` into the ring. Fails when the area would become full.
    pub fn write(&self, data: &[u8]) -> Result<MmapWrite, EncodeError> {
        let mut area = self.area.lock();
        let start = Self::index(&area, 0).max(HEADER_SIZE);
        let end = Self::index(&area, 4).max(HEADER_SIZE);
        let (available, chunk) = if end < start {
            // wrapped around, the client has not: one chunk from E to S
            (start - end, start - end)
        } else {
            // free space from E to the end, then from the header to S
            let chunk = self.size.saturating_sub(end);
            (chunk + (start - HEADER_SIZE), chunk)
        };
        let len = data.len();
        if available <= len {
            return Err(EncodeError::MmapFull {
                needed: len,
                available,
            });
        }

        let chunks = if len < chunk {
            area[end..end + len].copy_from_slice(data);
            Self::set_index(&mut area, 4, end + len);
            vec![(end as u32, len as u32)]
        } else if available >= self.size / 2 && available >= len * 3 && len < start - HEADER_SIZE {
            // plenty of room left: restart at the beginning instead of splitting
            area[HEADER_SIZE..HEADER_SIZE + len].copy_from_slice(data);
            Self::set_index(&mut area, 4, HEADER_SIZE + len);
            vec![(HEADER_SIZE as u32, len as u32)]
        } else {
            let rest = len - chunk;
            area[end..end + chunk].copy_from_slice(&data[..chunk]);
            area[HEADER_SIZE..HEADER_SIZE + rest].copy_from_slice(&data[chunk..]);
            Self::set_index(&mut area, 4, HEADER_SIZE + rest);
            vec![(end as u32, chunk as u32), (HEADER_SIZE as u32, rest as u32)]
        };
        tracing::trace!(?chunks, free = available - len, "mmap write");
        Ok(MmapWrite {
            chunks,
            free_size: available - len,
        })
    }

    /// Write the pixels of `image` and describe them as an mmap packet.
    pub fn encode(
        &self,
        image: &ImageWrapper,
        params: &EncodeParams,
    ) -> Result<(EncodedImage, MmapWrite), EncodeError> {
        let mut image = if params.rgb_formats.contains(&image.format) {
            image.clone()
        } else {
            reformat(image, &params.rgb_formats, params.transparency)
                .ok_or(EncodeError::InvalidImage("no rgb format usable over mmap"))?
        };
        image.restride();
        let written = self.write(&image.pixels)?;
        let mut options = Options::new();
        options.set("rgb_format", image.format.as_str());
        let encoded = EncodedImage {
            encoding: Encoding::Mmap,
            payload: Payload::Mmap(written.chunks.clone()),
            client_options: options,
            width: image.rect.width,
            height: image.rect.height,
            stride: image.stride,
            bpp: 32,
        };
        Ok((encoded, written))
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Rect;
    use crate::pixels::PixelFormat;

    #[test]
    fn first_write_starts_after_header() {
        let area = MmapArea::new(1024);
        let w = area.write(&[7; 100]).unwrap();
        assert_eq!(w.chunks, vec![(8, 100)]);
        assert_eq!(w.free_size, 1024 - 8 - 100);
        assert_eq!(area.write_position(), 108);
        assert_eq!(area.read(&w.chunks), vec![7; 100]);
    }

    #[test]
    fn full_area_is_resource_exhaustion() {
        let area = MmapArea::new(128);
        area.write(&[1; 100]).unwrap();
        let err = area.write(&[2; 100]).unwrap_err();
        assert!(matches!(err, EncodeError::MmapFull { needed: 100, .. }));
    }

    #[test]
    fn restarts_at_header_when_plenty_of_room() {
        let area = MmapArea::new(1024);
        area.write(&[1; 900]).unwrap();
        // client consumed everything
        area.set_read_position(908);
        let w = area.write(&[2; 200]).unwrap();
        assert_eq!(w.chunks, vec![(8, 200)]);
        assert_eq!(area.read(&w.chunks), vec![2; 200]);
    }

    #[test]
    fn splits_across_the_end_of_the_ring() {
        let area = MmapArea::new(1024);
        area.write(&[1; 900]).unwrap();
        area.set_read_position(300);
        // 116 bytes at the end, 292 bytes before S: not enough to restart
        let data: Vec<u8> = (0..200u32).map(|i| i as u8).collect();
        let w = area.write(&data).unwrap();
        assert_eq!(w.chunks, vec![(908, 116), (8, 84)]);
        assert_eq!(area.read(&w.chunks), data);
        assert_eq!(area.write_position(), 92);
    }

    #[test]
    fn wrapped_writer_waits_for_reader() {
        let area = MmapArea::new(1024);
        area.write(&[1; 900]).unwrap();
        area.set_read_position(300);
        area.write(&[2; 200]).unwrap();
        // E=92 < S=300, only 208 bytes between them
        assert!(area.write(&[3; 208]).is_err());
        assert_eq!(area.write(&[3; 100]).unwrap().chunks, vec![(92, 100)]);
    }

    #[test]
    fn encode_describes_chunks() {
        let area = MmapArea::new(4096);
        let img = ImageWrapper::new(Rect::new(0, 0, 4, 4), 16, PixelFormat::Bgrx, vec![5; 64]);
        let (enc, written) = area.encode(&img, &EncodeParams::default()).unwrap();
        assert_eq!(enc.encoding, Encoding::Mmap);
        assert_eq!(enc.payload, Payload::Mmap(vec![(8, 64)]));
        assert_eq!(written.free_size, 4096 - 8 - 64);
    }
}
