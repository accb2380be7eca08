//! The window model seen by the pipeline.
//!
//! Damage detection and pixel capture live outside this crate. The
//! pipeline only needs the small [`WindowModel`] surface; [`MemoryWindow`]
//! is an in-memory implementation used by the server's synthetic
//! windows and by tests.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::flags::WindowFlags;
use crate::geometry::Rect;
use crate::pixels::{ImageWrapper, PixelFormat};

// ── WindowModel ──────────────────────────────────────────────────

/// One window of the source system.
pub trait WindowModel: Send + Sync {
    /// Current `(width, height)`.
    fn dimensions(&self) -> (u32, u32);

    fn flags(&self) -> WindowFlags;

    /// `false` once the window has been unmapped or destroyed.
    fn is_managed(&self) -> bool;

    /// Tell the source system the current damage is being handled.
    /// Called before pixels are extracted.
    fn acknowledge_changes(&self);

    /// Snapshot exactly `rect`, `None` if the pixels are not available.
    fn get_image(&self, rect: Rect) -> Option<ImageWrapper>;
}

/// Window state changes forwarded by the window model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowProperty {
    Fullscreen(bool),
    Maximized(bool),
    Iconic(bool),
    Resized { width: u32, height: u32 },
}

// ── MemoryWindow ─────────────────────────────────────────────────

/// A window whose pixels live in a plain buffer.
#[derive(Debug)]
pub struct MemoryWindow {
    flags: WindowFlags,
    format: PixelFormat,
    inner: RwLock<Surface>,
    managed: AtomicBool,
    acks: AtomicU64,
}

#[derive(Debug)]
struct Surface {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl Surface {
    fn new(width: u32, height: u32, bpp: usize) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; width as usize * height as usize * bpp],
        }
    }
}

impl MemoryWindow {
    pub fn new(width: u32, height: u32, flags: WindowFlags) -> Self {
        let format = if flags.has_alpha() {
            PixelFormat::Bgra
        } else {
            PixelFormat::Bgrx
        };
        Self {
            flags,
            format,
            inner: RwLock::new(Surface::new(width, height, format.bytes_per_pixel())),
            managed: AtomicBool::new(true),
            acks: AtomicU64::new(0),
        }
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Fill `rect` with one 4-byte pixel value, clipped to the window.
    pub fn fill(&self, rect: Rect, pixel: [u8; 4]) {
        let mut s = self.inner.write();
        let Some(rect) = rect.clip(s.width, s.height) else {
            return;
        };
        let bpp = self.format.bytes_per_pixel();
        let stride = s.width as usize * bpp;
        for y in rect.y..rect.bottom() {
            let row = y as usize * stride;
            for x in rect.x..rect.right() {
                let at = row + x as usize * bpp;
                s.pixels[at..at + bpp].copy_from_slice(&pixel[..bpp]);
            }
        }
    }

    /// Resize, clearing the contents.
    pub fn resize(&self, width: u32, height: u32) {
        *self.inner.write() = Surface::new(width, height, self.format.bytes_per_pixel());
    }

    pub fn unmanage(&self) {
        self.managed.store(false, Ordering::Release);
    }

    /// Number of `acknowledge_changes` calls so far.
    pub fn ack_count(&self) -> u64 {
        self.acks.load(Ordering::Relaxed)
    }
}

impl WindowModel for MemoryWindow {
    fn dimensions(&self) -> (u32, u32) {
        let s = self.inner.read();
        (s.width, s.height)
    }

    fn flags(&self) -> WindowFlags {
        self.flags
    }

    fn is_managed(&self) -> bool {
        self.managed.load(Ordering::Acquire)
    }

    fn acknowledge_changes(&self) {
        self.acks.fetch_add(1, Ordering::Relaxed);
    }

    fn get_image(&self, rect: Rect) -> Option<ImageWrapper> {
        if !self.is_managed() {
            return None;
        }
        let s = self.inner.read();
        let rect = rect.clip(s.width, s.height)?;
        let bpp = self.format.bytes_per_pixel();
        let src_stride = s.width as usize * bpp;
        let row_bytes = rect.width as usize * bpp;
        let mut pixels = Vec::with_capacity(row_bytes * rect.height as usize);
        for y in rect.y..rect.bottom() {
            let at = y as usize * src_stride + rect.x as usize * bpp;
            pixels.extend_from_slice(&s.pixels[at..at + row_bytes]);
        }
        Some(ImageWrapper::new(rect, row_bytes as u32, self.format, pixels))
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_is_exactly_the_region() {
        let w = MemoryWindow::new(10, 10, WindowFlags::empty());
        w.fill(Rect::new(2, 2, 3, 3), [1, 2, 3, 4]);
        let img = w.get_image(Rect::new(2, 2, 3, 3)).unwrap();
        assert_eq!(img.rect, Rect::new(2, 2, 3, 3));
        assert_eq!(img.stride, 12);
        assert!(img.pixels.chunks(4).all(|p| p == [1, 2, 3, 4]));
    }

    #[test]
    fn snapshot_is_clipped() {
        let w = MemoryWindow::new(10, 10, WindowFlags::empty());
        let img = w.get_image(Rect::new(8, 8, 10, 10)).unwrap();
        assert_eq!(img.rect, Rect::new(8, 8, 2, 2));
        assert!(w.get_image(Rect::new(20, 20, 1, 1)).is_none());
    }

    #[test]
    fn unmanaged_window_has_no_pixels() {
        let w = MemoryWindow::new(4, 4, WindowFlags::HAS_ALPHA);
        assert_eq!(w.format(), PixelFormat::Bgra);
        w.unmanage();
        assert!(!w.is_managed());
        assert!(w.get_image(Rect::full(4, 4)).is_none());
    }
}
