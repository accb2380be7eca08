//! Synthetic animated window.
//!
//! A grey background with a coloured bar sweeping left to right. Each
//! [`PatternWindow::advance`] repaints the bar one step further and
//! returns the rectangles that changed, which is exactly what a real
//! window system would report as damage.

use winstream_core::{ImageWrapper, MemoryWindow, Rect, WindowFlags, WindowModel};

const BACKGROUND: [u8; 4] = [0x40, 0x40, 0x40, 0xff];

/// Bar colours, cycled once per sweep.
const PALETTE: [[u8; 4]; 4] = [
    [0x20, 0x60, 0xe0, 0xff],
    [0x30, 0xc0, 0x30, 0xff],
    [0xe0, 0x40, 0x20, 0xff],
    [0xe0, 0xe0, 0xe0, 0xff],
];

#[derive(Debug)]
pub struct PatternWindow {
    surface: MemoryWindow,
    bar_width: u32,
    step: u32,
    state: parking_lot::Mutex<Sweep>,
}

#[derive(Debug, Default)]
struct Sweep {
    x: u32,
    pass: usize,
}

impl PatternWindow {
    pub fn new(width: u32, height: u32) -> Self {
        let width = width.max(1);
        let height = height.max(1);
        let surface = MemoryWindow::new(width, height, WindowFlags::empty());
        surface.fill(Rect::new(0, 0, width, height), BACKGROUND);
        let bar_width = (width / 8).max(1);
        let this = Self {
            surface,
            bar_width,
            step: (bar_width / 2).max(1),
            state: parking_lot::Mutex::new(Sweep::default()),
        };
        this.paint_bar(0, PALETTE[0]);
        this
    }

    /// The whole window, for the first full frame.
    pub fn bounds(&self) -> Rect {
        let (width, height) = self.surface.dimensions();
        Rect::new(0, 0, width, height)
    }

    /// Move the bar one step. Returns the damaged rectangles.
    pub fn advance(&self) -> Vec<Rect> {
        let (width, _) = self.surface.dimensions();
        let mut state = self.state.lock();
        let old = self.bar_at(state.x);
        self.surface.fill(old, BACKGROUND);

        state.x += self.step;
        if state.x >= width {
            state.x = 0;
            state.pass = (state.pass + 1) % PALETTE.len();
        }
        let new = self.paint_bar(state.x, PALETTE[state.pass]);

        match old.merge(&new) {
            merged if merged.area() <= old.area() + new.area() => vec![merged],
            _ => vec![old, new],
        }
    }

    fn bar_at(&self, x: u32) -> Rect {
        let (width, height) = self.surface.dimensions();
        Rect::new(x, 0, self.bar_width.min(width - x), height)
    }

    fn paint_bar(&self, x: u32, colour: [u8; 4]) -> Rect {
        let bar = self.bar_at(x);
        self.surface.fill(bar, colour);
        bar
    }
}

impl WindowModel for PatternWindow {
    fn dimensions(&self) -> (u32, u32) {
        self.surface.dimensions()
    }

    fn flags(&self) -> WindowFlags {
        self.surface.flags()
    }

    fn is_managed(&self) -> bool {
        self.surface.is_managed()
    }

    fn acknowledge_changes(&self) {
        self.surface.acknowledge_changes();
    }

    fn get_image(&self, rect: Rect) -> Option<ImageWrapper> {
        self.surface.get_image(rect)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn pixel(window: &PatternWindow, x: u32, y: u32) -> Vec<u8> {
        let image = window.get_image(Rect::new(x, y, 1, 1)).unwrap();
        image.pixels[..4].to_vec()
    }

    #[test]
    fn first_frame_has_bar_on_the_left() {
        let w = PatternWindow::new(80, 20);
        assert_eq!(pixel(&w, 0, 0)[..3], PALETTE[0][..3]);
        assert_eq!(pixel(&w, 50, 10)[..3], BACKGROUND[..3]);
    }

    #[test]
    fn advance_damages_old_and_new_bar() {
        let w = PatternWindow::new(80, 20);
        let damage = w.advance();
        // bar is 10 wide, steps by 5
        assert_eq!(damage, vec![Rect::new(0, 0, 15, 20)]);
        assert_eq!(pixel(&w, 0, 0)[..3], BACKGROUND[..3]);
        assert_eq!(pixel(&w, 5, 0)[..3], PALETTE[0][..3]);
    }

    #[test]
    fn wraps_around_and_changes_colour() {
        let w = PatternWindow::new(80, 20);
        for _ in 0..16 {
            w.advance();
        }
        assert_eq!(pixel(&w, 0, 0)[..3], PALETTE[1][..3]);
        for rect in w.advance() {
            assert!(rect.right() <= 80);
        }
    }
}
