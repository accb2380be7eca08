//! Rectangle arithmetic for damage regions.
//!
//! A damage region is kept as a list of rectangles. Adding a rectangle
//! never loses geometry: it is only skipped when an existing rectangle
//! already covers it.

use serde::{Deserialize, Serialize};

// ── Rect ─────────────────────────────────────────────────────────

/// An axis-aligned rectangle in window coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rect {
    /// Left edge in pixels.
    pub x: u32,
    /// Top edge in pixels.
    pub y: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Rect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// The rectangle covering a whole `width × height` window.
    pub const fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    /// Number of pixels covered.
    pub const fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Exclusive right edge.
    pub const fn right(&self) -> u32 {
        self.x.saturating_add(self.width)
    }

    /// Exclusive bottom edge.
    pub const fn bottom(&self) -> u32 {
        self.y.saturating_add(self.height)
    }

    /// Whether `other` lies entirely inside `self`.
    pub fn contains(&self, other: &Rect) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.x < other.right()
            && other.x < self.right()
            && self.y < other.bottom()
            && other.y < self.bottom()
    }

    pub fn intersection(&self, other: &Rect) -> Option<Rect> {
        if !self.intersects(other) {
            return None;
        }
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        Some(Rect::new(x, y, right - x, bottom - y))
    }

    /// Smallest rectangle covering both.
    pub fn merge(&self, other: &Rect) -> Rect {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        let right = self.right().max(other.right());
        let bottom = self.bottom().max(other.bottom());
        Rect::new(x, y, right - x, bottom - y)
    }

    /// Clip to a `width × height` window, `None` if nothing is left.
    pub fn clip(&self, width: u32, height: u32) -> Option<Rect> {
        self.intersection(&Rect::full(width, height))
    }

    /// The parts of `self` not covered by `other` (at most four bands).
    pub fn subtract(&self, other: &Rect) -> Vec<Rect> {
        let Some(inner) = self.intersection(other) else {
            return vec![*self];
        };
        let mut out = Vec::with_capacity(4);
        // top band
        if inner.y > self.y {
            out.push(Rect::new(self.x, self.y, self.width, inner.y - self.y));
        }
        // bottom band
        if inner.bottom() < self.bottom() {
            out.push(Rect::new(
                self.x,
                inner.bottom(),
                self.width,
                self.bottom() - inner.bottom(),
            ));
        }
        // left and right bands, limited to the rows of the intersection
        if inner.x > self.x {
            out.push(Rect::new(self.x, inner.y, inner.x - self.x, inner.height));
        }
        if inner.right() < self.right() {
            out.push(Rect::new(
                inner.right(),
                inner.y,
                self.right() - inner.right(),
                inner.height,
            ));
        }
        out
    }
}

impl std::fmt::Display for Rect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}+{}+{}", self.width, self.height, self.x, self.y)
    }
}

// ── Region lists ─────────────────────────────────────────────────

/// Add `rect` to `regions`, dropping rectangles it fully covers.
///
/// Returns `false` when an existing rectangle already covers `rect`
/// and the list was left unchanged.
pub fn add_rectangle(regions: &mut Vec<Rect>, rect: Rect) -> bool {
    if rect.is_empty() {
        return false;
    }
    if regions.iter().any(|r| r.contains(&rect)) {
        return false;
    }
    regions.retain(|r| !rect.contains(r));
    regions.push(rect);
    true
}

/// Remove the area of `rect` from every rectangle in `regions`.
pub fn remove_rectangle(regions: &mut Vec<Rect>, rect: Rect) {
    let mut out = Vec::with_capacity(regions.len());
    for r in regions.drain(..) {
        if r.intersects(&rect) {
            out.extend(r.subtract(&rect));
        } else {
            out.push(r);
        }
    }
    *regions = out;
}

/// Bounding box of all rectangles.
pub fn merge_all(regions: &[Rect]) -> Option<Rect> {
    let mut iter = regions.iter().filter(|r| !r.is_empty());
    let first = *iter.next()?;
    Some(iter.fold(first, |acc, r| acc.merge(r)))
}

/// Total pixel count of a rectangle list (overlaps counted twice).
pub fn pixel_count(regions: &[Rect]) -> u64 {
    regions.iter().map(Rect::area).sum()
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_and_intersects() {
        let outer = Rect::new(0, 0, 100, 100);
        let inner = Rect::new(10, 10, 20, 20);
        assert!(outer.contains(&inner));
        assert!(!inner.contains(&outer));
        assert!(outer.intersects(&inner));
        assert!(!Rect::new(0, 0, 10, 10).intersects(&Rect::new(10, 0, 10, 10)));
    }

    #[test]
    fn merge_is_bounding_box() {
        let a = Rect::new(0, 0, 10, 10);
        let b = Rect::new(20, 30, 5, 5);
        assert_eq!(a.merge(&b), Rect::new(0, 0, 25, 35));
    }

    #[test]
    fn subtract_center_leaves_four_bands() {
        let outer = Rect::new(0, 0, 30, 30);
        let hole = Rect::new(10, 10, 10, 10);
        let parts = outer.subtract(&hole);
        assert_eq!(parts.len(), 4);
        assert_eq!(pixel_count(&parts), 900 - 100);
        assert!(parts.iter().all(|p| !p.intersects(&hole)));
    }

    #[test]
    fn subtract_disjoint_is_identity() {
        let a = Rect::new(0, 0, 10, 10);
        assert_eq!(a.subtract(&Rect::new(50, 50, 1, 1)), vec![a]);
    }

    #[test]
    fn add_same_rectangle_twice_is_idempotent() {
        let mut once = Vec::new();
        add_rectangle(&mut once, Rect::new(0, 0, 10, 10));
        let mut twice = once.clone();
        assert!(!add_rectangle(&mut twice, Rect::new(0, 0, 10, 10)));
        assert_eq!(once, twice);
    }

    #[test]
    fn add_covering_rectangle_replaces_contained_ones() {
        let mut regions = vec![Rect::new(0, 0, 5, 5), Rect::new(10, 10, 5, 5)];
        add_rectangle(&mut regions, Rect::new(0, 0, 20, 20));
        assert_eq!(regions, vec![Rect::new(0, 0, 20, 20)]);
    }

    #[test]
    fn add_overlapping_rectangle_keeps_both() {
        let mut regions = vec![Rect::new(0, 0, 10, 10)];
        add_rectangle(&mut regions, Rect::new(5, 5, 10, 10));
        assert_eq!(regions.len(), 2);
    }

    #[test]
    fn remove_rectangle_clears_covered_area() {
        let mut regions = vec![Rect::new(0, 0, 10, 10), Rect::new(50, 50, 10, 10)];
        remove_rectangle(&mut regions, Rect::new(0, 0, 10, 10));
        assert_eq!(regions, vec![Rect::new(50, 50, 10, 10)]);
    }

    #[test]
    fn clip_to_window() {
        let r = Rect::new(90, 90, 20, 20);
        assert_eq!(r.clip(100, 100), Some(Rect::new(90, 90, 10, 10)));
        assert_eq!(Rect::new(200, 0, 5, 5).clip(100, 100), None);
    }
}
