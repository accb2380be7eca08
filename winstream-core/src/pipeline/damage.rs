//! Region accumulator: per damage options and the delayed region.

use std::time::Instant;

use crate::codec::Encoding;
use crate::geometry::{self, Rect};

/// Options attached to one damage request.
///
/// `None` means "use the window's current setting".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DamageOptions {
    pub quality: Option<u8>,
    pub speed: Option<u8>,
    pub encoding: Option<Encoding>,
    /// Batch delay for this request, ms.
    pub delay: Option<u32>,
    pub min_delay: Option<u32>,
    pub max_delay: Option<u32>,
    pub auto_refresh: bool,
    pub optimize: Option<bool>,
    /// Force every region of a flush to use `encoding`.
    pub force_encoding: bool,
    /// When merged into an existing delayed region, replace its values
    /// instead of only filling the gaps.
    pub override_options: bool,
}

impl DamageOptions {
    /// Options of a lossless refresh.
    pub fn refresh(quality: u8, speed: u8) -> Self {
        Self {
            quality: Some(quality),
            speed: Some(speed),
            auto_refresh: true,
            optimize: Some(false),
            ..Default::default()
        }
    }

    /// Merge `other` into `self`: fill the gaps, or override when
    /// `other.override_options` is set.
    pub fn merge(&mut self, other: &DamageOptions) {
        fn pick<T: Copy>(mine: &mut Option<T>, theirs: Option<T>, replace: bool) {
            if theirs.is_some() && (replace || mine.is_none()) {
                *mine = theirs;
            }
        }
        let replace = other.override_options;
        pick(&mut self.quality, other.quality, replace);
        pick(&mut self.speed, other.speed, replace);
        pick(&mut self.encoding, other.encoding, replace);
        pick(&mut self.delay, other.delay, replace);
        pick(&mut self.min_delay, other.min_delay, replace);
        pick(&mut self.max_delay, other.max_delay, replace);
        pick(&mut self.optimize, other.optimize, replace);
        if replace {
            self.auto_refresh = other.auto_refresh;
            self.force_encoding = other.force_encoding;
        } else {
            self.auto_refresh |= other.auto_refresh;
            self.force_encoding |= other.force_encoding;
        }
    }
}

/// Damage waiting for its batch delay to expire.
#[derive(Debug, Clone, PartialEq)]
pub struct DelayedRegion {
    pub created: Instant,
    pub regions: Vec<Rect>,
    pub encoding: Encoding,
    pub options: DamageOptions,
    /// The batch delay has elapsed, the region goes out at the next chance.
    pub expired: bool,
}

impl DelayedRegion {
    pub fn new(created: Instant, rect: Rect, encoding: Encoding, options: DamageOptions) -> Self {
        let mut regions = Vec::with_capacity(4);
        geometry::add_rectangle(&mut regions, rect);
        Self {
            created,
            regions,
            encoding,
            options,
            expired: false,
        }
    }

    /// Accumulate one more rectangle. Covered rectangles are no-ops.
    pub fn add(&mut self, rect: Rect) {
        geometry::add_rectangle(&mut self.regions, rect);
    }

    pub fn pixel_count(&self) -> u64 {
        geometry::pixel_count(&self.regions)
    }
}

// ── Tests ────────────────────────────────────────────────────────
