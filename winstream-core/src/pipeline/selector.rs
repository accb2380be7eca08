//! Encoding selector.
//!
//! The common encodings are negotiated once (registry ∩ client), then a
//! [`Strategy`] is picked from the window properties whenever the
//! encoding, speed or quality changes. [`EncodingSelector::best_encoding`]
//! runs the strategy for each region. [`plan_flush`] decides how a
//! delayed region is cut into packets.

use crate::codec::{CodecRegistry, Encoding};
use crate::config::RegionsSection;
use crate::error::StreamError;
use crate::flags::WindowFlags;
use crate::geometry::{self, Rect};

/// Refresh encodings the client gets when it does not list its own.
pub const DEFAULT_REFRESH_ENCODINGS: [Encoding; 5] = [
    Encoding::Png,
    Encoding::Webp,
    Encoding::Rgb24,
    Encoding::Rgb32,
    Encoding::Jpeg,
];

/// How [`EncodingSelector::best_encoding`] chooses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Mmap,
    /// Always this encoding.
    Fixed(Encoding),
    /// Lossless with alpha, for tray icons.
    Lossless,
    /// Any encoding with an alpha channel.
    Transparent,
    /// The current encoding, or rgb for small regions.
    CurrentOrRgb,
}

#[derive(Debug, Clone)]
pub struct EncodingSelector {
    /// Primary encoding of the window.
    pub encoding: Encoding,
    /// Encodings both sides support, in preference order.
    pub common: Vec<Encoding>,
    /// Lossless encodings usable for auto-refresh, client order.
    pub auto_refresh: Vec<Encoding>,
    pub strict: bool,
    pub want_alpha: bool,
    /// Regions smaller than this go out as rgb.
    pub rgb_auto_threshold: u64,
    pub full_frames_only: bool,
    strategy: Strategy,
    server_encodings: Vec<Encoding>,
    whole_frame: Vec<Encoding>,
    max_pixels_prefer_rgb: u64,
}

impl EncodingSelector {
    /// Negotiate with the client. Fails when nothing is common.
    pub fn new(
        registry: &CodecRegistry,
        core_encodings: &[Encoding],
        refresh_encodings: &[Encoding],
        requested: Option<Encoding>,
        strict: bool,
        max_pixels_prefer_rgb: u64,
    ) -> Result<Self, StreamError> {
        let server_encodings = registry.encodings();
        let whole_frame = server_encodings
            .iter()
            .copied()
            .filter(|e| registry.is_whole_frame_only(*e))
            .collect();
        let mut selector = Self {
            encoding: Encoding::Png,
            common: Vec::new(),
            auto_refresh: Vec::new(),
            strict,
            want_alpha: false,
            rgb_auto_threshold: max_pixels_prefer_rgb,
            full_frames_only: false,
            strategy: Strategy::CurrentOrRgb,
            server_encodings,
            whole_frame,
            max_pixels_prefer_rgb,
        };
        selector.update_selection(core_encodings, refresh_encodings, requested)?;
        Ok(selector)
    }

    /// Recompute the common encodings and the primary one.
    ///
    /// A requested encoding that is not common falls back to the first
    /// common encoding.
    pub fn update_selection(
        &mut self,
        core_encodings: &[Encoding],
        refresh_encodings: &[Encoding],
        requested: Option<Encoding>,
    ) -> Result<(), StreamError> {
        let mut common: Vec<Encoding> = self
            .server_encodings
            .iter()
            .copied()
            .filter(|e| *e != Encoding::Rgb && core_encodings.contains(e))
            .collect();
        if common.contains(&Encoding::Rgb24) || common.contains(&Encoding::Rgb32) {
            common.push(Encoding::Rgb);
        }
        self.common = Encoding::PREFERRED
            .into_iter()
            .filter(|e| common.contains(e))
            .collect();
        let Some(&first) = self.common.first() else {
            return Err(StreamError::NoCommonEncodings {
                server: join(&self.server_encodings),
                client: join(core_encodings),
            });
        };
        self.encoding = match requested {
            Some(e) if self.common.contains(&e) => e,
            Some(e) => {
                tracing::debug!(requested = %e, fallback = %first, "encoding not supported");
                first
            }
            None => first,
        };
        let refresh: &[Encoding] = if refresh_encodings.is_empty() {
            &DEFAULT_REFRESH_ENCODINGS
        } else {
            refresh_encodings
        };
        self.auto_refresh = refresh
            .iter()
            .copied()
            .filter(|e| e.is_lossless() || refresh_encodings.contains(e))
            .filter(|e| self.common.contains(e))
            .collect();
        tracing::debug!(
            encoding = %self.encoding,
            common = %join(&self.common),
            auto_refresh = %join(&self.auto_refresh),
            "encoding selection updated"
        );
        Ok(())
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Pick the strategy for the current window properties and speed/quality.
    pub fn update_options(&mut self, flags: WindowFlags, transparency: bool, mmap: bool, speed: u8, quality: u8) {
        self.want_alpha = flags.is_tray() || (flags.has_alpha() && transparency);
        let smult = ((f64::from(speed) - 50.0) / 5.0).max(0.25);
        let qmult = (f64::from(quality) / 20.0).max(0.0);
        let boost = if flags.is_override_redirect() || flags.is_tray() || flags.is_shadow() {
            3.0
        } else {
            1.0
        };
        self.rgb_auto_threshold = (self.max_pixels_prefer_rgb as f64 * smult * qmult * boost) as u64;
        self.strategy = self.pick_strategy(flags, mmap);
        tracing::trace!(strategy = ?self.strategy, want_alpha = self.want_alpha, rgb_threshold = self.rgb_auto_threshold, "encoding options");
    }

    fn has(&self, e: Encoding) -> bool {
        self.common.contains(&e)
    }

    fn pick_strategy(&self, flags: WindowFlags, mmap: bool) -> Strategy {
        let enc = self.encoding;
        if mmap {
            return Strategy::Mmap;
        }
        if flags.is_tray() && !self.strict && (self.has(Encoding::Rgb32) || self.has(Encoding::Png)) {
            return Strategy::Lossless;
        }
        if enc == Encoding::PngL {
            return Strategy::Fixed(enc);
        }
        if self.strict {
            if enc == Encoding::Rgb {
                if self.want_alpha && self.has(Encoding::Rgb32) {
                    return Strategy::Fixed(Encoding::Rgb32);
                }
                return Strategy::Fixed(Encoding::Rgb24);
            }
            return Strategy::Fixed(enc);
        }
        if self.want_alpha {
            if matches!(enc, Encoding::Rgb | Encoding::Rgb32) && self.has(Encoding::Rgb32) {
                return Strategy::Fixed(Encoding::Rgb32);
            }
            if matches!(enc, Encoding::Png | Encoding::Webp | Encoding::PngP) {
                // the same encoder for every update keeps alpha consistent
                return Strategy::Fixed(enc);
            }
            return Strategy::Transparent;
        }
        if enc == Encoding::Rgb {
            if self.has(Encoding::Rgb24) {
                return Strategy::Fixed(Encoding::Rgb24);
            }
            if self.has(Encoding::Rgb32) {
                return Strategy::Fixed(Encoding::Rgb32);
            }
        }
        Strategy::CurrentOrRgb
    }

    /// Encoding for a region of `pixel_count` pixels.
    pub fn best_encoding(&self, pixel_count: u64, speed: u8, quality: u8, current: Encoding) -> Encoding {
        match self.strategy {
            Strategy::Mmap => Encoding::Mmap,
            Strategy::Fixed(e) => e,
            Strategy::Lossless => self.lossless_encoding(),
            Strategy::Transparent => self.transparent_encoding(pixel_count, speed, quality),
            Strategy::CurrentOrRgb => {
                if pixel_count < self.rgb_auto_threshold && self.has(Encoding::Rgb24) {
                    Encoding::Rgb24
                } else {
                    current
                }
            }
        }
    }

    fn lossless_encoding(&self) -> Encoding {
        [Encoding::Rgb32, Encoding::Png]
            .into_iter()
            .find(|e| self.has(*e))
            .or_else(|| {
                self.common
                    .iter()
                    .copied()
                    .find(|e| e.is_lossless() && e.supports_alpha())
            })
            .unwrap_or(self.encoding)
    }

    fn transparent_encoding(&self, pixel_count: u64, speed: u8, quality: u8) -> Encoding {
        let (s, q) = (u64::from(speed), u64::from(quality));
        if self.has(Encoding::Rgb32) && (pixel_count < self.rgb_auto_threshold || (q >= 90 && s >= 90)) {
            return Encoding::Rgb32;
        }
        if self.has(Encoding::Webp) {
            let max_webp = 1024 * 1024 * (200 - q.min(100)) / 100 * s / 100;
            if 16384 < pixel_count && pixel_count < max_webp {
                return Encoding::Webp;
            }
        }
        if self.has(Encoding::Png) && q > 75 {
            return Encoding::Png;
        }
        [Encoding::Rgb32, Encoding::Png, Encoding::Webp]
            .into_iter()
            .find(|e| self.has(*e))
            .unwrap_or(self.common[0])
    }

    /// Whether `encoding` always needs the whole window.
    pub fn must_encode_full_frame(&self, encoding: Encoding) -> bool {
        self.full_frames_only || self.whole_frame.contains(&encoding)
    }
}

fn join(encodings: &[Encoding]) -> String {
    encodings
        .iter()
        .map(|e| e.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

// ── Flush planning ───────────────────────────────────────────────

/// One packet of a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedRegion {
    pub rect: Rect,
    pub encoding: Encoding,
    /// Packets still to come after this one, `0` for the last.
    pub flush: usize,
}

/// Inputs of [`plan_flush`].
#[derive(Debug, Clone, Copy)]
pub struct FlushContext {
    pub dimensions: (u32, u32),
    pub speed: u8,
    pub quality: u8,
    pub mmap: bool,
    /// Use `encoding` for every region, bypassing the selector.
    pub force_encoding: bool,
}

/// Cut a delayed region into packets, in sending order.
pub fn plan_flush(
    selector: &EncodingSelector,
    regions: &[Rect],
    encoding: Encoding,
    ctx: FlushContext,
    cfg: &RegionsSection,
) -> Vec<PlannedRegion> {
    let (ww, wh) = ctx.dimensions;
    let window = Rect::full(ww, wh);
    let window_pixels = window.area();
    let pick = |pixels: u64| {
        if ctx.force_encoding {
            encoding
        } else {
            selector.best_encoding(pixels, ctx.speed, ctx.quality, encoding)
        }
    };
    let full = |enc: Encoding| {
        vec![PlannedRegion {
            rect: window,
            encoding: enc,
            flush: 0,
        }]
    };
    let (max_small_regions, max_bytes_percent, small_packet_cost) = if ctx.mmap {
        (cfg.mmap_max_small_regions, cfg.mmap_max_bytes_percent, cfg.mmap_small_packet_cost)
    } else {
        (cfg.max_small_regions, cfg.max_bytes_percent, cfg.small_packet_cost)
    };

    if window_pixels == 0 {
        return Vec::new();
    }
    if selector.full_frames_only || regions.len() > max_small_regions || window_pixels <= cfg.min_window_region_size {
        return full(pick(window_pixels));
    }

    let clipped: Vec<Rect> = regions_iter(regions, ww, wh).collect();
    let mut regions: Vec<Rect> = Vec::with_capacity(clipped.len());
    for r in clipped {
        geometry::add_rectangle(&mut regions, r);
    }
    if regions.is_empty() {
        return Vec::new();
    }

    let mut pixels = geometry::pixel_count(&regions);
    if cfg.merge_regions {
        let bytes_threshold = window_pixels * max_bytes_percent / 100;
        let cost = pixels + small_packet_cost * regions.len() as u64;
        if cost >= bytes_threshold {
            return full(pick(window_pixels));
        }
        if regions.len() > 1 {
            if let Some(merged) = geometry::merge_all(&regions) {
                let merged_pixels = merged.area();
                let merged_cost = merged_pixels + small_packet_cost;
                if merged_cost < cost || merged_pixels < pixels {
                    regions = vec![merged];
                    pixels = merged_pixels;
                }
            }
        }
    }

    if regions.len() > 1 && (pixels >= window_pixels || selector.must_encode_full_frame(pick(pixels))) {
        return full(pick(window_pixels));
    }

    let mut planned = Vec::with_capacity(regions.len());
    for r in &regions {
        let enc = pick(r.area());
        if selector.must_encode_full_frame(enc) {
            return full(enc);
        }
        planned.push(enc);
    }
    // reverse order so the last packet has flush = 0
    let n = regions.len();
    regions
        .iter()
        .zip(planned)
        .enumerate()
        .rev()
        .map(|(i, (rect, encoding))| PlannedRegion {
            rect: *rect,
            encoding,
            flush: i,
        })
        .take(n)
        .collect()
}

fn regions_iter(regions: &[Rect], ww: u32, wh: u32) -> impl Iterator<Item = Rect> + '_ {
    regions.iter().filter_map(move |r| r.clip(ww, wh))
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{EncodeParams, EncodedImage, Encoder};
    use crate::error::EncodeError;
    use crate::pixels::ImageWrapper;
    use std::sync::Arc;

    struct FakeVideo;

    impl Encoder for FakeVideo {
        fn name(&self) -> &'static str {
            "fake-video"
        }

        fn encodings(&self) -> &[Encoding] {
            &[Encoding::H264]
        }

        fn whole_frame_only(&self) -> bool {
            true
        }

        fn encode(&self, encoding: Encoding, _: &ImageWrapper, _: &EncodeParams) -> Result<EncodedImage, EncodeError> {
            Err(EncodeError::NoEncoder(encoding))
        }
    }

    fn registry_with_video() -> CodecRegistry {
        let mut reg = CodecRegistry::with_defaults();
        reg.register(Arc::new(FakeVideo));
        reg
    }

    fn all() -> Vec<Encoding> {
        vec![
            Encoding::H264,
            Encoding::Png,
            Encoding::Rgb24,
            Encoding::Rgb32,
            Encoding::Jpeg,
        ]
    }

    fn selector(requested: Option<Encoding>) -> EncodingSelector {
        EncodingSelector::new(&registry_with_video(), &all(), &[], requested, false, 4096).unwrap()
    }

    #[test]
    fn common_encodings_follow_preference_order() {
        let s = selector(None);
        assert_eq!(
            s.common,
            vec![
                Encoding::H264,
                Encoding::Png,
                Encoding::Rgb,
                Encoding::Rgb24,
                Encoding::Rgb32,
                Encoding::Jpeg
            ]
        );
        assert_eq!(s.encoding, Encoding::H264);
        assert_eq!(s.auto_refresh, vec![Encoding::Png, Encoding::Rgb24, Encoding::Rgb32]);
    }

    #[test]
    fn unsupported_request_falls_back() {
        let s = selector(Some(Encoding::Vp9));
        assert_eq!(s.encoding, Encoding::H264);
        let s = selector(Some(Encoding::Jpeg));
        assert_eq!(s.encoding, Encoding::Jpeg);
    }

    #[test]
    fn nothing_common_is_an_error() {
        let err = EncodingSelector::new(&CodecRegistry::with_defaults(), &[Encoding::Vp8], &[], None, false, 4096)
            .unwrap_err();
        assert!(matches!(err, StreamError::NoCommonEncodings { .. }));
    }

    #[test]
    fn tray_gets_lossless_alpha_over_video() {
        let mut s = selector(None);
        s.update_options(WindowFlags::TRAY | WindowFlags::HAS_ALPHA, false, false, 50, 50);
        assert_eq!(s.strategy(), Strategy::Lossless);
        let e = s.best_encoding(100_000, 50, 20, s.encoding);
        assert!(e.is_lossless() && e.supports_alpha());
        assert_eq!(e, Encoding::Rgb32);
    }

    #[test]
    fn transparent_window_avoids_opaque_encodings() {
        let mut s = selector(Some(Encoding::Jpeg));
        s.update_options(WindowFlags::HAS_ALPHA, true, false, 50, 80);
        assert_eq!(s.strategy(), Strategy::Transparent);
        assert!(s.best_encoding(500_000, 50, 80, Encoding::Jpeg).supports_alpha());
        // opaque rendering: alpha is ignored
        s.update_options(WindowFlags::HAS_ALPHA, false, false, 50, 80);
        assert_eq!(s.strategy(), Strategy::CurrentOrRgb);
    }

    #[test]
    fn small_regions_go_out_as_rgb() {
        let mut s = selector(Some(Encoding::Png));
        s.update_options(WindowFlags::empty(), false, false, 50, 100);
        // 4096 * 0.25 * 5
        assert_eq!(s.rgb_auto_threshold, 5120);
        assert_eq!(s.best_encoding(100, 50, 100, Encoding::Png), Encoding::Rgb24);
        assert_eq!(s.best_encoding(100_000, 50, 100, Encoding::Png), Encoding::Png);
    }

    #[test]
    fn strict_and_mmap_strategies() {
        let mut s = EncodingSelector::new(&registry_with_video(), &all(), &[], Some(Encoding::Rgb), true, 4096).unwrap();
        s.update_options(WindowFlags::HAS_ALPHA, true, false, 50, 50);
        assert_eq!(s.strategy(), Strategy::Fixed(Encoding::Rgb32));
        s.update_options(WindowFlags::empty(), true, true, 50, 50);
        assert_eq!(s.best_encoding(10, 50, 50, Encoding::Rgb), Encoding::Mmap);
    }

    fn ctx() -> FlushContext {
        FlushContext {
            dimensions: (1000, 1000),
            speed: 50,
            quality: 50,
            mmap: false,
            force_encoding: false,
        }
    }

    fn png_selector() -> EncodingSelector {
        let mut s = selector(Some(Encoding::Png));
        s.update_options(WindowFlags::empty(), false, false, 50, 0);
        s
    }

    #[test]
    fn few_small_regions_are_sent_separately_in_reverse() {
        let s = png_selector();
        let regions = [Rect::new(0, 0, 100, 100), Rect::new(800, 800, 100, 100)];
        let plan = plan_flush(&s, &regions, Encoding::Png, ctx(), &RegionsSection::default());
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].rect, regions[1]);
        assert_eq!(plan[0].flush, 1);
        assert_eq!(plan[1].flush, 0);
    }

    #[test]
    fn nearby_regions_are_merged() {
        let s = png_selector();
        let regions = [Rect::new(0, 0, 100, 100), Rect::new(100, 0, 100, 100)];
        let plan = plan_flush(&s, &regions, Encoding::Png, ctx(), &RegionsSection::default());
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].rect, Rect::new(0, 0, 200, 100));
    }

    #[test]
    fn regions_are_clipped_and_deduplicated() {
        let s = png_selector();
        let regions = [
            Rect::new(990, 0, 100, 100),
            Rect::new(990, 0, 100, 100),
            Rect::new(2000, 2000, 5, 5),
        ];
        let plan = plan_flush(&s, &regions, Encoding::Png, ctx(), &RegionsSection::default());
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].rect, Rect::new(990, 0, 10, 100));
        assert_eq!(plan[0].flush, 0);
    }

    #[test]
    fn many_regions_become_a_full_update() {
        let s = png_selector();
        let regions: Vec<Rect> = (0..41).map(|i| Rect::new(i * 20, 0, 5, 5)).collect();
        let plan = plan_flush(&s, &regions, Encoding::Png, ctx(), &RegionsSection::default());
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].rect, Rect::full(1000, 1000));
    }

    #[test]
    fn large_damage_becomes_a_full_update() {
        let s = png_selector();
        let regions = [Rect::new(0, 0, 1000, 700)];
        let plan = plan_flush(&s, &regions, Encoding::Png, ctx(), &RegionsSection::default());
        assert_eq!(plan[0].rect, Rect::full(1000, 1000));
    }

    #[test]
    fn whole_frame_encoders_get_the_window() {
        let mut s = selector(None);
        s.update_options(WindowFlags::empty(), false, false, 50, 0);
        let plan = plan_flush(&s, &[Rect::new(10, 10, 300, 300)], Encoding::H264, ctx(), &RegionsSection::default());
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].rect, Rect::full(1000, 1000));
        assert_eq!(plan[0].encoding, Encoding::H264);
    }

    #[test]
    fn forced_encoding_bypasses_selector() {
        let s = png_selector();
        let forced = FlushContext {
            force_encoding: true,
            ..ctx()
        };
        let plan = plan_flush(&s, &[Rect::new(0, 0, 10, 10)], Encoding::Png, forced, &RegionsSection::default());
        assert_eq!(plan[0].encoding, Encoding::Png);
        let plan = plan_flush(&s, &[Rect::new(0, 0, 10, 10)], Encoding::Png, ctx(), &RegionsSection::default());
        assert_eq!(plan[0].encoding, Encoding::Png);
    }
}
