//! Per window state machine: damage in, encode jobs out.
//!
//! ```text
//!  damage ──► fast path? ──yes──────────────────────────► process_damage_region ──► worker
//!               │ no                                               ▲
//!               ▼                                                  │
//!          DelayedRegion ──expire──► may_send_delayed ──ok──► do_send_delayed_regions
//!               ▲   │                    │ backlog                 ▲
//!               └───┘ merge              ▼                         │
//!                                  soft expiry / ack ──────────────┘
//!                                  force flush at max_delay ───────┘
//! ```
//!
//! Everything here runs on the connection event loop. Timers are plain
//! [`TimerEvent`] values in the connection's [`TimerQueue`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Value, json};

use crate::caps::{ClientCapabilities, parse_encodings};
use crate::codec::{EncodeParams, Encoding};
use crate::config::{BatchSection, PipelineConfig};
use crate::error::StreamError;
use crate::flags::WindowFlags;
use crate::geometry::Rect;
use crate::pipeline::batch::{self, BatchConfig, WindowState};
use crate::pipeline::damage::{DamageOptions, DelayedRegion};
use crate::pipeline::encoder::{EncodeJob, EncodeOutcome, EncoderSetup, WindowEncoder};
use crate::pipeline::estimator::{self, QualitySpeed};
use crate::pipeline::refresh::{AutoRefresh, RefreshAction, RefreshFire};
use crate::pipeline::selector::{EncodingSelector, FlushContext, plan_flush};
use crate::pipeline::stats::{SharedGlobalStatistics, SharedWindowStatistics, WindowStatistics};
use crate::pipeline::timer::{TimerId, TimerQueue};
use crate::pipeline::worker::EncodeWorker;
use crate::pixels::PixelFormat;
use crate::window::{WindowModel, WindowProperty};
use crate::wire::{DamageAck, PropertyUpdate};

/// Soft expiry steps before the stale region timeout takes over.
const MAX_SOFT_EXPIRED: u32 = 5;
/// Windows resized this recently batch a little longer.
const RESIZE_GRACE: Duration = Duration::from_millis(250);
const DECODE_ERROR_REFRESH_DELAY: Duration = Duration::from_millis(250);
/// Acked pixels needed before the batch delay is recalculated.
const MIN_PIXEL_RECALCULATE: u64 = 2000;
const RECALCULATE_INTERVAL: Duration = Duration::from_secs(1);
/// Delay of an idle window.
const IDLE_DELAY: u32 = 500;

// ── Timers ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// The batch delay of the delayed region elapsed.
    Expire,
    /// Retry an expired region that could not be sent.
    SoftTimeout,
    /// The region created at this time is stale.
    RegionTimeout { created: Instant },
    /// `max_delay` after the region was created.
    ForceFlush,
    /// Poll while the encode worker is busy.
    CheckDelayed,
    Refresh,
    DecodeErrorRefresh,
}

pub type Timers = TimerQueue<(u32, TimerEvent)>;

#[derive(Debug, Default)]
struct WindowTimers {
    expire: Option<TimerId>,
    soft: Option<TimerId>,
    timeout: Option<TimerId>,
    force: Option<TimerId>,
    check: Option<TimerId>,
    refresh: Option<TimerId>,
    decode_refresh: Option<TimerId>,
}

fn disarm(timers: &mut Timers, slot: &mut Option<TimerId>) {
    if let Some(id) = slot.take() {
        timers.cancel(id);
    }
}

fn millis(ms: u32) -> Duration {
    Duration::from_millis(u64::from(ms))
}

/// Connection resources every window works with.
pub struct Context {
    pub cfg: Arc<PipelineConfig>,
    pub timers: Timers,
    pub worker: EncodeWorker,
    pub global: SharedGlobalStatistics,
    /// Connection wide batch delay per megapixel, seeds new windows.
    pub delay_per_megapixel: Option<f64>,
}

// ── ClientSettings ───────────────────────────────────────────────

/// What a client negotiated, resolved against the server configuration.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub core_encodings: Vec<Encoding>,
    pub refresh_encodings: Vec<Encoding>,
    pub encoding: Option<Encoding>,
    pub strict: bool,
    pub rgb_formats: Arc<[PixelFormat]>,
    pub transparency: bool,
    pub full_frames_only: bool,
    pub auto_refresh_delay: Option<u32>,
    pub delta_buckets: usize,
    pub delta_encodings: Vec<Encoding>,
    pub client_options: bool,
    pub flush: bool,
    pub rgb_zlib: bool,
    pub rgb_zstd: bool,
    pub quality: Option<u8>,
    pub min_quality: u8,
    pub max_quality: u8,
    pub speed: Option<u8>,
    pub min_speed: u8,
    pub max_speed: u8,
    pub batch: BatchSection,
}

impl ClientSettings {
    pub fn from_caps(caps: &ClientCapabilities, cfg: &PipelineConfig) -> Self {
        let transparency = caps.transparency;
        let formats: Vec<PixelFormat> = caps
            .rgb_formats()
            .into_iter()
            .filter(|f| transparency || !f.has_alpha())
            .collect();
        let rgb_formats: Arc<[PixelFormat]> = if formats.is_empty() {
            Arc::from([PixelFormat::Rgb].as_slice())
        } else {
            Arc::from(formats)
        };
        let mut batch = cfg.batch.clone();
        if let Some(always) = caps.batch_always {
            batch.always = always;
        }
        match (caps.batch_min_delay, caps.vrefresh_min_delay()) {
            (Some(min), _) => batch.min_delay_ms = min,
            (None, Some(vrefresh)) => batch.min_delay_ms = batch.min_delay_ms.max(vrefresh.min(batch.max_delay_ms)),
            (None, None) => {}
        }
        if let Some(max) = caps.batch_max_delay {
            batch.max_delay_ms = max;
        }
        if let Some(delay) = caps.batch_delay {
            batch.start_delay_ms = delay;
        }
        let enc = &cfg.encoding;
        Self {
            core_encodings: caps.core_encodings(),
            refresh_encodings: caps.auto_refresh_encodings(),
            encoding: caps.preferred_encoding(),
            strict: enc.strict,
            rgb_formats,
            transparency,
            full_frames_only: caps.full_frames_only,
            auto_refresh_delay: caps.auto_refresh_delay,
            delta_buckets: caps.delta_buckets as usize,
            delta_encodings: caps.delta_encodings(),
            client_options: caps.client_options,
            flush: caps.flush,
            rgb_zlib: caps.rgb_zlib,
            rgb_zstd: caps.rgb_zstd,
            quality: caps.quality,
            min_quality: caps.min_quality.unwrap_or(enc.default_min_quality).min(100),
            max_quality: caps.max_quality.unwrap_or(100).min(100),
            speed: caps.speed,
            min_speed: caps.min_speed.unwrap_or(enc.default_min_speed).min(100),
            max_speed: caps.max_speed.unwrap_or(100).min(100),
            batch,
        }
    }
}

/// Client properties that can change after the hello.
#[derive(Debug, Clone, Default)]
pub struct ClientProperties {
    pub encodings: Option<Vec<Encoding>>,
    pub refresh_encodings: Option<Vec<Encoding>>,
    pub delta_encodings: Option<Vec<Encoding>>,
    pub rgb_formats: Option<Vec<PixelFormat>>,
    pub transparency: Option<bool>,
    pub full_frames_only: Option<bool>,
    pub maximized: Option<bool>,
}

impl ClientProperties {
    /// Resolve wire names, dropping the ones this side does not know.
    pub fn from_update(update: &PropertyUpdate) -> Self {
        let encodings = |names: &Option<Vec<String>>| names.as_deref().map(parse_encodings);
        Self {
            encodings: encodings(&update.encodings),
            refresh_encodings: encodings(&update.auto_refresh_encodings),
            delta_encodings: encodings(&update.supports_delta),
            rgb_formats: update
                .rgb_formats
                .as_ref()
                .map(|names| names.iter().filter_map(|n| PixelFormat::from_name(n)).collect()),
            transparency: update.transparency,
            full_frames_only: update.full_frames_only,
            maximized: update.maximized,
        }
    }
}

// ── WindowSource ─────────────────────────────────────────────────

pub struct WindowSource {
    pub wid: u32,
    window: Arc<dyn WindowModel>,
    flags: WindowFlags,
    dimensions: (u32, u32),
    settings: ClientSettings,
    encoder: Arc<WindowEncoder>,
    selector: EncodingSelector,
    pub batch: BatchConfig,
    qs: QualitySpeed,
    stats: SharedWindowStatistics,
    refresh: AutoRefresh,
    /// Last sequence handed to the worker.
    sequence: u64,
    delayed: Option<DelayedRegion>,
    timers: WindowTimers,
    soft_expired: u32,
    suspended: bool,
    iconic: bool,
    pub fullscreen: bool,
    pub maximized: bool,
    pub has_focus: bool,
    client_full_frames_only: bool,
    last_encoding: Option<Encoding>,
    /// Bytes per second, `0` for none.
    pub bandwidth_limit: u64,
    acked_pixels: u64,
    last_recalculate: Option<Instant>,
}

impl WindowSource {
    pub fn new(
        wid: u32,
        window: Arc<dyn WindowModel>,
        settings: ClientSettings,
        setup: EncoderSetup,
        ctx: &Context,
    ) -> Result<Self, StreamError> {
        let cfg = &ctx.cfg;
        let flags = window.flags();
        let dimensions = window.dimensions();
        let mut selector = EncodingSelector::new(
            &setup.registry,
            &settings.core_encodings,
            &settings.refresh_encodings,
            settings.encoding,
            settings.strict,
            cfg.encoding.max_pixels_prefer_rgb,
        )?;
        let client_full_frames_only = settings.full_frames_only;
        selector.full_frames_only = full_frames_only(flags, client_full_frames_only);

        let mut batch = BatchConfig::from_config(&settings.batch);
        let (w, h) = dimensions;
        if let (Some(dpm), true) = (ctx.delay_per_megapixel, w > 0 && h > 0) {
            let scaled = dpm * (1_000_000.0 / (f64::from(w) * f64::from(h))).sqrt().sqrt();
            batch.delay = (scaled as u32).clamp(batch.min_delay, batch.max_delay);
        }

        let enc = &cfg.encoding;
        let mut qs = QualitySpeed::new(
            enc.default_quality,
            settings.min_quality,
            enc.default_speed,
            settings.min_speed,
        );
        if let Some(q) = settings.quality {
            qs.set_quality(q);
        }
        if let Some(s) = settings.speed {
            qs.set_speed(s);
        }

        let stats = WindowStatistics::shared();
        let encoder = Arc::new(WindowEncoder::new(wid, Arc::clone(&stats), setup));
        let refresh = AutoRefresh::new(&cfg.refresh, settings.auto_refresh_delay);
        let mut source = Self {
            wid,
            window,
            flags,
            dimensions,
            encoder,
            selector,
            batch,
            qs,
            stats,
            refresh,
            sequence: 0,
            delayed: None,
            timers: WindowTimers::default(),
            soft_expired: 0,
            suspended: false,
            iconic: false,
            fullscreen: false,
            maximized: false,
            has_focus: false,
            client_full_frames_only,
            last_encoding: None,
            bandwidth_limit: 0,
            acked_pixels: 0,
            last_recalculate: None,
            settings,
        };
        source.update_encoding_options();
        tracing::debug!(
            wid,
            width = w,
            height = h,
            encoding = %source.selector.encoding,
            delay = source.batch.delay,
            "window source created"
        );
        Ok(source)
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn encoding(&self) -> Encoding {
        self.selector.encoding
    }

    pub fn selector(&self) -> &EncodingSelector {
        &self.selector
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn damage_cancelled(&self) -> u64 {
        self.encoder.damage_cancelled()
    }

    pub fn delayed(&self) -> Option<&DelayedRegion> {
        self.delayed.as_ref()
    }

    pub fn stats(&self) -> &SharedWindowStatistics {
        &self.stats
    }

    pub fn encoder(&self) -> &Arc<WindowEncoder> {
        &self.encoder
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.dimensions
    }

    pub fn flags(&self) -> WindowFlags {
        self.flags
    }

    pub fn quality(&self) -> u8 {
        self.qs.quality
    }

    pub fn speed(&self) -> u8 {
        self.qs.speed
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn refresh_pending(&self) -> bool {
        self.refresh.is_pending()
    }

    pub fn rgb_formats(&self) -> &[PixelFormat] {
        &self.settings.rgb_formats
    }

    pub fn soft_expired(&self) -> u32 {
        self.soft_expired
    }

    pub fn window_state(&self) -> WindowState {
        WindowState {
            wid: self.wid,
            dimensions: self.dimensions,
            has_focus: self.has_focus,
            is_override_redirect: self.flags.is_override_redirect(),
            other_is_fullscreen: false,
            other_is_maximized: false,
            soft_expired: self.soft_expired,
            bandwidth_limit: self.bandwidth_limit,
            mmap: self.encoder.has_mmap(),
        }
    }

    /// Weight of this window when the bandwidth is shared out.
    pub fn bandwidth_weight(&self, now: Instant) -> u64 {
        let (w, h) = self.dimensions;
        let recent = self.stats.lock().recent_damage_pixels(now, Duration::from_secs(1));
        u64::from(w) * u64::from(h) + recent
    }

    // ── Damage ───────────────────────────────────────────────────

    /// Accept one damaged rectangle.
    pub fn damage(&mut self, ctx: &mut Context, rect: Rect, options: DamageOptions, now: Instant) {
        if self.suspended {
            return;
        }
        if !self.window.is_managed() {
            tracing::trace!(wid = self.wid, "damage on a window that is gone");
            return;
        }
        let (ww, wh) = self.window.dimensions();
        if ww == 0 || wh == 0 {
            return;
        }
        if (ww, wh) != self.dimensions {
            self.resized(ww, wh, now);
        }
        let Some(rect) = rect.clip(ww, wh) else {
            return;
        };
        {
            let mut stats = self.stats.lock();
            if !options.auto_refresh {
                stats.last_damage_events.push((now, rect));
            }
            stats.damage_events_count += 1;
            stats.last_damage_event_time = Some(now);
        }
        {
            let mut global = ctx.global.lock();
            global.damage_events_count += 1;
            global.damage_last_events.push((self.wid, now, rect.area()));
        }
        let full_window = Rect::full(ww, wh);
        let rect = if self.selector.full_frames_only { full_window } else { rect };

        if let Some(delayed) = self.delayed.as_mut() {
            delayed.add(rect);
            delayed.options.merge(&options);
            tracing::trace!(wid = self.wid, %rect, regions = delayed.regions.len(), "merged into delayed region");
            return;
        }

        let delay = self.damage_delay(ctx, &options, now);
        let fp = &ctx.cfg.fast_path;
        let (packets_backlog, (pixels_backlog, regions_backlog)) = {
            let stats = self.stats.lock();
            (stats.get_packets_backlog(now), stats.get_pixels_encoding_backlog())
        };
        let frame_pixels = full_window.area() as f64 * fp.max_pixel_backlog_frames;
        if !self.must_batch(ctx, now)
            && packets_backlog <= fp.max_packet_backlog
            && pixels_backlog as f64 <= frame_pixels
            && regions_backlog <= fp.max_encoding_regions
        {
            let encoding = options.encoding.unwrap_or_else(|| {
                self.selector
                    .best_encoding(rect.area(), self.qs.speed, self.qs.quality, self.selector.encoding)
            });
            let rect = if self.selector.must_encode_full_frame(encoding) { full_window } else { rect };
            self.batch.record_delay(now, delay);
            self.batch.record_actual_delay(now, delay);
            tracing::trace!(wid = self.wid, %rect, %encoding, "fast path");
            self.window.acknowledge_changes();
            self.process_damage_region(ctx, now, now, rect, encoding, &options, 0);
            return;
        }

        let encoding = options.encoding.unwrap_or(self.selector.encoding);
        self.delayed = Some(DelayedRegion::new(now, rect, encoding, options));
        self.batch.record_delay(now, delay);
        let wid = self.wid;
        self.timers.expire = Some(ctx.timers.schedule(now, millis(delay), (wid, TimerEvent::Expire)));
        disarm(&mut ctx.timers, &mut self.timers.force);
        self.timers.force = Some(ctx.timers.schedule(now, self.batch.max_delay_duration(), (wid, TimerEvent::ForceFlush)));
        tracing::trace!(wid, %rect, delay, packets_backlog, "damage delayed");
    }

    /// Batch delay for a new delayed region.
    fn damage_delay(&self, ctx: &Context, options: &DamageOptions, now: Instant) -> u32 {
        let b = &self.batch;
        let mut delay = options.delay.unwrap_or(b.delay);
        if delay <= b.min_delay && !b.always {
            // a storm of small updates must not defeat batching
            let global = ctx.global.lock();
            let recent = global
                .damage_last_events
                .iter()
                .filter(|(_, t, _)| now.saturating_duration_since(*t) <= b.time_unit);
            let (events, pixels) = recent.fold((0u64, 0u64), |(e, p), &(_, _, px)| (e + 1, p + px));
            let ratio = (events as f64 / f64::from(b.max_events.max(1))).max(pixels as f64 / b.max_pixels.max(1) as f64);
            if ratio > 1.0 {
                delay = (f64::from(b.min_delay) * ratio) as u32;
                tracing::trace!(wid = self.wid, events, pixels, delay, "damage storm");
            }
        }
        let resized = self
            .stats
            .lock()
            .last_resized
            .is_some_and(|t| now.saturating_duration_since(t) < RESIZE_GRACE);
        if resized {
            delay = (delay + 25).max(50);
        }
        let qsize = ctx.worker.qsize() as u32;
        if qsize > 4 {
            delay = delay.min(b.min_delay).max(10) * qsize / 4;
        }
        delay = delay.max(options.min_delay.unwrap_or(0));
        delay.min(options.max_delay.unwrap_or(b.max_delay))
    }

    /// Batching is forced by configuration or by a burst of events.
    fn must_batch(&self, ctx: &Context, now: Instant) -> bool {
        if self.batch.always {
            return true;
        }
        let fp = &ctx.cfg.fast_path;
        if fp.burst_events == 0 {
            return false;
        }
        self.batch
            .last_delays
            .nth_back(fp.burst_events - 1)
            .is_some_and(|&(t, _)| now.saturating_duration_since(t) < Duration::from_millis(fp.burst_window_ms))
    }

    /// Hand one region to the encode worker.
    #[allow(clippy::too_many_arguments)]
    fn process_damage_region(
        &mut self,
        ctx: &mut Context,
        now: Instant,
        damage_time: Instant,
        rect: Rect,
        encoding: Encoding,
        options: &DamageOptions,
        flush: usize,
    ) {
        if rect.is_empty() {
            return;
        }
        let Some(image) = self.window.get_image(rect) else {
            tracing::trace!(wid = self.wid, %rect, "no pixels, window vanished");
            return;
        };
        self.sequence += 1;
        let sequence = self.sequence;
        self.stats.lock().encoding_pending.insert(sequence, (now, rect.area()));
        let mmap = self.encoder.has_mmap();
        let job = EncodeJob {
            sequence,
            image,
            encoding,
            fallback: self.selector.encoding,
            params: EncodeParams {
                quality: if mmap { 100 } else { options.quality.unwrap_or(self.qs.quality) },
                speed: if mmap { 100 } else { options.speed.unwrap_or(self.qs.speed) },
                rgb_formats: Arc::clone(&self.settings.rgb_formats),
                transparency: self.selector.want_alpha,
                rgb_zstd: self.settings.rgb_zstd,
                rgb_zlib: self.settings.rgb_zlib,
            },
            flush: if self.settings.flush { flush } else { 0 },
            damage_time,
        };
        let encoder = Arc::clone(&self.encoder);
        if let Err(e) = ctx.worker.call("encode", true, move || encoder.process(job)) {
            tracing::warn!(wid = self.wid, sequence, error = %e, "cannot queue encode job");
            self.stats.lock().encoding_pending.remove(&sequence);
            return;
        }
        self.last_encoding = Some(encoding);
        tracing::trace!(wid = self.wid, sequence, %rect, %encoding, flush, "region queued");
    }

    // ── Delayed region ───────────────────────────────────────────

    pub fn on_timer(&mut self, ctx: &mut Context, event: TimerEvent, now: Instant) {
        match event {
            TimerEvent::Expire => {
                self.timers.expire = None;
                if let Some(delayed) = self.delayed.as_mut() {
                    delayed.expired = true;
                    self.may_send_delayed(ctx, now);
                }
            }
            TimerEvent::SoftTimeout => {
                self.timers.soft = None;
                self.may_send_delayed(ctx, now);
            }
            TimerEvent::CheckDelayed => {
                self.timers.check = None;
                self.may_send_delayed(ctx, now);
            }
            TimerEvent::ForceFlush => {
                self.timers.force = None;
                if self.delayed.is_some() {
                    tracing::debug!(wid = self.wid, "delayed region reached max delay, forcing flush");
                    self.do_send_delayed_regions(ctx, now);
                }
            }
            TimerEvent::RegionTimeout { created } => {
                self.timers.timeout = None;
                if self.delayed.as_ref().is_some_and(|d| d.created == created) {
                    tracing::warn!(
                        wid = self.wid,
                        age_ms = now.saturating_duration_since(created).as_millis() as u64,
                        "delayed region timed out, dropping damage"
                    );
                    self.cancel_damage(ctx);
                    self.full_quality_refresh(ctx, now);
                }
            }
            TimerEvent::Refresh => {
                self.timers.refresh = None;
                self.refresh_timer_fired(ctx, now);
            }
            TimerEvent::DecodeErrorRefresh => {
                self.timers.decode_refresh = None;
                self.full_quality_refresh(ctx, now);
            }
        }
    }

    /// Send the expired delayed region if the connection can take it.
    pub fn may_send_delayed(&mut self, ctx: &mut Context, now: Instant) {
        let Some(delayed) = self.delayed.as_ref() else {
            return;
        };
        if !delayed.expired {
            return;
        }
        let elapsed = now.saturating_duration_since(delayed.created);
        let force = elapsed >= self.batch.max_delay_duration();
        let packets_backlog = self.stats.lock().get_packets_backlog(now);
        if packets_backlog > 0 && !force {
            // the next ack will try again
            self.arm_soft_expiry(ctx, now);
            return;
        }
        if !force {
            let (pixels, regions) = self.stats.lock().get_pixels_encoding_backlog();
            let (ww, wh) = self.dimensions;
            if pixels >= u64::from(ww) * u64::from(wh) || regions > ctx.cfg.fast_path.max_encoding_regions {
                if self.timers.check.is_none() {
                    let poll = millis(self.batch.min_delay.max(10));
                    self.timers.check = Some(ctx.timers.schedule(now, poll, (self.wid, TimerEvent::CheckDelayed)));
                }
                return;
            }
        }
        self.do_send_delayed_regions(ctx, now);
    }

    fn arm_soft_expiry(&mut self, ctx: &mut Context, now: Instant) {
        if self.timers.soft.is_some() || self.timers.timeout.is_some() {
            return;
        }
        let Some(created) = self.delayed.as_ref().map(|d| d.created) else {
            return;
        };
        if self.soft_expired < MAX_SOFT_EXPIRED {
            self.soft_expired += 1;
            let delay = millis(self.batch.delay.max(1) * self.soft_expired);
            self.timers.soft = Some(ctx.timers.schedule(now, delay, (self.wid, TimerEvent::SoftTimeout)));
        } else {
            let delay = millis(self.batch.timeout_delay);
            self.timers.timeout = Some(ctx.timers.schedule(
                now,
                delay,
                (self.wid, TimerEvent::RegionTimeout { created }),
            ));
        }
    }

    fn cancel_delay_timers(&mut self, ctx: &mut Context) {
        let t = &mut self.timers;
        for slot in [&mut t.expire, &mut t.soft, &mut t.timeout, &mut t.force, &mut t.check] {
            disarm(&mut ctx.timers, slot);
        }
    }

    /// Flush the delayed region now.
    fn do_send_delayed_regions(&mut self, ctx: &mut Context, now: Instant) {
        self.cancel_delay_timers(ctx);
        self.soft_expired = 0;
        let Some(delayed) = self.delayed.take() else {
            return;
        };
        let actual = now.saturating_duration_since(delayed.created).as_millis() as u32;
        self.batch.record_actual_delay(now, actual);
        if !self.window.is_managed() {
            return;
        }
        self.window.acknowledge_changes();
        let flush_ctx = FlushContext {
            dimensions: self.dimensions,
            speed: delayed.options.speed.unwrap_or(self.qs.speed),
            quality: delayed.options.quality.unwrap_or(self.qs.quality),
            mmap: self.encoder.has_mmap(),
            force_encoding: delayed.options.force_encoding,
        };
        let plan = plan_flush(&self.selector, &delayed.regions, delayed.encoding, flush_ctx, &ctx.cfg.regions);
        tracing::trace!(wid = self.wid, regions = delayed.regions.len(), packets = plan.len(), delay_ms = actual, "sending delayed region");
        for p in plan {
            self.process_damage_region(ctx, now, delayed.created, p.rect, p.encoding, &delayed.options, p.flush);
        }
    }

    // ── Refresh ──────────────────────────────────────────────────

    /// The worker finished a job for this window.
    pub fn on_encoded(&mut self, ctx: &mut Context, sequence: u64, outcome: EncodeOutcome, now: Instant) {
        match outcome {
            EncodeOutcome::Sent(update) => {
                if self.encoder.has_mmap() || self.delayed.is_some() || !self.window.is_managed() {
                    return;
                }
                match self.refresh.on_update(update, self.dimensions, self.batch.delay, now) {
                    RefreshAction::Keep => {}
                    RefreshAction::Cancel => {
                        tracing::debug!(wid = self.wid, sequence, "auto refresh cancelled");
                        disarm(&mut ctx.timers, &mut self.timers.refresh);
                    }
                    RefreshAction::Schedule(at) => {
                        disarm(&mut ctx.timers, &mut self.timers.refresh);
                        self.timers.refresh = Some(ctx.timers.schedule_at(at, (self.wid, TimerEvent::Refresh)));
                    }
                }
            }
            EncodeOutcome::Cancelled => {}
            EncodeOutcome::Failed(e) => {
                tracing::debug!(wid = self.wid, sequence, error = %e, "window stays usable after encoder failure");
            }
        }
    }

    fn refresh_timer_fired(&mut self, ctx: &mut Context, now: Instant) {
        if self.delayed.is_some() {
            // wait for the pending flush to go out first
            let delay = millis(self.batch.delay.max(50));
            self.timers.refresh = Some(ctx.timers.schedule(now, delay, (self.wid, TimerEvent::Refresh)));
            return;
        }
        match self.refresh.on_timer(now) {
            RefreshFire::Rearm(at) => {
                self.timers.refresh = Some(ctx.timers.schedule_at(at, (self.wid, TimerEvent::Refresh)));
            }
            RefreshFire::Refresh(regions) => self.send_auto_refresh(ctx, regions, now),
            RefreshFire::Nothing => {}
        }
    }

    fn send_auto_refresh(&mut self, ctx: &mut Context, regions: Vec<Rect>, now: Instant) {
        let refresh_encodings = &self.selector.auto_refresh;
        let Some(&first) = refresh_encodings.first() else {
            return;
        };
        let pixels = crate::geometry::pixel_count(&regions);
        let best = self
            .selector
            .best_encoding(pixels, self.refresh.speed, self.refresh.quality, self.selector.encoding);
        let encoding = if refresh_encodings.contains(&best) { best } else { first };
        tracing::debug!(wid = self.wid, %encoding, regions = regions.len(), "auto refresh");
        let options = DamageOptions {
            encoding: Some(encoding),
            force_encoding: true,
            ..DamageOptions::refresh(self.refresh.quality, self.refresh.speed)
        };
        for rect in regions {
            self.damage(ctx, rect, options.clone(), now);
        }
    }

    /// Repaint the whole window at full quality.
    pub fn full_quality_refresh(&mut self, ctx: &mut Context, now: Instant) {
        if !self.window.is_managed() {
            return;
        }
        self.refresh.cancel();
        disarm(&mut ctx.timers, &mut self.timers.refresh);
        let encoding = self.selector.auto_refresh.first().copied();
        let options = DamageOptions {
            quality: Some(100),
            speed: Some(self.refresh.speed),
            encoding,
            force_encoding: encoding.is_some(),
            override_options: true,
            ..Default::default()
        };
        let (w, h) = self.window.dimensions();
        tracing::debug!(wid = self.wid, ?encoding, "full quality refresh");
        self.damage(ctx, Rect::full(w, h), options, now);
    }

    // ── Acks ─────────────────────────────────────────────────────

    /// Process a client ack.
    ///
    /// Unknown sequences change nothing. Returns `(late_pct, send_speed)`
    /// when the window is congested.
    pub fn damage_packet_acked(&mut self, ctx: &mut Context, ack: &DamageAck, now: Instant) -> Option<(f64, f64)> {
        let pixels = u64::from(ack.width) * u64::from(ack.height);
        let congestion_cfg = &ctx.cfg.congestion;
        let outcome = self.stats.lock().record_ack(
            ack.damage_packet_sequence,
            pixels,
            ack.decode_time,
            congestion_cfg.ack_tolerance(),
            congestion_cfg.late_pct_threshold,
            now,
        );
        let Some(outcome) = outcome else {
            tracing::trace!(wid = self.wid, sequence = ack.damage_packet_sequence, "ack for unknown sequence");
            return None;
        };
        if ack.decode_time <= 0 {
            tracing::warn!(
                wid = self.wid,
                sequence = ack.damage_packet_sequence,
                message = %ack.message,
                "client failed to decode"
            );
            ctx.global.lock().decode_errors += 1;
            self.encoder.clear_delta();
            if self.timers.decode_refresh.is_none() {
                self.timers.decode_refresh = Some(ctx.timers.schedule(
                    now,
                    DECODE_ERROR_REFRESH_DELAY,
                    (self.wid, TimerEvent::DecodeErrorRefresh),
                ));
            }
        } else {
            ctx.global
                .lock()
                .record_latency(self.wid, ack.decode_time, outcome.pending.start_send_at, pixels, now);
            self.acked_pixels += pixels;
        }
        if self.delayed.as_ref().is_some_and(|d| d.expired) {
            self.may_send_delayed(ctx, now);
        }
        outcome.congestion
    }

    // ── Cancellation and lifecycle ───────────────────────────────

    /// Void every queued and delayed update of this window.
    pub fn cancel_damage(&mut self, ctx: &mut Context) {
        self.encoder.cancel_up_to(self.sequence);
        self.cancel_delay_timers(ctx);
        disarm(&mut ctx.timers, &mut self.timers.refresh);
        self.refresh.cancel();
        self.delayed = None;
        self.soft_expired = 0;
        self.encoder.clear_delta();
        let cancelled = self.encoder.damage_cancelled();
        self.stats.lock().encoding_pending.retain(|seq, _| *seq > cancelled);
        tracing::trace!(wid = self.wid, cancelled, "damage cancelled");
    }

    pub fn suspend(&mut self, ctx: &mut Context) {
        self.cancel_damage(ctx);
        self.stats.lock().reset();
        self.suspended = true;
    }

    pub fn resume(&mut self, ctx: &mut Context, now: Instant) {
        self.suspended = false;
        self.cancel_damage(ctx);
        self.stats.lock().reset();
        self.full_quality_refresh(ctx, now);
    }

    pub fn unmap(&mut self, ctx: &mut Context) {
        self.cancel_damage(ctx);
        self.stats.lock().reset();
    }

    /// Release everything; no packet for this window is sent after this.
    pub fn cleanup(&mut self, ctx: &mut Context) {
        self.cancel_damage(ctx);
        disarm(&mut ctx.timers, &mut self.timers.decode_refresh);
        self.encoder.cancel_all();
        self.encoder.clear_delta();
    }

    pub fn go_idle(&mut self) {
        self.batch.lock(IDLE_DELAY.max(self.batch.delay));
    }

    pub fn no_idle(&mut self) {
        if !self.iconic {
            self.batch.unlock();
        }
    }

    pub fn set_focus(&mut self, focused: bool) {
        self.has_focus = focused;
    }

    pub fn set_property(&mut self, ctx: &mut Context, property: WindowProperty, now: Instant) {
        match property {
            WindowProperty::Fullscreen(on) => self.fullscreen = on,
            WindowProperty::Maximized(on) => self.maximized = on,
            WindowProperty::Iconic(on) => {
                self.iconic = on;
                if on {
                    self.go_idle();
                } else {
                    self.no_idle();
                }
            }
            WindowProperty::Resized { width, height } => {
                self.resized(width, height, now);
                disarm(&mut ctx.timers, &mut self.timers.refresh);
            }
        }
    }

    fn resized(&mut self, width: u32, height: u32, now: Instant) {
        self.dimensions = (width, height);
        self.stats.lock().last_resized = Some(now);
        self.refresh.cancel();
        self.encoder.clear_delta();
    }

    // ── Encoding ─────────────────────────────────────────────────

    /// Switch the primary encoding, resetting what depends on the old one.
    pub fn set_new_encoding(&mut self, encoding: Option<Encoding>, strict: bool) -> Result<(), StreamError> {
        self.stats.lock().reset();
        self.encoder.clear_delta();
        self.selector.strict = strict;
        self.settings.encoding = encoding;
        self.selector
            .update_selection(&self.settings.core_encodings, &self.settings.refresh_encodings, encoding)?;
        self.update_encoding_options();
        Ok(())
    }

    /// Apply changed client properties and renegotiate.
    pub fn set_client_properties(&mut self, props: ClientProperties) -> Result<(), StreamError> {
        if let Some(maximized) = props.maximized {
            self.maximized = maximized;
        }
        if let Some(ffo) = props.full_frames_only {
            self.client_full_frames_only = ffo;
        }
        let transparency_changed = props.transparency.is_some_and(|t| t != self.settings.transparency);
        if let Some(transparency) = props.transparency {
            self.settings.transparency = transparency;
        }
        if props.rgb_formats.is_some() || transparency_changed {
            let transparency = self.settings.transparency;
            let formats: Vec<PixelFormat> = props
                .rgb_formats
                .unwrap_or_else(|| self.settings.rgb_formats.to_vec())
                .into_iter()
                .filter(|f| transparency || !f.has_alpha())
                .collect();
            self.settings.rgb_formats = if formats.is_empty() {
                Arc::from([PixelFormat::Rgb].as_slice())
            } else {
                Arc::from(formats)
            };
        }
        if let Some(delta) = props.delta_encodings {
            let delta = if self.settings.delta_buckets == 0 { Vec::new() } else { delta };
            self.encoder.set_delta_encodings(&delta);
            self.settings.delta_encodings = delta;
        }
        if let Some(refresh) = props.refresh_encodings {
            self.settings.refresh_encodings = refresh;
        }
        if let Some(encodings) = props.encodings {
            self.settings.core_encodings = encodings;
        }
        self.selector.update_selection(
            &self.settings.core_encodings,
            &self.settings.refresh_encodings,
            self.settings.encoding,
        )?;
        self.selector.full_frames_only = full_frames_only(self.flags, self.client_full_frames_only);
        self.update_encoding_options();
        Ok(())
    }

    /// Fixed quality, `0` lets the estimator decide again.
    pub fn set_quality(&mut self, quality: u8) {
        self.qs.set_quality(quality);
        self.update_encoding_options();
    }

    pub fn set_min_quality(&mut self, quality: u8) {
        self.qs.set_min_quality(quality);
    }

    /// Fixed speed, `0` lets the estimator decide again.
    pub fn set_speed(&mut self, speed: u8) {
        self.qs.set_speed(speed);
        self.update_encoding_options();
    }

    pub fn set_min_speed(&mut self, speed: u8) {
        self.qs.set_min_speed(speed);
    }

    fn update_encoding_options(&mut self) {
        self.selector.update_options(
            self.flags,
            self.settings.transparency,
            self.encoder.has_mmap(),
            self.qs.speed,
            self.qs.quality,
        );
    }

    // ── Recalculation ────────────────────────────────────────────

    /// Enough acked pixels and time since the last recalculation.
    pub fn should_recalculate(&self, now: Instant) -> bool {
        self.acked_pixels >= MIN_PIXEL_RECALCULATE
            && self
                .last_recalculate
                .is_none_or(|t| now.saturating_duration_since(t) >= RECALCULATE_INTERVAL)
    }

    /// Recalculate the batch delay, then quality and speed.
    pub fn recalculate_delays(&mut self, ctx: &mut Context, state: WindowState, now: Instant) {
        self.acked_pixels = 0;
        self.last_recalculate = Some(now);
        {
            let mut stats = self.stats.lock();
            stats.update_averages(now);
            let global = ctx.global.lock();
            batch::calculate_batch_delay(&mut self.batch, &state, &mut stats, &global, now);
        }
        self.update_quality_speed(ctx, now);
    }

    fn update_quality_speed(&mut self, ctx: &Context, now: Instant) {
        if self.encoder.has_mmap() {
            return;
        }
        let dims = self.dimensions;
        let bandwidth = self.bandwidth_limit;
        let min_speed = self.qs.fixed_min_speed;
        let min_quality = self.qs.fixed_min_quality;
        let lossless = self.selector.encoding.is_lossless();
        {
            let mut stats = self.stats.lock();
            let global = ctx.global.lock();
            let batch = &self.batch;
            self.qs.update_speed(now, |data| {
                estimator::get_target_speed(dims, batch, &global, &stats, bandwidth, min_speed, data, now)
            });
            self.qs.update_quality(now, lossless, || {
                estimator::get_target_quality(dims, batch, &global, &mut stats, bandwidth, min_quality, min_speed, now)
            });
        }
        self.qs.speed = self.qs.speed.min(self.settings.max_speed);
        if !lossless {
            self.qs.quality = self.qs.quality.min(self.settings.max_quality);
        }
        self.update_encoding_options();
        tracing::trace!(wid = self.wid, quality = self.qs.quality, speed = self.qs.speed, delay = self.batch.delay, "targets updated");
    }

    pub fn get_info(&self) -> Value {
        json!({
            "wid": self.wid,
            "dimensions": [self.dimensions.0, self.dimensions.1],
            "encoding": self.selector.encoding.as_str(),
            "last_encoding": self.last_encoding.map(Encoding::as_str),
            "encodings": self.selector.common.iter().map(|e| e.as_str()).collect::<Vec<_>>(),
            "auto_refresh_encodings": self.selector.auto_refresh.iter().map(|e| e.as_str()).collect::<Vec<_>>(),
            "strategy": format!("{:?}", self.selector.strategy()),
            "sequence": self.sequence,
            "damage_cancelled": self.encoder.damage_cancelled(),
            "quality": self.qs.quality,
            "speed": self.qs.speed,
            "suspended": self.suspended,
            "delayed_regions": self.delayed.as_ref().map_or(0, |d| d.regions.len()),
            "refresh_regions": self.refresh.regions.len(),
            "bandwidth_limit": self.bandwidth_limit,
            "batch": self.batch.get_info(),
            "statistics": self.stats.lock().get_info(),
        })
    }
}

fn full_frames_only(flags: WindowFlags, client: bool) -> bool {
    client || flags.is_tray() || flags.is_override_redirect()
}

impl std::fmt::Debug for WindowSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowSource")
            .field("wid", &self.wid)
            .field("dimensions", &self.dimensions)
            .field("encoding", &self.selector.encoding)
            .field("sequence", &self.sequence)
            .field("delayed", &self.delayed.is_some())
            .finish()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecRegistry;
    use crate::pipeline::encoder::LoopEvent;
    use crate::pipeline::queue::PacketQueue;
    use crate::pipeline::stats::GlobalStatistics;
    use crate::window::MemoryWindow;
    use tokio::sync::mpsc;

    struct Harness {
        ctx: Context,
        queue: PacketQueue,
        events: mpsc::UnboundedReceiver<LoopEvent>,
        window: Arc<MemoryWindow>,
        source: WindowSource,
    }

    fn caps() -> ClientCapabilities {
        ClientCapabilities {
            encodings: vec!["png".into(), "rgb24".into(), "rgb32".into(), "jpeg".into()],
            encoding: Some("png".into()),
            rgb_formats: vec!["BGRX".into(), "RGB".into()],
            ..Default::default()
        }
    }

    fn harness(caps: ClientCapabilities, cfg: PipelineConfig, flags: WindowFlags) -> Harness {
        let cfg = Arc::new(cfg);
        let global = GlobalStatistics::shared();
        let ctx = Context {
            worker: EncodeWorker::spawn("test-encode", Arc::clone(&global)).unwrap(),
            timers: Timers::new(),
            global: Arc::clone(&global),
            delay_per_megapixel: None,
            cfg: Arc::clone(&cfg),
        };
        let queue = PacketQueue::new(Arc::clone(&global));
        let (tx, events) = mpsc::unbounded_channel();
        let settings = ClientSettings::from_caps(&caps, &cfg);
        let setup = EncoderSetup {
            registry: Arc::new(CodecRegistry::with_defaults()),
            delta_cfg: cfg.delta.clone(),
            delta_buckets: settings.delta_buckets,
            delta_encodings: settings.delta_encodings.clone(),
            mmap: None,
            client_options: settings.client_options,
            integrity_hash: false,
            global,
            queue: queue.clone(),
            events: tx,
        };
        let window = Arc::new(MemoryWindow::new(100, 100, flags));
        let source = WindowSource::new(1, window.clone(), settings, setup, &ctx).unwrap();
        Harness {
            ctx,
            queue,
            events,
            window,
            source,
        }
    }

    impl Harness {
        fn wait_encoded(&mut self) -> (u64, EncodeOutcome) {
            match self.events.blocking_recv() {
                Some(LoopEvent::Encoded { sequence, outcome, .. }) => (sequence, outcome),
                None => panic!("worker gone"),
            }
        }

        fn fire_due(&mut self, now: Instant) {
            while let Some((_, (_, event))) = self.ctx.timers.pop_due(now) {
                self.source.on_timer(&mut self.ctx, event, now);
            }
        }
    }

    /// Pretend `n` packets were sent long ago and never acked.
    fn fake_backlog(source: &WindowSource, n: u64, now: Instant) {
        let mut stats = source.stats().lock();
        let long_ago = now.checked_sub(Duration::from_secs(5)).unwrap_or(now);
        for seq in 0..n {
            stats.record_send_start(1000 + seq, long_ago, 0, 100);
            stats.record_send_end(1000 + seq, long_ago, 10, None);
        }
    }

    #[test]
    fn idle_window_takes_the_fast_path() {
        let mut h = harness(caps(), PipelineConfig::default(), WindowFlags::empty());
        let now = Instant::now();
        h.source.damage(&mut h.ctx, Rect::full(100, 100), DamageOptions::default(), now);
        assert!(h.source.delayed().is_none());
        assert_eq!(h.source.sequence(), 1);
        assert_eq!(h.window.ack_count(), 1);
        let (seq, outcome) = h.wait_encoded();
        assert_eq!(seq, 1);
        assert!(matches!(outcome, EncodeOutcome::Sent(_)));
        assert_eq!(h.queue.bulk_len(), 1);
    }

    #[test]
    fn backlog_merges_damage_into_one_region() {
        let mut h = harness(caps(), PipelineConfig::default(), WindowFlags::empty());
        let now = Instant::now();
        fake_backlog(&h.source, 3, now);
        for _ in 0..5 {
            h.source.damage(&mut h.ctx, Rect::new(0, 0, 10, 10), DamageOptions::default(), now);
        }
        let delayed = h.source.delayed().unwrap();
        assert_eq!(delayed.regions, vec![Rect::new(0, 0, 10, 10)]);
        assert_eq!(h.source.sequence(), 0);
        // expire plus force flush
        assert_eq!(h.ctx.timers.len(), 2);
    }

    #[test]
    fn forced_flush_ignores_backlog() {
        let mut h = harness(caps(), PipelineConfig::default(), WindowFlags::empty());
        let now = Instant::now();
        fake_backlog(&h.source, 3, now);
        h.source.damage(&mut h.ctx, Rect::new(0, 0, 10, 10), DamageOptions::default(), now);
        let max_delay = h.source.batch.max_delay_duration();
        // batch delay elapses, backlog keeps the region
        h.fire_due(now + Duration::from_millis(60));
        assert!(h.source.delayed().is_some());
        assert!(h.source.soft_expired() >= 1);
        h.fire_due(now + max_delay);
        assert!(h.source.delayed().is_none());
        assert_eq!(h.source.sequence(), 1);
        assert_eq!(h.source.batch.last_actual_delays.last().map(|d| d.1), Some(max_delay.as_millis() as u32));
    }

    #[test]
    fn stale_region_is_dropped_and_refreshed() {
        let mut cfg = PipelineConfig::default();
        cfg.batch.max_delay_ms = 60_000;
        cfg.batch.timeout_delay_ms = 100;
        let mut h = harness(caps(), cfg, WindowFlags::empty());
        let start = Instant::now();
        fake_backlog(&h.source, 3, start);
        h.source.damage(&mut h.ctx, Rect::new(0, 0, 10, 10), DamageOptions::default(), start);
        let created = h.source.delayed().unwrap().created;

        // five soft expiries then the region timeout, all well before max delay
        let mut now = start;
        while h.source.delayed().is_some_and(|d| d.created == created) {
            now += Duration::from_millis(25);
            assert!(now < start + Duration::from_secs(5), "region never timed out");
            h.fire_due(now);
        }
        assert!(now < start + h.source.batch.max_delay_duration());
        assert_eq!(h.source.sequence(), 0);
        assert_eq!(h.source.soft_expired(), 0);
        // the backlog holds the refresh back as a new full window region
        let refresh = h.source.delayed().unwrap();
        assert_eq!(refresh.regions, vec![Rect::full(100, 100)]);
        assert_eq!(refresh.options.quality, Some(100));
    }

    #[test]
    fn region_timeout_for_an_older_region_is_ignored() {
        let mut h = harness(caps(), PipelineConfig::default(), WindowFlags::empty());
        let now = Instant::now();
        fake_backlog(&h.source, 3, now);
        h.source.damage(&mut h.ctx, Rect::new(0, 0, 10, 10), DamageOptions::default(), now);
        let earlier = now.checked_sub(Duration::from_secs(1)).unwrap_or(now);
        h.source.on_timer(&mut h.ctx, TimerEvent::RegionTimeout { created: earlier }, now);
        assert_eq!(h.source.delayed().unwrap().regions, vec![Rect::new(0, 0, 10, 10)]);
    }

    #[test]
    fn transparency_off_removes_alpha_formats() {
        let caps = ClientCapabilities {
            transparency: true,
            rgb_formats: vec!["BGRA".into(), "BGRX".into()],
            ..caps()
        };
        let mut h = harness(caps, PipelineConfig::default(), WindowFlags::HAS_ALPHA);
        assert_eq!(h.source.rgb_formats(), &[PixelFormat::Bgra, PixelFormat::Bgrx]);
        let props = ClientProperties {
            transparency: Some(false),
            ..Default::default()
        };
        h.source.set_client_properties(props).unwrap();
        assert_eq!(h.source.rgb_formats(), &[PixelFormat::Bgrx]);
    }

    #[test]
    fn only_alpha_formats_fall_back_to_rgb() {
        let mut h = harness(caps(), PipelineConfig::default(), WindowFlags::empty());
        let update = PropertyUpdate {
            rgb_formats: Some(vec!["RGBA".into(), "nonsense".into()]),
            ..Default::default()
        };
        h.source.set_client_properties(ClientProperties::from_update(&update)).unwrap();
        assert_eq!(h.source.rgb_formats(), &[PixelFormat::Rgb]);
    }

    #[test]
    fn delta_encodings_are_refiltered() {
        let caps = ClientCapabilities {
            supports_delta: vec!["png".into()],
            delta_buckets: 4,
            ..caps()
        };
        let mut h = harness(caps, PipelineConfig::default(), WindowFlags::empty());
        assert_eq!(h.source.encoder().delta_encodings(), vec![Encoding::Png]);
        let update = PropertyUpdate {
            supports_delta: Some(vec!["rgb32".into(), "jpeg".into(), "bogus".into()]),
            ..Default::default()
        };
        h.source.set_client_properties(ClientProperties::from_update(&update)).unwrap();
        assert_eq!(h.source.encoder().delta_encodings(), vec![Encoding::Rgb32]);
    }

    #[test]
    fn no_buckets_means_no_delta() {
        let caps = ClientCapabilities {
            delta_buckets: 0,
            ..caps()
        };
        let mut h = harness(caps, PipelineConfig::default(), WindowFlags::empty());
        let props = ClientProperties {
            delta_encodings: Some(vec![Encoding::Png]),
            ..Default::default()
        };
        h.source.set_client_properties(props).unwrap();
        assert!(h.source.encoder().delta_encodings().is_empty());
    }

    #[test]
    fn fixed_quality_and_speed() {
        let mut h = harness(caps(), PipelineConfig::default(), WindowFlags::empty());
        h.source.set_quality(70);
        h.source.set_speed(30);
        h.source.set_min_speed(20);
        assert_eq!(h.source.quality(), 70);
        assert_eq!(h.source.speed(), 30);
        assert_eq!(h.source.qs.fixed_min_speed, 20);
        // zero hands control back without touching the current value
        h.source.set_quality(0);
        assert_eq!(h.source.qs.fixed_quality, 0);
        assert_eq!(h.source.quality(), 70);
    }

    #[test]
    fn cancel_voids_everything_pending() {
        let mut h = harness(caps(), PipelineConfig::default(), WindowFlags::empty());
        let now = Instant::now();
        fake_backlog(&h.source, 1, now);
        h.source.damage(&mut h.ctx, Rect::new(0, 0, 10, 10), DamageOptions::default(), now);
        h.source.cancel_damage(&mut h.ctx);
        assert!(h.source.delayed().is_none());
        assert!(h.ctx.timers.is_empty());
        h.source.cleanup(&mut h.ctx);
        assert_eq!(h.source.damage_cancelled(), u64::MAX);
    }

    #[test]
    fn unknown_ack_changes_nothing() {
        let mut h = harness(caps(), PipelineConfig::default(), WindowFlags::empty());
        let ack = DamageAck {
            damage_packet_sequence: 42,
            wid: 1,
            width: 10,
            height: 10,
            decode_time: 1000,
            message: String::new(),
        };
        assert_eq!(h.source.damage_packet_acked(&mut h.ctx, &ack, Instant::now()), None);
        let stats = h.source.stats().lock();
        assert!(stats.client_decode_time.is_empty());
        assert!(stats.late_acks.is_empty());
        assert!(h.ctx.global.lock().client_latency.is_empty());
    }

    #[test]
    fn decode_error_schedules_a_refresh() {
        let mut h = harness(caps(), PipelineConfig::default(), WindowFlags::empty());
        let now = Instant::now();
        {
            let mut stats = h.source.stats().lock();
            stats.record_send_start(7, now, 0, 100);
            stats.record_send_end(7, now, 50, None);
        }
        let ack = DamageAck {
            damage_packet_sequence: 7,
            wid: 1,
            width: 10,
            height: 10,
            decode_time: -1,
            message: "corrupt".into(),
        };
        h.source.damage_packet_acked(&mut h.ctx, &ack, now);
        assert_eq!(h.ctx.global.lock().decode_errors, 1);
        assert_eq!(h.ctx.timers.len(), 1);
        h.fire_due(now + DECODE_ERROR_REFRESH_DELAY);
        assert_eq!(h.source.sequence(), 1);
    }

    #[test]
    fn tray_windows_are_full_frame_and_lossless() {
        let mut h = harness(caps(), PipelineConfig::default(), WindowFlags::TRAY | WindowFlags::HAS_ALPHA);
        assert!(h.source.selector().full_frames_only);
        let now = Instant::now();
        fake_backlog(&h.source, 1, now);
        h.source.damage(&mut h.ctx, Rect::new(1, 1, 2, 2), DamageOptions::default(), now);
        assert_eq!(h.source.delayed().unwrap().regions, vec![Rect::full(100, 100)]);
        let e = h.source.selector().best_encoding(10_000, 50, 10, h.source.encoding());
        assert!(e.is_lossless() && e.supports_alpha());
    }

    #[test]
    fn idle_locks_the_delay() {
        let mut h = harness(caps(), PipelineConfig::default(), WindowFlags::empty());
        h.source.go_idle();
        assert_eq!(h.source.batch.delay, IDLE_DELAY);
        let now = Instant::now();
        h.source.set_property(&mut h.ctx, WindowProperty::Iconic(true), now);
        h.source.no_idle();
        assert!(h.source.batch.locked);
        h.source.set_property(&mut h.ctx, WindowProperty::Iconic(false), now);
        assert!(!h.source.batch.locked);
        assert_eq!(h.source.batch.delay, 50);
    }

    #[test]
    fn suspended_window_ignores_damage() {
        let mut h = harness(caps(), PipelineConfig::default(), WindowFlags::empty());
        h.source.suspend(&mut h.ctx);
        h.source.damage(&mut h.ctx, Rect::full(100, 100), DamageOptions::default(), Instant::now());
        assert_eq!(h.source.sequence(), 0);
        h.source.resume(&mut h.ctx, Instant::now());
        assert_eq!(h.source.sequence(), 1);
    }

    #[test]
    fn encoding_change_falls_back_when_unsupported() {
        let mut h = harness(caps(), PipelineConfig::default(), WindowFlags::empty());
        assert_eq!(h.source.encoding(), Encoding::Png);
        h.source.set_new_encoding(Some(Encoding::Jpeg), false).unwrap();
        assert_eq!(h.source.encoding(), Encoding::Jpeg);
        h.source.set_new_encoding(Some(Encoding::Vp9), false).unwrap();
        assert_eq!(h.source.encoding(), Encoding::Png);
    }
}
