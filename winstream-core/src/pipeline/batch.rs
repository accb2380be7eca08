//! Batch delay: how long a window accumulates damage before encoding.
//!
//! The delay is recalculated from weighted [`Factor`]s: connection level
//! ones (client latency, queue sizes, congestion), window level ones
//! (network delay, decode speed, bandwidth use) and the window state
//! (focus, override-redirect, other windows fullscreen). The previous
//! delays are included as history so the value moves smoothly.

use std::time::{Duration, Instant};

use serde_json::{Value, json};

use crate::config::BatchSection;
use crate::pipeline::maths::{self, Factor, age, logp, queue_inspect};
use crate::pipeline::stats::{GlobalStatistics, Samples, WindowStatistics};

/// Number of past delays remembered.
const DELAY_HISTORY: usize = 64;

// ── BatchConfig ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub always: bool,
    pub max_events: u32,
    pub max_pixels: u64,
    pub time_unit: Duration,
    pub min_delay: u32,
    pub start_delay: u32,
    pub max_delay: u32,
    pub timeout_delay: u32,
    /// Current delay in ms.
    pub delay: u32,
    /// Delay to restore when unlocked.
    pub saved: u32,
    /// The delay is not recalculated while locked.
    pub locked: bool,
    /// Connection wide delay normalised to one megapixel.
    pub delay_per_megapixel: Option<f64>,
    /// `(when, delay)` the batch delay requested.
    pub last_delays: Samples<(Instant, u32)>,
    /// `(when, delay)` regions actually waited.
    pub last_actual_delays: Samples<(Instant, u32)>,
    pub last_updated: Option<Instant>,
    /// Factors of the last recalculation.
    pub factors: Vec<Factor>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self::from_config(&BatchSection::default())
    }
}

impl BatchConfig {
    pub fn from_config(cfg: &BatchSection) -> Self {
        let min_delay = cfg.min_delay_ms.max(1);
        let max_delay = cfg.max_delay_ms.max(min_delay);
        let start_delay = cfg.start_delay_ms.clamp(min_delay, max_delay);
        Self {
            always: cfg.always,
            max_events: cfg.max_events,
            max_pixels: cfg.max_pixels,
            time_unit: cfg.time_unit(),
            min_delay,
            start_delay,
            max_delay,
            timeout_delay: cfg.timeout_delay_ms,
            delay: start_delay,
            saved: start_delay,
            locked: false,
            delay_per_megapixel: None,
            last_delays: Samples::new(DELAY_HISTORY),
            last_actual_delays: Samples::new(DELAY_HISTORY),
            last_updated: None,
            factors: Vec::new(),
        }
    }

    pub fn max_delay_duration(&self) -> Duration {
        Duration::from_millis(u64::from(self.max_delay))
    }

    pub fn record_delay(&mut self, now: Instant, delay: u32) {
        self.last_delays.push((now, delay));
    }

    pub fn record_actual_delay(&mut self, now: Instant, delay: u32) {
        self.last_actual_delays.push((now, delay));
    }

    /// Lock the delay at `delay`, keeping the current value for [`Self::unlock`].
    pub fn lock(&mut self, delay: u32) {
        if !self.locked {
            self.saved = self.delay;
        }
        self.locked = true;
        self.delay = delay;
    }

    pub fn unlock(&mut self) {
        if self.locked {
            self.locked = false;
            self.delay = self.saved;
        }
    }

    pub fn get_info(&self) -> Value {
        let factors: serde_json::Map<String, Value> = self
            .factors
            .iter()
            .map(|f| {
                (
                    f.name.to_string(),
                    json!({"factor": round3(f.factor), "weight": round3(f.weight)}),
                )
            })
            .collect();
        json!({
            "always": self.always,
            "min_delay": self.min_delay,
            "max_delay": self.max_delay,
            "timeout_delay": self.timeout_delay,
            "delay": self.delay,
            "locked": self.locked,
            "delay_per_megapixel": self.delay_per_megapixel.map(|d| d as u64),
            "factors": factors,
        })
    }
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

// ── Calculator ───────────────────────────────────────────────────

/// What the delay calculator needs to know about a window.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WindowState {
    pub wid: u32,
    pub dimensions: (u32, u32),
    pub has_focus: bool,
    pub is_override_redirect: bool,
    pub other_is_fullscreen: bool,
    pub other_is_maximized: bool,
    pub soft_expired: u32,
    /// Bytes per second allocated to this window, `0` for none.
    pub bandwidth_limit: u64,
    pub mmap: bool,
}

/// Reference pixel count for queue based factors.
pub fn low_limit(dimensions: (u32, u32), mmap: bool) -> u64 {
    let (w, h) = dimensions;
    let mut limit = if w > 0 && h > 0 {
        (u64::from(w) * u64::from(h)).max(64)
    } else {
        1024 * 1024
    };
    if mmap {
        limit *= 4;
    }
    limit
}

/// Move `batch.delay` towards the weighted targets of `factors`.
pub fn update_batch_delay(batch: &mut BatchConfig, factors: Vec<Factor>, now: Instant) {
    let current = f64::from(batch.delay);
    let max_delay = f64::from(batch.max_delay);
    // older values matter more when we already batch a lot
    let decay = (logp(current / f64::from(batch.min_delay)) / 5.0).max(1.0);
    let (mut tv, mut tw) = (0.0, 0.0);
    for (delays, d_weight) in [(&batch.last_delays, 0.25), (&batch.last_actual_delays, 0.75)] {
        for &(when, delay) in delays.iter() {
            let w = d_weight / (1.0 + (age(now, when) / decay).powi(2));
            tv += f64::from(delay).clamp(0.0, max_delay) * w;
            tw += w;
        }
    }
    let hist_w = tw;

    let total: f64 = factors.iter().map(|f| f.weight).sum();
    if total <= 0.0 {
        return;
    }
    for f in &factors {
        let target = (current * f.factor).clamp(0.0, max_delay);
        let w = hist_w.max(1.0) * f.weight / total;
        tv += target * w;
        tw += w;
    }
    let floor = if batch.always { f64::from(batch.min_delay) } else { 0.0 };
    let delay = (tv / tw).floor().min(max_delay).max(floor);
    batch.delay = delay as u32;
    batch.last_updated = Some(now);
    batch.factors = factors;
    tracing::trace!(delay = batch.delay, "batch delay updated");
}

/// Recalculate the batch delay of one window.
///
/// Also stores the window's target latency in `stats`.
pub fn calculate_batch_delay(
    batch: &mut BatchConfig,
    window: &WindowState,
    stats: &mut WindowStatistics,
    global: &GlobalStatistics,
    now: Instant,
) {
    if batch.locked {
        return;
    }
    let low_limit = low_limit(window.dimensions, window.mmap);

    let mut factors = stats.get_factors(window.bandwidth_limit, now);
    let target_latency = stats.get_target_client_latency(
        global.min_client_latency,
        global.avg_client_latency,
        0.010,
        now,
    );
    factors.extend(global.get_factors(low_limit, now));
    let queued = global.get_damage_pixels(window.wid);
    factors.push(queue_inspect(
        "damage-packet-queue-pixels",
        &queued,
        now,
        1.0,
        low_limit as f64,
        maths::sqrt,
    ));
    let flag = |b: bool| f64::from(u8::from(b));
    factors.push(Factor::new("focus", flag(!window.has_focus), flag(window.has_focus)));
    factors.push(Factor::new(
        "override-redirect",
        flag(!window.is_override_redirect),
        flag(window.is_override_redirect),
    ));
    factors.push(Factor::new(
        "fullscreen",
        4.0 * flag(window.other_is_fullscreen),
        flag(window.other_is_fullscreen),
    ));
    factors.push(Factor::new(
        "maximized",
        4.0 * flag(window.other_is_maximized),
        flag(window.other_is_maximized),
    ));
    factors.push(Factor::new(
        "soft-expired",
        f64::from(window.soft_expired),
        flag(window.soft_expired > 0),
    ));

    stats.target_latency = target_latency;
    update_batch_delay(batch, factors, now);
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_clamps_start_delay() {
        let cfg = BatchSection {
            min_delay_ms: 20,
            start_delay_ms: 5,
            max_delay_ms: 100,
            ..Default::default()
        };
        let b = BatchConfig::from_config(&cfg);
        assert_eq!(b.delay, 20);
        assert_eq!(b.max_delay_duration(), Duration::from_millis(100));
    }

    #[test]
    fn low_limit_scales_with_window_and_mmap() {
        assert_eq!(low_limit((0, 0), false), 1024 * 1024);
        assert_eq!(low_limit((4, 4), false), 64);
        assert_eq!(low_limit((100, 100), true), 40_000);
    }

    #[test]
    fn no_weight_keeps_delay() {
        let mut b = BatchConfig::default();
        let before = b.delay;
        update_batch_delay(&mut b, vec![Factor::new("x", 10.0, 0.0)], Instant::now());
        assert_eq!(b.delay, before);
        assert!(b.last_updated.is_none());
    }

    #[test]
    fn factor_pulls_delay_and_stays_bounded() {
        let now = Instant::now();
        let mut b = BatchConfig::default();
        update_batch_delay(&mut b, vec![Factor::new("up", 100.0, 1.0)], now);
        assert_eq!(b.delay, b.max_delay);
        update_batch_delay(&mut b, vec![Factor::new("down", 0.0, 1.0)], now);
        assert_eq!(b.delay, 0);
        assert_eq!(b.factors[0].name, "down");
    }

    #[test]
    fn always_batch_keeps_minimum() {
        let mut b = BatchConfig::from_config(&BatchSection {
            always: true,
            ..Default::default()
        });
        update_batch_delay(&mut b, vec![Factor::new("down", 0.0, 1.0)], Instant::now());
        assert_eq!(b.delay, b.min_delay);
    }

    #[test]
    fn history_slows_changes() {
        let now = Instant::now();
        let mut b = BatchConfig::default();
        for _ in 0..10 {
            b.record_actual_delay(now, 50);
        }
        update_batch_delay(&mut b, vec![Factor::new("up", 4.0, 1.0)], now);
        // 7.5 of history at 50ms against a weight of 7.5 at 200ms
        assert_eq!(b.delay, 125);
    }

    #[test]
    fn locked_delay_is_not_recalculated() {
        let now = Instant::now();
        let mut b = BatchConfig::default();
        b.lock(500);
        let mut stats = WindowStatistics::new();
        let global = GlobalStatistics::new();
        calculate_batch_delay(&mut b, &WindowState::default(), &mut stats, &global, now);
        assert_eq!(b.delay, 500);
        b.unlock();
        assert_eq!(b.delay, 50);
    }

    #[test]
    fn unfocused_window_batches_more_than_focused() {
        let now = Instant::now();
        let global = GlobalStatistics::new();
        let run = |focus: bool| {
            let mut b = BatchConfig::default();
            let mut stats = WindowStatistics::new();
            let state = WindowState {
                wid: 1,
                dimensions: (100, 100),
                has_focus: focus,
                ..Default::default()
            };
            calculate_batch_delay(&mut b, &state, &mut stats, &global, now);
            b.delay
        };
        assert!(run(false) >= run(true));
    }
}
