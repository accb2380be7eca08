//! Congestion and quality/speed estimator.
//!
//! Speed goes up when the window falls behind (damage latency, slow
//! client decoding, high pixel rate). Quality goes down under backlog,
//! long batch delays, worsening compression and client latency, and
//! goes back up when the window is quiet. Congestion events discount
//! both and may raise a rate-limited bandwidth advisory.

use std::time::{Duration, Instant};

use crate::config::CongestionSection;
use crate::pipeline::batch::{BatchConfig, low_limit};
use crate::pipeline::maths::{
    self, age, calculate_timesize_weighted_average_score, logp, time_weighted_average,
};
use crate::pipeline::stats::{GlobalStatistics, Samples, WindowStatistics};

const QS_HISTORY: usize = 100;

/// Detected send speeds above this are not trusted.
const MAX_DETECTED_SPEED: f64 = 20.0 * 1024.0 * 1024.0;

// ── Targets ──────────────────────────────────────────────────────

/// Target encoding speed in `[min_speed, 100]`.
///
/// `speed_data` holds the `(when, speed)` values used recently.
#[allow(clippy::too_many_arguments)]
pub fn get_target_speed(
    dimensions: (u32, u32),
    batch: &BatchConfig,
    global: &GlobalStatistics,
    stats: &WindowStatistics,
    bandwidth_limit: u64,
    min_speed: u8,
    speed_data: &[(Instant, f64)],
    now: Instant,
) -> f64 {
    let low_limit = low_limit(dimensions, global.mmap_size > 0);
    let mpixels = low_limit as f64 / 1024.0 / 1024.0;
    // larger windows are allowed a higher damage latency
    let ref_damage_latency = 0.010 + 0.025 * (1.0 + mpixels.max(1.0).ln());
    let avg_in = stats.avg_damage_in_latency.unwrap_or(0.0);
    let dam_lat_abs = ((avg_in - ref_damage_latency) / (ref_damage_latency * 4.0)).max(0.0);

    let dam_lat_rel = if batch.locked {
        0.0
    } else {
        let avg_delay = time_weighted_average(
            batch.last_actual_delays.iter().map(|&(t, d)| (t, f64::from(d))),
            now,
            0.1,
            2.0,
        )
        .unwrap_or(f64::from(batch.delay));
        let frame_delay = (avg_delay + f64::from(batch.delay)) / 2.0;
        // spend at least as much time encoding as batching
        let target_damage_latency = ref_damage_latency.max(frame_delay / 1000.0);
        let speed = time_weighted_average(speed_data.iter().copied(), now, 0.1, 2.0)
            .map_or(f64::from(min_speed), |s| s.max(f64::from(min_speed)));
        speed / 100.0 * avg_in / target_damage_latency
    };

    // slow clients: at least one megapixel per second
    let min_decode_speed = 1_000_000.0;
    let dec_lat = match stats.avg_decode_speed {
        Some(ads) if ads > 0.0 && ads < 4.0 * min_decode_speed => min_decode_speed / ads,
        _ => 0.0,
    };

    let recent: Vec<u64> = stats
        .last_damage_events
        .iter()
        .filter(|(t, _)| age(now, *t) <= 1.0)
        .map(|(_, r)| r.area())
        .collect();
    let pps = if recent.len() > 5 {
        // 50 megapixels per second is full speed
        recent.iter().sum::<u64>() as f64 / 1024.0 / 1024.0 / 50.0
    } else {
        0.0
    };

    let max_speed = if bandwidth_limit > 0 {
        maths::sqrt(bandwidth_limit as f64 / 10_000_000.0)
    } else {
        1.0
    };

    let target = [dam_lat_abs, dam_lat_rel, dec_lat, pps, 0.0]
        .into_iter()
        .fold(0.0, f64::max)
        .min(max_speed)
        .min(1.0);
    let target = target / (1.0 + global.congestion_value * 20.0);
    let ms = f64::from(min_speed).clamp(0.0, 100.0);
    (ms + (100.0 - ms) * target).floor()
}

/// Target encoding quality in `[min_quality, 100]`.
#[allow(clippy::too_many_arguments)]
pub fn get_target_quality(
    dimensions: (u32, u32),
    batch: &BatchConfig,
    global: &GlobalStatistics,
    stats: &mut WindowStatistics,
    bandwidth_limit: u64,
    min_quality: u8,
    min_speed: u8,
    now: Instant,
) -> f64 {
    let low_limit = low_limit(dimensions, global.mmap_size > 0);
    let (packets_backlog, pixels_backlog, _) = stats.get_client_backlog(now);
    let pb_ratio = pixels_backlog as f64 / low_limit as f64;
    // four frames behind is minimum quality
    let mut target = 1.0 - logp((pb_ratio / 4.0).floor());

    let recs = batch.last_actual_delays.len() as f64;
    if recs > 0.0 && !batch.locked {
        // blend start and min delay so a fresh window is not penalised
        let ref_delay = (f64::from(batch.start_delay) * 10.0 / recs + f64::from(batch.min_delay) * recs)
            / (recs + 10.0 / recs);
        let batch_q = 4.0 * ref_delay / f64::from(batch.min_delay.max(batch.delay).max(1));
        target = target.min(batch_q).min(1.0);
    }

    let es: Vec<(Instant, f64, f64)> = stats
        .encoding_stats
        .iter()
        .filter(|r| r.pixels >= 4096)
        .map(|r| {
            let score = (1000 * r.compressed_size * u64::from(r.bpp) / r.pixels / 32) as f64;
            (r.when, r.pixels as f64, score)
        })
        .collect();
    if es.len() >= 2 {
        if let Some((ascore, rscore)) = calculate_timesize_weighted_average_score(&es, now) {
            let bump = if ascore > rscore {
                if packets_backlog == 0 {
                    logp((150.0 + ascore) / (150.0 + rscore)) - 1.0
                } else {
                    0.0
                }
            } else {
                let mult = (1000.0 + rscore) / 2000.0;
                -logp((50.0 + rscore) / (50.0 + ascore) - 1.0) * mult
            };
            target += bump;
        }
    }

    let recent_latency = global
        .recent_client_latency
        .filter(|r| *r > 0.0 && !global.client_latency.is_empty());
    if let Some(recent) = recent_latency {
        target = target.min(3.0 * stats.target_latency / recent);
    }

    let max_quality = if bandwidth_limit > 0 {
        maths::sqrt(bandwidth_limit as f64 / 10_000_000.0)
    } else {
        1.0
    };
    target = target.max(0.0).min(max_quality);
    if min_speed > 0 {
        target = target.powf((100.0 + 4.0 * f64::from(min_speed)) / 100.0);
    }

    let (ww, wh) = dimensions;
    if ww > 0 && wh > 0 {
        let (mut pixl5, mut pixn5) = (0u64, 0u64);
        for (t, r) in stats.last_damage_events.iter() {
            let a = age(now, *t);
            // one second buckets, 1 to 10 seconds old
            let lim = a.floor() as u64 + 1;
            if a <= 0.0 || lim > 10 {
                continue;
            }
            if lim <= 5 {
                pixl5 += r.area();
            } else {
                pixn5 += r.area();
            }
        }
        let pct = pixl5 as f64 / (f64::from(ww) * f64::from(wh));
        if pct <= 0.5 {
            target = (target + (1.0 - pct * 2.0)).min(1.0);
        }
        if pixl5 < pixn5 {
            target = target.sqrt();
        }
    }

    target /= 1.0 + global.congestion_value * 10.0;
    let mq = f64::from(min_quality).clamp(0.0, 100.0);
    mq + (100.0 - mq) * target
}

// ── QualitySpeed ─────────────────────────────────────────────────

/// Current quality and speed of a window, with their recent history.
#[derive(Debug, Clone)]
pub struct QualitySpeed {
    /// `0` lets the estimator decide.
    pub fixed_quality: u8,
    pub fixed_min_quality: u8,
    pub fixed_speed: u8,
    pub fixed_min_speed: u8,
    pub quality_history: Samples<(Instant, f64)>,
    pub speed_history: Samples<(Instant, f64)>,
    pub quality: u8,
    pub speed: u8,
}

impl QualitySpeed {
    pub fn new(quality: u8, min_quality: u8, speed: u8, min_speed: u8) -> Self {
        Self {
            fixed_quality: 0,
            fixed_min_quality: min_quality.min(100),
            fixed_speed: 0,
            fixed_min_speed: min_speed.min(100),
            quality_history: Samples::new(QS_HISTORY),
            speed_history: Samples::new(QS_HISTORY),
            quality: quality.min(100),
            speed: speed.min(100),
        }
    }

    pub fn set_quality(&mut self, quality: u8) {
        self.fixed_quality = quality.min(100);
        if quality > 0 {
            self.quality = self.fixed_quality;
        }
    }

    pub fn set_min_quality(&mut self, quality: u8) {
        self.fixed_min_quality = quality.min(100);
    }

    pub fn set_speed(&mut self, speed: u8) {
        self.fixed_speed = speed.min(100);
        if speed > 0 {
            self.speed = self.fixed_speed;
        }
    }

    pub fn set_min_speed(&mut self, speed: u8) {
        self.fixed_min_speed = speed.min(100);
    }

    /// Smooth `target(history)` into the current speed.
    pub fn update_speed(&mut self, now: Instant, target: impl FnOnce(&[(Instant, f64)]) -> f64) -> u8 {
        let speed = if self.fixed_speed > 0 {
            f64::from(self.fixed_speed.min(100))
        } else {
            let mut data: Vec<_> = self.speed_history.iter().copied().collect();
            let target = target(&data);
            data.push((now, target));
            let smoothed = time_weighted_average(data, now, 1.0, 1.1).unwrap_or(target);
            smoothed.max(f64::from(self.fixed_min_speed)).min(99.0)
        };
        self.speed = speed as u8;
        self.speed_history.push((now, f64::from(self.speed)));
        self.speed
    }

    /// Smooth `target` into the current quality.
    ///
    /// `lossless` pins the quality at 100.
    pub fn update_quality(&mut self, now: Instant, lossless: bool, target: impl FnOnce() -> f64) -> u8 {
        let quality = if lossless {
            100.0
        } else if self.fixed_quality > 0 {
            f64::from(self.fixed_quality.min(100))
        } else {
            let target = target();
            let mut data: Vec<_> = self.quality_history.iter().copied().collect();
            data.push((now, target));
            let smoothed = time_weighted_average(data, now, 0.1, 1.2).unwrap_or(target);
            smoothed.max(f64::from(self.fixed_min_quality)).min(99.0)
        };
        self.quality = quality as u8;
        self.quality_history.push((now, f64::from(self.quality)));
        self.quality
    }
}

// ── Congestion ───────────────────────────────────────────────────

/// Congestion events and the bandwidth advisory of one connection.
#[derive(Debug, Clone)]
pub struct CongestionTracker {
    cfg: CongestionSection,
    detection: bool,
    warning_time: Option<Instant>,
}

impl CongestionTracker {
    pub fn new(cfg: CongestionSection, detection: bool) -> Self {
        Self {
            cfg,
            detection,
            warning_time: None,
        }
    }

    pub fn detection(&self) -> bool {
        self.detection
    }

    /// Record one congestion event.
    ///
    /// Returns `true` when an advisory should be sent now.
    pub fn record(&mut self, global: &mut GlobalStatistics, late_pct: f64, send_speed: f64, now: Instant) -> bool {
        if !self.detection {
            return false;
        }
        global.record_congestion(now, late_pct, send_speed);
        if self.cfg.warning_event_count == 0 {
            return false;
        }
        let repeat = Duration::from_secs(self.cfg.repeat_delay_s);
        if self.warning_time.is_some_and(|t| now.saturating_duration_since(t) <= repeat) {
            return false;
        }
        let window = Duration::from_secs(self.cfg.warning_window_s);
        let recent = global
            .congestion_send_speed
            .iter()
            .filter(|(t, _, _)| now.saturating_duration_since(*t) <= window)
            .count();
        if recent <= self.cfg.warning_event_count {
            return false;
        }
        self.warning_time = Some(now);
        tracing::warn!(events = recent, send_speed = send_speed as u64, "network congestion");
        true
    }
}

/// Soft bandwidth limit of a connection, bytes per second, `0` for none.
pub fn soft_bandwidth_limit(explicit: u64, detected_speed: f64, min_bandwidth: u64) -> u64 {
    let mut limit = if detected_speed > 0.0 && detected_speed <= MAX_DETECTED_SPEED {
        detected_speed as u64
    } else {
        0
    };
    if explicit > 0 {
        limit = if limit > 0 { limit.min(explicit) } else { explicit };
    }
    if limit > 0 {
        limit = limit.max(min_bandwidth);
    }
    limit
}

/// Split `limit` over `(wid, weight)` windows.
///
/// Each window first gets `min(min_bandwidth / 10, limit / n)`, the rest
/// is shared proportionally to the weights. The allocations never add
/// up to more than `limit`.
pub fn distribute_bandwidth(limit: u64, windows: &[(u32, u64)], min_bandwidth: u64) -> Vec<(u32, u64)> {
    let n = windows.len() as u64;
    if n == 0 {
        return Vec::new();
    }
    let floor = (min_bandwidth / 10).min(limit / n);
    let remaining = u128::from(limit - floor * n);
    let total: u128 = windows.iter().map(|&(_, w)| u128::from(w)).sum();
    windows
        .iter()
        .map(|&(wid, w)| {
            let share = if total > 0 {
                remaining * u128::from(w) / total
            } else {
                remaining / u128::from(n)
            };
            (wid, floor + share as u64)
        })
        .collect()
}

/// New bandwidth cap after the client accepted the congestion advisory.
pub fn lower_bandwidth(current_limit: u64, detected_speed: f64, min_bandwidth: u64) -> u64 {
    const CAP: u64 = 50 * 1024 * 1024;
    const LOW: u64 = 256 * 1024;
    let limit = if current_limit > LOW { current_limit / 2 } else { CAP };
    let css = detected_speed as u64;
    let css = if css > LOW { css / 16384 * 16384 } else { CAP };
    limit.min(css).max(min_bandwidth)
}

// ── Tests ────────────────────────────────────────────────────────
