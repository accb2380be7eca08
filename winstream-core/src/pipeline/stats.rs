//! Bounded sample histories and the statistics built on them.
//!
//! [`GlobalStatistics`] is per connection, [`WindowStatistics`] per window.
//! Both are shared behind a `parking_lot::Mutex` by the event loop, the
//! encode worker and the network writer. Nothing here keeps unbounded
//! history: every series is a [`Samples`] ring.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{Value, json};

use crate::codec::Encoding;
use crate::geometry::Rect;
use crate::pipeline::maths::{
    self, Aim, Factor, age, calculate_for_average, calculate_for_target,
    calculate_size_weighted_average, calculate_time_weighted_average,
    calculate_timesize_weighted_average, logp, queue_inspect,
};

/// Default capacity of a sample history.
pub const NRECS: usize = 500;

/// Acks older than this are considered lost.
const DROPPED_ACK_AGE: Duration = Duration::from_secs(60);

pub type SharedGlobalStatistics = Arc<Mutex<GlobalStatistics>>;
pub type SharedWindowStatistics = Arc<Mutex<WindowStatistics>>;

// ── Samples ──────────────────────────────────────────────────────

/// Ring buffer that drops its oldest entry when full.
#[derive(Debug, Clone)]
pub struct Samples<T> {
    buf: VecDeque<T>,
    cap: usize,
}

impl<T> Samples<T> {
    pub fn new(cap: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(cap.min(64)),
            cap: cap.max(1),
        }
    }

    pub fn push(&mut self, value: T) {
        if self.buf.len() == self.cap {
            self.buf.pop_front();
        }
        self.buf.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.buf.iter()
    }

    pub fn last(&self) -> Option<&T> {
        self.buf.back()
    }

    /// `n`-th entry from the end, `0` being the newest.
    pub fn nth_back(&self, n: usize) -> Option<&T> {
        self.buf.iter().rev().nth(n)
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

impl<T> Default for Samples<T> {
    fn default() -> Self {
        Self::new(NRECS)
    }
}

// ── GlobalStatistics ─────────────────────────────────────────────

/// Statistics shared by all the windows of one connection.
#[derive(Debug)]
pub struct GlobalStatistics {
    /// Size of the shared memory area, `0` without mmap.
    pub mmap_size: usize,
    pub mmap_free_size: usize,
    pub mmap_bytes_sent: u64,
    /// `(when, items)` sampled on every encode worker enqueue.
    pub compression_work_qsizes: Samples<(Instant, f64)>,
    /// `(when, packets)` sampled on every bulk enqueue.
    pub packet_qsizes: Samples<(Instant, f64)>,
    /// `(when, wid, pixels)` queued on the bulk lane for that window.
    pub damage_packet_qpixels: Samples<(Instant, u32, u64)>,
    /// `(wid, when, pixels)` of every damage event.
    pub damage_last_events: Samples<(u32, Instant, u64)>,
    /// `(wid, when, pixels, seconds)` from send start to ack.
    pub client_latency: Samples<(u32, Instant, u64, f64)>,
    /// `(when, late percentage, send speed)` of congestion events.
    pub congestion_send_speed: Samples<(Instant, f64, f64)>,
    /// `(when, cumulative bytes)` written by the network writer.
    pub bytes_sent: Samples<(Instant, u64)>,
    pub last_congestion_time: Option<Instant>,
    pub congestion_value: f64,
    pub damage_events_count: u64,
    pub packet_count: u64,
    pub decode_errors: u64,
    pub min_client_latency: Option<f64>,
    pub avg_client_latency: Option<f64>,
    pub recent_client_latency: Option<f64>,
    /// Bytes per second, `0.0` until enough congestion events were seen.
    pub avg_congestion_send_speed: f64,
}

impl Default for GlobalStatistics {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalStatistics {
    pub fn new() -> Self {
        Self {
            mmap_size: 0,
            mmap_free_size: 0,
            mmap_bytes_sent: 0,
            compression_work_qsizes: Samples::new(NRECS),
            packet_qsizes: Samples::new(NRECS),
            damage_packet_qpixels: Samples::new(NRECS),
            damage_last_events: Samples::new(NRECS),
            client_latency: Samples::new(NRECS),
            congestion_send_speed: Samples::new(NRECS / 4),
            bytes_sent: Samples::new(NRECS / 4),
            last_congestion_time: None,
            congestion_value: 0.0,
            damage_events_count: 0,
            packet_count: 0,
            decode_errors: 0,
            min_client_latency: None,
            avg_client_latency: None,
            recent_client_latency: None,
            avg_congestion_send_speed: 0.0,
        }
    }

    pub fn shared() -> SharedGlobalStatistics {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn reset(&mut self) {
        *self = Self {
            mmap_size: self.mmap_size,
            mmap_free_size: self.mmap_free_size,
            ..Self::new()
        };
    }

    /// Record the latency of one acked packet. `decode_time` is in microseconds.
    pub fn record_latency(
        &mut self,
        wid: u32,
        decode_time: i64,
        start_send_at: Instant,
        pixels: u64,
        now: Instant,
    ) {
        let decode = decode_time.max(0) as f64 / 1_000_000.0;
        let send_latency = (age(now, start_send_at) - decode).max(0.0);
        if self.min_client_latency.is_none_or(|m| m > send_latency) {
            self.min_client_latency = Some(send_latency);
        }
        self.client_latency.push((wid, now, pixels, send_latency));
    }

    pub fn record_congestion(&mut self, now: Instant, late_pct: f64, send_speed: f64) {
        self.congestion_send_speed.push((now, late_pct, send_speed));
        self.last_congestion_time = Some(now);
    }

    /// `(when, pixels)` queued for `wid` on the bulk lane.
    pub fn get_damage_pixels(&self, wid: u32) -> Vec<(Instant, f64)> {
        self.damage_packet_qpixels
            .iter()
            .filter(|&&(_, w, _)| w == wid)
            .map(|&(t, _, px)| (t, px as f64))
            .collect()
    }

    pub fn update_averages(&mut self, now: Instant) {
        if !self.client_latency.is_empty() {
            let data: Vec<(Instant, f64)> = self
                .client_latency
                .iter()
                .map(|&(_, when, _, latency)| (when, latency))
                .collect();
            self.min_client_latency = data.iter().map(|d| d.1).reduce(f64::min);
            if let Some((avg, recent)) = calculate_time_weighted_average(data, now) {
                self.avg_client_latency = Some(avg);
                self.recent_client_latency = Some(recent);
            }
        }

        let cutoff = Duration::from_secs(60);
        let css: Vec<(Instant, f64, f64)> = self
            .congestion_send_speed
            .iter()
            .filter(|(t, _, _)| now.saturating_duration_since(*t) <= cutoff)
            .copied()
            .collect();
        self.avg_congestion_send_speed = if css.len() > 2 {
            calculate_size_weighted_average(&css, now).map_or(0.0, |(avg, _)| avg)
        } else {
            0.0
        };

        // per second event counts over the last 10 seconds
        let counts: Vec<(Instant, f64)> = (0..10u64)
            .filter_map(|t| {
                let end = now.checked_sub(Duration::from_secs(t))?;
                let start = end.checked_sub(Duration::from_secs(1))?;
                let n = css.iter().filter(|(w, _, _)| *w > start && *w <= end).count();
                Some((end, n as f64))
            })
            .collect();
        self.congestion_value = maths::time_weighted_average(counts, now, 0.1, 2.0).unwrap_or(0.0);
    }

    /// Connection level inputs to the batch delay of a window of `pixel_count` pixels.
    pub fn get_factors(&self, pixel_count: u64, now: Instant) -> Vec<Factor> {
        let mut factors = Vec::with_capacity(6);
        if let (Some(min), Some(avg), Some(recent)) = (
            self.min_client_latency,
            self.avg_client_latency,
            self.recent_client_latency,
        ) {
            let target = 0.005 + min;
            factors.push(calculate_for_target(
                "client-latency",
                target,
                avg,
                recent,
                Aim {
                    aim: 0.8,
                    slope: 0.005,
                    smoothing: maths::sqrt,
                    weight_multiplier: logp(target / 0.020),
                    ..Default::default()
                },
            ));
        }
        let qsizes: Vec<_> = self.packet_qsizes.iter().copied().collect();
        factors.push(queue_inspect("packet-queue-size", &qsizes, now, 1.0, 1.0, maths::sqrt));
        let qpixels: Vec<_> = self
            .damage_packet_qpixels
            .iter()
            .map(|&(t, _, px)| (t, px as f64))
            .collect();
        factors.push(queue_inspect(
            "packet-queue-pixels",
            &qpixels,
            now,
            1.0,
            pixel_count.max(1) as f64,
            maths::sqrt,
        ));
        let work: Vec<_> = self.compression_work_qsizes.iter().copied().collect();
        factors.push(queue_inspect("compression-work-queue", &work, now, 1.0, 1.0, logp));
        if self.mmap_size > 0 {
            let full = 1.0 - self.mmap_free_size as f64 / self.mmap_size as f64;
            factors.push(Factor::new("mmap-area", logp(3.0 * full), (3.0 * full).powi(2)));
        }
        if self.congestion_value > 0.0 {
            let cv = self.congestion_value;
            factors.push(Factor::new("congestion", 1.0 + cv, cv * 10.0));
        }
        factors
    }

    pub fn get_info(&self) -> Value {
        json!({
            "damage_events": self.damage_events_count,
            "packets": self.packet_count,
            "decode_errors": self.decode_errors,
            "congestion_value": self.congestion_value,
            "avg_congestion_send_speed": self.avg_congestion_send_speed as u64,
            "client_latency": {
                "min": self.min_client_latency.map(secs_to_ms),
                "avg": self.avg_client_latency.map(secs_to_ms),
                "recent": self.recent_client_latency.map(secs_to_ms),
            },
            "mmap": {
                "size": self.mmap_size,
                "free": self.mmap_free_size,
                "bytes_sent": self.mmap_bytes_sent,
            },
        })
    }
}

fn secs_to_ms(v: f64) -> u64 {
    (v * 1000.0).round() as u64
}

// ── WindowStatistics ─────────────────────────────────────────────

/// One packet waiting for the client's ack.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PendingAck {
    pub start_send_at: Instant,
    pub start_bytes: u64,
    /// `None` until the network writer has finished the packet.
    pub end_send_at: Option<Instant>,
    pub end_bytes: u64,
    pub pixels: u64,
}

impl PendingAck {
    pub fn bytes(&self) -> u64 {
        self.end_bytes.saturating_sub(self.start_bytes)
    }
}

/// One encoded packet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncodingRecord {
    pub when: Instant,
    pub encoding: Encoding,
    pub pixels: u64,
    pub bpp: u8,
    pub compressed_size: u64,
    pub elapsed: f64,
}

/// Result of processing an ack that matched a pending packet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AckOutcome {
    pub pending: PendingAck,
    /// `Some((late percentage, send speed))` when the window is congested.
    pub congestion: Option<(f64, f64)>,
}

/// Per window history of damage, encoding and acknowledgements.
#[derive(Debug)]
pub struct WindowStatistics {
    /// `(when, pixels, decode microseconds)` reported by the client.
    pub client_decode_time: Samples<(Instant, u64, f64)>,
    pub encoding_stats: Samples<EncodingRecord>,
    /// `(when, pixels, seconds)` from damage to queued packet.
    pub damage_in_latency: Samples<(Instant, u64, f64)>,
    /// `(when, pixels, seconds)` from damage to sent packet.
    pub damage_out_latency: Samples<(Instant, u64, f64)>,
    /// `(when, bytes, seconds)` spent writing each packet.
    pub damage_send_speed: Samples<(Instant, u64, f64)>,
    pub damage_ack_pending: HashMap<u64, PendingAck>,
    /// Sequence to `(queued at, pixels)` while the encode worker has it.
    pub encoding_pending: HashMap<u64, (Instant, u64)>,
    pub last_damage_events: Samples<(Instant, Rect)>,
    /// `(when, late)` of acks over the recent past.
    pub late_acks: Samples<(Instant, bool)>,
    /// `(frames, pixels)` per encoding name, `"delta"` included.
    pub encoding_totals: BTreeMap<String, (u64, u64)>,
    pub damage_events_count: u64,
    pub packet_count: u64,
    pub last_damage_event_time: Option<Instant>,
    pub last_resized: Option<Instant>,
    pub avg_damage_in_latency: Option<f64>,
    pub recent_damage_in_latency: Option<f64>,
    pub avg_damage_out_latency: Option<f64>,
    pub recent_damage_out_latency: Option<f64>,
    /// Pixels per second decoded by the client.
    pub avg_decode_speed: Option<f64>,
    pub recent_decode_speed: Option<f64>,
    pub avg_send_speed: Option<f64>,
    /// Seconds; set by the batch delay calculator.
    pub target_latency: f64,
    pub max_latency: f64,
}

impl Default for WindowStatistics {
    fn default() -> Self {
        Self::new()
    }
}

impl WindowStatistics {
    pub fn new() -> Self {
        Self {
            client_decode_time: Samples::new(NRECS),
            encoding_stats: Samples::new(NRECS),
            damage_in_latency: Samples::new(NRECS),
            damage_out_latency: Samples::new(NRECS),
            damage_send_speed: Samples::new(NRECS),
            damage_ack_pending: HashMap::new(),
            encoding_pending: HashMap::new(),
            last_damage_events: Samples::new(NRECS),
            late_acks: Samples::new(NRECS),
            encoding_totals: BTreeMap::new(),
            damage_events_count: 0,
            packet_count: 0,
            last_damage_event_time: None,
            last_resized: None,
            avg_damage_in_latency: None,
            recent_damage_in_latency: None,
            avg_damage_out_latency: None,
            recent_damage_out_latency: None,
            avg_decode_speed: None,
            recent_decode_speed: None,
            avg_send_speed: None,
            target_latency: 0.1,
            max_latency: 0.1,
        }
    }

    pub fn shared() -> SharedWindowStatistics {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    // ── Send tracking ────────────────────────────────────────────

    /// The network writer started sending packet `sequence`.
    pub fn record_send_start(&mut self, sequence: u64, when: Instant, bytes: u64, pixels: u64) {
        self.damage_ack_pending.insert(
            sequence,
            PendingAck {
                start_send_at: when,
                start_bytes: bytes,
                end_send_at: None,
                end_bytes: 0,
                pixels,
            },
        );
    }

    /// The network writer finished sending packet `sequence`.
    /// `damage_time` is when the damage that produced it was recorded.
    pub fn record_send_end(
        &mut self,
        sequence: u64,
        when: Instant,
        bytes: u64,
        damage_time: Option<Instant>,
    ) {
        let Some(pending) = self.damage_ack_pending.get_mut(&sequence) else {
            return;
        };
        pending.end_send_at = Some(when);
        pending.end_bytes = bytes;
        let (pixels, sent, start) = (pending.pixels, pending.bytes(), pending.start_send_at);
        self.damage_send_speed.push((when, sent, age(when, start)));
        if let Some(damage_time) = damage_time {
            self.damage_out_latency.push((when, pixels, age(when, damage_time)));
        }
    }

    /// Process the ack of `sequence`.
    ///
    /// Returns `None` for sequences that are not pending: nothing is
    /// recorded for those.
    pub fn record_ack(
        &mut self,
        sequence: u64,
        pixels: u64,
        decode_time: i64,
        tolerance: Duration,
        late_pct_threshold: u32,
        now: Instant,
    ) -> Option<AckOutcome> {
        let pending = self.damage_ack_pending.remove(&sequence)?;
        let mut congestion = None;
        if let (Some(end_send_at), true) = (pending.end_send_at, pending.bytes() > 0) {
            if decode_time > 0 {
                self.client_decode_time.push((now, pixels, decode_time as f64));
            }
            let decode = decode_time.max(0) as f64 / 1_000_000.0;
            let ack_latency = age(now, end_send_at) - decode;
            let late = ack_latency > self.target_latency + tolerance.as_secs_f64();
            self.late_acks.push((now, late));
            congestion = self.late_congestion(now, late_pct_threshold);
        }
        Some(AckOutcome {
            pending,
            congestion,
        })
    }

    fn late_congestion(&self, now: Instant, threshold: u32) -> Option<(f64, f64)> {
        let recent: Vec<bool> = self
            .late_acks
            .iter()
            .filter(|(t, _)| age(now, *t) <= 1.0)
            .map(|&(_, late)| late)
            .collect();
        if recent.len() < 4 {
            return None;
        }
        let late_pct = 100.0 * recent.iter().filter(|l| **l).count() as f64 / recent.len() as f64;
        if late_pct <= f64::from(threshold) {
            return None;
        }
        Some((late_pct, self.avg_send_speed.unwrap_or(0.0)))
    }

    // ── Backlogs ─────────────────────────────────────────────────

    fn sent_before(&self, now: Instant) -> Option<Instant> {
        now.checked_sub(Duration::from_secs_f64(self.target_latency.max(0.0) + 0.020))
    }

    /// Packets sent long enough ago that their ack should be here.
    pub fn get_packets_backlog(&self, now: Instant) -> usize {
        let Some(sent_before) = self.sent_before(now) else {
            return 0;
        };
        self.damage_ack_pending
            .values()
            .filter(|p| p.end_send_at.is_some() && p.start_send_at <= sent_before)
            .count()
    }

    /// `(packets, pixels, bytes)` not acked yet. Drops acks that will never come.
    pub fn get_client_backlog(&mut self, now: Instant) -> (usize, u64, u64) {
        let Some(sent_before) = self.sent_before(now) else {
            return (0, 0, 0);
        };
        let dropped_before = now.checked_sub(DROPPED_ACK_AGE);
        let (mut packets, mut pixels, mut bytes) = (0, 0, 0);
        self.damage_ack_pending.retain(|_, p| {
            if p.end_send_at.is_none() || p.start_send_at > sent_before {
                return true;
            }
            if dropped_before.is_some_and(|d| p.start_send_at < d) {
                return false;
            }
            packets += 1;
            pixels += p.pixels;
            bytes += p.bytes();
            true
        });
        (packets, pixels, bytes)
    }

    /// `(pixels, regions)` handed to the encode worker but not encoded yet.
    pub fn get_pixels_encoding_backlog(&self) -> (u64, usize) {
        let pixels = self.encoding_pending.values().map(|&(_, px)| px).sum();
        (pixels, self.encoding_pending.len())
    }

    pub fn get_acks_pending(&self) -> usize {
        self.damage_ack_pending.len()
    }

    /// Pixels damaged within `window` before `now`.
    pub fn recent_damage_pixels(&self, now: Instant, window: Duration) -> u64 {
        self.last_damage_events
            .iter()
            .filter(|(t, _)| now.saturating_duration_since(*t) <= window)
            .map(|(_, r)| r.area())
            .sum()
    }

    // ── Averages ─────────────────────────────────────────────────

    /// Latency we should be able to achieve, in seconds.
    pub fn get_target_client_latency(
        &self,
        min_client_latency: Option<f64>,
        avg_client_latency: Option<f64>,
        abs_min: f64,
        now: Instant,
    ) -> f64 {
        let data: Vec<(Instant, f64)> = self
            .client_decode_time
            .iter()
            .map(|&(t, _, us)| (t, us / 1_000_000.0))
            .collect();
        let decoding_latency = calculate_time_weighted_average(data, now).map_or(0.010, |(avg, _)| avg);
        let min_latency = abs_min.max(min_client_latency.unwrap_or(abs_min)) * 1.2;
        let avg_latency = min_latency.max(avg_client_latency.unwrap_or(abs_min));
        let max_latency = 2.0 * min_latency;
        abs_min.max(max_latency.min((min_latency * avg_latency).sqrt())) + decoding_latency
    }

    pub fn update_averages(&mut self, now: Instant) {
        if !self.client_decode_time.is_empty() {
            let data: Vec<_> = self
                .client_decode_time
                .iter()
                .map(|&(t, px, us)| (t, px as f64, us))
                .collect();
            if let Some((avg, recent)) = calculate_timesize_weighted_average(&data, now, 1_000_000.0) {
                self.avg_decode_speed = Some(avg);
                self.recent_decode_speed = Some(recent);
            }
        }
        let latency = |s: &Samples<(Instant, u64, f64)>| {
            calculate_time_weighted_average(s.iter().map(|&(t, _, l)| (t, l)), now)
        };
        if let Some((avg, recent)) = latency(&self.damage_in_latency) {
            self.avg_damage_in_latency = Some(avg);
            self.recent_damage_in_latency = Some(recent);
        }
        if let Some((avg, recent)) = latency(&self.damage_out_latency) {
            self.avg_damage_out_latency = Some(avg);
            self.recent_damage_out_latency = Some(recent);
        }
        if !self.damage_send_speed.is_empty() {
            let data: Vec<_> = self
                .damage_send_speed
                .iter()
                .map(|&(t, b, e)| (t, b as f64, e))
                .collect();
            self.avg_send_speed = calculate_timesize_weighted_average(&data, now, 1.0).map(|(avg, _)| avg);
        }
        self.max_latency = [
            Some(0.1),
            self.avg_damage_in_latency,
            self.recent_damage_in_latency,
            self.avg_damage_out_latency,
            self.recent_damage_out_latency,
        ]
        .into_iter()
        .flatten()
        .fold(0.0, f64::max);
    }

    /// Window level inputs to the batch delay.
    ///
    /// `bandwidth_limit` is in bytes per second, `0` for none.
    pub fn get_factors(&self, bandwidth_limit: u64, now: Instant) -> Vec<Factor> {
        let mut factors = Vec::with_capacity(4);
        let mut add = |f: Factor| {
            if f.weight > 0.01 {
                factors.push(f);
            }
        };

        if let (Some(ai), Some(ri), Some(ao), Some(ro)) = (
            self.avg_damage_in_latency,
            self.recent_damage_in_latency,
            self.avg_damage_out_latency,
            self.recent_damage_out_latency,
        ) {
            // the difference between in and out latency is the time spent sending
            let ad = (0.040 + ao - ai).max(0.010);
            let rd = (0.040 + ro - ri).max(0.010);
            add(calculate_for_average("damage-network-delay", ad, rd, 0.5, 1.0));
        }

        if let (Some(ads), Some(rds)) = (self.avg_decode_speed, self.recent_decode_speed) {
            if ads > 0.0 && rds > 0.0 {
                // time to decode one megapixel, lower is better
                let avg = 1024.0 * 1024.0 / ads;
                let recent = 1024.0 * 1024.0 / rds;
                let weight_div = (rds / 4_000_000.0).max(0.25);
                add(calculate_for_average("client-decode-speed", avg, recent, 0.0, weight_div));
            }
        }

        if let Some(ldet) = self.last_damage_event_time {
            // quiet windows can batch less, unless latency explains the silence
            let mtime = (age(now, ldet) - self.max_latency * 2.0).max(0.0);
            add(Factor::new("damage-rate", (1.0 - mtime).max(0.0), maths::sqrt(mtime)));
        }

        if bandwidth_limit > 0 {
            let used: u64 = self
                .damage_send_speed
                .iter()
                .filter(|(t, _, _)| age(now, *t) <= 1.0)
                .map(|&(_, b, _)| b)
                .sum();
            // aim for 10% below the limit
            let target = (used * 8) as f64 * 1.1 / (bandwidth_limit * 8) as f64;
            let weight = (target - 1.0).max(0.0) * (5.0 + logp(target));
            add(Factor::new("bandwidth-limit", target, weight));
        }
        factors
    }

    pub fn get_info(&self) -> Value {
        let totals: serde_json::Map<String, Value> = self
            .encoding_totals
            .iter()
            .map(|(k, &(frames, pixels))| (k.clone(), json!({"frames": frames, "pixels": pixels})))
            .collect();
        json!({
            "damage_events": self.damage_events_count,
            "packets": self.packet_count,
            "acks_pending": self.damage_ack_pending.len(),
            "encoding_pending": self.encoding_pending.len(),
            "target_latency": secs_to_ms(self.target_latency),
            "max_latency": secs_to_ms(self.max_latency),
            "damage_in_latency": self.avg_damage_in_latency.map(secs_to_ms),
            "damage_out_latency": self.avg_damage_out_latency.map(secs_to_ms),
            "decode_speed": self.avg_decode_speed.map(|s| s as u64),
            "encodings": totals,
        })
    }
}

// ── Tests ────────────────────────────────────────────────────────
