//! Tunables of the encoding pipeline.
//!
//! Every section is `#[serde(default)]`, so a config file only needs
//! the values it changes. The server embeds [`PipelineConfig`] as its
//! `[pipeline]` table.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// All pipeline tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Batch delay bounds and storm thresholds.
    pub batch: BatchSection,
    /// When a damage event may skip batching.
    pub fast_path: FastPathSection,
    /// Multi-region flush heuristics.
    pub regions: RegionsSection,
    /// Delta (XOR) pre-compression.
    pub delta: DeltaSection,
    /// Lossless auto-refresh.
    pub refresh: RefreshSection,
    /// Encoding selection.
    pub encoding: EncodingSection,
    /// Congestion detection and bandwidth limits.
    pub congestion: CongestionSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSection {
    /// Always batch, never take the fast path.
    pub always: bool,
    /// Damage events per `time_unit_ms` above which batching is forced.
    pub max_events: u32,
    /// Damaged pixels per `time_unit_ms` above which batching is forced.
    pub max_pixels: u64,
    pub time_unit_ms: u64,
    pub min_delay_ms: u32,
    pub start_delay_ms: u32,
    pub max_delay_ms: u32,
    /// A delayed region older than this is dropped and refreshed.
    pub timeout_delay_ms: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FastPathSection {
    /// Packets not yet acked by the client.
    pub max_packet_backlog: usize,
    /// Regions waiting in the encode worker.
    pub max_encoding_regions: usize,
    /// Pixels waiting in the encode worker, in window frames.
    pub max_pixel_backlog_frames: f64,
    /// This many events within `burst_window_ms` force batching.
    pub burst_events: usize,
    pub burst_window_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionsSection {
    pub max_small_regions: usize,
    /// Percentage of the window area, in bytes cost, before a full update.
    pub max_bytes_percent: u64,
    /// Per-packet overhead counted as pixels.
    pub small_packet_cost: u64,
    pub mmap_max_small_regions: usize,
    pub mmap_max_bytes_percent: u64,
    pub mmap_small_packet_cost: u64,
    /// Windows this small always get full updates.
    pub min_window_region_size: u64,
    /// Try the bounding box when it is cheaper.
    pub merge_regions: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeltaSection {
    pub enabled: bool,
    /// Region pixel count must be strictly above this.
    pub min_delta_size: u64,
    /// and strictly below this.
    pub max_delta_size: u64,
    /// Uses of one bucket before it is cleared.
    pub max_delta_hits: u32,
    pub max_buckets: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshSection {
    /// Zero disables auto-refresh.
    pub auto_refresh_delay_ms: u32,
    /// Updates at or above this quality count as lossless.
    pub threshold: u8,
    pub quality: u8,
    pub speed: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodingSection {
    /// Base pixel threshold below which small regions go out as rgb.
    pub max_pixels_prefer_rgb: u64,
    /// Never switch away from the selected encoding.
    pub strict: bool,
    /// Add `z.blake3` and `z.len` to every inline payload.
    pub integrity_hash: bool,
    pub default_quality: u8,
    pub default_min_quality: u8,
    pub default_speed: u8,
    pub default_min_speed: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CongestionSection {
    /// Congestion events within `warning_window_s` that raise an advisory.
    pub warning_event_count: usize,
    pub warning_window_s: u64,
    /// Minimum time between two advisories.
    pub repeat_delay_s: u64,
    /// Extra latency allowed before an ack counts as late.
    pub ack_tolerance_ms: u64,
    /// Late ack percentage that records a congestion event.
    pub late_pct_threshold: u32,
    /// Bytes per second; soft limits never go below this.
    pub min_bandwidth: u64,
    /// Server side cap in bytes per second, `0` for none.
    pub bandwidth_limit: u64,
    pub bandwidth_detection: bool,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch: BatchSection::default(),
            fast_path: FastPathSection::default(),
            regions: RegionsSection::default(),
            delta: DeltaSection::default(),
            refresh: RefreshSection::default(),
            encoding: EncodingSection::default(),
            congestion: CongestionSection::default(),
        }
    }
}

impl Default for BatchSection {
    fn default() -> Self {
        Self {
            always: false,
            max_events: 50,
            max_pixels: 1024 * 1024 * 50,
            time_unit_ms: 1000,
            min_delay_ms: 5,
            start_delay_ms: 50,
            max_delay_ms: 500,
            timeout_delay_ms: 15_000,
        }
    }
}

impl Default for FastPathSection {
    fn default() -> Self {
        Self {
            max_packet_backlog: 0,
            max_encoding_regions: 10,
            max_pixel_backlog_frames: 1.0,
            burst_events: 5,
            burst_window_ms: 10,
        }
    }
}

impl Default for RegionsSection {
    fn default() -> Self {
        Self {
            max_small_regions: 40,
            max_bytes_percent: 60,
            small_packet_cost: 1024,
            mmap_max_small_regions: 10,
            mmap_max_bytes_percent: 25,
            mmap_small_packet_cost: 4096,
            min_window_region_size: 1024,
            merge_regions: true,
        }
    }
}

impl Default for DeltaSection {
    fn default() -> Self {
        Self {
            enabled: true,
            min_delta_size: 1024,
            max_delta_size: 32768,
            max_delta_hits: 20,
            max_buckets: 25,
        }
    }
}

impl Default for RefreshSection {
    fn default() -> Self {
        Self {
            auto_refresh_delay_ms: 150,
            threshold: 100,
            quality: 100,
            speed: 50,
        }
    }
}

impl Default for EncodingSection {
    fn default() -> Self {
        Self {
            max_pixels_prefer_rgb: 4096,
            strict: false,
            integrity_hash: false,
            default_quality: 40,
            default_min_quality: 10,
            default_speed: 40,
            default_min_speed: 10,
        }
    }
}

impl Default for CongestionSection {
    fn default() -> Self {
        Self {
            warning_event_count: 10,
            warning_window_s: 10,
            repeat_delay_s: 60,
            ack_tolerance_ms: 100,
            late_pct_threshold: 50,
            min_bandwidth: 5 * 1024 * 1024,
            bandwidth_limit: 0,
            bandwidth_detection: true,
        }
    }
}

// ── Convenience ──────────────────────────────────────────────────

impl BatchSection {
    pub fn time_unit(&self) -> Duration {
        Duration::from_millis(self.time_unit_ms.max(1))
    }
}

impl CongestionSection {
    pub fn ack_tolerance(&self) -> Duration {
        Duration::from_millis(self.ack_tolerance_ms)
    }
}

// ── Tests ────────────────────────────────────────────────────────
