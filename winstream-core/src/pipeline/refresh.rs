//! Auto-refresh: repaint lossy areas losslessly once the window settles.
//!
//! Every lossy packet adds its rectangle to the refresh regions and moves
//! the refresh target time. Lossless or high quality packets subtract
//! theirs; when nothing is left the pending refresh is cancelled. The
//! caller owns the timer and asks [`AutoRefresh::on_timer`] what to do
//! when it fires.

use std::time::{Duration, Instant};

use crate::config::RefreshSection;
use crate::geometry::{self, Rect};

/// Refreshes never fire sooner than this after the update.
const MIN_REFRESH_DELAY: u64 = 50;
/// A timer firing this close to the target refreshes right away.
const REFRESH_SLACK: Duration = Duration::from_millis(50);

/// What to do with the refresh timer after a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshAction {
    /// No change.
    Keep,
    /// Nothing left to refresh.
    Cancel,
    /// (Re)arm the timer for this time.
    Schedule(Instant),
}

/// What to do when the refresh timer fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshFire {
    /// Too early: re-arm for the target time.
    Rearm(Instant),
    /// Send these regions losslessly.
    Refresh(Vec<Rect>),
    Nothing,
}

/// One packet, seen from the refresh scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentUpdate {
    pub rect: Rect,
    pub lossy: bool,
    /// Quality the packet was encoded at.
    pub quality: u8,
    pub speed: u8,
}

#[derive(Debug, Clone)]
pub struct AutoRefresh {
    /// Base delay in ms.
    pub delay: u32,
    /// Lossy packets at or above this quality need no refresh.
    pub threshold: u8,
    /// Quality and speed of the refresh itself.
    pub quality: u8,
    pub speed: u8,
    pub regions: Vec<Rect>,
    pub target_time: Option<Instant>,
}

impl AutoRefresh {
    /// `client_delay` overrides the configured delay.
    pub fn new(cfg: &RefreshSection, client_delay: Option<u32>) -> Self {
        Self {
            delay: client_delay.unwrap_or(cfg.auto_refresh_delay_ms),
            threshold: cfg.threshold,
            quality: cfg.quality,
            speed: cfg.speed,
            regions: Vec::new(),
            target_time: None,
        }
    }

    /// Disabled with a zero delay.
    pub fn enabled(&self) -> bool {
        self.delay > 0
    }

    pub fn is_pending(&self) -> bool {
        self.target_time.is_some()
    }

    /// Forget the pending refresh.
    pub fn cancel(&mut self) {
        self.regions.clear();
        self.target_time = None;
    }

    /// Account for one sent packet.
    ///
    /// `batch_delay` is the window's current batch delay in ms.
    pub fn on_update(&mut self, update: SentUpdate, dimensions: (u32, u32), batch_delay: u32, now: Instant) -> RefreshAction {
        if !self.enabled() {
            return self.clear_action();
        }
        if !update.lossy || update.quality >= self.threshold {
            if self.regions.is_empty() {
                return RefreshAction::Keep;
            }
            geometry::remove_rectangle(&mut self.regions, update.rect);
            if self.regions.is_empty() {
                tracing::debug!(rect = %update.rect, "lossless update covers every refresh region");
                return self.clear_action();
            }
            return RefreshAction::Keep;
        }

        geometry::add_rectangle(&mut self.regions, update.rect);
        let (ww, wh) = dimensions;
        let window_pixels = (u64::from(ww) * u64::from(wh)).max(1);
        let pct = (100 * geometry::pixel_count(&self.regions) / window_pixels).min(100);
        let delay = u64::from(self.delay);
        let batch = u64::from(batch_delay);
        let target = match self.target_time {
            Some(due) => {
                // already due: only ever pushed later
                let push = MIN_REFRESH_DELAY.max(delay * pct / 50).max(batch * 2);
                due.max(now + Duration::from_millis(push))
            }
            None => {
                let base = MIN_REFRESH_DELAY.max(delay * pct.max(50) / 50).max(batch * 4);
                let q = u64::from(update.quality.min(100));
                let s = u64::from(update.speed.min(100));
                let sched = base * (200 - q) * (100 + s) / 20000;
                now + Duration::from_millis(sched.max(MIN_REFRESH_DELAY))
            }
        };
        tracing::debug!(pct, in_ms = target.saturating_duration_since(now).as_millis() as u64, "auto refresh scheduled");
        self.target_time = Some(target);
        RefreshAction::Schedule(target)
    }

    /// The refresh timer fired.
    pub fn on_timer(&mut self, now: Instant) -> RefreshFire {
        let Some(target) = self.target_time else {
            return RefreshFire::Nothing;
        };
        if target.saturating_duration_since(now) > REFRESH_SLACK {
            return RefreshFire::Rearm(target);
        }
        self.target_time = None;
        if self.regions.is_empty() {
            return RefreshFire::Nothing;
        }
        RefreshFire::Refresh(std::mem::take(&mut self.regions))
    }

    fn clear_action(&mut self) -> RefreshAction {
        let was_pending = self.target_time.is_some() || !self.regions.is_empty();
        self.cancel();
        if was_pending {
            RefreshAction::Cancel
        } else {
            RefreshAction::Keep
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
