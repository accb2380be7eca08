//! Weighted averages and the factor helpers used by the batch delay
//! calculator and the quality/speed estimator.
//!
//! Every sample is timestamped. Recent samples weigh more than old ones,
//! and the "recent" variant of each average uses a much steeper decay
//! than the plain one. Times never go backwards here: a sample from the
//! future counts as age zero.

use std::time::Instant;

/// A smoothing function applied to a raw ratio.
pub type Smoothing = fn(f64) -> f64;

/// One input to a weighted decision.
///
/// `factor` multiplies the current value (above `1.0` raises it),
/// `weight` says how much this factor counts against the others.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Factor {
    pub name: &'static str,
    pub factor: f64,
    pub weight: f64,
}

impl Factor {
    pub const fn new(name: &'static str, factor: f64, weight: f64) -> Self {
        Self {
            name,
            factor,
            weight,
        }
    }
}

/// `ln(1 + x) / 2`.
pub fn logp(x: f64) -> f64 {
    (1.0 + x).ln() / 2.0
}

pub fn sqrt(x: f64) -> f64 {
    x.max(0.0).sqrt()
}

/// Seconds elapsed between `when` and `now`.
pub fn age(now: Instant, when: Instant) -> f64 {
    now.saturating_duration_since(when).as_secs_f64()
}

// ── Averages ─────────────────────────────────────────────────────

/// `(average, recent average)` of `(time, value)` samples.
pub fn calculate_time_weighted_average<I>(data: I, now: Instant) -> Option<(f64, f64)>
where
    I: IntoIterator<Item = (Instant, f64)>,
{
    let (mut tv, mut tw, mut rv, mut rw) = (0.0, 0.0, 0.0, 0.0);
    for (when, value) in data {
        let dt = age(now, when);
        let w = 1.0 / (1.0 + dt);
        tv += value * w;
        tw += w;
        let w = 1.0 / (0.1 + dt * dt);
        rv += value * w;
        rw += w;
    }
    (tw > 0.0).then(|| (tv / tw, rv / rw))
}

/// Time weighted average with weight `1 / (min_offset + age^rpow)`.
pub fn time_weighted_average<I>(data: I, now: Instant, min_offset: f64, rpow: f64) -> Option<f64>
where
    I: IntoIterator<Item = (Instant, f64)>,
{
    let (mut tv, mut tw) = (0.0, 0.0);
    for (when, value) in data {
        let w = 1.0 / (min_offset + age(now, when).powf(rpow));
        tv += value * w;
        tw += w;
    }
    (tw > 0.0).then(|| tv / tw)
}

fn size_weights(data: &[(Instant, f64, f64)]) -> Option<f64> {
    if data.is_empty() {
        return None;
    }
    let avg = data.iter().map(|d| d.1).sum::<f64>() / data.len() as f64;
    (avg > 0.0).then_some(avg)
}

/// Throughput average of `(time, size, elapsed)` records.
///
/// Each record contributes `size * sizeunit / elapsed`, and bigger records
/// weigh more so a burst of tiny packets does not skew the result.
/// Records with no elapsed time are skipped.
pub fn calculate_timesize_weighted_average(
    data: &[(Instant, f64, f64)],
    now: Instant,
    sizeunit: f64,
) -> Option<(f64, f64)> {
    let size_avg = size_weights(data)?;
    let (mut tv, mut tw, mut rv, mut rw) = (0.0, 0.0, 0.0, 0.0);
    for &(when, size, elapsed) in data {
        if elapsed <= 0.0 {
            continue;
        }
        let pw = logp(size / size_avg);
        let size_ps = (size * sizeunit / elapsed).max(1.0);
        let dt = age(now, when);
        let w = pw / (1.0 + dt);
        tv += w * size_ps;
        tw += w;
        let w = pw / (0.1 + dt * dt);
        rv += w * size_ps;
        rw += w;
    }
    (tw > 0.0 && rw > 0.0).then(|| (tv / tw, rv / rw))
}

/// Same weighting as [`calculate_timesize_weighted_average`], applied
/// to a precomputed score instead of a rate: records are
/// `(time, size, score)`.
pub fn calculate_timesize_weighted_average_score(
    data: &[(Instant, f64, f64)],
    now: Instant,
) -> Option<(f64, f64)> {
    let size_avg = size_weights(data)?;
    let (mut tv, mut tw, mut rv, mut rw) = (0.0, 0.0, 0.0, 0.0);
    for &(when, size, score) in data {
        if score < 0.0 {
            continue;
        }
        let pw = logp(size / size_avg);
        let dt = age(now, when);
        let w = pw / (1.0 + dt);
        tv += w * score;
        tw += w;
        let w = pw / (0.1 + dt * dt);
        rv += w * score;
        rw += w;
    }
    (tw > 0.0 && rw > 0.0).then(|| (tv / tw, rv / rw))
}

/// Average of `(time, size, value)` records where bigger sizes count more.
pub fn calculate_size_weighted_average(
    data: &[(Instant, f64, f64)],
    now: Instant,
) -> Option<(f64, f64)> {
    let size_avg = size_weights(data)?;
    let (mut tv, mut tw, mut rv, mut rw) = (0.0, 0.0, 0.0, 0.0);
    for &(when, size, value) in data {
        let pw = 0.5 + logp(size / size_avg);
        let dt = age(now, when);
        let w = pw / (1.0 + dt);
        tv += w * value;
        tw += w;
        let w = pw / (0.1 + dt * dt);
        rv += w * value;
        rw += w;
    }
    (tw > 0.0).then(|| (tv / tw, rv / rw))
}

// ── Factors ──────────────────────────────────────────────────────

/// Tuning of [`calculate_for_target`].
#[derive(Debug, Clone, Copy)]
pub struct Aim {
    /// Share of the average in the result. Close to 0 the target
    /// matters most, close to 1 the trend does.
    pub aim: f64,
    pub div: f64,
    pub slope: f64,
    pub smoothing: Smoothing,
    pub weight_multiplier: f64,
}

impl Default for Aim {
    fn default() -> Self {
        Self {
            aim: 0.5,
            div: 1.0,
            slope: 0.1,
            smoothing: logp,
            weight_multiplier: 1.0,
        }
    }
}

/// Factor that pulls `recent` towards `target`, taking into account
/// whether things are improving compared to `avg`.
pub fn calculate_for_target(
    name: &'static str,
    target: f64,
    avg: f64,
    recent: f64,
    aim: Aim,
) -> Factor {
    let d = aim.div;
    let target_factor = (recent / d) / (aim.slope + target / d);
    let avg_factor = (recent / d) / (aim.slope + avg / d);
    let aimed = target_factor * (1.0 - aim.aim) + avg_factor * aim.aim;
    let factor = (aim.smoothing)(aimed);
    let weight = (aim.smoothing)(0.0_f64.max(1.0 - factor).max(factor - 1.0)) * aim.weight_multiplier;
    Factor::new(name, factor, weight)
}

/// Factor for metrics without a known optimum: compares `recent` with `avg`.
pub fn calculate_for_average(
    name: &'static str,
    avg: f64,
    recent: f64,
    weight_offset: f64,
    weight_div: f64,
) -> Factor {
    if avg <= 0.0 {
        return Factor::new(name, 1.0, 0.0);
    }
    let factor = logp(recent / avg);
    if factor <= 0.0 {
        return Factor::new(name, factor, weight_offset.max(0.0) / weight_div);
    }
    let weight = (factor.max(1.0 / factor) - 1.0 + weight_offset).max(0.0) / weight_div;
    Factor::new(name, factor, weight)
}

/// Is the queue behind `values` growing or shrinking?
///
/// An empty history is neutral: factor `1.0`, no weight.
pub fn queue_inspect(
    name: &'static str,
    values: &[(Instant, f64)],
    now: Instant,
    target: f64,
    div: f64,
    smoothing: Smoothing,
) -> Factor {
    let Some((avg, recent)) = calculate_time_weighted_average(values.iter().copied(), now) else {
        return Factor::new(name, 1.0, 0.0);
    };
    let weight_multiplier = sqrt(avg.max(recent) / div / target);
    calculate_for_target(
        name,
        target,
        avg,
        recent,
        Aim {
            aim: 0.25,
            div,
            slope: 1.0,
            smoothing,
            weight_multiplier,
        },
    )
}

// ── Tests ────────────────────────────────────────────────────────
