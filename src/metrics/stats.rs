//! Latency reduction: min, max, mean and the p95/p99 percentiles of one batch.
//!
//! Percentiles use linear interpolation between closest ranks over the
//! ascending-sorted samples:
//!
//! ```text
//! h     = (p / 100) * (n - 1)
//! value = x[floor(h)] + (h - floor(h)) * (x[floor(h) + 1] - x[floor(h)])
//! ```
//!
//! evaluated on the raw nanosecond values and rounded to the nearest
//! nanosecond. Only the output layer rounds further for display.

use std::time::Duration;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StatsError {
    #[error("cannot summarise an empty sample set")]
    EmptySampleSet,
}

/// Summary of one (target, QoS) batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencySummary {
    pub count: usize,
    pub min: Duration,
    pub max: Duration,
    pub mean: Duration,
    pub p95: Duration,
    pub p99: Duration,
}

impl LatencySummary {
    /// Reduce an unordered set of samples. The input order never affects the result.
    pub fn from_samples(samples: &[Duration]) -> Result<Self, StatsError> {
        if samples.is_empty() {
            return Err(StatsError::EmptySampleSet);
        }
        let mut sorted = samples.to_vec();
        sorted.sort_unstable();

        let total: u128 = sorted.iter().map(Duration::as_nanos).sum();
        let mean_ns = total / sorted.len() as u128;

        Ok(Self {
            count: sorted.len(),
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            mean: duration_from_nanos(mean_ns),
            p95: percentile(&sorted, 95.0).ok_or(StatsError::EmptySampleSet)?,
            p99: percentile(&sorted, 99.0).ok_or(StatsError::EmptySampleSet)?,
        })
    }
}

/// Percentile `pct` (0..=100) of ascending-sorted samples, by linear
/// interpolation between closest ranks. `None` for empty input or an
/// out-of-range `pct`.
pub fn percentile(sorted: &[Duration], pct: f64) -> Option<Duration> {
    if sorted.is_empty() || !(0.0..=100.0).contains(&pct) {
        return None;
    }
    if sorted.len() == 1 {
        return Some(sorted[0]);
    }

    let rank = (pct / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = (lower + 1).min(sorted.len() - 1);
    let fraction = rank - lower as f64;

    let lo = sorted[lower].as_nanos() as f64;
    let hi = sorted[upper].as_nanos() as f64;
    let value = (lo + (hi - lo) * fraction).round();
    // f64 loses integer precision above 2^53 ns; keep the result between its ranks.
    Some(duration_from_nanos(value as u128).clamp(sorted[lower], sorted[upper]))
}

fn duration_from_nanos(ns: u128) -> Duration {
    let secs = (ns / 1_000_000_000) as u64;
    let nanos = (ns % 1_000_000_000) as u32;
    Duration::new(secs, nanos)
}
