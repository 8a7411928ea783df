//! Nearest-rank percentile computation shared by every duration metric.
//!
//! The P-th percentile of N samples is the smallest sample such that at least
//! P% of the samples are less than or equal to it. No interpolation is done, so
//! the result is always one of the recorded samples.

/// Guards against `p * n / 100` landing a hair above an integer rank because
/// `p` has no exact binary representation (e.g. 99.9).
const RANK_EPSILON: f64 = 1e-9;

/// Sort samples in place using a total order over floats.
pub fn sort_samples(samples: &mut [f64]) {
    samples.sort_unstable_by(|a, b| a.total_cmp(b));
}

/// 1-based nearest rank for percentile `p` over `n` samples.
///
/// Returns `None` for `n == 0`.
pub fn nearest_rank(p: f64, n: usize) -> Option<usize> {
    if n == 0 {
        return None;
    }
    let raw = (p * n as f64 / 100.0 - RANK_EPSILON).ceil();
    let rank = if raw.is_nan() || raw < 1.0 {
        1
    } else {
        (raw as usize).min(n)
    };
    Some(rank)
}

/// Percentile of already-sorted samples.
///
/// Returns `None` when there are no samples.
pub fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    nearest_rank(p, sorted.len()).map(|rank| sorted[rank - 1])
}
