//! Order statistics over integer samples.
//!
//! Baselines and noise scores are built from medians and quartiles rather
//! than means so isolated spikes cannot drag them around. Inputs stay in
//! integer milliseconds; only the derived statistics move to floating
//! point.

/// Median with the lower-median rule: on even counts, the average of the
/// two middle values. Returns 0 for an empty slice.
pub fn median_of_sorted(sorted: &[u64]) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }
    if n % 2 == 1 {
        sorted[n / 2] as f64
    } else {
        (sorted[n / 2 - 1] as f64 + sorted[n / 2] as f64) / 2.0
    }
}

/// First and third quartile by sorted index: `floor(0.25·n)` and
/// `floor(0.75·n)`, 0-indexed. Returns (0, 0) for an empty slice.
pub fn quartiles_of_sorted(sorted: &[u64]) -> (u64, u64) {
    let n = sorted.len();
    if n == 0 {
        return (0, 0);
    }
    let q1 = sorted[n / 4];
    let q3 = sorted[(3 * n) / 4];
    (q1, q3)
}

/// Interquartile range of a sorted slice.
pub fn iqr_of_sorted(sorted: &[u64]) -> u64 {
    let (q1, q3) = quartiles_of_sorted(sorted);
    q3.saturating_sub(q1)
}

/// Population standard deviation. Returns 0 for slices shorter than two.
pub fn population_std_dev(values: &[u64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let mean = values.iter().map(|v| *v as f64).sum::<f64>() / n as f64;
    let variance = values
        .iter()
        .map(|v| {
            let diff = *v as f64 - mean;
            diff * diff
        })
        .sum::<f64>()
        / n as f64;
    variance.sqrt()
}
