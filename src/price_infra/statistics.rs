//! Dispersion statistics over price samples.
//!
//! Every function expects its input sorted ascending; callers sort once and
//! share the slice.

use crate::types::aggregation::Statistics;

pub fn sort_prices(values: &mut [f64]) {
    values.sort_by(|a, b| a.total_cmp(b));
}

pub fn mean(sorted: &[f64]) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    sorted.iter().sum::<f64>() / sorted.len() as f64
}

/// Middle value, or the mean of the two middles for an even count.
pub fn median(sorted: &[f64]) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Population variance.
pub fn variance(sorted: &[f64]) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let mean = mean(sorted);
    sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / sorted.len() as f64
}

pub fn std_dev(sorted: &[f64]) -> f64 {
    variance(sorted).sqrt()
}

/// Median absolute deviation from the median.
pub fn mad(sorted: &[f64]) -> f64 {
    let center = median(sorted);
    let mut deviations: Vec<f64> = sorted.iter().map(|v| (v - center).abs()).collect();
    sort_prices(&mut deviations);
    median(&deviations)
}

/// Linear-interpolated quantile, `q` in [0, 1].
pub fn quantile(sorted: &[f64], q: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let position = q.clamp(0.0, 1.0) * (n - 1) as f64;
            let lower = position.floor() as usize;
            let upper = position.ceil() as usize;
            let fraction = position - lower as f64;
            sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
        }
    }
}

pub fn iqr(sorted: &[f64]) -> f64 {
    quantile(sorted, 0.75) - quantile(sorted, 0.25)
}

pub fn range(sorted: &[f64]) -> f64 {
    match (sorted.first(), sorted.last()) {
        (Some(min), Some(max)) => max - min,
        _ => 0.0,
    }
}

pub fn dispersion(sorted: &[f64]) -> Statistics {
    let variance = variance(sorted);
    Statistics {
        std_dev: variance.sqrt(),
        variance,
        mad: mad(sorted),
        range: range(sorted),
        iqr: iqr(sorted),
    }
}
