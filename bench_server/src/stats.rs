//! Statistics primitives over raw benchmark measurements.

use thiserror::Error;

/// Reasons a geometric mean cannot be computed.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum GeomeanError {
    #[error("geometric mean of an empty sequence")]
    Empty,
    #[error("geometric mean requires strictly positive finite values, got {0}")]
    NonPositive(f64),
}

/// Arithmetic mean. Empty input yields `0.0`.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation (divisor N). Fewer than two values yield `0.0`.
pub fn population_stddev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let c = mean(values);
    let ss: f64 = values.iter().map(|x| (x - c) * (x - c)).sum();
    (ss / values.len() as f64).sqrt()
}

/// Geometric mean, computed in log space.
///
/// Zero, negative and non-finite values are rejected rather than clamped or
/// skipped, so a summary never silently hides a bad measurement.
pub fn geomean(values: &[f64]) -> Result<f64, GeomeanError> {
    if values.is_empty() {
        return Err(GeomeanError::Empty);
    }
    let mut log_sum = 0.0;
    for &v in values {
        if !v.is_finite() || v <= 0.0 {
            return Err(GeomeanError::NonPositive(v));
        }
        log_sum += v.ln();
    }
    Ok((log_sum / values.len() as f64).exp())
}
