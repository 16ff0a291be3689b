use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

/// Lossy conversion for statistics; exact values stay in `Decimal`.
pub fn to_f64(d: Decimal) -> f64 {
    d.to_f64().unwrap_or(0.0)
}

/// Median of the given values. Returns 0 for an empty slice.
pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Fraction of `values` strictly below `x`, in [0, 1].
pub fn rank(values: &[f64], x: f64) -> f64 {
    if values.is_empty() {
        return 1.0;
    }
    values.iter().filter(|v| **v < x).count() as f64 / values.len() as f64
}

/// Population mean and standard deviation.
pub fn mean_stddev(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    (mean, var.sqrt())
}

/// Linear ramp from `lo_conf` at `x = lo` to `hi_conf` at `x = hi`, clamped.
pub fn ramp(x: f64, lo: f64, hi: f64, lo_conf: f64, hi_conf: f64) -> f64 {
    if hi <= lo {
        return hi_conf;
    }
    let t = ((x - lo) / (hi - lo)).clamp(0.0, 1.0);
    lo_conf + t * (hi_conf - lo_conf)
}

/// Apply a heuristic weight and clamp into the 0-100 confidence range.
pub fn weighted_confidence(raw: f64, weight: f64) -> u8 {
    let scaled = raw * weight;
    if !scaled.is_finite() {
        return 0;
    }
    scaled.round().clamp(0.0, 100.0) as u8
}
