//! Statistic library shared by QC and rule evaluation.
//!
//! All rolling statistics are recomputed from a plain trailing window:
//! MEAN(w) = sum(x) / n
//! STDDEV(w) = sqrt(sum((x - MEAN(w))^2) / (n - 1))      (sample, n >= 2)
//! Z(x, w) = (x - MEAN(w)) / STDDEV(w)
//! VOL(r) = STDDEV(r) * sqrt(252)
//! No incremental or exponential smoothing, so results depend only on the
//! window contents.

pub const TRADING_DAYS_PER_YEAR: f64 = 252.0;

/// Relative tolerance under which a standard deviation counts as zero.
const ZERO_STDDEV_TOLERANCE: f64 = 1e-12;

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

pub fn sample_stddev(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values)?;
    let variance = values
        .iter()
        .map(|v| {
            let diff = v - m;
            diff * diff
        })
        .sum::<f64>()
        / (values.len() - 1) as f64;
    Some(variance.sqrt())
}

/// Mean and standard deviation of a window, `None` when the deviation is
/// undefined or numerically zero.
pub fn mean_and_stddev(window: &[f64]) -> Option<(f64, f64)> {
    let m = mean(window)?;
    let sd = sample_stddev(window)?;
    if !sd.is_finite() || sd <= ZERO_STDDEV_TOLERANCE * m.abs().max(1.0) {
        return None;
    }
    Some((m, sd))
}

pub fn z_score(value: f64, window: &[f64]) -> Option<f64> {
    let (m, sd) = mean_and_stddev(window)?;
    Some((value - m) / sd)
}

/// The trailing window of at most `size` values ending at `end` (inclusive).
pub fn trailing_window(values: &[f64], end: usize, size: usize) -> &[f64] {
    let stop = (end + 1).min(values.len());
    let start = stop.saturating_sub(size);
    &values[start..stop]
}

/// r[i] = x[i] / x[i-1] - 1, skipping pairs with a zero or non-finite base.
pub fn simple_returns(values: &[f64]) -> Vec<f64> {
    values
        .windows(2)
        .filter(|w| w[0] != 0.0 && w[0].is_finite() && w[1].is_finite())
        .map(|w| w[1] / w[0] - 1.0)
        .collect()
}

/// r[i] = ln(x[i] / x[i-1]), skipping pairs with a non-positive value.
pub fn log_returns(values: &[f64]) -> Vec<f64> {
    values
        .windows(2)
        .filter(|w| w[0] > 0.0 && w[1] > 0.0 && w[0].is_finite() && w[1].is_finite())
        .map(|w| (w[1] / w[0]).ln())
        .collect()
}

pub fn annualized_volatility(returns: &[f64]) -> Option<f64> {
    sample_stddev(returns).map(|sd| sd * TRADING_DAYS_PER_YEAR.sqrt())
}

/// Pearson correlation of paired observations; `None` for fewer than two
/// pairs or when either side has zero variance.
pub fn pearson(pairs: &[(f64, f64)]) -> Option<f64> {
    if pairs.len() < 2 {
        return None;
    }
    let n = pairs.len() as f64;
    let mean_x = pairs.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = pairs.iter().map(|p| p.1).sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for &(x, y) in pairs {
        let dx = x - mean_x;
        let dy = y - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }

    // flat relative to its own level, so small-scale series still correlate
    let flat = |var: f64, mean: f64| var <= n * (ZERO_STDDEV_TOLERANCE * mean.abs()).powi(2);
    if flat(var_x, mean_x) || flat(var_y, mean_y) {
        return None;
    }
    let denom = (var_x * var_y).sqrt();
    if !denom.is_finite() || denom == 0.0 {
        return None;
    }
    Some((cov / denom).clamp(-1.0, 1.0))
}
