//! Exponential moving average.

/// EMA of `values`, aligned index-for-index with the input.
///
/// Entries before `period - 1` are `None`. The first defined value is the
/// simple average of the first `period` values; after that
/// `ema_t = x_t * k + ema_{t-1} * (1 - k)` with `k = 2 / (period + 1)`.
pub fn ema_series(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if period == 0 || values.len() < period {
        return out;
    }

    let k = 2.0 / (period as f64 + 1.0);
    let seed = values[..period].iter().sum::<f64>() / period as f64;
    out[period - 1] = Some(seed);

    let mut prev = seed;
    for (i, value) in values.iter().enumerate().skip(period) {
        // Same recurrence, written so a repeated value leaves the EMA exactly unchanged.
        prev += k * (value - prev);
        out[i] = Some(prev);
    }

    out
}
