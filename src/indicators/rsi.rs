//! Relative Strength Index with Wilder smoothing.

/// RSI of `closes`, aligned index-for-index with the input.
///
/// The first value is defined at index `period`: the initial average gain and
/// loss are simple means of the first `period` changes, then each step uses
/// `avg = (avg * (period - 1) + x) / period`.
///
/// A zero average loss gives 100. With no movement at all (both averages zero)
/// the oscillator sits at the neutral 50.
pub fn rsi_series(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; closes.len()];
    if period == 0 || closes.len() <= period {
        return out;
    }

    let changes: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();
    let n = period as f64;

    let mut avg_gain = changes[..period].iter().map(|c| c.max(0.0)).sum::<f64>() / n;
    let mut avg_loss = changes[..period].iter().map(|c| (-c).max(0.0)).sum::<f64>() / n;
    out[period] = Some(rsi_value(avg_gain, avg_loss));

    for (i, change) in changes.iter().enumerate().skip(period) {
        avg_gain = (avg_gain * (n - 1.0) + change.max(0.0)) / n;
        avg_loss = (avg_loss * (n - 1.0) + (-change).max(0.0)) / n;
        out[i + 1] = Some(rsi_value(avg_gain, avg_loss));
    }

    out
}

fn rsi_value(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        return if avg_gain == 0.0 { 50.0 } else { 100.0 };
    }
    let rs = avg_gain / avg_loss;
    100.0 - 100.0 / (1.0 + rs)
}
