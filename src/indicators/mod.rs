//! Indicator engine: fast/slow EMA and RSI over an ordered OHLCV series.

mod ema;
mod rsi;

pub use ema::ema_series;
pub use rsi::rsi_series;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::PriceBar;
use crate::trading::StrategyConfig;

/// Indicator values aligned to one bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub timestamp: DateTime<Utc>,
    pub fast_ema: f64,
    pub slow_ema: f64,
    pub rsi: f64,
}

impl IndicatorSnapshot {
    /// Relative EMA separation, `(fast - slow) / slow`.
    pub fn trend_strength(&self) -> f64 {
        if self.slow_ema == 0.0 {
            return 0.0;
        }
        (self.fast_ema - self.slow_ema) / self.slow_ema
    }
}

/// Pure computation of indicator snapshots from price history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndicatorEngine {
    fast_period: usize,
    slow_period: usize,
    rsi_period: usize,
}

impl IndicatorEngine {
    pub fn new(fast_period: usize, slow_period: usize, rsi_period: usize) -> Self {
        Self {
            fast_period,
            slow_period,
            rsi_period,
        }
    }

    pub fn from_config(config: &StrategyConfig) -> Self {
        Self::new(config.ema_fast, config.ema_slow, config.rsi_period)
    }

    /// Number of bars needed before the first snapshot exists.
    pub fn warmup_len(&self) -> usize {
        self.fast_period
            .max(self.slow_period)
            .max(self.rsi_period + 1)
    }

    /// One snapshot per bar once every indicator is defined. Bars inside the
    /// warm-up window produce nothing.
    pub fn compute(&self, bars: &[PriceBar]) -> Vec<IndicatorSnapshot> {
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let fast = ema_series(&closes, self.fast_period);
        let slow = ema_series(&closes, self.slow_period);
        let rsi = rsi_series(&closes, self.rsi_period);

        bars.iter()
            .enumerate()
            .filter_map(|(i, bar)| {
                Some(IndicatorSnapshot {
                    timestamp: bar.timestamp,
                    fast_ema: fast[i]?,
                    slow_ema: slow[i]?,
                    rsi: rsi[i]?,
                })
            })
            .collect()
    }
}

/// The previous and current snapshot, if at least two exist.
pub fn latest_pair(snapshots: &[IndicatorSnapshot]) -> Option<(&IndicatorSnapshot, &IndicatorSnapshot)> {
    match snapshots {
        [.., prev, curr] => Some((prev, curr)),
        _ => None,
    }
}
