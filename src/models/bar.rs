//! OHLCV bar model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One OHLCV candle. Series of bars are ordered by strictly increasing timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    /// Bar open time
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl PriceBar {
    pub fn new(
        timestamp: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Bar where every price equals `price`.
    pub fn flat(timestamp: DateTime<Utc>, price: f64) -> Self {
        Self::new(timestamp, price, price, price, price, 0.0)
    }

    /// Check that a series has strictly increasing timestamps.
    pub fn is_ordered(bars: &[PriceBar]) -> bool {
        bars.windows(2).all(|w| w[0].timestamp < w[1].timestamp)
    }
}
