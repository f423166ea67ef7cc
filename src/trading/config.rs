//! Trading configuration: strategy parameters, risk fractions, and validation.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::TradingError;
use crate::indicators::IndicatorEngine;

/// Candle interval. Also the cadence of the trading loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
        }
    }

    pub fn duration(&self) -> Duration {
        let secs = match self {
            Timeframe::M1 => 60,
            Timeframe::M5 => 300,
            Timeframe::M15 => 900,
            Timeframe::H1 => 3_600,
            Timeframe::H4 => 14_400,
            Timeframe::D1 => 86_400,
        };
        Duration::from_secs(secs)
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = TradingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "1m" => Ok(Timeframe::M1),
            "5m" => Ok(Timeframe::M5),
            "15m" => Ok(Timeframe::M15),
            "1h" => Ok(Timeframe::H1),
            "4h" => Ok(Timeframe::H4),
            "1d" => Ok(Timeframe::D1),
            other => Err(TradingError::InvalidConfiguration(format!(
                "unsupported timeframe '{}' (expected 1m, 5m, 15m, 1h, 4h or 1d)",
                other
            ))),
        }
    }
}

/// Indicator periods and signal thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Fast EMA period
    pub ema_fast: usize,

    /// Slow EMA period
    pub ema_slow: usize,

    /// RSI lookback period
    pub rsi_period: usize,

    /// Entries require RSI strictly above this
    pub rsi_oversold: f64,

    /// Entries require RSI strictly below this; exits fire at or above it
    pub rsi_overbought: f64,

    /// Minimum `(fast - slow) / slow` on the crossover bar (0.001 = 0.1%)
    pub min_trend_strength: f64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            ema_fast: 9,
            ema_slow: 21,
            rsi_period: 14,
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
            min_trend_strength: 0.001,
        }
    }
}

impl StrategyConfig {
    pub fn validate(&self) -> Result<(), TradingError> {
        if self.ema_fast == 0 || self.ema_fast >= self.ema_slow {
            return Err(invalid(format!(
                "EMA periods must satisfy 1 <= fast < slow (got {}/{})",
                self.ema_fast, self.ema_slow
            )));
        }
        if self.rsi_period == 0 {
            return Err(invalid("RSI period must be at least 1"));
        }
        let in_range = |v: f64| v > 0.0 && v < 100.0;
        if !in_range(self.rsi_oversold) || !in_range(self.rsi_overbought) {
            return Err(invalid(format!(
                "RSI thresholds must lie in (0, 100) (got {}/{})",
                self.rsi_oversold, self.rsi_overbought
            )));
        }
        if self.rsi_oversold >= self.rsi_overbought {
            return Err(invalid(format!(
                "RSI oversold {} must be below overbought {}",
                self.rsi_oversold, self.rsi_overbought
            )));
        }
        if !self.min_trend_strength.is_finite() || self.min_trend_strength < 0.0 {
            return Err(invalid("minimum trend strength must be >= 0"));
        }
        Ok(())
    }
}

/// Account risk limits and protective order distances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Fraction of equity lost if the stop is hit (0.01 = 1%)
    pub risk_per_trade: Decimal,

    /// Maximum position notional as a fraction of equity
    pub max_position: Decimal,

    /// Stop-loss distance below entry
    pub stop_loss_pct: Decimal,

    /// Take-profit distance above entry
    pub take_profit_pct: Decimal,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            risk_per_trade: dec!(0.01),  // 1% of equity at risk
            max_position: dec!(0.1),     // 10% of equity per position
            stop_loss_pct: dec!(0.02),   // 2% stop
            take_profit_pct: dec!(0.04), // 4% target, 1:2 risk/reward
        }
    }
}

impl RiskConfig {
    pub fn validate(&self) -> Result<(), TradingError> {
        if self.risk_per_trade <= Decimal::ZERO || self.risk_per_trade > dec!(0.05) {
            return Err(invalid(format!(
                "risk per trade must be in (0, 0.05] (got {})",
                self.risk_per_trade
            )));
        }
        if self.max_position <= Decimal::ZERO || self.max_position > Decimal::ONE {
            return Err(invalid(format!(
                "max position size must be in (0, 1] (got {})",
                self.max_position
            )));
        }
        if self.risk_per_trade >= self.max_position {
            return Err(invalid(format!(
                "risk per trade {} must be below max position size {}",
                self.risk_per_trade, self.max_position
            )));
        }
        if self.stop_loss_pct <= Decimal::ZERO || self.stop_loss_pct >= Decimal::ONE {
            return Err(invalid(format!(
                "stop loss must be in (0, 1) (got {})",
                self.stop_loss_pct
            )));
        }
        if self.take_profit_pct <= Decimal::ZERO {
            return Err(invalid(format!(
                "take profit must be positive (got {})",
                self.take_profit_pct
            )));
        }
        Ok(())
    }
}

/// Everything the decision engine needs, validated once before the loop starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    /// Trading pair, e.g. "BTC/USDT"
    pub symbol: String,

    /// Candle interval and loop cadence
    pub timeframe: Timeframe,

    /// Number of candles fetched each cycle
    pub history_limit: usize,

    pub strategy: StrategyConfig,

    pub risk: RiskConfig,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            symbol: "BTC/USDT".to_string(),
            timeframe: Timeframe::M15,
            history_limit: 100,
            strategy: StrategyConfig::default(),
            risk: RiskConfig::default(),
        }
    }
}

impl TradingConfig {
    pub fn validate(&self) -> Result<(), TradingError> {
        if self.symbol.trim().is_empty() {
            return Err(invalid("symbol must not be empty"));
        }
        self.strategy.validate()?;
        self.risk.validate()?;

        // Two snapshots are needed to detect a crossover.
        let needed = IndicatorEngine::from_config(&self.strategy).warmup_len() + 1;
        if self.history_limit < needed {
            return Err(invalid(format!(
                "history limit {} is shorter than the {} bars the indicators need",
                self.history_limit, needed
            )));
        }
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> TradingError {
    TradingError::InvalidConfiguration(msg.into())
}
