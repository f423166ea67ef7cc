//! Signal generation: EMA crossover entries confirmed by RSI and trend strength,
//! and exits on trend reversal, RSI exhaustion, or stop/target prices.
//!
//! The generator is a pure function of the two latest snapshots, the latest
//! price, and the entry price of the open position (if any).

use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::indicators::IndicatorSnapshot;

use super::TradingConfig;

/// What the strategy wants to do this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Signal {
    EnterLong,
    ExitLong,
    Hold,
}

impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::EnterLong => "ENTER_LONG",
            Signal::ExitLong => "EXIT_LONG",
            Signal::Hold => "HOLD",
        }
    }
}

/// Why a signal was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalReason {
    // Entry
    BullishCrossover,

    // Exit
    StopLoss,
    TakeProfit,
    TrendReversal,
    RsiOverbought,

    // Hold while flat
    NoCrossover,
    RsiOutOfRange,
    WeakTrend,
    PriceBelowTrend,

    // Hold while positioned
    Holding,
}

impl SignalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalReason::BullishCrossover => "bullish_crossover",
            SignalReason::StopLoss => "stop_loss",
            SignalReason::TakeProfit => "take_profit",
            SignalReason::TrendReversal => "trend_reversal",
            SignalReason::RsiOverbought => "rsi_overbought",
            SignalReason::NoCrossover => "no_crossover",
            SignalReason::RsiOutOfRange => "rsi_out_of_range",
            SignalReason::WeakTrend => "weak_trend",
            SignalReason::PriceBelowTrend => "price_below_trend",
            SignalReason::Holding => "holding",
        }
    }
}

impl std::fmt::Display for SignalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A signal together with the rule that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evaluation {
    pub signal: Signal,
    pub reason: SignalReason,
}

impl Evaluation {
    fn new(signal: Signal, reason: SignalReason) -> Self {
        Self { signal, reason }
    }

    fn hold(reason: SignalReason) -> Self {
        Self::new(Signal::Hold, reason)
    }
}

/// Stateless entry/exit classifier.
#[derive(Debug, Clone)]
pub struct SignalGenerator {
    rsi_oversold: f64,
    rsi_overbought: f64,
    min_trend_strength: f64,
    stop_loss_pct: f64,
    take_profit_pct: f64,
}

impl SignalGenerator {
    pub fn new(config: &TradingConfig) -> Self {
        Self {
            rsi_oversold: config.strategy.rsi_oversold,
            rsi_overbought: config.strategy.rsi_overbought,
            min_trend_strength: config.strategy.min_trend_strength,
            stop_loss_pct: config.risk.stop_loss_pct.to_f64().unwrap_or(0.0),
            take_profit_pct: config.risk.take_profit_pct.to_f64().unwrap_or(0.0),
        }
    }

    /// Classify the market from the previous and current snapshot.
    ///
    /// `entry_price` is the open position's entry price, or `None` when flat.
    pub fn evaluate(
        &self,
        prev: &IndicatorSnapshot,
        curr: &IndicatorSnapshot,
        price: f64,
        entry_price: Option<f64>,
    ) -> Evaluation {
        let evaluation = match entry_price {
            Some(entry) => self.evaluate_exit(curr, price, entry),
            None => self.evaluate_entry(prev, curr, price),
        };

        debug!(
            signal = evaluation.signal.as_str(),
            reason = %evaluation.reason,
            price = price,
            fast_ema = curr.fast_ema,
            slow_ema = curr.slow_ema,
            rsi = curr.rsi,
            "Signal evaluated"
        );

        evaluation
    }

    fn evaluate_entry(
        &self,
        prev: &IndicatorSnapshot,
        curr: &IndicatorSnapshot,
        price: f64,
    ) -> Evaluation {
        // A cross needs the fast EMA at or below the slow one on the previous bar.
        let crossed_up = curr.fast_ema > curr.slow_ema && prev.fast_ema <= prev.slow_ema;
        if !crossed_up {
            return Evaluation::hold(SignalReason::NoCrossover);
        }

        if curr.rsi <= self.rsi_oversold || curr.rsi >= self.rsi_overbought {
            return Evaluation::hold(SignalReason::RsiOutOfRange);
        }

        if curr.trend_strength() <= self.min_trend_strength {
            return Evaluation::hold(SignalReason::WeakTrend);
        }

        if !(price > curr.fast_ema && curr.fast_ema > curr.slow_ema) {
            return Evaluation::hold(SignalReason::PriceBelowTrend);
        }

        Evaluation::new(Signal::EnterLong, SignalReason::BullishCrossover)
    }

    fn evaluate_exit(&self, curr: &IndicatorSnapshot, price: f64, entry_price: f64) -> Evaluation {
        let exit = |reason| Evaluation::new(Signal::ExitLong, reason);

        if price <= entry_price * (1.0 - self.stop_loss_pct) {
            return exit(SignalReason::StopLoss);
        }
        if price >= entry_price * (1.0 + self.take_profit_pct) {
            return exit(SignalReason::TakeProfit);
        }
        if curr.fast_ema < curr.slow_ema {
            return exit(SignalReason::TrendReversal);
        }
        if curr.rsi >= self.rsi_overbought {
            return exit(SignalReason::RsiOverbought);
        }

        Evaluation::hold(SignalReason::Holding)
    }
}
