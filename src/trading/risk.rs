//! Risk sizing: fixed-fractional risk per trade, capped by a maximum
//! position notional, with stop-loss and take-profit levels.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::TradingError;

use super::RiskConfig;

/// Order quantity and protective levels for one entry.
///
/// Always satisfies `stop_loss < entry_price < take_profit` and `quantity > 0`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskPlan {
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
}

impl RiskPlan {
    pub fn notional(&self) -> Decimal {
        self.quantity * self.entry_price
    }
}

/// Calculator for position size and protective levels.
#[derive(Debug, Clone)]
pub struct RiskManager {
    config: RiskConfig,
}

impl RiskManager {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    /// Size an entry at `price` for an account worth `equity`.
    ///
    /// The amount lost at the stop is `equity * risk_per_trade`, so the
    /// notional is that amount divided by the stop distance, capped at
    /// `equity * max_position`. The quantity is rounded down to a multiple of
    /// `step` (no rounding when `step` is zero).
    pub fn size(
        &self,
        equity: Decimal,
        price: Decimal,
        step: Decimal,
    ) -> Result<RiskPlan, TradingError> {
        if equity <= Decimal::ZERO {
            return Err(TradingError::InvalidRiskConfiguration(format!(
                "equity must be positive (got {})",
                equity
            )));
        }
        if price <= Decimal::ZERO {
            return Err(TradingError::InvalidRiskConfiguration(format!(
                "price must be positive (got {})",
                price
            )));
        }
        if self.config.stop_loss_pct <= Decimal::ZERO || step < Decimal::ZERO {
            return Err(TradingError::InvalidRiskConfiguration(format!(
                "stop loss {} and quantity step {} are unusable",
                self.config.stop_loss_pct, step
            )));
        }

        let risk_amount = equity * self.config.risk_per_trade;
        let max_value = equity * self.config.max_position;
        let position_value = (risk_amount / self.config.stop_loss_pct).min(max_value);

        let raw_quantity = position_value / price;
        let quantity = round_down(raw_quantity, step);
        if quantity <= Decimal::ZERO {
            return Err(TradingError::InsufficientSize(format!(
                "{} rounds to zero at step {} (equity {}, price {})",
                raw_quantity.round_dp(8),
                step,
                equity,
                price
            )));
        }

        let (stop_loss, take_profit) = self.protective_levels(price);

        Ok(RiskPlan {
            quantity,
            entry_price: price,
            stop_loss,
            take_profit,
        })
    }

    /// Stop-loss and take-profit prices for a long entered at `entry`.
    pub fn protective_levels(&self, entry: Decimal) -> (Decimal, Decimal) {
        (
            entry * (Decimal::ONE - self.config.stop_loss_pct),
            entry * (Decimal::ONE + self.config.take_profit_pct),
        )
    }
}

fn round_down(quantity: Decimal, step: Decimal) -> Decimal {
    if step.is_zero() {
        return quantity;
    }
    (quantity / step).floor() * step
}
