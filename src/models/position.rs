//! Position model for the single open long and its closed-trade record.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{Fill, ProtectiveKind};

/// The one open long position and the ids of its protective orders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Exchange id of the entry order, if the exchange reported one
    pub exchange_id: Option<String>,

    /// Confirmed average entry price
    pub entry_price: Decimal,

    /// Base-asset quantity held
    pub quantity: Decimal,

    /// Stop-loss trigger price
    pub stop_price: Decimal,

    /// Take-profit trigger price
    pub take_profit_price: Decimal,

    /// Resting stop-loss order, once confirmed placed
    pub stop_order_id: Option<String>,

    /// Resting take-profit order, once confirmed placed
    pub take_profit_order_id: Option<String>,

    /// When the entry fill was confirmed
    pub opened_at: DateTime<Utc>,
}

impl Position {
    /// Open a position from a confirmed entry fill. Protective ids attach later.
    pub fn from_fill(
        fill: &Fill,
        stop_price: Decimal,
        take_profit_price: Decimal,
        opened_at: DateTime<Utc>,
    ) -> Self {
        Self {
            exchange_id: Some(fill.order_id.clone()).filter(|id| !id.is_empty()),
            entry_price: fill.price,
            quantity: fill.quantity,
            stop_price,
            take_profit_price,
            stop_order_id: None,
            take_profit_order_id: None,
            opened_at,
        }
    }

    /// Both protective orders are resting on the exchange.
    pub fn is_protected(&self) -> bool {
        self.stop_order_id.is_some() && self.take_profit_order_id.is_some()
    }

    /// Protective orders that are not in place.
    pub fn missing_protection(&self) -> Vec<ProtectiveKind> {
        let mut missing = Vec::new();
        if self.stop_order_id.is_none() {
            missing.push(ProtectiveKind::StopLoss);
        }
        if self.take_profit_order_id.is_none() {
            missing.push(ProtectiveKind::TakeProfit);
        }
        missing
    }

    /// Protective orders currently resting, with their kind.
    pub fn protective_orders(&self) -> Vec<(ProtectiveKind, String)> {
        let mut orders = Vec::new();
        if let Some(id) = &self.stop_order_id {
            orders.push((ProtectiveKind::StopLoss, id.clone()));
        }
        if let Some(id) = &self.take_profit_order_id {
            orders.push((ProtectiveKind::TakeProfit, id.clone()));
        }
        orders
    }

    /// Forget a protective order that is no longer resting.
    pub fn clear_protective(&mut self, kind: ProtectiveKind) {
        match kind {
            ProtectiveKind::StopLoss => self.stop_order_id = None,
            ProtectiveKind::TakeProfit => self.take_profit_order_id = None,
        }
    }

    /// Trigger price of a protective order.
    pub fn protective_price(&self, kind: ProtectiveKind) -> Decimal {
        match kind {
            ProtectiveKind::StopLoss => self.stop_price,
            ProtectiveKind::TakeProfit => self.take_profit_price,
        }
    }

    /// Notional value at entry.
    pub fn notional(&self) -> Decimal {
        self.entry_price * self.quantity
    }

    /// P&L if the position were closed at `price`.
    pub fn pnl_at(&self, price: Decimal) -> Decimal {
        (price - self.entry_price) * self.quantity
    }

    /// Return relative to entry if closed at `price`.
    pub fn return_pct(&self, price: Decimal) -> Decimal {
        if self.entry_price.is_zero() {
            return Decimal::ZERO;
        }
        (price - self.entry_price) / self.entry_price
    }

    /// Realize the position at `exit_price`.
    pub fn close(
        &self,
        exit_price: Decimal,
        exit_reason: impl Into<String>,
        closed_at: DateTime<Utc>,
    ) -> ClosedTrade {
        ClosedTrade {
            entry_price: self.entry_price,
            exit_price,
            quantity: self.quantity,
            pnl: self.pnl_at(exit_price),
            return_pct: self.return_pct(exit_price),
            exit_reason: exit_reason.into(),
            opened_at: self.opened_at,
            closed_at,
        }
    }
}

/// A round trip that has been fully closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub quantity: Decimal,
    pub pnl: Decimal,
    pub return_pct: Decimal,
    pub exit_reason: String,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}
