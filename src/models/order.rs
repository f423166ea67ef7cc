//! Order-side types exchanged with the gateway.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

/// Confirmed execution of a market order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fill {
    /// Exchange order identifier
    pub order_id: String,

    /// Average fill price
    pub price: Decimal,

    /// Executed base quantity
    pub quantity: Decimal,
}

/// Lifecycle state of a resting order as reported by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderState {
    Open,
    Filled,
    Canceled,
}

/// What the exchange reports about an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderStatus {
    pub state: OrderState,

    /// Average execution price, once the order has traded
    pub avg_price: Option<Decimal>,
}

impl OrderStatus {
    pub fn new(state: OrderState) -> Self {
        Self {
            state,
            avg_price: None,
        }
    }

    pub fn filled(avg_price: Option<Decimal>) -> Self {
        Self {
            state: OrderState::Filled,
            avg_price: avg_price.filter(|p| *p > Decimal::ZERO),
        }
    }

    pub fn is_filled(&self) -> bool {
        self.state == OrderState::Filled
    }
}

/// Result of a cancel request. A missing order is an answer, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Canceled,
    NotFound,
}

/// Which protective order a resting order id belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtectiveKind {
    StopLoss,
    TakeProfit,
}

impl ProtectiveKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtectiveKind::StopLoss => "stop_loss",
            ProtectiveKind::TakeProfit => "take_profit",
        }
    }
}

impl std::fmt::Display for ProtectiveKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
