//! Data models for price bars, orders, and the single tracked position.

mod bar;
mod order;
mod position;

pub use bar::PriceBar;
pub use order::{CancelOutcome, Fill, OrderSide, OrderState, OrderStatus, ProtectiveKind};
pub use position::{ClosedTrade, Position};
