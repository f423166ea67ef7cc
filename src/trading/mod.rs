//! Trading logic: configuration, signal generation, risk sizing, position lifecycle.

mod config;
mod risk;
mod signal;
mod state;

pub use config::{RiskConfig, StrategyConfig, Timeframe, TradingConfig};
pub use risk::{RiskManager, RiskPlan};
pub use signal::{Signal, SignalGenerator, SignalReason};
pub use state::{ExitTrigger, PositionPhase, PositionState};
