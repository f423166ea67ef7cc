//! Error kinds surfaced by the trading core.

use thiserror::Error;

/// Failure raised by the decision engine or the exchange gateway.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TradingError {
    /// Configuration failed validation; the bot refuses to start.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// OHLCV could not be fetched (network or API failure).
    #[error("market data unavailable: {0}")]
    MarketDataUnavailable(String),

    /// Any other exchange call failed in transit (timeout, 5xx, rate limit).
    #[error("exchange unavailable: {0}")]
    ExchangeUnavailable(String),

    /// The exchange refused an order, or did not confirm its fill.
    #[error("order rejected: {0}")]
    OrderRejected(String),

    /// Risk sizing produced a quantity that rounds down to nothing.
    #[error("insufficient size: {0}")]
    InsufficientSize(String),

    /// Sizing inputs are unusable (non-positive equity or price).
    #[error("invalid risk configuration: {0}")]
    InvalidRiskConfiguration(String),

    /// The position state machine does not allow this transition.
    #[error("illegal position transition: {0}")]
    IllegalTransition(String),
}

impl TradingError {
    /// Only transport-level exchange failures are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TradingError::MarketDataUnavailable(_) | TradingError::ExchangeUnavailable(_)
        )
    }

    /// Stable label used in status records.
    pub fn kind(&self) -> &'static str {
        match self {
            TradingError::InvalidConfiguration(_) => "invalid_configuration",
            TradingError::MarketDataUnavailable(_) => "market_data_unavailable",
            TradingError::ExchangeUnavailable(_) => "exchange_unavailable",
            TradingError::OrderRejected(_) => "order_rejected",
            TradingError::InsufficientSize(_) => "insufficient_size",
            TradingError::InvalidRiskConfiguration(_) => "invalid_risk_configuration",
            TradingError::IllegalTransition(_) => "illegal_transition",
        }
    }
}
