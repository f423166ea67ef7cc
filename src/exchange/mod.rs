//! Exchange gateway: market data and order execution behind one trait.
//!
//! The orchestrator only ever talks to `dyn ExchangeGateway`, so simulated,
//! testnet and live trading run the same decision code. Variants:
//! - [`DryRunGateway`]: seeded synthetic candles and immediate simulated fills
//! - [`BinanceFuturesGateway`]: signed REST against Binance USDⓈ-M futures,
//!   testnet or mainnet

mod binance;
mod dry_run;
mod retry;

pub use binance::BinanceFuturesGateway;
pub use dry_run::DryRunGateway;
pub use retry::RetryPolicy;

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::TradingError;
use crate::models::{CancelOutcome, Fill, OrderSide, OrderStatus, PriceBar};
use crate::trading::Timeframe;

/// Future returned by [`ExchangeGateway`] methods.
pub type GatewayFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TradingError>> + Send + 'a>>;

/// Where orders go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ExchangeMode {
    /// Synthetic data, simulated fills, no network
    DryRun,
    /// Binance futures testnet
    Testnet,
    /// Binance futures mainnet, real funds
    Live,
}

impl ExchangeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeMode::DryRun => "dry-run",
            ExchangeMode::Testnet => "testnet",
            ExchangeMode::Live => "live",
        }
    }

    pub fn needs_credentials(&self) -> bool {
        !matches!(self, ExchangeMode::DryRun)
    }
}

impl std::fmt::Display for ExchangeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Market data and order execution for one account.
///
/// Every order placement takes a caller-generated `client_order_id`. Callers
/// reuse the same id when retrying a placement, and implementations must not
/// create a second order for an id they have already accepted.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    fn name(&self) -> &str;

    /// Closed and forming candles, oldest first. Fails with
    /// `MarketDataUnavailable`.
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<PriceBar>, TradingError>;

    /// Account equity in the quote asset.
    async fn equity(&self) -> Result<Decimal, TradingError>;

    /// Minimum tradable quantity increment for `symbol`.
    async fn quantity_step(&self, symbol: &str) -> Result<Decimal, TradingError>;

    /// Market order that returns only once the fill is confirmed.
    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        client_order_id: &str,
    ) -> Result<Fill, TradingError>;

    /// Reduce-only sell stop at `price`. Returns the exchange order id.
    async fn place_stop_order(
        &self,
        symbol: &str,
        price: Decimal,
        quantity: Decimal,
        client_order_id: &str,
    ) -> Result<String, TradingError>;

    /// Reduce-only sell take-profit at `price`. Returns the exchange order id.
    async fn place_take_profit_order(
        &self,
        symbol: &str,
        price: Decimal,
        quantity: Decimal,
        client_order_id: &str,
    ) -> Result<String, TradingError>;

    async fn cancel_order(&self, symbol: &str, order_id: &str)
        -> Result<CancelOutcome, TradingError>;

    /// State of an order, with its average fill price once it has traded.
    async fn order_status(&self, symbol: &str, order_id: &str)
        -> Result<OrderStatus, TradingError>;

    /// Open long quantity in `symbol`; zero when flat.
    async fn position_size(&self, symbol: &str) -> Result<Decimal, TradingError>;
}

/// Fresh client order id for one logical order.
pub fn client_order_id(tag: &str) -> String {
    // Binance caps client ids at 36 characters.
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("emx-{}-{}", tag, &id[..24])
}
