//! Simulated exchange for local runs.
//!
//! Candles come from a seeded random walk, so two runs with the same seed see
//! the same market. Each `fetch_ohlcv` call advances the simulation by one
//! bar; resting stop and take-profit orders are checked against that bar's
//! low and high. Market orders fill immediately at the latest close.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::ExchangeGateway;
use crate::error::TradingError;
use crate::models::{
    CancelOutcome, Fill, OrderSide, OrderState, OrderStatus, PriceBar, ProtectiveKind,
};
use crate::trading::Timeframe;

/// Starting price of the synthetic walk.
const START_PRICE: f64 = 95_000.0;

/// Per-bar standard move (0.2%).
const BAR_VOLATILITY: f64 = 0.002;

const QUANTITY_STEP: Decimal = dec!(0.001);

#[derive(Debug, Clone)]
struct SimOrder {
    kind: ProtectiveKind,
    trigger: Decimal,
    quantity: Decimal,
    state: OrderState,
    fill_price: Option<Decimal>,
}

#[derive(Debug)]
struct SimState {
    rng: StdRng,
    /// Never longer than the largest `limit` requested so far
    bars: Vec<PriceBar>,
    history_cap: usize,
    equity: Decimal,
    position: Decimal,
    entry_price: Decimal,
    orders: HashMap<String, SimOrder>,
    /// Client id -> exchange id, so a repeated placement returns the original order
    client_ids: HashMap<String, String>,
    fills: HashMap<String, Fill>,
    next_id: u64,
}

impl SimState {
    fn next_order_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("dry_run_{}_{}", prefix, self.next_id)
    }

    fn last_close(&self) -> Result<Decimal, TradingError> {
        let bar = self.bars.last().ok_or_else(|| {
            TradingError::OrderRejected("no simulated price yet; fetch candles first".into())
        })?;
        to_decimal(bar.close)
    }

    fn next_bar(&mut self, timestamp: DateTime<Utc>, open: f64) -> PriceBar {
        let change: f64 = self.rng.gen_range(-2.0..2.0) * BAR_VOLATILITY;
        let close = open * (1.0 + change);
        let high = open.max(close) * (1.0 + self.rng.gen_range(0.0..0.001));
        let low = open.min(close) * (1.0 - self.rng.gen_range(0.0..0.001));
        let volume = self.rng.gen_range(100.0..1000.0);
        PriceBar::new(timestamp, open, high, low, close, volume)
    }

    /// Fill or expire resting protective orders against `bar`. Stops are
    /// checked before targets. A bar that opens through the trigger fills at
    /// the open.
    fn trigger_orders(&mut self, bar: &PriceBar) -> Result<(), TradingError> {
        let open = to_decimal(bar.open)?;
        let low = to_decimal(bar.low)?;
        let high = to_decimal(bar.high)?;

        let mut resting: Vec<(String, SimOrder)> = self
            .orders
            .iter()
            .filter(|(_, o)| o.state == OrderState::Open)
            .map(|(id, o)| (id.clone(), o.clone()))
            .collect();
        resting.sort_by_key(|(id, o)| (o.kind != ProtectiveKind::StopLoss, id.clone()));

        for (id, order) in resting {
            let hit = match order.kind {
                ProtectiveKind::StopLoss => low <= order.trigger,
                ProtectiveKind::TakeProfit => high >= order.trigger,
            };
            if !hit {
                continue;
            }

            // Reduce-only: nothing left to reduce means the order expires.
            let quantity = order.quantity.min(self.position);
            let price = match order.kind {
                ProtectiveKind::StopLoss => order.trigger.min(open),
                ProtectiveKind::TakeProfit => order.trigger.max(open),
            };
            let (state, fill_price) = if quantity > Decimal::ZERO {
                let pnl = (price - self.entry_price) * quantity;
                self.position -= quantity;
                self.equity += pnl;
                info!(
                    order_id = %id,
                    kind = %order.kind,
                    trigger = %order.trigger,
                    price = %price,
                    quantity = %quantity,
                    pnl = %pnl,
                    "[DRY RUN] Protective order filled"
                );
                (OrderState::Filled, Some(price))
            } else {
                (OrderState::Canceled, None)
            };

            if let Some(o) = self.orders.get_mut(&id) {
                o.state = state;
                o.fill_price = fill_price;
            }
        }
        Ok(())
    }

    fn place_protective(
        &mut self,
        kind: ProtectiveKind,
        price: Decimal,
        quantity: Decimal,
        client_order_id: &str,
    ) -> Result<String, TradingError> {
        if let Some(id) = self.client_ids.get(client_order_id) {
            return Ok(id.clone());
        }
        if price <= Decimal::ZERO || quantity <= Decimal::ZERO {
            return Err(TradingError::OrderRejected(format!(
                "{} needs positive price and quantity (got {} x {})",
                kind, price, quantity
            )));
        }

        let prefix = match kind {
            ProtectiveKind::StopLoss => "sl",
            ProtectiveKind::TakeProfit => "tp",
        };
        let id = self.next_order_id(prefix);
        self.orders.insert(
            id.clone(),
            SimOrder {
                kind,
                trigger: price,
                quantity,
                state: OrderState::Open,
                fill_price: None,
            },
        );
        self.client_ids.insert(client_order_id.to_string(), id.clone());

        info!(order_id = %id, kind = %kind, price = %price, quantity = %quantity, "[DRY RUN] Protective order placed");
        Ok(id)
    }
}

/// In-process exchange simulation.
pub struct DryRunGateway {
    state: Mutex<SimState>,
    start_price: f64,
}

impl DryRunGateway {
    pub fn new(seed: u64, starting_equity: Decimal) -> Self {
        Self::with_start_price(seed, starting_equity, START_PRICE)
    }

    pub fn with_start_price(seed: u64, starting_equity: Decimal, start_price: f64) -> Self {
        Self {
            state: Mutex::new(SimState {
                rng: StdRng::seed_from_u64(seed),
                bars: Vec::new(),
                history_cap: 0,
                equity: starting_equity,
                position: Decimal::ZERO,
                entry_price: Decimal::ZERO,
                orders: HashMap::new(),
                client_ids: HashMap::new(),
                fills: HashMap::new(),
                next_id: 0,
            }),
            start_price,
        }
    }
}

#[async_trait]
impl ExchangeGateway for DryRunGateway {
    fn name(&self) -> &str {
        "dry-run"
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<PriceBar>, TradingError> {
        let mut state = self.state.lock().await;
        let step = Duration::from_std(timeframe.duration())
            .map_err(|e| TradingError::MarketDataUnavailable(e.to_string()))?;

        if state.bars.is_empty() {
            // Backfill a history ending at the current aligned bar.
            let step_secs = step.num_seconds().max(1);
            let now = Utc::now().timestamp();
            let aligned = DateTime::from_timestamp(now - now.rem_euclid(step_secs), 0)
                .unwrap_or_else(Utc::now);
            let mut open = self.start_price;
            for i in (0..limit.max(1)).rev() {
                let bar = state.next_bar(aligned - step * i as i32, open);
                open = bar.close;
                state.bars.push(bar);
            }
        } else {
            let (last_ts, open) = match state.bars.last() {
                Some(last) => (last.timestamp, last.close),
                None => (Utc::now(), self.start_price),
            };
            let bar = state.next_bar(last_ts + step, open);
            state.bars.push(bar);
            state.trigger_orders(&bar)?;
        }

        state.history_cap = state.history_cap.max(limit);
        let excess = state.bars.len().saturating_sub(state.history_cap);
        state.bars.drain(..excess);

        let start = state.bars.len().saturating_sub(limit);
        let bars = state.bars[start..].to_vec();
        debug!(symbol, count = bars.len(), "[DRY RUN] Generated candles");
        Ok(bars)
    }

    async fn equity(&self) -> Result<Decimal, TradingError> {
        Ok(self.state.lock().await.equity)
    }

    async fn quantity_step(&self, _symbol: &str) -> Result<Decimal, TradingError> {
        Ok(QUANTITY_STEP)
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        client_order_id: &str,
    ) -> Result<Fill, TradingError> {
        let mut state = self.state.lock().await;
        if let Some(fill) = state.fills.get(client_order_id) {
            return Ok(fill.clone());
        }
        if quantity <= Decimal::ZERO {
            return Err(TradingError::OrderRejected(format!(
                "quantity must be positive (got {})",
                quantity
            )));
        }

        let price = state.last_close()?;
        let executed = match side {
            OrderSide::Buy => {
                let margin_needed = (state.position + quantity) * price;
                if margin_needed > state.equity {
                    return Err(TradingError::OrderRejected(format!(
                        "insufficient margin: {} needed, {} available",
                        margin_needed.round_dp(2),
                        state.equity
                    )));
                }
                let held = state.position;
                state.entry_price = if held.is_zero() {
                    price
                } else {
                    (state.entry_price * held + price * quantity) / (held + quantity)
                };
                state.position += quantity;
                quantity
            }
            OrderSide::Sell => {
                // Reduce-only: never flips the simulated account short.
                let executed = quantity.min(state.position);
                if executed <= Decimal::ZERO {
                    return Err(TradingError::OrderRejected("no position to reduce".into()));
                }
                let pnl = (price - state.entry_price) * executed;
                state.equity += pnl;
                state.position -= executed;
                executed
            }
        };

        let order_id = state.next_order_id("mkt");
        let fill = Fill {
            order_id,
            price,
            quantity: executed,
        };
        state.fills.insert(client_order_id.to_string(), fill.clone());

        info!(
            symbol,
            side = side.as_str(),
            price = %fill.price,
            quantity = %fill.quantity,
            "[DRY RUN] Market order filled"
        );
        Ok(fill)
    }

    async fn place_stop_order(
        &self,
        _symbol: &str,
        price: Decimal,
        quantity: Decimal,
        client_order_id: &str,
    ) -> Result<String, TradingError> {
        self.state
            .lock()
            .await
            .place_protective(ProtectiveKind::StopLoss, price, quantity, client_order_id)
    }

    async fn place_take_profit_order(
        &self,
        _symbol: &str,
        price: Decimal,
        quantity: Decimal,
        client_order_id: &str,
    ) -> Result<String, TradingError> {
        self.state
            .lock()
            .await
            .place_protective(ProtectiveKind::TakeProfit, price, quantity, client_order_id)
    }

    async fn cancel_order(
        &self,
        _symbol: &str,
        order_id: &str,
    ) -> Result<CancelOutcome, TradingError> {
        let mut state = self.state.lock().await;
        match state.orders.get_mut(order_id) {
            Some(order) if order.state == OrderState::Open => {
                order.state = OrderState::Canceled;
                info!(order_id, "[DRY RUN] Order canceled");
                Ok(CancelOutcome::Canceled)
            }
            _ => Ok(CancelOutcome::NotFound),
        }
    }

    async fn order_status(
        &self,
        _symbol: &str,
        order_id: &str,
    ) -> Result<OrderStatus, TradingError> {
        let state = self.state.lock().await;
        state
            .orders
            .get(order_id)
            .map(|o| match o.state {
                OrderState::Filled => OrderStatus::filled(o.fill_price),
                other => OrderStatus::new(other),
            })
            .ok_or_else(|| TradingError::OrderRejected(format!("unknown order {}", order_id)))
    }

    async fn position_size(&self, _symbol: &str) -> Result<Decimal, TradingError> {
        Ok(self.state.lock().await.position)
    }
}

fn to_decimal(value: f64) -> Result<Decimal, TradingError> {
    Decimal::try_from(value)
        .map(|d| d.round_dp(2))
        .map_err(|e| TradingError::MarketDataUnavailable(format!("price {} not representable: {}", value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SYMBOL: &str = "BTC/USDT";

    #[tokio::test]
    async fn test_same_seed_same_market() {
        let a = DryRunGateway::new(7, dec!(10000));
        let b = DryRunGateway::new(7, dec!(10000));
        let bars_a = a.fetch_ohlcv(SYMBOL, Timeframe::M15, 50).await.unwrap();
        let bars_b = b.fetch_ohlcv(SYMBOL, Timeframe::M15, 50).await.unwrap();
        assert_eq!(bars_a.len(), 50);
        let closes_a: Vec<f64> = bars_a.iter().map(|b| b.close).collect();
        let closes_b: Vec<f64> = bars_b.iter().map(|b| b.close).collect();
        assert_eq!(closes_a, closes_b);
    }

    #[tokio::test]
    async fn test_each_fetch_advances_one_bar() {
        let gw = DryRunGateway::new(1, dec!(10000));
        let first = gw.fetch_ohlcv(SYMBOL, Timeframe::M15, 30).await.unwrap();
        let second = gw.fetch_ohlcv(SYMBOL, Timeframe::M15, 30).await.unwrap();
        assert!(PriceBar::is_ordered(&first));
        assert!(PriceBar::is_ordered(&second));
        assert_eq!(second.len(), 30);
        assert_eq!(second[28].timestamp, first[29].timestamp);
        assert_eq!(
            second[29].timestamp - first[29].timestamp,
            Duration::minutes(15)
        );
        for bar in &second {
            assert!(bar.low <= bar.open.min(bar.close));
            assert!(bar.high >= bar.open.max(bar.close));
        }
    }

    #[tokio::test]
    async fn test_history_is_capped_at_largest_limit() {
        let gw = DryRunGateway::new(2, dec!(10000));
        gw.fetch_ohlcv(SYMBOL, Timeframe::M15, 30).await.unwrap();
        for _ in 0..50 {
            let bars = gw.fetch_ohlcv(SYMBOL, Timeframe::M15, 10).await.unwrap();
            assert_eq!(bars.len(), 10);
        }
        assert_eq!(gw.state.lock().await.bars.len(), 30);

        let wider = gw.fetch_ohlcv(SYMBOL, Timeframe::M15, 40).await.unwrap();
        assert_eq!(wider.len(), 31);
        assert!(PriceBar::is_ordered(&wider));
    }

    #[tokio::test]
    async fn test_round_trip_updates_equity() {
        let gw = DryRunGateway::new(3, dec!(10000));
        gw.fetch_ohlcv(SYMBOL, Timeframe::M15, 30).await.unwrap();

        let buy = gw
            .place_market_order(SYMBOL, OrderSide::Buy, dec!(0.01), "entry-1")
            .await
            .unwrap();
        assert_eq!(gw.position_size(SYMBOL).await.unwrap(), dec!(0.01));

        // Same client id does not buy twice.
        let again = gw
            .place_market_order(SYMBOL, OrderSide::Buy, dec!(0.01), "entry-1")
            .await
            .unwrap();
        assert_eq!(again, buy);
        assert_eq!(gw.position_size(SYMBOL).await.unwrap(), dec!(0.01));

        gw.fetch_ohlcv(SYMBOL, Timeframe::M15, 30).await.unwrap();
        let sell = gw
            .place_market_order(SYMBOL, OrderSide::Sell, dec!(0.01), "exit-1")
            .await
            .unwrap();
        assert_eq!(gw.position_size(SYMBOL).await.unwrap(), Decimal::ZERO);

        let expected = dec!(10000) + (sell.price - buy.price) * dec!(0.01);
        assert_eq!(gw.equity().await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_insufficient_margin_rejected() {
        let gw = DryRunGateway::new(3, dec!(100));
        gw.fetch_ohlcv(SYMBOL, Timeframe::M15, 30).await.unwrap();
        let err = gw
            .place_market_order(SYMBOL, OrderSide::Buy, dec!(1), "entry-big")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "order_rejected");
        assert_eq!(gw.position_size(SYMBOL).await.unwrap(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_stop_triggers_on_bar_low() {
        let gw = DryRunGateway::new(5, dec!(10000));
        gw.fetch_ohlcv(SYMBOL, Timeframe::M15, 30).await.unwrap();
        let fill = gw
            .place_market_order(SYMBOL, OrderSide::Buy, dec!(0.01), "entry")
            .await
            .unwrap();

        // A stop above the market fills on the next bar; a far target stays open.
        let sl = gw
            .place_stop_order(SYMBOL, fill.price * dec!(2), dec!(0.01), "sl")
            .await
            .unwrap();
        let tp = gw
            .place_take_profit_order(SYMBOL, fill.price * dec!(10), dec!(0.01), "tp")
            .await
            .unwrap();

        let bars = gw.fetch_ohlcv(SYMBOL, Timeframe::M15, 30).await.unwrap();
        let stop = gw.order_status(SYMBOL, &sl).await.unwrap();
        assert!(stop.is_filled());
        // The bar opened below the trigger, so the stop filled at the open.
        let open = to_decimal(bars.last().unwrap().open).unwrap();
        assert_eq!(stop.avg_price, Some(open));
        assert_eq!(
            gw.order_status(SYMBOL, &tp).await.unwrap(),
            OrderStatus::new(OrderState::Open)
        );
        assert_eq!(gw.position_size(SYMBOL).await.unwrap(), Decimal::ZERO);

        assert_eq!(gw.cancel_order(SYMBOL, &tp).await.unwrap(), CancelOutcome::Canceled);
        assert_eq!(gw.cancel_order(SYMBOL, &tp).await.unwrap(), CancelOutcome::NotFound);
        assert_eq!(gw.cancel_order(SYMBOL, &sl).await.unwrap(), CancelOutcome::NotFound);
    }
}
