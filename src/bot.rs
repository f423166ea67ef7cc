//! Bot runner: the cadence-driven trading loop.
//!
//! Each cycle runs to completion before the next one starts:
//! - Resume an unfinished exit, if any
//! - Fetch candles and compute indicators
//! - Poll resting protective orders of an open position
//! - Evaluate the signal and enter or exit
//! - Emit one status record to every sink
//!
//! The position state is owned here and only changes after the exchange has
//! confirmed the corresponding operation. While FLAT, every cycle also checks
//! the exchange for a position the bot does not track; entries stay blocked
//! until it is gone.

use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::TradingError;
use crate::exchange::{client_order_id, ExchangeGateway, RetryPolicy};
use crate::indicators::{latest_pair, IndicatorEngine};
use crate::models::{
    CancelOutcome, ClosedTrade, OrderSide, OrderState, OrderStatus, PriceBar, ProtectiveKind,
};
use crate::status::{
    Action, CycleStatus, StatusError, StatusSink, UNPROTECTED_POSITION, UNTRACKED_POSITION,
};
use crate::trading::{
    ExitTrigger, PositionPhase, PositionState, RiskManager, Signal, SignalGenerator, Timeframe,
    TradingConfig,
};

/// Main bot runner.
pub struct Bot {
    config: TradingConfig,
    retry: RetryPolicy,
    gateway: Box<dyn ExchangeGateway>,
    engine: IndicatorEngine,
    signals: SignalGenerator,
    risk: RiskManager,
    sinks: Vec<Box<dyn StatusSink>>,

    // Runtime state
    state: PositionState,
    // Exchange quantity held while FLAT
    untracked: Decimal,
    cycle: u64,
    history: Vec<CycleStatus>,
    trades: Vec<ClosedTrade>,
    realized_pnl: Decimal,

    // Flipped to true to stop between cycles
    shutdown: watch::Receiver<bool>,
}

impl Bot {
    /// Create a bot around an already-validated configuration.
    pub fn new(
        config: TradingConfig,
        retry: RetryPolicy,
        gateway: Box<dyn ExchangeGateway>,
        sinks: Vec<Box<dyn StatusSink>>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            engine: IndicatorEngine::from_config(&config.strategy),
            signals: SignalGenerator::new(&config),
            risk: RiskManager::new(config.risk.clone()),
            config,
            retry,
            gateway,
            sinks,
            state: PositionState::Flat,
            untracked: Decimal::ZERO,
            cycle: 0,
            history: Vec::new(),
            trades: Vec::new(),
            realized_pnl: Decimal::ZERO,
            shutdown,
        }
    }

    pub fn state(&self) -> &PositionState {
        &self.state
    }

    pub fn history(&self) -> &[CycleStatus] {
        &self.history
    }

    pub fn trades(&self) -> &[ClosedTrade] {
        &self.trades
    }

    /// Main run loop. Returns once shutdown is requested.
    pub async fn run(&mut self) -> Result<()> {
        info!(
            symbol = %self.config.symbol,
            timeframe = %self.config.timeframe,
            exchange = self.gateway.name(),
            "Starting trading loop"
        );

        if let Err(e) = self.reconcile().await {
            warn!(error = %e, "Could not check exchange position at startup");
        }

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            self.run_cycle().await;

            let wait = next_cycle_delay(Utc::now(), self.config.timeframe);
            debug!(wait_secs = wait.as_secs(), "Sleeping until next candle");
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.shutdown.changed() => {
                    info!("Shutdown requested, stopping between cycles");
                    break;
                }
            }
        }

        self.log_shutdown();
        Ok(())
    }

    /// Run one full cycle and emit its status record.
    pub async fn run_cycle(&mut self) -> CycleStatus {
        self.cycle += 1;
        let mut status = CycleStatus::new(self.cycle, &self.config.symbol, self.state.phase());

        if let Err(e) = self.step(&mut status).await {
            error!(cycle = self.cycle, kind = e.kind(), error = %e, "Cycle failed");
            status.error = Some(StatusError::from(&e));
        }

        status.position_state = self.state.phase();
        if let Some(position) = self.state.position() {
            if self.state.phase() == PositionPhase::Open && !position.is_protected() {
                let missing: Vec<&str> = position
                    .missing_protection()
                    .iter()
                    .map(|k| k.as_str())
                    .collect();
                warn!(missing = ?missing, "Open position is missing protective orders");
                status
                    .warnings
                    .push(format!("{}: missing {}", UNPROTECTED_POSITION, missing.join(", ")));
            }
        }
        if self.state.phase() == PositionPhase::Flat && self.untracked > Decimal::ZERO {
            status
                .warnings
                .push(format!("{}: exchange holds {}", UNTRACKED_POSITION, self.untracked));
        }

        self.emit(&status).await;
        status
    }

    async fn step(&mut self, status: &mut CycleStatus) -> Result<(), TradingError> {
        // An exit left unfinished last cycle is this cycle's only transition.
        if self.state.phase() == PositionPhase::Exiting {
            info!("Resuming unfinished exit");
            status.action = Action::ExitPending;
            return self.finish_exit(status, None).await;
        }

        if self.state.phase() == PositionPhase::Flat {
            self.reconcile().await?;
        }

        let bars = self.fetch_bars().await?;
        let snapshots = self.engine.compute(&bars);
        let (prev, curr) = latest_pair(&snapshots).ok_or_else(|| {
            TradingError::MarketDataUnavailable(format!(
                "{} bars is not enough history for two indicator snapshots",
                bars.len()
            ))
        })?;
        let last = bars
            .last()
            .ok_or_else(|| TradingError::MarketDataUnavailable("empty candle series".into()))?;
        let price = last.close;
        status.price = Some(price);

        let entry_price = self
            .state
            .position()
            .and_then(|p| p.entry_price.to_f64());
        let evaluation = self.signals.evaluate(prev, curr, price, entry_price);
        status.signal = Some(evaluation.signal);
        status.reason = Some(evaluation.reason);

        match self.state.phase() {
            PositionPhase::Flat if evaluation.signal == Signal::EnterLong => {
                if self.untracked > Decimal::ZERO {
                    warn!(quantity = %self.untracked, "Entry blocked by untracked exchange position");
                    status.action = Action::EntrySkipped;
                    return Ok(());
                }
                self.enter(price, status).await
            }
            PositionPhase::Open => {
                let filled = self.poll_protection().await?;
                let trigger = match filled {
                    Some(kind) => {
                        if evaluation.signal == Signal::ExitLong {
                            info!(kind = %kind, reason = %evaluation.reason, "Protective fill takes precedence over exit signal");
                        }
                        Some(ExitTrigger::ProtectiveFill(kind))
                    }
                    None if evaluation.signal == Signal::ExitLong => {
                        Some(ExitTrigger::Signal(evaluation.reason))
                    }
                    None => None,
                };

                match trigger {
                    Some(trigger) => {
                        info!(trigger = %trigger, price, "Exiting position");
                        self.state.begin_exit(trigger)?;
                        status.action = Action::ExitPending;
                        self.finish_exit(status, Some(to_decimal(price)?)).await
                    }
                    None => Ok(()),
                }
            }
            _ => Ok(()),
        }
    }

    async fn fetch_bars(&self) -> Result<Vec<PriceBar>, TradingError> {
        let symbol = self.config.symbol.as_str();
        let timeframe = self.config.timeframe;
        let limit = self.config.history_limit;
        let bars = self
            .retry
            .call(
                "fetch_ohlcv",
                TradingError::MarketDataUnavailable,
                self.gateway.as_ref(),
                move |gw| gw.fetch_ohlcv(symbol, timeframe, limit),
            )
            .await?;

        if !PriceBar::is_ordered(&bars) {
            return Err(TradingError::MarketDataUnavailable(
                "candles are not in strictly increasing time order".into(),
            ));
        }
        Ok(bars)
    }

    /// FLAT -> ENTERING -> OPEN, or back to FLAT if the fill is not confirmed.
    async fn enter(&mut self, price: f64, status: &mut CycleStatus) -> Result<(), TradingError> {
        let symbol = self.config.symbol.as_str();
        let gateway = self.gateway.as_ref();

        let equity = self
            .retry
            .call("equity", TradingError::ExchangeUnavailable, gateway, |gw| {
                gw.equity()
            })
            .await?;
        let step = self
            .retry
            .call(
                "quantity_step",
                TradingError::ExchangeUnavailable,
                gateway,
                move |gw| gw.quantity_step(symbol),
            )
            .await?;

        let plan = match self.risk.size(equity, to_decimal(price)?, step) {
            Ok(plan) => plan,
            Err(e) => {
                warn!(error = %e, equity = %equity, "Entry skipped by risk sizing");
                status.action = Action::EntrySkipped;
                return Err(e);
            }
        };

        info!(
            quantity = %plan.quantity,
            price = %plan.entry_price,
            notional = %plan.notional().round_dp(2),
            equity = %equity,
            "Entering long"
        );
        self.state.begin_entry(plan.clone())?;

        let entry_id = client_order_id("entry");
        let entry_id = entry_id.as_str();
        let quantity = plan.quantity;
        let result = self
            .retry
            .call(
                "entry order",
                TradingError::ExchangeUnavailable,
                self.gateway.as_ref(),
                move |gw| gw.place_market_order(symbol, OrderSide::Buy, quantity, entry_id),
            )
            .await;

        let fill = match result {
            Ok(fill) => fill,
            Err(e) => {
                self.state.abort_entry()?;
                status.action = Action::EntryAborted;
                warn!(error = %e, "Entry order not confirmed, staying flat");
                if e.is_transient() {
                    // The order may have filled anyway.
                    if let Err(err) = self.reconcile().await {
                        warn!(error = %err, "Could not verify position after failed entry");
                    }
                }
                return Err(e);
            }
        };

        // Protective levels follow the actual fill, not the planned price.
        let (stop_price, take_profit_price) = self.risk.protective_levels(fill.price);
        self.state
            .confirm_fill(&fill, stop_price, take_profit_price, Utc::now())?;
        status.action = Action::Entered;
        info!(
            order_id = %fill.order_id,
            price = %fill.price,
            quantity = %fill.quantity,
            stop = %stop_price,
            target = %take_profit_price,
            "Entry filled"
        );

        for kind in [ProtectiveKind::StopLoss, ProtectiveKind::TakeProfit] {
            let trigger = match kind {
                ProtectiveKind::StopLoss => stop_price,
                ProtectiveKind::TakeProfit => take_profit_price,
            };
            match self.place_protective(kind, trigger, fill.quantity).await {
                Ok(order_id) => self.state.attach_protection(kind, order_id)?,
                Err(e) => {
                    warn!(kind = %kind, error = %e, "Protective order not placed");
                    status.error = Some(StatusError::from(&e));
                }
            }
        }

        Ok(())
    }

    async fn place_protective(
        &self,
        kind: ProtectiveKind,
        price: Decimal,
        quantity: Decimal,
    ) -> Result<String, TradingError> {
        let symbol = self.config.symbol.as_str();
        let client_id = client_order_id(match kind {
            ProtectiveKind::StopLoss => "sl",
            ProtectiveKind::TakeProfit => "tp",
        });
        let client_id = client_id.as_str();

        self.retry
            .call(
                kind.as_str(),
                TradingError::ExchangeUnavailable,
                self.gateway.as_ref(),
                move |gw| match kind {
                    ProtectiveKind::StopLoss => {
                        gw.place_stop_order(symbol, price, quantity, client_id)
                    }
                    ProtectiveKind::TakeProfit => {
                        gw.place_take_profit_order(symbol, price, quantity, client_id)
                    }
                },
            )
            .await
    }

    /// Refresh the exchange quantity the bot is not tracking. Only meaningful
    /// while FLAT.
    async fn reconcile(&mut self) -> Result<Decimal, TradingError> {
        let size = self.position_size().await?;
        if size > Decimal::ZERO && self.untracked.is_zero() {
            error!(quantity = %size, "Exchange reports a position the bot is not tracking");
        } else if size.is_zero() && self.untracked > Decimal::ZERO {
            info!(quantity = %self.untracked, "Untracked exchange position is gone");
        }
        self.untracked = size;
        Ok(size)
    }

    /// Check resting protective orders. Returns the kind that filled, if any.
    async fn poll_protection(&mut self) -> Result<Option<ProtectiveKind>, TradingError> {
        let orders = match self.state.position() {
            Some(position) => position.protective_orders(),
            None => return Ok(None),
        };

        for (kind, order_id) in orders {
            let status = self.order_status(&order_id).await?;
            match status.state {
                OrderState::Filled => {
                    info!(kind = %kind, order_id = %order_id, "Protective order filled on exchange");
                    return Ok(Some(kind));
                }
                OrderState::Canceled => {
                    warn!(kind = %kind, order_id = %order_id, "Protective order canceled outside the bot");
                    if let Some(position) = self.state.position_mut() {
                        position.clear_protective(kind);
                    }
                }
                OrderState::Open => {}
            }
        }
        Ok(None)
    }

    async fn order_status(&self, order_id: &str) -> Result<OrderStatus, TradingError> {
        let symbol = self.config.symbol.as_str();
        self.retry
            .call(
                "order_status",
                TradingError::ExchangeUnavailable,
                self.gateway.as_ref(),
                move |gw| gw.order_status(symbol, order_id),
            )
            .await
    }

    /// EXITING -> FLAT: cancel what still rests, close what is still held,
    /// then confirm the exchange shows no position. Any failure leaves the
    /// state EXITING so the next cycle picks up where this one stopped.
    async fn finish_exit(
        &mut self,
        status: &mut CycleStatus,
        market_price: Option<Decimal>,
    ) -> Result<(), TradingError> {
        let (position, trigger) = match &self.state {
            PositionState::Exiting { position, trigger } => (position.clone(), *trigger),
            other => {
                return Err(TradingError::IllegalTransition(format!(
                    "cannot finish exit while {}",
                    other.phase()
                )))
            }
        };
        let symbol = self.config.symbol.as_str();

        let mut exit_price = None;
        if let ExitTrigger::ProtectiveFill(kind) = trigger {
            let filled_id = self
                .state
                .position()
                .and_then(|p| p.protective_orders().into_iter().find(|(k, _)| *k == kind))
                .map(|(_, id)| id);
            // The id is already cleared when resuming an exit.
            let avg_price = match filled_id {
                Some(order_id) => {
                    let filled = self.order_status(&order_id).await?;
                    if let Some(p) = self.state.position_mut() {
                        p.clear_protective(kind);
                    }
                    filled.avg_price
                }
                None => None,
            };
            exit_price = Some(avg_price.unwrap_or_else(|| position.protective_price(kind)));
        }

        // Cancel before closing so a stale protective order cannot also execute.
        let resting = self
            .state
            .position()
            .map(|p| p.protective_orders())
            .unwrap_or_default();
        for (kind, order_id) in resting {
            let order_id = order_id.as_str();
            let outcome = self
                .retry
                .call(
                    "cancel_order",
                    TradingError::ExchangeUnavailable,
                    self.gateway.as_ref(),
                    move |gw| gw.cancel_order(symbol, order_id),
                )
                .await?;

            let raced = match outcome {
                CancelOutcome::NotFound => Some(self.order_status(order_id).await?)
                    .filter(OrderStatus::is_filled),
                CancelOutcome::Canceled => None,
            };
            match raced {
                Some(filled) => {
                    info!(kind = %kind, order_id, "Protective order filled before it could be canceled");
                    exit_price.get_or_insert(
                        filled
                            .avg_price
                            .unwrap_or_else(|| position.protective_price(kind)),
                    );
                }
                None => debug!(kind = %kind, order_id, ?outcome, "Protective order removed"),
            }
            if let Some(p) = self.state.position_mut() {
                p.clear_protective(kind);
            }
        }

        let remaining = self.position_size().await?;
        if remaining > Decimal::ZERO {
            let exit_id = client_order_id("exit");
            let exit_id = exit_id.as_str();
            let fill = self
                .retry
                .call(
                    "exit order",
                    TradingError::ExchangeUnavailable,
                    self.gateway.as_ref(),
                    move |gw| gw.place_market_order(symbol, OrderSide::Sell, remaining, exit_id),
                )
                .await?;
            info!(order_id = %fill.order_id, price = %fill.price, quantity = %fill.quantity, "Exit filled");
            exit_price.get_or_insert(fill.price);
        }

        let left = self.position_size().await?;
        if left > Decimal::ZERO {
            return Err(TradingError::OrderRejected(format!(
                "exchange still reports {} open after close",
                left
            )));
        }

        let exit_price = exit_price
            .or(market_price)
            .unwrap_or(position.entry_price);
        let trade = self.state.complete_exit(exit_price, Utc::now())?;

        self.realized_pnl += trade.pnl;
        status.action = Action::Exited;
        status.realized_pnl = Some(trade.pnl);
        info!(
            pnl = %trade.pnl.round_dp(2),
            total_pnl = %self.realized_pnl.round_dp(2),
            reason = %trade.exit_reason,
            "Position closed"
        );

        for sink in &self.sinks {
            if let Err(e) = sink.record_trade(&trade).await {
                warn!(sink = sink.name(), error = %e, "Failed to record closed trade");
            }
        }
        self.trades.push(trade);
        Ok(())
    }

    async fn position_size(&self) -> Result<Decimal, TradingError> {
        let symbol = self.config.symbol.as_str();
        self.retry
            .call(
                "position_size",
                TradingError::ExchangeUnavailable,
                self.gateway.as_ref(),
                move |gw| gw.position_size(symbol),
            )
            .await
    }

    async fn emit(&mut self, status: &CycleStatus) {
        for sink in &self.sinks {
            if let Err(e) = sink.publish(status).await {
                warn!(sink = sink.name(), error = %e, "Failed to publish status");
            }
        }
        self.history.push(status.clone());
    }

    pub fn stats(&self) -> BotStats {
        BotStats {
            cycles: self.cycle,
            errors: self.history.iter().filter(|s| s.error.is_some()).count(),
            closed_trades: self.trades.len(),
            winning_trades: self.trades.iter().filter(|t| t.pnl > Decimal::ZERO).count(),
            realized_pnl: self.realized_pnl,
            position_state: self.state.phase(),
        }
    }

    fn log_shutdown(&self) {
        let stats = self.stats();
        info!("Trading loop stopped\n{}", stats);
        if self.untracked > Decimal::ZERO {
            warn!(quantity = %self.untracked, "Stopped with an untracked exchange position");
        }
        if let Some(position) = self.state.position() {
            warn!(
                quantity = %position.quantity,
                entry = %position.entry_price,
                protected = position.is_protected(),
                "Stopped with an open position; protective orders stay on the exchange"
            );
        }
    }
}

/// Summary of a run.
#[derive(Debug, Clone)]
pub struct BotStats {
    pub cycles: u64,
    pub errors: usize,
    pub closed_trades: usize,
    pub winning_trades: usize,
    pub realized_pnl: Decimal,
    pub position_state: PositionPhase,
}

impl std::fmt::Display for BotStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Bot Statistics ===")?;
        writeln!(f, "Cycles:        {} ({} with errors)", self.cycles, self.errors)?;
        writeln!(f, "Closed Trades: {} (Winners: {})", self.closed_trades, self.winning_trades)?;
        writeln!(f, "Realized P&L:  ${:.2}", self.realized_pnl)?;
        writeln!(f, "Position:      {}", self.position_state)?;
        Ok(())
    }
}

/// Time from `now` until the next multiple of the timeframe since the epoch.
pub fn next_cycle_delay(now: DateTime<Utc>, timeframe: Timeframe) -> Duration {
    let period_ms = timeframe.duration().as_millis() as i64;
    let now_ms = now.timestamp_millis();
    let next = (now_ms.div_euclid(period_ms) + 1) * period_ms;
    Duration::from_millis((next - now_ms) as u64)
}

fn to_decimal(price: f64) -> Result<Decimal, TradingError> {
    Decimal::try_from(price)
        .map(|d| d.round_dp(8))
        .map_err(|e| TradingError::MarketDataUnavailable(format!("price {} not representable: {}", price, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use rust_decimal_macros::dec;
    use tokio_test::assert_ok;

    use crate::models::{Fill, Position};
    use crate::trading::SignalReason;

    /// Everything the scripted gateway was asked to do.
    #[derive(Default)]
    struct Script {
        bars: Vec<PriceBar>,
        fetch_failures: u32,
        fetch_calls: u32,
        equity: Decimal,
        fill_price: Decimal,
        entry_failures: VecDeque<TradingError>,
        // Failed entries that still reached the book
        lost_fills: u32,
        exit_failures: VecDeque<TradingError>,
        protective_failures: u32,
        order_states: HashMap<String, OrderState>,
        avg_prices: HashMap<String, Decimal>,
        // Protective order that fills while its cancel is in flight
        fill_on_cancel: Option<String>,
        position: Decimal,
        next_id: u32,
        calls: Vec<String>,
    }

    #[derive(Clone, Default)]
    struct ScriptedGateway(Arc<Mutex<Script>>);

    impl ScriptedGateway {
        fn with_bars(bars: Vec<PriceBar>) -> Self {
            let gw = Self::default();
            {
                let mut s = gw.0.lock().unwrap();
                s.bars = bars;
                s.equity = dec!(10000);
                s.fill_price = dec!(51118.95);
            }
            gw
        }

        fn script(&self) -> std::sync::MutexGuard<'_, Script> {
            self.0.lock().unwrap()
        }
    }

    #[async_trait]
    impl ExchangeGateway for ScriptedGateway {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn fetch_ohlcv(
            &self,
            _symbol: &str,
            _timeframe: Timeframe,
            _limit: usize,
        ) -> Result<Vec<PriceBar>, TradingError> {
            let mut s = self.script();
            s.fetch_calls += 1;
            if s.fetch_failures > 0 {
                s.fetch_failures -= 1;
                return Err(TradingError::MarketDataUnavailable("connection reset".into()));
            }
            Ok(s.bars.clone())
        }

        async fn equity(&self) -> Result<Decimal, TradingError> {
            Ok(self.script().equity)
        }

        async fn quantity_step(&self, _symbol: &str) -> Result<Decimal, TradingError> {
            Ok(dec!(0.001))
        }

        async fn place_market_order(
            &self,
            _symbol: &str,
            side: OrderSide,
            quantity: Decimal,
            _client_order_id: &str,
        ) -> Result<Fill, TradingError> {
            let mut s = self.script();
            s.calls.push(format!("market {} {}", side.as_str(), quantity));
            let failure = match side {
                OrderSide::Buy => s.entry_failures.pop_front(),
                OrderSide::Sell => s.exit_failures.pop_front(),
            };
            if let Some(err) = failure {
                if side == OrderSide::Buy && s.lost_fills > 0 {
                    s.lost_fills -= 1;
                    s.position += quantity;
                }
                return Err(err);
            }
            match side {
                OrderSide::Buy => s.position += quantity,
                OrderSide::Sell => s.position -= quantity,
            }
            s.next_id += 1;
            Ok(Fill {
                order_id: format!("m{}", s.next_id),
                price: s.fill_price,
                quantity,
            })
        }

        async fn place_stop_order(
            &self,
            _symbol: &str,
            price: Decimal,
            _quantity: Decimal,
            _client_order_id: &str,
        ) -> Result<String, TradingError> {
            let mut s = self.script();
            s.calls.push(format!("stop {}", price));
            if s.protective_failures > 0 {
                s.protective_failures -= 1;
                return Err(TradingError::OrderRejected("would immediately trigger".into()));
            }
            s.order_states.insert("sl-1".into(), OrderState::Open);
            Ok("sl-1".into())
        }

        async fn place_take_profit_order(
            &self,
            _symbol: &str,
            price: Decimal,
            _quantity: Decimal,
            _client_order_id: &str,
        ) -> Result<String, TradingError> {
            let mut s = self.script();
            s.calls.push(format!("tp {}", price));
            s.order_states.insert("tp-1".into(), OrderState::Open);
            Ok("tp-1".into())
        }

        async fn cancel_order(
            &self,
            _symbol: &str,
            order_id: &str,
        ) -> Result<CancelOutcome, TradingError> {
            let mut s = self.script();
            s.calls.push(format!("cancel {}", order_id));
            if s.fill_on_cancel.as_deref() == Some(order_id) {
                s.order_states.insert(order_id.into(), OrderState::Filled);
                s.position = Decimal::ZERO;
                return Ok(CancelOutcome::NotFound);
            }
            match s.order_states.get_mut(order_id) {
                Some(state) if *state == OrderState::Open => {
                    *state = OrderState::Canceled;
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
            let s = self.script();
            let state = s
                .order_states
                .get(order_id)
                .copied()
                .ok_or_else(|| TradingError::OrderRejected(format!("unknown {}", order_id)))?;
            Ok(OrderStatus {
                state,
                avg_price: s.avg_prices.get(order_id).copied(),
            })
        }

        async fn position_size(&self, _symbol: &str) -> Result<Decimal, TradingError> {
            Ok(self.script().position)
        }
    }

    fn bars_from_closes(closes: &[f64]) -> Vec<PriceBar> {
        let t0 = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, c)| PriceBar::flat(t0 + ChronoDuration::minutes(15 * i as i64), *c))
            .collect()
    }

    /// Oscillating market whose last bar jumps 2%, pulling the fast EMA
    /// above the slow one with RSI near 62.
    fn crossover_bars() -> Vec<PriceBar> {
        let mut closes: Vec<f64> = (0..99)
            .map(|i| 50_000.0 + 500.0 * (i as f64 * 0.9).sin())
            .collect();
        let last = closes[98] * 1.02;
        closes.push(last);
        bars_from_closes(&closes)
    }

    fn flat_bars(price: f64) -> Vec<PriceBar> {
        bars_from_closes(&vec![price; 100])
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: std::time::Duration::from_millis(1),
            max_delay: std::time::Duration::from_millis(2),
            call_timeout: std::time::Duration::from_secs(1),
        }
    }

    fn scripted_bot(gateway: &ScriptedGateway) -> Bot {
        let (_tx, rx) = watch::channel(false);
        Bot::new(
            TradingConfig::default(),
            fast_retry(),
            Box::new(gateway.clone()),
            Vec::new(),
            rx,
        )
    }

    /// Put the bot into OPEN at `entry` with both protective orders resting.
    fn open_at(bot: &mut Bot, gateway: &ScriptedGateway, entry: Decimal) {
        let fill = Fill {
            order_id: "m0".into(),
            price: entry,
            quantity: dec!(0.02),
        };
        let (stop, target) = bot.risk.protective_levels(entry);
        let mut position = Position::from_fill(&fill, stop, target, Utc::now());
        position.stop_order_id = Some("sl-1".into());
        position.take_profit_order_id = Some("tp-1".into());
        bot.state = PositionState::Open(position);

        let mut s = gateway.script();
        s.position = dec!(0.02);
        s.order_states.insert("sl-1".into(), OrderState::Open);
        s.order_states.insert("tp-1".into(), OrderState::Open);
    }

    #[tokio::test]
    async fn test_market_data_outage_skips_cycle() {
        let gateway = ScriptedGateway::with_bars(crossover_bars());
        gateway.script().fetch_failures = 3;
        let mut bot = scripted_bot(&gateway);

        let status = bot.run_cycle().await;

        assert_eq!(gateway.script().fetch_calls, 3);
        assert_eq!(bot.history().len(), 1);
        assert_eq!(status.error.unwrap().kind, "market_data_unavailable");
        assert_eq!(status.signal, None);
        assert_eq!(status.action, Action::None);
        assert_eq!(*bot.state(), PositionState::Flat);
        assert!(gateway.script().calls.is_empty());
    }

    #[tokio::test]
    async fn test_transient_fetch_failure_recovers_within_cycle() {
        let gateway = ScriptedGateway::with_bars(flat_bars(50_000.0));
        gateway.script().fetch_failures = 2;
        let mut bot = scripted_bot(&gateway);

        let status = bot.run_cycle().await;
        assert!(status.error.is_none());
        assert_eq!(status.signal, Some(Signal::Hold));
    }

    #[tokio::test]
    async fn test_crossover_enters_with_protection() {
        let gateway = ScriptedGateway::with_bars(crossover_bars());
        let mut bot = scripted_bot(&gateway);

        let status = bot.run_cycle().await;

        assert_eq!(status.signal, Some(Signal::EnterLong));
        assert_eq!(status.reason, Some(SignalReason::BullishCrossover));
        assert_eq!(status.action, Action::Entered);
        assert_eq!(status.position_state, PositionPhase::Open);
        assert!(status.warnings.is_empty());

        let position = bot.state().position().unwrap();
        // 1000 / 51118.95 rounded down to 0.001
        assert_eq!(position.quantity, dec!(0.019));
        assert_eq!(position.entry_price, dec!(51118.95));
        assert_eq!(position.stop_price, dec!(51118.95) * dec!(0.98));
        assert_eq!(position.take_profit_price, dec!(51118.95) * dec!(1.04));
        assert!(position.is_protected());

        let calls = gateway.script().calls.clone();
        assert_eq!(calls[0], "market BUY 0.019");
        assert!(calls[1].starts_with("stop "));
        assert!(calls[2].starts_with("tp "));
    }

    #[tokio::test]
    async fn test_open_position_does_not_reenter() {
        let gateway = ScriptedGateway::with_bars(crossover_bars());
        let mut bot = scripted_bot(&gateway);
        assert_eq!(bot.run_cycle().await.action, Action::Entered);

        let second = bot.run_cycle().await;
        assert_eq!(second.action, Action::None);
        assert_eq!(second.position_state, PositionPhase::Open);
        let buys = gateway
            .script()
            .calls
            .iter()
            .filter(|c| c.starts_with("market BUY"))
            .count();
        assert_eq!(buys, 1);
    }

    #[tokio::test]
    async fn test_rejected_entry_stays_flat() {
        let gateway = ScriptedGateway::with_bars(crossover_bars());
        gateway
            .script()
            .entry_failures
            .push_back(TradingError::OrderRejected("Margin is insufficient".into()));
        let mut bot = scripted_bot(&gateway);

        let status = bot.run_cycle().await;

        assert_eq!(status.action, Action::EntryAborted);
        assert_eq!(status.error.unwrap().kind, "order_rejected");
        assert_eq!(*bot.state(), PositionState::Flat);
        // Rejections are not retried.
        assert_eq!(gateway.script().calls.len(), 1);
    }

    #[tokio::test]
    async fn test_insufficient_size_skips_entry() {
        let gateway = ScriptedGateway::with_bars(crossover_bars());
        gateway.script().equity = dec!(10);
        let mut bot = scripted_bot(&gateway);

        let status = bot.run_cycle().await;

        assert_eq!(status.action, Action::EntrySkipped);
        assert_eq!(status.error.unwrap().kind, "insufficient_size");
        assert_eq!(*bot.state(), PositionState::Flat);
        assert!(gateway.script().calls.is_empty());
    }

    #[tokio::test]
    async fn test_failed_protection_warns_every_cycle() {
        let gateway = ScriptedGateway::with_bars(crossover_bars());
        gateway.script().protective_failures = 1;
        let mut bot = scripted_bot(&gateway);

        let first = bot.run_cycle().await;
        assert_eq!(first.action, Action::Entered);
        assert_eq!(first.position_state, PositionPhase::Open);
        assert_eq!(first.error.as_ref().unwrap().kind, "order_rejected");
        assert_eq!(first.warnings, vec!["unprotected_position: missing stop_loss".to_string()]);

        let second = bot.run_cycle().await;
        assert_eq!(second.position_state, PositionPhase::Open);
        assert!(second.warnings[0].starts_with(UNPROTECTED_POSITION));

        // Not re-placed automatically.
        let stops = gateway
            .script()
            .calls
            .iter()
            .filter(|c| c.starts_with("stop"))
            .count();
        assert_eq!(stops, 1);
    }

    #[tokio::test]
    async fn test_stop_rule_exit_cancels_before_closing() {
        let gateway = ScriptedGateway::with_bars(flat_bars(48_000.0));
        gateway.script().fill_price = dec!(48000);
        let mut bot = scripted_bot(&gateway);
        open_at(&mut bot, &gateway, dec!(50000));

        let status = bot.run_cycle().await;

        assert_eq!(status.signal, Some(Signal::ExitLong));
        assert_eq!(status.reason, Some(SignalReason::StopLoss));
        assert_eq!(status.action, Action::Exited);
        assert_eq!(status.position_state, PositionPhase::Flat);
        assert_eq!(status.realized_pnl, Some(dec!(-40)));

        let calls = gateway.script().calls.clone();
        assert_eq!(calls, vec!["cancel sl-1", "cancel tp-1", "market SELL 0.02"]);

        let trade = &bot.trades()[0];
        assert_eq!(trade.exit_price, dec!(48000));
        assert_eq!(trade.exit_reason, "signal:stop_loss");
        assert_eq!(bot.stats().realized_pnl, dec!(-40));
    }

    #[tokio::test]
    async fn test_protective_fill_wins_over_signal() {
        let gateway = ScriptedGateway::with_bars(flat_bars(48_000.0));
        let mut bot = scripted_bot(&gateway);
        open_at(&mut bot, &gateway, dec!(50000));
        {
            // The stop already filled on the exchange and flattened the account.
            let mut s = gateway.script();
            s.order_states.insert("sl-1".into(), OrderState::Filled);
            s.position = Decimal::ZERO;
        }

        let status = bot.run_cycle().await;

        // Local rule also says exit, but the exchange closure is used.
        assert_eq!(status.signal, Some(Signal::ExitLong));
        assert_eq!(status.action, Action::Exited);
        assert_eq!(*bot.state(), PositionState::Flat);

        let calls = gateway.script().calls.clone();
        assert_eq!(calls, vec!["cancel tp-1"]);

        let trade = &bot.trades()[0];
        assert_eq!(trade.exit_price, dec!(49000));
        assert_eq!(trade.pnl, dec!(-20));
        assert_eq!(trade.exit_reason, "stop_loss_filled");
    }

    #[tokio::test]
    async fn test_take_profit_fill_detected_while_holding() {
        let gateway = ScriptedGateway::with_bars(flat_bars(50_500.0));
        let mut bot = scripted_bot(&gateway);
        open_at(&mut bot, &gateway, dec!(50000));
        {
            let mut s = gateway.script();
            s.order_states.insert("tp-1".into(), OrderState::Filled);
            s.position = Decimal::ZERO;
        }

        let status = bot.run_cycle().await;

        assert_eq!(status.signal, Some(Signal::Hold));
        assert_eq!(status.action, Action::Exited);
        assert_eq!(status.realized_pnl, Some(dec!(40)));
        assert_eq!(gateway.script().calls, vec!["cancel sl-1".to_string()]);
    }

    #[tokio::test]
    async fn test_protective_fill_uses_average_price() {
        let gateway = ScriptedGateway::with_bars(flat_bars(48_000.0));
        let mut bot = scripted_bot(&gateway);
        open_at(&mut bot, &gateway, dec!(50000));
        {
            // Gapped through the 49000 trigger.
            let mut s = gateway.script();
            s.order_states.insert("sl-1".into(), OrderState::Filled);
            s.avg_prices.insert("sl-1".into(), dec!(48900));
            s.position = Decimal::ZERO;
        }

        let status = bot.run_cycle().await;

        assert_eq!(status.action, Action::Exited);
        assert_eq!(status.realized_pnl, Some(dec!(-22)));
        let trade = &bot.trades()[0];
        assert_eq!(trade.exit_price, dec!(48900));
        assert_eq!(trade.exit_reason, "stop_loss_filled");
    }

    #[tokio::test]
    async fn test_stop_filling_during_cancel_supplies_exit_price() {
        let gateway = ScriptedGateway::with_bars(flat_bars(48_000.0));
        gateway.script().fill_price = dec!(48000);
        let mut bot = scripted_bot(&gateway);
        open_at(&mut bot, &gateway, dec!(50000));
        gateway.script().fill_on_cancel = Some("sl-1".into());

        let status = bot.run_cycle().await;

        // Poll saw the stop resting, so the local stop rule drove the exit.
        assert_eq!(status.reason, Some(SignalReason::StopLoss));
        assert_eq!(status.action, Action::Exited);
        assert_eq!(*bot.state(), PositionState::Flat);

        // The stop closed the position, so no market sell is sent.
        let calls = gateway.script().calls.clone();
        assert_eq!(calls, vec!["cancel sl-1", "cancel tp-1"]);

        let trade = &bot.trades()[0];
        assert_eq!(trade.exit_price, dec!(49000));
        assert_eq!(trade.pnl, dec!(-20));
        assert_eq!(trade.exit_reason, "signal:stop_loss");
    }

    #[tokio::test]
    async fn test_lost_entry_fill_blocks_entries_until_flat() {
        let gateway = ScriptedGateway::with_bars(crossover_bars());
        {
            let mut s = gateway.script();
            for _ in 0..3 {
                s.entry_failures
                    .push_back(TradingError::ExchangeUnavailable("read timed out".into()));
            }
            s.lost_fills = 1;
        }
        let mut bot = scripted_bot(&gateway);

        let first = bot.run_cycle().await;
        assert_eq!(first.action, Action::EntryAborted);
        assert_eq!(first.error.as_ref().unwrap().kind, "exchange_unavailable");
        assert_eq!(
            first.warnings,
            vec!["untracked_position: exchange holds 0.019".to_string()]
        );

        for _ in 0..2 {
            let status = bot.run_cycle().await;
            assert_eq!(status.signal, Some(Signal::EnterLong));
            assert_eq!(status.action, Action::EntrySkipped);
            assert_eq!(status.position_state, PositionPhase::Flat);
            assert!(status.warnings[0].starts_with(UNTRACKED_POSITION));
        }

        {
            let s = gateway.script();
            let buys = s.calls.iter().filter(|c| c.starts_with("market BUY")).count();
            // Retries of the first attempt only.
            assert_eq!(buys, 3);
            assert_eq!(s.position, dec!(0.019));
        }

        // Operator closes the stray position by hand.
        gateway.script().position = Decimal::ZERO;
        let cleared = bot.run_cycle().await;
        assert_eq!(cleared.action, Action::Entered);
        assert!(cleared.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_existing_exchange_position_blocks_first_entry() {
        let gateway = ScriptedGateway::with_bars(crossover_bars());
        gateway.script().position = dec!(0.05);
        let mut bot = scripted_bot(&gateway);

        let status = bot.run_cycle().await;

        assert_eq!(status.action, Action::EntrySkipped);
        assert!(status.error.is_none());
        assert_eq!(
            status.warnings,
            vec!["untracked_position: exchange holds 0.05".to_string()]
        );
        assert!(gateway.script().calls.is_empty());
    }

    #[tokio::test]
    async fn test_run_reconciles_before_first_cycle() {
        let gateway = ScriptedGateway::with_bars(crossover_bars());
        gateway.script().position = dec!(0.05);
        let (tx, rx) = watch::channel(false);
        let mut bot = Bot::new(
            TradingConfig::default(),
            fast_retry(),
            Box::new(gateway.clone()),
            Vec::new(),
            rx,
        );

        let handle = tokio::spawn(async move {
            let result = bot.run().await;
            (result, bot.history().to_vec())
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_ok!(tx.send(true));

        let (result, history) = handle.await.unwrap();
        assert_ok!(result);
        assert_eq!(history[0].action, Action::EntrySkipped);
        assert!(gateway.script().calls.is_empty());
    }

    #[tokio::test]
    async fn test_failed_close_resumes_next_cycle() {
        let gateway = ScriptedGateway::with_bars(flat_bars(48_000.0));
        gateway.script().fill_price = dec!(48000);
        gateway
            .script()
            .exit_failures
            .push_back(TradingError::OrderRejected("ReduceOnly Order is rejected".into()));
        let mut bot = scripted_bot(&gateway);
        open_at(&mut bot, &gateway, dec!(50000));

        let first = bot.run_cycle().await;
        assert_eq!(first.action, Action::ExitPending);
        assert_eq!(first.position_state, PositionPhase::Exiting);
        assert!(first.error.is_some());
        assert!(first.warnings.is_empty());

        let second = bot.run_cycle().await;
        assert_eq!(second.action, Action::Exited);
        assert_eq!(second.position_state, PositionPhase::Flat);
        // Resumed without fetching new candles.
        assert_eq!(gateway.script().fetch_calls, 1);

        let cancels = gateway
            .script()
            .calls
            .iter()
            .filter(|c| c.starts_with("cancel"))
            .count();
        assert_eq!(cancels, 2);
    }

    #[tokio::test]
    async fn test_history_is_append_only() {
        let gateway = ScriptedGateway::with_bars(flat_bars(50_000.0));
        let mut bot = scripted_bot(&gateway);
        let first = bot.run_cycle().await;
        bot.run_cycle().await;
        bot.run_cycle().await;

        assert_eq!(bot.history().len(), 3);
        assert_eq!(bot.history()[0], first);
        let cycles: Vec<u64> = bot.history().iter().map(|s| s.cycle).collect();
        assert_eq!(cycles, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_short_history_is_reported() {
        let gateway = ScriptedGateway::with_bars(flat_bars(50_000.0)[..21].to_vec());
        let mut bot = scripted_bot(&gateway);
        let status = bot.run_cycle().await;
        assert_eq!(status.error.unwrap().kind, "market_data_unavailable");
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let gateway = ScriptedGateway::with_bars(flat_bars(50_000.0));
        let (tx, rx) = watch::channel(false);
        let mut bot = Bot::new(
            TradingConfig::default(),
            fast_retry(),
            Box::new(gateway.clone()),
            Vec::new(),
            rx,
        );

        let handle = tokio::spawn(async move {
            let result = bot.run().await;
            (result, bot.stats().cycles)
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_ok!(tx.send(true));

        let (result, cycles) = handle.await.unwrap();
        assert_ok!(result);
        assert_eq!(cycles, 1);
    }

    #[test]
    fn test_next_cycle_delay_aligns_to_timeframe() {
        // 100s into a 15-minute bucket
        let t = DateTime::from_timestamp(1_700_000_200, 0).unwrap();
        let delay = next_cycle_delay(t, Timeframe::M15);
        assert_eq!(delay, std::time::Duration::from_secs(800));

        let on_boundary = DateTime::from_timestamp(1_700_001_000, 0).unwrap();
        assert_eq!(
            next_cycle_delay(on_boundary, Timeframe::M15),
            std::time::Duration::from_secs(900)
        );
        assert_eq!(
            next_cycle_delay(on_boundary, Timeframe::H1),
            std::time::Duration::from_secs(1_800)
        );
    }
}
