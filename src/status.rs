//! Per-cycle status records and the sinks that consume them.
//!
//! Records are append-only: the bot builds one per cycle, keeps it in its
//! history, and hands a shared reference to every sink.

use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::TradingError;
use crate::models::ClosedTrade;
use crate::trading::{PositionPhase, Signal, SignalReason};

/// Label for an OPEN position missing one or both protective orders.
pub const UNPROTECTED_POSITION: &str = "unprotected_position";

/// Label for exchange exposure held while the bot is FLAT.
pub const UNTRACKED_POSITION: &str = "untracked_position";

/// What the cycle did to the account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Nothing was sent to the exchange
    None,
    /// Entry wanted but sizing refused it
    EntrySkipped,
    /// Entry order rejected or unconfirmed; back to FLAT
    EntryAborted,
    /// Entry filled; position OPEN
    Entered,
    /// Exit started but not yet confirmed; resumes next cycle
    ExitPending,
    /// Position closed and P&L realized
    Exited,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::None => "none",
            Action::EntrySkipped => "entry_skipped",
            Action::EntryAborted => "entry_aborted",
            Action::Entered => "entered",
            Action::ExitPending => "exit_pending",
            Action::Exited => "exited",
        }
    }
}

/// Error carried in a status record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusError {
    pub kind: String,
    pub message: String,
}

impl From<&TradingError> for StatusError {
    fn from(err: &TradingError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// One cycle's outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleStatus {
    pub cycle: u64,
    pub timestamp: DateTime<Utc>,
    pub symbol: String,

    /// Latest close, if market data was available
    pub price: Option<f64>,

    /// Absent when the cycle ended before a signal was computed
    pub signal: Option<Signal>,
    pub reason: Option<SignalReason>,

    /// State after the cycle
    pub position_state: PositionPhase,
    pub action: Action,
    pub error: Option<StatusError>,
    pub warnings: Vec<String>,

    /// P&L realized by a closure in this cycle
    pub realized_pnl: Option<Decimal>,
}

impl CycleStatus {
    pub fn new(cycle: u64, symbol: &str, position_state: PositionPhase) -> Self {
        Self {
            cycle,
            timestamp: Utc::now(),
            symbol: symbol.to_string(),
            price: None,
            signal: None,
            reason: None,
            position_state,
            action: Action::None,
            error: None,
            warnings: Vec::new(),
            realized_pnl: None,
        }
    }

    /// Worth pushing to a human: anything other than a quiet HOLD.
    pub fn is_notable(&self) -> bool {
        self.error.is_some()
            || !self.warnings.is_empty()
            || self.action != Action::None
            || matches!(self.signal, Some(s) if s != Signal::Hold)
    }
}

impl fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {} {}", self.cycle, self.symbol, self.position_state)?;
        if let Some(price) = self.price {
            write!(f, " @ {:.2}", price)?;
        }
        if let (Some(signal), Some(reason)) = (self.signal, self.reason) {
            write!(f, " signal={} ({})", signal.as_str(), reason)?;
        }
        write!(f, " action={}", self.action.as_str())?;
        if let Some(pnl) = self.realized_pnl {
            write!(f, " pnl={:.2}", pnl)?;
        }
        if let Some(err) = &self.error {
            write!(f, " error={}", err.message)?;
        }
        for warning in &self.warnings {
            write!(f, " warning={}", warning)?;
        }
        Ok(())
    }
}

/// Consumer of status records and closed trades.
#[async_trait]
pub trait StatusSink: Send + Sync {
    fn name(&self) -> &str;

    async fn publish(&self, status: &CycleStatus) -> Result<()>;

    async fn record_trade(&self, _trade: &ClosedTrade) -> Result<()> {
        Ok(())
    }
}

/// Writes every record to the tracing log.
pub struct LogSink;

#[async_trait]
impl StatusSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn publish(&self, status: &CycleStatus) -> Result<()> {
        let summary = status.to_string();
        if let Some(err) = &status.error {
            error!(cycle = status.cycle, kind = %err.kind, "{}", summary);
        } else if !status.warnings.is_empty() {
            warn!(cycle = status.cycle, "{}", summary);
        } else {
            info!(cycle = status.cycle, "{}", summary);
        }
        Ok(())
    }

    async fn record_trade(&self, trade: &ClosedTrade) -> Result<()> {
        info!(
            entry = %trade.entry_price,
            exit = %trade.exit_price,
            quantity = %trade.quantity,
            pnl = %trade.pnl.round_dp(2),
            return_pct = %(trade.return_pct * Decimal::ONE_HUNDRED).round_dp(2),
            reason = %trade.exit_reason,
            "Trade closed"
        );
        Ok(())
    }
}
