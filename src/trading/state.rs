//! Position lifecycle: FLAT -> ENTERING -> OPEN -> EXITING -> FLAT.
//!
//! Each state carries exactly the data valid in it, so a position without an
//! entry fill or an exit without a position cannot be represented. Transitions
//! that are not allowed from the current state return
//! [`TradingError::IllegalTransition`] and leave the state untouched.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::TradingError;
use crate::models::{ClosedTrade, Fill, Position, ProtectiveKind};

use super::{RiskPlan, SignalReason};

/// What started an exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitTrigger {
    /// The signal generator asked for EXIT_LONG
    Signal(SignalReason),

    /// A resting protective order was reported filled by the exchange
    ProtectiveFill(ProtectiveKind),
}

impl fmt::Display for ExitTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitTrigger::Signal(reason) => write!(f, "signal:{}", reason),
            ExitTrigger::ProtectiveFill(kind) => write!(f, "{}_filled", kind),
        }
    }
}

/// Label of the current state, for status records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionPhase {
    Flat,
    Entering,
    Open,
    Exiting,
}

impl PositionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionPhase::Flat => "FLAT",
            PositionPhase::Entering => "ENTERING",
            PositionPhase::Open => "OPEN",
            PositionPhase::Exiting => "EXITING",
        }
    }
}

impl fmt::Display for PositionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum PositionState {
    #[default]
    Flat,
    Entering {
        plan: RiskPlan,
    },
    Open(Position),
    Exiting {
        position: Position,
        trigger: ExitTrigger,
    },
}

impl PositionState {
    pub fn phase(&self) -> PositionPhase {
        match self {
            PositionState::Flat => PositionPhase::Flat,
            PositionState::Entering { .. } => PositionPhase::Entering,
            PositionState::Open(_) => PositionPhase::Open,
            PositionState::Exiting { .. } => PositionPhase::Exiting,
        }
    }

    /// The held position while OPEN or EXITING.
    pub fn position(&self) -> Option<&Position> {
        match self {
            PositionState::Open(position) | PositionState::Exiting { position, .. } => {
                Some(position)
            }
            _ => None,
        }
    }

    pub fn position_mut(&mut self) -> Option<&mut Position> {
        match self {
            PositionState::Open(position) | PositionState::Exiting { position, .. } => {
                Some(position)
            }
            _ => None,
        }
    }

    /// FLAT -> ENTERING.
    pub fn begin_entry(&mut self, plan: RiskPlan) -> Result<(), TradingError> {
        match self {
            PositionState::Flat => {
                *self = PositionState::Entering { plan };
                Ok(())
            }
            _ => Err(self.illegal("begin entry")),
        }
    }

    /// ENTERING -> FLAT when the entry order was rejected or never confirmed.
    pub fn abort_entry(&mut self) -> Result<RiskPlan, TradingError> {
        match std::mem::take(self) {
            PositionState::Entering { plan } => Ok(plan),
            other => {
                *self = other;
                Err(self.illegal("abort entry"))
            }
        }
    }

    /// ENTERING -> OPEN on a confirmed fill. Protective ids attach afterwards.
    pub fn confirm_fill(
        &mut self,
        fill: &Fill,
        stop_price: Decimal,
        take_profit_price: Decimal,
        at: DateTime<Utc>,
    ) -> Result<(), TradingError> {
        match self {
            PositionState::Entering { .. } => {
                *self = PositionState::Open(Position::from_fill(
                    fill,
                    stop_price,
                    take_profit_price,
                    at,
                ));
                Ok(())
            }
            _ => Err(self.illegal("confirm fill")),
        }
    }

    /// OPEN -> OPEN with a confirmed protective order id.
    pub fn attach_protection(
        &mut self,
        kind: ProtectiveKind,
        order_id: String,
    ) -> Result<(), TradingError> {
        match self {
            PositionState::Open(position) => {
                match kind {
                    ProtectiveKind::StopLoss => position.stop_order_id = Some(order_id),
                    ProtectiveKind::TakeProfit => position.take_profit_order_id = Some(order_id),
                }
                Ok(())
            }
            _ => Err(self.illegal("attach protection")),
        }
    }

    /// OPEN -> EXITING.
    pub fn begin_exit(&mut self, trigger: ExitTrigger) -> Result<(), TradingError> {
        match std::mem::take(self) {
            PositionState::Open(position) => {
                *self = PositionState::Exiting { position, trigger };
                Ok(())
            }
            other => {
                *self = other;
                Err(self.illegal("begin exit"))
            }
        }
    }

    /// EXITING -> FLAT once the exchange confirms the position is gone.
    pub fn complete_exit(
        &mut self,
        exit_price: Decimal,
        at: DateTime<Utc>,
    ) -> Result<ClosedTrade, TradingError> {
        match std::mem::take(self) {
            PositionState::Exiting { position, trigger } => {
                Ok(position.close(exit_price, trigger.to_string(), at))
            }
            other => {
                *self = other;
                Err(self.illegal("complete exit"))
            }
        }
    }

    fn illegal(&self, transition: &str) -> TradingError {
        TradingError::IllegalTransition(format!("cannot {} while {}", transition, self.phase()))
    }
}
