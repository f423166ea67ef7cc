//! Telegram notifications for notable cycles and closed trades.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::debug;

use crate::models::ClosedTrade;
use crate::status::{Action, CycleStatus, StatusSink};
use crate::trading::Signal;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Sends HTML-formatted messages to one Telegram chat.
pub struct TelegramNotifier {
    client: Client,
    base_url: String,
    token: String,
    chat_id: String,
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'static str,
    disable_web_page_preview: bool,
}

impl TelegramNotifier {
    pub fn new(token: String, chat_id: String) -> Result<Self> {
        Self::with_base_url(TELEGRAM_API_BASE.to_string(), token, chat_id)
    }

    /// Create with custom base URL (for testing).
    pub fn with_base_url(base_url: String, token: String, chat_id: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url,
            token,
            chat_id,
        })
    }

    pub async fn send(&self, text: &str) -> Result<()> {
        let url = format!("{}/bot{}/sendMessage", self.base_url, self.token);
        let body = SendMessage {
            chat_id: &self.chat_id,
            text,
            parse_mode: "HTML",
            disable_web_page_preview: true,
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("Failed to reach Telegram")?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            bail!("Telegram sendMessage failed ({}): {}", status, detail);
        }
        debug!(chat_id = %self.chat_id, "Telegram message sent");
        Ok(())
    }
}

#[async_trait]
impl StatusSink for TelegramNotifier {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn publish(&self, status: &CycleStatus) -> Result<()> {
        if !status.is_notable() {
            return Ok(());
        }
        self.send(&format_status(status)).await
    }

    async fn record_trade(&self, trade: &ClosedTrade) -> Result<()> {
        self.send(&format_trade(trade)).await
    }
}

/// Minimal HTML escaping for Telegram's parser.
fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn format_status(status: &CycleStatus) -> String {
    let (emoji, title) = match (status.action, status.signal) {
        (_, _) if status.error.is_some() => ("⚠️", "ERROR"),
        (Action::Entered, _) => ("✅", "ENTERED LONG"),
        (Action::Exited, _) => ("🏁", "POSITION CLOSED"),
        (Action::ExitPending, _) => ("⏳", "EXIT PENDING"),
        (Action::EntryAborted, _) | (Action::EntrySkipped, _) => ("❌", "ENTRY NOT PLACED"),
        (_, Some(Signal::EnterLong)) => ("🟢", "BUY SIGNAL"),
        (_, Some(Signal::ExitLong)) => ("🔴", "SELL SIGNAL"),
        _ => ("📊", "STATUS UPDATE"),
    };

    let mut lines = vec![
        format!("{} <b>{}</b>", emoji, title),
        String::new(),
        format!("📈 Symbol: {}", escape(&status.symbol)),
    ];
    if let Some(price) = status.price {
        lines.push(format!("💵 Price: ${:.2}", price));
    }
    if let (Some(signal), Some(reason)) = (status.signal, status.reason) {
        lines.push(format!("📡 Signal: {} ({})", signal.as_str(), reason));
    }
    lines.push(format!("📍 Position: {}", status.position_state));
    if let Some(pnl) = status.realized_pnl {
        lines.push(format!("💰 Realized P&amp;L: ${:.2}", pnl));
    }
    if let Some(err) = &status.error {
        lines.push(format!("❗ {}: {}", err.kind, escape(&err.message)));
    }
    for warning in &status.warnings {
        lines.push(format!("⚠️ {}", escape(warning)));
    }
    lines.push(format!("⏰ {}", status.timestamp.format("%Y-%m-%d %H:%M:%S UTC")));
    lines.join("\n")
}

fn format_trade(trade: &ClosedTrade) -> String {
    let (emoji, outcome) = if trade.pnl >= Decimal::ZERO {
        ("💰", "PROFIT")
    } else {
        ("📉", "LOSS")
    };
    [
        format!("{} <b>POSITION CLOSED - {}</b>", emoji, outcome),
        String::new(),
        format!("Entry: ${:.2}", trade.entry_price),
        format!("Exit: ${:.2}", trade.exit_price),
        format!("Quantity: {}", trade.quantity),
        format!(
            "P&amp;L: ${:.2} ({:.2}%)",
            trade.pnl,
            trade.return_pct * Decimal::ONE_HUNDRED
        ),
        format!("Reason: {}", escape(&trade.exit_reason)),
    ]
    .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    use crate::error::TradingError;
    use crate::status::StatusError;
    use crate::trading::{PositionPhase, SignalReason};

    #[test]
    fn test_entry_message() {
        let mut status = CycleStatus::new(7, "BTC/USDT", PositionPhase::Open);
        status.price = Some(51_118.95);
        status.signal = Some(Signal::EnterLong);
        status.reason = Some(SignalReason::BullishCrossover);
        status.action = Action::Entered;

        let text = format_status(&status);
        assert!(text.starts_with("✅ <b>ENTERED LONG</b>"));
        assert!(text.contains("Price: $51118.95"));
        assert!(text.contains("Signal: ENTER_LONG (bullish_crossover)"));
        assert!(text.contains("Position: OPEN"));
    }

    #[test]
    fn test_error_message_is_escaped() {
        let mut status = CycleStatus::new(8, "BTC/USDT", PositionPhase::Flat);
        status.error = Some(StatusError::from(&TradingError::OrderRejected(
            "<html> gateway".into(),
        )));
        let text = format_status(&status);
        assert!(text.starts_with("⚠️ <b>ERROR</b>"));
        assert!(text.contains("&lt;html&gt; gateway"));
    }

    #[test]
    fn test_trade_message() {
        let trade = ClosedTrade {
            entry_price: dec!(50000),
            exit_price: dec!(49000),
            quantity: dec!(0.02),
            pnl: dec!(-20),
            return_pct: dec!(-0.02),
            exit_reason: "stop_loss_filled".into(),
            opened_at: Utc::now(),
            closed_at: Utc::now(),
        };
        let text = format_trade(&trade);
        assert!(text.starts_with("📉 <b>POSITION CLOSED - LOSS</b>"));
        assert!(text.contains("P&amp;L: $-20.00 (-2.00%)"));
        assert!(text.contains("Reason: stop_loss_filled"));
    }

    #[tokio::test]
    async fn test_quiet_hold_is_not_sent() {
        // Unroutable base URL: any attempt to send would fail.
        let notifier =
            TelegramNotifier::with_base_url("http://127.0.0.1:9".into(), "t".into(), "c".into())
                .unwrap();
        let mut status = CycleStatus::new(9, "BTC/USDT", PositionPhase::Flat);
        status.signal = Some(Signal::Hold);
        status.reason = Some(SignalReason::NoCrossover);
        assert!(notifier.publish(&status).await.is_ok());
    }
}
