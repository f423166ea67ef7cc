//! EMA Crossover Trading Bot
//!
//! Trades one pair on a fixed candle cadence: fast/slow EMA crossover for
//! entries, RSI and trend-strength filters, risk-sized positions with
//! exchange-side stop-loss and take-profit orders.

mod bot;
mod db;
mod error;
mod exchange;
mod indicators;
mod models;
mod notify;
mod status;
mod trading;

use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::watch;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::bot::Bot;
use crate::db::Journal;
use crate::error::TradingError;
use crate::exchange::{
    BinanceFuturesGateway, DryRunGateway, ExchangeGateway, ExchangeMode, RetryPolicy,
};
use crate::notify::TelegramNotifier;
use crate::status::{LogSink, StatusSink};
use crate::trading::{RiskConfig, StrategyConfig, Timeframe, TradingConfig};

/// EMA crossover trading bot CLI.
#[derive(Parser)]
#[command(name = "emacross")]
#[command(about = "Trade one pair on EMA crossovers with RSI confirmation", long_about = None)]
struct Cli {
    /// Journal database URL
    #[arg(short, long, env = "DATABASE_URL", default_value = "sqlite:./emacross.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the trading loop
    Run {
        #[command(flatten)]
        settings: Settings,
    },

    /// Show the effective, validated configuration
    Config {
        #[command(flatten)]
        settings: Settings,
    },

    /// Show recent cycles and closed trades from the journal
    Status {
        /// Number of status records to show
        #[arg(short = 'n', long, default_value = "20")]
        limit: i64,
    },
}

/// Every tunable, from flags or the environment.
#[derive(Args, Debug, Clone)]
struct Settings {
    /// Trading pair
    #[arg(long, env = "SYMBOL", default_value = "BTC/USDT")]
    symbol: String,

    /// Candle interval and loop cadence (1m, 5m, 15m, 1h, 4h, 1d)
    #[arg(long, env = "TIMEFRAME", default_value = "15m")]
    timeframe: Timeframe,

    /// Candles fetched per cycle
    #[arg(long, env = "HISTORY_LIMIT", default_value = "100")]
    history_limit: usize,

    #[arg(long, env = "EMA_FAST", default_value = "9")]
    ema_fast: usize,

    #[arg(long, env = "EMA_SLOW", default_value = "21")]
    ema_slow: usize,

    #[arg(long, env = "RSI_PERIOD", default_value = "14")]
    rsi_period: usize,

    #[arg(long, env = "RSI_OVERSOLD", default_value = "30")]
    rsi_oversold: f64,

    #[arg(long, env = "RSI_OVERBOUGHT", default_value = "70")]
    rsi_overbought: f64,

    /// Minimum (fast - slow) / slow for an entry
    #[arg(long, env = "MIN_TREND_STRENGTH", default_value = "0.001")]
    min_trend_strength: f64,

    /// Fraction of equity lost if the stop is hit
    #[arg(long, env = "RISK_PER_TRADE", default_value = "0.01")]
    risk_per_trade: Decimal,

    /// Cap on position notional as a fraction of equity
    #[arg(long, env = "MAX_POSITION_SIZE", default_value = "0.1")]
    max_position_size: Decimal,

    #[arg(long, env = "STOP_LOSS_PERCENT", default_value = "0.02")]
    stop_loss_percent: Decimal,

    #[arg(long, env = "TAKE_PROFIT_PERCENT", default_value = "0.04")]
    take_profit_percent: Decimal,

    /// Where orders go
    #[arg(long, env = "MODE", value_enum, default_value_t = ExchangeMode::DryRun)]
    mode: ExchangeMode,

    #[arg(long, env = "API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    #[arg(long, env = "API_SECRET", hide_env_values = true)]
    api_secret: Option<String>,

    /// Futures leverage set at connect (1-125)
    #[arg(long, env = "LEVERAGE", default_value = "1")]
    leverage: u32,

    /// Attempts per exchange call, including the first
    #[arg(long, env = "RETRY_ATTEMPTS", default_value = "3")]
    retry_attempts: u32,

    #[arg(long, env = "RETRY_BASE_DELAY_MS", default_value = "1000")]
    retry_base_delay_ms: u64,

    #[arg(long, env = "CALL_TIMEOUT_SECS", default_value = "30")]
    call_timeout_secs: u64,

    /// Seed for synthetic dry-run candles
    #[arg(long, env = "DRY_RUN_SEED", default_value = "42")]
    dry_run_seed: u64,

    /// Starting equity of the simulated account
    #[arg(long, env = "DRY_RUN_EQUITY", default_value = "10000")]
    dry_run_equity: Decimal,

    #[arg(long, env = "TELEGRAM_BOT_TOKEN", hide_env_values = true)]
    telegram_bot_token: Option<String>,

    #[arg(long, env = "TELEGRAM_CHAT_ID")]
    telegram_chat_id: Option<String>,
}

impl Settings {
    fn trading_config(&self) -> TradingConfig {
        TradingConfig {
            symbol: self.symbol.trim().to_uppercase(),
            timeframe: self.timeframe,
            history_limit: self.history_limit,
            strategy: StrategyConfig {
                ema_fast: self.ema_fast,
                ema_slow: self.ema_slow,
                rsi_period: self.rsi_period,
                rsi_oversold: self.rsi_oversold,
                rsi_overbought: self.rsi_overbought,
                min_trend_strength: self.min_trend_strength,
            },
            risk: RiskConfig {
                risk_per_trade: self.risk_per_trade,
                max_position: self.max_position_size,
                stop_loss_pct: self.stop_loss_percent,
                take_profit_pct: self.take_profit_percent,
            },
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            call_timeout: Duration::from_secs(self.call_timeout_secs),
            ..RetryPolicy::default()
        }
    }

    /// Validate everything and return the configs the bot runs with.
    fn validate(&self) -> Result<(TradingConfig, RetryPolicy), TradingError> {
        let config = self.trading_config();
        config.validate()?;

        if self.retry_attempts < 1 {
            return Err(TradingError::InvalidConfiguration(
                "retry attempts must be at least 1".into(),
            ));
        }
        if self.call_timeout_secs == 0 {
            return Err(TradingError::InvalidConfiguration(
                "call timeout must be positive".into(),
            ));
        }
        if !(1..=125).contains(&self.leverage) {
            return Err(TradingError::InvalidConfiguration(format!(
                "leverage must be in 1..=125 (got {})",
                self.leverage
            )));
        }
        if self.mode.needs_credentials() && self.credentials().is_none() {
            return Err(TradingError::InvalidConfiguration(format!(
                "{} mode requires API_KEY and API_SECRET",
                self.mode
            )));
        }
        if self.mode == ExchangeMode::DryRun && self.dry_run_equity <= Decimal::ZERO {
            return Err(TradingError::InvalidConfiguration(format!(
                "dry-run equity must be positive (got {})",
                self.dry_run_equity
            )));
        }
        if self.telegram_bot_token.is_some() != self.telegram_chat_id.is_some() {
            return Err(TradingError::InvalidConfiguration(
                "TELEGRAM_BOT_TOKEN and TELEGRAM_CHAT_ID must be set together".into(),
            ));
        }

        Ok((config, self.retry_policy()))
    }

    fn credentials(&self) -> Option<(&str, &str)> {
        match (self.api_key.as_deref(), self.api_secret.as_deref()) {
            (Some(key), Some(secret)) if !key.is_empty() && !secret.is_empty() => {
                Some((key, secret))
            }
            _ => None,
        }
    }

    /// Human-readable configuration dump.
    fn describe(&self, config: &TradingConfig, retry: &RetryPolicy) -> Vec<String> {
        let pct = |d: Decimal| d * dec!(100);
        vec![
            "=== Trading Configuration ===".to_string(),
            format!("  Symbol:               {}", config.symbol),
            format!("  Timeframe:            {}", config.timeframe),
            format!("  History:              {} candles", config.history_limit),
            format!("  Mode:                 {}", self.mode),
            format!("  Leverage:             {}x", self.leverage),
            "Strategy:".to_string(),
            format!(
                "  EMA Fast / Slow:      {} / {}",
                config.strategy.ema_fast, config.strategy.ema_slow
            ),
            format!("  RSI Period:           {}", config.strategy.rsi_period),
            format!(
                "  RSI Band:             {} - {}",
                config.strategy.rsi_oversold, config.strategy.rsi_overbought
            ),
            format!(
                "  Min Trend Strength:   {}%",
                config.strategy.min_trend_strength * 100.0
            ),
            "Risk:".to_string(),
            format!("  Risk Per Trade:       {}%", pct(config.risk.risk_per_trade)),
            format!("  Max Position Size:    {}%", pct(config.risk.max_position)),
            format!("  Stop Loss:            {}%", pct(config.risk.stop_loss_pct)),
            format!("  Take Profit:          {}%", pct(config.risk.take_profit_pct)),
            "Execution:".to_string(),
            format!(
                "  Retries:              {} attempts, {}ms base delay",
                retry.max_attempts,
                retry.base_delay.as_millis()
            ),
            format!("  Call Timeout:         {}s", retry.call_timeout.as_secs()),
            format!(
                "  Telegram:             {}",
                if self.telegram_bot_token.is_some() { "enabled" } else { "disabled" }
            ),
        ]
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run { settings } => {
            let (config, retry) = settings
                .validate()
                .context("Refusing to start with invalid configuration")?;

            for line in settings.describe(&config, &retry) {
                info!("{}", line);
            }
            if settings.mode == ExchangeMode::Live {
                warn!("LIVE TRADING ON MAINNET: orders use real funds");
            }

            let gateway = build_gateway(&settings, &config).await?;

            let mut sinks: Vec<Box<dyn StatusSink>> = vec![Box::new(LogSink)];
            sinks.push(Box::new(Journal::connect(&cli.database, &config.symbol).await?));
            if let (Some(token), Some(chat_id)) = (
                settings.telegram_bot_token.clone(),
                settings.telegram_chat_id.clone(),
            ) {
                let notifier = TelegramNotifier::new(token, chat_id)?;
                let startup = format!(
                    "🤖 <b>BOT STARTED</b>\n\n{} {} ({})",
                    config.symbol, config.timeframe, settings.mode
                );
                if let Err(e) = notifier.send(&startup).await {
                    warn!(error = %e, "Telegram startup message failed");
                }
                sinks.push(Box::new(notifier));
            }

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        info!("Received Ctrl+C, finishing current cycle");
                        let _ = shutdown_tx.send(true);
                    }
                    Err(e) => {
                        warn!(error = %e, "Cannot listen for Ctrl+C");
                        // Keep the sender alive so the bot is not told to stop.
                        std::future::pending::<()>().await;
                    }
                }
            });

            println!("\nPress Ctrl+C to stop.\n");

            let mut bot = Bot::new(config, retry, gateway, sinks, shutdown_rx);
            if let Err(e) = bot.run().await {
                tracing::error!(error = %e, "Bot error");
            }

            println!("\n{}", bot.stats());
        }

        Commands::Config { settings } => {
            let (config, retry) = settings.validate()?;
            println!();
            for line in settings.describe(&config, &retry) {
                println!("{}", line);
            }
        }

        Commands::Status { limit } => {
            let journal = Journal::open(&cli.database).await?;
            let records = journal.recent_status(limit).await?;
            if records.is_empty() {
                println!("No cycles journaled yet. Run 'emacross run' to start the bot.");
                return Ok(());
            }

            println!(
                "\n{:<6} {:<26} {:>12} {:<11} {:<9} {:<14} {}",
                "CYCLE", "TIME", "PRICE", "SIGNAL", "STATE", "ACTION", "NOTES"
            );
            println!("{}", "-".repeat(100));
            for record in records.iter().rev() {
                let price = record
                    .price
                    .map(|p| format!("{:.2}", p))
                    .unwrap_or_else(|| "-".to_string());
                let mut notes = Vec::new();
                if let Some(kind) = &record.error_kind {
                    let message = record.error_message.as_deref().unwrap_or("");
                    notes.push(format!("error={} ({})", kind, truncate(message, 60)));
                }
                if record.warnings != "[]" {
                    notes.push(format!("warnings={}", record.warnings));
                }
                if let Some(pnl) = &record.realized_pnl {
                    notes.push(format!("pnl={}", pnl));
                }
                println!(
                    "{:<6} {:<26} {:>12} {:<11} {:<9} {:<14} {}",
                    record.cycle,
                    truncate(&record.timestamp, 25),
                    price,
                    record.signal.as_deref().unwrap_or("-"),
                    record.position_state,
                    record.action,
                    notes.join(" ")
                );
            }

            let summary = journal.trade_summary().await?;
            println!("\n=== Closed Trades ===");
            println!("Trades:           {}", summary.trades);
            println!("Winners:          {}", summary.winners);
            println!("Win Rate:         {:.1}%", summary.win_rate() * 100.0);
            println!("Realized P&L:     ${:.2}", summary.total_pnl);

            for trade in journal.recent_trades(5).await? {
                let return_pct = trade
                    .return_pct
                    .parse::<Decimal>()
                    .map(|r| format!("{:.2}%", r * dec!(100)))
                    .unwrap_or_else(|_| trade.return_pct.clone());
                println!(
                    "  #{} {} -> {} {} -> {} x {} ({}) pnl ${} ({})",
                    trade.id,
                    truncate(&trade.opened_at, 19),
                    truncate(&trade.closed_at, 19),
                    trade.entry_price,
                    trade.exit_price,
                    trade.quantity,
                    trade.exit_reason,
                    trade.pnl,
                    return_pct
                );
            }
        }
    }

    Ok(())
}

async fn build_gateway(
    settings: &Settings,
    config: &TradingConfig,
) -> Result<Box<dyn ExchangeGateway>> {
    match settings.mode {
        ExchangeMode::DryRun => Ok(Box::new(DryRunGateway::new(
            settings.dry_run_seed,
            settings.dry_run_equity,
        ))),
        mode => {
            let Some((key, secret)) = settings.credentials() else {
                bail!("{} mode requires API_KEY and API_SECRET", mode);
            };
            let gateway =
                BinanceFuturesGateway::connect(mode, key, secret, &config.symbol, settings.leverage)
                    .await
                    .with_context(|| format!("Failed to connect to Binance ({})", mode))?;
            Ok(Box::new(gateway))
        }
    }
}

/// Truncate string to max length.
fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}
