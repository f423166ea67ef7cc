//! SQLite journal of the trading loop.
//!
//! Stores what an operator needs after the fact:
//! - One row per cycle status record
//! - One row per closed trade, with realized P&L
//!
//! The journal is write-mostly. The bot never reads it back to rebuild state.

use anyhow::{Context, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::models::ClosedTrade;
use crate::status::{CycleStatus, StatusSink};

/// Journal connection pool.
pub struct Journal {
    pool: SqlitePool,
}

/// Stored cycle status row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredStatus {
    pub cycle: i64,
    pub timestamp: String,
    pub symbol: String,
    pub price: Option<f64>,
    pub signal: Option<String>,
    pub reason: Option<String>,
    pub position_state: String,
    pub action: String,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub warnings: String,
    pub realized_pnl: Option<String>,
}

/// Stored closed trade row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredTrade {
    pub id: i64,
    pub symbol: String,
    pub entry_price: String,
    pub exit_price: String,
    pub quantity: String,
    pub pnl: String,
    pub return_pct: String,
    pub exit_reason: String,
    pub opened_at: String,
    pub closed_at: String,
}

/// Aggregate over all closed trades.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeSummary {
    pub trades: usize,
    pub winners: usize,
    pub total_pnl: Decimal,
}

impl TradeSummary {
    pub fn win_rate(&self) -> f64 {
        if self.trades == 0 {
            return 0.0;
        }
        self.winners as f64 / self.trades as f64
    }
}

impl Journal {
    /// Open (and create if needed) the journal at `database_url`.
    pub async fn connect(database_url: &str, symbol: &str) -> Result<JournalSink> {
        let journal = Self::open(database_url).await?;
        Ok(JournalSink {
            journal,
            symbol: symbol.to_string(),
        })
    }

    pub async fn open(database_url: &str) -> Result<Self> {
        // Every connection to an in-memory database is a separate database.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .with_context(|| format!("Failed to open journal at {}", database_url))?;

        let journal = Self { pool };
        journal.run_migrations().await?;

        Ok(journal)
    }

    async fn run_migrations(&self) -> Result<()> {
        // Per-cycle status records
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cycle_status (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cycle INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                symbol TEXT NOT NULL,
                price REAL,
                signal TEXT,
                reason TEXT,
                position_state TEXT NOT NULL,
                action TEXT NOT NULL,
                error_kind TEXT,
                error_message TEXT,
                warnings TEXT NOT NULL DEFAULT '[]',
                realized_pnl TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Closed round trips
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS closed_trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                exit_price TEXT NOT NULL,
                quantity TEXT NOT NULL,
                pnl TEXT NOT NULL,
                return_pct TEXT NOT NULL,
                exit_reason TEXT NOT NULL,
                opened_at TEXT NOT NULL,
                closed_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_cycle_status_time ON cycle_status(timestamp)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ==================== Status Records ====================

    /// Append one cycle status record.
    pub async fn save_status(&self, status: &CycleStatus) -> Result<()> {
        let warnings = serde_json::to_string(&status.warnings)?;

        sqlx::query(
            r#"
            INSERT INTO cycle_status
                (cycle, timestamp, symbol, price, signal, reason, position_state,
                 action, error_kind, error_message, warnings, realized_pnl)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(status.cycle as i64)
        .bind(status.timestamp.to_rfc3339())
        .bind(&status.symbol)
        .bind(status.price)
        .bind(status.signal.map(|s| s.as_str()))
        .bind(status.reason.map(|r| r.as_str()))
        .bind(status.position_state.as_str())
        .bind(status.action.as_str())
        .bind(status.error.as_ref().map(|e| e.kind.clone()))
        .bind(status.error.as_ref().map(|e| e.message.clone()))
        .bind(warnings)
        .bind(status.realized_pnl.map(|p| p.to_string()))
        .execute(&self.pool)
        .await
        .context("Failed to save status record")?;

        Ok(())
    }

    /// Most recent status records, newest first.
    pub async fn recent_status(&self, limit: i64) -> Result<Vec<StoredStatus>> {
        sqlx::query_as::<_, StoredStatus>(
            "SELECT * FROM cycle_status ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch status records")
    }

    // ==================== Closed Trades ====================

    /// Record a closed trade.
    pub async fn save_trade(&self, symbol: &str, trade: &ClosedTrade) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO closed_trades
                (symbol, entry_price, exit_price, quantity, pnl, return_pct,
                 exit_reason, opened_at, closed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(symbol)
        .bind(trade.entry_price.to_string())
        .bind(trade.exit_price.to_string())
        .bind(trade.quantity.to_string())
        .bind(trade.pnl.to_string())
        .bind(trade.return_pct.to_string())
        .bind(&trade.exit_reason)
        .bind(trade.opened_at.to_rfc3339())
        .bind(trade.closed_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("Failed to save closed trade")?;

        Ok(())
    }

    /// Most recent closed trades, newest first.
    pub async fn recent_trades(&self, limit: i64) -> Result<Vec<StoredTrade>> {
        sqlx::query_as::<_, StoredTrade>("SELECT * FROM closed_trades ORDER BY id DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch closed trades")
    }

    /// Totals over every closed trade.
    pub async fn trade_summary(&self) -> Result<TradeSummary> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT pnl FROM closed_trades")
            .fetch_all(&self.pool)
            .await?;

        let mut summary = TradeSummary {
            trades: 0,
            winners: 0,
            total_pnl: Decimal::ZERO,
        };
        for (pnl,) in rows {
            // Decimals are stored as text to keep them exact.
            let pnl: Decimal = pnl
                .parse()
                .with_context(|| format!("Corrupt pnl value '{}' in journal", pnl))?;
            summary.trades += 1;
            if pnl > Decimal::ZERO {
                summary.winners += 1;
            }
            summary.total_pnl += pnl;
        }
        Ok(summary)
    }
}

/// Journal bound to the traded symbol, usable as a status sink.
pub struct JournalSink {
    journal: Journal,
    symbol: String,
}

impl JournalSink {
    pub fn journal(&self) -> &Journal {
        &self.journal
    }
}

#[async_trait]
impl StatusSink for JournalSink {
    fn name(&self) -> &str {
        "journal"
    }

    async fn publish(&self, status: &CycleStatus) -> Result<()> {
        self.journal.save_status(status).await
    }

    async fn record_trade(&self, trade: &ClosedTrade) -> Result<()> {
        self.journal.save_trade(&self.symbol, trade).await
    }
}
