//! Database persistence for the position ledger.
//!
//! Stores everything the engine needs to resume after restart:
//! - Wallets (one per user)
//! - Positions and their lifecycle status
//! - Orders (append-only audit trail)
//! - Price alerts
//! - Live exchange accounts and reconciliation totals
//! - Scheduler heartbeat
//!
//! Every mutation is a single conditional statement or a short transaction
//! whose first statement takes the write lock, so the scheduler tick and an
//! on-demand request can race safely.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::models::{
    AlertCondition, AlertStatus, CloseReason, Order, OrderAction, Position, PositionStatus,
    PriceAlert, Wallet,
};

/// Database connection pool with ledger state management.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

/// Convert a stored REAL into a decimal, trimming float noise.
pub fn to_decimal(value: f64) -> Decimal {
    Decimal::try_from(value).unwrap_or(Decimal::ZERO).round_dp(8)
}

/// Convert a decimal into a REAL for storage.
pub fn to_real(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

fn decode_err(msg: String) -> sqlx::Error {
    sqlx::Error::Decode(msg.into())
}

/// Stored wallet record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredWallet {
    pub user_id: String,
    pub initial_balance: f64,
    pub current_balance: f64,
    pub total_pnl: f64,
    pub total_trades: i64,
    pub win_trades: i64,
    pub updated_at: DateTime<Utc>,
}

impl From<StoredWallet> for Wallet {
    fn from(w: StoredWallet) -> Self {
        Wallet {
            user_id: w.user_id,
            initial_balance: to_decimal(w.initial_balance),
            current_balance: to_decimal(w.current_balance),
            total_pnl: to_decimal(w.total_pnl),
            total_trades: w.total_trades,
            win_trades: w.win_trades,
            updated_at: w.updated_at,
        }
    }
}

/// Stored position record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredPosition {
    pub id: i64,
    pub user_id: String,
    pub symbol: String,
    pub direction: String,
    pub leverage: i64,
    pub margin: f64,
    pub notional_value: f64,
    pub entry_price: f64,
    pub quantity: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub current_price: f64,
    pub unrealized_pnl: f64,
    pub closed_quantity: f64,
    pub realized_pnl: f64,
    pub status: String,
    pub close_reason: Option<String>,
    pub close_price: Option<f64>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub version: i64,
}

impl TryFrom<StoredPosition> for Position {
    type Error = sqlx::Error;

    fn try_from(p: StoredPosition) -> Result<Self, Self::Error> {
        let close_reason = p
            .close_reason
            .as_deref()
            .map(CloseReason::from_str)
            .transpose()
            .map_err(decode_err)?;

        Ok(Position {
            id: p.id,
            user_id: p.user_id,
            symbol: p.symbol,
            direction: p.direction.parse().map_err(decode_err)?,
            leverage: u32::try_from(p.leverage).map_err(|e| decode_err(e.to_string()))?,
            margin: to_decimal(p.margin),
            notional_value: to_decimal(p.notional_value),
            entry_price: to_decimal(p.entry_price),
            quantity: to_decimal(p.quantity),
            stop_loss: p.stop_loss.map(to_decimal),
            take_profit: p.take_profit.map(to_decimal),
            current_price: to_decimal(p.current_price),
            unrealized_pnl: to_decimal(p.unrealized_pnl),
            closed_quantity: to_decimal(p.closed_quantity),
            realized_pnl: to_decimal(p.realized_pnl),
            status: p.status.parse::<PositionStatus>().map_err(decode_err)?,
            close_reason,
            close_price: p.close_price.map(to_decimal),
            opened_at: p.opened_at,
            closed_at: p.closed_at,
            version: p.version,
        })
    }
}

/// Stored order (audit) record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredOrder {
    pub id: i64,
    pub user_id: String,
    pub position_id: i64,
    pub symbol: String,
    pub action: String,
    pub price: f64,
    pub quantity: f64,
    pub fee: f64,
    pub realized_pnl: f64,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<StoredOrder> for Order {
    type Error = sqlx::Error;

    fn try_from(o: StoredOrder) -> Result<Self, Self::Error> {
        Ok(Order {
            id: o.id,
            user_id: o.user_id,
            position_id: o.position_id,
            symbol: o.symbol,
            action: o.action.parse::<OrderAction>().map_err(decode_err)?,
            price: to_decimal(o.price),
            quantity: to_decimal(o.quantity),
            fee: to_decimal(o.fee),
            realized_pnl: to_decimal(o.realized_pnl),
            reason: o.reason,
            created_at: o.created_at,
        })
    }
}

/// Stored price alert record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredAlert {
    pub id: i64,
    pub user_id: String,
    pub symbol: String,
    pub trigger_price: f64,
    pub trigger_condition: String,
    pub strategy_context: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub triggered_at: Option<DateTime<Utc>>,
    pub triggered_price: Option<f64>,
}

impl TryFrom<StoredAlert> for PriceAlert {
    type Error = sqlx::Error;

    fn try_from(a: StoredAlert) -> Result<Self, Self::Error> {
        Ok(PriceAlert {
            id: a.id,
            user_id: a.user_id,
            symbol: a.symbol,
            trigger_price: to_decimal(a.trigger_price),
            trigger_condition: a.trigger_condition.parse::<AlertCondition>().map_err(decode_err)?,
            strategy_context: a.strategy_context,
            status: a.status.parse::<AlertStatus>().map_err(decode_err)?,
            created_at: a.created_at,
            triggered_at: a.triggered_at,
            triggered_price: a.triggered_price.map(to_decimal),
        })
    }
}

/// Per-user live exchange credentials.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ExchangeAccount {
    pub user_id: String,
    pub api_key: String,
    pub api_secret: String,
    pub trading_enabled: bool,
    pub live_mode: bool,
    pub updated_at: DateTime<Utc>,
}

/// Running realized totals pulled from a live account.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LiveTotals {
    pub user_id: String,
    pub total_pnl: f64,
    pub total_trades: i64,
    pub win_trades: i64,
    pub last_synced_ms: i64,
    pub updated_at: DateTime<Utc>,
}

/// Scheduler heartbeat mirrored for out-of-process inspection.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SchedulerHeartbeat {
    pub id: i64,
    pub is_running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub last_risk_tick_at: Option<DateTime<Utc>>,
    pub last_alert_tick_at: Option<DateTime<Utc>>,
    pub last_strategy_tick_at: Option<DateTime<Utc>>,
    pub last_reconcile_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// New position about to be inserted by the ledger.
#[derive(Debug, Clone)]
pub struct NewPosition<'a> {
    pub user_id: &'a str,
    pub symbol: &'a str,
    pub direction: &'a str,
    pub leverage: u32,
    pub margin: Decimal,
    pub notional_value: Decimal,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub action: OrderAction,
    pub fee: Decimal,
    pub reason: &'a str,
}

/// Close settlement computed by the ledger from a version-stamped read.
#[derive(Debug, Clone)]
pub struct Settlement<'a> {
    pub position_id: i64,
    pub expected_version: i64,
    pub user_id: &'a str,
    pub symbol: &'a str,
    pub close_price: Decimal,
    pub close_quantity: Decimal,
    /// Net realized P&L of this close (after fee)
    pub realized_pnl: Decimal,
    pub fee: Decimal,
    /// Released margin + realized P&L
    pub wallet_credit: Decimal,
    pub unrealized_after: Decimal,
    /// Terminal status when this close exits the whole position
    pub final_status: Option<PositionStatus>,
    pub is_win: bool,
    pub reason: CloseReason,
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .context("Invalid database URL")?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Private in-memory database. Single connection so every caller sees the same data.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("Failed to open in-memory database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS wallets (
                user_id TEXT PRIMARY KEY,
                initial_balance REAL NOT NULL,
                current_balance REAL NOT NULL,
                total_pnl REAL NOT NULL DEFAULT 0,
                total_trades INTEGER NOT NULL DEFAULT 0,
                win_trades INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                direction TEXT NOT NULL,
                leverage INTEGER NOT NULL CHECK (leverage >= 1),
                margin REAL NOT NULL,
                notional_value REAL NOT NULL,
                entry_price REAL NOT NULL,
                quantity REAL NOT NULL,
                stop_loss REAL,
                take_profit REAL,
                current_price REAL NOT NULL DEFAULT 0,
                unrealized_pnl REAL NOT NULL DEFAULT 0,
                closed_quantity REAL NOT NULL DEFAULT 0,
                realized_pnl REAL NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'OPEN',
                close_reason TEXT,
                close_price REAL,
                opened_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                closed_at TEXT,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                version INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY (user_id) REFERENCES wallets(user_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                position_id INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                action TEXT NOT NULL,
                price REAL NOT NULL,
                quantity REAL NOT NULL,
                fee REAL NOT NULL DEFAULT 0,
                realized_pnl REAL NOT NULL DEFAULT 0,
                reason TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                FOREIGN KEY (position_id) REFERENCES positions(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS price_alerts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                trigger_price REAL NOT NULL,
                trigger_condition TEXT NOT NULL,
                strategy_context TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                triggered_at TEXT,
                triggered_price REAL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS exchange_accounts (
                user_id TEXT PRIMARY KEY,
                api_key TEXT NOT NULL,
                api_secret TEXT NOT NULL,
                trading_enabled INTEGER NOT NULL DEFAULT 0,
                live_mode INTEGER NOT NULL DEFAULT 1,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS live_totals (
                user_id TEXT PRIMARY KEY,
                total_pnl REAL NOT NULL DEFAULT 0,
                total_trades INTEGER NOT NULL DEFAULT 0,
                win_trades INTEGER NOT NULL DEFAULT 0,
                last_synced_ms INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scheduler_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                is_running INTEGER NOT NULL DEFAULT 0,
                started_at TEXT,
                last_risk_tick_at TEXT,
                last_alert_tick_at TEXT,
                last_strategy_tick_at TEXT,
                last_reconcile_at TEXT,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Indexes
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_positions_status ON positions(status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_positions_user ON positions(user_id, status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_orders_user ON orders(user_id, created_at)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_alerts_status ON price_alerts(status)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ==================== Wallets ====================

    /// Create the wallet if it does not exist yet. Never resets an existing one.
    pub async fn ensure_wallet(&self, user_id: &str, initial_balance: Decimal) -> sqlx::Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO wallets (user_id, initial_balance, current_balance, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(user_id)
        .bind(to_real(initial_balance))
        .bind(to_real(initial_balance))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_wallet(&self, user_id: &str) -> sqlx::Result<Option<Wallet>> {
        let row = sqlx::query_as::<_, StoredWallet>(
            r#"
            SELECT user_id, initial_balance, current_balance, total_pnl, total_trades, win_trades, updated_at
            FROM wallets WHERE user_id = ?
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Wallet::from))
    }

    // ==================== Positions ====================

    /// Debit margin, insert the position and its audit order as one unit.
    ///
    /// Returns `None` when the wallet cannot cover `margin + fee`.
    pub async fn insert_open_position(&self, new: &NewPosition<'_>) -> sqlx::Result<Option<i64>> {
        let now = Utc::now();
        let debit = new.margin + new.fee;
        let mut tx = self.pool.begin().await?;

        let debited = sqlx::query(
            r#"
            UPDATE wallets SET
                current_balance = current_balance - ?,
                total_pnl = total_pnl - ?,
                updated_at = ?
            WHERE user_id = ? AND current_balance >= ?
            "#,
        )
        .bind(to_real(debit))
        .bind(to_real(new.fee))
        .bind(now)
        .bind(new.user_id)
        .bind(to_real(debit))
        .execute(&mut *tx)
        .await?;

        if debited.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let (position_id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO positions (
                user_id, symbol, direction, leverage, margin, notional_value, entry_price,
                quantity, stop_loss, take_profit, current_price, status, opened_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'OPEN', ?, ?)
            RETURNING id
            "#,
        )
        .bind(new.user_id)
        .bind(new.symbol)
        .bind(new.direction)
        .bind(i64::from(new.leverage))
        .bind(to_real(new.margin))
        .bind(to_real(new.notional_value))
        .bind(to_real(new.entry_price))
        .bind(to_real(new.quantity))
        .bind(new.stop_loss.map(to_real))
        .bind(new.take_profit.map(to_real))
        .bind(to_real(new.entry_price))
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO orders (user_id, position_id, symbol, action, price, quantity, fee, realized_pnl, reason, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(new.user_id)
        .bind(position_id)
        .bind(new.symbol)
        .bind(new.action.as_str())
        .bind(to_real(new.entry_price))
        .bind(to_real(new.quantity))
        .bind(to_real(new.fee))
        .bind(-to_real(new.fee))
        .bind(new.reason)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(position_id))
    }

    /// Apply a close settlement if the position is still OPEN at `expected_version`.
    ///
    /// Returns `false` (and changes nothing) when another writer got there first.
    pub async fn settle_close(&self, s: &Settlement<'_>) -> sqlx::Result<bool> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let updated = match s.final_status {
            Some(status) => {
                sqlx::query(
                    r#"
                    UPDATE positions SET
                        status = ?,
                        close_reason = ?,
                        close_price = ?,
                        current_price = ?,
                        closed_at = ?,
                        closed_quantity = quantity,
                        realized_pnl = realized_pnl + ?,
                        unrealized_pnl = 0,
                        version = version + 1,
                        updated_at = ?
                    WHERE id = ? AND status = 'OPEN' AND version = ?
                    "#,
                )
                .bind(status.as_str())
                .bind(s.reason.as_str())
                .bind(to_real(s.close_price))
                .bind(to_real(s.close_price))
                .bind(now)
                .bind(to_real(s.realized_pnl))
                .bind(now)
                .bind(s.position_id)
                .bind(s.expected_version)
                .execute(&mut *tx)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    UPDATE positions SET
                        closed_quantity = closed_quantity + ?,
                        realized_pnl = realized_pnl + ?,
                        current_price = ?,
                        unrealized_pnl = ?,
                        version = version + 1,
                        updated_at = ?
                    WHERE id = ? AND status = 'OPEN' AND version = ?
                    "#,
                )
                .bind(to_real(s.close_quantity))
                .bind(to_real(s.realized_pnl))
                .bind(to_real(s.close_price))
                .bind(to_real(s.unrealized_after))
                .bind(now)
                .bind(s.position_id)
                .bind(s.expected_version)
                .execute(&mut *tx)
                .await?
            }
        };

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        let (trades, wins) = match s.final_status {
            Some(_) => (1i64, i64::from(s.is_win)),
            None => (0, 0),
        };

        sqlx::query(
            r#"
            UPDATE wallets SET
                current_balance = current_balance + ?,
                total_pnl = total_pnl + ?,
                total_trades = total_trades + ?,
                win_trades = win_trades + ?,
                updated_at = ?
            WHERE user_id = ?
            "#,
        )
        .bind(to_real(s.wallet_credit))
        .bind(to_real(s.realized_pnl))
        .bind(trades)
        .bind(wins)
        .bind(now)
        .bind(s.user_id)
        .execute(&mut *tx)
        .await?;

        let action = if s.final_status.is_some() {
            OrderAction::Close
        } else {
            OrderAction::PartialClose
        };

        sqlx::query(
            r#"
            INSERT INTO orders (user_id, position_id, symbol, action, price, quantity, fee, realized_pnl, reason, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(s.user_id)
        .bind(s.position_id)
        .bind(s.symbol)
        .bind(action.as_str())
        .bind(to_real(s.close_price))
        .bind(to_real(s.close_quantity))
        .bind(to_real(s.fee))
        .bind(to_real(s.realized_pnl))
        .bind(s.reason.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Update stop-loss / take-profit on an OPEN position. `None` keeps the current value.
    ///
    /// Returns `false` when the position is missing or no longer open.
    pub async fn update_stop_loss_take_profit(
        &self,
        position_id: i64,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> sqlx::Result<bool> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE positions SET
                stop_loss = COALESCE(?, stop_loss),
                take_profit = COALESCE(?, take_profit),
                version = version + 1,
                updated_at = ?
            WHERE id = ? AND status = 'OPEN'
            "#,
        )
        .bind(stop_loss.map(to_real))
        .bind(take_profit.map(to_real))
        .bind(now)
        .bind(position_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO orders (user_id, position_id, symbol, action, price, quantity, fee, realized_pnl, reason, created_at)
            SELECT user_id, id, symbol, ?, current_price, quantity - closed_quantity, 0, 0, ?, ?
            FROM positions WHERE id = ?
            "#,
        )
        .bind(OrderAction::AdjustSlTp.as_str())
        .bind(format!(
            "sl={} tp={}",
            stop_loss.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string()),
            take_profit.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
        ))
        .bind(now)
        .bind(position_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Write mark price and unrealized P&L of an OPEN position. Never touches status.
    pub async fn update_position_price(&self, position_id: i64, current_price: Decimal) -> sqlx::Result<bool> {
        let price = to_real(current_price);
        let result = sqlx::query(
            r#"
            UPDATE positions SET
                current_price = ?,
                unrealized_pnl = (quantity - closed_quantity) * (? - entry_price)
                                 * CASE direction WHEN 'SHORT' THEN -1 ELSE 1 END,
                updated_at = ?
            WHERE id = ? AND status = 'OPEN'
            "#,
        )
        .bind(price)
        .bind(price)
        .bind(Utc::now())
        .bind(position_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get_position(&self, position_id: i64) -> sqlx::Result<Option<Position>> {
        sqlx::query_as::<_, StoredPosition>(&format!("{} WHERE id = ?", POSITION_SELECT))
            .bind(position_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Position::try_from)
            .transpose()
    }

    /// All OPEN positions across users.
    pub async fn get_open_positions(&self) -> sqlx::Result<Vec<Position>> {
        let rows = sqlx::query_as::<_, StoredPosition>(&format!(
            "{} WHERE status = 'OPEN' ORDER BY id",
            POSITION_SELECT
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Position::try_from).collect()
    }

    /// Positions of one user, optionally filtered by status.
    pub async fn get_user_positions(
        &self,
        user_id: &str,
        status: Option<PositionStatus>,
    ) -> sqlx::Result<Vec<Position>> {
        let rows = match status {
            Some(status) => {
                sqlx::query_as::<_, StoredPosition>(&format!(
                    "{} WHERE user_id = ? AND status = ? ORDER BY id DESC",
                    POSITION_SELECT
                ))
                .bind(user_id)
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, StoredPosition>(&format!(
                    "{} WHERE user_id = ? ORDER BY id DESC",
                    POSITION_SELECT
                ))
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(Position::try_from).collect()
    }

    // ==================== Orders ====================

    pub async fn get_orders(&self, user_id: &str, limit: i64) -> sqlx::Result<Vec<Order>> {
        let rows = sqlx::query_as::<_, StoredOrder>(
            r#"
            SELECT id, user_id, position_id, symbol, action, price, quantity, fee, realized_pnl, reason, created_at
            FROM orders WHERE user_id = ? ORDER BY id DESC LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Order::try_from).collect()
    }

    pub async fn get_position_orders(&self, position_id: i64) -> sqlx::Result<Vec<Order>> {
        let rows = sqlx::query_as::<_, StoredOrder>(
            r#"
            SELECT id, user_id, position_id, symbol, action, price, quantity, fee, realized_pnl, reason, created_at
            FROM orders WHERE position_id = ? ORDER BY id
            "#,
        )
        .bind(position_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Order::try_from).collect()
    }

    // ==================== Price Alerts ====================

    pub async fn insert_alert(
        &self,
        user_id: &str,
        symbol: &str,
        trigger_price: Decimal,
        condition: AlertCondition,
        strategy_context: Option<&str>,
    ) -> sqlx::Result<i64> {
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO price_alerts (user_id, symbol, trigger_price, trigger_condition, strategy_context, status, created_at)
            VALUES (?, ?, ?, ?, ?, 'pending', ?)
            RETURNING id
            "#,
        )
        .bind(user_id)
        .bind(symbol)
        .bind(to_real(trigger_price))
        .bind(condition.as_str())
        .bind(strategy_context)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    pub async fn get_alert(&self, alert_id: i64) -> sqlx::Result<Option<PriceAlert>> {
        sqlx::query_as::<_, StoredAlert>(&format!("{} WHERE id = ?", ALERT_SELECT))
            .bind(alert_id)
            .fetch_optional(&self.pool)
            .await?
            .map(PriceAlert::try_from)
            .transpose()
    }

    pub async fn get_pending_alerts(&self) -> sqlx::Result<Vec<PriceAlert>> {
        let rows = sqlx::query_as::<_, StoredAlert>(&format!(
            "{} WHERE status = 'pending' ORDER BY id",
            ALERT_SELECT
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(PriceAlert::try_from).collect()
    }

    pub async fn get_user_alerts(
        &self,
        user_id: &str,
        status: Option<AlertStatus>,
    ) -> sqlx::Result<Vec<PriceAlert>> {
        let rows = match status {
            Some(status) => {
                sqlx::query_as::<_, StoredAlert>(&format!(
                    "{} WHERE user_id = ? AND status = ? ORDER BY id DESC",
                    ALERT_SELECT
                ))
                .bind(user_id)
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, StoredAlert>(&format!(
                    "{} WHERE user_id = ? ORDER BY id DESC",
                    ALERT_SELECT
                ))
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(PriceAlert::try_from).collect()
    }

    /// Flip pending → triggered. Only one caller can ever win this transition.
    pub async fn mark_alert_triggered(&self, alert_id: i64, price: Decimal) -> sqlx::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE price_alerts SET status = 'triggered', triggered_at = ?, triggered_price = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(Utc::now())
        .bind(to_real(price))
        .bind(alert_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Flip pending → cancelled.
    pub async fn mark_alert_cancelled(&self, alert_id: i64) -> sqlx::Result<bool> {
        let result = sqlx::query(
            "UPDATE price_alerts SET status = 'cancelled' WHERE id = ? AND status = 'pending'",
        )
        .bind(alert_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    // ==================== Exchange Accounts ====================

    pub async fn save_exchange_account(
        &self,
        user_id: &str,
        api_key: &str,
        api_secret: &str,
        trading_enabled: bool,
        live_mode: bool,
    ) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO exchange_accounts (user_id, api_key, api_secret, trading_enabled, live_mode, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                api_key = excluded.api_key,
                api_secret = excluded.api_secret,
                trading_enabled = excluded.trading_enabled,
                live_mode = excluded.live_mode,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id)
        .bind(api_key)
        .bind(api_secret)
        .bind(trading_enabled)
        .bind(live_mode)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn set_trading_enabled(&self, user_id: &str, enabled: bool) -> sqlx::Result<bool> {
        let result = sqlx::query(
            "UPDATE exchange_accounts SET trading_enabled = ?, updated_at = ? WHERE user_id = ?",
        )
        .bind(enabled)
        .bind(Utc::now())
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get_exchange_account(&self, user_id: &str) -> sqlx::Result<Option<ExchangeAccount>> {
        sqlx::query_as::<_, ExchangeAccount>(
            r#"
            SELECT user_id, api_key, api_secret, trading_enabled, live_mode, updated_at
            FROM exchange_accounts WHERE user_id = ?
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
    }

    /// Users whose live account is selected and switched on.
    pub async fn get_live_users(&self) -> sqlx::Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT user_id FROM exchange_accounts WHERE live_mode = 1 AND trading_enabled = 1",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(u,)| u).collect())
    }

    // ==================== Live Reconciliation ====================

    pub async fn get_live_totals(&self, user_id: &str) -> sqlx::Result<Option<LiveTotals>> {
        sqlx::query_as::<_, LiveTotals>(
            r#"
            SELECT user_id, total_pnl, total_trades, win_trades, last_synced_ms, updated_at
            FROM live_totals WHERE user_id = ?
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
    }

    /// Fold remote deltas into the running totals and advance the sync cursor.
    pub async fn add_live_totals(
        &self,
        user_id: &str,
        pnl_delta: Decimal,
        trades_delta: i64,
        wins_delta: i64,
        synced_ms: i64,
    ) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO live_totals (user_id, total_pnl, total_trades, win_trades, last_synced_ms, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                total_pnl = live_totals.total_pnl + excluded.total_pnl,
                total_trades = live_totals.total_trades + excluded.total_trades,
                win_trades = live_totals.win_trades + excluded.win_trades,
                last_synced_ms = MAX(live_totals.last_synced_ms, excluded.last_synced_ms),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id)
        .bind(to_real(pnl_delta))
        .bind(trades_delta)
        .bind(wins_delta)
        .bind(synced_ms)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ==================== Scheduler Heartbeat ====================

    pub async fn mark_scheduler_started(&self) -> sqlx::Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO scheduler_state (id, is_running, started_at, updated_at)
            VALUES (1, 1, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                is_running = 1,
                started_at = excluded.started_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn mark_scheduler_stopped(&self) -> sqlx::Result<()> {
        sqlx::query("UPDATE scheduler_state SET is_running = 0, updated_at = ? WHERE id = 1")
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record that a job ran. `column` is one of the fixed `last_*_at` columns.
    pub async fn record_tick(&self, column: TickColumn) -> sqlx::Result<()> {
        let now = Utc::now();
        sqlx::query(&format!(
            "UPDATE scheduler_state SET {} = ?, updated_at = ? WHERE id = 1",
            column.as_str()
        ))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_scheduler_heartbeat(&self) -> sqlx::Result<Option<SchedulerHeartbeat>> {
        sqlx::query_as::<_, SchedulerHeartbeat>("SELECT * FROM scheduler_state WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
    }
}

/// Heartbeat columns the scheduler updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickColumn {
    Risk,
    Alert,
    Strategy,
    Reconcile,
}

impl TickColumn {
    fn as_str(&self) -> &'static str {
        match self {
            TickColumn::Risk => "last_risk_tick_at",
            TickColumn::Alert => "last_alert_tick_at",
            TickColumn::Strategy => "last_strategy_tick_at",
            TickColumn::Reconcile => "last_reconcile_at",
        }
    }
}

const POSITION_SELECT: &str = r#"
    SELECT id, user_id, symbol, direction, leverage, margin, notional_value, entry_price, quantity,
           stop_loss, take_profit, current_price, unrealized_pnl, closed_quantity, realized_pnl,
           status, close_reason, close_price, opened_at, closed_at, version
    FROM positions"#;

const ALERT_SELECT: &str = r#"
    SELECT id, user_id, symbol, trigger_price, trigger_condition, strategy_context, status,
           created_at, triggered_at, triggered_price
    FROM price_alerts"#;
