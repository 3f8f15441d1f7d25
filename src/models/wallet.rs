//! Per-user simulated wallet.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Wallet state as persisted by the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub user_id: String,
    pub initial_balance: Decimal,

    /// Cash not committed as margin
    pub current_balance: Decimal,

    pub total_pnl: Decimal,
    pub total_trades: i64,
    pub win_trades: i64,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    pub fn win_rate(&self) -> Decimal {
        if self.total_trades == 0 {
            return Decimal::ZERO;
        }
        Decimal::from(self.win_trades) / Decimal::from(self.total_trades)
    }
}

/// Account snapshot handed to the decision layer and the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletSummary {
    pub user_id: String,
    pub balance: Decimal,
    pub margin_in_use: Decimal,
    pub unrealized_pnl: Decimal,
    pub equity: Decimal,
    pub total_pnl: Decimal,
    pub total_trades: i64,
    pub win_trades: i64,
    pub win_rate: Decimal,
}

impl std::fmt::Display for WalletSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Wallet: {} ===", self.user_id)?;
        writeln!(f, "Balance:        ${:.2}", self.balance)?;
        writeln!(f, "Margin In Use:  ${:.2}", self.margin_in_use)?;
        writeln!(f, "Unrealized P&L: ${:.2}", self.unrealized_pnl)?;
        writeln!(f, "Equity:         ${:.2}", self.equity)?;
        writeln!(f, "Total P&L:      ${:.2}", self.total_pnl)?;
        writeln!(
            f,
            "Trades:         {} (Wins: {}, Win Rate: {:.1}%)",
            self.total_trades,
            self.win_trades,
            self.win_rate * Decimal::ONE_HUNDRED
        )?;
        Ok(())
    }
}
