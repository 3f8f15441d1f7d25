//! Append-only audit record of ledger mutations.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Ledger-mutating action recorded by an order row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderAction {
    OpenLong,
    OpenShort,
    Close,
    PartialClose,
    AdjustSlTp,
}

impl OrderAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderAction::OpenLong => "OPEN_LONG",
            OrderAction::OpenShort => "OPEN_SHORT",
            OrderAction::Close => "CLOSE",
            OrderAction::PartialClose => "PARTIAL_CLOSE",
            OrderAction::AdjustSlTp => "ADJUST_SL_TP",
        }
    }
}

impl fmt::Display for OrderAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPEN_LONG" => Ok(OrderAction::OpenLong),
            "OPEN_SHORT" => Ok(OrderAction::OpenShort),
            "CLOSE" => Ok(OrderAction::Close),
            "PARTIAL_CLOSE" => Ok(OrderAction::PartialClose),
            "ADJUST_SL_TP" => Ok(OrderAction::AdjustSlTp),
            other => Err(format!("unknown order action: {}", other)),
        }
    }
}

/// Immutable audit row. Never updated after insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: i64,
    pub user_id: String,
    pub position_id: i64,
    pub symbol: String,
    pub action: OrderAction,
    pub price: Decimal,
    pub quantity: Decimal,
    pub fee: Decimal,
    pub realized_pnl: Decimal,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}
