//! Leveraged futures position.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::OrderAction;

/// Direction of a futures position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "LONG",
            Direction::Short => "SHORT",
        }
    }

    /// +1 for long, -1 for short.
    pub fn sign(&self) -> Decimal {
        match self {
            Direction::Long => Decimal::ONE,
            Direction::Short => Decimal::NEGATIVE_ONE,
        }
    }

    /// Audit action recorded when a position in this direction is opened.
    pub fn open_action(&self) -> OrderAction {
        match self {
            Direction::Long => OrderAction::OpenLong,
            Direction::Short => OrderAction::OpenShort,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "LONG" | "BUY" => Ok(Direction::Long),
            "SHORT" | "SELL" => Ok(Direction::Short),
            other => Err(format!("unknown direction: {}", other)),
        }
    }
}

/// Lifecycle status. Anything other than `Open` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    Open,
    Closed,
    Liquidated,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "OPEN",
            PositionStatus::Closed => "CLOSED",
            PositionStatus::Liquidated => "LIQUIDATED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PositionStatus::Open)
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PositionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "OPEN" => Ok(PositionStatus::Open),
            "CLOSED" => Ok(PositionStatus::Closed),
            "LIQUIDATED" => Ok(PositionStatus::Liquidated),
            other => Err(format!("unknown position status: {}", other)),
        }
    }
}

/// Why a position (or part of it) was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Manual,
    Strategy,
    StopLoss,
    TakeProfit,
    Liquidated,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Manual => "manual",
            CloseReason::Strategy => "strategy",
            CloseReason::StopLoss => "stop_loss",
            CloseReason::TakeProfit => "take_profit",
            CloseReason::Liquidated => "liquidated",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CloseReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "manual" => Ok(CloseReason::Manual),
            "strategy" => Ok(CloseReason::Strategy),
            "stop_loss" => Ok(CloseReason::StopLoss),
            "take_profit" => Ok(CloseReason::TakeProfit),
            "liquidated" => Ok(CloseReason::Liquidated),
            other => Err(format!("unknown close reason: {}", other)),
        }
    }
}

/// A leveraged position owned by one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: i64,
    pub user_id: String,
    pub symbol: String,
    pub direction: Direction,
    pub leverage: u32,

    /// Cash committed to the position
    pub margin: Decimal,

    /// margin × leverage
    pub notional_value: Decimal,

    pub entry_price: Decimal,

    /// notional_value / entry_price
    pub quantity: Decimal,

    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,

    #[serde(default)]
    pub current_price: Decimal,
    #[serde(default)]
    pub unrealized_pnl: Decimal,

    /// Quantity already exited through partial closes
    #[serde(default)]
    pub closed_quantity: Decimal,

    /// Running realized P&L across partial and final closes
    #[serde(default)]
    pub realized_pnl: Decimal,

    pub status: PositionStatus,
    pub close_reason: Option<CloseReason>,
    pub close_price: Option<Decimal>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,

    /// Optimistic concurrency token, bumped on every ledger write
    #[serde(default)]
    pub version: i64,
}

impl Position {
    pub fn remaining_quantity(&self) -> Decimal {
        (self.quantity - self.closed_quantity).max(Decimal::ZERO)
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    /// Unrealized P&L of the remaining quantity at `price`.
    pub fn pnl_at(&self, price: Decimal) -> Decimal {
        self.remaining_quantity() * (price - self.entry_price) * self.direction.sign()
    }

    /// Portion of the margin still committed to the remaining quantity.
    pub fn margin_in_use(&self) -> Decimal {
        if self.quantity.is_zero() {
            return Decimal::ZERO;
        }
        self.margin * self.remaining_quantity() / self.quantity
    }

    /// Loss at `price` has consumed the committed margin.
    pub fn should_liquidate(&self, price: Decimal) -> bool {
        self.pnl_at(price) <= -self.margin_in_use()
    }

    pub fn should_stop_loss(&self, price: Decimal) -> bool {
        match (self.stop_loss, self.direction) {
            (Some(sl), Direction::Long) => price <= sl,
            (Some(sl), Direction::Short) => price >= sl,
            (None, _) => false,
        }
    }

    pub fn should_take_profit(&self, price: Decimal) -> bool {
        match (self.take_profit, self.direction) {
            (Some(tp), Direction::Long) => price >= tp,
            (Some(tp), Direction::Short) => price <= tp,
            (None, _) => false,
        }
    }

    /// Return on margin at `price`.
    pub fn return_on_margin(&self, price: Decimal) -> Decimal {
        let margin = self.margin_in_use();
        if margin.is_zero() {
            return Decimal::ZERO;
        }
        self.pnl_at(price) / margin
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    pub(crate) fn make_position(direction: Direction, margin: Decimal, leverage: u32, entry: Decimal) -> Position {
        let notional = margin * Decimal::from(leverage);
        Position {
            id: 1,
            user_id: "admin".to_string(),
            symbol: "BTCUSDT".to_string(),
            direction,
            leverage,
            margin,
            notional_value: notional,
            entry_price: entry,
            quantity: notional / entry,
            stop_loss: None,
            take_profit: None,
            current_price: entry,
            unrealized_pnl: Decimal::ZERO,
            closed_quantity: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            status: PositionStatus::Open,
            close_reason: None,
            close_price: None,
            opened_at: Utc::now(),
            closed_at: None,
            version: 0,
        }
    }

    #[test]
    fn test_long_pnl() {
        let pos = make_position(Direction::Long, dec!(1000), 10, dec!(50000));
        assert_eq!(pos.quantity, dec!(0.2));
        assert_eq!(pos.pnl_at(dec!(51000)), dec!(200));
        assert_eq!(pos.pnl_at(dec!(45000)), dec!(-1000));
        assert!(pos.should_liquidate(dec!(45000)));
        assert!(!pos.should_liquidate(dec!(45001)));
    }

    #[test]
    fn test_short_pnl() {
        let pos = make_position(Direction::Short, dec!(500), 5, dec!(100));
        assert_eq!(pos.quantity, dec!(25));
        assert_eq!(pos.pnl_at(dec!(90)), dec!(250));
        assert_eq!(pos.pnl_at(dec!(110)), dec!(-250));
        assert_eq!(pos.return_on_margin(dec!(90)), dec!(0.5));
    }

    #[test]
    fn test_partial_exit_shrinks_margin() {
        let mut pos = make_position(Direction::Long, dec!(1000), 10, dec!(100));
        pos.closed_quantity = pos.quantity / dec!(4);
        assert_eq!(pos.remaining_quantity(), dec!(75));
        assert_eq!(pos.margin_in_use(), dec!(750));
        assert_eq!(pos.pnl_at(dec!(110)), dec!(750));
    }

    #[test]
    fn test_stop_and_target_sides() {
        let mut long = make_position(Direction::Long, dec!(100), 2, dec!(100));
        long.stop_loss = Some(dec!(95));
        long.take_profit = Some(dec!(120));
        assert!(long.should_stop_loss(dec!(95)));
        assert!(!long.should_stop_loss(dec!(96)));
        assert!(long.should_take_profit(dec!(121)));

        let mut short = make_position(Direction::Short, dec!(100), 2, dec!(100));
        short.stop_loss = Some(dec!(105));
        short.take_profit = Some(dec!(80));
        assert!(short.should_stop_loss(dec!(106)));
        assert!(short.should_take_profit(dec!(80)));
        assert!(!short.should_take_profit(dec!(81)));
    }

    #[test]
    fn test_parse_enums() {
        assert_eq!("long".parse::<Direction>().unwrap(), Direction::Long);
        assert_eq!("SELL".parse::<Direction>().unwrap(), Direction::Short);
        assert!("sideways".parse::<Direction>().is_err());
        assert_eq!("liquidated".parse::<PositionStatus>().unwrap(), PositionStatus::Liquidated);
        assert_eq!("stop_loss".parse::<CloseReason>().unwrap(), CloseReason::StopLoss);
    }
}
