//! Data models for positions, orders, wallets, and price alerts.

mod alert;
mod order;
mod position;
mod wallet;

pub use alert::{AlertCondition, AlertStatus, PriceAlert};
pub use order::{Order, OrderAction};
pub use position::{CloseReason, Direction, Position, PositionStatus};
pub use wallet::{Wallet, WalletSummary};

#[cfg(test)]
pub(crate) use position::tests::make_position;
