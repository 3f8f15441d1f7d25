//! Risk engine: decides which open positions must be force-closed this tick.
//!
//! Checks run in a fixed order and the first match wins:
//! 1. Liquidation (loss has consumed the committed margin)
//! 2. Stop-loss
//! 3. Take-profit
//!
//! The engine never writes. It returns decisions for the caller to settle
//! through the ledger once it is done iterating.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::debug;

use crate::models::{CloseReason, Position};

/// One forced close decided by the risk engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskDecision {
    pub position_id: i64,
    pub symbol: String,
    pub reason: CloseReason,
    /// Price snapshot the decision was made against
    pub price: Decimal,
}

/// Aggregate exposure across the evaluated book.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RiskSnapshot {
    pub evaluated: usize,
    pub skipped_no_price: usize,
    pub unrealized_pnl: Decimal,
    pub margin_in_use: Decimal,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RiskEngine;

impl RiskEngine {
    pub fn new() -> Self {
        Self
    }

    /// Decide forced closes for `positions` against one batch of `prices`.
    ///
    /// Positions without a price this tick are skipped.
    pub fn evaluate(&self, positions: &[Position], prices: &HashMap<String, Decimal>) -> Vec<RiskDecision> {
        positions
            .iter()
            .filter(|p| p.is_open())
            .filter_map(|p| {
                let price = *prices.get(&p.symbol)?;
                self.check(p, price).map(|reason| RiskDecision {
                    position_id: p.id,
                    symbol: p.symbol.clone(),
                    reason,
                    price,
                })
            })
            .collect()
    }

    /// Close reason for one position at `price`, if any.
    pub fn check(&self, position: &Position, price: Decimal) -> Option<CloseReason> {
        if position.should_liquidate(price) {
            debug!(
                position_id = position.id,
                price = %price,
                pnl = %position.pnl_at(price),
                margin = %position.margin_in_use(),
                "Liquidation threshold reached"
            );
            Some(CloseReason::Liquidated)
        } else if position.should_stop_loss(price) {
            Some(CloseReason::StopLoss)
        } else if position.should_take_profit(price) {
            Some(CloseReason::TakeProfit)
        } else {
            None
        }
    }

    pub fn snapshot(&self, positions: &[Position], prices: &HashMap<String, Decimal>) -> RiskSnapshot {
        let mut snap = RiskSnapshot::default();
        for p in positions.iter().filter(|p| p.is_open()) {
            match prices.get(&p.symbol) {
                Some(price) => {
                    snap.evaluated += 1;
                    snap.unrealized_pnl += p.pnl_at(*price);
                    snap.margin_in_use += p.margin_in_use();
                }
                None => snap.skipped_no_price += 1,
            }
        }
        snap
    }
}
